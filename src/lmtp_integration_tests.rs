//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Crysmtp.
//
// Crysmtp is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public License as  published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Crysmtp is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty  of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See  the GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Crysmtp. If not, see <http://www.gnu.org/licenses/>.

use crate::config::ServerConfig;
use crate::test_common::*;

fn lmtp_config() -> ServerConfig {
    ServerConfig {
        domain: "mx.test".to_owned(),
        lmtp: true,
        ..ServerConfig::default()
    }
}

#[test]
fn lmtp_greeting_and_dialect() {
    let setup = set_up(lmtp_config());
    let mut cxn = setup.connect("lmtp_dialect");

    let greeting = cxn.read_responses();
    assert!(greeting[0].starts_with("220 mx.test LMTP"));

    // SMTP greetings are the wrong dialect here.
    cxn.simple_command("EHLO a", "500");
    cxn.simple_command("HELO a", "500");

    cxn.write_line("LHLO a\r\n");
    let caps = cxn.expect_final("250");
    assert!(caps[0].starts_with("250-mx.test"));
    assert!(has_capability(&caps, "PIPELINING"));
    assert!(has_capability(&caps, "ENHANCEDSTATUSCODES"));
}

#[test]
fn lmtp_per_recipient_verdicts() {
    let setup = set_up(lmtp_config());
    let mut cxn = setup.connect("lmtp_verdicts");

    cxn.skip_pleasantries("LHLO a");
    cxn.simple_command("MAIL FROM:<s@x>", "250");
    cxn.simple_command("RCPT TO:<fine@y>", "250");
    cxn.simple_command("RCPT TO:<slowbox@y>", "250");
    cxn.simple_command("RCPT TO:<also-fine@y>", "250");
    cxn.simple_command("DATA", "354");
    cxn.write_raw(b"hello\r\n.\r\n");

    // One complete reply per accepted recipient, in acceptance order.
    let finals = cxn.read_final_responses(3);
    assert!(finals[0].starts_with("250 2.0.0"));
    assert!(finals[1].starts_with("450 4.2.2"));
    assert!(finals[2].starts_with("250 2.0.0"));

    cxn.simple_command("QUIT", "221");

    let captured = setup.captured.lock().unwrap();
    assert_eq!(vec![b"hello\r\n".to_vec()], captured.messages);
    assert_eq!(3, captured.rcpts.len());
}

#[test]
fn lmtp_second_transaction_resets_verdict_list() {
    let setup = set_up(lmtp_config());
    let mut cxn = setup.connect("lmtp_second_txn");

    cxn.skip_pleasantries("LHLO a");
    cxn.simple_command("MAIL FROM:<s@x>", "250");
    cxn.simple_command("RCPT TO:<a@y>", "250");
    cxn.simple_command("RCPT TO:<b@y>", "250");
    cxn.simple_command("DATA", "354");
    cxn.write_raw(b"one\r\n.\r\n");
    cxn.read_final_responses(2);

    // The next envelope starts its recipient list from scratch.
    cxn.simple_command("MAIL FROM:<s@x>", "250");
    cxn.simple_command("RCPT TO:<c@y>", "250");
    cxn.simple_command("DATA", "354");
    cxn.write_raw(b"two\r\n.\r\n");
    let finals = cxn.read_final_responses(1);
    assert!(finals[0].starts_with("250"));
}

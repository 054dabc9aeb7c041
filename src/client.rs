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

//! Client-side command encoding.
//!
//! These functions render the option types back into the wire forms the
//! server side parses, which is what a submitting client needs and what the
//! round-trip tests lean on. Line endings are the caller's business; none
//! of the strings returned here include the CRLF.

use std::fmt::Write as _;

use crate::options::{
    DeliverByMode, DeliverByOptions, DsnNotify, DsnReturn, MailOptions,
    RcptOptions, RrvsMode,
};
use crate::syntax::{encode_xtext, format_reverse_path};

pub fn ehlo_line(domain: &str) -> String {
    format!("EHLO {domain}")
}

pub fn lhlo_line(domain: &str) -> String {
    format!("LHLO {domain}")
}

pub fn mail_from_line(path: &str, opts: &MailOptions) -> String {
    let mut line = format!("MAIL FROM:{}", format_reverse_path(path));

    if let Some(body) = opts.body {
        let _ = write!(line, " BODY={}", body.as_str());
    }
    if let Some(size) = opts.size {
        let _ = write!(line, " SIZE={size}");
    }
    if opts.utf8 {
        line.push_str(" SMTPUTF8");
    }
    if opts.require_tls {
        line.push_str(" REQUIRETLS");
    }
    if let Some(ref auth) = opts.auth {
        if auth.is_empty() {
            line.push_str(" AUTH=<>");
        } else {
            let _ = write!(line, " AUTH={}", encode_xtext(auth));
        }
    }
    if let Some(by) = opts.deliver_by {
        let _ = write!(line, " BY={}", format_deliver_by(by));
    }
    if let Some(priority) = opts.mt_priority {
        let _ = write!(line, " MT-PRIORITY={priority}");
    }
    if let Some(ret) = opts.ret {
        let _ = write!(
            line,
            " RET={}",
            match ret {
                DsnReturn::Full => "FULL",
                DsnReturn::Headers => "HDRS",
            },
        );
    }
    if let Some(ref envid) = opts.envelope_id {
        let _ = write!(line, " ENVID={}", encode_xtext(envid));
    }

    line
}

pub fn rcpt_to_line(path: &str, opts: &RcptOptions) -> String {
    let mut line = format!("RCPT TO:{}", format_reverse_path(path));

    if let Some(ref notify) = opts.notify {
        let conditions = notify
            .iter()
            .map(|n| match n {
                DsnNotify::Never => "NEVER",
                DsnNotify::Success => "SUCCESS",
                DsnNotify::Failure => "FAILURE",
                DsnNotify::Delay => "DELAY",
            })
            .collect::<Vec<_>>()
            .join(",");
        let _ = write!(line, " NOTIFY={conditions}");
    }
    if let (Some(atype), Some(addr)) = (
        opts.original_recipient_type.as_ref(),
        opts.original_recipient.as_ref(),
    ) {
        let _ = write!(line, " ORCPT={atype};{}", encode_xtext(addr));
    }
    if let Some((stamp, mode)) = opts.rrvs {
        let _ = write!(line, " RRVS={}", stamp.to_rfc3339());
        if RrvsMode::Continue == mode {
            line.push_str(";C");
        }
    }
    if let Some(by) = opts.deliver_by {
        let _ = write!(line, " BY={}", format_deliver_by(by));
    }
    if let Some(priority) = opts.mt_priority {
        let _ = write!(line, " MT-PRIORITY={priority}");
    }
    for (key, value) in &opts.extensions {
        let _ = write!(line, " {key}={value}");
    }

    line
}

pub fn bdat_line(size: u64, last: bool) -> String {
    if last {
        format!("BDAT {size} LAST")
    } else {
        format!("BDAT {size}")
    }
}

pub fn auth_line(mechanism: &str, initial: Option<&[u8]>) -> String {
    match initial {
        None => format!("AUTH {mechanism}"),
        Some(data) if data.is_empty() => format!("AUTH {mechanism} ="),
        Some(data) => {
            format!("AUTH {mechanism} {}", base64::encode(data))
        },
    }
}

/// The complete DATA payload for a message body: dot-stuffed, CRLF-framed,
/// terminator included.
pub fn data_payload(body: &[u8]) -> Vec<u8> {
    crate::data::stuff(body)
}

fn format_deliver_by(by: DeliverByOptions) -> String {
    format!(
        "{};{}{}",
        by.seconds,
        match by.mode {
            DeliverByMode::Return => "R",
            DeliverByMode::Notify => "N",
        },
        if by.trace { "T" } else { "" },
    )
}

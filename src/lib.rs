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

//! An embeddable SMTP and LMTP server protocol engine.
//!
//! Crysmtp owns the wire: the command reader, the ESMTP state machine,
//! argument parsing, the DATA/BDAT body paths, STARTTLS and AUTH
//! transitions, and capability advertisement. What the mail *means* is
//! delegated to a [`Backend`], which mints one [`Session`] per connection
//! and hears about the envelope as the client builds it.
//!
//! Each connection runs on its own thread with a single-threaded Tokio
//! runtime, so sessions never need `Send` and the command path takes no
//! locks shared between connections.

pub mod backend;
pub mod client;
pub mod codes;
pub mod config;
mod conn;
mod data;
pub mod error;
mod io;
mod log_prefix;
pub mod options;
pub mod server;
pub mod syntax;
pub mod xclient;

pub use backend::{
    Backend, ConnMeta, HeloInfo, SaslServer, SaslStep, Session,
    SmtpResponse, SmtpResult,
};
pub use config::{CidrSet, ServerConfig, TlsConfig};
pub use error::Error;
pub use options::{
    BodyType, DeliverByMode, DeliverByOptions, DsnNotify, DsnReturn,
    MailOptions, RcptOptions, RrvsMode,
};
pub use server::Server;
pub use xclient::XclientAttrs;

#[cfg(test)]
mod test_common;

#[cfg(test)]
mod lmtp_integration_tests;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().is_some_and(|v| "1" == v) {
            return;
        }

        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
                "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
            )))
            .build();
        let log_config = log4rs::config::Config::builder()
            .appender(
                log4rs::config::Appender::builder()
                    .build("stderr", Box::new(stderr)),
            )
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        log4rs::init_config(log_config).unwrap();
    })
}

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

//! The seam between the protocol engine and the application.
//!
//! A `Backend` mints one `Session` per connection; the engine then feeds the
//! session the envelope callbacks as the client progresses through the
//! dialogue. Protocol-level validity (command ordering, argument syntax,
//! extension gating) is entirely the engine's problem; a session only ever
//! sees requests that are well-formed and arrived in a legal state, and its
//! sole responsibility is to accept or refuse them.
//!
//! Sessions are driven on a single-threaded runtime owned by their
//! connection, so their futures do not need to be `Send`.
#![allow(async_fn_in_trait)]

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::DuplexStream;

use crate::codes::*;
use crate::config::ServerConfig;
use crate::options::{MailOptions, RcptOptions};
use crate::xclient::XclientAttrs;

/// An SMTP reply, excluding the continuation/final distinction.
///
/// Sessions return these to refuse requests; the engine sends them verbatim.
/// A session that wants a bare refusal without picking codes can use
/// `SmtpResponse::transaction_failed`.
#[derive(Clone, Debug)]
pub struct SmtpResponse<'a>(
    pub PrimaryCode,
    pub Option<(ClassCode, SubjectCode)>,
    pub Cow<'a, str>,
);

impl SmtpResponse<'static> {
    /// The default refusal: `554 5.0.0`.
    pub fn transaction_failed() -> Self {
        Self(
            pc::TransactionFailed,
            Some((cc::PermFail, sc::Undefined)),
            Cow::Borrowed("Transaction failed"),
        )
    }
}

/// Outcome of a session-level request.
pub type SmtpResult = Result<(), SmtpResponse<'static>>;

/// What the engine knows about a connection before any command has been
/// read. Handed to `Backend::new_session`.
#[derive(Clone, Debug)]
pub struct ConnMeta {
    /// The raw peer address. Absent when the transport has no notion of one
    /// (socketpairs, stdio).
    pub remote_addr: Option<SocketAddr>,
    /// Whether the peer is inside the configured XCLIENT trust list.
    pub xclient_trusted: bool,
    /// Snapshot of the server configuration.
    pub config: Arc<ServerConfig>,
}

/// The HELO/EHLO/LHLO command.
///
/// A session sees this more than once if the client restarts the dialogue,
/// which EHLO itself, STARTTLS and XCLIENT all do.
#[derive(Clone, Debug)]
pub struct HeloInfo {
    /// The verb the client used, verbatim.
    pub command: String,
    /// The domain the client named.
    pub host: String,
    /// A description of the negotiated TLS session, or `None` on cleartext.
    pub tls: Option<String>,
}

/// One step of a SASL exchange.
pub enum SaslStep {
    /// Send the payload as a 334 challenge and wait for the next response.
    Challenge(Vec<u8>),
    /// Authentication succeeded as the contained identity.
    Done(String),
}

/// A server-side SASL mechanism state machine.
///
/// The engine only handles the SMTP framing (base64, 334 continuations, the
/// `*` abort); what the bytes mean is entirely up to the implementation.
pub trait SaslServer {
    /// Advances the exchange. `response` is `None` when the client supplied
    /// no initial response, in which case the mechanism decides whether to
    /// challenge or fail.
    fn step(
        &mut self,
        response: Option<&[u8]>,
    ) -> Result<SaslStep, SmtpResponse<'static>>;
}

/// Mints sessions. Shared by every connection of a server.
pub trait Backend: Send + Sync + 'static {
    type Session: Session;

    /// Creates the session for a new connection. An error is sent to the
    /// client as-is and the connection is closed.
    fn new_session(
        &self,
        meta: &ConnMeta,
    ) -> Result<Self::Session, SmtpResponse<'static>>;
}

/// One client's dialogue, from greeting to disconnect.
pub trait Session {
    /// The client (re-)introduced itself. Refusing leaves the previous
    /// greeting state in place.
    async fn helo(&mut self, helo: &HeloInfo) -> SmtpResult {
        let _ = helo;
        Ok(())
    }

    /// `MAIL FROM`. `from` is empty for the null reverse path.
    async fn mail(&mut self, from: &str, opts: &MailOptions) -> SmtpResult;

    /// `RCPT TO`. Called once per recipient; only accepted recipients join
    /// the envelope.
    async fn rcpt(&mut self, to: &str, opts: &RcptOptions) -> SmtpResult;

    /// The message body. `body` yields the decoded content (dot-stuffing
    /// removed, chunks joined) and reaches EOF at the end of the message;
    /// the session may stop reading early to refuse it. Returning `Ok`
    /// accepts the message.
    async fn data(&mut self, body: DuplexStream) -> SmtpResult;

    /// LMTP variant of `data`: one verdict per accepted recipient, in
    /// acceptance order. The default treats the whole message uniformly by
    /// delegating to `data`.
    async fn data_lmtp(
        &mut self,
        body: DuplexStream,
        rcpts: &[String],
    ) -> Vec<SmtpResult> {
        let result = self.data(body).await;
        rcpts.iter().map(|_| result.clone()).collect()
    }

    /// The envelope was abandoned (RSET, or a fresh EHLO/XCLIENT).
    fn reset(&mut self);

    /// The client is leaving (QUIT or connection teardown).
    async fn logout(&mut self) -> SmtpResult {
        Ok(())
    }

    /// The AUTH mechanisms to advertise, or empty to not offer AUTH.
    fn auth_mechanisms(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Starts an AUTH exchange for `mechanism`, or `None` if the mechanism
    /// is not supported.
    fn auth(&mut self, mechanism: &str) -> Option<Box<dyn SaslServer>> {
        let _ = mechanism;
        None
    }

    /// A trusted proxy supplied XCLIENT attributes. Refusing leaves the
    /// session untouched.
    async fn xclient(&mut self, attrs: &XclientAttrs) -> SmtpResult {
        let _ = attrs;
        Ok(())
    }
}

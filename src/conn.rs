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

//! The per-connection protocol engine: one `Conn` owns one socket and walks
//! it through the RFC 5321 dialogue, translating the command stream into
//! calls on the backend `Session` and backend verdicts into replies.
//!
//! Command validity lives here, in one place. A handler is only entered
//! once the state checks at its top have passed, so the backend never has
//! to re-derive protocol state.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream, DuplexStream,
};
use tokio::sync::mpsc;

use crate::backend::{
    Backend, ConnMeta, HeloInfo, SaslStep, Session, SmtpResponse,
};
use crate::codes::*;
use crate::config::ServerConfig;
use crate::data::{copy_unstuffed, BodyLimits, BodyOutcome, DiscardOnError};
use crate::error::Error;
use crate::io::SmtpIo;
use crate::log_prefix::LogPrefix;
use crate::options::{BodyType, MailOptions, RcptOptions};
use crate::server::Shutdown;
use crate::syntax;
use crate::xclient::{XclientAttrs, SUPPORTED_ATTRS};

/// Connections that issue this many commands without making progress on a
/// mail transaction are presumed hostile and cut loose.
const MAX_INEFFECTIVE: u32 = 30;

/// How long a DATA body transfer may take before the idle timer fires.
const DATA_DEADLINE: Duration = Duration::from_secs(1800);

/// Stand-in deadline when the read timeout is disabled.
const FOREVER: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

macro_rules! require {
    ($this:expr, $($fns:ident = $arg:expr),* $(,)?) => {
        $(if let Some(r) = $this.$fns($arg).await { return r; })*
    };
}

/// The client's introduction, as currently in force.
struct Helo {
    name: String,
    /// Whether the client used EHLO/LHLO. Gates every parameterized
    /// extension.
    extended: bool,
}

/// One mail transaction in progress: MAIL accepted, DATA not yet complete.
struct Envelope {
    from: String,
    opts: MailOptions,
    rcpts: Vec<(String, RcptOptions)>,
}

/// Everything about a connection that EHLO, STARTTLS or XCLIENT can sweep
/// away. The socket and the backend session live outside it.
#[derive(Default)]
struct SessionState {
    helo: Option<Helo>,
    authenticated: Option<String>,
    envelope: Option<Envelope>,
    /// Extension names sent in the last EHLO/LHLO response.
    extensions_seen: BTreeSet<String>,
}

struct Conn<S: Session> {
    io: BufStream<SmtpIo>,
    /// Unbuffered handle to the same stream, kept so STARTTLS can rebuild
    /// `io` and drop whatever cleartext the old buffer still held.
    raw_io: SmtpIo,
    log_prefix: LogPrefix,
    config: Arc<ServerConfig>,
    acceptor: Option<SslAcceptor>,
    session: S,
    xclient_trusted: bool,
    shutdown: Arc<Shutdown>,
    deadline_tx: mpsc::Sender<Instant>,

    quit: bool,
    /// Set once ENHANCEDSTATUSCODES has been advertised on this connection.
    /// Sticky across session resets: the client that saw the advertisement
    /// is still the one reading.
    enhanced_ok: bool,
    ineffective_commands: u32,
    state: SessionState,
}

/// Runs one connection to completion.
///
/// `remote_addr` is the raw peer address as seen at accept time; XCLIENT
/// trust is derived from it here, once, and never revisited.
pub(crate) async fn run_connection<B: Backend>(
    backend: &B,
    io: SmtpIo,
    remote_addr: Option<SocketAddr>,
    config: Arc<ServerConfig>,
    acceptor: Option<SslAcceptor>,
    log_prefix: LogPrefix,
    shutdown: Arc<Shutdown>,
) -> Result<(), Error> {
    let xclient_trusted = remote_addr
        .map(|a| config.xclient_trusted_nets.contains(a.ip()))
        .unwrap_or(false);

    let meta = ConnMeta {
        remote_addr,
        xclient_trusted,
        config: Arc::clone(&config),
    };

    // The banner goes out before the backend is consulted, so even a
    // refused client learns who refused it.
    let mut buf_io = BufStream::new(io.clone());
    write_response(
        &mut buf_io,
        config.write_timeout,
        false,
        Final,
        pc::ServiceReady,
        None,
        &greeting_text(&config, io.is_ssl()),
    )
    .await?;

    let session = match backend.new_session(&meta) {
        Ok(session) => session,
        Err(response) => {
            warn!("{log_prefix} Backend refused connection");
            let _ = write_response(
                &mut buf_io,
                config.write_timeout,
                false,
                Final,
                response.0,
                response.1,
                &response.2,
            )
            .await;
            return Ok(());
        },
    };

    let (deadline_tx, deadline_rx) = mpsc::channel(1);
    let mut conn = Conn {
        io: buf_io,
        raw_io: io,
        log_prefix,
        config,
        acceptor,
        session,
        xclient_trusted,
        shutdown,
        deadline_tx,

        quit: false,
        enhanced_ok: false,
        ineffective_commands: 0,
        state: SessionState::default(),
    };

    let result = tokio::select! {
        r = conn.run() => r,
        _ = idle_timer(deadline_rx) => Err(Error::IdleTimeout),
    };

    match result {
        Ok(()) => {
            let _ = conn.session.logout().await;
            Ok(())
        },
        Err(Error::IdleTimeout) => {
            info!("{} Closing idle connection", conn.log_prefix);
            conn.farewell(sc::BadConnection, "Idle timeout").await;
            let _ = conn.session.logout().await;
            Err(Error::IdleTimeout)
        },
        Err(Error::ShuttingDown) => {
            let _ = conn.session.logout().await;
            Err(Error::ShuttingDown)
        },
        Err(e) => {
            let _ = conn.session.logout().await;
            Err(e)
        },
    }
}

impl<S: Session> Conn<S> {
    async fn run(&mut self) -> Result<(), Error> {
        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    /// Best-effort 421 before an abnormal close.
    async fn farewell(&mut self, subject: SubjectCode, quip: &str) {
        let write = write_response(
            &mut self.io,
            Duration::from_secs(5),
            self.enhanced_ok,
            Final,
            pc::ServiceNotAvailableClosing,
            Some((cc::TempFail, subject)),
            quip,
        );
        let _ = tokio::time::timeout(Duration::from_secs(5), write).await;
    }

    async fn run_command(
        &mut self,
        buffer: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let read_timeout = if self.config.read_timeout.is_zero() {
            FOREVER
        } else {
            self.config.read_timeout
        };
        let _ = self
            .deadline_tx
            .send(Instant::now() + read_timeout)
            .await;

        buffer.clear();
        let max_line = self.config.max_line_length;
        // Shutdown is only honored here, between commands; a command that
        // has started gets to finish (or hit the forced close).
        let mut limited_io = (&mut self.io).take(max_line as u64);
        tokio::select! {
            r = limited_io.read_until(b'\n', &mut *buffer) => { r?; },
            _ = self.shutdown.wait() => {
                self.farewell(sc::NoAnswerFromHost, "Closing connection")
                    .await;
                self.quit = true;
                return Err(Error::ShuttingDown);
            },
        }

        if buffer.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= max_line {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::OtherProtocolStatus)),
                    Cow::Borrowed("Command line too long"),
                )
                .await?;

                // Skip the rest of the line; the connection itself is fine.
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(max_line as u64)
                        .read_until(b'\n', &mut *buffer)
                        .await?;
                }

                return Ok(());
            } else {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        self.ineffective_commands += 1;
        if self.ineffective_commands > MAX_INEFFECTIVE {
            warn!(
                "{} Terminating connection after too many non-mail commands",
                self.log_prefix,
            );
            self.send_response(
                Final,
                pc::ServiceNotAvailableClosing,
                None,
                Cow::Borrowed("Too many commands issued without sending mail"),
            )
            .await?;
            return Ok(());
        }

        let crlf = buffer.ends_with(b"\r\n");
        if !crlf && self.config.strict_line_endings {
            return self
                .send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Bare LF is not a line ending here"),
                )
                .await;
        }

        let line_ending_len = if crlf { 2 } else { 1 };
        let mut command_line =
            buffer[..buffer.len() - line_ending_len].to_vec();
        if command_line.contains(&0) {
            warn!(
                "{} Remote is speaking binary, closing connection",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(());
        }

        if command_line.contains(&b'\r') {
            if self.config.strict_line_endings {
                return self
                    .send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::SyntaxError)),
                        Cow::Borrowed("Stray CR in command"),
                    )
                    .await;
            }
            command_line.retain(|&ch| b'\r' != ch);
        }

        let command_line = match String::from_utf8(command_line) {
            Ok(s) => s,
            Err(_) => {
                warn!("{} Non-UTF-8 command received", self.log_prefix);
                return self
                    .send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::OtherProtocolStatus)),
                        Cow::Borrowed("Malformed UTF-8"),
                    )
                    .await;
            },
        };

        if syntax::looks_like_http(&command_line) {
            warn!(
                "{} Remote is speaking HTTP, closing connection",
                self.log_prefix,
            );
            self.send_response(
                Final,
                pc::TransactionFailed,
                Some((cc::PermFail, sc::WrongProtocolVersion)),
                Cow::Borrowed("This is an SMTP server"),
            )
            .await?;
            self.quit = true;
            return Ok(());
        }

        let (verb, arg) = match syntax::parse_command(&command_line) {
            Ok(split) => split,
            Err(e) => {
                let mut debug_line = command_line.as_str();
                if let Some((truncate_len, _)) =
                    debug_line.char_indices().nth(64)
                {
                    debug_line = &debug_line[..truncate_len];
                }
                warn!(
                    "{} Received bad command {debug_line:?}",
                    self.log_prefix,
                );

                return self
                    .send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommand)),
                        Cow::Owned(e.to_string()),
                    )
                    .await;
            },
        };

        if verb.is_empty() {
            return self
                .send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Empty command"),
                )
                .await;
        }

        // A panicking handler must not take the process down with it; the
        // client gets a generic 421 and the connection ends.
        let dispatch =
            std::panic::AssertUnwindSafe(self.dispatch(&verb, arg))
                .catch_unwind()
                .await;
        match dispatch {
            Ok(r) => r,
            Err(_) => {
                error!(
                    "{} Panic while handling {verb}, closing connection",
                    self.log_prefix,
                );
                self.farewell(sc::OtherMailSystem, "Internal server error")
                    .await;
                self.quit = true;
                Ok(())
            },
        }
    }

    async fn dispatch(&mut self, verb: &str, arg: &str) -> Result<(), Error> {
        match verb {
            "HELO" | "EHLO" | "LHLO" => self.cmd_helo(verb, arg).await,
            "MAIL" => self.cmd_mail(arg).await,
            "RCPT" => self.cmd_rcpt(arg).await,
            "DATA" => self.cmd_data(arg).await,
            "BDAT" => self.cmd_bdat(arg).await,
            "AUTH" => self.cmd_auth(arg).await,
            "STARTTLS" => self.cmd_starttls(arg).await,
            "XCLIENT" => self.cmd_xclient(arg).await,
            "RSET" => self.cmd_rset().await,
            "NOOP" => self.cmd_noop().await,
            "VRFY" => self.cmd_verify().await,
            "EXPN" => self.cmd_expand().await,
            "HELP" => self.cmd_help().await,
            "QUIT" => self.cmd_quit().await,
            _ => {
                self.send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Owned(format!(
                        "Command unrecognized/unimplemented: {verb}"
                    )),
                )
                .await
            },
        }
    }

    async fn cmd_helo(&mut self, verb: &str, arg: &str) -> Result<(), Error> {
        if self.config.lmtp != ("LHLO" == verb) {
            return self
                .send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::WrongProtocolVersion)),
                    Cow::Borrowed(if self.config.lmtp {
                        "This is LMTP, greet with LHLO"
                    } else {
                        "This is SMTP, not LMTP"
                    }),
                )
                .await;
        }

        let host = match syntax::parse_hello_argument(arg) {
            Ok(host) => host.to_owned(),
            Err(e) if self.config.strict_helo => {
                return self
                    .send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommandArguments)),
                        Cow::Owned(e.to_string()),
                    )
                    .await;
            },
            // Plenty of real clients send a bare EHLO. Let them.
            Err(_) => String::new(),
        };

        let extended = !"HELO".eq_ignore_ascii_case(verb);
        info!("{} Greeted with {verb} from {host:?}", self.log_prefix);

        let helo = HeloInfo {
            command: verb.to_owned(),
            host: host.clone(),
            tls: self.raw_io.ssl_string(),
        };
        if let Err(response) = self.session.helo(&helo).await {
            return self.send_reply(Final, &response).await;
        }

        if self.state.envelope.take().is_some() {
            self.session.reset();
        }
        self.log_prefix.set_helo(host.clone());
        self.state.helo = Some(Helo {
            name: host.clone(),
            extended,
        });

        self.send_response(
            Delayable.or_final(!extended),
            pc::Ok,
            None,
            Cow::Owned(format!(
                "{} salutations, {}",
                self.config.domain, host
            )),
        )
        .await?;

        if extended {
            let caps = self.capabilities();
            self.state.extensions_seen = caps
                .iter()
                .map(|c| {
                    c.split(' ').next().unwrap_or(c).to_owned()
                })
                .collect();
            self.enhanced_ok = true;

            let last = caps.len().saturating_sub(1);
            for (ix, cap) in caps.into_iter().enumerate() {
                self.send_response(
                    Delayable.or_final(ix == last),
                    pc::Ok,
                    None,
                    Cow::Owned(cap),
                )
                .await?;
            }
        }

        Ok(())
    }

    /// The extension list for EHLO/LHLO, in a fixed order so that repeated
    /// greetings are byte-identical.
    fn capabilities(&self) -> Vec<String> {
        let mut caps = vec![
            "PIPELINING".to_owned(),
            "8BITMIME".to_owned(),
            "ENHANCEDSTATUSCODES".to_owned(),
        ];

        if self.config.chunking_enabled() {
            caps.push("CHUNKING".to_owned());
        }
        if self.config.enable_binarymime {
            caps.push("BINARYMIME".to_owned());
        }
        if self.config.max_message_bytes > 0 {
            caps.push(format!("SIZE {}", self.config.max_message_bytes));
        }
        if self.config.enable_smtputf8 {
            caps.push("SMTPUTF8".to_owned());
        }
        if self.config.enable_requiretls && self.raw_io.is_ssl() {
            caps.push("REQUIRETLS".to_owned());
        }
        if self.acceptor.is_some() && !self.raw_io.is_ssl() {
            caps.push("STARTTLS".to_owned());
        }
        if !self.config.auth_disabled
            && (self.raw_io.is_ssl() || self.config.allow_insecure_auth)
        {
            let mechanisms = self.session.auth_mechanisms();
            if !mechanisms.is_empty() {
                caps.push(format!("AUTH {}", mechanisms.join(" ")));
            }
        }
        if self.config.enable_dsn {
            caps.push("DSN".to_owned());
        }
        if self.config.enable_deliverby {
            caps.push("DELIVERBY".to_owned());
        }
        if self.config.enable_mtpriority {
            caps.push("MT-PRIORITY".to_owned());
        }
        if self.config.enable_rrvs {
            caps.push("RRVS".to_owned());
        }
        if self.config.enable_xclient && self.xclient_trusted {
            caps.push(format!("XCLIENT {}", SUPPORTED_ATTRS.join(" ")));
        }

        caps
    }

    async fn cmd_mail(&mut self, arg: &str) -> Result<(), Error> {
        require!(self, need_helo = true, need_envelope = false);

        let Some(arg) = cut_prefix_fold(arg, "FROM:") else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("Expected MAIL FROM:<address>"),
                )
                .await;
        };

        let mut parser = syntax::Parser::new(arg.trim_start());
        let from = match parser.parse_reverse_path() {
            Ok(from) => from,
            Err(e) => {
                return self
                    .send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Some((
                            cc::PermFail,
                            sc::BadSenderMailboxAddressSyntax,
                        )),
                        Cow::Owned(e.to_string()),
                    )
                    .await;
            },
        };

        let params = syntax::parse_params(parser.remaining());
        if !params.is_empty() && !self.extended() {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("MAIL parameters require EHLO"),
                )
                .await;
        }

        let opts = match MailOptions::from_params(&params, &self.config) {
            Ok(opts) => opts,
            Err(response) => return self.send_reply(Final, &response).await,
        };

        if let Err(response) = self.session.mail(&from, &opts).await {
            warn!(
                "{} Rejected MAIL FROM:{from:?}",
                self.log_prefix,
            );
            return self.send_reply(Final, &response).await;
        }

        info!("{} Start mail transaction from {from:?}", self.log_prefix);
        self.ineffective_commands = 0;
        self.state.envelope = Some(Envelope {
            from,
            opts,
            rcpts: Vec::new(),
        });
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("Roger"),
        )
        .await
    }

    async fn cmd_rcpt(&mut self, arg: &str) -> Result<(), Error> {
        require!(self, need_helo = true, need_envelope = true);

        let Some(arg) = cut_prefix_fold(arg, "TO:") else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("Expected RCPT TO:<address>"),
                )
                .await;
        };

        let max_recipients = self.config.max_recipients;
        let envelope = self.state.envelope.as_ref().expect("checked above");
        if max_recipients > 0 && envelope.rcpts.len() >= max_recipients {
            return self
                .send_response(
                    Final,
                    pc::InsufficientStorage,
                    Some((cc::TempFail, sc::TooManyRecipients)),
                    Cow::Owned(format!(
                        "Too many recipients; at most {max_recipients} \
                         per message",
                    )),
                )
                .await;
        }

        let mut parser = syntax::Parser::new(arg.trim_start());
        let to = match parser.parse_path() {
            Ok(to) => to,
            Err(e) => {
                return self
                    .send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Some((
                            cc::PermFail,
                            sc::BadDestinationMailboxAddressSyntax,
                        )),
                        Cow::Owned(e.to_string()),
                    )
                    .await;
            },
        };

        let params = syntax::parse_params(parser.remaining());
        if !params.is_empty() && !self.extended() {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("RCPT parameters require EHLO"),
                )
                .await;
        }

        let opts = match RcptOptions::from_params(&params, &self.config) {
            Ok(opts) => opts,
            Err(response) => return self.send_reply(Final, &response).await,
        };

        if let Err(response) = self.session.rcpt(&to, &opts).await {
            return self.send_reply(Final, &response).await;
        }

        self.ineffective_commands = 0;
        self.state
            .envelope
            .as_mut()
            .expect("checked above")
            .rcpts
            .push((to, opts));
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::DestinationAddressValid)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_data(&mut self, arg: &str) -> Result<(), Error> {
        require!(
            self,
            need_helo = true,
            need_envelope = true,
            need_recipients = true,
        );

        if !arg.is_empty() {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("DATA takes no argument"),
                )
                .await;
        }

        let body = self
            .state
            .envelope
            .as_ref()
            .and_then(|e| e.opts.body)
            .unwrap_or(BodyType::SevenBit);
        if BodyType::BinaryMime == body {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Binary messages must use BDAT"),
                )
                .await;
        }

        self.ineffective_commands = 0;
        self.send_response(
            Final,
            pc::StartMailInput,
            None,
            Cow::Borrowed("Go ahead; end with <CRLF>.<CRLF>"),
        )
        .await?;

        info!("{} Begin legacy-format data transfer", self.log_prefix);
        let _ = self
            .deadline_tx
            .send(Instant::now() + DATA_DEADLINE)
            .await;

        let limits = BodyLimits {
            max_octets: self.config.max_message_bytes,
            max_line: self.config.max_line_length,
        };

        let (for_session, from_wire) = tokio::io::duplex(4096);
        let rcpt_names = self.rcpt_names();
        let lmtp = self.config.lmtp;
        let Conn {
            ref mut io,
            ref mut session,
            ..
        } = *self;

        let pump = async {
            let mut dst = DiscardOnError(from_wire);
            let outcome = copy_unstuffed(&mut dst, io, limits).await;
            drop(dst);
            outcome
        };
        let verdicts = async {
            if lmtp {
                session.data_lmtp(for_session, &rcpt_names).await
            } else {
                vec![session.data(for_session).await]
            }
        };
        let (outcome, verdicts) = tokio::join!(pump, verdicts);
        let outcome = outcome?;

        self.finish_transaction(outcome, verdicts).await
    }

    async fn cmd_bdat(&mut self, arg: &str) -> Result<(), Error> {
        if !self.state.extensions_seen.contains("CHUNKING") {
            return self
                .send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("CHUNKING is not offered here"),
                )
                .await;
        }

        require!(
            self,
            need_helo = true,
            need_envelope = true,
            need_recipients = true,
        );

        let Some(first) = parse_bdat_arg(arg) else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("Expected BDAT size [LAST]"),
                )
                .await;
        };

        self.ineffective_commands = 0;
        info!("{} Begin chunked data transfer", self.log_prefix);

        let max_octets = self.config.max_message_bytes;
        let write_timeout = self.config.write_timeout;
        let enhanced = self.enhanced_ok;
        let rcpt_names = self.rcpt_names();
        let lmtp = self.config.lmtp;

        let (for_session, from_wire) = tokio::io::duplex(4096);
        let Conn {
            ref mut io,
            ref mut session,
            ref deadline_tx,
            ..
        } = *self;

        let pump = pump_chunks(
            io,
            from_wire,
            first,
            max_octets,
            write_timeout,
            enhanced,
            deadline_tx,
        );
        let verdicts = async {
            if lmtp {
                session.data_lmtp(for_session, &rcpt_names).await
            } else {
                vec![session.data(for_session).await]
            }
        };
        let (pumped, verdicts) = tokio::join!(pump, verdicts);
        let (outcome, end) = pumped?;

        match end {
            ChunkEnd::Last => {
                self.finish_transaction(outcome, verdicts).await
            },
            ChunkEnd::Rset => {
                self.abort_transaction();
                self.send_response(
                    Final,
                    pc::Ok,
                    Some((cc::Success, sc::Undefined)),
                    Cow::Borrowed("OK"),
                )
                .await
            },
            ChunkEnd::BadChunk => {
                self.abort_transaction();
                self.send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("Malformed BDAT; message abandoned"),
                )
                .await
            },
            ChunkEnd::Other => {
                self.abort_transaction();
                self.send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed(
                        "Only BDAT or RSET may follow BDAT; \
                         message abandoned",
                    ),
                )
                .await
            },
        }
    }

    fn rcpt_names(&self) -> Vec<String> {
        self.state
            .envelope
            .as_ref()
            .map(|e| e.rcpts.iter().map(|(to, _)| to.clone()).collect())
            .unwrap_or_default()
    }

    fn abort_transaction(&mut self) {
        if self.state.envelope.take().is_some() {
            self.session.reset();
        }
    }

    /// Sends the end-of-message verdicts and closes out the envelope.
    ///
    /// For SMTP `verdicts` has one element; for LMTP, one per recipient.
    /// Either way the transfer outcome overrides the backend when the
    /// message broke a ceiling on the way in.
    async fn finish_transaction(
        &mut self,
        outcome: BodyOutcome,
        verdicts: Vec<Result<(), SmtpResponse<'static>>>,
    ) -> Result<(), Error> {
        let override_response = if outcome.oversized {
            Some(SmtpResponse(
                pc::ExceededStorageAllocation,
                Some((cc::PermFail, sc::MessageTooBigForSystem)),
                Cow::Borrowed("Maximum message size exceeded"),
            ))
        } else if outcome.long_line {
            Some(SmtpResponse(
                pc::ExceededStorageAllocation,
                Some((cc::PermFail, sc::MessageTooBigForSystem)),
                Cow::Borrowed("Line too long in message data"),
            ))
        } else {
            None
        };

        let count = verdicts.len().max(1);
        let mut success = false;
        for i in 0..count {
            let response = match override_response {
                Some(ref r) => r.clone(),
                None => match verdicts.get(i) {
                    Some(Ok(())) => SmtpResponse(
                        pc::Ok,
                        Some((cc::Success, sc::Undefined)),
                        Cow::Borrowed("OK"),
                    ),
                    Some(Err(r)) => r.clone(),
                    None => SmtpResponse::transaction_failed(),
                },
            };
            success |= pc::Ok == response.0;
            // Each verdict is a complete reply of its own; LMTP clients
            // read one per recipient.
            self.send_reply(Final, &response).await?;
        }

        info!(
            "{} Completed data transfer ({} octets) {}",
            self.log_prefix,
            outcome.octets,
            if success {
                "successfully"
            } else {
                "unsuccessfully"
            },
        );

        self.abort_transaction();
        Ok(())
    }

    async fn cmd_auth(&mut self, arg: &str) -> Result<(), Error> {
        require!(self, need_helo = true, need_envelope = false);

        if self.state.authenticated.is_some() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Already authenticated"),
                )
                .await;
        }

        if self.config.auth_disabled
            || self.session.auth_mechanisms().is_empty()
        {
            return self
                .send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::SecurityFeaturesNotSupported)),
                    Cow::Borrowed("Authentication is not supported here"),
                )
                .await;
        }

        if !self.raw_io.is_ssl() && !self.config.allow_insecure_auth {
            warn!(
                "{} Rejected attempt to AUTH without TLS",
                self.log_prefix,
            );
            return self.send_response(
                Final,
                pc::EncryptionRequiredForRequestedAuthenticationMechanism,
                Some((
                    cc::PermFail,
                    sc::EncryptionRequiredForRequestedAuthenticationMechanism,
                )),
                Cow::Borrowed("Encryption required for authentication"),
            )
            .await;
        }

        let mut words = arg.split_ascii_whitespace();
        let (Some(mechanism), initial, None) =
            (words.next(), words.next(), words.next())
        else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("Expected AUTH mechanism [response]"),
                )
                .await;
        };
        let mechanism = mechanism.to_ascii_uppercase();

        let Some(mut sasl) = self.session.auth(&mechanism) else {
            warn!(
                "{} Rejected attempt to auth with mechanism {mechanism:?}",
                self.log_prefix,
            );
            return self
                .send_response(
                    Final,
                    pc::CommandParameterNotImplemented,
                    // The obvious choice is a security subject code, but
                    // RFC 4954 requires InvalidCommandArguments instead.
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("Unsupported AUTH mechanism"),
                )
                .await;
        };

        // "=" is the way to convey a present-but-empty initial response.
        let mut response = match initial {
            None => None,
            Some("=") => Some(Vec::new()),
            Some(data) => match base64::decode(data) {
                Ok(data) => Some(data),
                Err(_) => {
                    return self
                        .send_response(
                            Final,
                            pc::ParameterSyntaxError,
                            Some((cc::PermFail, sc::SyntaxError)),
                            Cow::Borrowed("Invalid base64"),
                        )
                        .await;
                },
            },
        };

        loop {
            match sasl.step(response.as_deref()) {
                Err(rejection) => {
                    warn!("{} Authentication failed", self.log_prefix);
                    return self.send_reply(Final, &rejection).await;
                },

                Ok(SaslStep::Done(identity)) => {
                    info!(
                        "{} Authenticated as {identity:?}",
                        self.log_prefix,
                    );
                    self.log_prefix.set_user(identity.clone());
                    self.state.authenticated = Some(identity);
                    return self
                        .send_response(
                            Final,
                            pc::AuthenticationSucceeded,
                            Some((cc::Success, sc::OtherSecurity)),
                            Cow::Borrowed("Authentication successful"),
                        )
                        .await;
                },

                Ok(SaslStep::Challenge(challenge)) => {
                    self.send_response(
                        Final,
                        pc::ServerChallenge,
                        None,
                        Cow::Owned(base64::encode(challenge)),
                    )
                    .await?;

                    let line = self.read_auth_line().await?;
                    if "*" == line {
                        return self
                            .send_response(
                                Final,
                                pc::ParameterSyntaxError,
                                None,
                                Cow::Borrowed("SASL aborted"),
                            )
                            .await;
                    }

                    response = match base64::decode(&line) {
                        Ok(data) => Some(data),
                        Err(_) => {
                            return self
                                .send_response(
                                    Final,
                                    pc::ParameterSyntaxError,
                                    Some((cc::PermFail, sc::SyntaxError)),
                                    Cow::Borrowed("Invalid base64"),
                                )
                                .await;
                        },
                    };
                },
            }
        }
    }

    /// Reads one line of an AUTH exchange.
    async fn read_auth_line(&mut self) -> Result<String, Error> {
        let mut buffer = Vec::new();
        (&mut self.io)
            .take(self.config.max_line_length as u64)
            .read_until(b'\n', &mut buffer)
            .await?;

        if buffer.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF during AUTH exchange",
            )));
        }

        if !buffer.ends_with(b"\n") {
            self.send_response(
                Final,
                pc::CommandSyntaxError,
                Some((
                    cc::PermFail,
                    sc::AuthenticationExchangeLineTooLong,
                )),
                Cow::Borrowed("Line too long"),
            )
            .await?;
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Authentication line too long",
            )));
        }

        let _ = buffer.pop();
        if Some(&b'\r') == buffer.last() {
            let _ = buffer.pop();
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    async fn cmd_starttls(&mut self, arg: &str) -> Result<(), Error> {
        require!(self, need_helo = true, need_envelope = false);

        if !arg.is_empty() {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("STARTTLS takes no argument"),
                )
                .await;
        }

        if self.raw_io.is_ssl() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("Already using TLS"),
                )
                .await;
        }

        let Some(acceptor) = self.acceptor.take() else {
            return self
                .send_response(
                    Final,
                    pc::TlsNotAvailable,
                    Some((cc::TempFail, sc::OtherSecurity)),
                    Cow::Borrowed("TLS not configured"),
                )
                .await;
        };

        self.send_response(
            Final,
            pc::ServiceReady,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("Ready to start TLS"),
        )
        .await?;

        info!("{} Start TLS handshake", self.log_prefix);
        self.raw_io.ssl_accept(&acceptor).await?;
        info!("{} TLS handshake completed", self.log_prefix);

        // Rebuild the buffered stream from scratch. Anything a pipelining
        // attacker managed to smuggle in behind the STARTTLS command dies
        // with the old read buffer.
        self.io = BufStream::new(self.raw_io.clone());
        self.abort_transaction();
        self.state = SessionState::default();
        self.log_prefix.clear_session();

        Ok(())
    }

    async fn cmd_xclient(&mut self, arg: &str) -> Result<(), Error> {
        if !self.config.enable_xclient {
            return self
                .send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("XCLIENT command not implemented"),
                )
                .await;
        }

        if !self.xclient_trusted {
            warn!(
                "{} Rejected XCLIENT from untrusted peer",
                self.log_prefix,
            );
            return self
                .send_response(
                    Final,
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                    Cow::Borrowed("XCLIENT denied"),
                )
                .await;
        }

        let attrs = match XclientAttrs::parse(arg) {
            Ok(attrs) => attrs,
            Err(e) => {
                return self
                    .send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommandArguments)),
                        Cow::Owned(e.to_string()),
                    )
                    .await;
            },
        };

        if let Err(response) = self.session.xclient(&attrs).await {
            return self.send_reply(Final, &response).await;
        }

        info!(
            "{} XCLIENT accepted: {:?}",
            self.log_prefix,
            attrs.as_map(),
        );
        if let Some(addr) = attrs.addr() {
            let peer = match attrs.port() {
                Some(port) => format!("{addr}:{port}"),
                None => addr.to_string(),
            };
            self.log_prefix.set_peer(peer);
        }

        // The proxy now speaks for a different client; everything begins
        // anew, starting from the banner, and the client must greet again.
        self.abort_transaction();
        self.state = SessionState::default();
        self.log_prefix.clear_session();
        if let Some(helo) = attrs.helo() {
            self.log_prefix.set_helo(helo.to_owned());
        }
        if let Some(login) = attrs.login() {
            self.log_prefix.set_user(login.to_owned());
            self.state.authenticated = Some(login.to_owned());
        }
        self.send_greeting().await
    }

    async fn cmd_rset(&mut self) -> Result<(), Error> {
        self.abort_transaction();
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_noop(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_verify(&mut self) -> Result<(), Error> {
        info!("{} Declined to VRFY", self.log_prefix);
        self.send_response(
            Final,
            pc::CannotVerify,
            Some((cc::Success, sc::OtherSecurity)),
            Cow::Borrowed("VRFY not supported"),
        )
        .await
    }

    async fn cmd_expand(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::ActionNotTakenPermanent,
            Some((cc::PermFail, sc::SystemNotCapableOfSelectedFeatures)),
            Cow::Borrowed("There are no mailing lists here"),
        )
        .await
    }

    async fn cmd_help(&mut self) -> Result<(), Error> {
        self.send_response(
            Delayable,
            pc::HelpMessage,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("This is an SMTP server; RFC 5321 applies"),
        )
        .await?;
        self.send_response(
            Final,
            pc::HelpMessage,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("End of HELP"),
        )
        .await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        let _ = self
            .send_response(
                Final,
                pc::ServiceClosing,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("Bye"),
            )
            .await;
        Ok(())
    }

    fn extended(&self) -> bool {
        self.state.helo.as_ref().map(|h| h.extended).unwrap_or(false)
    }

    async fn need_helo(&mut self, present: bool) -> Option<Result<(), Error>> {
        self.check_need(
            self.state.helo.is_some(),
            present,
            "Already got HELO",
            "Still waiting for HELO",
        )
        .await
    }

    async fn need_envelope(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.state.envelope.is_some(),
            present,
            "Already got MAIL FROM",
            "Still waiting for MAIL FROM",
        )
        .await
    }

    async fn need_recipients(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.state
                .envelope
                .as_ref()
                .map(|e| !e.rcpts.is_empty())
                .unwrap_or(false),
            present,
            "Already have recipients",
            "No recipients",
        )
        .await
    }

    async fn check_need(
        &mut self,
        current_status: bool,
        desired_status: bool,
        message_if_already_present: &str,
        message_if_missing: &str,
    ) -> Option<Result<(), Error>> {
        if current_status != desired_status {
            Some(
                self.send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed(if current_status {
                        message_if_already_present
                    } else {
                        message_if_missing
                    }),
                )
                .await,
            )
        } else {
            None
        }
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::ServiceReady,
            None,
            Cow::Owned(greeting_text(
                &self.config,
                self.raw_io.is_ssl(),
            )),
        )
        .await
    }

    async fn send_reply(
        &mut self,
        kind: ResponseKind,
        response: &SmtpResponse<'_>,
    ) -> Result<(), Error> {
        self.send_response(kind, response.0, response.1, response.2.clone())
            .await
    }

    async fn send_response(
        &mut self,
        kind: ResponseKind,
        primary_code: PrimaryCode,
        secondary_code: Option<(ClassCode, SubjectCode)>,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        if primary_code == pc::ServiceClosing
            || primary_code == pc::ServiceNotAvailableClosing
        {
            self.quit = true;
        }

        write_response(
            &mut self.io,
            self.config.write_timeout,
            self.enhanced_ok,
            kind,
            primary_code,
            secondary_code,
            &quip,
        )
        .await
    }
}

fn greeting_text(config: &ServerConfig, ssl: bool) -> String {
    let proto = match (config.lmtp, ssl) {
        (false, false) => "ESMTP",
        (false, true) => "ESMTPS",
        (true, false) => "LMTP",
        (true, true) => "LMTPS",
    };
    format!("{} {} ready", config.domain, proto)
}

fn cut_prefix_fold<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() < prefix.len()
        || !s[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        None
    } else {
        Some(&s[prefix.len()..])
    }
}

fn parse_bdat_arg(arg: &str) -> Option<(u64, bool)> {
    let mut words = arg.split_ascii_whitespace();
    let size = words.next()?.parse::<u64>().ok()?;
    let last = match words.next() {
        None => false,
        Some(word) if word.eq_ignore_ascii_case("LAST") => true,
        Some(_) => return None,
    };
    if words.next().is_some() {
        return None;
    }
    Some((size, last))
}

enum ChunkEnd {
    /// A chunk marked LAST completed the message.
    Last,
    /// The client sent RSET between chunks.
    Rset,
    /// The client sent a BDAT command that did not parse.
    BadChunk,
    /// The client sent some other command between chunks.
    Other,
}

/// Drives a chunked (BDAT) transfer: copies each chunk into `dst`, sends
/// the per-chunk continuation replies, and reads the follow-up commands,
/// until a LAST chunk or something ends the transfer early.
///
/// Consumes every announced chunk in full regardless of ceilings, so the
/// command stream stays synchronized.
async fn pump_chunks(
    io: &mut BufStream<SmtpIo>,
    dst: DuplexStream,
    first: (u64, bool),
    max_octets: u64,
    write_timeout: Duration,
    enhanced: bool,
    deadline_tx: &mpsc::Sender<Instant>,
) -> Result<(BodyOutcome, ChunkEnd), Error> {
    let mut dst = DiscardOnError(dst);
    let mut outcome = BodyOutcome::default();
    let mut chunk = first;

    loop {
        let (len, last) = chunk;

        // Budget the deadline for a (very) slow 32kbps transfer.
        let _ = deadline_tx
            .send(Instant::now() + Duration::from_secs(30 + len / 4000))
            .await;

        if max_octets > 0 && outcome.octets + len > max_octets {
            outcome.oversized = true;
        }

        let mut src = (&mut *io).take(len);
        let copied = if outcome.oversized {
            tokio::io::copy(&mut src, &mut tokio::io::sink()).await?
        } else {
            // dst discards on error, so the chunk is consumed even if the
            // session hung up.
            tokio::io::copy(&mut src, &mut dst).await?
        };
        if copied < len {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF inside BDAT chunk",
            )));
        }
        if !outcome.oversized {
            outcome.octets += len;
        }

        if last {
            return Ok((outcome, ChunkEnd::Last));
        }

        write_response(
            io,
            write_timeout,
            enhanced,
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            "Continue",
        )
        .await?;

        let mut buffer = Vec::new();
        (&mut *io).take(4096).read_until(b'\n', &mut buffer).await?;
        if !buffer.ends_with(b"\n") {
            return Ok((outcome, ChunkEnd::Other));
        }

        let line = String::from_utf8_lossy(&buffer).into_owned();
        match syntax::parse_command(&line) {
            Ok((verb, arg)) if "BDAT" == verb => {
                match parse_bdat_arg(arg) {
                    Some(next) => chunk = next,
                    None => return Ok((outcome, ChunkEnd::BadChunk)),
                }
            },
            Ok((verb, _)) if "RSET" == verb => {
                return Ok((outcome, ChunkEnd::Rset));
            },
            _ => return Ok((outcome, ChunkEnd::Other)),
        }
    }
}

async fn write_response(
    io: &mut BufStream<SmtpIo>,
    write_timeout: Duration,
    enhanced: bool,
    kind: ResponseKind,
    primary_code: PrimaryCode,
    secondary_code: Option<(ClassCode, SubjectCode)>,
    quip: &str,
) -> Result<(), Error> {
    use std::fmt::Write as _;

    let mut s = String::new();
    let _ = write!(s, "{}{}", primary_code as u16, kind.indicator());
    if let Some((class, subject)) = secondary_code {
        if enhanced {
            let subject = subject as u16;
            let split = if subject >= 100 { 100 } else { 10 };
            let _ = write!(
                s,
                "{}.{}.{} ",
                class as u8,
                subject / split,
                subject % split
            );
        }
    }
    let _ = write!(s, "{}\r\n", quip);

    io.write_all(s.as_bytes()).await?;
    match kind {
        Final => {
            let flush = io.flush();
            if write_timeout.is_zero() {
                flush.await?;
            } else {
                tokio::time::timeout(write_timeout, flush)
                    .await
                    .map_err(|_| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "Write timeout expired",
                        ))
                    })??;
            }
        },
        Delayable => (),
    }

    Ok(())
}

// Runs until either the deadline channel is closed or the current deadline
// has expired. Used to force-close idle connections.
async fn idle_timer(mut deadline_rx: mpsc::Receiver<Instant>) {
    let mut deadline = Instant::now() + Duration::from_secs(30);

    loop {
        match tokio::time::timeout_at(deadline.into(), deadline_rx.recv())
            .await
        {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}

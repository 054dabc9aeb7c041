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

//! Shared harness for the integration tests: a capturing backend, a
//! synchronous test client, and a server setup that drives real sockets
//! through the full engine.

use std::borrow::Cow;
use std::io::{self, BufRead, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{
    SslAcceptor, SslConnector, SslMethod, SslVerifyMode,
};
use openssl::x509::{X509Name, X509};
use tokio::io::{AsyncReadExt, DuplexStream};

use crate::backend::{
    Backend, ConnMeta, HeloInfo, SaslServer, SaslStep, Session,
    SmtpResponse, SmtpResult,
};
use crate::codes::*;
use crate::config::ServerConfig;
use crate::error::Error;
use crate::options::{MailOptions, RcptOptions};
use crate::server::Server;
use crate::xclient::XclientAttrs;

lazy_static! {
    static ref TLS_KEY: PKey<Private> =
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    static ref TLS_CERT: X509 = self_signed_cert();
}

fn self_signed_cert() -> X509 {
    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_text("CN", "localhost").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1)
        .unwrap()
        .to_asn1_integer()
        .unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(3650).unwrap())
        .unwrap();
    builder.set_pubkey(&TLS_KEY).unwrap();
    builder.sign(&TLS_KEY, MessageDigest::sha256()).unwrap();
    builder.build()
}

pub fn ssl_acceptor() -> SslAcceptor {
    let mut ssl_acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
            .unwrap();
    ssl_acceptor.set_private_key(&TLS_KEY).unwrap();
    ssl_acceptor.set_certificate(&TLS_CERT).unwrap();
    ssl_acceptor.build()
}

/// Everything the capturing backend has seen, across all sessions.
#[derive(Default)]
pub struct Captured {
    pub sessions: u32,
    pub helos: Vec<HeloInfo>,
    pub mail: Vec<(String, MailOptions)>,
    pub rcpts: Vec<(String, RcptOptions)>,
    pub messages: Vec<Vec<u8>>,
    pub xclients: Vec<XclientAttrs>,
    pub auths: Vec<String>,
    pub resets: u32,
    pub logouts: u32,
}

/// A backend that records everything and refuses addresses containing
/// magic words: `denied` on MAIL, `reject`/`tempfail` on RCPT, and a body
/// containing `reject-body` on DATA.
pub struct CaptureBackend {
    pub captured: Arc<Mutex<Captured>>,
    /// When set, every connection is refused at session setup.
    pub refuse_sessions: bool,
}

impl CaptureBackend {
    pub fn new() -> (Self, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));
        (
            CaptureBackend {
                captured: Arc::clone(&captured),
                refuse_sessions: false,
            },
            captured,
        )
    }
}

impl Backend for CaptureBackend {
    type Session = CaptureSession;

    fn new_session(
        &self,
        _meta: &ConnMeta,
    ) -> Result<CaptureSession, SmtpResponse<'static>> {
        if self.refuse_sessions {
            return Err(SmtpResponse(
                pc::TransactionFailed,
                Some((cc::PermFail, sc::OtherMailSystem)),
                Cow::Borrowed("Not accepting mail today"),
            ));
        }

        self.captured.lock().unwrap().sessions += 1;
        Ok(CaptureSession {
            captured: Arc::clone(&self.captured),
        })
    }
}

pub struct CaptureSession {
    captured: Arc<Mutex<Captured>>,
}

impl Session for CaptureSession {
    async fn helo(&mut self, helo: &HeloInfo) -> SmtpResult {
        self.captured.lock().unwrap().helos.push(helo.clone());
        Ok(())
    }

    async fn mail(&mut self, from: &str, opts: &MailOptions) -> SmtpResult {
        if from.contains("denied") {
            return Err(SmtpResponse(
                pc::TransactionFailed,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Borrowed("Sender denied"),
            ));
        }
        self.captured
            .lock()
            .unwrap()
            .mail
            .push((from.to_owned(), opts.clone()));
        Ok(())
    }

    async fn rcpt(&mut self, to: &str, opts: &RcptOptions) -> SmtpResult {
        if to.contains("reject") {
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::BadDestinationMailboxAddress)),
                Cow::Borrowed("No such user"),
            ));
        }
        if to.contains("tempfail") {
            return Err(SmtpResponse(
                pc::ActionNotTakenTemporary,
                Some((cc::TempFail, sc::OtherMailboxStatus)),
                Cow::Borrowed("Try again later"),
            ));
        }
        self.captured
            .lock()
            .unwrap()
            .rcpts
            .push((to.to_owned(), opts.clone()));
        Ok(())
    }

    async fn data(&mut self, mut body: DuplexStream) -> SmtpResult {
        let mut content = Vec::new();
        body.read_to_end(&mut content)
            .await
            .map_err(|_| SmtpResponse::transaction_failed())?;

        let reject =
            content.windows(11).any(|w| w == &b"reject-body"[..]);
        self.captured.lock().unwrap().messages.push(content);
        if reject {
            Err(SmtpResponse(
                pc::TransactionFailed,
                Some((cc::PermFail, sc::OtherMailSystem)),
                Cow::Borrowed("Content rejected"),
            ))
        } else {
            Ok(())
        }
    }

    async fn data_lmtp(
        &mut self,
        mut body: DuplexStream,
        rcpts: &[String],
    ) -> Vec<SmtpResult> {
        let mut content = Vec::new();
        let read = body.read_to_end(&mut content).await;
        self.captured.lock().unwrap().messages.push(content);

        rcpts
            .iter()
            .map(|rcpt| {
                if read.is_err() {
                    Err(SmtpResponse::transaction_failed())
                } else if rcpt.contains("slowbox") {
                    Err(SmtpResponse(
                        pc::ActionNotTakenTemporary,
                        Some((cc::TempFail, sc::MailboxFull)),
                        Cow::Borrowed("Mailbox wedged"),
                    ))
                } else {
                    Ok(())
                }
            })
            .collect()
    }

    fn reset(&mut self) {
        self.captured.lock().unwrap().resets += 1;
    }

    async fn logout(&mut self) -> SmtpResult {
        self.captured.lock().unwrap().logouts += 1;
        Ok(())
    }

    fn auth_mechanisms(&self) -> Vec<&'static str> {
        vec!["PLAIN"]
    }

    fn auth(&mut self, mechanism: &str) -> Option<Box<dyn SaslServer>> {
        if "PLAIN" == mechanism {
            Some(Box::new(PlainServer {
                captured: Arc::clone(&self.captured),
            }))
        } else {
            None
        }
    }

    async fn xclient(&mut self, attrs: &XclientAttrs) -> SmtpResult {
        self.captured.lock().unwrap().xclients.push(attrs.clone());
        Ok(())
    }
}

/// RFC 4616 PLAIN, accepting any user whose password is "hunter2".
struct PlainServer {
    captured: Arc<Mutex<Captured>>,
}

impl SaslServer for PlainServer {
    fn step(
        &mut self,
        response: Option<&[u8]>,
    ) -> Result<SaslStep, SmtpResponse<'static>> {
        let Some(response) = response else {
            return Ok(SaslStep::Challenge(Vec::new()));
        };

        let response = String::from_utf8_lossy(response);
        let mut parts = response.split('\x00');
        let (Some(authorise), Some(authenticate), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SmtpResponse(
                pc::AuthenticationCredentialsInvalid,
                Some((cc::PermFail, sc::SyntaxError)),
                Cow::Borrowed("Invalid PLAIN response"),
            ));
        };

        if !authorise.is_empty() && authorise != authenticate {
            return Err(SmtpResponse(
                pc::AuthenticationCredentialsInvalid,
                Some((cc::PermFail, sc::AuthenticationCredentialsInvalid)),
                Cow::Borrowed("authorise-id must match authenticate-id"),
            ));
        }

        if "hunter2" == password && !authenticate.is_empty() {
            self.captured
                .lock()
                .unwrap()
                .auths
                .push(authenticate.to_owned());
            Ok(SaslStep::Done(authenticate.to_owned()))
        } else {
            Err(SmtpResponse(
                pc::AuthenticationCredentialsInvalid,
                Some((cc::PermFail, sc::AuthenticationCredentialsInvalid)),
                Cow::Borrowed("Bad credentials"),
            ))
        }
    }
}

/// A configured server plus the captured backend state.
pub struct Setup {
    pub server: Arc<Server<CaptureBackend>>,
    pub captured: Arc<Mutex<Captured>>,
}

pub fn set_up(config: ServerConfig) -> Setup {
    set_up_impl(config, false, false)
}

pub fn set_up_with_tls(config: ServerConfig) -> Setup {
    set_up_impl(config, true, false)
}

/// A server whose backend refuses every session.
pub fn set_up_refusing(config: ServerConfig) -> Setup {
    set_up_impl(config, false, true)
}

fn set_up_impl(
    config: ServerConfig,
    tls: bool,
    refuse_sessions: bool,
) -> Setup {
    crate::init_test_log();

    let (mut backend, captured) = CaptureBackend::new();
    backend.refuse_sessions = refuse_sessions;
    let mut server = Server::new(backend, config);
    if tls {
        server = server.with_ssl_acceptor(ssl_acceptor());
    }

    Setup {
        server: Arc::new(server),
        captured,
    }
}

impl Setup {
    /// Connects a test client, with the server believing the peer to be at
    /// the loopback address.
    pub fn connect(&self, cxn_name: &'static str) -> SmtpClient {
        self.connect_from(cxn_name, "127.0.0.1:45678")
    }

    /// Connects a test client with an arbitrary nominal peer address, which
    /// is what XCLIENT trust is judged against.
    pub fn connect_from(
        &self,
        cxn_name: &'static str,
        addr: &str,
    ) -> SmtpClient {
        let (server_io, client_io) = UnixStream::pair().unwrap();
        let server = Arc::clone(&self.server);
        let remote: SocketAddr = addr.parse().unwrap();

        std::thread::spawn(move || {
            run_server(server, cxn_name, server_io, remote)
        });

        SmtpClient::new(cxn_name, client_io)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run_server(
    server: Arc<Server<CaptureBackend>>,
    cxn_name: &str,
    server_io: UnixStream,
    remote: SocketAddr,
) {
    let result = server.serve_connection(server_io, Some(remote)).await;

    match result {
        Ok(()) => (),
        Err(Error::ShuttingDown) | Err(Error::IdleTimeout) => (),
        Err(Error::Io(e))
            if io::ErrorKind::UnexpectedEof == e.kind()
                || Some(nix::libc::EPIPE) == e.raw_os_error() =>
        {
            ()
        },
        Err(e) => panic!("[{cxn_name}] Unexpected server error: {e} {e:?}"),
    }
}

/// Whether an EHLO/LHLO response advertises exactly the given capability
/// line (e.g. `"SIZE 1000"`), regardless of its position in the reply.
pub fn has_capability(responses: &[String], cap: &str) -> bool {
    responses
        .iter()
        .any(|line| line.len() > 4 && line[4..].trim_end() == cap)
}

pub trait ReadWrite: Read + Write {}
impl<T: Read + Write + ?Sized> ReadWrite for T {}

/// A deliberately dumb synchronous SMTP client for driving the server in
/// tests.
pub struct SmtpClient {
    name: &'static str,
    io: Box<dyn ReadWrite>,
}

impl SmtpClient {
    pub fn new(name: &'static str, io: impl ReadWrite + 'static) -> Self {
        Self {
            name,
            io: Box::new(io),
        }
    }

    /// Read responses from the server up to and including the final
    /// response.
    ///
    /// This creates a `BufReader` over `io` and will lose any data which
    /// was buffered after the last read line. This should be fine since we
    /// don't pipeline without reading every reply.
    pub fn read_responses(&mut self) -> Vec<String> {
        let mut ret = Vec::<String>::new();
        let mut r = io::BufReader::new(&mut self.io);

        loop {
            let mut line = String::new();
            r.read_line(&mut line).unwrap();
            println!("[{}] >> {:?}", self.name, line);

            if line.is_empty() {
                panic!("Unexpected EOF");
            }

            let last = " " == &line[3..4];
            ret.push(line);

            if last {
                break;
            }
        }

        ret
    }

    /// Reads reply groups until `count` final lines have been seen, using a
    /// single buffered reader so that pipelined replies are not lost
    /// between calls. Returns only the final lines.
    pub fn read_final_responses(&mut self, count: usize) -> Vec<String> {
        let mut finals = Vec::<String>::new();
        let mut r = io::BufReader::new(&mut self.io);

        while finals.len() < count {
            let mut line = String::new();
            r.read_line(&mut line).unwrap();
            println!("[{}] >> {:?}", self.name, line);

            if line.is_empty() {
                panic!("Unexpected EOF");
            }
            if " " == &line[3..4] {
                finals.push(line);
            }
        }

        finals
    }

    /// Asserts that the server has closed the connection.
    pub fn expect_eof(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.io.read(&mut buf) {
                Ok(0) => return,
                // Residual replies in flight are fine.
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }

    /// Reads responses and asserts the final one starts with `prefix`.
    pub fn expect_final(&mut self, prefix: &str) -> Vec<String> {
        let responses = self.read_responses();
        let last = responses.last().unwrap();
        assert!(
            last.starts_with(prefix),
            "expected final response starting {prefix:?}, got {last:?}",
        );
        responses
    }

    /// Writes the given complete line to the server.
    pub fn write_line(&mut self, s: &str) {
        assert!(s.ends_with('\n'));
        for line in s.split_inclusive('\n') {
            println!("[{}] << {:?}", self.name, line);
        }
        self.io.write_all(s.as_bytes()).unwrap();
    }

    /// Writes the given raw data to the server.
    pub fn write_raw(&mut self, data: &[u8]) {
        println!("[{}] << [{} bytes]", self.name, data.len());
        self.io.write_all(data).unwrap();
    }

    /// Send a command which is expected to have one response with the given
    /// prefix.
    pub fn simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(&format!("{}\r\n", command));
        let responses = self.read_responses();
        assert_eq!(1, responses.len());
        assert!(
            responses[0].starts_with(prefix),
            "expected {prefix:?}, got {:?}",
            responses[0],
        );
    }

    /// Like `simple_command`, but omits the CR before the line ending.
    pub fn unix_simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(&format!("{}\n", command));
        let responses = self.read_responses();
        assert_eq!(1, responses.len());
        assert!(
            responses[0].starts_with(prefix),
            "expected {prefix:?}, got {:?}",
            responses[0],
        );
    }

    /// Skip the server greeting, then send the given command and consume
    /// the responses. Assert that the command succeeds.
    pub fn skip_pleasantries(&mut self, cmd: &str) {
        self.read_responses();
        self.write_line(&format!("{}\r\n", cmd));
        self.expect_final("250");
    }

    /// Performs a TLS handshake on the connection.
    pub fn start_tls(&mut self) {
        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);

        println!("[{}] <> Start TLS handshake", self.name);
        let cxn = mem::replace(&mut self.io, Box::new(io::empty()));
        let cxn = connector
            .build()
            .connect("localhost", cxn)
            .map_err(|_| "SSL handshake failed")
            .unwrap();
        println!("[{}] <> TLS handshake succeeded", self.name);
        self.io = Box::new(cxn);
    }

    /// Skip the greeting, perform an EHLO, STARTTLS, and the second EHLO.
    pub fn skip_pleasantries_with_tls(&mut self, command: &str) {
        self.skip_pleasantries(command);
        self.simple_command("STARTTLS", "220 ");
        self.start_tls();
        self.write_line(&format!("{}\r\n", command));
        self.expect_final("250");
    }

    /// Authenticates with AUTH PLAIN and an initial response.
    pub fn auth_plain(&mut self, user: &str, password: &str) {
        let auth = format!(
            "AUTH PLAIN {}",
            base64::encode(format!("\x00{user}\x00{password}")),
        );
        self.simple_command(&auth, "235 ");
    }
}

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

//! The server shell around the per-connection engine.
//!
//! Each accepted connection gets its own OS thread running a
//! single-threaded Tokio runtime. Connections share nothing but the
//! immutable configuration, the backend, and the shutdown signal, so there
//! is no cross-connection locking anywhere in the command path.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::sync::Notify;

use crate::backend::Backend;
use crate::config::ServerConfig;
use crate::conn;
use crate::error::Error;
use crate::io::SmtpIo;
use crate::log_prefix::LogPrefix;

/// An SMTP/LMTP server: a backend, a configuration, and the machinery to
/// drive connections against them.
///
/// The server itself holds no mutable protocol state; it can be shared
/// behind an `Arc` so that `shutdown` can be called from elsewhere while
/// `serve` blocks.
pub struct Server<B> {
    backend: Arc<B>,
    config: Arc<ServerConfig>,
    acceptor: Option<SslAcceptor>,
    shutdown: Arc<Shutdown>,
    gauge: Arc<ConnGauge>,
}

// Clones share all state; one clone can serve while another shuts down.
impl<B> Clone for Server<B> {
    fn clone(&self) -> Self {
        Server {
            backend: Arc::clone(&self.backend),
            config: Arc::clone(&self.config),
            acceptor: self.acceptor.clone(),
            shutdown: Arc::clone(&self.shutdown),
            gauge: Arc::clone(&self.gauge),
        }
    }
}

impl<B: Backend> Server<B> {
    pub fn new(backend: B, config: ServerConfig) -> Self {
        Server {
            backend: Arc::new(backend),
            config: Arc::new(config),
            acceptor: None,
            shutdown: Arc::new(Shutdown::default()),
            gauge: Arc::new(ConnGauge::default()),
        }
    }

    /// Installs the TLS acceptor that makes STARTTLS available.
    pub fn with_ssl_acceptor(mut self, acceptor: SslAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listener named by `config.addr`.
    pub fn bind(&self) -> Result<std::net::TcpListener, Error> {
        Ok(std::net::TcpListener::bind(&self.config.addr)?)
    }

    /// Accepts connections until `shutdown` is called, dedicating a thread
    /// with a single-threaded runtime to each.
    pub fn serve(
        &self,
        listener: std::net::TcpListener,
    ) -> Result<(), Error> {
        *self.shutdown.listener_fd.lock().unwrap() =
            Some(listener.as_raw_fd());

        info!(
            "Serving {} on {:?}",
            protocol_name(self.config.lmtp),
            listener.local_addr(),
        );

        loop {
            match listener.accept() {
                Ok((sock, addr)) => {
                    if self.shutdown.is_closed() {
                        break;
                    }

                    let this = self.clone();
                    std::thread::spawn(move || {
                        this.run_accepted(sock, addr)
                    });
                },

                Err(_) if self.shutdown.is_closed() => break,

                // Transient per-connection failures; the listener is fine.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                },

                Err(e) => return Err(e.into()),
            }
        }

        *self.shutdown.listener_fd.lock().unwrap() = None;
        Ok(())
    }

    fn run_accepted(&self, sock: std::net::TcpStream, addr: SocketAddr) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to build connection runtime: {e}");
                return;
            },
        };

        let result = runtime.block_on(self.serve_connection(sock, Some(addr)));
        log_connection_result(addr.to_string(), result);
    }

    /// Runs a single connection over `sock` on the current runtime.
    ///
    /// This is the entry point for inetd-style deployments and for tests;
    /// `serve` funnels into it. `remote_addr` is what XCLIENT trust and
    /// logging are derived from and may differ from the socket itself when
    /// the transport has no usable address.
    pub async fn serve_connection(
        &self,
        sock: impl AsRawFd + Any,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(), Error> {
        let fd = sock.as_raw_fd();
        let io = SmtpIo::new(sock)?;

        let log_prefix = LogPrefix::new(
            protocol_name(self.config.lmtp).to_owned(),
            remote_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "local".to_owned()),
        );

        let id = self.gauge.register(fd);
        let result = conn::run_connection(
            &*self.backend,
            io,
            remote_addr,
            Arc::clone(&self.config),
            self.acceptor.clone(),
            log_prefix,
            Arc::clone(&self.shutdown),
        )
        .await;
        self.gauge.deregister(id);

        result
    }

    /// The number of connections currently being served.
    pub fn live_connections(&self) -> usize {
        self.gauge.live()
    }

    /// Initiates shutdown: stops accepting, signals every connection to say
    /// goodbye at its next command boundary, and waits up to `grace` for
    /// them to drain before force-closing the stragglers.
    pub fn shutdown(&self, grace: Duration) {
        info!("Shutting down");
        self.shutdown.trigger();

        if let Some(fd) = *self.shutdown.listener_fd.lock().unwrap() {
            // Unblocks the accept loop.
            let _ = nix::sys::socket::shutdown(
                fd,
                nix::sys::socket::Shutdown::Both,
            );
        }

        if !self.gauge.wait_drained(grace) {
            warn!(
                "{} connections still open after grace period, \
                 force-closing",
                self.gauge.live(),
            );
            self.gauge.force_close_all();
            let _ = self.gauge.wait_drained(Duration::from_secs(5));
        }
    }
}

fn protocol_name(lmtp: bool) -> &'static str {
    if lmtp {
        "LMTP"
    } else {
        "SMTP"
    }
}

fn log_connection_result(peer: String, result: Result<(), Error>) {
    match result {
        Ok(()) => (),
        Err(Error::IdleTimeout) | Err(Error::ShuttingDown) => (),
        Err(Error::Io(e))
            if io::ErrorKind::UnexpectedEof == e.kind()
                || Some(nix::libc::EPIPE) == e.raw_os_error()
                || Some(nix::libc::ECONNRESET) == e.raw_os_error() =>
        {
            ()
        },
        Err(e) => error!("Connection from {peer} failed: {e}"),
    }
}

/// The shutdown signal shared between the server shell and every
/// connection runner.
#[derive(Default)]
pub(crate) struct Shutdown {
    closed: AtomicBool,
    notify: Notify,
    listener_fd: Mutex<Option<RawFd>>,
}

impl Shutdown {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn trigger(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once shutdown has been requested. Re-checks the flag
    /// periodically so a wakeup racing past a not-yet-registered waiter
    /// cannot be lost.
    pub(crate) async fn wait(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let _ = tokio::time::timeout(
                Duration::from_secs(1),
                self.notify.notified(),
            )
            .await;
        }
    }
}

/// Tracks the connections currently being served, by raw fd, so shutdown
/// can wait for them and, past the grace period, cut them off.
#[derive(Default)]
struct ConnGauge {
    inner: Mutex<GaugeInner>,
    drained: Condvar,
}

#[derive(Default)]
struct GaugeInner {
    next_id: u64,
    live: HashMap<u64, RawFd>,
}

impl ConnGauge {
    fn register(&self, fd: RawFd) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.live.insert(id, fd);
        id
    }

    fn deregister(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.live.remove(&id);
        if inner.live.is_empty() {
            self.drained.notify_all();
        }
    }

    fn live(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    fn wait_drained(&self, limit: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        let (inner, _) = self
            .drained
            .wait_timeout_while(inner, limit, |inner| !inner.live.is_empty())
            .unwrap();
        inner.live.is_empty()
    }

    fn force_close_all(&self) {
        let inner = self.inner.lock().unwrap();
        for &fd in inner.live.values() {
            let _ = nix::sys::socket::shutdown(
                fd,
                nix::sys::socket::Shutdown::Both,
            );
        }
    }
}

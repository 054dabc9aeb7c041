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

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use cidr::IpCidr;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Configuration for a server instance.
///
/// The whole structure can be deserialized from TOML; every field has a
/// default so a configuration file need only mention what it changes. The
/// configuration is immutable once the server starts.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The address to bind, as `host:port`. Only used by
    /// `Server::bind`; callers providing their own listener can leave it
    /// empty.
    pub addr: String,

    /// The domain the server announces in its banner and EHLO response.
    pub domain: String,

    /// The largest message accepted, in octets. Advertised via the `SIZE`
    /// extension. Zero means unlimited.
    pub max_message_bytes: u64,

    /// The largest number of recipients accepted per envelope. Zero means
    /// unlimited.
    pub max_recipients: usize,

    /// The longest accepted command line, in octets including the line
    /// ending. Also bounds the length of individual body lines for
    /// non-binary messages.
    pub max_line_length: usize,

    /// How long to wait for the next command before giving up on the
    /// client. Zero disables the timer.
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,

    /// How long a reply may take to drain to the client. Zero disables the
    /// timer.
    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,

    /// Permit AUTH on connections that have not negotiated TLS. Do not
    /// enable this outside of tests.
    pub allow_insecure_auth: bool,

    /// Refuse AUTH entirely even if the backend offers mechanisms.
    pub auth_disabled: bool,

    /// Advertise and accept `SMTPUTF8`.
    pub enable_smtputf8: bool,

    /// Advertise and accept `BINARYMIME` (implies `CHUNKING`).
    pub enable_binarymime: bool,

    /// Advertise and accept `CHUNKING` (the BDAT command).
    pub enable_chunking: bool,

    /// Advertise and accept the DSN parameters (NOTIFY, ORCPT, RET, ENVID).
    pub enable_dsn: bool,

    /// Advertise `REQUIRETLS` on TLS connections and accept the parameter.
    pub enable_requiretls: bool,

    /// Advertise and accept RFC 2852 `BY`.
    pub enable_deliverby: bool,

    /// Advertise and accept RFC 6710 `MT-PRIORITY`.
    pub enable_mtpriority: bool,

    /// Advertise and accept RFC 7293 `RRVS`.
    pub enable_rrvs: bool,

    /// Advertise and accept `XCLIENT` from peers inside
    /// `xclient_trusted_nets`.
    pub enable_xclient: bool,

    /// Networks whose members may impersonate real clients via XCLIENT.
    /// Trust is decided from the raw remote address at accept time; a
    /// successful XCLIENT cannot widen it.
    pub xclient_trusted_nets: CidrSet,

    /// Pass unrecognized `KEY=VALUE` RCPT parameters (XRCPTFORWARD and
    /// friends) through to the backend instead of rejecting them.
    pub enable_rcpt_extensions: bool,

    /// Speak LMTP instead of SMTP: the greeting command is LHLO and the end
    /// of DATA produces one reply per accepted recipient.
    pub lmtp: bool,

    /// Reject EHLO/HELO with no domain argument. The default tolerates it
    /// because a surprising number of real clients get this wrong.
    pub strict_helo: bool,

    /// Reject lines terminated by a bare LF. The default accepts them and
    /// also strips stray CRs inside command lines.
    pub strict_line_endings: bool,

    /// TLS key material. Required for STARTTLS to be offered.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: String::new(),
            domain: "localhost".to_owned(),
            max_message_bytes: 0,
            max_recipients: 0,
            max_line_length: 4096,
            read_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(60),
            allow_insecure_auth: false,
            auth_disabled: false,
            enable_smtputf8: false,
            enable_binarymime: false,
            enable_chunking: false,
            enable_dsn: false,
            enable_requiretls: false,
            enable_deliverby: false,
            enable_mtpriority: false,
            enable_rrvs: false,
            enable_xclient: false,
            xclient_trusted_nets: CidrSet::default(),
            enable_rcpt_extensions: false,
            lmtp: false,
            strict_helo: false,
            strict_line_endings: false,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    /// Whether the CHUNKING extension is in play. BINARYMIME is only
    /// deliverable over BDAT, so enabling it drags CHUNKING along.
    pub fn chunking_enabled(&self) -> bool {
        self.enable_chunking || self.enable_binarymime
    }
}

/// Paths to the TLS key material, in PEM format.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    /// The path to the TLS private key.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain.
    pub certificate_chain: PathBuf,
}

impl TlsConfig {
    /// Loads the key material and builds an acceptor suitable for passing
    /// to `Server::with_ssl_acceptor`.
    pub fn build_acceptor(&self) -> Result<SslAcceptor, Error> {
        let mut acceptor =
            SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        acceptor
            .set_private_key_file(&self.private_key, SslFiletype::PEM)?;
        acceptor.set_certificate_chain_file(&self.certificate_chain)?;
        Ok(acceptor.build())
    }
}

/// A list of CIDR blocks with a membership test.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CidrSet(Vec<IpCidr>);

impl CidrSet {
    pub fn new(set: Vec<IpCidr>) -> Self {
        Self(set)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.0.iter().any(|entry| entry.contains(&ip))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        d: &Duration,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_secs)
    }
}

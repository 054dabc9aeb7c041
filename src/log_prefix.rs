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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// about a connection.
///
/// Clones of a `LogPrefix` share the same underlying data, so a prefix
/// handed to a helper stays current as the session learns more about the
/// peer.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    protocol: String,
    peer: String,
    helo: Option<String>,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: String, peer: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                peer,
                helo: None,
                user: None,
            })),
        }
    }

    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(user);
    }

    /// Replaces the peer description, used when XCLIENT rewrites who we are
    /// nominally talking to.
    pub fn set_peer(&self, peer: String) {
        self.inner.lock().unwrap().peer = peer;
    }

    pub fn clear_session(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.helo = None;
        inner.user = None;
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}:{}", inner.protocol, inner.peer)?;
        if inner.helo.is_some() || inner.user.is_some() {
            write!(
                f,
                "[{}",
                inner.helo.as_deref().unwrap_or("<no-helo>"),
            )?;
            if let Some(ref user) = inner.user {
                write!(f, " {user}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

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

use std::io;

use thiserror::Error;

/// Terminal errors surfaced by the server and the connection runner.
///
/// Protocol-level problems (bad syntax, bad sequence, policy refusals,
/// backend rejections) are not errors; they become replies and the session
/// continues. Anything that ends up here ends the connection.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection idle timer expired")]
    IdleTimeout,
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

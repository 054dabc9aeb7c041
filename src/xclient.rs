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

//! The Postfix XCLIENT extension: a trusted proxy hands the server the
//! attributes of the client it is fronting for, and the session restarts as
//! if that client had connected directly.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use crate::syntax::ParseError;

/// The attribute value meaning "this will never be known".
pub const UNAVAILABLE: &str = "[UNAVAILABLE]";
/// The attribute value meaning "not known yet".
pub const TEMP_UNAVAIL: &str = "[TEMPUNAVAIL]";

/// Every attribute name this server understands, in advertising order.
pub const SUPPORTED_ATTRS: &[&str] = &[
    "NAME", "ADDR", "PORT", "PROTO", "HELO", "LOGIN", "DESTADDR", "DESTPORT",
];

fn is_placeholder(value: &str) -> bool {
    UNAVAILABLE.eq_ignore_ascii_case(value)
        || TEMP_UNAVAIL.eq_ignore_ascii_case(value)
}

/// A validated set of XCLIENT attributes.
///
/// The `[UNAVAILABLE]` and `[TEMPUNAVAIL]` placeholders pass validation for
/// any attribute and are preserved verbatim; the typed accessors treat them
/// as absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XclientAttrs {
    attrs: BTreeMap<String, String>,
}

impl XclientAttrs {
    /// Parses and validates the argument of an XCLIENT command.
    pub fn parse(arg: &str) -> Result<Self, ParseError> {
        let mut attrs = BTreeMap::new();
        for token in arg.split_ascii_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                return Err(ParseError(Cow::Owned(format!(
                    "XCLIENT attribute {token} is not NAME=VALUE",
                ))));
            };
            attrs.insert(key.to_ascii_uppercase(), value.to_owned());
        }

        let this = XclientAttrs { attrs };
        this.validate()?;
        Ok(this)
    }

    fn validate(&self) -> Result<(), ParseError> {
        fn bad(
            key: &str,
            why: impl fmt::Display,
        ) -> Result<(), ParseError> {
            Err(ParseError(Cow::Owned(format!("bad {key}: {why}"))))
        }

        for (key, value) in &self.attrs {
            if !SUPPORTED_ATTRS.contains(&key.as_str()) {
                return Err(ParseError(Cow::Owned(format!(
                    "unsupported XCLIENT attribute {key}",
                ))));
            }

            if is_placeholder(value) {
                continue;
            }

            match key.as_str() {
                "ADDR" | "DESTADDR" => {
                    if parse_addr_value(value).is_none() {
                        return bad(key, "not an IP address");
                    }
                },
                "PORT" | "DESTPORT" => {
                    if value.parse::<u16>().is_err() {
                        return bad(key, "not a port number");
                    }
                },
                "PROTO" => {
                    if !"SMTP".eq_ignore_ascii_case(value)
                        && !"ESMTP".eq_ignore_ascii_case(value)
                    {
                        return bad(key, "expected SMTP or ESMTP");
                    }
                },
                "HELO" => {
                    if value.is_empty() {
                        return bad(key, "empty");
                    }
                },
                // NAME and LOGIN are free-form.
                _ => (),
            }
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// The raw attribute value, placeholders included.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(|s| &**s)
    }

    /// The full attribute map, verbatim.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }

    fn known(&self, key: &str) -> Option<&str> {
        self.attrs
            .get(key)
            .map(|s| &**s)
            .filter(|v| !is_placeholder(v))
    }

    /// The proxied client address, if supplied and known.
    pub fn addr(&self) -> Option<IpAddr> {
        self.known("ADDR").and_then(parse_addr_value)
    }

    pub fn port(&self) -> Option<u16> {
        self.known("PORT").and_then(|v| v.parse().ok())
    }

    pub fn name(&self) -> Option<&str> {
        self.known("NAME")
    }

    pub fn proto(&self) -> Option<&str> {
        self.known("PROTO")
    }

    pub fn helo(&self) -> Option<&str> {
        self.known("HELO")
    }

    pub fn login(&self) -> Option<&str> {
        self.known("LOGIN")
    }
}

/// Parses an XCLIENT address value, which may carry Postfix's `IPV6:`
/// prefix.
fn parse_addr_value(value: &str) -> Option<IpAddr> {
    let value = if value.len() >= 5
        && value[..5].eq_ignore_ascii_case("IPV6:")
    {
        &value[5..]
    } else {
        value
    };
    value.parse().ok()
}

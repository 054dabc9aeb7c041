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

//! Lexical analysis for SMTP command lines.
//!
//! This module knows nothing about session state. It splits command lines
//! into verb and argument, parses the RFC 5321 §4.1.2 path grammar, breaks
//! `KEY=VALUE` parameter lists apart, and handles the auxiliary encodings
//! (xtext, the XRCPTFORWARD TSV payload) that ride on MAIL and RCPT
//! parameters. Interpretation of the parameters is in `options`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

/// An error from one of the lexical parsers.
///
/// The payload is a human-readable description suitable for inclusion in the
/// text of a 500/501 reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError(pub Cow<'static, str>);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn err<T>(s: &'static str) -> Result<T, ParseError> {
    Err(ParseError(Cow::Borrowed(s)))
}

/// The longest XRCPTFORWARD payload accepted, measured after base64
/// decoding. Anything bigger would not reliably fit on a relayed RCPT line.
pub const MAX_XRCPTFORWARD_LEN: usize = 900;

lazy_static! {
    static ref RX_HTTP_VERB: Regex =
        Regex::new("^(GET|HEAD|PUT|POST|DELETE|OPTIONS|CONNECT) ").unwrap();
}

/// Whether the line looks like the start of an HTTP request. Bots probing
/// for open proxies do this constantly; there is no point continuing the
/// conversation with them.
pub fn looks_like_http(line: &str) -> bool {
    RX_HTTP_VERB.is_match(line)
}

/// Splits a command line into its uppercased verb and its argument string.
///
/// An empty line yields an empty verb. A verb shorter than four characters
/// is rejected; no SMTP verb is that short, and cutting those off early
/// keeps garbage out of the dispatcher.
pub fn parse_command(line: &str) -> Result<(String, &str), ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok((String::new(), ""));
    }

    match line.find(' ') {
        None => {
            if line.len() < 4 {
                err("command too short")
            } else {
                Ok((line.to_ascii_uppercase(), ""))
            }
        },

        Some(space) => {
            if space < 4 {
                err("command too short")
            } else {
                Ok((line[..space].to_ascii_uppercase(), line[space + 1..].trim()))
            }
        },
    }
}

/// Splits a parameter string (everything after the path on a MAIL or RCPT
/// line) into a `KEY => VALUE` map.
///
/// Keys are uppercased; values are kept verbatim. A token with no `=` maps
/// to the empty string. Duplicate keys: last one wins.
pub fn parse_params(s: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for token in s.split_ascii_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => {
                map.insert(key.to_ascii_uppercase(), value.to_owned());
            },
            None => {
                map.insert(token.to_ascii_uppercase(), String::new());
            },
        }
    }
    map
}

/// Extracts the domain from a HELO/EHLO/LHLO argument, dropping any trailing
/// client chatter after the first space.
pub fn parse_hello_argument(arg: &str) -> Result<&str, ParseError> {
    let domain = match arg.find(' ') {
        Some(ix) => &arg[..ix],
        None => arg,
    };
    if domain.is_empty() {
        err("invalid domain")
    } else {
        Ok(domain)
    }
}

/// Cursor parser for the RFC 5321 §4.1.2 path grammar.
///
/// Operates on bytes so that SMTPUTF8 mailboxes pass through untouched; all
/// the grammar's delimiters are ASCII, so every cut point falls on a UTF-8
/// boundary.
pub struct Parser<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(s: &'a str) -> Self {
        Parser { s, pos: 0 }
    }

    /// The unconsumed remainder of the input.
    pub fn remaining(&self) -> &'a str {
        self.s.get(self.pos..).unwrap_or("")
    }

    fn peek_byte(&self) -> Option<u8> {
        self.s.as_bytes().get(self.pos).copied()
    }

    fn read_byte(&mut self) -> Option<u8> {
        let ch = self.peek_byte()?;
        self.pos += 1;
        Some(ch)
    }

    fn accept_byte(&mut self, ch: u8) -> bool {
        if Some(ch) == self.peek_byte() {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_byte(&mut self, ch: u8) -> Result<(), ParseError> {
        if self.accept_byte(ch) {
            Ok(())
        } else {
            Err(ParseError(Cow::Owned(match self.peek_byte() {
                Some(got) => format!(
                    "expected '{}', got '{}'",
                    ch as char, got as char
                ),
                None => format!("expected '{}', got end of line", ch as char),
            })))
        }
    }

    /// `Reverse-path = "<>" | Path`. The empty angle-bracket pair yields the
    /// null reverse path, returned as an empty string.
    pub fn parse_reverse_path(&mut self) -> Result<String, ParseError> {
        if self.remaining().starts_with("<>") {
            self.pos += 2;
            return Ok(String::new());
        }
        self.parse_path()
    }

    /// `Path = ["<"] [ A-d-l ":" ] Mailbox [">"]`. The source route is
    /// accepted and discarded. Angle brackets must balance.
    pub fn parse_path(&mut self) -> Result<String, ParseError> {
        let has_bracket = self.accept_byte(b'<');
        if self.accept_byte(b'@') {
            // Source route; skip to the colon that ends it.
            match self.remaining().find(':') {
                Some(ix) => self.pos += ix + 1,
                None => return err("malformed a-d-l"),
            }
        }

        let mbox = self.parse_mailbox()?;
        if has_bracket {
            self.expect_byte(b'>')?;
        }
        Ok(mbox)
    }

    fn parse_mailbox(&mut self) -> Result<String, ParseError> {
        let local_part = self.parse_local_part()?;
        if local_part.is_empty() {
            return err("local-part is empty");
        }

        self.expect_byte(b'@')?;

        let domain_start = self.pos;
        while let Some(ch) = self.peek_byte() {
            if b' ' == ch || b'\t' == ch || b'>' == ch {
                break;
            }
            self.pos += 1;
        }

        if domain_start == self.pos {
            return err("domain is empty");
        }

        let mut mbox = local_part;
        mbox.push('@');
        mbox.push_str(self.s.get(domain_start..self.pos).unwrap_or(""));
        Ok(mbox)
    }

    fn parse_local_part(&mut self) -> Result<String, ParseError> {
        let mut out = Vec::<u8>::new();

        if self.accept_byte(b'"') {
            // quoted-string
            loop {
                match self.read_byte() {
                    Some(b'\\') => match self.read_byte() {
                        Some(ch) => out.push(ch),
                        None => return err("malformed quoted-string"),
                    },
                    Some(b'"') => break,
                    Some(ch) => out.push(ch),
                    None => return err("malformed quoted-string"),
                }
            }
        } else {
            // dot-string
            loop {
                match self.peek_byte() {
                    None | Some(b'@') => break,
                    Some(
                        b'(' | b')' | b'<' | b'>' | b'[' | b']' | b':'
                        | b';' | b'\\' | b',' | b'"' | b' ' | b'\t',
                    ) => return err("malformed dot-string"),
                    Some(ch) => {
                        out.push(ch);
                        self.pos += 1;
                    },
                }
            }
        }

        String::from_utf8(out)
            .map_err(|_| ParseError(Cow::Borrowed("malformed UTF-8")))
    }
}

/// Characters which force a local part into quoted-string form when a path
/// is rendered back to wire format.
fn local_part_needs_quoting(local: &str) -> bool {
    local.is_empty()
        || local.bytes().any(|ch| {
            matches!(
                ch,
                b'(' | b')' | b'<' | b'>' | b'[' | b']' | b':' | b';'
                    | b'\\' | b',' | b'"' | b' ' | b'\t' | b'@'
            )
        })
}

/// Renders a mailbox (or the empty string for the null path) to the
/// angle-bracketed wire form, quoting the local part when needed.
///
/// Inverse of `Parser::parse_reverse_path` for every mailbox whose local
/// part contains no `@`.
pub fn format_reverse_path(path: &str) -> String {
    if path.is_empty() {
        return "<>".to_owned();
    }

    let (local, domain) = match path.split_once('@') {
        Some((l, d)) => (l, d),
        None => (path, ""),
    };

    if local_part_needs_quoting(local) {
        let mut out = String::with_capacity(path.len() + 4);
        out.push_str("<\"");
        for ch in local.chars() {
            if '"' == ch || '\\' == ch {
                out.push('\\');
            }
            out.push(ch);
        }
        out.push_str("\"@");
        out.push_str(domain);
        out.push('>');
        out
    } else {
        format!("<{path}>")
    }
}

/// Decodes RFC 3461 xtext: `+HH` hex escapes, everything else verbatim.
pub fn decode_xtext(s: &str) -> Result<String, ParseError> {
    if !s.contains('+') {
        return Ok(s.to_owned());
    }

    let mut out = Vec::<u8>::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(ch) = bytes.next() {
        if b'+' == ch {
            let hi = bytes.next().and_then(|c| (c as char).to_digit(16));
            let lo = bytes.next().and_then(|c| (c as char).to_digit(16));
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
                _ => return err("malformed xtext escape"),
            }
        } else {
            out.push(ch);
        }
    }

    String::from_utf8(out)
        .map_err(|_| ParseError(Cow::Borrowed("malformed UTF-8 in xtext")))
}

/// Encodes a string as RFC 3461 xtext.
pub fn encode_xtext(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.bytes() {
        if (33..=126).contains(&ch) && b'+' != ch && b'=' != ch {
            out.push(ch as char);
        } else {
            out.push_str(&format!("+{ch:02X}"));
        }
    }
    out
}

/// Decodes an XRCPTFORWARD parameter value.
///
/// The value is standard-alphabet base64 over a TAB-separated sequence of
/// `key=value` records. Within a record, `\t`, `\n`, `\r` and `\\` escapes
/// are honored in the value; nothing else is an escape. Empty records are
/// skipped. An empty payload, a record with no `=` or an empty key, or a
/// decoded payload longer than `MAX_XRCPTFORWARD_LEN` octets is an error.
pub fn parse_xrcptforward(
    value: &str,
) -> Result<BTreeMap<String, String>, ParseError> {
    if value.is_empty() {
        return err("empty XRCPTFORWARD value");
    }

    let decoded = base64::decode(value)
        .map_err(|_| ParseError(Cow::Borrowed("invalid base64")))?;
    if decoded.is_empty() {
        return err("empty XRCPTFORWARD payload");
    }
    if decoded.len() > MAX_XRCPTFORWARD_LEN {
        return err("XRCPTFORWARD payload too large");
    }

    let decoded = String::from_utf8(decoded).map_err(|_| {
        ParseError(Cow::Borrowed("malformed UTF-8 in XRCPTFORWARD"))
    })?;

    let mut map = BTreeMap::new();
    for record in decoded.split('\t') {
        if record.is_empty() {
            continue;
        }

        let Some((key, value)) = record.split_once('=') else {
            return err("XRCPTFORWARD record is not key=value");
        };
        if key.is_empty() {
            return err("XRCPTFORWARD record has an empty key");
        }

        map.insert(key.to_owned(), unescape_xrcptforward(value));
    }

    Ok(map)
}

/// Encodes forwarding records into an XRCPTFORWARD parameter value.
///
/// Inverse of `parse_xrcptforward` as long as keys contain none of the
/// escaped characters.
pub fn encode_xrcptforward<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let mut tsv = String::new();
    for (key, value) in pairs {
        if !tsv.is_empty() {
            tsv.push('\t');
        }
        tsv.push_str(key);
        tsv.push('=');
        tsv.push_str(&escape_xrcptforward(value));
    }
    base64::encode(tsv)
}

fn unescape_xrcptforward(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if '\\' != ch {
            out.push(ch);
            continue;
        }

        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            // Not an escape; keep both characters verbatim.
            Some(other) => {
                out.push('\\');
                out.push(other);
            },
            None => out.push('\\'),
        }
    }
    out
}

fn escape_xrcptforward(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            ch => out.push(ch),
        }
    }
    out
}

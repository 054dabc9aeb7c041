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

//! Typed MAIL and RCPT parameters, and their interpretation from the raw
//! `KEY=VALUE` maps produced by `syntax::parse_params`.
//!
//! Interpretation is where extension gating happens: a parameter belonging
//! to an extension the server has not enabled is refused here, with the
//! reply distinguishing "never heard of it" (500) from "heard of it, not
//! offering it" (504).

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};

use crate::backend::SmtpResponse;
use crate::codes::*;
use crate::config::ServerConfig;
use crate::syntax::{
    decode_xtext, parse_xrcptforward, ParseError, Parser,
};

/// The `BODY` parameter of MAIL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
    BinaryMime,
}

impl BodyType {
    pub fn as_str(self) -> &'static str {
        match self {
            BodyType::SevenBit => "7BIT",
            BodyType::EightBitMime => "8BITMIME",
            BodyType::BinaryMime => "BINARYMIME",
        }
    }
}

/// One RFC 3461 `NOTIFY` condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DsnNotify {
    Never,
    Success,
    Failure,
    Delay,
}

/// The RFC 3461 `RET` parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DsnReturn {
    Full,
    Headers,
}

/// The mode half of an RFC 2852 `BY` parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliverByMode {
    Return,
    Notify,
}

/// A parsed RFC 2852 `BY` parameter: `seconds;mode[T]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliverByOptions {
    /// Seconds until the deadline. May be negative in Notify mode; Return
    /// mode requires at least 1.
    pub seconds: i64,
    pub mode: DeliverByMode,
    /// Whether the `T` (trace) suffix was present.
    pub trace: bool,
}

/// The mode suffix of an RFC 7293 `RRVS` parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RrvsMode {
    /// `R` (the default): reject the recipient if it is newer than claimed.
    Reject,
    /// `C`: deliver anyway.
    Continue,
}

/// Parameters accepted on MAIL FROM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailOptions {
    pub body: Option<BodyType>,
    /// The declared message size from `SIZE`.
    pub size: Option<u64>,
    /// `SMTPUTF8`: addresses and body may be UTF-8.
    pub utf8: bool,
    /// `REQUIRETLS`: the message must not leave the TLS umbrella.
    pub require_tls: bool,
    /// The `AUTH=` originator claim, xtext-decoded. `Some("")` is the
    /// explicit "identity unknown" claim `<>`.
    pub auth: Option<String>,
    pub deliver_by: Option<DeliverByOptions>,
    /// `MT-PRIORITY`, already confirmed to be within -9..=9.
    pub mt_priority: Option<i8>,
    pub ret: Option<DsnReturn>,
    /// The DSN envelope identifier, xtext-decoded.
    pub envelope_id: Option<String>,
}

/// Parameters accepted on RCPT TO.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RcptOptions {
    /// `NOTIFY`. `Never` only ever appears alone.
    pub notify: Option<Vec<DsnNotify>>,
    /// The address-type tag from `ORCPT` (usually `rfc822`).
    pub original_recipient_type: Option<String>,
    /// The xtext-decoded `ORCPT` address.
    pub original_recipient: Option<String>,
    /// `RRVS`: the time the sender last confirmed the recipient was valid.
    pub rrvs: Option<(DateTime<FixedOffset>, RrvsMode)>,
    pub deliver_by: Option<DeliverByOptions>,
    pub mt_priority: Option<i8>,
    /// Unrecognized `KEY=VALUE` parameters, verbatim. Only populated when
    /// `enable_rcpt_extensions` is set; otherwise unknown parameters are
    /// refused before reaching the backend.
    pub extensions: BTreeMap<String, String>,
}

/// Parses the RFC 2852 `BY` argument: `seconds;mode[T]`.
pub fn parse_deliver_by(arg: &str) -> Option<DeliverByOptions> {
    let (seconds, mode) = arg.split_once(';')?;
    let (mode, trace) = match mode.strip_suffix('T') {
        Some(mode) => (mode, true),
        None => (mode, false),
    };
    let mode = match mode {
        "R" => DeliverByMode::Return,
        "N" => DeliverByMode::Notify,
        _ => return None,
    };
    let seconds = seconds.parse::<i64>().ok()?;
    if DeliverByMode::Return == mode && seconds < 1 {
        return None;
    }

    Some(DeliverByOptions {
        seconds,
        mode,
        trace,
    })
}

fn unknown_param(key: &str) -> SmtpResponse<'static> {
    SmtpResponse(
        pc::CommandSyntaxError,
        Some((cc::PermFail, sc::InvalidCommandArguments)),
        Cow::Owned(format!("Unknown argument {key}")),
    )
}

fn unsupported_param(key: &str) -> SmtpResponse<'static> {
    SmtpResponse(
        pc::CommandParameterNotImplemented,
        Some((cc::PermFail, sc::InvalidCommandArguments)),
        Cow::Owned(format!("{key} is not offered here")),
    )
}

fn bad_param(key: &str, why: impl std::fmt::Display) -> SmtpResponse<'static> {
    SmtpResponse(
        pc::ParameterSyntaxError,
        Some((cc::PermFail, sc::InvalidCommandArguments)),
        Cow::Owned(format!("Malformed {key} argument: {why}")),
    )
}

impl MailOptions {
    /// Interprets the parameter map of a MAIL command.
    pub(crate) fn from_params(
        params: &BTreeMap<String, String>,
        config: &ServerConfig,
    ) -> Result<Self, SmtpResponse<'static>> {
        let mut opts = MailOptions::default();

        for (key, value) in params {
            match key.as_str() {
                "BODY" => {
                    opts.body = Some(
                        match value.to_ascii_uppercase().as_str() {
                            "7BIT" => BodyType::SevenBit,
                            "8BITMIME" => BodyType::EightBitMime,
                            "BINARYMIME" if config.enable_binarymime => {
                                BodyType::BinaryMime
                            },
                            "BINARYMIME" => {
                                return Err(unsupported_param("BINARYMIME"))
                            },
                            _ => {
                                return Err(bad_param(
                                    "BODY",
                                    "unknown body type",
                                ))
                            },
                        },
                    );
                },

                "SIZE" => {
                    let size = value
                        .parse::<u64>()
                        .map_err(|_| bad_param("SIZE", "not a number"))?;
                    if config.max_message_bytes > 0
                        && size > config.max_message_bytes
                    {
                        return Err(SmtpResponse(
                            pc::ExceededStorageAllocation,
                            Some((
                                cc::PermFail,
                                sc::MessageTooBigForSystem,
                            )),
                            Cow::Owned(format!(
                                "Maximum message size is {} octets",
                                config.max_message_bytes,
                            )),
                        ));
                    }
                    opts.size = Some(size);
                },

                "SMTPUTF8" => {
                    if !config.enable_smtputf8 {
                        return Err(unsupported_param("SMTPUTF8"));
                    }
                    opts.utf8 = true;
                },

                "REQUIRETLS" => {
                    if !config.enable_requiretls {
                        return Err(unsupported_param("REQUIRETLS"));
                    }
                    opts.require_tls = true;
                },

                "AUTH" => {
                    let value = decode_xtext(value)
                        .map_err(|e| bad_param("AUTH", e))?;
                    if "<>" == value {
                        opts.auth = Some(String::new());
                    } else {
                        let mut p = Parser::new(&value);
                        let mbox = p
                            .parse_path()
                            .map_err(|e| bad_param("AUTH", e))?;
                        opts.auth = Some(mbox);
                    }
                },

                "BY" => {
                    if !config.enable_deliverby {
                        return Err(unsupported_param("BY"));
                    }
                    opts.deliver_by = Some(
                        parse_deliver_by(value).ok_or_else(|| {
                            bad_param("BY", "malformed deliver-by value")
                        })?,
                    );
                },

                "MT-PRIORITY" => {
                    if !config.enable_mtpriority {
                        return Err(unsupported_param("MT-PRIORITY"));
                    }
                    opts.mt_priority = Some(parse_mt_priority(value)?);
                },

                "RET" => {
                    if !config.enable_dsn {
                        return Err(unsupported_param("RET"));
                    }
                    opts.ret =
                        Some(match value.to_ascii_uppercase().as_str() {
                            "FULL" => DsnReturn::Full,
                            "HDRS" => DsnReturn::Headers,
                            _ => {
                                return Err(bad_param(
                                    "RET",
                                    "expected FULL or HDRS",
                                ))
                            },
                        });
                },

                "ENVID" => {
                    if !config.enable_dsn {
                        return Err(unsupported_param("ENVID"));
                    }
                    opts.envelope_id = Some(
                        decode_xtext(value)
                            .map_err(|e| bad_param("ENVID", e))?,
                    );
                },

                _ => return Err(unknown_param(key)),
            }
        }

        Ok(opts)
    }
}

impl RcptOptions {
    /// Interprets the parameter map of a RCPT command.
    pub(crate) fn from_params(
        params: &BTreeMap<String, String>,
        config: &ServerConfig,
    ) -> Result<Self, SmtpResponse<'static>> {
        let mut opts = RcptOptions::default();

        for (key, value) in params {
            match key.as_str() {
                "NOTIFY" => {
                    if !config.enable_dsn {
                        return Err(unsupported_param("NOTIFY"));
                    }
                    opts.notify = Some(parse_notify(value)?);
                },

                "ORCPT" => {
                    if !config.enable_dsn {
                        return Err(unsupported_param("ORCPT"));
                    }
                    let (atype, addr) =
                        value.split_once(';').ok_or_else(|| {
                            bad_param("ORCPT", "expected type;address")
                        })?;
                    if atype.is_empty() {
                        return Err(bad_param(
                            "ORCPT",
                            "empty address type",
                        ));
                    }
                    opts.original_recipient_type = Some(atype.to_owned());
                    opts.original_recipient = Some(
                        decode_xtext(addr)
                            .map_err(|e| bad_param("ORCPT", e))?,
                    );
                },

                "RRVS" => {
                    if !config.enable_rrvs {
                        return Err(unsupported_param("RRVS"));
                    }
                    opts.rrvs = Some(parse_rrvs(value)?);
                },

                "BY" => {
                    if !config.enable_deliverby {
                        return Err(unsupported_param("BY"));
                    }
                    opts.deliver_by = Some(
                        parse_deliver_by(value).ok_or_else(|| {
                            bad_param("BY", "malformed deliver-by value")
                        })?,
                    );
                },

                "MT-PRIORITY" => {
                    if !config.enable_mtpriority {
                        return Err(unsupported_param("MT-PRIORITY"));
                    }
                    opts.mt_priority = Some(parse_mt_priority(value)?);
                },

                _ => {
                    if !config.enable_rcpt_extensions {
                        return Err(unknown_param(key));
                    }

                    // XRCPTFORWARD is validated here even though the backend
                    // receives the raw value: a relay that mangles the
                    // payload should hear about it at RCPT time.
                    if "XRCPTFORWARD" == key {
                        parse_xrcptforward(value)
                            .map_err(|e| bad_param("XRCPTFORWARD", e))?;
                    }

                    opts.extensions
                        .insert(key.clone(), value.clone());
                },
            }
        }

        Ok(opts)
    }
}

fn parse_mt_priority(
    value: &str,
) -> Result<i8, SmtpResponse<'static>> {
    value
        .parse::<i8>()
        .ok()
        .filter(|p| (-9..=9).contains(p))
        .ok_or_else(|| bad_param("MT-PRIORITY", "expected -9..9"))
}

fn parse_notify(
    value: &str,
) -> Result<Vec<DsnNotify>, SmtpResponse<'static>> {
    let mut list = Vec::new();
    for item in value.split(',') {
        list.push(match item.to_ascii_uppercase().as_str() {
            "NEVER" => DsnNotify::Never,
            "SUCCESS" => DsnNotify::Success,
            "FAILURE" => DsnNotify::Failure,
            "DELAY" => DsnNotify::Delay,
            _ => return Err(bad_param("NOTIFY", "unknown condition")),
        });
    }

    if list.is_empty()
        || (list.contains(&DsnNotify::Never) && list.len() > 1)
    {
        return Err(bad_param("NOTIFY", "NEVER must stand alone"));
    }

    Ok(list)
}

fn parse_rrvs(
    value: &str,
) -> Result<(DateTime<FixedOffset>, RrvsMode), SmtpResponse<'static>> {
    let (stamp, mode) = match value.split_once(';') {
        Some((stamp, mode)) => {
            let mode = match mode.to_ascii_uppercase().as_str() {
                "R" => RrvsMode::Reject,
                "C" => RrvsMode::Continue,
                _ => return Err(bad_param("RRVS", "expected mode R or C")),
            };
            (stamp, mode)
        },
        None => (value, RrvsMode::Reject),
    };

    let stamp = DateTime::parse_from_rfc3339(stamp)
        .map_err(|_| ParseError(Cow::Borrowed("bad ISO-8601 timestamp")))
        .map_err(|e| bad_param("RRVS", e))?;
    Ok((stamp, mode))
}

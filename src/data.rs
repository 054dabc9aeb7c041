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

//! Message body transfer for the DATA path: RFC 5321 §4.5.2 dot-stuffing in
//! both directions, with the receive side enforcing the message size and
//! line length ceilings.
//!
//! The BDAT path needs none of this (chunks are raw octets) and lives with
//! the command loop.

use std::io;
use std::pin::Pin;
use std::task;

use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};

/// Ceilings applied while receiving a DATA body.
#[derive(Clone, Copy, Debug, Default)]
pub struct BodyLimits {
    /// Largest accepted message, in octets of decoded content. Zero means
    /// unlimited.
    pub max_octets: u64,
    /// Longest accepted body line, in octets excluding the line ending.
    /// Zero means unlimited.
    pub max_line: usize,
}

/// What happened while receiving a DATA body.
///
/// The copy always consumes input through the terminating `.` line, even
/// after the message has become undeliverable, so that the connection stays
/// synchronized and can carry the rejection reply.
#[derive(Clone, Copy, Debug, Default)]
pub struct BodyOutcome {
    /// Decoded octets forwarded to the consumer.
    pub octets: u64,
    /// The message exceeded `max_octets`; the tail was discarded.
    pub oversized: bool,
    /// Some line exceeded `max_line`; the message was discarded from that
    /// point.
    pub long_line: bool,
}

impl BodyOutcome {
    pub fn accepted(&self) -> bool {
        !self.oversized && !self.long_line
    }
}

/// Copies a dot-stuffed body from `src` to `dst`, consuming up to and
/// including the terminating `.` line.
///
/// Stuffed dots are removed and line endings are normalized to CRLF; bare-LF
/// line endings are accepted, as real senders emit them more often than one
/// would hope. Once a ceiling is exceeded, forwarding stops but consumption
/// continues through the terminator. Errors from `dst` likewise stop
/// forwarding without stopping consumption, so a consumer that hangs up
/// early does not desynchronize the connection.
pub async fn copy_unstuffed(
    dst: &mut (impl AsyncWrite + Unpin),
    src: &mut (impl AsyncBufReadExt + Unpin),
    limits: BodyLimits,
) -> io::Result<BodyOutcome> {
    let mut outcome = BodyOutcome::default();
    let mut dst_dead = false;
    let mut line = Vec::<u8>::new();

    loop {
        line.clear();
        // Bound each read so a monster line cannot balloon the buffer; a
        // line that does not fit is consumed piecewise.
        let mut fits = true;
        loop {
            let n =
                (&mut *src).take(8192).read_until(b'\n', &mut line).await?;
            if 0 == n {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF encountered in DATA payload",
                ));
            }
            if line.ends_with(b"\n") {
                break;
            }
            if limits.max_line > 0 && line.len() > limits.max_line {
                // Doomed anyway; stop accumulating and just drain.
                fits = false;
                outcome.long_line = true;
                line.clear();
            }
        }

        if !fits {
            continue;
        }

        let content = match line.strip_suffix(b"\r\n") {
            Some(content) => content,
            // Accept a UNIX line ending and normalize it on the way out.
            None => &line[..line.len() - 1],
        };

        if b"." == content {
            break;
        }

        // Remove the stuffed dot.
        let content = match content.strip_prefix(b".") {
            Some(rest) => rest,
            None => content,
        };

        if limits.max_line > 0 && content.len() > limits.max_line {
            outcome.long_line = true;
        }

        let new_total = outcome.octets + content.len() as u64 + 2;
        if limits.max_octets > 0 && new_total > limits.max_octets {
            outcome.oversized = true;
        }

        if outcome.accepted() && !dst_dead {
            let write = async {
                dst.write_all(content).await?;
                dst.write_all(b"\r\n").await
            };
            // A consumer hanging up is not our problem; keep draining.
            if write.await.is_err() {
                dst_dead = true;
            } else {
                outcome.octets = new_total;
            }
        }
    }

    Ok(outcome)
}

/// Applies dot-stuffing to a complete body, producing the exact octets to
/// put on the wire after the 354 reply, terminator included.
///
/// The body must use CRLF line endings; a missing final CRLF is supplied.
/// Inverse of `copy_unstuffed` for bodies containing no bare CR or LF.
pub fn stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);

    let mut start_of_line = true;
    for &ch in body {
        if start_of_line && b'.' == ch {
            out.push(b'.');
        }
        out.push(ch);
        start_of_line = b'\n' == ch;
    }

    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Wraps a writer to silently succeed and discard all data after the first
/// error.
pub struct DiscardOnError<W>(pub W);

impl<W: AsyncWrite + Unpin> AsyncWrite for DiscardOnError<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        match Pin::new(&mut self.get_mut().0).poll_write(ctx, buf) {
            task::Poll::Ready(Err(_)) => task::Poll::Ready(Ok(buf.len())),
            poll => poll,
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        match Pin::new(&mut self.get_mut().0).poll_flush(ctx) {
            task::Poll::Ready(Err(_)) => task::Poll::Ready(Ok(())),
            poll => poll,
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        match Pin::new(&mut self.get_mut().0).poll_shutdown(ctx) {
            task::Poll::Ready(Err(_)) => task::Poll::Ready(Ok(())),
            poll => poll,
        }
    }
}

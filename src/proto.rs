// Copyright 2020 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FTP control-channel replies and commands.

use std::fmt;
use std::io;
use std::io::prelude::*;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// A complete, possibly multi-line, reply from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Reply text, with the code removed from the first and last lines.
    pub lines: Vec<String>,
}

impl Reply {
    /// All the reply text, one line per line.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn is_preliminary(&self) -> bool {
        self.code / 100 == 1
    }

    pub fn is_positive(&self) -> bool {
        self.code / 100 == 2
    }

    /// Check the reply has one of the `expected` codes, or else turn it
    /// into a `ReplyError`.
    pub fn expect(self, expected: &[u16]) -> Result<Reply, ReplyError> {
        if expected.contains(&self.code) {
            Ok(self)
        } else {
            Err(ReplyError {
                code: self.code,
                text: self.text(),
            })
        }
    }

    /// Check the reply is a positive completion (2xx).
    pub fn expect_positive(self) -> Result<Reply, ReplyError> {
        if self.is_positive() {
            Ok(self)
        } else {
            Err(ReplyError {
                code: self.code,
                text: self.text(),
            })
        }
    }
}

/// The server answered a command with an unexpected reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyError {
    pub code: u16,
    pub text: String,
}

impl ReplyError {
    /// True for permanent negative replies (5xx): retrying on a new
    /// connection will give the same answer.
    pub fn is_permanent(&self) -> bool {
        self.code / 100 == 5
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server replied {} {}", self.code, self.text.trim_end())
    }
}

impl std::error::Error for ReplyError {}

/// True if `err` means the connection itself is suspect, so the operation
/// should be retried on a fresh connection.
///
/// Anything other than a permanent negative reply counts: I/O errors,
/// timeouts, malformed replies and transient (4xx) replies.
pub fn is_transport_failure(err: &anyhow::Error) -> bool {
    !err.chain().any(|cause| {
        cause
            .downcast_ref::<ReplyError>()
            .map_or(false, ReplyError::is_permanent)
    })
}

/// Extension trait to read replies from the control channel.
pub trait ReadReply {
    fn read_reply(&mut self) -> io::Result<Reply>;
}

impl<R: BufRead + ?Sized> ReadReply for R {
    fn read_reply(&mut self) -> io::Result<Reply> {
        let first = read_line(self)?;
        let (code, sep, rest) = split_code(&first)?;
        let mut lines = vec![rest.to_owned()];
        if sep == Some('-') {
            // Multi-line: runs until a line starting with the same code and
            // a space.
            loop {
                let line = read_line(self)?;
                match split_code(&line) {
                    Ok((c, sep, rest)) if c == code && sep != Some('-') => {
                        lines.push(rest.to_owned());
                        break;
                    }
                    _ => lines.push(line),
                }
            }
        }
        let reply = Reply { code, lines };
        trace!("<- {} {}", reply.code, reply.text());
        Ok(reply)
    }
}

fn read_line<R: BufRead + ?Sized>(r: &mut R) -> io::Result<String> {
    let mut buf = Vec::new();
    if r.read_until(b'\n', &mut buf)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "control connection closed by server",
        ));
    }
    while buf.last().map_or(false, |&b| b == b'\n' || b == b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Split a reply line into the code, the separator character (if any) and
/// the remaining text.
fn split_code(line: &str) -> io::Result<(u16, Option<char>, &str)> {
    let code = line
        .get(..3)
        .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed reply line {:?}", line),
            )
        })?;
    let sep = line[3..].chars().next();
    let rest = line.get(4..).unwrap_or("");
    Ok((code, sep, rest))
}

/// Extension trait to send commands on the control channel.
pub trait WriteCommand {
    fn write_command(&mut self, command: &str) -> io::Result<()>;
}

impl<W: Write + ?Sized> WriteCommand for W {
    fn write_command(&mut self, command: &str) -> io::Result<()> {
        if command.starts_with("PASS ") {
            trace!("-> PASS ****");
        } else {
            trace!("-> {}", command);
        }
        self.write_all(command.as_bytes())?;
        self.write_all(b"\r\n")?;
        self.flush()
    }
}

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

//! The protocol operations the mirror needs from a server session.

use std::io::Write;

use crate::Result;

/// One logged-in control connection to the server.
///
/// Errors are either a [`ReplyError`](crate::ReplyError) carrying the
/// server's negative reply, or anything else, which is taken to mean the
/// session is no longer usable.
///
/// Dropping the session closes it without a goodbye; call [`quit`](Session::quit)
/// first for a graceful close.
pub trait Session {
    /// Send a no-op, to check the connection and keep it from idling out.
    fn noop(&mut self) -> Result<()>;

    /// Select binary (image) transfer type.
    fn binary_mode(&mut self) -> Result<()>;

    /// Return the current remote directory.
    fn pwd(&mut self) -> Result<String>;

    /// Change the current remote directory.
    fn cwd(&mut self, path: &str) -> Result<()>;

    /// Machine-readable listing of the current directory, one line per entry.
    fn mlsd(&mut self) -> Result<Vec<String>>;

    /// Plain name listing of the current directory.
    fn nlst(&mut self) -> Result<Vec<String>>;

    /// Length in bytes of a remote file.
    fn size(&mut self, path: &str) -> Result<u64>;

    /// Lines of the feature advertisement, excluding the first and last.
    fn feat(&mut self) -> Result<Vec<String>>;

    /// Send an arbitrary command, returning the reply text if it succeeded.
    fn quote(&mut self, command: &str) -> Result<String>;

    /// Retrieve `path` starting from `offset`, writing it to `out` in
    /// blocks of at most `block_size`.
    ///
    /// Returns the number of bytes written. On error some bytes may
    /// already have been written to `out`.
    fn retrieve(
        &mut self,
        path: &str,
        offset: u64,
        block_size: usize,
        out: &mut dyn Write,
    ) -> Result<u64>;

    /// End the session politely.
    fn quit(&mut self) -> Result<()>;
}

/// Opens new sessions to a fixed server.
pub trait Connector {
    /// Connect and log in, returning a session in binary mode.
    fn connect(&mut self) -> Result<Box<dyn Session>>;

    /// Human-readable name of the server, for messages.
    fn describe(&self) -> String;
}

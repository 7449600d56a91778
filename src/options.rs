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

//! Options controlling the connection and the mirror run.

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::capability::HashAlgorithm;

/// When to verify downloads against a server-side checksum.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum VerifyMode {
    /// Verify only if the server advertises a checksum command.
    Auto,
    /// Also try the legacy CRC commands when the server did not advertise them.
    Always,
    /// Never ask the server for checksums.
    Never,
}

impl Default for VerifyMode {
    fn default() -> Self {
        VerifyMode::Auto
    }
}

impl FromStr for VerifyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(VerifyMode::Auto),
            "always" | "true" | "on" => Ok(VerifyMode::Always),
            "never" | "false" | "off" => Ok(VerifyMode::Never),
            other => Err(anyhow::anyhow!("unknown verify mode {:?}", other)),
        }
    }
}

impl fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VerifyMode::Auto => "auto",
            VerifyMode::Always => "always",
            VerifyMode::Never => "never",
        })
    }
}

/// How many times to try an operation, and how long to wait in between.
///
/// The same policy applies to every class of operation: connecting, listing,
/// size queries, checksum queries and transfers. The wait before the next
/// attempt grows linearly: `base_delay * attempt`.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(0),
        }
    }

    /// Attempt numbers, starting from 1.
    pub fn attempts(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.max_attempts.max(1)
    }

    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts.max(1)
    }

    /// Sleep after a failed `attempt`, before trying again.
    pub fn backoff(&self, attempt: u32) {
        let delay = self.base_delay * attempt;
        if delay > Duration::from_secs(0) {
            debug!("wait {:?} before attempt {}", delay, attempt + 1);
            thread::sleep(delay);
        }
    }
}

/// Options for connecting to the server and mirroring files.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Options {
    /// Use passive-mode data connections.
    pub passive: bool,

    /// Timeout for connecting and for each read or write on the sockets.
    pub timeout: Duration,

    pub retry: RetryPolicy,

    /// Size of each block read from the data connection.
    pub block_size: usize,

    /// Continue partially downloaded files from their current length.
    pub resume: bool,

    /// Don't download files whose local length equals the remote length.
    pub skip_same_size: bool,

    /// When a file is downloaded afresh, remove a stale local file whose
    /// length differs from the remote before putting the new one in place.
    pub overwrite_on_size_difference: bool,

    /// Set the local modification time from the listing.
    pub set_mtime: bool,

    pub verify: VerifyMode,

    /// Checksum algorithms to ask the server for, most preferred first.
    pub hash_preference: Vec<HashAlgorithm>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            passive: true,
            timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            block_size: 1 << 20,
            resume: true,
            skip_same_size: true,
            overwrite_on_size_difference: false,
            set_mtime: true,
            verify: VerifyMode::Auto,
            hash_preference: HashAlgorithm::DEFAULT_PREFERENCE.to_vec(),
        }
    }
}

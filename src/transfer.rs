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

//! Download one file: resume or start fresh, retry on broken connections,
//! verify, and reload once if the checksum doesn't match.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::capability::HashAlgorithm;
use crate::checksum::{file_checksum, same_digest};
use crate::localtree::{file_len, open_for_write, part_path, persist, remove_quietly, set_mtime};
use crate::manager::ConnectionManager;
use crate::options::{Options, VerifyMode};
use crate::oracle::{reference_checksum, Reference};
use crate::proto::is_transport_failure;
use crate::Result;

const MIB: f64 = (1 << 20) as f64;

/// Elapsed times are never reported as zero, so rates stay finite.
const MIN_SECONDS: f64 = 1e-6;

/// What was done to a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Downloaded,
    /// Continued from a restart offset.
    Resumed,
    /// Downloaded again after a checksum mismatch.
    Redownloaded,
    SkippedSameSize,
    None,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Downloaded => "downloaded",
            Action::Resumed => "resumed",
            Action::Redownloaded => "re-downloaded",
            Action::SkippedSameSize => "skipped_same_size",
            Action::None => "none",
        })
    }
}

/// How well a file's content was checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verification {
    /// The local checksum matches the server's.
    Ok(HashAlgorithm),
    /// The checksum still didn't match after reloading.
    Fail(HashAlgorithm),
    /// The server gave no checksum, so only the size was checked.
    SizeOnly,
    /// Checksums are turned off.
    Skipped,
}

impl Verification {
    /// The content is known to differ from the server's.
    pub fn is_failure(self) -> bool {
        matches!(self, Verification::Fail(_))
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verification::Ok(algo) => write!(f, "OK ({})", algo),
            Verification::Fail(algo) => write!(f, "FAIL ({})", algo),
            Verification::SizeOnly => f.write_str("SIZE_ONLY"),
            Verification::Skipped => f.write_str("SKIPPED"),
        }
    }
}

/// The result of visiting one file.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferOutcome {
    pub action: Action,
    pub bytes_transferred: u64,
    pub elapsed_seconds: f64,
    /// MiB per second.
    pub throughput_mbps: f64,
    pub verification: Verification,
}

impl TransferOutcome {
    /// A file that was left as it was.
    pub fn skipped(verification: Verification) -> TransferOutcome {
        TransferOutcome {
            action: Action::SkippedSameSize,
            bytes_transferred: 0,
            elapsed_seconds: 0.0,
            throughput_mbps: 0.0,
            verification,
        }
    }

    fn new(action: Action, fetched: &Fetched, verification: Verification) -> TransferOutcome {
        TransferOutcome {
            action,
            bytes_transferred: fetched.bytes,
            elapsed_seconds: fetched.seconds,
            throughput_mbps: fetched.bytes as f64 / MIB / fetched.seconds,
            verification,
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}; {:.2} MiB in {:.2}s @ {:.2} MiB/s; VERIFY: {}",
            self.action,
            self.bytes_transferred as f64 / MIB,
            self.elapsed_seconds,
            self.throughput_mbps,
            self.verification
        )
    }
}

/// Where the bytes go and what to do when a transfer is interrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Plan {
    /// Append to the existing local file from its current length.
    Resume,
    /// Write a `.part` sibling from byte zero, then rename it into place.
    Fresh {
        replace_existing: bool,
        resume_on_retry: bool,
    },
}

/// Bytes and time for one complete transfer, including its retries.
#[derive(Clone, Copy, Debug)]
struct Fetched {
    bytes: u64,
    seconds: f64,
    /// Some attempt started from a nonzero offset.
    resumed: bool,
}

/// Counts bytes on their way to a file, and remembers whether the file
/// itself failed, as opposed to the connection.
struct CountingWriter<W> {
    inner: W,
    count: u64,
    local_error: Option<io::ErrorKind>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Ok(n) => {
                self.count += n as u64;
                Ok(n)
            }
            Err(err) => {
                self.local_error = Some(err.kind());
                Err(err)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().map_err(|err| {
            self.local_error = Some(err.kind());
            err
        })
    }
}

/// Downloads and verifies single files.
pub struct TransferEngine<'o> {
    options: &'o Options,
}

impl<'o> TransferEngine<'o> {
    pub fn new(options: &'o Options) -> TransferEngine<'o> {
        TransferEngine { options }
    }

    /// Download the remote file at absolute `remote_path` to `local_path`,
    /// then verify it.
    ///
    /// A nonempty local file is resumed if resume is enabled. Otherwise the
    /// file is fetched afresh into a `.part` sibling, and `remote_size` is
    /// used only to decide whether a stale local file of a different size is
    /// removed before the new one is renamed into place.
    ///
    /// Returns an error if the transfer can't be completed within the retry
    /// policy. A checksum that still fails after one reload is reported in
    /// the outcome, not as an error.
    pub fn download(
        &self,
        manager: &mut ConnectionManager,
        remote_path: &str,
        local_path: &Path,
        remote_size: Option<u64>,
        modify_time: Option<DateTime<Utc>>,
    ) -> Result<TransferOutcome> {
        let plan = self.decide(local_path, remote_size);
        debug!("{} -> {:?}: {:?}", remote_path, local_path, plan);
        let mut fetched = self.transfer(manager, remote_path, local_path, plan)?;
        let mut action = if fetched.resumed {
            Action::Resumed
        } else {
            Action::Downloaded
        };

        let verification = match self.reference(manager, remote_path) {
            None if self.options.verify == VerifyMode::Never => Verification::Skipped,
            None => Verification::SizeOnly,
            Some(reference) if local_matches(local_path, &reference)? => {
                Verification::Ok(reference.algorithm)
            }
            Some(reference) => {
                warn!(
                    "{} mismatch on {:?}; downloading it again",
                    reference.algorithm, remote_path
                );
                remove_quietly(local_path);
                let reload = Plan::Fresh {
                    replace_existing: true,
                    resume_on_retry: false,
                };
                let reloaded = self.transfer(manager, remote_path, local_path, reload)?;
                if local_matches(local_path, &reference)? {
                    action = Action::Redownloaded;
                    fetched = reloaded;
                    Verification::Ok(reference.algorithm)
                } else {
                    warn!(
                        "{} still doesn't match on {:?}; keeping the download",
                        reference.algorithm, remote_path
                    );
                    Verification::Fail(reference.algorithm)
                }
            }
        };

        if self.options.set_mtime {
            if let Some(mtime) = modify_time {
                if let Err(err) = set_mtime(local_path, mtime) {
                    debug!("{:#}", err);
                }
            }
        }
        Ok(TransferOutcome::new(action, &fetched, verification))
    }

    /// Check a local file believed to be complete against the server's
    /// checksum, without downloading anything.
    ///
    /// A mismatch is reported as `Verification::Fail`.
    pub fn verify_local(
        &self,
        manager: &mut ConnectionManager,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<Verification> {
        Ok(match self.reference(manager, remote_path) {
            None if self.options.verify == VerifyMode::Never => Verification::Skipped,
            None => Verification::SizeOnly,
            Some(reference) if local_matches(local_path, &reference)? => {
                Verification::Ok(reference.algorithm)
            }
            Some(reference) => Verification::Fail(reference.algorithm),
        })
    }

    fn reference(&self, manager: &mut ConnectionManager, remote_path: &str) -> Option<Reference> {
        reference_checksum(manager, remote_path, self.options.verify)
    }

    fn decide(&self, local_path: &Path, remote_size: Option<u64>) -> Plan {
        let local_len = file_len(local_path);
        match local_len {
            Some(len) if self.options.resume && len > 0 => Plan::Resume,
            Some(len) => Plan::Fresh {
                replace_existing: self.options.overwrite_on_size_difference
                    && remote_size.map_or(false, |remote| remote != len),
                resume_on_retry: self.options.resume,
            },
            None => Plan::Fresh {
                replace_existing: false,
                resume_on_retry: self.options.resume,
            },
        }
    }

    fn transfer(
        &self,
        manager: &mut ConnectionManager,
        remote_path: &str,
        local_path: &Path,
        plan: Plan,
    ) -> Result<Fetched> {
        match plan {
            Plan::Resume => self.fetch(manager, remote_path, local_path, true, true),
            Plan::Fresh {
                replace_existing,
                resume_on_retry,
            } => {
                let part = part_path(local_path);
                remove_quietly(&part);
                let fetched = self.fetch(manager, remote_path, &part, false, resume_on_retry)?;
                persist(&part, local_path, replace_existing)?;
                Ok(fetched)
            }
        }
    }

    /// Retrieve into `target`, retrying on transport failures.
    ///
    /// The first attempt appends if `append`. Later attempts continue from
    /// what's already in `target` if `resume_on_retry`, and otherwise start
    /// over.
    fn fetch(
        &self,
        manager: &mut ConnectionManager,
        remote_path: &str,
        target: &Path,
        append: bool,
        resume_on_retry: bool,
    ) -> Result<Fetched> {
        let retry = manager.retry_policy().clone();
        let started = Instant::now();
        let mut bytes = 0;
        let mut resumed = false;
        let mut last_err = None;
        for attempt in retry.attempts() {
            let (file, offset) = open_for_write(target, if attempt == 1 { append } else { resume_on_retry })?;
            if offset > 0 {
                debug!("restart {} at byte {}", remote_path, offset);
                resumed = true;
            }
            let mut out = CountingWriter {
                inner: file,
                count: 0,
                local_error: None,
            };
            let result = manager.session().and_then(|session| {
                session.retrieve(remote_path, offset, self.options.block_size, &mut out)
            });
            let result = result.and_then(|_| out.flush().map_err(anyhow::Error::from));
            bytes += out.count;
            match result {
                Ok(_) => {
                    return Ok(Fetched {
                        bytes,
                        seconds: started.elapsed().as_secs_f64().max(MIN_SECONDS),
                        resumed,
                    })
                }
                Err(err) if out.local_error.is_some() => {
                    return Err(err.context(format!("Failed to write {:?}", target)));
                }
                Err(err) if !is_transport_failure(&err) => {
                    return Err(err.context(format!("Failed to retrieve {:?}", remote_path)));
                }
                Err(err) => {
                    warn!(
                        "Transfer of {:?} interrupted on attempt {} after {} bytes: {:#}",
                        remote_path, attempt, out.count, err
                    );
                    last_err = Some(err);
                    if !retry.is_last(attempt) {
                        manager.reconnect()?;
                        retry.backoff(attempt);
                    }
                }
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("no transfer attempts made"));
        Err(err.context(format!(
            "Failed to download {:?} after {} attempts",
            remote_path,
            retry.max_attempts.max(1)
        )))
    }
}

fn local_matches(local_path: &Path, reference: &Reference) -> Result<bool> {
    let local = file_checksum(local_path, reference.algorithm)
        .with_context(|| format!("Failed to verify {:?}", local_path))?;
    trace!(
        "{} local {} remote {}",
        reference.algorithm,
        local,
        reference.digest
    );
    Ok(same_digest(&local, &reference.digest))
}

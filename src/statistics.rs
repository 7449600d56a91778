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

//! Statistics/counter structs.

use std::fmt;

use chrono::{DateTime, Local};

use crate::transfer::TransferOutcome;

const MIB: f64 = (1 << 20) as f64;
const GIB: f64 = (1 << 30) as f64;

/// Counters accumulated over one mirror run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MirrorStats {
    /// Bytes actually received, not counting skipped files.
    pub total_bytes: u64,
    /// Time spent transferring, not counting listing or skipped files.
    pub total_seconds: f64,
    /// Files visited, including skipped and failed ones.
    pub total_files: u64,
    /// Directories visited, including the root.
    pub total_dirs: u64,
    /// Files that could not be brought up to date.
    pub failed_files: u64,
}

impl MirrorStats {
    /// Add the bytes and time from one transfer.
    pub fn record(&mut self, outcome: &TransferOutcome) {
        self.total_bytes += outcome.bytes_transferred;
        self.total_seconds += outcome.elapsed_seconds;
    }

    /// Average transfer rate in MiB/s, or zero if nothing was transferred.
    pub fn average_mibps(&self) -> f64 {
        if self.total_seconds > 0.0 {
            self.total_bytes as f64 / MIB / self.total_seconds
        } else {
            0.0
        }
    }
}

/// The report printed at the end of a run.
#[derive(Clone, Debug)]
pub struct Summary {
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub stats: MirrorStats,
    /// Space used by the whole local tree afterwards.
    pub local_usage_bytes: u64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
        let minutes = (self.finished - self.started).num_minutes().max(0);
        writeln!(f, "===== Summary =====")?;
        writeln!(f, "Started:  {}", self.started.format(TIME_FORMAT))?;
        writeln!(f, "Finished: {}", self.finished.format(TIME_FORMAT))?;
        writeln!(f, "Duration: {} hours {} minutes", minutes / 60, minutes % 60)?;
        writeln!(f, "Directories: {}", self.stats.total_dirs)?;
        writeln!(f, "Files: {}", self.stats.total_files)?;
        writeln!(f, "Failed files: {}", self.stats.failed_files)?;
        writeln!(
            f,
            "Downloaded: {:.2} MiB",
            self.stats.total_bytes as f64 / MIB
        )?;
        writeln!(f, "Average rate: {:.2} MiB/s", self.stats.average_mibps())?;
        writeln!(
            f,
            "Local storage used: {:.2} GiB",
            self.local_usage_bytes as f64 / GIB
        )?;
        write!(f, "===================")
    }
}

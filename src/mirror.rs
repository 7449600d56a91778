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

//! Walk the remote tree depth-first and bring the local tree up to date.

use std::path::Path;

use anyhow::bail;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::display::DisplayPaths;
use crate::listing::{list_dir, RemoteEntry};
use crate::localtree::{file_len, is_safe_name, remove_quietly, LocalTree};
use crate::manager::ConnectionManager;
use crate::options::Options;
use crate::oracle::remote_size;
use crate::statistics::MirrorStats;
use crate::transfer::{Action, TransferEngine, TransferOutcome};
use crate::Result;

const MIB: f64 = (1 << 20) as f64;

/// Mirrors one remote directory tree into a local directory.
pub struct Mirror<'o> {
    options: &'o Options,
    display: DisplayPaths,
}

impl<'o> Mirror<'o> {
    pub fn new(options: &'o Options) -> Mirror<'o> {
        Mirror {
            options,
            display: DisplayPaths::default(),
        }
    }

    /// Set how paths are shown in log messages.
    pub fn with_display(mut self, display: DisplayPaths) -> Self {
        self.display = display;
        self
    }

    /// Mirror everything under `remote_root` into `local_root`.
    ///
    /// Failures on single files or directories are logged and counted, and
    /// the walk carries on. An error is returned only if the connection
    /// can't be re-established at all.
    pub fn run<P: AsRef<Path>>(
        &self,
        manager: &mut ConnectionManager,
        remote_root: &str,
        local_root: P,
    ) -> Result<MirrorStats> {
        let tree = LocalTree::new(local_root.as_ref());
        tree.ensure_dir("")?;
        let mut walk = Walk {
            mirror: self,
            engine: TransferEngine::new(self.options),
            tree,
            manager,
            stats: MirrorStats::default(),
        };
        walk.visit_dir(&normalize_remote(remote_root), "")?;
        Ok(walk.stats)
    }
}

/// State for one run.
struct Walk<'a, 'o> {
    mirror: &'a Mirror<'o>,
    engine: TransferEngine<'o>,
    tree: LocalTree,
    manager: &'a mut ConnectionManager,
    stats: MirrorStats,
}

impl<'a, 'o> Walk<'a, 'o> {
    fn show(&self, remote_path: &str) -> String {
        self.mirror.display.format(remote_path)
    }

    /// Mirror the absolute remote directory `remote` into the local directory
    /// at `relative` under the root.
    fn visit_dir(&mut self, remote: &str, relative: &str) -> Result<()> {
        self.stats.total_dirs += 1;
        info!("[DIR] {}", self.show(remote));
        self.manager.keep_alive()?;
        let entries = match list_dir(self.manager, remote) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Skipping directory {}: {:#}", self.show(remote), err);
                return Ok(());
            }
        };
        let (dirs, files): (Vec<RemoteEntry>, Vec<RemoteEntry>) = entries
            .into_iter()
            .filter(|entry| {
                let safe = is_safe_name(&entry.name);
                if !safe {
                    warn!("Skipping unsafe name {:?} in {}", entry.name, self.show(remote));
                }
                safe
            })
            .partition(RemoteEntry::is_dir);

        for dir in &dirs {
            let child_remote = join_remote(remote, &dir.name);
            let child_relative = join_relative(relative, &dir.name);
            if let Err(err) = self.tree.ensure_dir(&child_relative) {
                warn!("{:#}", err);
                continue;
            }
            self.visit_dir(&child_remote, &child_relative)?;
        }

        for file in &files {
            let remote_path = join_remote(remote, &file.name);
            let local_path = self.tree.local_path(&join_relative(relative, &file.name));
            self.stats.total_files += 1;
            match self.visit_file(file, &remote_path, &local_path) {
                Ok(outcome) => {
                    self.stats.record(&outcome);
                    if outcome.verification.is_failure() {
                        self.stats.failed_files += 1;
                    }
                    info!("-> {}", outcome);
                }
                Err(err) => {
                    self.stats.failed_files += 1;
                    warn!("Download failed: {}: {:#}", self.show(&remote_path), err);
                }
            }
        }
        Ok(())
    }

    fn visit_file(
        &mut self,
        entry: &RemoteEntry,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<TransferOutcome> {
        self.manager.keep_alive()?;
        let size = remote_size(self.manager, remote_path, entry.size);
        match size {
            Some(size) => info!("[FILE] {} ({:.2} MiB)", self.show(remote_path), size as f64 / MIB),
            None => info!("[FILE] {} (size unknown)", self.show(remote_path)),
        }
        let local_len = file_len(local_path);

        let outcome = match (size, local_len) {
            (Some(remote), Some(local)) if self.mirror.options.skip_same_size && remote == local => {
                let verification = self.engine.verify_local(self.manager, remote_path, local_path)?;
                if verification.is_failure() {
                    warn!(
                        "Same size but {}; downloading {} again",
                        verification,
                        self.show(remote_path)
                    );
                    remove_quietly(local_path);
                    let mut outcome = self.engine.download(
                        self.manager,
                        remote_path,
                        local_path,
                        size,
                        entry.modify_time,
                    )?;
                    if outcome.action == Action::Downloaded {
                        outcome.action = Action::Redownloaded;
                    }
                    outcome
                } else {
                    TransferOutcome::skipped(verification)
                }
            }
            _ => self.engine.download(
                self.manager,
                remote_path,
                local_path,
                size,
                entry.modify_time,
            )?,
        };

        if let Some(expected) = size {
            let actual = file_len(local_path).unwrap_or(0);
            if actual != expected {
                remove_quietly(local_path);
                bail!(
                    "Local size {} doesn't match remote size {}; removed {:?}",
                    actual,
                    expected,
                    local_path
                );
            }
        }
        Ok(outcome)
    }
}

/// Make `path` absolute, without `.`, `..` or repeated slashes.
fn normalize_remote(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => (),
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn join_relative(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", dir, name)
    }
}

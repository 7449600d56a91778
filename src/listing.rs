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

//! Remote directory listings and entries.

use std::fmt;

use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::manager::ConnectionManager;
use crate::proto::is_transport_failure;
use crate::session::Session;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

/// One entry in a remote directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Name within its directory.
    pub name: String,
    pub kind: EntryKind,
    /// Length in bytes, if the listing gave one.
    pub size: Option<u64>,
    /// Modification time, if the listing gave one.
    pub modify_time: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    fn new(name: &str, kind: EntryKind) -> RemoteEntry {
        RemoteEntry {
            name: name.to_owned(),
            kind,
            size: None,
            modify_time: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Display like `ls`: kind, size, time and name.
impl fmt::Display for RemoteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_dir() { 'd' } else { '-' };
        let size = self.size.map(|s| s.to_string()).unwrap_or_default();
        let mtime = self
            .modify_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        write!(f, "{} {:>11} {:19} {}", kind, size, mtime, self.name)
    }
}

/// The `type` fact of a machine-readable listing line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FactType {
    File,
    Dir,
    CurrentDir,
    ParentDir,
    /// Missing, or something we don't understand such as `OS.unix=slink`.
    Unknown,
}

/// A parsed `MLSD` line.
#[derive(Debug, PartialEq, Eq)]
struct MachineEntry {
    name: String,
    fact_type: FactType,
    size: Option<u64>,
    modify: Option<DateTime<Utc>>,
}

/// Parse a line like `type=file;size=1024;modify=20200101120000; name`.
///
/// Fact names are case-insensitive. The name follows the first space and may
/// itself contain spaces and semicolons.
fn parse_mlsd_line(line: &str) -> Option<MachineEntry> {
    let (facts, name) = line.split_at(line.find(' ')?);
    let name = &name[1..];
    if name.is_empty() {
        return None;
    }
    let mut entry = MachineEntry {
        name: name.to_owned(),
        fact_type: FactType::Unknown,
        size: None,
        modify: None,
    };
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let (key, value) = match fact.find('=') {
            Some(i) => (&fact[..i], &fact[i + 1..]),
            None => continue,
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                entry.fact_type = match value.to_ascii_lowercase().as_str() {
                    "file" => FactType::File,
                    "dir" => FactType::Dir,
                    "cdir" => FactType::CurrentDir,
                    "pdir" => FactType::ParentDir,
                    _ => FactType::Unknown,
                }
            }
            "size" | "sizd" => entry.size = entry.size.or_else(|| value.parse().ok()),
            "modify" => entry.modify = parse_modify(value),
            _ => (),
        }
    }
    Some(entry)
}

/// Parse an `MLSD` timestamp, `YYYYMMDDHHMMSS[.sss]` in UTC.
pub fn parse_modify(value: &str) -> Option<DateTime<Utc>> {
    let seconds = value.get(..14)?;
    let naive = NaiveDateTime::parse_from_str(seconds, "%Y%m%d%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// One way of listing the current remote directory.
trait ListStrategy {
    fn name(&self) -> &'static str;

    /// List `dir`, which is already the session's current directory.
    fn list(&self, session: &mut dyn Session, dir: &str) -> Result<Vec<RemoteEntry>>;
}

/// `MLSD`: names, types, sizes and times in one go.
struct MachineListing;

impl ListStrategy for MachineListing {
    fn name(&self) -> &'static str {
        "MLSD"
    }

    fn list(&self, session: &mut dyn Session, dir: &str) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        for line in session.mlsd()? {
            let me = match parse_mlsd_line(&line) {
                Some(me) => me,
                None => {
                    debug!("ignore unparseable MLSD line {:?}", line);
                    continue;
                }
            };
            if me.name == "." || me.name == ".." {
                continue;
            }
            let kind = match me.fact_type {
                FactType::CurrentDir | FactType::ParentDir => continue,
                FactType::Dir => EntryKind::Dir,
                FactType::File => EntryKind::File,
                FactType::Unknown => probe_kind(session, dir, &me.name)?,
            };
            entries.push(RemoteEntry {
                name: me.name,
                kind,
                size: me.size,
                modify_time: me.modify,
            });
        }
        Ok(entries)
    }
}

/// `NLST`, then find out which names are directories by trying to enter them.
struct NameListing;

impl ListStrategy for NameListing {
    fn name(&self) -> &'static str {
        "NLST"
    }

    fn list(&self, session: &mut dyn Session, dir: &str) -> Result<Vec<RemoteEntry>> {
        let names = match session.nlst() {
            Ok(names) => names,
            // Some servers refuse to list an empty directory.
            Err(err) if !is_transport_failure(&err) => {
                debug!("NLST in {} refused, treating as empty: {:#}", dir, err);
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        let mut entries = Vec::new();
        for name in names {
            // Some servers return paths rather than names.
            let name = name.rsplit('/').next().unwrap_or_default();
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            let kind = probe_kind(session, dir, name)?;
            entries.push(RemoteEntry::new(name, kind));
        }
        Ok(entries)
    }
}

/// Decide whether `name` in `dir` is a directory by changing into it and back.
fn probe_kind(session: &mut dyn Session, dir: &str, name: &str) -> Result<EntryKind> {
    match session.cwd(name) {
        Ok(()) => {
            session
                .cwd(dir)
                .with_context(|| format!("Failed to return to {:?} after probing", dir))?;
            Ok(EntryKind::Dir)
        }
        Err(err) if is_transport_failure(&err) => Err(err),
        Err(_) => Ok(EntryKind::File),
    }
}

fn list_once(session: &mut dyn Session, dir: &str) -> Result<Vec<RemoteEntry>> {
    session
        .cwd(dir)
        .with_context(|| format!("Failed to change to {:?}", dir))?;
    let strategies: [&dyn ListStrategy; 2] = [&MachineListing, &NameListing];
    let mut last_err = None;
    for strategy in &strategies {
        match strategy.list(session, dir) {
            Ok(entries) => {
                trace!("{} listed {} entries in {}", strategy.name(), entries.len(), dir);
                return Ok(entries);
            }
            Err(err) => {
                debug!("{} failed in {}: {:#}", strategy.name(), dir, err);
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("no listing strategy")))
}

/// List the entries of the absolute remote directory `dir`.
///
/// Transport failures are retried on a fresh connection up to the retry
/// policy. An error means the directory could not be listed; the caller
/// should give up on it.
pub fn list_dir(manager: &mut ConnectionManager, dir: &str) -> Result<Vec<RemoteEntry>> {
    let retry = manager.retry_policy().clone();
    let mut last_err = None;
    for attempt in retry.attempts() {
        let session = manager.session()?;
        match list_once(session, dir) {
            Ok(entries) => return Ok(entries),
            Err(err) if !is_transport_failure(&err) => return Err(err),
            Err(err) => {
                debug!("listing {} failed on attempt {}: {:#}", dir, attempt, err);
                last_err = Some(err);
                if !retry.is_last(attempt) {
                    manager.reconnect()?;
                    retry.backoff(attempt);
                }
            }
        }
    }
    let err = last_err.unwrap_or_else(|| anyhow!("no listing attempts made"));
    Err(err.context(format!(
        "Failed to list {:?} after {} attempts",
        dir,
        retry.max_attempts.max(1)
    )))
}

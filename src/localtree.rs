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

//! Facade for local-filesystem operations.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use filetime::FileTime;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::Result;

/// Suffix of the file a fresh download is written to before it's complete.
const PART_SUFFIX: &str = ".part";

/// A filesystem tree local to this process: the destination for downloads.
///
/// All local IO is funneled through this layer so that it can be observed
/// and so filenames can be checked.
#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
}

impl LocalTree {
    /// Construct a new LocalTree addressing a local directory.
    pub fn new<P: Into<PathBuf>>(root: P) -> LocalTree {
        LocalTree { root: root.into() }
    }

    /// Local path for a slash-separated path relative to the mirror root.
    pub fn local_path(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|p| !p.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Make sure the directory for `relative` exists, returning its path.
    pub fn ensure_dir(&self, relative: &str) -> Result<PathBuf> {
        let path = self.local_path(relative);
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create directory {:?}", path))?;
        Ok(path)
    }
}

/// True if a remote name can be used as a single local path component.
pub fn is_safe_name(name: &str) -> bool {
    !(name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\'))
}

/// Length of a regular file, or None if there isn't one.
pub fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

/// The temporary sibling a fresh download of `path` is written to.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(PART_SUFFIX);
    path.with_file_name(name)
}

/// Open `path` for writing a download.
///
/// If `append` the existing content is kept and the returned offset is its
/// length; otherwise the file is truncated and the offset is 0.
pub fn open_for_write(path: &Path, append: bool) -> Result<(File, u64)> {
    if append {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {:?} for append", path))?;
        let len = file
            .metadata()
            .with_context(|| format!("Failed to stat {:?}", path))?
            .len();
        Ok((file, len))
    } else {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        Ok((file, 0))
    }
}

/// Move a finished download to its final name.
///
/// If `replace_existing`, any file already at `final_path` is removed first.
pub fn persist(part: &Path, final_path: &Path, replace_existing: bool) -> Result<()> {
    if replace_existing && final_path.exists() {
        remove_quietly(final_path);
    }
    fs::rename(part, final_path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", part, final_path))
}

/// Remove a file, ignoring any error.
pub fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!("failed to remove {:?}: {}", path, err);
        }
    }
}

/// Set the modification (and access) time of a local file.
pub fn set_mtime(path: &Path, mtime: DateTime<Utc>) -> Result<()> {
    let ft = FileTime::from_unix_time(mtime.timestamp(), mtime.timestamp_subsec_nanos());
    filetime::set_file_times(path, ft, ft)
        .with_context(|| format!("Failed to set mtime of {:?}", path))
}

/// Total bytes of all files under `root`.
pub fn disk_usage(root: &Path) -> u64 {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|m| m.len())
        .sum()
}

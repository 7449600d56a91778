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

//! Log helper functions.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};

use crate::Result;

pub fn format_log(out: fern::FormatCallback, args: &fmt::Arguments, record: &log::Record) {
    let level = record.level().to_string();
    out.finish(format_args!(
        "[{}][{}] {}",
        Local::now().format("%H:%M:%S"),
        &level[..1],
        args
    ))
}

/// Where to write the log for a run mirroring into `local_root`.
///
/// The log goes next to the local root rather than inside it, named
/// `YYYY-MM-DD_HH-MM-SS-<root name>.log`.
pub fn log_file_path(local_root: &Path, now: DateTime<Local>) -> PathBuf {
    let name = local_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mirror".to_owned());
    let parent = match local_root.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_owned(),
        _ => PathBuf::from("."),
    };
    parent.join(format!("{}-{}.log", now.format("%Y-%m-%d_%H-%M-%S"), name))
}

/// Log to stdout, and also to `log_file` if given.
pub fn default_logging(level: log::LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(format_log)
        .level(level)
        .chain(std::io::stdout());
    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {:?}", parent))?;
        }
        dispatch = dispatch.chain(
            fern::log_file(path).with_context(|| format!("Failed to open log file {:?}", path))?,
        );
    }
    dispatch.apply().context("Failed to configure logger")
}

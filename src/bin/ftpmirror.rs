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

//! Command-line program for ftpmirror.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use structopt::StructOpt;

use ftpmirror::display::{DisplayPaths, Ellipsis};
use ftpmirror::logging::{default_logging, log_file_path};
use ftpmirror::{
    disk_usage, Address, ConnectionManager, FtpConnector, HashAlgorithm, Mirror, Options,
    RetryPolicy, Summary, VerifyMode,
};

#[derive(Debug, StructOpt)]
#[structopt()]
/// [pre-alpha] Resumable, verifying FTP mirror
///
/// Copies a remote directory tree onto local disk, resuming interrupted
/// downloads, reconnecting when the server drops the connection, and
/// checking files against server-side checksums where available.
struct Opt {
    /// Server and remote directory: ftp://[user[:password]@]host[:port]/path,
    /// host:/path, or host.
    address: Address,

    /// Local directory to mirror into.
    local_root: PathBuf,

    /// User name, overriding any in the address.
    #[structopt(long)]
    user: Option<String>,

    /// Password, overriding any in the address.
    #[structopt(long)]
    password: Option<String>,

    /// Use active mode (PORT/EPRT) instead of passive data connections.
    #[structopt(long)]
    active: bool,

    /// Network timeout in seconds.
    #[structopt(long, default_value = "300")]
    timeout: u64,

    /// Attempts per operation before giving up.
    #[structopt(long, default_value = "3")]
    retries: u32,

    /// Base delay between attempts in seconds; grows with each attempt.
    #[structopt(long, default_value = "2")]
    retry_delay: u64,

    /// Transfer block size in bytes.
    #[structopt(long, default_value = "1048576")]
    block_size: usize,

    /// Always download partial files from the start.
    #[structopt(long)]
    no_resume: bool,

    /// Download files even when the local copy has the same size.
    #[structopt(long)]
    no_skip_same_size: bool,

    /// Remove a stale local file whose size differs from the server's before
    /// putting a fresh download in place.
    #[structopt(long)]
    overwrite_on_size_difference: bool,

    /// Don't set local modification times from the server.
    #[structopt(long)]
    no_mtime: bool,

    /// Checksum verification: auto, always or never.
    #[structopt(long, default_value = "auto")]
    verify: VerifyMode,

    /// Checksum algorithms to ask for, most preferred first.
    #[structopt(long, use_delimiter = true)]
    hash: Vec<HashAlgorithm>,

    /// Show remote paths starting with this prefix...
    #[structopt(long)]
    display_prefix: Option<String>,

    /// ...with this instead.
    #[structopt(long)]
    display_replace: Option<String>,

    /// Shorten displayed paths to this many characters; 0 for no limit.
    #[structopt(long, default_value = "0")]
    display_max_len: usize,

    /// Where to cut long displayed paths: left, middle or right.
    #[structopt(long, default_value = "middle")]
    display_ellipsis: Ellipsis,

    /// More logging: -v for debug, -vv for trace.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,

    /// Log only to stdout, without a log file beside the local directory.
    #[structopt(long)]
    no_log_file: bool,

    /// Don't log the program name and version at startup.
    #[structopt(long)]
    no_header: bool,
}

impl Opt {
    fn options(&self) -> Options {
        let defaults = Options::default();
        Options {
            passive: !self.active,
            timeout: Duration::from_secs(self.timeout),
            retry: RetryPolicy {
                max_attempts: self.retries,
                base_delay: Duration::from_secs(self.retry_delay),
            },
            block_size: self.block_size,
            resume: !self.no_resume,
            skip_same_size: !self.no_skip_same_size,
            overwrite_on_size_difference: self.overwrite_on_size_difference,
            set_mtime: !self.no_mtime,
            verify: self.verify,
            hash_preference: if self.hash.is_empty() {
                defaults.hash_preference
            } else {
                self.hash.clone()
            },
        }
    }

    fn address(&self) -> Address {
        let mut address = self.address.clone();
        if let Some(user) = &self.user {
            address.set_user(user);
        }
        if let Some(password) = &self.password {
            address.set_password(password);
        }
        address
    }

    fn display(&self) -> DisplayPaths {
        DisplayPaths {
            rewrite: match (&self.display_prefix, &self.display_replace) {
                (Some(from), Some(to)) => Some((from.clone(), to.clone())),
                _ => None,
            },
            max_len: self.display_max_len,
            ellipsis: self.display_ellipsis,
        }
    }

    fn level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

fn log_header() {
    info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    if let Ok(exe) = std::env::current_exe() {
        info!("Executable: {}", exe.display());
    }
    if let Ok(cwd) = std::env::current_dir() {
        info!("Working directory: {}", cwd.display());
    }
}

fn main() -> ftpmirror::Result<()> {
    let opt = Opt::from_args();
    let started = Local::now();
    let log_file = if opt.no_log_file {
        None
    } else {
        Some(log_file_path(&opt.local_root, started))
    };
    default_logging(opt.level(), log_file.as_deref())?;
    if let Some(path) = &log_file {
        info!("Logging to {}", path.display());
    }
    if !opt.no_header {
        log_header();
    }

    let options = opt.options();
    let address = opt.address();
    let display = opt.display();
    info!(
        "Mirroring {} from {} into {}",
        display.format(address.path()),
        address,
        opt.local_root.display()
    );
    info!("Started: {}", started.format("%Y-%m-%d %H:%M:%S"));

    let connector = FtpConnector::new(address.clone(), options.clone());
    let mut manager = ConnectionManager::open(Box::new(connector), &options)
        .with_context(|| format!("Can't connect to {}", address))?;
    let result = Mirror::new(&options)
        .with_display(display)
        .run(&mut manager, address.path(), &opt.local_root);
    manager.close();
    let stats = result?;

    let summary = Summary {
        started,
        finished: Local::now(),
        stats,
        local_usage_bytes: disk_usage(&opt.local_root),
    };
    for line in summary.to_string().lines() {
        info!("{}", line);
    }
    Ok(())
}

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

//! Mirror a remote FTP directory tree onto local storage.
//!
//! A single control connection is kept alive, reconnected on failure, and
//! used to walk the remote tree depth-first. Files are downloaded with
//! restart offsets so interrupted transfers resume, and verified against a
//! server-side checksum when the server offers one.
//!
//! ```no_run
//! use ftpmirror::{Address, ConnectionManager, FtpConnector, Mirror, Options};
//!
//! let address: Address = "ftp://ftp.example.com/pub".parse().unwrap();
//! let options = Options::default();
//! let connector = FtpConnector::new(address.clone(), options.clone());
//! let mut manager = ConnectionManager::open(Box::new(connector), &options).unwrap();
//! let stats = Mirror::new(&options).run(&mut manager, address.path(), "pub").unwrap();
//! println!("{} files", stats.total_files);
//! ```

mod address;
mod capability;
mod checksum;
mod connection;
pub mod display;
mod listing;
mod localtree;
pub mod logging;
mod manager;
mod mirror;
mod options;
mod oracle;
mod proto;
mod session;
mod statistics;
mod transfer;

#[cfg(test)]
mod testutil;

pub use address::{Address, ParseAddressError};
pub use capability::{HashAlgorithm, ServerCapabilities};
pub use connection::{FtpConnector, FtpStream};
pub use listing::{EntryKind, RemoteEntry};
pub use localtree::disk_usage;
pub use manager::ConnectionManager;
pub use mirror::Mirror;
pub use options::{Options, RetryPolicy, VerifyMode};
pub use proto::ReplyError;
pub use session::{Connector, Session};
pub use statistics::{MirrorStats, Summary};
pub use transfer::{Action, TransferEngine, TransferOutcome, Verification};

/// General Result type from ftpmirror APIs.
pub type Result<T> = anyhow::Result<T>;

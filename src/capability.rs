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

//! Discover which server-side checksum commands a server supports.

use std::fmt;
use std::str::FromStr;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::session::Session;

/// Checksum algorithms the server can be asked for with `HASH`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum HashAlgorithm {
    Crc32,
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Cheapest first.
    pub const DEFAULT_PREFERENCE: [HashAlgorithm; 5] = [
        HashAlgorithm::Crc32,
        HashAlgorithm::Md5,
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha512,
    ];

    /// The name used in `FEAT` and `OPTS HASH`.
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Crc32 => "CRC32",
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Number of hex digits in a digest.
    pub fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Crc32 => 8,
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = anyhow::Error;

    /// Accepts the `FEAT` spelling, case-insensitively, with or without
    /// the dash.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "").to_ascii_uppercase().as_str() {
            "CRC32" => Ok(HashAlgorithm::Crc32),
            "MD5" => Ok(HashAlgorithm::Md5),
            "SHA1" => Ok(HashAlgorithm::Sha1),
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            _ => Err(anyhow::anyhow!("unknown hash algorithm {:?}", s)),
        }
    }
}

/// What a connected server can tell us about file checksums.
///
/// This belongs to one connection, and is recomputed after reconnecting.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct ServerCapabilities {
    /// `HASH` is available and `hash_algorithm` was selected with `OPTS HASH`.
    pub hash_supported: bool,
    pub hash_algorithm: Option<HashAlgorithm>,
    /// `XCRC` or `SITE CRC` was advertised.
    pub legacy_crc_supported: bool,
}

/// Ask the server for its features and select a checksum algorithm.
///
/// The first algorithm in `preference` that the server both advertises and
/// accepts becomes the session's active `HASH` algorithm. Failures are not
/// errors: they just leave the capability unset.
pub fn negotiate(session: &mut dyn Session, preference: &[HashAlgorithm]) -> ServerCapabilities {
    let mut caps = ServerCapabilities::default();
    let lines = match session.feat() {
        Ok(lines) => lines,
        Err(err) => {
            debug!("FEAT failed, assuming no checksum support: {:#}", err);
            return caps;
        }
    };
    let advertised = advertised_hash_algorithms(&lines);
    if !advertised.is_empty() {
        debug!("server offers HASH {:?}", advertised);
    }
    for &algo in preference {
        if !advertised.contains(&algo) {
            continue;
        }
        match session.quote(&format!("OPTS HASH {}", algo.name())) {
            Ok(_) => {
                caps.hash_supported = true;
                caps.hash_algorithm = Some(algo);
                break;
            }
            Err(err) => debug!("server refused OPTS HASH {}: {:#}", algo, err),
        }
    }
    caps.legacy_crc_supported = advertises_legacy_crc(&lines);
    debug!("negotiated {:?}", caps);
    caps
}

/// Algorithms listed on the `HASH` feature line, e.g.
/// ` HASH SHA-1;SHA-256*;MD5;CRC32` where `*` marks the current default.
fn advertised_hash_algorithms(lines: &[String]) -> Vec<HashAlgorithm> {
    lines
        .iter()
        .map(|l| l.trim())
        .find(|l| l.get(..4).map_or(false, |w| w.eq_ignore_ascii_case("HASH")))
        .and_then(|l| l.split_whitespace().nth(1))
        .map(|algos| {
            algos
                .split(';')
                .filter_map(|a| a.trim().trim_end_matches('*').parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn advertises_legacy_crc(lines: &[String]) -> bool {
    lines.iter().map(|l| l.to_ascii_uppercase()).any(|l| {
        l.contains("XCRC") || (l.contains("SITE") && l.contains("CRC"))
    })
}

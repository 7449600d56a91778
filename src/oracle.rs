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

//! Ask the server what size a file is, and what its checksum should be.
//!
//! Both are advisory: if the server can't say, the answer is `None` and the
//! mirror carries on with less checking.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::capability::{HashAlgorithm, ServerCapabilities};
use crate::manager::ConnectionManager;
use crate::options::VerifyMode;
use crate::proto::is_transport_failure;
use crate::session::Session;
use crate::Result;

/// Commands that return a CRC-32 on servers that predate `HASH`.
const LEGACY_CRC_COMMANDS: [&str; 2] = ["XCRC", "SITE CRC"];

/// The server's checksum for a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub algorithm: HashAlgorithm,
    /// Lowercase hex.
    pub digest: String,
}

/// Find the length of the remote file at absolute `path`.
///
/// `listed` is the size from the directory listing, used if present.
pub fn remote_size(manager: &mut ConnectionManager, path: &str, listed: Option<u64>) -> Option<u64> {
    if listed.is_some() {
        return listed;
    }
    let retry = manager.retry_policy().clone();
    for attempt in retry.attempts() {
        let session = match manager.session() {
            Ok(session) => session,
            Err(err) => {
                warn!("No connection to get the size of {:?}: {:#}", path, err);
                return None;
            }
        };
        // Some servers only answer SIZE in binary mode.
        if let Err(err) = session.binary_mode() {
            debug!("TYPE I failed: {:#}", err);
        }
        match session.size(path) {
            Ok(size) => return Some(size),
            Err(err) if !is_transport_failure(&err) => {
                debug!("server won't give the size of {:?}: {:#}", path, err);
                return None;
            }
            Err(err) => {
                debug!("SIZE {:?} failed on attempt {}: {:#}", path, attempt, err);
                if !retry.is_last(attempt) {
                    if let Err(err) = manager.reconnect() {
                        warn!("Giving up on the size of {:?}: {:#}", path, err);
                        return None;
                    }
                    retry.backoff(attempt);
                }
            }
        }
    }
    None
}

/// Ask the server for a reference checksum of the file at absolute `path`.
///
/// Uses `HASH` if it was negotiated, then the legacy CRC commands if they
/// were advertised (or always, in `VerifyMode::Always`).
pub fn reference_checksum(
    manager: &mut ConnectionManager,
    path: &str,
    mode: VerifyMode,
) -> Option<Reference> {
    if mode == VerifyMode::Never {
        return None;
    }
    let retry = manager.retry_policy().clone();
    for attempt in retry.attempts() {
        let caps = manager.capabilities();
        let session = match manager.session() {
            Ok(session) => session,
            Err(err) => {
                warn!("No connection to get the checksum of {:?}: {:#}", path, err);
                return None;
            }
        };
        match query_reference(session, path, caps, mode) {
            Ok(reference) => return reference,
            Err(err) => {
                debug!("checksum query for {:?} failed on attempt {}: {:#}", path, attempt, err);
                if !retry.is_last(attempt) {
                    if let Err(err) = manager.reconnect() {
                        warn!("Giving up on the checksum of {:?}: {:#}", path, err);
                        return None;
                    }
                    retry.backoff(attempt);
                }
            }
        }
    }
    None
}

/// One round of checksum queries on one session.
///
/// Errors are transport failures; refusals just move on to the next command.
fn query_reference(
    session: &mut dyn Session,
    path: &str,
    caps: ServerCapabilities,
    mode: VerifyMode,
) -> Result<Option<Reference>> {
    if let (true, Some(algorithm)) = (caps.hash_supported, caps.hash_algorithm) {
        match session.quote(&format!("HASH {}", path)) {
            Ok(text) => match extract_digest(&text, algorithm) {
                Some(digest) => return Ok(Some(Reference { algorithm, digest })),
                None => debug!("no {} digest in HASH reply {:?}", algorithm, text),
            },
            Err(err) if is_transport_failure(&err) => return Err(err),
            Err(err) => debug!("HASH {:?} refused: {:#}", path, err),
        }
    }
    if caps.legacy_crc_supported || mode == VerifyMode::Always {
        for command in &LEGACY_CRC_COMMANDS {
            match session.quote(&format!("{} {}", command, path)) {
                Ok(text) => {
                    if let Some(digest) = extract_digest(&text, HashAlgorithm::Crc32) {
                        return Ok(Some(Reference {
                            algorithm: HashAlgorithm::Crc32,
                            digest,
                        }));
                    }
                }
                Err(err) if is_transport_failure(&err) => return Err(err),
                Err(err) => debug!("{} {:?} refused: {:#}", command, path, err),
            }
        }
    }
    Ok(None)
}

/// Find the digest in a checksum reply such as
/// `SHA-256 0-49 169cd22282da7f147cb491e559e9dd filename`.
///
/// Prefers the last hex token of the right length for `algorithm`, so a
/// file name that happens to look like hex is not mistaken for the digest.
/// CRC-32 digests without leading zeros are padded.
pub fn extract_digest(reply: &str, algorithm: HashAlgorithm) -> Option<String> {
    let is_hex = |t: &&str| !t.is_empty() && t.bytes().all(|b| b.is_ascii_hexdigit());
    let tokens: Vec<&str> = reply.split_whitespace().rev().filter(is_hex).collect();
    if let Some(exact) = tokens.iter().find(|t| t.len() == algorithm.hex_len()) {
        return Some(exact.to_ascii_lowercase());
    }
    if algorithm == HashAlgorithm::Crc32 {
        return tokens
            .iter()
            .find(|t| t.len() < 8)
            .map(|t| format!("{:0>8}", t.to_ascii_lowercase()));
    }
    None
}

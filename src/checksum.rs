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

//! Checksums of local files, to compare against the server's.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::Context;
use digest::Digest;

use crate::capability::HashAlgorithm;
use crate::Result;

const READ_BLOCK: usize = 1 << 20;

/// Compute the lowercase hex checksum of a local file.
pub fn file_checksum(path: &Path, algo: HashAlgorithm) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {:?} for checksum", path))?;
    reader_checksum(&mut file, algo).with_context(|| format!("Failed to read {:?}", path))
}

/// Compute the lowercase hex checksum of everything `r` produces.
pub fn reader_checksum(r: &mut dyn Read, algo: HashAlgorithm) -> io::Result<String> {
    match algo {
        HashAlgorithm::Crc32 => crc32(r),
        HashAlgorithm::Md5 => digest::<md5::Md5>(r),
        HashAlgorithm::Sha1 => digest::<sha1::Sha1>(r),
        HashAlgorithm::Sha256 => digest::<sha2::Sha256>(r),
        HashAlgorithm::Sha512 => digest::<sha2::Sha512>(r),
    }
}

/// CRC-32 (the zlib polynomial), as 8 hex digits.
fn crc32(r: &mut dyn Read) -> io::Result<String> {
    let mut crc = flate2::Crc::new();
    let mut buf = vec![0; READ_BLOCK];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
    }
    Ok(format!("{:08x}", crc.sum()))
}

fn digest<D: Digest>(r: &mut dyn Read) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0; READ_BLOCK];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare two hex digests, ignoring case.
pub fn same_digest(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

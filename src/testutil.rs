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

//! An in-memory FTP server for tests, with injectable faults.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{self, Write};
use std::rc::Rc;

use crate::capability::HashAlgorithm;
use crate::checksum::reader_checksum;
use crate::options::{Options, RetryPolicy};
use crate::proto::ReplyError;
use crate::session::{Connector, Session};
use crate::Result;

#[derive(Default)]
struct State {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    mtimes: HashMap<String, String>,
    /// Paths listed without a `type` fact.
    untyped: HashSet<String>,
    /// Sizes given in listings instead of the real length.
    listed_sizes: HashMap<String, u64>,
    /// Directories that can be listed by their parent but not entered.
    denied_dirs: HashSet<String>,
    no_mlsd: bool,
    no_feat: bool,
    hash_algorithms: Vec<HashAlgorithm>,
    refused_algorithms: Vec<HashAlgorithm>,
    legacy_crc: bool,
    active_hash: Option<HashAlgorithm>,
    /// Number of checksum replies still to be corrupted, per path.
    corrupt_checksums: HashMap<String, u32>,
    /// Number of retrievals still to be delivered with damaged content, per path.
    corrupt_retrievals: HashMap<String, u32>,
    /// One-shot: drop the connection once a RETR of the path reaches this offset.
    cut_retr: HashMap<String, Vec<u64>>,
    /// Sessions from earlier generations are dead.
    generation: u64,
    connect_failures: u32,
    connects: u32,
    noop_count: u32,
    retrievals: Vec<(String, u64)>,
    size_queries: u32,
}

/// Shared handle to an in-memory server.
#[derive(Clone)]
pub struct FakeServer {
    state: Rc<RefCell<State>>,
}

impl FakeServer {
    pub fn new() -> FakeServer {
        let mut state = State::default();
        state.dirs.insert("/".to_owned());
        FakeServer {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.borrow_mut();
        let mut cur = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur.push('/');
            cur.push_str(part);
            state.dirs.insert(cur.clone());
        }
    }

    pub fn add_file(&self, path: &str, content: Vec<u8>) {
        if let Some(parent) = path.rsplitn(2, '/').nth(1) {
            self.add_dir(parent);
        }
        self.state
            .borrow_mut()
            .files
            .insert(path.to_owned(), content);
    }

    pub fn set_mtime(&self, path: &str, modify: &str) {
        self.state
            .borrow_mut()
            .mtimes
            .insert(path.to_owned(), modify.to_owned());
    }

    pub fn set_untyped(&self, path: &str) {
        self.state.borrow_mut().untyped.insert(path.to_owned());
    }

    /// Give `size` in listings of `path`, whatever its real length.
    pub fn set_listed_size(&self, path: &str, size: u64) {
        self.state
            .borrow_mut()
            .listed_sizes
            .insert(path.to_owned(), size);
    }

    /// Refuse CWD into `path` with a 550 reply.
    pub fn deny_dir(&self, path: &str) {
        self.state.borrow_mut().denied_dirs.insert(path.to_owned());
    }

    pub fn set_mlsd_supported(&self, supported: bool) {
        self.state.borrow_mut().no_mlsd = !supported;
    }

    pub fn set_feat_supported(&self, supported: bool) {
        self.state.borrow_mut().no_feat = !supported;
    }

    pub fn set_hash_algorithms(&self, algos: &[HashAlgorithm]) {
        self.state.borrow_mut().hash_algorithms = algos.to_vec();
    }

    pub fn refuse_hash_algorithm(&self, algo: HashAlgorithm) {
        self.state.borrow_mut().refused_algorithms.push(algo);
    }

    pub fn set_legacy_crc(&self, supported: bool) {
        self.state.borrow_mut().legacy_crc = supported;
    }

    /// Make the next `times` checksum replies for `path` wrong.
    pub fn corrupt_checksum(&self, path: &str, times: u32) {
        self.state
            .borrow_mut()
            .corrupt_checksums
            .insert(path.to_owned(), times);
    }

    /// Deliver the next `times` retrievals of `path` with a damaged first byte.
    pub fn corrupt_retrieval(&self, path: &str, times: u32) {
        self.state
            .borrow_mut()
            .corrupt_retrievals
            .insert(path.to_owned(), times);
    }

    /// Drop the connection when a retrieval of `path` reaches byte `at`.
    pub fn cut_retrieval(&self, path: &str, at: u64) {
        self.state
            .borrow_mut()
            .cut_retr
            .entry(path.to_owned())
            .or_default()
            .push(at);
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_connects(&self, n: u32) {
        self.state.borrow_mut().connect_failures = n;
    }

    /// Kill every open session.
    pub fn disconnect_all(&self) {
        self.state.borrow_mut().generation += 1;
    }

    pub fn active_hash(&self) -> Option<HashAlgorithm> {
        self.state.borrow().active_hash
    }

    pub fn connects(&self) -> u32 {
        self.state.borrow().connects
    }

    pub fn noop_count(&self) -> u32 {
        self.state.borrow().noop_count
    }

    pub fn size_queries(&self) -> u32 {
        self.state.borrow().size_queries
    }

    /// Paths and offsets of every RETR, in order.
    pub fn retrievals(&self) -> Vec<(String, u64)> {
        self.state.borrow().retrievals.clone()
    }

    pub fn session(&self) -> FakeSession {
        FakeSession {
            server: self.clone(),
            generation: self.state.borrow().generation,
            cwd: "/".to_owned(),
        }
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(FakeConnector {
            server: self.clone(),
        })
    }
}

/// Options for tests: no sleeping between retries.
pub fn test_options() -> Options {
    Options {
        retry: RetryPolicy::immediate(3),
        block_size: 4096,
        ..Options::default()
    }
}

pub struct FakeConnector {
    server: FakeServer,
}

impl Connector for FakeConnector {
    fn connect(&mut self) -> Result<Box<dyn Session>> {
        {
            let mut state = self.server.state.borrow_mut();
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into());
            }
            state.connects += 1;
        }
        Ok(Box::new(self.server.session()))
    }

    fn describe(&self) -> String {
        "fake server".to_owned()
    }
}

pub struct FakeSession {
    server: FakeServer,
    generation: u64,
    cwd: String,
}

fn reply_err(code: u16, text: &str) -> anyhow::Error {
    ReplyError {
        code,
        text: text.to_owned(),
    }
    .into()
}

impl FakeSession {
    fn check_alive(&self) -> Result<()> {
        if self.generation == self.server.state.borrow().generation {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset").into())
        }
    }

    fn resolve(&self, path: &str) -> String {
        let joined = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("{}/{}", self.cwd, path)
        };
        let mut parts: Vec<&str> = Vec::new();
        for part in joined.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                p => parts.push(p),
            }
        }
        format!("/{}", parts.join("/"))
    }

    /// Names and full paths of the children of the current directory.
    fn children(&self) -> Vec<(String, String)> {
        let state = self.server.state.borrow();
        let prefix = if self.cwd == "/" {
            "/".to_owned()
        } else {
            format!("{}/", self.cwd)
        };
        let direct = |p: &String| {
            p.starts_with(&prefix) && p.len() > prefix.len() && !p[prefix.len()..].contains('/')
        };
        state
            .dirs
            .iter()
            .chain(state.files.keys())
            .filter(|p| direct(p))
            .map(|p| (p[prefix.len()..].to_owned(), p.clone()))
            .collect()
    }

    fn checksum_reply(&self, path: &str, algo: HashAlgorithm) -> Result<String> {
        let path = self.resolve(path);
        let mut state = self.server.state.borrow_mut();
        let content = state
            .files
            .get(&path)
            .ok_or_else(|| reply_err(550, "No such file"))?
            .clone();
        let mut digest = reader_checksum(&mut &content[..], algo)?;
        if let Some(n) = state.corrupt_checksums.get_mut(&path) {
            if *n > 0 {
                *n -= 1;
                digest = "0".repeat(algo.hex_len());
            }
        }
        Ok(digest)
    }
}

impl Session for FakeSession {
    fn noop(&mut self) -> Result<()> {
        self.check_alive()?;
        self.server.state.borrow_mut().noop_count += 1;
        Ok(())
    }

    fn binary_mode(&mut self) -> Result<()> {
        self.check_alive()
    }

    fn pwd(&mut self) -> Result<String> {
        self.check_alive()?;
        Ok(self.cwd.clone())
    }

    fn cwd(&mut self, path: &str) -> Result<()> {
        self.check_alive()?;
        let path = self.resolve(path);
        let state = self.server.state.borrow();
        if state.denied_dirs.contains(&path) {
            Err(reply_err(550, "Permission denied"))
        } else if state.dirs.contains(&path) {
            drop(state);
            self.cwd = path;
            Ok(())
        } else {
            Err(reply_err(550, "No such directory"))
        }
    }

    fn mlsd(&mut self) -> Result<Vec<String>> {
        self.check_alive()?;
        if self.server.state.borrow().no_mlsd {
            return Err(reply_err(500, "MLSD not understood"));
        }
        let mut lines = vec!["type=cdir;modify=20200101000000; .".to_owned()];
        if self.cwd != "/" {
            lines.push("type=pdir;modify=20200101000000; ..".to_owned());
        }
        let state = self.server.state.borrow();
        for (name, path) in self.children() {
            let modify = state
                .mtimes
                .get(&path)
                .cloned()
                .unwrap_or_else(|| "20200101000000".to_owned());
            let mut facts = String::new();
            if !state.untyped.contains(&path) {
                if state.dirs.contains(&path) {
                    facts.push_str("type=dir;");
                } else {
                    facts.push_str("type=file;");
                }
            }
            if let Some(content) = state.files.get(&path) {
                let size = state
                    .listed_sizes
                    .get(&path)
                    .copied()
                    .unwrap_or(content.len() as u64);
                facts.push_str(&format!("size={};", size));
            }
            facts.push_str(&format!("modify={};", modify));
            lines.push(format!("{} {}", facts, name));
        }
        Ok(lines)
    }

    fn nlst(&mut self) -> Result<Vec<String>> {
        self.check_alive()?;
        Ok(self.children().into_iter().map(|(name, _)| name).collect())
    }

    fn size(&mut self, path: &str) -> Result<u64> {
        self.check_alive()?;
        let path = self.resolve(path);
        let mut state = self.server.state.borrow_mut();
        state.size_queries += 1;
        state
            .files
            .get(&path)
            .map(|c| c.len() as u64)
            .ok_or_else(|| reply_err(550, "Could not get file size"))
    }

    fn feat(&mut self) -> Result<Vec<String>> {
        self.check_alive()?;
        let state = self.server.state.borrow();
        if state.no_feat {
            return Err(reply_err(500, "FEAT not understood"));
        }
        let mut lines = vec![" MDTM".to_owned(), " SIZE".to_owned()];
        if !state.no_mlsd {
            lines.push(" MLST type*;size*;modify*;".to_owned());
        }
        if !state.hash_algorithms.is_empty() {
            let names: Vec<&str> = state.hash_algorithms.iter().map(|a| a.name()).collect();
            lines.push(format!(" HASH {}", names.join(";")));
        }
        if state.legacy_crc {
            lines.push(" XCRC \"filename\" SP EP".to_owned());
        }
        Ok(lines)
    }

    fn quote(&mut self, command: &str) -> Result<String> {
        self.check_alive()?;
        let (verb, arg) = match command.find(' ') {
            Some(i) => (&command[..i], &command[i + 1..]),
            None => (command, ""),
        };
        match verb {
            "OPTS" => {
                let algo: HashAlgorithm = arg
                    .strip_prefix("HASH ")
                    .ok_or_else(|| reply_err(501, "Bad option"))?
                    .parse()
                    .map_err(|_| reply_err(501, "Unknown algorithm"))?;
                let mut state = self.server.state.borrow_mut();
                if state.hash_algorithms.contains(&algo)
                    && !state.refused_algorithms.contains(&algo)
                {
                    state.active_hash = Some(algo);
                    Ok(algo.name().to_owned())
                } else {
                    Err(reply_err(501, "Unsupported algorithm"))
                }
            }
            "HASH" => {
                let algo = self
                    .server
                    .state
                    .borrow()
                    .active_hash
                    .ok_or_else(|| reply_err(502, "HASH not enabled"))?;
                let digest = self.checksum_reply(arg, algo)?;
                Ok(format!("{} 0-100 {} {}", algo.name(), digest, arg))
            }
            "XCRC" if self.server.state.borrow().legacy_crc => {
                let digest = self.checksum_reply(arg, HashAlgorithm::Crc32)?;
                Ok(digest.to_ascii_uppercase())
            }
            _ => Err(reply_err(500, "Command not understood")),
        }
    }

    fn retrieve(
        &mut self,
        path: &str,
        offset: u64,
        block_size: usize,
        out: &mut dyn Write,
    ) -> Result<u64> {
        self.check_alive()?;
        let path = self.resolve(path);
        let (content, cut) = {
            let mut state = self.server.state.borrow_mut();
            state.retrievals.push((path.clone(), offset));
            let mut content = state
                .files
                .get(&path)
                .ok_or_else(|| reply_err(550, "No such file"))?
                .clone();
            if let Some(n) = state.corrupt_retrievals.get_mut(&path) {
                if *n > 0 && !content.is_empty() {
                    *n -= 1;
                    content[0] = !content[0];
                }
            }
            let cut = state
                .cut_retr
                .get_mut(&path)
                .and_then(|cuts| if cuts.is_empty() { None } else { Some(cuts.remove(0)) });
            (content, cut)
        };
        let start = (offset as usize).min(content.len());
        let end = cut.map_or(content.len(), |c| (c as usize).min(content.len()).max(start));
        for block in content[start..end].chunks(block_size.max(1)) {
            out.write_all(block)?;
        }
        if cut.is_some() {
            self.server.disconnect_all();
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "data connection reset").into());
        }
        Ok((end - start) as u64)
    }

    fn quit(&mut self) -> Result<()> {
        self.check_alive()
    }
}

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

//! Shorten remote paths for log output.
//!
//! This only affects what is printed, never the paths sent to the server.

use std::str::FromStr;

const ELLIPSIS: char = '…';

/// Where to cut a path that is too long.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ellipsis {
    /// Keep the end.
    Left,
    /// Keep both ends.
    Middle,
    /// Keep the start.
    Right,
}

impl Default for Ellipsis {
    fn default() -> Self {
        Ellipsis::Middle
    }
}

impl FromStr for Ellipsis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(Ellipsis::Left),
            "middle" => Ok(Ellipsis::Middle),
            "right" => Ok(Ellipsis::Right),
            _ => Err(format!("unknown ellipsis position {:?}", s)),
        }
    }
}

/// How to show remote paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplayPaths {
    /// Replace a leading prefix with something shorter.
    pub rewrite: Option<(String, String)>,
    /// Maximum length in characters; 0 for no limit.
    pub max_len: usize,
    pub ellipsis: Ellipsis,
}

impl DisplayPaths {
    pub fn format(&self, path: &str) -> String {
        let rewritten = match &self.rewrite {
            Some((from, to)) if !from.is_empty() && path.starts_with(from.as_str()) => {
                format!("{}{}", to, &path[from.len()..])
            }
            _ => path.to_owned(),
        };
        ellipsize(&rewritten, self.max_len, self.ellipsis)
    }
}

/// Cut `s` to at most `max_len` characters, marking the cut with `…`.
fn ellipsize(s: &str, max_len: usize, ellipsis: Ellipsis) -> String {
    let chars: Vec<char> = s.chars().collect();
    if max_len == 0 || chars.len() <= max_len {
        return s.to_owned();
    }
    if max_len <= 3 {
        return chars[..max_len].iter().collect();
    }
    let keep = max_len - 1;
    let (head, tail) = match ellipsis {
        Ellipsis::Left => (0, keep),
        Ellipsis::Right => (keep, 0),
        Ellipsis::Middle => (keep / 2, keep - keep / 2),
    };
    let mut out: String = chars[..head].iter().collect();
    out.push(ELLIPSIS);
    out.extend(&chars[chars.len() - tail..]);
    out
}

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

//! The address of an FTP server, and the remote path to mirror.
//!
//! This is the starting point for doing anything else with the library.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

/// Standard FTP control port.
pub const DEFAULT_PORT: u16 = 21;
/// User name used when none is given.
const ANONYMOUS_USER: &str = "anonymous";
/// Conventional password for anonymous logins.
const ANONYMOUS_PASSWORD: &str = "anonymous@";

/// The address of an FTP server, including the credentials to log in with
/// and the remote directory to start from.
///
/// Addresses can be parsed from URLs or from SFTP-like strings:
/// ```
/// let address: ftpmirror::Address = "ftp://ftp.example.com/pub/amiga".parse()
///     .expect("Parse failed");
/// assert_eq!(address.path(), "/pub/amiga");
/// ```
#[derive(Eq, PartialEq, Clone)]
pub struct Address {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    /// Remote path to mirror.
    path: String,
}

impl Address {
    /// Builds an address for `host` on the standard port, logging in
    /// anonymously, starting from the root directory.
    pub fn new(host: &str) -> Address {
        Address {
            host: host.into(),
            port: DEFAULT_PORT,
            user: None,
            password: None,
            path: "/".into(),
        }
    }

    /// Set the control port.
    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    /// Set the user name to log in as.
    pub fn set_user(&mut self, user: &str) -> &mut Self {
        self.user = Some(user.into());
        self
    }

    /// Set the login password.
    pub fn set_password(&mut self, password: &str) -> &mut Self {
        self.password = Some(password.into());
        self
    }

    /// Set the remote path to mirror.
    pub fn set_path(&mut self, path: &str) -> &mut Self {
        self.path = path.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The user name, defaulting to `anonymous`.
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(ANONYMOUS_USER)
    }

    /// The password, defaulting to the conventional anonymous password.
    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or(ANONYMOUS_PASSWORD)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, suitable for resolving, with IPv6 literals bracketed.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Show the address as a URL, never including the password.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ftp://")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host_port())?;
        if !self.path.starts_with('/') {
            write!(f, "/")?;
        }
        write!(f, "{}", self.path)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("path", &self.path)
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseAddressError {
    input: String,
    reason: &'static str,
}

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "can't parse address {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for ParseAddressError {}

/// Builds an Address by matching `ftp://` URLs, SFTP-like `host:path`
/// strings, or a bare host name.
impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        lazy_static! {
            static ref URL_RE: Regex = Regex::new(
                r"^(?x)
                    ftp://
                    ((?P<user>[^@:/]+)(:(?P<password>[^@/]*))?@)?
                    (\[(?P<host6>[^\]]+)\]|(?P<host>[^:/@\[]+))
                    (:(?P<port>\d+))?
                    (?P<path>/.*)?
                    $",
            )
            .unwrap();
            static ref SFTP_RE: Regex = Regex::new(
                r"^(?x)
                    ((?P<user>[^@:]+)@)?
                    (?P<host>[^:@/\[]+):
                    (?P<path>.*)   # path; may be absolute or relative
                    $",
            )
            .unwrap();
            static ref HOST_RE: Regex = Regex::new(r"^[A-Za-z0-9.\-]+$").unwrap();
        }
        let err = |reason| ParseAddressError {
            input: s.to_owned(),
            reason,
        };
        if let Some(caps) = URL_RE.captures(s) {
            let host = caps
                .name("host")
                .or_else(|| caps.name("host6"))
                .map(|m| m.as_str())
                .ok_or_else(|| err("no host"))?;
            let port = match caps.name("port") {
                Some(p) => p.as_str().parse().map_err(|_| err("port out of range"))?,
                None => DEFAULT_PORT,
            };
            Ok(Address {
                host: host.into(),
                port,
                user: caps.name("user").map(|m| m.as_str().to_string()),
                password: caps.name("password").map(|m| m.as_str().to_string()),
                path: caps.name("path").map_or("/", |m| m.as_str()).into(),
            })
        } else if s.contains("://") {
            Err(err("only ftp:// URLs are supported"))
        } else if let Some(caps) = SFTP_RE.captures(s) {
            let path = match &caps["path"] {
                "" => "/",
                p => p,
            };
            Ok(Address {
                host: caps["host"].into(),
                port: DEFAULT_PORT,
                user: caps.name("user").map(|m| m.as_str().to_string()),
                password: None,
                path: path.into(),
            })
        } else if HOST_RE.is_match(s) {
            Ok(Address::new(s))
        } else {
            Err(err("expected ftp://host/path, host:path or a host name"))
        }
    }
}

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

//! Own the single control connection: connect, keep alive, reconnect.

use anyhow::anyhow;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::capability::{negotiate, HashAlgorithm, ServerCapabilities};
use crate::options::{Options, RetryPolicy, VerifyMode};
use crate::session::{Connector, Session};
use crate::Result;

/// Holds the one live session to the server, and replaces it when it fails.
///
/// Other components borrow the session through [`keep_alive`](Self::keep_alive),
/// [`session`](Self::session) or [`reconnect`](Self::reconnect), and must
/// borrow it again after any reconnect: the old session is gone.
pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    retry: RetryPolicy,
    hash_preference: Vec<HashAlgorithm>,
    negotiate_checksums: bool,
    session: Option<Box<dyn Session>>,
    capabilities: ServerCapabilities,
    reconnects: u32,
}

impl ConnectionManager {
    /// Connect for the first time and negotiate capabilities.
    ///
    /// Fails if no connection can be made within the retry policy; nothing
    /// else can be done without one.
    pub fn open(connector: Box<dyn Connector>, options: &Options) -> Result<ConnectionManager> {
        let mut manager = ConnectionManager {
            connector,
            retry: options.retry.clone(),
            hash_preference: options.hash_preference.clone(),
            negotiate_checksums: options.verify != VerifyMode::Never,
            session: None,
            capabilities: ServerCapabilities::default(),
            reconnects: 0,
        };
        manager.establish()?;
        Ok(manager)
    }

    /// Capabilities of the current session.
    pub fn capabilities(&self) -> ServerCapabilities {
        self.capabilities
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Number of times the connection has been replaced.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// The current session, reconnecting first if there is none.
    pub fn session(&mut self) -> Result<&mut dyn Session> {
        if self.session.is_none() {
            self.reconnect()?;
        }
        self.current()
    }

    /// Check the session with a no-op, replacing it if that fails.
    pub fn keep_alive(&mut self) -> Result<&mut dyn Session> {
        let alive = match self.session.as_deref_mut() {
            Some(session) => match session.noop() {
                Ok(()) => true,
                Err(err) => {
                    debug!("keep-alive failed: {:#}", err);
                    false
                }
            },
            None => false,
        };
        if !alive {
            self.reconnect()?;
        }
        self.current()
    }

    /// Discard the current session, if any, and open a new one.
    pub fn reconnect(&mut self) -> Result<&mut dyn Session> {
        if let Some(old) = self.session.take() {
            // Dropping closes the sockets; a dead session can't say goodbye.
            drop(old);
            self.reconnects += 1;
            info!("Reconnecting to {}", self.connector.describe());
        }
        self.establish()?;
        self.current()
    }

    /// Close the session politely.
    pub fn close(mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.quit() {
                debug!("QUIT failed: {:#}", err);
            }
        }
    }

    fn current(&mut self) -> Result<&mut dyn Session> {
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(anyhow!("Not connected to {}", self.connector.describe())),
        }
    }

    /// Connect with retries, then negotiate capabilities on the new session.
    fn establish(&mut self) -> Result<()> {
        self.capabilities = ServerCapabilities::default();
        let mut session = self.connect_with_retries()?;
        if self.negotiate_checksums {
            self.capabilities = negotiate(session.as_mut(), &self.hash_preference);
        }
        self.session = Some(session);
        Ok(())
    }

    fn connect_with_retries(&mut self) -> Result<Box<dyn Session>> {
        let mut last_err = None;
        for attempt in self.retry.attempts() {
            match self.connector.connect() {
                Ok(session) => {
                    debug!("connected to {} on attempt {}", self.connector.describe(), attempt);
                    return Ok(session);
                }
                Err(err) => {
                    warn!(
                        "Connection attempt {} to {} failed: {:#}",
                        attempt,
                        self.connector.describe(),
                        err
                    );
                    last_err = Some(err);
                    if !self.retry.is_last(attempt) {
                        self.retry.backoff(attempt);
                    }
                }
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("no connection attempts made"));
        Err(err.context(format!(
            "Failed to connect to {} after {} attempts",
            self.connector.describe(),
            self.retry.max_attempts.max(1)
        )))
    }
}

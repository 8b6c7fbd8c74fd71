// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Broker configuration, loaded once at startup from an optional TOML
//! file. Every field is optional so an absent file, or an absent key
//! within one, falls back to a documented default rather than failing
//! to start.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else {
        let home = env::var("HOME").context("no HOME in environment")?;
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("tabrmd");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(&config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Maximum number of simultaneous client connections. Beyond this a
    /// new connection is refused outright at accept time.
    pub max_connections: Option<usize>,

    /// Maximum number of transient objects any single connection may
    /// have resident or evicted at once.
    pub max_transient_per_connection: Option<usize>,

    /// Maximum number of sessions (across every connection, active or
    /// abandoned) the session-continuation registry tracks at once.
    pub max_active_sessions: Option<usize>,

    /// Maximum number of abandoned (`SavedByClientClosed`) sessions kept
    /// around for a future connection to claim before the LRU starts
    /// discarding the oldest.
    pub max_abandoned_sessions: Option<usize>,

    /// If true, a connection that closes with transient objects still
    /// loaded (rather than saved) is treated as a client error and
    /// logged at a higher severity; if false (the default) this is
    /// silently tolerated and the objects are simply flushed.
    pub fail_on_loaded_transients: Option<bool>,

    /// If true, the broker calls `Device.flush_range` over the full
    /// transient handle range at startup, discarding anything left
    /// resident by a previous, uncleanly terminated broker process.
    pub flush_all_on_start: Option<bool>,

    /// Path to the Unix domain socket the broker listens on for client
    /// connections. Only meaningful when built with the `reference-io`
    /// feature; the envelope-protocol transport itself is out of scope
    /// of the core broker.
    #[cfg(feature = "reference-io")]
    pub socket_path: Option<String>,

    /// `host:port` of the TPM simulator the reference transport connects
    /// to. Only meaningful when built with the `reference-io` feature.
    #[cfg(feature = "reference-io")]
    pub device_address: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_connections: None,
            max_transient_per_connection: None,
            max_active_sessions: None,
            max_abandoned_sessions: None,
            fail_on_loaded_transients: None,
            flush_all_on_start: None,
            #[cfg(feature = "reference-io")]
            socket_path: None,
            #[cfg(feature = "reference-io")]
            device_address: None,
        }
    }
}

impl Config {
    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(consts::DEFAULT_MAX_CONNECTIONS)
    }

    pub fn max_transient_per_connection(&self) -> usize {
        self.max_transient_per_connection.unwrap_or(consts::DEFAULT_MAX_TRANSIENT_PER_CONNECTION)
    }

    pub fn max_active_sessions(&self) -> usize {
        self.max_active_sessions.unwrap_or(consts::DEFAULT_MAX_ACTIVE_SESSIONS)
    }

    pub fn max_abandoned_sessions(&self) -> usize {
        self.max_abandoned_sessions.unwrap_or(consts::DEFAULT_MAX_ABANDONED_SESSIONS)
    }

    pub fn fail_on_loaded_transients(&self) -> bool {
        self.fail_on_loaded_transients.unwrap_or(false)
    }

    pub fn flush_all_on_start(&self) -> bool {
        self.flush_all_on_start.unwrap_or(false)
    }

    #[cfg(feature = "reference-io")]
    pub fn socket_path(&self) -> Option<String> {
        self.socket_path.clone()
    }

    #[cfg(feature = "reference-io")]
    pub fn device_address(&self) -> Option<String> {
        self.device_address.clone()
    }
}

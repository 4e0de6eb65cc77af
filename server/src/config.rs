//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
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
//

//! Host configuration file
//!
//! The TOML file is read into [`AppConfig`], overridden from the command
//! line and converted into the service's [`ServerConfig`]. Durations are
//! whole seconds unless the key says otherwise.

use anyhow::Context;
use emberlink_service::{ConfigPersistence, CrashGuardConfig, DEFAULT_PORT, NetError, ServerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Contents of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Network and session settings
    pub server: ServerSettings,
    /// Crash handling settings
    pub crash: CrashSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// Network and session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Endpoints to listen on
    pub listeners: Vec<String>,
    /// Pending-connection backlog per listener
    pub backlog: u32,
    /// Largest inbound frame in bytes
    pub buffer_size: usize,
    /// Connections allowed per remote address (0 = unlimited)
    pub max_per_ip: usize,
    /// Idle time before a connection is dropped
    pub idle_timeout: u64,
    /// First liveness sweep after startup
    pub alive_check_delay: u64,
    /// Time between liveness sweeps
    pub alive_check_interval: u64,
    /// Wait before retrying a failed bind
    pub bind_retry_delay: u64,
    /// Throttle poll period in milliseconds
    pub throttle_retry_ms: u64,
    /// Outbound frames queued per connection
    pub send_queue_size: usize,
    /// Time between autosaves
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autosave_interval: Option<u64>,
    /// Restart the process after this long
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_after: Option<u64>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            listeners: vec![format!("0.0.0.0:{}", DEFAULT_PORT)],
            backlog: defaults.backlog,
            buffer_size: defaults.buffer_size,
            max_per_ip: defaults.max_per_ip,
            idle_timeout: defaults.idle_timeout.as_secs(),
            alive_check_delay: defaults.alive_check_delay.as_secs(),
            alive_check_interval: defaults.alive_check_interval.as_secs(),
            bind_retry_delay: defaults.bind_retry_delay.as_secs(),
            throttle_retry_ms: defaults.throttle_retry.as_millis() as u64,
            send_queue_size: defaults.send_queue_size,
            autosave_interval: None,
            restart_after: None,
        }
    }
}

/// Crash handling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashSettings {
    /// Handle crashes at all
    pub enabled: bool,
    /// Where crash reports go
    pub report_dir: PathBuf,
    /// Back up the save directory on crash
    pub backup: bool,
    /// Directory holding saved data
    pub save_dir: PathBuf,
    /// Root of the backup tree
    pub backup_dir: PathBuf,
    /// Restart after a crash instead of exiting
    pub restart: bool,
}

impl Default for CrashSettings {
    fn default() -> Self {
        let defaults = CrashGuardConfig::default();
        Self {
            enabled: defaults.enabled,
            report_dir: defaults.report_dir,
            backup: defaults.backup,
            save_dir: defaults.save_dir,
            backup_dir: defaults.backup_dir,
            restart: defaults.restart,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive (`info`, `emberlink_service=debug`, ...)
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Load `path`, writing a default file first if it does not exist
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
        } else {
            let config = AppConfig::default();
            tokio::fs::write(path, toml::to_string_pretty(&config)?)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), "Created default configuration file");
            Ok(config)
        }
    }

    /// Write the configuration to `path`
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Convert to the service configuration and validate it
    pub fn to_server_config(&self) -> anyhow::Result<ServerConfig> {
        let listeners = self
            .server
            .listeners
            .iter()
            .map(|address| {
                address
                    .parse::<SocketAddr>()
                    .with_context(|| format!("invalid listener address '{}'", address))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let settings = &self.server;
        let mut config = ServerConfig::new(listeners)
            .with_backlog(settings.backlog)
            .with_buffer_size(settings.buffer_size)
            .with_max_per_ip(settings.max_per_ip)
            .with_idle_timeout(Duration::from_secs(settings.idle_timeout))
            .with_alive_check(
                Duration::from_secs(settings.alive_check_delay),
                Duration::from_secs(settings.alive_check_interval),
            )
            .with_bind_retry_delay(Duration::from_secs(settings.bind_retry_delay))
            .with_throttle_retry(Duration::from_millis(settings.throttle_retry_ms))
            .with_send_queue_size(settings.send_queue_size)
            .with_crash_guard(CrashGuardConfig {
                enabled: self.crash.enabled,
                report_dir: self.crash.report_dir.clone(),
                backup: self.crash.backup,
                save_dir: self.crash.save_dir.clone(),
                backup_dir: self.crash.backup_dir.clone(),
                restart: self.crash.restart,
            });
        if let Some(interval) = settings.autosave_interval.filter(|secs| *secs > 0) {
            config = config.with_autosave(Duration::from_secs(interval));
        }
        if let Some(after) = settings.restart_after.filter(|secs| *secs > 0) {
            config = config.with_restart_after(Duration::from_secs(after));
        }

        config.validate()?;
        Ok(config)
    }
}

/// Rewrites the configuration file on every world save
#[derive(Debug, Clone)]
pub struct TomlPersistence {
    path: PathBuf,
    config: AppConfig,
}

impl TomlPersistence {
    /// Persist `config` to `path`
    pub fn new(path: impl Into<PathBuf>, config: AppConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }
}

impl ConfigPersistence for TomlPersistence {
    fn persist(&self) -> emberlink_service::Result<()> {
        self.config
            .save_to_file(&self.path)
            .map_err(|err| NetError::Other(format!("{:#}", err)))
    }
}

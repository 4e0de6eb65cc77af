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

//! Server configuration

use crate::{NetError, Result};
use emberlink_codec::DEFAULT_MAX_FRAME_LENGTH;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default game port
pub const DEFAULT_PORT: u16 = 9339;

/// Default per-connection outbound queue capacity
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 1024;

/// Crash guard configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashGuardConfig {
    /// Install the crash guard at all
    pub enabled: bool,
    /// Directory crash reports are written to
    pub report_dir: PathBuf,
    /// Take a backup of the save directory on crash
    pub backup: bool,
    /// Directory holding persisted world data
    pub save_dir: PathBuf,
    /// Root of the backup tree (`<backup_dir>/Crashed/<timestamp>`)
    pub backup_dir: PathBuf,
    /// Re-exec the process after a crash instead of terminating
    pub restart: bool,
}

impl Default for CrashGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_dir: PathBuf::from("logs/crashes"),
            backup: true,
            save_dir: PathBuf::from("saves"),
            backup_dir: PathBuf::from("backups"),
            restart: false,
        }
    }
}

/// Server configuration
///
/// Use the builder pattern methods to customize the configuration.
///
/// # Example
///
/// ```
/// use emberlink_service::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::default()
///     .with_listener("0.0.0.0:9339".parse().unwrap())
///     .with_max_per_ip(4)
///     .with_idle_timeout(Duration::from_secs(120));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Endpoints to listen on; all of them must bind before startup completes
    pub listeners: Vec<SocketAddr>,

    /// Listen backlog passed to the OS
    pub backlog: u32,

    /// Receive buffer size, which is also the longest accepted inbound frame
    pub buffer_size: usize,

    /// Maximum live connections per remote IP (0 = unlimited)
    pub max_per_ip: usize,

    /// Liveness window; a connection without activity for this long is disposed
    pub idle_timeout: Duration,

    /// Delay before the first liveness sweep
    pub alive_check_delay: Duration,

    /// Interval between liveness sweeps
    pub alive_check_interval: Duration,

    /// Delay before retrying the whole listener set after a bind failure
    pub bind_retry_delay: Duration,

    /// Delay before a failed throttle predicate is evaluated again
    pub throttle_retry: Duration,

    /// Outbound frames queued per connection before it is dropped as unresponsive
    pub send_queue_size: usize,

    /// Save the world on this interval
    pub autosave_interval: Option<Duration>,

    /// Save and restart the process after this long
    pub restart_after: Option<Duration>,

    /// Crash guard settings
    pub crash_guard: CrashGuardConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listeners: vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))],
            backlog: 8,
            buffer_size: DEFAULT_MAX_FRAME_LENGTH,
            max_per_ip: 10,
            idle_timeout: Duration::from_secs(90),
            alive_check_delay: Duration::from_secs(60),
            alive_check_interval: Duration::from_secs(90),
            bind_retry_delay: Duration::from_secs(10),
            throttle_retry: Duration::from_millis(250),
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            autosave_interval: None,
            restart_after: None,
            crash_guard: CrashGuardConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the given listen endpoints
    ///
    /// All other settings will use their default values.
    pub fn new(listeners: Vec<SocketAddr>) -> Self {
        Self {
            listeners,
            ..Default::default()
        }
    }

    /// Replace the listen endpoints with a single endpoint
    pub fn with_listener(mut self, address: SocketAddr) -> Self {
        self.listeners = vec![address];
        self
    }

    /// Replace the listen endpoints
    pub fn with_listeners(mut self, listeners: Vec<SocketAddr>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Set the listen backlog
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the receive buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the per-IP connection limit
    pub fn with_max_per_ip(mut self, max: usize) -> Self {
        self.max_per_ip = max;
        self
    }

    /// Set the liveness window
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the liveness sweep schedule
    pub fn with_alive_check(mut self, delay: Duration, interval: Duration) -> Self {
        self.alive_check_delay = delay;
        self.alive_check_interval = interval;
        self
    }

    /// Set the bind retry delay
    pub fn with_bind_retry_delay(mut self, delay: Duration) -> Self {
        self.bind_retry_delay = delay;
        self
    }

    /// Set the throttle retry delay
    pub fn with_throttle_retry(mut self, delay: Duration) -> Self {
        self.throttle_retry = delay;
        self
    }

    /// Set the per-connection outbound queue capacity
    pub fn with_send_queue_size(mut self, size: usize) -> Self {
        self.send_queue_size = size;
        self
    }

    /// Enable periodic world saves
    pub fn with_autosave(mut self, interval: Duration) -> Self {
        self.autosave_interval = Some(interval);
        self
    }

    /// Enable a scheduled restart
    pub fn with_restart_after(mut self, after: Duration) -> Self {
        self.restart_after = Some(after);
        self
    }

    /// Set the crash guard configuration
    pub fn with_crash_guard(mut self, crash_guard: CrashGuardConfig) -> Self {
        self.crash_guard = crash_guard;
        self
    }

    /// Validate the configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(invalid("at least one listener is required"));
        }

        if self.backlog == 0 {
            return Err(invalid("backlog must be greater than 0"));
        }

        if self.buffer_size == 0 {
            return Err(invalid("buffer_size must be greater than 0"));
        }

        if self.send_queue_size == 0 {
            return Err(invalid("send_queue_size must be greater than 0"));
        }

        if self.idle_timeout.is_zero() {
            return Err(invalid("idle_timeout must be greater than 0"));
        }

        if self.alive_check_interval.is_zero() {
            return Err(invalid("alive_check_interval must be greater than 0"));
        }

        if self.bind_retry_delay.is_zero() {
            return Err(invalid("bind_retry_delay must be greater than 0"));
        }

        if self.autosave_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(invalid("autosave_interval must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> NetError {
    NetError::InvalidConfig(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].port(), DEFAULT_PORT);
        assert_eq!(config.max_per_ip, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.bind_retry_delay, Duration::from_secs(10));
        assert!(config.autosave_interval.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ServerConfig::default()
            .with_listener("127.0.0.1:0".parse().unwrap())
            .with_max_per_ip(0)
            .with_buffer_size(512)
            .with_autosave(Duration::from_secs(300));

        assert_eq!(config.listeners[0].ip().to_string(), "127.0.0.1");
        assert_eq!(config.max_per_ip, 0);
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.autosave_interval, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());

        config.listeners.clear();
        assert!(matches!(config.validate(), Err(NetError::InvalidConfig(_))));

        let config = ServerConfig::default().with_buffer_size(0);
        assert!(config.validate().is_err());

        let config = ServerConfig::default().with_autosave(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ServerConfig::default().with_send_queue_size(0);
        assert!(config.validate().is_err());
    }
}

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

//! Crash report and backup
//!
//! The [`CrashGuard`] subscribes to `Crashed`. It waits for the last save
//! to reach disk, writes a report, takes a backup and then lets the
//! process close, optionally restarting it. Each stage is isolated: a
//! failing report or backup is logged and the next stage still runs.

use crate::config::CrashGuardConfig;
use crate::event::{CrashedEventArgs, EventSink, panic_message};
use crate::net_state_handler::NetStateHandler;
use crate::types::ConnectionInfo;
use crate::world::World;
use crate::{NetError, Result};
use chrono::Local;
use std::fmt::Write as _;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Longest wait for an in-flight save before the report is written anyway
pub const WRITE_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Copies persisted data somewhere safe
pub trait BackupService: Send + Sync {
    /// Take a backup labelled `label`; returns where it went
    fn backup(&self, label: &str) -> Result<PathBuf>;
}

/// Recursive copy of the save directory into `<root>/<label>/<timestamp>`
#[derive(Debug, Clone)]
pub struct DirectoryBackup {
    source: PathBuf,
    root: PathBuf,
}

impl DirectoryBackup {
    /// Back up `source` under `root`
    pub fn new(source: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            root: root.into(),
        }
    }
}

impl BackupService for DirectoryBackup {
    fn backup(&self, label: &str) -> Result<PathBuf> {
        if !self.source.is_dir() {
            return Err(NetError::BackupFailed(format!(
                "{} is not a directory",
                self.source.display()
            )));
        }
        let target = self
            .root
            .join(label)
            .join(Local::now().format(TIMESTAMP_FORMAT).to_string());
        copy_dir(&self.source, &target)?;
        Ok(target)
    }
}

fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &destination)?;
        } else {
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

/// Render a crash report
pub fn crash_report(args: &CrashedEventArgs, connections: &[ConnectionInfo]) -> String {
    let mut report = String::new();
    let _ = writeln!(report, "Server Crash Report");
    let _ = writeln!(report, "===================");
    let _ = writeln!(report);
    let _ = writeln!(report, "Emberlink Version {}", env!("CARGO_PKG_VERSION"));
    let _ = writeln!(
        report,
        "Operating System: {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    let _ = writeln!(report, "Time: {}", Local::now().to_rfc3339());
    let _ = writeln!(report, "Thread: {}", args.thread.as_deref().unwrap_or("unnamed"));
    let _ = writeln!(report);
    let _ = writeln!(report, "Exception:");
    let _ = writeln!(report, "{}", args.message);
    if let Some(location) = &args.location {
        let _ = writeln!(report, "at {}", location);
    }
    let _ = writeln!(report);
    let _ = writeln!(report, "Backtrace:");
    let _ = writeln!(report, "{}", args.backtrace);
    let _ = writeln!(report);
    let _ = writeln!(report, "Clients:");
    let _ = writeln!(report, "- Count: {}", connections.len());
    for connection in connections {
        let _ = writeln!(report, "+ {}", connection);
    }
    report
}

/// `Crashed` subscriber
pub struct CrashGuard {
    config: CrashGuardConfig,
    world: Arc<World>,
    registry: Arc<NetStateHandler>,
    backup: Arc<dyn BackupService>,
}

impl CrashGuard {
    /// Create a guard
    pub fn new(
        config: CrashGuardConfig,
        world: Arc<World>,
        registry: Arc<NetStateHandler>,
        backup: Arc<dyn BackupService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            world,
            registry,
            backup,
        })
    }

    /// Subscribe to `Crashed`
    pub fn install(self: &Arc<Self>, events: &EventSink) {
        let guard: Weak<Self> = Arc::downgrade(self);
        events.crashed.subscribe(move |args| {
            if let Some(guard) = guard.upgrade() {
                guard.on_crashed(args);
            }
        });
    }

    /// Run every stage for one crash
    pub fn on_crashed(&self, args: &CrashedEventArgs) {
        if !self.config.enabled {
            return;
        }

        if !self.world.wait_for_write_completion_timeout(WRITE_COMPLETION_TIMEOUT) {
            tracing::warn!("Save still writing, continuing crash handling");
        }

        self.stage("report", || self.write_report(args).map(|_| ()));
        if self.config.backup {
            self.stage("backup", || {
                let target = self.backup.backup("Crashed")?;
                tracing::info!(target = %target.display(), "Crash backup complete");
                Ok(())
            });
        }

        args.set_close(true);
        args.set_restart(self.config.restart);
    }

    /// Write the report file; returns its path
    pub fn write_report(&self, args: &CrashedEventArgs) -> Result<PathBuf> {
        let connections: Vec<ConnectionInfo> = self
            .registry
            .instances()
            .iter()
            .map(|net_state| net_state.info())
            .collect();
        let report = crash_report(args, &connections);

        fs::create_dir_all(&self.config.report_dir)?;
        let path = self.config.report_dir.join(format!(
            "Crash {}.log",
            Local::now().format(TIMESTAMP_FORMAT)
        ));
        fs::write(&path, report)?;
        tracing::info!(path = %path.display(), "Crash report written");
        Ok(path)
    }

    fn stage<F>(&self, name: &'static str, stage: F)
    where
        F: FnOnce() -> Result<()>,
    {
        match catch_unwind(AssertUnwindSafe(stage)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(stage = name, error = %err, "Crash handling stage failed")
            }
            Err(payload) => tracing::error!(
                stage = name,
                panic = %panic_message(payload.as_ref()),
                "Crash handling stage panicked"
            ),
        }
    }
}

impl std::fmt::Debug for CrashGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashGuard")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessControl;
    use crate::server_handler::ServerHandler;
    use crate::sync::{Signal, WriteBarrier};
    use crate::world::NoPersistence;
    use crate::{ServerConfig, ServerMetrics};

    struct Inert;

    impl ProcessControl for Inert {
        fn restart(&self) {}
        fn terminate(&self, _code: i32) {}
        fn await_acknowledgement(&self) {}
    }

    struct PanickingBackup;

    impl BackupService for PanickingBackup {
        fn backup(&self, _label: &str) -> Result<PathBuf> {
            panic!("backup exploded");
        }
    }

    fn guard(config: CrashGuardConfig, backup: Arc<dyn BackupService>) -> Arc<CrashGuard> {
        let events = Arc::new(EventSink::new());
        let registry = NetStateHandler::new(
            events.clone(),
            ServerConfig::default(),
            Arc::new(ServerMetrics::new()),
        );
        let barrier = Arc::new(WriteBarrier::new());
        let server = ServerHandler::new(
            events.clone(),
            Arc::new(Signal::new()),
            barrier.clone(),
            Arc::new(Inert),
        );
        let world = Arc::new(World::new(
            events,
            registry.clone(),
            server,
            barrier,
            Arc::new(NoPersistence),
        ));
        CrashGuard::new(config, world, registry, backup)
    }

    fn crash() -> CrashedEventArgs {
        CrashedEventArgs::new(
            "boom",
            Some("src/main.rs:1:1".into()),
            Some("emberlink-tick".into()),
            "0: main",
        )
    }

    #[test]
    fn test_report_contents() {
        let report = crash_report(&crash(), &[]);
        assert!(report.contains("Server Crash Report"));
        assert!(report.contains("boom"));
        assert!(report.contains("at src/main.rs:1:1"));
        assert!(report.contains("- Count: 0"));
    }

    #[test]
    fn test_directory_backup_copies_tree() {
        let dir = tempfile::tempdir().unwrap();
        let saves = dir.path().join("saves");
        fs::create_dir_all(saves.join("accounts")).unwrap();
        fs::write(saves.join("world.bin"), b"world").unwrap();
        fs::write(saves.join("accounts").join("a.xml"), b"<a/>").unwrap();

        let backup = DirectoryBackup::new(&saves, dir.path().join("backups"));
        let target = backup.backup("Crashed").unwrap();
        assert!(target.starts_with(dir.path().join("backups").join("Crashed")));
        assert_eq!(fs::read(target.join("world.bin")).unwrap(), b"world");
        assert_eq!(fs::read(target.join("accounts").join("a.xml")).unwrap(), b"<a/>");
    }

    #[test]
    fn test_directory_backup_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let backup = DirectoryBackup::new(dir.path().join("missing"), dir.path().join("backups"));
        assert!(matches!(backup.backup("Crashed"), Err(NetError::BackupFailed(_))));
    }

    #[test]
    fn test_guard_survives_failing_backup() {
        let dir = tempfile::tempdir().unwrap();
        let config = CrashGuardConfig {
            report_dir: dir.path().join("crashes"),
            restart: true,
            ..CrashGuardConfig::default()
        };
        let guard = guard(config, Arc::new(PanickingBackup));
        let args = crash();

        guard.on_crashed(&args);

        assert!(args.close());
        assert!(args.restart());
        let reports: Vec<_> = fs::read_dir(dir.path().join("crashes")).unwrap().collect();
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn test_disabled_guard_does_nothing() {
        let config = CrashGuardConfig {
            enabled: false,
            ..CrashGuardConfig::default()
        };
        let guard = guard(config, Arc::new(PanickingBackup));
        let args = crash();
        guard.on_crashed(&args);
        assert!(!args.close());
    }

    #[test]
    fn test_subscription_does_not_keep_guard_alive() {
        let dir = tempfile::tempdir().unwrap();
        let config = CrashGuardConfig {
            report_dir: dir.path().join("crashes"),
            backup: false,
            ..CrashGuardConfig::default()
        };
        let events = EventSink::new();
        let guard = guard(config, Arc::new(PanickingBackup));
        guard.install(&events);

        let handled = crash();
        events.crashed.publish(&handled);
        assert!(handled.close());

        let weak = Arc::downgrade(&guard);
        drop(guard);
        assert!(weak.upgrade().is_none());

        let ignored = crash();
        events.crashed.publish(&ignored);
        assert!(!ignored.close());
    }
}

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

//! Composition root
//!
//! The GameServer builds every component, wires them through one
//! [`EventSink`], schedules the periodic jobs and starts the tick thread.

use crate::crash::{BackupService, CrashGuard, DirectoryBackup};
use crate::event::{EventSink, ServerStartedEventArgs};
use crate::message_pump::MessagePump;
use crate::net_state_handler::NetStateHandler;
use crate::packet_handler::{PacketHandler, ProtocolModule};
use crate::process::{ProcessControl, SystemProcess};
use crate::server_handler::ServerHandler;
use crate::sync::{Signal, WriteBarrier};
use crate::timer::{TimerHandle, TimerService};
use crate::types::ServerSnapshot;
use crate::world::{ConfigPersistence, NoPersistence, World};
use crate::worker::ServerWorker;
use crate::{NetError, Result, ServerConfig, ServerMetrics};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Builder for [`GameServer`]
pub struct GameServerBuilder {
    config: ServerConfig,
    process: Arc<dyn ProcessControl>,
    persistence: Arc<dyn ConfigPersistence>,
    backup: Option<Arc<dyn BackupService>>,
    modules: Vec<Arc<dyn ProtocolModule>>,
    panic_hook: bool,
}

impl GameServerBuilder {
    /// Start from `config` with the real process and no persistence
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            process: Arc::new(SystemProcess),
            persistence: Arc::new(NoPersistence),
            backup: None,
            modules: Vec::new(),
            panic_hook: false,
        }
    }

    /// Replace process control
    pub fn with_process(mut self, process: Arc<dyn ProcessControl>) -> Self {
        self.process = process;
        self
    }

    /// Set the configuration persistence step
    pub fn with_persistence(mut self, persistence: Arc<dyn ConfigPersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Replace the crash backup service
    pub fn with_backup(mut self, backup: Arc<dyn BackupService>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Add a protocol module
    pub fn with_module(mut self, module: Arc<dyn ProtocolModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Install the process-wide panic hook
    pub fn with_panic_hook(mut self, enabled: bool) -> Self {
        self.panic_hook = enabled;
        self
    }

    /// Validate the configuration and wire every component
    pub fn build(self) -> Result<GameServer> {
        self.config.validate()?;
        let config = self.config;

        let events = Arc::new(EventSink::new());
        let signal = Arc::new(Signal::new());
        let barrier = Arc::new(WriteBarrier::new());
        let metrics = Arc::new(ServerMetrics::new());

        let registry = NetStateHandler::with_signal(
            events.clone(),
            config.clone(),
            metrics.clone(),
            signal.clone(),
        );
        let packets = PacketHandler::new(metrics.clone());
        for module in self.modules {
            packets.add_module(module);
        }
        packets.install(&events, &registry);

        let server =
            ServerHandler::new(events.clone(), signal.clone(), barrier.clone(), self.process);
        if self.panic_hook {
            server.install_panic_hook();
        }

        let world = Arc::new(World::new(
            events.clone(),
            registry.clone(),
            server.clone(),
            barrier,
            self.persistence,
        ));

        let crash_guard = if config.crash_guard.enabled {
            let backup = self.backup.unwrap_or_else(|| {
                Arc::new(DirectoryBackup::new(
                    config.crash_guard.save_dir.clone(),
                    config.crash_guard.backup_dir.clone(),
                ))
            });
            let guard = CrashGuard::new(
                config.crash_guard.clone(),
                world.clone(),
                registry.clone(),
                backup,
            );
            guard.install(&events);
            Some(guard)
        } else {
            None
        };

        let timers = Arc::new(TimerService::new(signal.clone()));
        let pump = Arc::new(MessagePump::new(
            config.clone(),
            events.clone(),
            signal,
            registry.clone(),
        ));
        let worker =
            ServerWorker::new(server.clone(), timers.clone(), pump.clone(), registry.clone());

        install_relays(&events, &pump, &registry);

        Ok(GameServer {
            config,
            events,
            metrics,
            registry,
            packets,
            server,
            world,
            timers,
            pump,
            worker,
            crash_guard,
            jobs: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }
}

/// Relay world broadcasts to every client and close listeners and
/// connections when the closing sequence starts
fn install_relays(events: &EventSink, pump: &Arc<MessagePump>, registry: &Arc<NetStateHandler>) {
    let clients: Weak<NetStateHandler> = Arc::downgrade(registry);
    events.world_broadcast.subscribe(move |args| {
        if let Some(clients) = clients.upgrade() {
            clients.broadcast(&args.message);
        }
    });

    let pump: Weak<MessagePump> = Arc::downgrade(pump);
    let registry: Weak<NetStateHandler> = Arc::downgrade(registry);
    events.server_closing.subscribe(move |_| {
        if let Some(pump) = pump.upgrade() {
            pump.dispose();
        }
        if let Some(registry) = registry.upgrade() {
            registry.dispose_all();
        }
    });
}

/// A fully wired server
pub struct GameServer {
    config: ServerConfig,
    events: Arc<EventSink>,
    metrics: Arc<ServerMetrics>,
    registry: Arc<NetStateHandler>,
    packets: Arc<PacketHandler>,
    server: Arc<ServerHandler>,
    world: Arc<World>,
    timers: Arc<TimerService>,
    pump: Arc<MessagePump>,
    worker: Arc<ServerWorker>,
    crash_guard: Option<Arc<CrashGuard>>,
    jobs: Mutex<Vec<TimerHandle>>,
    started: AtomicBool,
    started_at: Instant,
}

impl GameServer {
    /// Build with defaults
    pub fn new(config: ServerConfig) -> Result<Self> {
        GameServerBuilder::new(config).build()
    }

    /// Start a builder
    pub fn builder(config: ServerConfig) -> GameServerBuilder {
        GameServerBuilder::new(config)
    }

    /// Load the world, bind every listener, announce `ServerStarted` and
    /// start the tick thread
    ///
    /// Returns the bound addresses. Binding retries until every endpoint
    /// binds.
    pub async fn start(&self) -> Result<Vec<SocketAddr>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NetError::Other("Server already running".to_string()));
        }

        self.world.load();
        let addresses = self.pump.initialize().await;
        self.schedule_jobs();
        self.events.server_started.publish(&ServerStartedEventArgs);
        self.worker.spawn(tokio::runtime::Handle::current())?;

        tracing::info!(listeners = ?addresses, "Server started");
        Ok(addresses)
    }

    fn schedule_jobs(&self) {
        let mut jobs = self.jobs.lock();

        let registry = self.registry.clone();
        jobs.push(self.timers.delay_call(
            self.config.alive_check_delay,
            Some(self.config.alive_check_interval),
            move || {
                let expired = registry.check_all_alive(Instant::now());
                if expired > 0 {
                    tracing::debug!(expired, "Liveness sweep");
                }
            },
        ));

        if let Some(interval) = self.config.autosave_interval {
            let world = self.world.clone();
            jobs.push(
                self.timers
                    .delay_call(interval, Some(interval), move || world.save(true, false)),
            );
        }

        if let Some(after) = self.config.restart_after {
            let world = self.world.clone();
            let server = self.server.clone();
            jobs.push(self.timers.delay_call(after, None, move || {
                tracing::info!("Scheduled restart");
                world.save(true, false);
                server.kill_server(true);
            }));
        }
    }

    /// Stop accepting, close every connection, stop the tick thread and
    /// drain the disposal queue
    ///
    /// Does not exit the process; see [`ServerHandler::kill_server`].
    pub fn shutdown(&self) {
        for job in self.jobs.lock().drain(..) {
            job.stop();
        }
        self.pump.dispose();
        self.registry.dispose_all();
        self.worker.stop();
        while self.registry.process_disposed_queue() > 0 {}
        tracing::info!("Server stopped");
    }

    /// Non-blocking status
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            active_connections: self.registry.count(),
            total_connections: self.metrics.total_connections(),
            listeners: self.pump.local_addrs(),
            paused: self.registry.is_paused(),
            uptime: self.started_at.elapsed(),
        }
    }

    /// Configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Event hub
    pub fn events(&self) -> &Arc<EventSink> {
        &self.events
    }

    /// Metrics
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Connection registry
    pub fn registry(&self) -> &Arc<NetStateHandler> {
        &self.registry
    }

    /// Action dispatcher
    pub fn packets(&self) -> &Arc<PacketHandler> {
        &self.packets
    }

    /// Run state and crash pipeline
    pub fn server_handler(&self) -> &Arc<ServerHandler> {
        &self.server
    }

    /// Save/load coordinator
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// Timer service
    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    /// Listener owner
    pub fn pump(&self) -> &Arc<MessagePump> {
        &self.pump
    }

    /// Tick loop
    pub fn worker(&self) -> &Arc<ServerWorker> {
        &self.worker
    }

    /// Crash guard, when enabled
    pub fn crash_guard(&self) -> Option<&Arc<CrashGuard>> {
        self.crash_guard.as_ref()
    }
}

impl std::fmt::Debug for GameServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameServer")
            .field("snapshot", &self.snapshot())
            .field("run_state", &self.server.state())
            .finish()
    }
}

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

//! World load/save orchestration

use crate::Result;
use crate::event::{EventSink, WorldBroadcastEventArgs, WorldLoadEventArgs, WorldSaveEventArgs};
use crate::net_state_handler::NetStateHandler;
use crate::server_handler::ServerHandler;
use crate::sync::WriteBarrier;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Message broadcast before an announced save
pub const SAVE_ANNOUNCEMENT: &str = "The world is saving, please wait.";

/// The "persist configuration" step of a save
pub trait ConfigPersistence: Send + Sync {
    /// Write the current configuration to durable storage
    fn persist(&self) -> Result<()>;
}

/// No configuration to persist
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersistence;

impl ConfigPersistence for NoPersistence {
    fn persist(&self) -> Result<()> {
        Ok(())
    }
}

/// Save/load coordinator
pub struct World {
    events: Arc<EventSink>,
    registry: Arc<NetStateHandler>,
    server: Arc<ServerHandler>,
    barrier: Arc<WriteBarrier>,
    persistence: Arc<dyn ConfigPersistence>,
    loaded: AtomicBool,
}

impl World {
    /// Create a coordinator
    pub fn new(
        events: Arc<EventSink>,
        registry: Arc<NetStateHandler>,
        server: Arc<ServerHandler>,
        barrier: Arc<WriteBarrier>,
        persistence: Arc<dyn ConfigPersistence>,
    ) -> Self {
        Self {
            events,
            registry,
            server,
            barrier,
            persistence,
            loaded: AtomicBool::new(false),
        }
    }

    /// Whether [`load`](Self::load) has run
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Publish `WorldLoad`; runs at most once
    pub fn load(&self) {
        if self.loaded.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Loading world");
        let started = Instant::now();
        self.events.world_load.publish(&WorldLoadEventArgs);
        tracing::info!(elapsed = ?started.elapsed(), "World loaded");
    }

    /// Snapshot the world
    ///
    /// A call made while a save is running does nothing. Receives are paused
    /// for the duration. Unless `permit_background_write` is set, the write
    /// barrier is released before returning; otherwise the persistence
    /// collaborator calls [`notify_disk_write_complete`](Self::notify_disk_write_complete).
    /// A panicking subscriber is logged and the save carries on; a panic
    /// anywhere else still resumes the registry and opens the barrier.
    pub fn save(&self, announce: bool, permit_background_write: bool) {
        if !self.server.begin_save() {
            tracing::debug!("Save already in progress");
            return;
        }

        self.registry.pause();
        let _cycle = SaveCycle {
            world: self,
            release_barrier: !permit_background_write,
        };
        self.barrier.wait();
        self.barrier.begin();

        if announce {
            self.events.world_broadcast.publish(&WorldBroadcastEventArgs {
                message: SAVE_ANNOUNCEMENT.to_string(),
            });
        }

        tracing::info!("Saving world");
        let started = Instant::now();
        let failures = self
            .events
            .world_save
            .publish_isolated(&WorldSaveEventArgs { announce });
        if failures > 0 {
            tracing::error!(failures, "World save subscribers failed");
        }

        if let Err(err) = self.persistence.persist() {
            tracing::error!(error = %err, "Failed to persist configuration");
        }

        self.registry.metrics().save_completed();
        tracing::info!(elapsed = ?started.elapsed(), "World saved");
    }

    /// Block until the last save's data is durable
    pub fn wait_for_write_completion(&self) {
        self.barrier.wait();
    }

    /// Block until the last save's data is durable or `timeout` elapses
    ///
    /// Returns `true` if the data is durable.
    pub fn wait_for_write_completion_timeout(&self, timeout: Duration) -> bool {
        self.barrier.wait_timeout(timeout)
    }

    /// The last save's data is durable
    pub fn notify_disk_write_complete(&self) {
        self.barrier.complete();
    }

    /// Whether no durable write is outstanding
    pub fn is_write_complete(&self) -> bool {
        self.barrier.is_complete()
    }
}

/// Closes one save: releases the barrier, resumes receives, frees the slot
struct SaveCycle<'a> {
    world: &'a World,
    release_barrier: bool,
}

impl Drop for SaveCycle<'_> {
    fn drop(&mut self) {
        if self.release_barrier || std::thread::panicking() {
            self.world.notify_disk_write_complete();
        }
        self.world.registry.resume();
        self.world.server.end_save();
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("loaded", &self.is_loaded())
            .field("saving", &self.server.is_saving())
            .field("write_complete", &self.is_write_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessControl;
    use crate::sync::Signal;
    use crate::{NetError, ServerConfig, ServerMetrics};
    use std::sync::atomic::AtomicUsize;

    struct Inert;

    impl ProcessControl for Inert {
        fn restart(&self) {}
        fn terminate(&self, _code: i32) {}
        fn await_acknowledgement(&self) {}
    }

    struct Failing;

    impl ConfigPersistence for Failing {
        fn persist(&self) -> Result<()> {
            Err(NetError::Other("disk full".into()))
        }
    }

    struct Exploding;

    impl ConfigPersistence for Exploding {
        fn persist(&self) -> Result<()> {
            panic!("persistence exploded");
        }
    }

    type Fixture = (Arc<World>, Arc<EventSink>, Arc<NetStateHandler>, Arc<ServerHandler>);

    fn world(persistence: Arc<dyn ConfigPersistence>) -> Fixture {
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
            events.clone(),
            registry.clone(),
            server.clone(),
            barrier,
            persistence,
        ));
        (world, events, registry, server)
    }

    #[test]
    fn test_load_runs_once() {
        let (world, events, _, _) = world(Arc::new(NoPersistence));
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        events.world_load.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        world.load();
        world.load();
        assert!(world.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_save_pauses_during_fan_out() {
        let (world, events, registry, _) = world(Arc::new(NoPersistence));
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        let paused_registry = registry.clone();
        events.world_save.subscribe(move |_| {
            flag.store(paused_registry.is_paused(), Ordering::SeqCst);
        });

        world.save(false, false);
        assert!(observed.load(Ordering::SeqCst));
        assert!(!registry.is_paused());
        assert!(world.is_write_complete());
    }

    #[test]
    fn test_nested_save_is_noop() {
        let (world, events, _, _) = world(Arc::new(NoPersistence));
        let saves = Arc::new(AtomicUsize::new(0));
        let counter = saves.clone();
        let inner = Arc::downgrade(&world);
        events.world_save.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(world) = inner.upgrade() {
                world.save(false, false);
            }
        });

        world.save(false, false);
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_announce_broadcasts() {
        let (world, events, _, _) = world(Arc::new(NoPersistence));
        let messages = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = messages.clone();
        events
            .world_broadcast
            .subscribe(move |args| sink.lock().push(args.message.clone()));

        world.save(true, false);
        world.save(false, false);
        assert_eq!(*messages.lock(), vec![SAVE_ANNOUNCEMENT.to_string()]);
    }

    #[test]
    fn test_background_write_holds_barrier() {
        let (world, _, _, _) = world(Arc::new(Failing));
        world.save(false, true);
        assert!(!world.is_write_complete());
        world.notify_disk_write_complete();
        world.wait_for_write_completion();
        assert!(world.is_write_complete());
    }

    #[test]
    fn test_panicking_subscriber_does_not_wedge_save() {
        let (world, events, registry, server) = world(Arc::new(NoPersistence));
        let saves = Arc::new(AtomicUsize::new(0));
        let counter = saves.clone();
        events.world_save.subscribe(|_| panic!("snapshot failed"));
        events.world_save.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        world.save(false, false);
        assert!(!registry.is_paused());
        assert!(!server.is_saving());
        assert!(world.is_write_complete());

        world.save(false, false);
        assert_eq!(saves.load(Ordering::SeqCst), 2);
        assert_eq!(registry.metrics().snapshot().saves, 2);
    }

    #[test]
    fn test_panic_mid_save_restores_state() {
        let (world, _, registry, server) = world(Arc::new(Exploding));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            world.save(false, true);
        }));

        assert!(outcome.is_err());
        assert!(!registry.is_paused());
        assert!(!server.is_saving());
        assert!(world.is_write_complete());
        assert!(world.wait_for_write_completion_timeout(Duration::from_millis(10)));
    }
}

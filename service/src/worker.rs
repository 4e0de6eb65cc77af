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

//! The tick thread
//!
//! The ServerWorker owns the single coordinator loop:
//! - wait on the wake signal, bounded by the next timer deadline
//! - run due timers
//! - promote accepted sockets into connections
//! - drain the disposal queue
//!
//! It is the only thread that structurally changes the live connection
//! list. A panic inside a tick goes to the crash pipeline.

use crate::Result;
use crate::message_pump::MessagePump;
use crate::net_state_handler::NetStateHandler;
use crate::server_handler::ServerHandler;
use crate::timer::TimerService;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Name of the tick thread
pub const TICK_THREAD_NAME: &str = "emberlink-tick";

/// Longest the loop sleeps without a wake or a timer
const MAX_IDLE: Duration = Duration::from_secs(1);

/// Single coordinator loop
pub struct ServerWorker {
    server: Arc<ServerHandler>,
    timers: Arc<TimerService>,
    pump: Arc<MessagePump>,
    registry: Arc<NetStateHandler>,
    stop: AtomicBool,
    ticks: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServerWorker {
    /// Create a worker; nothing runs until [`spawn`](Self::spawn)
    pub fn new(
        server: Arc<ServerHandler>,
        timers: Arc<TimerService>,
        pump: Arc<MessagePump>,
        registry: Arc<NetStateHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            timers,
            pump,
            registry,
            stop: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            thread: Mutex::new(None),
        })
    }

    /// One iteration: timers, then accepted sockets, then disposals
    pub fn tick(&self, now: Instant) {
        self.timers.slice(now);
        self.pump.slice();
        self.registry.process_disposed_queue();
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Ticks completed
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Start the tick thread inside `runtime`'s context
    pub fn spawn(self: &Arc<Self>, runtime: tokio::runtime::Handle) -> Result<()> {
        let worker = self.clone();
        let handle = std::thread::Builder::new()
            .name(TICK_THREAD_NAME.to_string())
            .spawn(move || worker.run(runtime))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.server.is_closing() || self.server.has_crashed()
    }

    fn run(&self, runtime: tokio::runtime::Handle) {
        let _context = runtime.enter();
        self.server.set_tick_thread();
        tracing::debug!("Tick loop started");

        while !self.should_stop() {
            let now = Instant::now();
            let timeout = self
                .timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(MAX_IDLE)
                .min(MAX_IDLE);
            self.server.signal().wait_timeout(timeout);
            if self.should_stop() {
                break;
            }

            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.tick(Instant::now()))) {
                self.server.crash(payload.as_ref());
                break;
            }
        }
        tracing::debug!("Tick loop stopped");
    }

    /// Stop the loop and join the thread
    ///
    /// Does not join when called from the tick thread itself.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.server.set();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Tick thread terminated abnormally");
            }
        }
    }
}

impl std::fmt::Debug for ServerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerWorker")
            .field("ticks", &self.ticks())
            .field("stopped", &self.stop.load(Ordering::Acquire))
            .finish()
    }
}

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

//! Run state and the crash pipeline
//!
//! ```text
//! Running --(panic on the tick thread)--> Crashed --> restart | terminate
//! Running --(kill_server)---------------> Closing --> restart | terminate
//! ```
//!
//! Whichever path runs first makes the single call into [`ProcessControl`].

use crate::crash::WRITE_COMPLETION_TIMEOUT;
use crate::event::{
    CrashedEventArgs, EventSink, ServerClosingEventArgs, ShutdownEventArgs, panic_message,
};
use crate::process::ProcessControl;
use crate::sync::{Signal, WriteBarrier};
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;

/// Global run flags
///
/// All flags are one-way except `saving`, which toggles per save.
#[derive(Debug, Default)]
pub struct RunState {
    closing: AtomicBool,
    crashed: AtomicBool,
    restarting: AtomicBool,
    saving: AtomicBool,
}

/// Point-in-time copy of [`RunState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStateSnapshot {
    /// Closing sequence started
    pub closing: bool,
    /// A terminating panic was handled
    pub crashed: bool,
    /// The process will be re-executed
    pub restarting: bool,
    /// A world save is running
    pub saving: bool,
}

impl RunState {
    /// Copy every flag
    pub fn snapshot(&self) -> RunStateSnapshot {
        RunStateSnapshot {
            closing: self.closing.load(Ordering::Acquire),
            crashed: self.crashed.load(Ordering::Acquire),
            restarting: self.restarting.load(Ordering::Acquire),
            saving: self.saving.load(Ordering::Acquire),
        }
    }
}

/// Panic details captured by the panic hook
#[derive(Debug, Clone)]
pub struct PanicDetails {
    /// Panic message
    pub message: String,
    /// `file:line:column`, when known
    pub location: Option<String>,
    /// Thread name
    pub thread: Option<String>,
    /// Backtrace at the panic site
    pub backtrace: String,
}

/// Global run state, wake signal and crash handling
pub struct ServerHandler {
    events: Arc<EventSink>,
    signal: Arc<Signal>,
    barrier: Arc<WriteBarrier>,
    process: Arc<dyn ProcessControl>,
    state: RunState,
    exited: AtomicBool,
    write_timeout: Mutex<Duration>,
    tick_thread: Mutex<Option<ThreadId>>,
    last_panic: Mutex<Option<PanicDetails>>,
}

impl ServerHandler {
    /// Create a handler in the running state
    pub fn new(
        events: Arc<EventSink>,
        signal: Arc<Signal>,
        barrier: Arc<WriteBarrier>,
        process: Arc<dyn ProcessControl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            events,
            signal,
            barrier,
            process,
            state: RunState::default(),
            exited: AtomicBool::new(false),
            write_timeout: Mutex::new(WRITE_COMPLETION_TIMEOUT),
            tick_thread: Mutex::new(None),
            last_panic: Mutex::new(None),
        })
    }

    /// Wake the tick loop
    pub fn set(&self) {
        self.signal.set();
    }

    /// Longest `kill_server` waits for an outstanding durable write
    pub fn set_write_timeout(&self, timeout: Duration) {
        *self.write_timeout.lock() = timeout;
    }

    /// Tick loop wake signal
    pub fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }

    /// Run flags
    pub fn state(&self) -> RunStateSnapshot {
        self.state.snapshot()
    }

    /// Closing sequence started
    pub fn is_closing(&self) -> bool {
        self.state.closing.load(Ordering::Acquire)
    }

    /// A terminating panic was handled
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::Acquire)
    }

    /// The process will be re-executed
    pub fn is_restarting(&self) -> bool {
        self.state.restarting.load(Ordering::Acquire)
    }

    /// A world save is running
    pub fn is_saving(&self) -> bool {
        self.state.saving.load(Ordering::Acquire)
    }

    /// Claim the save slot; `false` if a save is already running
    pub(crate) fn begin_save(&self) -> bool {
        self.state
            .saving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_save(&self) {
        self.state.saving.store(false, Ordering::Release);
    }

    /// Record the calling thread as the tick thread
    pub(crate) fn set_tick_thread(&self) {
        *self.tick_thread.lock() = Some(std::thread::current().id());
    }

    fn is_tick_thread(&self) -> bool {
        *self.tick_thread.lock() == Some(std::thread::current().id())
    }

    /// Route every panic through tracing
    ///
    /// Panics on the tick thread are stashed for the crash report; panics on
    /// other threads are logged as non-terminating.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let handler: Weak<Self> = Arc::downgrade(self);
        std::panic::set_hook(Box::new(move |info| {
            let details = PanicDetails {
                message: panic_message(info.payload()),
                location: info.location().map(|location| location.to_string()),
                thread: std::thread::current().name().map(str::to_string),
                backtrace: Backtrace::force_capture().to_string(),
            };
            match handler.upgrade() {
                Some(handler) if handler.is_tick_thread() => {
                    tracing::error!(
                        panic = %details.message,
                        location = details.location.as_deref().unwrap_or("unknown"),
                        "Panic on tick thread"
                    );
                    *handler.last_panic.lock() = Some(details);
                }
                _ => tracing::warn!(
                    panic = %details.message,
                    location = details.location.as_deref().unwrap_or("unknown"),
                    thread = details.thread.as_deref().unwrap_or("unnamed"),
                    "Non-terminating panic"
                ),
            }
        }));
    }

    /// Take the details stashed by the panic hook
    pub(crate) fn take_last_panic(&self) -> Option<PanicDetails> {
        self.last_panic.lock().take()
    }

    /// Handle an unhandled panic
    ///
    /// Non-terminating panics are logged. A terminating panic marks the
    /// server crashed, publishes `Crashed` once, waits for an operator unless
    /// a subscriber set `close`, then restarts or terminates.
    pub fn unhandled_exception(&self, details: PanicDetails, terminating: bool) {
        if !terminating {
            tracing::warn!(panic = %details.message, "Unhandled panic (non-terminating)");
            return;
        }

        tracing::error!(
            panic = %details.message,
            location = details.location.as_deref().unwrap_or("unknown"),
            "Unhandled panic (terminating)"
        );
        if self.state.crashed.swap(true, Ordering::AcqRel) {
            return;
        }

        let args = CrashedEventArgs::new(
            details.message,
            details.location,
            details.thread,
            details.backtrace,
        );
        self.events.crashed.publish_isolated(&args);

        if !args.close() {
            self.process.await_acknowledgement();
        }
        self.signal.set();
        self.exit(args.close() && args.restart(), 1);
    }

    /// Convert a caught panic payload into an unhandled exception
    pub(crate) fn crash(&self, payload: &(dyn std::any::Any + Send)) {
        let details = self.take_last_panic().unwrap_or_else(|| PanicDetails {
            message: panic_message(payload),
            location: None,
            thread: std::thread::current().name().map(str::to_string),
            backtrace: Backtrace::force_capture().to_string(),
        });
        self.unhandled_exception(details, true);
    }

    /// Close the server
    ///
    /// Idempotent. Publishes `ServerClosing`, waits a bounded time for any
    /// durable write in progress, publishes `Shutdown` unless crashed, then restarts or
    /// terminates. Blocks the calling thread.
    pub fn kill_server(&self, restart: bool) {
        if self.state.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(restart, "Server closing");

        self.events
            .server_closing
            .publish_isolated(&ServerClosingEventArgs { restart });
        let write_timeout = *self.write_timeout.lock();
        if !self.barrier.wait_timeout(write_timeout) {
            tracing::warn!(timeout = ?write_timeout, "Durable write still pending, closing anyway");
        }
        if !self.has_crashed() {
            self.events.shutdown.publish_isolated(&ShutdownEventArgs);
        }
        self.signal.set();
        self.exit(restart, 0);
    }

    fn exit(&self, restart: bool, code: i32) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        if restart {
            self.state.restarting.store(true, Ordering::Release);
            tracing::info!("Restarting");
            self.process.restart();
        } else {
            tracing::info!(code, "Terminating");
            self.process.terminate(code);
        }
    }
}

impl std::fmt::Debug for ServerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandler")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        restarts: AtomicUsize,
        terminates: AtomicUsize,
        acknowledgements: AtomicUsize,
    }

    impl ProcessControl for Recorder {
        fn restart(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }

        fn terminate(&self, _code: i32) {
            self.terminates.fetch_add(1, Ordering::SeqCst);
        }

        fn await_acknowledgement(&self) {
            self.acknowledgements.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handler() -> (Arc<ServerHandler>, Arc<Recorder>, Arc<EventSink>) {
        let events = Arc::new(EventSink::new());
        let process = Arc::new(Recorder::default());
        let handler = ServerHandler::new(
            events.clone(),
            Arc::new(Signal::new()),
            Arc::new(WriteBarrier::new()),
            process.clone(),
        );
        (handler, process, events)
    }

    fn details() -> PanicDetails {
        PanicDetails {
            message: "boom".into(),
            location: Some("src/lib.rs:1:1".into()),
            thread: Some("emberlink-tick".into()),
            backtrace: String::new(),
        }
    }

    #[test]
    fn test_kill_server_is_idempotent() {
        let (handler, process, events) = handler();
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = shutdowns.clone();
        events.shutdown.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handler.kill_server(false);
        handler.kill_server(true);

        assert!(handler.is_closing());
        assert!(!handler.is_restarting());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(process.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(process.restarts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_kill_server_gives_up_on_stuck_write() {
        let events = Arc::new(EventSink::new());
        let process = Arc::new(Recorder::default());
        let barrier = Arc::new(WriteBarrier::new());
        let handler = ServerHandler::new(
            events,
            Arc::new(Signal::new()),
            barrier.clone(),
            process.clone(),
        );
        handler.set_write_timeout(Duration::from_millis(50));
        barrier.begin();

        let started = std::time::Instant::now();
        handler.kill_server(false);

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!barrier.is_complete());
        assert_eq!(process.terminates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kill_server_restart() {
        let (handler, process, _) = handler();
        handler.kill_server(true);
        assert!(handler.is_restarting());
        assert_eq!(process.restarts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_crash_without_close_waits_for_operator() {
        let (handler, process, _) = handler();
        handler.unhandled_exception(details(), true);

        assert!(handler.has_crashed());
        assert_eq!(process.acknowledgements.load(Ordering::SeqCst), 1);
        assert_eq!(process.terminates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_crash_close_and_restart() {
        let (handler, process, events) = handler();
        events.crashed.subscribe(|args| {
            args.set_close(true);
            args.set_restart(true);
        });

        handler.unhandled_exception(details(), true);
        handler.unhandled_exception(details(), true);

        assert_eq!(process.acknowledgements.load(Ordering::SeqCst), 0);
        assert_eq!(process.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(process.terminates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_kill_after_crash_skips_shutdown_and_exit() {
        let (handler, process, events) = handler();
        events.crashed.subscribe(|args| args.set_close(true));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = shutdowns.clone();
        events.shutdown.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handler.unhandled_exception(details(), true);
        handler.kill_server(false);

        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(process.terminates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_non_terminating_is_logged_only() {
        let (handler, process, _) = handler();
        handler.unhandled_exception(details(), false);
        assert!(!handler.has_crashed());
        assert_eq!(process.terminates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_save_slot() {
        let (handler, _, _) = handler();
        assert!(handler.begin_save());
        assert!(!handler.begin_save());
        assert!(handler.state().saving);
        handler.end_save();
        assert!(!handler.is_saving());
    }
}

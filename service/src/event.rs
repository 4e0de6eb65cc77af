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

//! Typed publish/subscribe hub
//!
//! The [`EventSink`] is constructed once by the composition root and handed
//! to every component that publishes or subscribes. Each event kind is an
//! [`Event<A>`] multicast list keyed by its argument type.
//!
//! ```
//! use emberlink_service::EventSink;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let events = EventSink::new();
//! let loads = Arc::new(AtomicUsize::new(0));
//! let counter = loads.clone();
//! events.world_load.subscribe(move |_| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//! events.world_load.publish(&Default::default());
//! assert_eq!(loads.load(Ordering::SeqCst), 1);
//! ```

use crate::net_state::NetState;
use crate::types::ConnectionId;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Subscriber callback
pub type Subscriber<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// One multicast subscription list
pub struct Event<A> {
    name: &'static str,
    subscribers: RwLock<Vec<Subscriber<A>>>,
}

impl<A> Event<A> {
    /// Create an empty event
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Event name used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append a subscriber
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(callback));
    }

    /// Number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Invoke every subscriber in subscription order
    ///
    /// Subscribers run outside the list lock, so they may subscribe or
    /// publish themselves. A panicking subscriber propagates to the caller.
    pub fn publish(&self, args: &A) {
        for subscriber in self.snapshot() {
            subscriber(args);
        }
    }

    /// Invoke every subscriber, catching and logging panics per subscriber
    ///
    /// Returns the number of subscribers that panicked.
    pub fn publish_isolated(&self, args: &A) -> usize {
        let mut failures = 0;
        for subscriber in self.snapshot() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber(args))) {
                failures += 1;
                tracing::error!(
                    event = self.name,
                    panic = %panic_message(payload.as_ref()),
                    "Event subscriber panicked"
                );
            }
        }
        failures
    }

    fn snapshot(&self) -> Vec<Subscriber<A>> {
        self.subscribers.read().clone()
    }
}

impl<A> fmt::Debug for Event<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// A socket was accepted and is about to become a connection
///
/// Any subscriber may veto it with [`reject`](Self::reject).
#[derive(Debug)]
pub struct SocketConnectEventArgs {
    /// Remote endpoint of the accepted socket
    pub peer_addr: SocketAddr,
    allowed: AtomicBool,
}

impl SocketConnectEventArgs {
    /// New, allowed by default
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            allowed: AtomicBool::new(true),
        }
    }

    /// Veto the connection
    pub fn reject(&self) {
        self.allowed.store(false, Ordering::SeqCst);
    }

    /// Whether every subscriber let the connection through
    pub fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }
}

/// A connection entered the registry
#[derive(Debug, Clone)]
pub struct NetStateAddedEventArgs {
    /// The new connection
    pub net_state: Arc<NetState>,
}

/// A connection was disposed
#[derive(Debug, Clone)]
pub struct NetStateRemovedEventArgs {
    /// The disposed connection
    pub net_state: Arc<NetState>,
}

impl NetStateRemovedEventArgs {
    /// ID of the disposed connection
    pub fn id(&self) -> ConnectionId {
        self.net_state.id()
    }
}

/// Persistence collaborators should load world state
#[derive(Debug, Clone, Default)]
pub struct WorldLoadEventArgs;

/// Persistence collaborators should snapshot world state
#[derive(Debug, Clone, Default)]
pub struct WorldSaveEventArgs {
    /// The save is announced to players
    pub announce: bool,
}

/// A message should be shown to every player
#[derive(Debug, Clone, Default)]
pub struct WorldBroadcastEventArgs {
    /// Message text
    pub message: String,
}

/// Startup finished; listeners are bound and the world is loaded
#[derive(Debug, Clone, Default)]
pub struct ServerStartedEventArgs;

/// The closing sequence has begun
#[derive(Debug, Clone, Default)]
pub struct ServerClosingEventArgs {
    /// The process will be re-executed
    pub restart: bool,
}

/// Normal shutdown, not published after a crash
#[derive(Debug, Clone, Default)]
pub struct ShutdownEventArgs;

/// A terminating panic reached the crash pipeline
///
/// Subscribers set [`close`](Self::set_close) to let the process exit
/// without operator acknowledgement, and [`restart`](Self::set_restart) to
/// re-execute it.
#[derive(Debug)]
pub struct CrashedEventArgs {
    /// Panic message
    pub message: String,
    /// Panic location, when known
    pub location: Option<String>,
    /// Name of the panicking thread
    pub thread: Option<String>,
    /// Captured backtrace
    pub backtrace: String,
    close: AtomicBool,
    restart: AtomicBool,
}

impl CrashedEventArgs {
    /// New crash with neither outcome flag set
    pub fn new(
        message: impl Into<String>,
        location: Option<String>,
        thread: Option<String>,
        backtrace: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            location,
            thread,
            backtrace: backtrace.into(),
            close: AtomicBool::new(false),
            restart: AtomicBool::new(false),
        }
    }

    /// Let the process exit without waiting for acknowledgement
    pub fn set_close(&self, close: bool) {
        self.close.store(close, Ordering::SeqCst);
    }

    /// Whether a subscriber opted to close
    pub fn close(&self) -> bool {
        self.close.load(Ordering::SeqCst)
    }

    /// Re-execute the process instead of terminating
    pub fn set_restart(&self, restart: bool) {
        self.restart.store(restart, Ordering::SeqCst);
    }

    /// Whether a subscriber asked for a restart
    pub fn restart(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }
}

/// Process-wide event hub
#[derive(Debug)]
pub struct EventSink {
    /// Cancellable accept-time validation
    pub socket_connect: Event<SocketConnectEventArgs>,
    /// Connection entered the registry
    pub net_state_added: Event<NetStateAddedEventArgs>,
    /// Connection disposed
    pub net_state_removed: Event<NetStateRemovedEventArgs>,
    /// World load fan-out
    pub world_load: Event<WorldLoadEventArgs>,
    /// World save fan-out
    pub world_save: Event<WorldSaveEventArgs>,
    /// Player-visible broadcast
    pub world_broadcast: Event<WorldBroadcastEventArgs>,
    /// Startup finished
    pub server_started: Event<ServerStartedEventArgs>,
    /// Closing sequence started
    pub server_closing: Event<ServerClosingEventArgs>,
    /// Normal shutdown
    pub shutdown: Event<ShutdownEventArgs>,
    /// Crash pipeline
    pub crashed: Event<CrashedEventArgs>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    /// Create a hub with no subscribers
    pub fn new() -> Self {
        Self {
            socket_connect: Event::new("SocketConnect"),
            net_state_added: Event::new("NetStateAdded"),
            net_state_removed: Event::new("NetStateRemoved"),
            world_load: Event::new("WorldLoad"),
            world_save: Event::new("WorldSave"),
            world_broadcast: Event::new("WorldBroadcast"),
            server_started: Event::new("ServerStarted"),
            server_closing: Event::new("ServerClosing"),
            shutdown: Event::new("Shutdown"),
            crashed: Event::new("Crashed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_in_subscription_order() {
        let event: Event<u32> = Event::new("test");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in 0..3 {
            let seen = seen.clone();
            event.subscribe(move |value| seen.lock().push((tag, *value)));
        }

        event.publish(&7);
        assert_eq!(*seen.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_subscriber_may_subscribe_during_publish() {
        let event = Arc::new(Event::<()>::new("reentrant"));
        let inner = event.clone();
        event.subscribe(move |_| inner.subscribe(|_| {}));

        event.publish(&());
        assert_eq!(event.subscriber_count(), 2);
    }

    #[test]
    fn test_socket_connect_veto() {
        let events = EventSink::new();
        events.socket_connect.subscribe(|args| {
            if args.peer_addr.port() == 666 {
                args.reject();
            }
        });

        let allowed = SocketConnectEventArgs::new("10.0.0.1:1000".parse().unwrap());
        events.socket_connect.publish(&allowed);
        assert!(allowed.is_allowed());

        let vetoed = SocketConnectEventArgs::new("10.0.0.1:666".parse().unwrap());
        events.socket_connect.publish(&vetoed);
        assert!(!vetoed.is_allowed());
    }

    #[test]
    fn test_publish_isolated_survives_panics() {
        let event: Event<()> = Event::new("isolated");
        let calls = Arc::new(AtomicUsize::new(0));
        event.subscribe(|_| panic!("first subscriber fails"));
        let counter = calls.clone();
        event.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(event.publish_isolated(&()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_crashed_flags() {
        let args = CrashedEventArgs::new("boom", None, Some("main".into()), "");
        assert!(!args.close());
        assert!(!args.restart());
        args.set_close(true);
        args.set_restart(true);
        assert!(args.close() && args.restart());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "Box<dyn Any>");
    }
}

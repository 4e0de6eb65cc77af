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

//! Connection registry
//!
//! The NetStateHandler is responsible for:
//! - Holding every live connection
//! - The single-character protocol dispatch table
//! - The deferred disposal queue drained by the tick thread
//! - Pausing and resuming receives around a world save
//! - Liveness sweeps, broadcast and per-IP limits

use crate::event::{EventSink, NetStateAddedEventArgs};
use crate::net_state::{BoxedTransport, NetState};
use crate::sync::Signal;
use crate::types::ConnectionId;
use crate::{ServerConfig, ServerMetrics};
use dashmap::DashMap;
use emberlink_codec::dispatch_key;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Most connections removed per disposal drain
pub const DISPOSAL_BATCH: usize = 200;

/// Handler for every frame starting with one dispatch key
pub type ProtocolHandler = Arc<dyn Fn(&Arc<NetState>, &str) + Send + Sync>;

/// Connection registry
pub struct NetStateHandler {
    events: Arc<EventSink>,
    config: ServerConfig,
    metrics: Arc<ServerMetrics>,
    signal: Arc<Signal>,
    instances: DashMap<ConnectionId, Arc<NetState>>,
    disposed: Mutex<VecDeque<Arc<NetState>>>,
    protocols: DashMap<char, ProtocolHandler>,
    paused: AtomicBool,
    next_id: AtomicU64,
}

impl NetStateHandler {
    /// Create a registry with a private wake signal
    pub fn new(
        events: Arc<EventSink>,
        config: ServerConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Arc<Self> {
        Self::with_signal(events, config, metrics, Arc::new(Signal::new()))
    }

    /// Create a registry that wakes `signal` whenever a connection is disposed
    ///
    /// The per-IP limiter is subscribed to `SocketConnect`.
    pub fn with_signal(
        events: Arc<EventSink>,
        config: ServerConfig,
        metrics: Arc<ServerMetrics>,
        signal: Arc<Signal>,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            events,
            config,
            metrics,
            signal,
            instances: DashMap::new(),
            disposed: Mutex::new(VecDeque::new()),
            protocols: DashMap::new(),
            paused: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });
        handler.install_ip_limiter();
        handler
    }

    fn install_ip_limiter(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        self.events.socket_connect.subscribe(move |args| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let limit = registry.config.max_per_ip;
            if limit == 0 || !args.is_allowed() {
                return;
            }
            let ip = args.peer_addr.ip();
            let count = registry.count_for_ip(ip);
            if count >= limit {
                tracing::info!(
                    peer_addr = %args.peer_addr,
                    count,
                    limit,
                    "Connection limit reached for address"
                );
                args.reject();
            }
        });
    }

    /// Event hub
    pub fn events(&self) -> &Arc<EventSink> {
        &self.events
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Server metrics
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Wrap a transport in a new connection and add it to the live list
    ///
    /// The connection is not started.
    pub fn register(
        self: &Arc<Self>,
        transport: BoxedTransport,
        peer_addr: SocketAddr,
    ) -> Arc<NetState> {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let net_state = Arc::new(NetState::new(id, transport, peer_addr, self.clone()));
        self.instances.insert(id, net_state.clone());
        self.metrics.connection_opened();
        self.events
            .net_state_added
            .publish_isolated(&NetStateAddedEventArgs {
                net_state: net_state.clone(),
            });
        net_state
    }

    /// Number of live connections, including disposed ones not yet drained
    pub fn count(&self) -> usize {
        self.instances.len()
    }

    /// Look up a live connection
    pub fn get(&self, id: ConnectionId) -> Option<Arc<NetState>> {
        self.instances.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of the live list
    pub fn instances(&self) -> Vec<Arc<NetState>> {
        self.instances.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Running connections from `ip`
    pub fn count_for_ip(&self, ip: IpAddr) -> usize {
        self.instances
            .iter()
            .filter(|entry| entry.value().peer_addr().ip() == ip && !entry.value().is_disposing())
            .count()
    }

    /// Register the handler for a dispatch key
    ///
    /// The first registration for a key wins; returns `false` for a duplicate.
    pub fn register_protocol(&self, key: char, handler: ProtocolHandler) -> bool {
        match self.protocols.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::warn!(key = %key, "Dispatch key already registered");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handler);
                true
            }
        }
    }

    /// Whether a dispatch key has a handler
    pub fn has_protocol(&self, key: char) -> bool {
        self.protocols.contains_key(&key)
    }

    /// Route one frame by its first character
    ///
    /// An unknown key is a protocol error: logged, frame dropped, connection kept.
    pub fn dispatch(&self, net_state: &Arc<NetState>, frame: &str) {
        let Some(key) = dispatch_key(frame) else {
            return;
        };
        let handler = self.protocols.get(&key).map(|entry| entry.value().clone());
        match handler {
            Some(handler) => handler(net_state, frame),
            None => {
                self.metrics.protocol_error();
                tracing::warn!(
                    connection_id = %net_state.id(),
                    peer_addr = %net_state.peer_addr(),
                    key = %key,
                    payload = frame,
                    "Protocol error: unknown dispatch key"
                );
            }
        }
    }

    pub(crate) fn enqueue_disposed(&self, net_state: Arc<NetState>) {
        self.disposed.lock().push_back(net_state);
        self.signal.set();
    }

    /// Connections waiting in the disposal queue
    pub fn disposed_pending(&self) -> usize {
        self.disposed.lock().len()
    }

    /// Remove up to [`DISPOSAL_BATCH`] disposed connections from the live list
    ///
    /// Called once per tick; the only place the live list shrinks. Returns
    /// the number removed.
    pub fn process_disposed_queue(&self) -> usize {
        let batch: Vec<Arc<NetState>> = {
            let mut queue = self.disposed.lock();
            let take = queue.len().min(DISPOSAL_BATCH);
            queue.drain(..take).collect()
        };

        for net_state in &batch {
            let account = net_state.account_name();
            if self.instances.remove(&net_state.id()).is_some() {
                self.metrics
                    .connection_closed(net_state.connected_at().elapsed());
            }
            net_state.remove_session_data();
            tracing::info!(
                connection_id = %net_state.id(),
                peer_addr = %net_state.peer_addr(),
                "Disconnected. [{} Online] [{}]",
                self.count(),
                account.as_deref().unwrap_or("(none)")
            );
        }
        batch.len()
    }

    /// Whether receives are suspended
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Suspend new receives on every connection
    ///
    /// Reads already in flight complete and dispatch but are not followed by
    /// another read until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        for net_state in self.instances() {
            net_state.pause();
        }
        tracing::debug!(connections = self.count(), "Receives paused");
    }

    /// Re-arm a receive on every connection that has none pending
    ///
    /// A connection that cannot be re-armed is disposed; the rest resume.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        for net_state in self.instances() {
            if net_state.is_disposing() {
                continue;
            }
            if let Err(err) = net_state.rearm() {
                tracing::debug!(
                    connection_id = %net_state.id(),
                    error = %err,
                    "Re-arm failed on resume"
                );
                net_state.dispose();
            }
        }
        tracing::debug!(connections = self.count(), "Receives resumed");
    }

    /// Liveness sweep
    ///
    /// A panic in one connection's check is logged and the sweep continues.
    pub fn check_all_alive(&self, now: Instant) -> usize {
        let mut expired = 0;
        for net_state in self.instances() {
            match catch_unwind(AssertUnwindSafe(|| net_state.check_alive(now))) {
                Ok(true) => {}
                Ok(false) => expired += 1,
                Err(_) => {
                    tracing::error!(connection_id = %net_state.id(), "Liveness check panicked");
                }
            }
        }
        expired
    }

    /// Send one frame to every running connection
    pub fn broadcast(&self, message: &str) -> usize {
        let mut sent = 0;
        for net_state in self.instances() {
            if net_state.is_running() {
                net_state.send(message);
                sent += 1;
            }
        }
        sent
    }

    /// Dispose every live connection
    pub fn dispose_all(&self) {
        for net_state in self.instances() {
            net_state.dispose();
        }
    }
}

impl std::fmt::Debug for NetStateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetStateHandler")
            .field("instances", &self.count())
            .field("disposed", &self.disposed_pending())
            .field("protocols", &self.protocols.len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SocketConnectEventArgs;
    use crate::types::AsyncState;
    use std::time::Duration;

    fn registry(config: ServerConfig) -> Arc<NetStateHandler> {
        NetStateHandler::new(Arc::new(EventSink::new()), config, Arc::new(ServerMetrics::new()))
    }

    fn register(handler: &Arc<NetStateHandler>, addr: &str) -> Arc<NetState> {
        let (_client, server) = tokio::io::duplex(64);
        handler.register(Box::new(server), addr.parse().unwrap())
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let handler = registry(ServerConfig::default());
        let a = register(&handler, "10.0.0.1:1");
        let b = register(&handler, "10.0.0.1:2");
        assert_ne!(a.id(), b.id());
        assert_eq!(handler.count(), 2);
        assert!(handler.get(a.id()).is_some());
    }

    #[test]
    fn test_disposal_drain_is_batched() {
        let handler = registry(ServerConfig::default());
        let states: Vec<_> = (0..250)
            .map(|port| register(&handler, &format!("10.0.0.1:{}", port + 1)))
            .collect();
        for state in &states {
            state.dispose();
        }

        assert_eq!(handler.count(), 250);
        assert_eq!(handler.process_disposed_queue(), 200);
        assert_eq!(handler.count(), 50);
        assert_eq!(handler.process_disposed_queue(), 50);
        assert_eq!(handler.count(), 0);
        assert_eq!(handler.process_disposed_queue(), 0);
    }

    #[test]
    fn test_first_protocol_registration_wins() {
        let handler = registry(ServerConfig::default());
        assert!(handler.register_protocol('%', Arc::new(|_, _| {})));
        assert!(!handler.register_protocol('%', Arc::new(|_, _| panic!("replaced"))));
        assert!(handler.has_protocol('%'));
        assert!(!handler.has_protocol('<'));
    }

    #[test]
    fn test_ip_limiter() {
        let handler = registry(ServerConfig::default().with_max_per_ip(2));
        register(&handler, "10.0.0.1:1");
        register(&handler, "10.0.0.1:2");
        register(&handler, "10.0.0.2:1");

        let args = SocketConnectEventArgs::new("10.0.0.1:3".parse().unwrap());
        handler.events().socket_connect.publish(&args);
        assert!(!args.is_allowed());

        let args = SocketConnectEventArgs::new("10.0.0.2:2".parse().unwrap());
        handler.events().socket_connect.publish(&args);
        assert!(args.is_allowed());
    }

    #[test]
    fn test_ip_limiter_unlimited() {
        let handler = registry(ServerConfig::default().with_max_per_ip(0));
        for port in 1..20 {
            register(&handler, &format!("10.0.0.1:{}", port));
        }
        let args = SocketConnectEventArgs::new("10.0.0.1:99".parse().unwrap());
        handler.events().socket_connect.publish(&args);
        assert!(args.is_allowed());
    }

    #[test]
    fn test_pause_marks_connections() {
        let handler = registry(ServerConfig::default());
        let state = register(&handler, "10.0.0.1:1");
        handler.pause();
        assert!(handler.is_paused());
        assert!(state.async_state().contains(AsyncState::PAUSED));
    }

    #[test]
    fn test_resume_disposes_unstarted_connection() {
        let handler = registry(ServerConfig::default());
        let state = register(&handler, "10.0.0.1:1");
        handler.pause();
        handler.resume();
        assert!(!handler.is_paused());
        assert!(state.is_disposing());
    }

    #[test]
    fn test_check_all_alive_while_paused() {
        let handler = registry(ServerConfig::default());
        let state = register(&handler, "10.0.0.1:1");
        handler.pause();
        assert_eq!(handler.check_all_alive(Instant::now()), 0);
        assert_eq!(
            handler.check_all_alive(Instant::now() + Duration::from_secs(120)),
            1
        );
        assert!(state.is_disposing());
    }
}

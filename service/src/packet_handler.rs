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

//! Action dispatch for the two frame families
//!
//! Protocol modules contribute `(action key, factory)` pairs. When the
//! server starts, the [`PacketHandler`] merges them into one table per
//! family and installs itself in the registry under `%` (extension frames)
//! and `<` (system frames). Each inbound frame gets a fresh handler
//! instance from its factory, bound to the connection it arrived on.
//!
//! # Example
//!
//! ```
//! use emberlink_service::{NetState, ProtocolModule, XtFactory, XtHandler};
//! use std::sync::Arc;
//!
//! struct Ping(Arc<NetState>);
//!
//! impl XtHandler for Ping {
//!     fn handle(&mut self, args: &[String]) {
//!         self.0.send(format!("%xt%pong%{}%", args[4]));
//!     }
//! }
//!
//! struct Lobby;
//!
//! impl ProtocolModule for Lobby {
//!     fn name(&self) -> &str {
//!         "lobby"
//!     }
//!
//!     fn xt_handlers(&self) -> Vec<(&'static str, XtFactory)> {
//!         vec![("ping", Arc::new(|ns: Arc<NetState>| Box::new(Ping(ns)) as Box<dyn XtHandler>))]
//!     }
//! }
//! ```

use crate::ServerMetrics;
use crate::event::EventSink;
use crate::net_state::NetState;
use crate::net_state_handler::NetStateHandler;
use emberlink_codec::{SYS_DISPATCH_KEY, SysFrame, XT_DISPATCH_KEY, XtFrame};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};

/// Handler instance for one extension frame
pub trait XtHandler: Send {
    /// Handle the frame; `args` is `[raw] ++ raw.split('%')`, so the
    /// action key is at index 3 and the room at index 4
    fn handle(&mut self, args: &[String]);
}

/// Handler instance for one system frame
pub trait SysHandler: Send {
    /// Handle the parsed `<msg>` envelope
    fn handle(&mut self, frame: &SysFrame);
}

/// Builds an extension handler bound to a connection
pub type XtFactory = Arc<dyn Fn(Arc<NetState>) -> Box<dyn XtHandler> + Send + Sync>;

/// Builds a system handler bound to a connection
pub type SysFactory = Arc<dyn Fn(Arc<NetState>) -> Box<dyn SysHandler> + Send + Sync>;

/// A set of action handlers contributed at startup
pub trait ProtocolModule: Send + Sync {
    /// Module name used in logs
    fn name(&self) -> &str;

    /// Extension actions
    fn xt_handlers(&self) -> Vec<(&'static str, XtFactory)> {
        Vec::new()
    }

    /// System actions
    fn sys_handlers(&self) -> Vec<(&'static str, SysFactory)> {
        Vec::new()
    }
}

/// Two-table action dispatcher
pub struct PacketHandler {
    metrics: Arc<ServerMetrics>,
    modules: RwLock<Vec<Arc<dyn ProtocolModule>>>,
    xt: RwLock<HashMap<String, XtFactory>>,
    sys: RwLock<HashMap<String, SysFactory>>,
}

impl PacketHandler {
    /// Create an empty dispatcher
    pub fn new(metrics: Arc<ServerMetrics>) -> Arc<Self> {
        Arc::new(Self {
            metrics,
            modules: RwLock::new(Vec::new()),
            xt: RwLock::new(HashMap::new()),
            sys: RwLock::new(HashMap::new()),
        })
    }

    /// Add a module; it is read when the tables are built
    pub fn add_module(&self, module: Arc<dyn ProtocolModule>) {
        self.modules.write().push(module);
    }

    /// Build the tables and register with the registry on `ServerStarted`
    pub fn install(self: &Arc<Self>, events: &EventSink, registry: &Arc<NetStateHandler>) {
        let packets: Weak<Self> = Arc::downgrade(self);
        let registry: Weak<NetStateHandler> = Arc::downgrade(registry);
        events.server_started.subscribe(move |_| {
            if let (Some(packets), Some(registry)) = (packets.upgrade(), registry.upgrade()) {
                packets.build(&registry);
            }
        });
    }

    /// Merge every module into the action tables and register both dispatch keys
    ///
    /// For a duplicate action key the first registration is kept.
    pub fn build(self: &Arc<Self>, registry: &NetStateHandler) {
        let modules = self.modules.read().clone();
        {
            let mut xt = self.xt.write();
            let mut sys = self.sys.write();
            for module in &modules {
                for (action, factory) in module.xt_handlers() {
                    match xt.entry(action.to_string()) {
                        Entry::Occupied(_) => tracing::warn!(
                            module = module.name(),
                            action,
                            "Duplicate extension action ignored"
                        ),
                        Entry::Vacant(entry) => {
                            entry.insert(factory);
                        }
                    }
                }
                for (action, factory) in module.sys_handlers() {
                    match sys.entry(action.to_string()) {
                        Entry::Occupied(_) => tracing::warn!(
                            module = module.name(),
                            action,
                            "Duplicate system action ignored"
                        ),
                        Entry::Vacant(entry) => {
                            entry.insert(factory);
                        }
                    }
                }
            }
            tracing::info!(
                modules = modules.len(),
                xt_actions = xt.len(),
                sys_actions = sys.len(),
                "Packet handlers registered"
            );
        }

        let packets = self.clone();
        registry.register_protocol(
            XT_DISPATCH_KEY,
            Arc::new(move |net_state, frame| packets.handle_xt(net_state, frame)),
        );
        let packets = self.clone();
        registry.register_protocol(
            SYS_DISPATCH_KEY,
            Arc::new(move |net_state, frame| packets.handle_sys(net_state, frame)),
        );
    }

    /// Number of extension actions
    pub fn xt_count(&self) -> usize {
        self.xt.read().len()
    }

    /// Number of system actions
    pub fn sys_count(&self) -> usize {
        self.sys.read().len()
    }

    /// Dispatch one extension frame
    pub fn handle_xt(&self, net_state: &Arc<NetState>, raw: &str) {
        let frame = match XtFrame::parse(raw) {
            Ok(frame) => frame,
            Err(err) => return self.protocol_error(net_state, None, raw, &err.to_string()),
        };
        let factory = self.xt.read().get(frame.action()).cloned();
        match factory {
            Some(factory) => {
                tracing::trace!(
                    connection_id = %net_state.id(),
                    action = frame.action(),
                    "Extension frame"
                );
                factory(net_state.clone()).handle(frame.args());
            }
            None => self.protocol_error(net_state, Some(frame.action()), raw, "unknown action"),
        }
    }

    /// Dispatch one system frame
    pub fn handle_sys(&self, net_state: &Arc<NetState>, raw: &str) {
        let frame = match SysFrame::parse(raw) {
            Ok(frame) => frame,
            Err(err) => return self.protocol_error(net_state, None, raw, &err.to_string()),
        };
        let factory = self.sys.read().get(frame.action()).cloned();
        match factory {
            Some(factory) => {
                tracing::trace!(
                    connection_id = %net_state.id(),
                    action = frame.action(),
                    "System frame"
                );
                factory(net_state.clone()).handle(&frame);
            }
            None => self.protocol_error(net_state, Some(frame.action()), raw, "unknown action"),
        }
    }

    fn protocol_error(&self, net_state: &NetState, action: Option<&str>, raw: &str, reason: &str) {
        self.metrics.protocol_error();
        tracing::warn!(
            connection_id = %net_state.id(),
            peer_addr = %net_state.peer_addr(),
            action = action.unwrap_or(""),
            payload = raw,
            "Protocol error: {}",
            reason
        );
    }
}

impl std::fmt::Debug for PacketHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHandler")
            .field("modules", &self.modules.read().len())
            .field("xt", &self.xt_count())
            .field("sys", &self.sys_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerConfig;
    use parking_lot::Mutex;

    type Seen = Arc<Mutex<Vec<Vec<String>>>>;

    struct Record(Seen);

    impl XtHandler for Record {
        fn handle(&mut self, args: &[String]) {
            self.0.lock().push(args.to_vec());
        }
    }

    struct RecordSys(Seen);

    impl SysHandler for RecordSys {
        fn handle(&mut self, frame: &SysFrame) {
            self.0
                .lock()
                .push(vec![frame.action().to_string(), frame.room().unwrap_or("").to_string()]);
        }
    }

    struct TestModule {
        name: &'static str,
        seen: Seen,
    }

    impl ProtocolModule for TestModule {
        fn name(&self) -> &str {
            self.name
        }

        fn xt_handlers(&self) -> Vec<(&'static str, XtFactory)> {
            let seen = self.seen.clone();
            vec![(
                "foo",
                Arc::new(move |_: Arc<NetState>| {
                    Box::new(Record(seen.clone())) as Box<dyn XtHandler>
                }),
            )]
        }

        fn sys_handlers(&self) -> Vec<(&'static str, SysFactory)> {
            let seen = self.seen.clone();
            vec![(
                "verChk",
                Arc::new(move |_: Arc<NetState>| {
                    Box::new(RecordSys(seen.clone())) as Box<dyn SysHandler>
                }),
            )]
        }
    }

    fn setup() -> (Arc<NetStateHandler>, Arc<PacketHandler>, Seen, Arc<NetState>) {
        let events = Arc::new(EventSink::new());
        let metrics = Arc::new(ServerMetrics::new());
        let registry =
            NetStateHandler::new(events.clone(), ServerConfig::default(), metrics.clone());
        let packets = PacketHandler::new(metrics);
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        packets.add_module(Arc::new(TestModule {
            name: "first",
            seen: seen.clone(),
        }));
        packets.install(&events, &registry);
        let (_client, server) = tokio::io::duplex(64);
        let net_state = registry.register(Box::new(server), "127.0.0.1:1".parse().unwrap());
        (registry, packets, seen, net_state)
    }

    #[test]
    fn test_tables_built_on_server_started() {
        let (registry, packets, _, _) = setup();
        assert!(!registry.has_protocol('%'));

        registry.events().server_started.publish(&Default::default());
        assert!(registry.has_protocol('%'));
        assert!(registry.has_protocol('<'));
        assert_eq!(packets.xt_count(), 1);
        assert_eq!(packets.sys_count(), 1);
    }

    #[test]
    fn test_xt_dispatch_args() {
        let (registry, _packets, seen, net_state) = setup();
        registry.events().server_started.publish(&Default::default());

        registry.dispatch(&net_state, "%xt%foo%3%bar%");
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0], "%xt%foo%3%bar%");
        assert_eq!(seen[0][3], "foo");
        assert_eq!(seen[0][4], "3");
        assert_eq!(seen[0][5], "bar");
    }

    #[test]
    fn test_sys_dispatch() {
        let (registry, _packets, seen, net_state) = setup();
        registry.events().server_started.publish(&Default::default());

        registry.dispatch(
            &net_state,
            "<msg t='sys'><body action='verChk' r='0'><ver v='153'/></body></msg>",
        );
        assert_eq!(*seen.lock(), vec![vec!["verChk".to_string(), "0".to_string()]]);
    }

    #[test]
    fn test_unknown_action_counts_protocol_error() {
        let (registry, _, seen, net_state) = setup();
        registry.events().server_started.publish(&Default::default());

        registry.dispatch(&net_state, "%xt%nope%1%");
        registry.dispatch(&net_state, "%bogus");
        assert!(seen.lock().is_empty());
        assert_eq!(registry.metrics().snapshot().protocol_errors, 2);
        assert!(!net_state.is_disposing());
    }

    #[test]
    fn test_duplicate_action_keeps_first() {
        let (registry, packets, seen, net_state) = setup();
        let other: Seen = Arc::new(Mutex::new(Vec::new()));
        packets.add_module(Arc::new(TestModule {
            name: "second",
            seen: other.clone(),
        }));
        registry.events().server_started.publish(&Default::default());

        assert_eq!(packets.xt_count(), 1);
        registry.dispatch(&net_state, "%xt%foo%1%");
        assert_eq!(seen.lock().len(), 1);
        assert!(other.lock().is_empty());
    }
}

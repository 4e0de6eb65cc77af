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

//! Promotes accepted sockets into running connections

use crate::ServerConfig;
use crate::event::EventSink;
use crate::listener::Listener;
use crate::net_state_handler::NetStateHandler;
use crate::sync::Signal;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;

/// Owner of every listener
pub struct MessagePump {
    config: ServerConfig,
    events: Arc<EventSink>,
    signal: Arc<Signal>,
    registry: Arc<NetStateHandler>,
    listeners: RwLock<Vec<Arc<Listener>>>,
}

impl MessagePump {
    /// Create a pump for the endpoints in `config`; nothing is bound yet
    pub fn new(
        config: ServerConfig,
        events: Arc<EventSink>,
        signal: Arc<Signal>,
        registry: Arc<NetStateHandler>,
    ) -> Self {
        Self {
            config,
            events,
            signal,
            registry,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Bind every configured endpoint
    ///
    /// If any endpoint fails, the ones that did bind are closed and the
    /// whole set is retried after `bind_retry_delay`, until all bind.
    /// Returns the bound addresses.
    pub async fn initialize(&self) -> Vec<SocketAddr> {
        loop {
            if let Some(listeners) = self.bind_all() {
                let addresses = listeners.iter().map(|listener| listener.local_addr()).collect();
                *self.listeners.write() = listeners;
                return addresses;
            }
            tracing::warn!(
                retry_in = ?self.config.bind_retry_delay,
                "Could not bind every listener, retrying"
            );
            tokio::time::sleep(self.config.bind_retry_delay).await;
        }
    }

    fn bind_all(&self) -> Option<Vec<Arc<Listener>>> {
        let mut bound = Vec::with_capacity(self.config.listeners.len());
        for address in &self.config.listeners {
            match Listener::bind(
                *address,
                self.config.backlog,
                self.events.clone(),
                self.signal.clone(),
                self.registry.metrics().clone(),
            ) {
                Some(listener) => bound.push(listener),
                None => {
                    for listener in bound {
                        listener.dispose();
                    }
                    return None;
                }
            }
        }
        Some(bound)
    }

    /// Bound listeners
    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.listeners.read().clone()
    }

    /// Bound addresses
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .read()
            .iter()
            .map(|listener| listener.local_addr())
            .collect()
    }

    /// Start a connection for every queued socket
    ///
    /// Runs on the tick thread. Returns the number of connections started.
    pub fn slice(&self) -> usize {
        let mut started = 0;
        for listener in self.listeners() {
            for (stream, peer_addr) in listener.slice() {
                let net_state = self.registry.register(Box::new(stream), peer_addr);
                net_state.start();
                started += 1;
            }
        }
        started
    }

    /// Close every listener
    pub fn dispose(&self) {
        for listener in std::mem::take(&mut *self.listeners.write()) {
            listener.dispose();
        }
    }
}

impl std::fmt::Debug for MessagePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePump")
            .field("listeners", &self.local_addrs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerMetrics;
    use std::time::Duration;

    fn pump(listeners: Vec<SocketAddr>) -> (MessagePump, Arc<NetStateHandler>) {
        let config = ServerConfig::new(listeners).with_bind_retry_delay(Duration::from_millis(50));
        let events = Arc::new(EventSink::new());
        let registry =
            NetStateHandler::new(events.clone(), config.clone(), Arc::new(ServerMetrics::new()));
        let pump = MessagePump::new(config, events, Arc::new(Signal::new()), registry.clone());
        (pump, registry)
    }

    #[tokio::test]
    async fn test_initialize_binds_all() {
        let (pump, _) = pump(vec![
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
        ]);
        let addresses = pump.initialize().await;
        assert_eq!(addresses.len(), 2);
        assert_ne!(addresses[0].port(), 0);
        pump.dispose();
        assert!(pump.listeners().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_retries_until_free() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = blocker.local_addr().unwrap();
        let (pump, _) = pump(vec![address]);

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            drop(blocker);
        });

        let addresses = tokio::time::timeout(Duration::from_secs(5), pump.initialize())
            .await
            .unwrap();
        release.await.unwrap();
        assert_eq!(addresses, vec![address]);
        pump.dispose();
    }

    #[tokio::test]
    async fn test_slice_starts_connections() {
        let (pump, registry) = pump(vec!["127.0.0.1:0".parse().unwrap()]);
        let addresses = pump.initialize().await;
        let _client = tokio::net::TcpStream::connect(addresses[0]).await.unwrap();

        let listener = pump.listeners()[0].clone();
        for _ in 0..100 {
            if listener.queued_total() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(pump.slice(), 1);
        assert_eq!(registry.count(), 1);
        assert!(registry.instances()[0].is_running());
        assert_eq!(pump.slice(), 0);
        pump.dispose();
    }
}

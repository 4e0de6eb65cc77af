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

//! Per-connection state and I/O
//!
//! A [`NetState`] owns one client transport. Once started it runs two tasks
//! on the async runtime:
//!
//! - a receive task that reads one frame at a time and dispatches it through
//!   the registry, never holding more than one read in flight and never
//!   arming a new read while paused
//! - a send task that drains the bounded outbound queue through the frame
//!   encoder; a peer that lets the queue fill up is disposed
//!
//! Every transport fault ends in [`NetState::dispose`]. Disposal is
//! idempotent and hands the connection to the registry's disposal queue;
//! the connection leaves the live list only when the tick thread drains
//! that queue.

use crate::event::{NetStateRemovedEventArgs, panic_message};
use crate::net_state_handler::NetStateHandler;
use crate::types::{AsyncState, ConnectionId, ConnectionInfo};
use crate::{NetError, Result};
use chrono::{DateTime, Local};
use emberlink_codec::FrameCodec;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Byte stream a connection runs over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned transport
pub type BoxedTransport = Box<dyn Transport>;

/// One-shot predicate gating frame processing; cleared once it passes
pub type ThrottlePredicate = Arc<dyn Fn(&NetState) -> bool + Send + Sync>;

/// Per-connection payload stored by type
pub trait SessionData: Any + Send + Sync {
    /// The owning connection left the registry
    fn on_removed(&self, _net_state: &NetState) {}

    /// Account identity used in disconnect logs and crash reports
    fn account_name(&self) -> Option<String> {
        None
    }
}

struct SessionSlot {
    value: Arc<dyn Any + Send + Sync>,
    hooks: Arc<dyn SessionData>,
}

type FrameReader = FramedRead<ReadHalf<BoxedTransport>, FrameCodec>;
type FrameWriter = FramedWrite<WriteHalf<BoxedTransport>, FrameCodec>;

/// One client connection
pub struct NetState {
    id: ConnectionId,
    peer_addr: SocketAddr,
    connected_at: Instant,
    connected_on: DateTime<Local>,
    handler: Arc<NetStateHandler>,
    transport: Mutex<Option<BoxedTransport>>,
    async_state: Mutex<AsyncState>,
    resume: Notify,
    running: AtomicBool,
    disposing: AtomicBool,
    next_check: Mutex<Instant>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    cancel: CancellationToken,
    throttle: Mutex<Option<ThrottlePredicate>>,
    session: RwLock<HashMap<TypeId, SessionSlot>>,
}

impl NetState {
    pub(crate) fn new(
        id: ConnectionId,
        transport: BoxedTransport,
        peer_addr: SocketAddr,
        handler: Arc<NetStateHandler>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(handler.config().send_queue_size.max(1));
        let now = Instant::now();
        let idle_timeout = handler.config().idle_timeout;
        Self {
            id,
            peer_addr,
            connected_at: now,
            connected_on: Local::now(),
            handler,
            transport: Mutex::new(Some(transport)),
            async_state: Mutex::new(AsyncState::empty()),
            resume: Notify::new(),
            running: AtomicBool::new(false),
            disposing: AtomicBool::new(false),
            next_check: Mutex::new(now + idle_timeout),
            outbound: Mutex::new(Some(tx)),
            outbound_rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            throttle: Mutex::new(None),
            session: RwLock::new(HashMap::new()),
        }
    }

    /// Connection ID
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote endpoint
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// When the connection was accepted
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Wall-clock accept time
    pub fn connected_on(&self) -> DateTime<Local> {
        self.connected_on
    }

    /// Whether I/O tasks are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether disposal has begun
    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }

    /// Current receive-path state
    pub fn async_state(&self) -> AsyncState {
        *self.async_state.lock()
    }

    /// Current liveness deadline
    pub fn next_check(&self) -> Instant {
        *self.next_check.lock()
    }

    /// Start I/O
    ///
    /// Issues the first receive unless the registry is paused. Calling it
    /// again, or after disposal, has no effect. Without an async runtime the
    /// connection is disposed.
    #[tracing::instrument(
        level = "debug",
        skip(self),
        fields(connection_id = %self.id, peer_addr = %self.peer_addr)
    )]
    pub fn start(self: &Arc<Self>) {
        if self.is_disposing() {
            return;
        }
        let Some(transport) = self.transport.lock().take() else {
            return;
        };
        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::error!(
                    error = %NetError::RuntimeUnavailable,
                    "Unable to start connection"
                );
                self.dispose();
                return;
            }
        };

        self.running.store(true, Ordering::Release);
        tracing::info!("Connected. [{} Online]", self.handler.count());

        if self.handler.is_paused() {
            self.async_state.lock().insert(AsyncState::PAUSED);
        }

        let buffer_size = self.handler.config().buffer_size;
        let (read_half, write_half) = tokio::io::split(transport);
        let reader =
            FramedRead::with_capacity(read_half, FrameCodec::new(buffer_size), buffer_size);
        let writer = FramedWrite::new(write_half, FrameCodec::new(buffer_size));

        let receiver = self.clone();
        runtime.spawn(async move {
            let net_state = receiver.clone();
            if let Err(payload) = AssertUnwindSafe(receiver.receive_loop(reader))
                .catch_unwind()
                .await
            {
                tracing::error!(
                    connection_id = %net_state.id,
                    panic = %panic_message(payload.as_ref()),
                    "Receive task panicked"
                );
                net_state.handler.metrics().connection_error();
                net_state.dispose();
            }
        });

        let sender = self.clone();
        runtime.spawn(sender.send_loop(writer, outbound_rx));
    }

    async fn receive_loop(self: Arc<Self>, mut reader: FrameReader) {
        loop {
            if !self.try_arm() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    _ = self.resume.notified() => continue,
                }
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                next = reader.next() => next,
            };

            match next {
                None => {
                    tracing::debug!(connection_id = %self.id, "Remote closed connection");
                    self.dispose();
                    return;
                }
                Some(Err(err)) => {
                    tracing::debug!(connection_id = %self.id, error = %err, "Receive failed");
                    self.handler.metrics().connection_error();
                    self.dispose();
                    return;
                }
                Some(Ok(frame)) => {
                    self.refresh();
                    self.handler.metrics().frame_received();
                    if !self.await_throttle().await {
                        return;
                    }
                    self.handler.dispatch(&self, &frame);
                }
            }

            self.async_state.lock().remove(AsyncState::PENDING);
        }
    }

    /// Mark a receive as pending unless paused
    fn try_arm(&self) -> bool {
        let mut state = self.async_state.lock();
        if state.is_paused() || self.handler.is_paused() {
            state.remove(AsyncState::PENDING);
            false
        } else {
            state.insert(AsyncState::PENDING);
            true
        }
    }

    /// Hold the current frame until the throttle predicate passes
    ///
    /// Returns `false` if the connection was disposed while waiting.
    async fn await_throttle(&self) -> bool {
        loop {
            let predicate = self.throttle.lock().clone();
            let Some(predicate) = predicate else {
                return true;
            };
            if predicate(self) {
                self.throttle.lock().take();
                return true;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.handler.config().throttle_retry) => {}
            }
        }
    }

    async fn send_loop(
        self: Arc<Self>,
        mut writer: FrameWriter,
        mut outbound: mpsc::Receiver<String>,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = outbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match writer.send(message).await {
                Ok(()) => {
                    self.refresh();
                    self.handler.metrics().frame_sent();
                }
                Err(err) => {
                    tracing::debug!(connection_id = %self.id, error = %err, "Send failed");
                    self.handler.metrics().connection_error();
                    self.dispose();
                    break;
                }
            }
        }

        if let Err(err) = writer.get_mut().shutdown().await {
            tracing::trace!(connection_id = %self.id, error = %err, "Socket shutdown failed");
        }
    }

    /// Queue one frame for sending
    ///
    /// An empty message is a no-op. Transport failures surface through
    /// disposal, never here. A full outbound queue disposes the connection.
    pub fn send(self: &Arc<Self>, message: impl Into<String>) {
        let message = message.into();
        if message.is_empty() {
            return;
        }
        let queued = match self.outbound.lock().as_ref() {
            Some(outbound) => outbound.try_send(message),
            None => return,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = queued {
            tracing::warn!(
                connection_id = %self.id,
                capacity = self.handler.config().send_queue_size,
                "Send queue full, disconnecting"
            );
            self.handler.metrics().connection_error();
            self.dispose();
        }
    }

    /// Re-arm a receive after the registry resumed
    pub(crate) fn rearm(&self) -> Result<()> {
        if self.is_disposing() || !self.is_running() {
            return Err(NetError::ConnectionClosed);
        }
        let mut state = self.async_state.lock();
        state.remove(AsyncState::PAUSED);
        if !state.is_pending() {
            self.resume.notify_one();
        }
        Ok(())
    }

    /// Forbid new receives
    pub(crate) fn pause(&self) {
        self.async_state.lock().insert(AsyncState::PAUSED);
    }

    fn refresh(&self) {
        *self.next_check.lock() = Instant::now() + self.handler.config().idle_timeout;
    }

    /// Dispose the connection if its liveness deadline has passed
    ///
    /// Returns `true` if the connection is still alive.
    pub fn check_alive(self: &Arc<Self>, now: Instant) -> bool {
        if self.is_disposing() {
            return false;
        }
        if now >= self.next_check() {
            tracing::info!(
                connection_id = %self.id,
                peer_addr = %self.peer_addr,
                "Disconnecting due to inactivity"
            );
            self.dispose();
            return false;
        }
        true
    }

    /// Install a one-shot throttle predicate
    pub fn set_throttle<F>(&self, predicate: F)
    where
        F: Fn(&NetState) -> bool + Send + Sync + 'static,
    {
        *self.throttle.lock() = Some(Arc::new(predicate));
    }

    /// Whether a throttle predicate is installed
    pub fn is_throttled(&self) -> bool {
        self.throttle.lock().is_some()
    }

    /// Close the connection
    ///
    /// Safe from any thread and idempotent: the first call publishes
    /// `NetStateRemoved` and enqueues the connection for removal, later
    /// calls do nothing.
    pub fn dispose(self: &Arc<Self>) {
        if self.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.cancel.cancel();

        drop(self.transport.lock().take());
        self.outbound.lock().take();
        self.outbound_rx.lock().take();
        self.throttle.lock().take();

        tracing::debug!(connection_id = %self.id, "Disposing connection");
        self.handler
            .events()
            .net_state_removed
            .publish_isolated(&NetStateRemovedEventArgs {
                net_state: self.clone(),
            });
        self.handler.enqueue_disposed(self.clone());
    }

    /// Session payload of type `T`
    pub fn get<T: SessionData>(&self) -> Option<Arc<T>> {
        let slot = self.session.read().get(&TypeId::of::<T>())?.value.clone();
        slot.downcast::<T>().ok()
    }

    /// Store a session payload; each type may be set once
    pub fn set<T: SessionData>(&self, value: T) -> Result<Arc<T>> {
        let mut session = self.session.write();
        if session.contains_key(&TypeId::of::<T>()) {
            return Err(NetError::SessionDataAlreadySet(type_name::<T>()));
        }
        let value = Arc::new(value);
        session.insert(
            TypeId::of::<T>(),
            SessionSlot {
                value: value.clone(),
                hooks: value.clone(),
            },
        );
        Ok(value)
    }

    /// Account identity from the first payload that provides one
    pub fn account_name(&self) -> Option<String> {
        self.session
            .read()
            .values()
            .find_map(|slot| slot.hooks.account_name())
    }

    /// Remove every payload, giving each a chance to react
    pub(crate) fn remove_session_data(&self) {
        let slots: Vec<SessionSlot> = self.session.write().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| slot.hooks.on_removed(self))) {
                tracing::error!(
                    connection_id = %self.id,
                    panic = %panic_message(payload.as_ref()),
                    "Session data removal hook panicked"
                );
            }
        }
    }

    /// Snapshot for logs and reports
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer_addr: self.peer_addr,
            connected_at: self.connected_at,
            running: self.is_running(),
            state: self.async_state(),
            account: self.account_name(),
        }
    }
}

impl fmt::Debug for NetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetState")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("running", &self.is_running())
            .field("disposing", &self.is_disposing())
            .field("state", &self.async_state())
            .finish()
    }
}

impl fmt::Display for NetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.peer_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventSink, ServerConfig, ServerMetrics};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct Account(String);

    impl SessionData for Account {
        fn account_name(&self) -> Option<String> {
            Some(self.0.clone())
        }
    }

    struct Flag(Arc<AtomicUsize>);

    impl SessionData for Flag {
        fn on_removed(&self, _net_state: &NetState) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry() -> Arc<NetStateHandler> {
        NetStateHandler::new(
            Arc::new(EventSink::new()),
            ServerConfig::default(),
            Arc::new(ServerMetrics::new()),
        )
    }

    fn connect(handler: &Arc<NetStateHandler>) -> (Arc<NetState>, DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        let net_state = handler.register(Box::new(server), "127.0.0.1:5000".parse().unwrap());
        (net_state, client)
    }

    #[tokio::test]
    async fn test_send_appends_terminator() {
        let handler = registry();
        let (net_state, mut client) = connect(&handler);
        net_state.start();

        net_state.send("");
        net_state.send("%xt%pong%1%");

        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"%xt%pong%1%\0");
    }

    #[tokio::test]
    async fn test_remote_close_disposes() {
        let handler = registry();
        let (net_state, client) = connect(&handler);
        net_state.start();
        drop(client);

        for _ in 0..100 {
            if net_state.is_disposing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(net_state.is_disposing());
        assert!(!net_state.is_running());
        assert_eq!(handler.disposed_pending(), 1);
    }

    #[tokio::test]
    async fn test_check_alive_disposes_after_deadline() {
        let handler = registry();
        let (net_state, _client) = connect(&handler);

        assert!(net_state.check_alive(Instant::now()));
        let later = Instant::now() + Duration::from_secs(91);
        assert!(!net_state.check_alive(later));
        assert!(net_state.is_disposing());
    }

    #[test]
    fn test_session_data_define_once() {
        let handler = registry();
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let net_state = handler.register(Box::new(server), "127.0.0.1:5000".parse().unwrap());

        assert!(net_state.get::<Account>().is_none());
        net_state.set(Account("alice".into())).unwrap();
        assert!(matches!(
            net_state.set(Account("bob".into())),
            Err(NetError::SessionDataAlreadySet(_))
        ));
        assert_eq!(net_state.get::<Account>().unwrap().0, "alice");
        assert_eq!(net_state.account_name().as_deref(), Some("alice"));
    }

    #[test]
    fn test_session_removal_hooks() {
        let handler = registry();
        let (_client, server) = tokio::io::duplex(64);
        let net_state = handler.register(Box::new(server), "127.0.0.1:5000".parse().unwrap());
        let removed = Arc::new(AtomicUsize::new(0));
        net_state.set(Flag(removed.clone())).unwrap();

        net_state.remove_session_data();
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(net_state.get::<Flag>().is_none());
    }

    #[test]
    fn test_dispose_before_start() {
        let handler = registry();
        let (_client, server) = tokio::io::duplex(64);
        let net_state = handler.register(Box::new(server), "127.0.0.1:5000".parse().unwrap());

        net_state.dispose();
        net_state.dispose();
        net_state.start();
        assert!(!net_state.is_running());
        assert_eq!(handler.disposed_pending(), 1);
    }

    #[test]
    fn test_start_without_runtime_disposes() {
        let handler = registry();
        let (_client, server) = tokio::io::duplex(64);
        let net_state = handler.register(Box::new(server), "127.0.0.1:5000".parse().unwrap());

        net_state.start();
        assert!(net_state.is_disposing());
    }
}

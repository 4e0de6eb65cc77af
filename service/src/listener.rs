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

//! Listening socket for one endpoint
//!
//! The accept task validates every accepted socket through `SocketConnect`
//! before accepting the next one, queues the survivors and wakes the tick
//! thread. The tick thread collects the queue with [`Listener::slice`].

use crate::error::BindFailure;
use crate::event::{EventSink, SocketConnectEventArgs, panic_message};
use crate::sync::Signal;
use crate::{NetError, Result, ServerMetrics};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Classify a bind error by OS error kind
pub fn classify_bind_error(err: &io::Error) -> BindFailure {
    match err.kind() {
        io::ErrorKind::AddrInUse => BindFailure::AddressInUse,
        io::ErrorKind::AddrNotAvailable => BindFailure::AddressUnavailable,
        _ => BindFailure::Other,
    }
}

fn bind_socket(address: SocketAddr, backlog: u32) -> Result<std::net::TcpListener> {
    let bind_error = |source: io::Error| NetError::Bind {
        address,
        kind: classify_bind_error(&source),
        source,
    };
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).ok();
    socket.bind(&address.into()).map_err(bind_error)?;
    socket
        .listen(backlog.min(i32::MAX as u32) as i32)
        .map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    Ok(socket.into())
}

/// Release a socket that will not become a connection
fn release(stream: TcpStream, peer_addr: SocketAddr) {
    if let Err(err) = SockRef::from(&stream).shutdown(Shutdown::Both) {
        tracing::trace!(peer_addr = %peer_addr, error = %err, "Shutdown of released socket failed");
    }
    drop(stream);
}

/// One bound endpoint and its queue of accepted sockets
pub struct Listener {
    local_addr: SocketAddr,
    accepted: Mutex<Vec<(TcpStream, SocketAddr)>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    queued_total: AtomicU64,
    released_total: AtomicU64,
}

impl Listener {
    /// Bind `address` and start accepting
    ///
    /// Must be called within a tokio runtime. Bind failures are logged by
    /// cause and yield `None`.
    pub fn bind(
        address: SocketAddr,
        backlog: u32,
        events: Arc<EventSink>,
        signal: Arc<Signal>,
        metrics: Arc<ServerMetrics>,
    ) -> Option<Arc<Listener>> {
        match Self::try_bind(address, backlog, events, signal, metrics) {
            Ok(listener) => Some(listener),
            Err(err) => {
                match err.bind_failure() {
                    Some(BindFailure::AddressInUse) => {
                        tracing::warn!(
                            address = %address,
                            "Listener failed: address already in use"
                        )
                    }
                    Some(BindFailure::AddressUnavailable) => {
                        tracing::warn!(
                            address = %address,
                            "Listener failed: address not available on this host"
                        )
                    }
                    _ => tracing::warn!(address = %address, error = %err, "Listener failed"),
                }
                None
            }
        }
    }

    /// Bind `address` and start accepting, returning the classified error on failure
    pub fn try_bind(
        address: SocketAddr,
        backlog: u32,
        events: Arc<EventSink>,
        signal: Arc<Signal>,
        metrics: Arc<ServerMetrics>,
    ) -> Result<Arc<Listener>> {
        let std_listener = bind_socket(address, backlog)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        let this = Arc::new(Listener {
            local_addr,
            accepted: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            queued_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
        });

        tokio::spawn(this.clone().accept_loop(listener, events, signal, metrics));
        tracing::info!(address = %local_addr, "Listening");
        Ok(this)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        events: Arc<EventSink>,
        signal: Arc<Signal>,
        metrics: Arc<ServerMetrics>,
    ) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    if self.on_accept(stream, peer_addr, &events) {
                        signal.set();
                    } else {
                        metrics.connection_rejected();
                    }
                }
                Err(err) => {
                    tracing::debug!(address = %self.local_addr, error = %err, "Accept failed");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::debug!(address = %self.local_addr, "Accept loop stopped");
    }

    /// Validate and queue one accepted socket; returns `true` if queued
    fn on_accept(&self, stream: TcpStream, peer_addr: SocketAddr, events: &EventSink) -> bool {
        let args = SocketConnectEventArgs::new(peer_addr);
        let published = catch_unwind(AssertUnwindSafe(|| events.socket_connect.publish(&args)));
        let allowed = match published {
            Ok(()) => args.is_allowed(),
            Err(payload) => {
                tracing::error!(
                    peer_addr = %peer_addr,
                    panic = %panic_message(payload.as_ref()),
                    "Socket validation failed"
                );
                false
            }
        };

        if !allowed || self.is_disposed() {
            self.released_total.fetch_add(1, Ordering::Relaxed);
            release(stream, peer_addr);
            return false;
        }

        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(peer_addr = %peer_addr, error = %err, "Unable to configure socket");
            self.released_total.fetch_add(1, Ordering::Relaxed);
            release(stream, peer_addr);
            return false;
        }

        self.accepted.lock().push((stream, peer_addr));
        self.queued_total.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take every queued socket
    pub fn slice(&self) -> Vec<(TcpStream, SocketAddr)> {
        std::mem::take(&mut *self.accepted.lock())
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sockets queued since bind
    pub fn queued_total(&self) -> u64 {
        self.queued_total.load(Ordering::Relaxed)
    }

    /// Sockets released since bind
    pub fn released_total(&self) -> u64 {
        self.released_total.load(Ordering::Relaxed)
    }

    /// Whether the listening socket has been closed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Close the listening socket; later calls do nothing
    ///
    /// Sockets still queued are released.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        for (stream, peer_addr) in self.slice() {
            self.released_total.fetch_add(1, Ordering::Relaxed);
            release(stream, peer_addr);
        }
        tracing::info!(address = %self.local_addr, "Listener closed");
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("queued", &self.accepted.lock().len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

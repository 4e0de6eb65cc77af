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

//! Core types for the session core

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Unique identifier for a connection (monotonically increasing, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Receive-path state bits of a connection, guarded by the connection's async lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsyncState(u8);

impl AsyncState {
    /// A receive is in flight
    pub const PENDING: AsyncState = AsyncState(0x01);
    /// Receiving is administratively suspended
    pub const PAUSED: AsyncState = AsyncState(0x02);

    /// No bits set
    pub const fn empty() -> Self {
        AsyncState(0)
    }

    /// Raw bits
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub const fn contains(self, other: AsyncState) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`
    pub fn insert(&mut self, other: AsyncState) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`
    pub fn remove(&mut self, other: AsyncState) {
        self.0 &= !other.0;
    }

    /// Whether a receive is in flight
    pub const fn is_pending(self) -> bool {
        self.contains(Self::PENDING)
    }

    /// Whether receiving is suspended
    pub const fn is_paused(self) -> bool {
        self.contains(Self::PAUSED)
    }
}

impl fmt::Display for AsyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_pending(), self.is_paused()) {
            (false, false) => write!(f, "idle"),
            (true, false) => write!(f, "pending"),
            (false, true) => write!(f, "paused"),
            (true, true) => write!(f, "pending|paused"),
        }
    }
}

/// Connection information snapshot (for logging and crash reports)
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection ID
    pub id: ConnectionId,
    /// Peer address
    pub peer_addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: Instant,
    /// Whether the connection is still running
    pub running: bool,
    /// Receive-path state
    pub state: AsyncState,
    /// Account identity, if a session payload provides one
    pub account: Option<String>,
}

impl ConnectionInfo {
    /// Get the connection duration
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] ({})",
            self.id,
            self.peer_addr,
            self.account.as_deref().unwrap_or("(none)"),
            self.state
        )
    }
}

/// Server snapshot for non-blocking debug information
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    /// Number of live connections
    pub active_connections: usize,
    /// Total connections since server start
    pub total_connections: u64,
    /// Bound listener addresses
    pub listeners: Vec<SocketAddr>,
    /// Whether receiving is paused for a world save
    pub paused: bool,
    /// Server uptime
    pub uptime: Duration,
}

impl fmt::Display for ServerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Server {{ active: {}, total: {}, listeners: {:?}, paused: {}, uptime: {:?} }}",
            self.active_connections,
            self.total_connections,
            self.listeners,
            self.paused,
            self.uptime
        )
    }
}

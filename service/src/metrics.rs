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


//! Session counters
//!
//! Each [`Counter`] is one atomic slot mirrored to the `metrics` facade under
//! `emberlink.*`, so an installed exporter sees the same numbers a
//! [`MetricsSnapshot`] reports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic counters tracked by [`ServerMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    /// Connections that entered the registry
    Opened,
    /// Connections drained from the disposal queue
    Closed,
    /// Sockets vetoed before a connection was built
    Rejected,
    /// Frames read from clients
    FramesIn,
    /// Frames written to clients
    FramesOut,
    /// Transport faults that ended a connection
    ConnectionErrors,
    /// Unknown dispatch keys, unknown actions and malformed frames
    ProtocolErrors,
    /// Completed world saves
    Saves,
}

impl Counter {
    const COUNT: usize = 8;

    /// Facade metric name
    pub fn name(self) -> &'static str {
        match self {
            Counter::Opened => "emberlink.connections.opened",
            Counter::Closed => "emberlink.connections.closed",
            Counter::Rejected => "emberlink.connections.rejected",
            Counter::FramesIn => "emberlink.frames.received",
            Counter::FramesOut => "emberlink.frames.sent",
            Counter::ConnectionErrors => "emberlink.errors.connection",
            Counter::ProtocolErrors => "emberlink.errors.protocol",
            Counter::Saves => "emberlink.world.saves",
        }
    }
}

const ONLINE_GAUGE: &str = "emberlink.connections.online";

/// Shared counters for one server
#[derive(Debug)]
pub struct ServerMetrics {
    counters: [AtomicU64; Counter::COUNT],
    online: AtomicU64,
    peak_online: AtomicU64,
    session_nanos: AtomicU64,
    started_at: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            online: AtomicU64::new(0),
            peak_online: AtomicU64::new(0),
            session_nanos: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    fn bump(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
        metrics::counter!(counter.name()).increment(1);
    }

    /// Current value of `counter`
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// A connection joined the live list
    pub fn connection_opened(&self) {
        self.bump(Counter::Opened);
        let online = self.online.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_online.fetch_max(online, Ordering::Relaxed);
        metrics::gauge!(ONLINE_GAUGE).set(online as f64);
    }

    /// A connection left the live list after `session`
    pub fn connection_closed(&self, session: Duration) {
        self.bump(Counter::Closed);
        let online = self
            .online
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .map_or(0, |previous| previous.saturating_sub(1));
        let nanos = u64::try_from(session.as_nanos()).unwrap_or(u64::MAX);
        self.session_nanos.fetch_add(nanos, Ordering::Relaxed);
        metrics::gauge!(ONLINE_GAUGE).set(online as f64);
    }

    pub fn connection_rejected(&self) {
        self.bump(Counter::Rejected);
    }

    pub fn connection_error(&self) {
        self.bump(Counter::ConnectionErrors);
    }

    pub fn protocol_error(&self) {
        self.bump(Counter::ProtocolErrors);
    }

    pub fn frame_received(&self) {
        self.bump(Counter::FramesIn);
    }

    pub fn frame_sent(&self) {
        self.bump(Counter::FramesOut);
    }

    pub fn save_completed(&self) {
        self.bump(Counter::Saves);
    }

    /// Connections currently in the live list
    pub fn active_connections(&self) -> u64 {
        self.online.load(Ordering::Relaxed)
    }

    /// Connections ever admitted
    pub fn total_connections(&self) -> u64 {
        self.get(Counter::Opened)
    }

    /// Point-in-time copy; fields are read independently
    pub fn snapshot(&self) -> MetricsSnapshot {
        let closed = self.get(Counter::Closed);
        let mean_session = match closed {
            0 => Duration::ZERO,
            n => Duration::from_nanos(self.session_nanos.load(Ordering::Relaxed) / n),
        };
        MetricsSnapshot {
            total_connections: self.get(Counter::Opened),
            active_connections: self.active_connections(),
            peak_connections: self.peak_online.load(Ordering::Relaxed),
            rejected_connections: self.get(Counter::Rejected),
            frames_received: self.get(Counter::FramesIn),
            frames_sent: self.get(Counter::FramesOut),
            connection_errors: self.get(Counter::ConnectionErrors),
            protocol_errors: self.get(Counter::ProtocolErrors),
            saves: self.get(Counter::Saves),
            mean_session,
            uptime: self.started_at.elapsed(),
        }
    }
}

/// Copy of [`ServerMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Highest simultaneous online count
    pub peak_connections: u64,
    pub rejected_connections: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub connection_errors: u64,
    pub protocol_errors: u64,
    pub saves: u64,
    /// Average lifetime of closed connections
    pub mean_session: Duration,
    pub uptime: Duration,
}

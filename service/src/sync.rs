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

//! Blocking cross-thread primitives used by the tick thread

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Auto-reset wake signal
///
/// `set` marks work available and wakes one waiter; a successful wait
/// consumes the mark. Sets that arrive while nobody waits are coalesced.
#[derive(Debug, Default)]
pub struct Signal {
    set: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    /// New, unset
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark work available
    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.condvar.notify_one();
    }

    /// Whether a set is waiting to be consumed
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Block until set, consuming it
    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.condvar.wait(&mut set);
        }
        *set = false;
    }

    /// Block until set or until `timeout` elapses
    ///
    /// Returns `true` if the signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.condvar.wait_until(&mut set, deadline).timed_out() {
                break;
            }
        }
        std::mem::take(&mut *set)
    }
}

/// Manual-reset barrier for the durable write that follows a save
///
/// Starts complete. `begin` closes it; `complete` opens it and releases
/// every waiter.
#[derive(Debug)]
pub struct WriteBarrier {
    complete: Mutex<bool>,
    condvar: Condvar,
}

impl Default for WriteBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBarrier {
    /// New, with no write in progress
    pub fn new() -> Self {
        Self {
            complete: Mutex::new(true),
            condvar: Condvar::new(),
        }
    }

    /// Mark a write as in progress
    pub fn begin(&self) {
        *self.complete.lock() = false;
    }

    /// Mark the write as durable and release waiters
    pub fn complete(&self) {
        let mut complete = self.complete.lock();
        *complete = true;
        self.condvar.notify_all();
    }

    /// Whether no write is in progress
    pub fn is_complete(&self) -> bool {
        *self.complete.lock()
    }

    /// Block until no write is in progress
    pub fn wait(&self) {
        let mut complete = self.complete.lock();
        while !*complete {
            self.condvar.wait(&mut complete);
        }
    }

    /// Block until no write is in progress or `timeout` elapses
    ///
    /// Returns `true` if the barrier is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut complete = self.complete.lock();
        while !*complete {
            if self.condvar.wait_until(&mut complete, deadline).timed_out() {
                break;
            }
        }
        *complete
    }
}

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

//! Delayed and recurring callbacks run on the tick thread

use crate::sync::Signal;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    callback: Mutex<Callback>,
    interval: Option<Duration>,
    next: Mutex<Instant>,
    running: AtomicBool,
}

/// Handle to a registered timer
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<TimerEntry>,
}

impl TimerHandle {
    /// Cancel the timer; a callback already running completes
    pub fn stop(&self) {
        self.entry.running.store(false, Ordering::Release);
    }

    /// Whether the timer will fire again
    pub fn is_running(&self) -> bool {
        self.entry.running.load(Ordering::Acquire)
    }

    /// Next due time
    pub fn next(&self) -> Instant {
        *self.entry.next.lock()
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("interval", &self.entry.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Timer wheel driven by the tick loop
pub struct TimerService {
    timers: Mutex<Vec<Arc<TimerEntry>>>,
    signal: Arc<Signal>,
}

impl TimerService {
    /// Create an empty service that wakes `signal` on registration
    pub fn new(signal: Arc<Signal>) -> Self {
        Self {
            timers: Mutex::new(Vec::new()),
            signal,
        }
    }

    /// Run `callback` after `delay`, then every `interval` if given
    pub fn delay_call<F>(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        callback: F,
    ) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let entry = Arc::new(TimerEntry {
            callback: Mutex::new(Box::new(callback)),
            interval: interval.filter(|interval| !interval.is_zero()),
            next: Mutex::new(Instant::now() + delay),
            running: AtomicBool::new(true),
        });
        self.timers.lock().push(entry.clone());
        self.signal.set();
        TimerHandle { entry }
    }

    /// Run every timer due at `now`
    ///
    /// Callbacks run outside the timer list lock and may register timers.
    /// Returns the number of callbacks run.
    pub fn slice(&self, now: Instant) -> usize {
        let due: Vec<Arc<TimerEntry>> = {
            let mut timers = self.timers.lock();
            let mut due = Vec::new();
            for entry in timers.iter() {
                if !entry.running.load(Ordering::Acquire) {
                    continue;
                }
                let mut next = entry.next.lock();
                if *next > now {
                    continue;
                }
                match entry.interval {
                    Some(interval) => *next = (*next + interval).max(now),
                    None => entry.running.store(false, Ordering::Release),
                }
                due.push(entry.clone());
            }
            timers.retain(|entry| entry.running.load(Ordering::Acquire));
            due
        };

        for entry in &due {
            let mut callback = entry.callback.lock();
            (*callback)();
        }
        due.len()
    }

    /// Earliest due time of any running timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .lock()
            .iter()
            .filter(|entry| entry.running.load(Ordering::Acquire))
            .map(|entry| *entry.next.lock())
            .min()
    }

    /// Registered timers that have not finished
    pub fn count(&self) -> usize {
        self.timers
            .lock()
            .iter()
            .filter(|entry| entry.running.load(Ordering::Acquire))
            .count()
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("timers", &self.count())
            .finish()
    }
}

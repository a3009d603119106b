//! Synchronization points for the parallel boot protocol.
//!
//! [`Arrivals`] counts participants reaching a point; [`Broadcast`] carries a
//! single decision from the coordinator to every participant.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Arrivals {
    expected: usize,
    arrived: Mutex<usize>,
    all_arrived: Condvar,
}

impl Arrivals {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            arrived: Mutex::new(0),
            all_arrived: Condvar::new(),
        }
    }

    /// Record one arrival. Arrivals past the expected count are ignored.
    pub fn arrive(&self) {
        let mut arrived = self.arrived.lock();
        if *arrived < self.expected {
            *arrived += 1;
        }
        if *arrived == self.expected {
            self.all_arrived.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut arrived = self.arrived.lock();
        while *arrived < self.expected {
            self.all_arrived.wait(&mut arrived);
        }
    }

    /// `false` if not everyone arrived within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut arrived = self.arrived.lock();
        while *arrived < self.expected {
            if self
                .all_arrived
                .wait_until(&mut arrived, deadline)
                .timed_out()
            {
                return *arrived >= self.expected;
            }
        }
        true
    }

    pub fn arrived(&self) -> usize {
        *self.arrived.lock()
    }

    pub fn expected(&self) -> usize {
        self.expected
    }
}

/// Set-once value observed by any number of waiters.
#[derive(Debug)]
pub struct Broadcast<T> {
    value: Mutex<Option<T>>,
    published: Condvar,
}

impl<T: Clone> Default for Broadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Broadcast<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            published: Condvar::new(),
        }
    }

    /// Publish `value` unless a value was already published. Returns whether
    /// this call's value is the one waiters see.
    pub fn publish(&self, value: T) -> bool {
        let mut slot = self.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.published.notify_all();
        true
    }

    pub fn wait(&self) -> T {
        let mut slot = self.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.published.wait(&mut slot);
        }
    }

    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }
}

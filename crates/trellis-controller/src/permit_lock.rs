//! Reentrant shared/exclusive lock keyed by operation permit.
//!
//! The controller lock is not tied to a thread: every context working for
//! the same operation (including parallel boot workers) presents the same
//! permit and re-enters an exclusive hold instead of blocking on itself.

use crate::cancel::CancelToken;
use crate::LockError;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Identity of the operation a lock request is made for.
pub type Permit = u64;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    NotLocked,
    Exclusive,
    Shared,
}

#[derive(Debug)]
struct LockState {
    mode: LockMode,
    count: u32,
    holder: Option<Permit>,
    shared: HashMap<Permit, u32>,
}

impl LockState {
    fn can_lock(&self, permit: Permit) -> bool {
        match self.mode {
            LockMode::NotLocked => true,
            LockMode::Exclusive => self.holder == Some(permit),
            LockMode::Shared => false,
        }
    }

    fn can_lock_shared(&self, permit: Permit) -> bool {
        match self.mode {
            LockMode::NotLocked | LockMode::Shared => true,
            LockMode::Exclusive => self.holder == Some(permit),
        }
    }

    /// Waiting for exclusive mode while holding a shared hold never ends.
    fn would_deadlock(&self, permit: Permit) -> bool {
        self.mode == LockMode::Shared && self.shared.contains_key(&permit)
    }

    fn take(&mut self, permit: Permit) {
        self.mode = LockMode::Exclusive;
        self.holder = Some(permit);
        self.count += 1;
    }

    fn take_shared(&mut self, permit: Permit) {
        self.count += 1;
        if self.mode == LockMode::Exclusive {
            return;
        }
        self.mode = LockMode::Shared;
        *self.shared.entry(permit).or_default() += 1;
    }

    /// Drop one exclusive hold; `Ok(true)` once the lock is free.
    fn release(&mut self) -> Result<bool, LockError> {
        self.count = self.count.checked_sub(1).ok_or(LockError::NotLocked)?;
        if self.count > 0 {
            return Ok(false);
        }
        self.mode = LockMode::NotLocked;
        self.holder = None;
        self.shared.clear();
        Ok(true)
    }
}

#[derive(Debug)]
pub struct PermitLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl Default for PermitLock {
    fn default() -> Self {
        Self::new()
    }
}

impl PermitLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                mode: LockMode::NotLocked,
                count: 0,
                holder: None,
                shared: HashMap::new(),
            }),
            released: Condvar::new(),
        }
    }

    /// Block until `permit` holds the lock exclusively.
    pub fn lock(&self, permit: Permit) -> Result<(), LockError> {
        self.acquire(permit, true, None, &CancelToken::new())
            .map(drop)
    }

    pub fn lock_interruptibly(&self, permit: Permit, cancel: &CancelToken) -> Result<(), LockError> {
        self.acquire(permit, true, None, cancel).map(drop)
    }

    /// Wait up to `timeout` for an exclusive hold. `Ok(false)` on timeout.
    pub fn try_lock(
        &self,
        permit: Permit,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, LockError> {
        self.acquire(permit, true, Some(Instant::now() + timeout), cancel)
    }

    pub fn lock_shared(&self, permit: Permit) -> Result<(), LockError> {
        self.acquire(permit, false, None, &CancelToken::new())
            .map(drop)
    }

    pub fn lock_shared_interruptibly(
        &self,
        permit: Permit,
        cancel: &CancelToken,
    ) -> Result<(), LockError> {
        self.acquire(permit, false, None, cancel).map(drop)
    }

    pub fn try_lock_shared(
        &self,
        permit: Permit,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, LockError> {
        self.acquire(permit, false, Some(Instant::now() + timeout), cancel)
    }

    /// Non-blocking probe: takes the exclusive hold and returns `true` only if
    /// that is possible right now.
    pub fn detect_deadlock_and_get_lock(&self, permit: Permit) -> Result<bool, LockError> {
        let mut state = self.state.lock();
        if state.would_deadlock(permit) {
            return Err(LockError::Deadlock(permit));
        }
        if state.can_lock(permit) {
            state.take(permit);
            return Ok(true);
        }
        Ok(false)
    }

    /// Release one exclusive hold. A permit that does not hold the lock gets
    /// `Ok(false)`; releasing a free lock is an error.
    pub fn unlock(&self, permit: Permit) -> Result<bool, LockError> {
        let mut state = self.state.lock();
        match state.mode {
            LockMode::NotLocked => Err(LockError::NotLocked),
            LockMode::Shared => Ok(false),
            LockMode::Exclusive => {
                if state.holder != Some(permit) {
                    return Ok(false);
                }
                if state.release()? {
                    self.released.notify_all();
                }
                Ok(true)
            }
        }
    }

    pub fn unlock_shared(&self, permit: Permit) -> Result<bool, LockError> {
        let mut state = self.state.lock();
        match state.mode {
            LockMode::NotLocked => Err(LockError::NotLocked),
            LockMode::Exclusive => {
                if state.holder != Some(permit) {
                    return Ok(false);
                }
                if state.release()? {
                    self.released.notify_all();
                }
                Ok(true)
            }
            LockMode::Shared => {
                let Some(held) = state.shared.get_mut(&permit) else {
                    return Ok(false);
                };
                *held -= 1;
                if *held == 0 {
                    state.shared.remove(&permit);
                }
                state.count = state.count.checked_sub(1).ok_or(LockError::NotLocked)?;
                if state.count == 0 {
                    state.mode = LockMode::NotLocked;
                    self.released.notify_all();
                }
                Ok(true)
            }
        }
    }

    pub fn mode(&self) -> LockMode {
        self.state.lock().mode
    }

    pub fn is_locked(&self) -> bool {
        self.mode() != LockMode::NotLocked
    }

    pub fn is_held_exclusively_by(&self, permit: Permit) -> bool {
        let state = self.state.lock();
        state.mode == LockMode::Exclusive && state.holder == Some(permit)
    }

    pub fn hold_count(&self) -> u32 {
        self.state.lock().count
    }

    fn acquire(
        &self,
        permit: Permit,
        exclusive: bool,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> Result<bool, LockError> {
        let mut state = self.state.lock();
        if exclusive && state.would_deadlock(permit) {
            return Err(LockError::Deadlock(permit));
        }
        loop {
            if exclusive && state.can_lock(permit) {
                state.take(permit);
                return Ok(true);
            }
            if !exclusive && state.can_lock_shared(permit) {
                state.take_shared(permit);
                return Ok(true);
            }
            if cancel.is_cancelled() {
                return Err(LockError::Interrupted);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            self.released.wait_for(&mut state, wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn exclusive_lock_is_reentrant() {
        let lock = PermitLock::new();
        for _ in 0..3 {
            lock.lock(1).unwrap();
        }
        assert_eq!(lock.hold_count(), 3);
        for remaining in (0..3).rev() {
            assert!(!lock.detect_deadlock_and_get_lock(2).unwrap());
            assert!(lock.unlock(1).unwrap());
            assert_eq!(lock.hold_count(), remaining);
        }
        assert!(lock.detect_deadlock_and_get_lock(2).unwrap());
        assert!(lock.is_held_exclusively_by(2));
    }

    #[test]
    fn other_permits_wait_for_exclusive_holder() {
        let lock = PermitLock::new();
        lock.lock(1).unwrap();
        let cancel = CancelToken::new();
        assert!(!lock.try_lock(2, SHORT, &cancel).unwrap());
        assert!(!lock.try_lock_shared(2, SHORT, &cancel).unwrap());
        assert!(lock.unlock(1).unwrap());
        assert!(lock.try_lock_shared(2, SHORT, &cancel).unwrap());
    }

    #[test]
    fn shared_holds_stack_and_block_exclusive() {
        let lock = PermitLock::new();
        lock.lock_shared(1).unwrap();
        lock.lock_shared(2).unwrap();
        assert_eq!(lock.mode(), LockMode::Shared);
        assert!(!lock.try_lock(3, SHORT, &CancelToken::new()).unwrap());
        assert!(lock.unlock_shared(1).unwrap());
        assert!(lock.unlock_shared(2).unwrap());
        assert!(!lock.is_locked());
        assert!(lock.detect_deadlock_and_get_lock(3).unwrap());
    }

    #[test]
    fn mismatched_release_is_reported_not_fatal() {
        let lock = PermitLock::new();
        lock.lock(1).unwrap();
        assert!(!lock.unlock(2).unwrap());
        assert!(!lock.unlock_shared(2).unwrap());
        assert!(lock.unlock(1).unwrap());
        assert_eq!(lock.unlock(1), Err(LockError::NotLocked));
        assert_eq!(lock.unlock_shared(1), Err(LockError::NotLocked));
    }

    #[test]
    fn shared_holder_cannot_upgrade() {
        let lock = PermitLock::new();
        lock.lock_shared(1).unwrap();
        assert_eq!(lock.detect_deadlock_and_get_lock(1), Err(LockError::Deadlock(1)));
        assert_eq!(lock.lock(1), Err(LockError::Deadlock(1)));
    }

    #[test]
    fn exclusive_holder_may_take_shared_holds() {
        let lock = PermitLock::new();
        lock.lock(7).unwrap();
        lock.lock_shared(7).unwrap();
        assert_eq!(lock.hold_count(), 2);
        assert!(lock.unlock_shared(7).unwrap());
        assert!(lock.unlock(7).unwrap());
        assert!(!lock.is_locked());
    }

    #[test]
    fn blocked_waiter_acquires_after_release() {
        let lock = Arc::new(PermitLock::new());
        lock.lock(1).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let waiter = {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                lock.lock(2).unwrap();
                lock.is_held_exclusively_by(2)
            })
        };

        barrier.wait();
        thread::sleep(SHORT);
        assert!(lock.unlock(1).unwrap());
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn cancellation_interrupts_waiter() {
        let lock = Arc::new(PermitLock::new());
        lock.lock(1).unwrap();
        let cancel = CancelToken::new();

        let waiter = {
            let lock = Arc::clone(&lock);
            let cancel = cancel.clone();
            thread::spawn(move || lock.lock_interruptibly(2, &cancel))
        };

        thread::sleep(SHORT);
        cancel.cancel();
        assert_eq!(waiter.join().unwrap(), Err(LockError::Interrupted));
        assert!(lock.is_held_exclusively_by(1));
    }
}

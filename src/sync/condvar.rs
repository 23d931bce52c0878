//! Condition variable for [`FastMutex`](super::FastMutex) and the leveled
//! guards.
//!
//! Waiters sample a sequence counter while still holding their mutex and then
//! park on the condvar's address only if the counter is unchanged, so a notify
//! issued after a thread registered can never be lost.

use parking_lot_core::{ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::ops::DerefMut;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::fast_lock::{FastMutexGuard, RawFastLock};
use parking_lot::lock_api;

/// A guard whose lock can be released for the duration of a closure.
pub trait Relockable: DerefMut {
    fn unlocked<U>(&mut self, f: impl FnOnce() -> U) -> U;
}

impl<'a, T> Relockable for FastMutexGuard<'a, T> {
    fn unlocked<U>(&mut self, f: impl FnOnce() -> U) -> U {
        lock_api::MutexGuard::<'a, RawFastLock, T>::unlocked(self, f)
    }
}

/// Outcome of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

#[derive(Default)]
pub struct FastCondvar {
    seq: AtomicU32,
}

impl FastCondvar {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
        }
    }

    #[inline]
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Wakes one waiting thread. Returns whether a thread was woken.
    pub fn notify_one(&self) -> bool {
        self.seq.fetch_add(1, Ordering::Release);
        // SAFETY: the key is this condvar's address and the callback does not
        // re-enter parking_lot_core.
        let result = unsafe { parking_lot_core::unpark_one(self.key(), |_| DEFAULT_UNPARK_TOKEN) };
        result.unparked_threads != 0
    }

    /// Wakes every waiting thread. Returns the number woken.
    pub fn notify_all(&self) -> usize {
        self.seq.fetch_add(1, Ordering::Release);
        // SAFETY: see `notify_one`.
        unsafe { parking_lot_core::unpark_all(self.key(), DEFAULT_UNPARK_TOKEN) }
    }

    /// Blocks until notified. May also return spuriously.
    pub fn wait<G: Relockable>(&self, guard: &mut G) {
        self.wait_internal(guard, None);
    }

    /// Blocks until `condition` returns `false`.
    pub fn wait_while<G, T, F>(&self, guard: &mut G, mut condition: F)
    where
        G: Relockable + DerefMut<Target = T>,
        T: ?Sized,
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut **guard) {
            self.wait(guard);
        }
    }

    pub fn wait_until<G: Relockable>(&self, guard: &mut G, deadline: Instant) -> WaitTimeoutResult {
        self.wait_internal(guard, Some(deadline))
    }

    pub fn wait_for<G: Relockable>(&self, guard: &mut G, timeout: Duration) -> WaitTimeoutResult {
        self.wait_internal(guard, Instant::now().checked_add(timeout))
    }

    /// Waits while `condition` holds or until `deadline` passes. The result
    /// reports a timeout only if the condition still held at the deadline.
    pub fn wait_while_until<G, T, F>(
        &self,
        guard: &mut G,
        mut condition: F,
        deadline: Instant,
    ) -> WaitTimeoutResult
    where
        G: Relockable + DerefMut<Target = T>,
        T: ?Sized,
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut **guard) {
            if self.wait_until(guard, deadline).timed_out() {
                return WaitTimeoutResult(condition(&mut **guard));
            }
        }
        WaitTimeoutResult(false)
    }

    pub fn wait_while_for<G, T, F>(
        &self,
        guard: &mut G,
        condition: F,
        timeout: Duration,
    ) -> WaitTimeoutResult
    where
        G: Relockable + DerefMut<Target = T>,
        T: ?Sized,
        F: FnMut(&mut T) -> bool,
    {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_while_until(guard, condition, deadline),
            None => {
                self.wait_while(guard, condition);
                WaitTimeoutResult(false)
            }
        }
    }

    fn wait_internal<G: Relockable>(&self, guard: &mut G, deadline: Option<Instant>) -> WaitTimeoutResult {
        let seq = self.seq.load(Ordering::Acquire);
        let result = guard.unlocked(|| {
            // SAFETY: the key is this condvar's address; `validate` only reads
            // our own counter.
            unsafe {
                parking_lot_core::park(
                    self.key(),
                    || self.seq.load(Ordering::Acquire) == seq,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    deadline,
                )
            }
        });
        WaitTimeoutResult(matches!(result, ParkResult::TimedOut))
    }
}

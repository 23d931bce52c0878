//! Word-sized mutex with an uncontended atomic fast path.
//!
//! The state word packs one "owned" bit with a count of threads that found the
//! lock contended and went to sleep. Sleeping threads are parked in
//! `parking_lot_core`, keyed by the lock's own address, so a `RawFastLock`
//! costs a single `usize` and needs no OS handle.

use parking_lot::lock_api::{self, GuardSend, RawMutex};
use parking_lot_core::{ParkResult, SpinWait, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::fatal::abort_with;

const LOCKED: usize = 1;
const WAITER: usize = 1 << 1;
const WAITER_MASK: usize = !LOCKED;

/// Raw lock used underneath [`FastMutex`] and the leveled locks.
pub struct RawFastLock {
    state: AtomicUsize,
}

/// A mutex over `T` backed by [`RawFastLock`].
pub type FastMutex<T> = lock_api::Mutex<RawFastLock, T>;
pub type FastMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawFastLock, T>;

impl RawFastLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Number of threads currently registered as sleeping on this lock.
    pub fn waiters(&self) -> usize {
        (self.state.load(Ordering::Relaxed) & WAITER_MASK) / WAITER
    }

    #[inline]
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    #[cold]
    fn lock_slow(&self) {
        let mut spin = SpinWait::new();
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & LOCKED == 0 {
                match self.state.compare_exchange_weak(
                    state,
                    state | LOCKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(actual) => state = actual,
                }
                continue;
            }

            // Nobody asleep yet: spinning a little is cheaper than parking.
            if state & WAITER_MASK == 0 && spin.spin() {
                state = self.state.load(Ordering::Relaxed);
                continue;
            }

            // The waiter count is bumped inside `validate`, which runs under the
            // parking-lot bucket lock, so it always equals the number of threads
            // actually queued on this key.
            let validate = || {
                let mut current = self.state.load(Ordering::Relaxed);
                loop {
                    if current & LOCKED == 0 {
                        return false;
                    }
                    if current & WAITER_MASK == WAITER_MASK {
                        abort_with(&format!(
                            "waiter count overflow on lock {:#x} (state {:#x})",
                            self.key(),
                            current
                        ));
                    }
                    match self.state.compare_exchange_weak(
                        current,
                        current + WAITER,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return true,
                        Err(actual) => current = actual,
                    }
                }
            };

            // SAFETY: the key is this lock's address and none of the callbacks
            // call back into parking_lot_core.
            let result = unsafe {
                parking_lot_core::park(
                    self.key(),
                    validate,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    None,
                )
            };
            if let ParkResult::TimedOut = result {
                abort_with(&format!("untimed park on lock {:#x} timed out", self.key()));
            }

            spin.reset();
            state = self.state.load(Ordering::Relaxed);
        }
    }

    #[cold]
    fn wake_one(&self) {
        // SAFETY: the callback only touches our own atomic.
        unsafe {
            parking_lot_core::unpark_one(self.key(), |result| {
                if result.unparked_threads != 0 {
                    self.state.fetch_sub(WAITER, Ordering::Relaxed);
                }
                DEFAULT_UNPARK_TOKEN
            });
        }
    }
}

impl Default for RawFastLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for RawFastLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        if self
            .state
            .compare_exchange_weak(0, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & LOCKED != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state | LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        let previous = self.state.fetch_and(!LOCKED, Ordering::Release);
        if previous & LOCKED == 0 {
            abort_with(&format!(
                "unlock of unlocked lock {:#x} (state {:#x})",
                self.key(),
                previous
            ));
        }
        if previous & WAITER_MASK != 0 {
            self.wake_one();
        }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOCKED != 0
    }
}

//! Locks tagged with a [`LockLevel`] and reported to the process checker.
//!
//! These are the only locks world state is allowed to live behind. The raw
//! [`FastMutex`] stays available for primitives that must not be checked.

use parking_lot::lock_api::{self, RawMutex};
use parking_lot::RawThreadId;
use std::fmt;
use std::ops::{Deref, DerefMut};

use super::condvar::Relockable;
use super::fast_lock::{FastMutex, FastMutexGuard, RawFastLock};
use super::hierarchy::{checker, LockLevel};

pub struct LeveledLock<T> {
    level: LockLevel,
    inner: FastMutex<T>,
}

impl<T> LeveledLock<T> {
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: FastMutex::const_new(<RawFastLock as RawMutex>::INIT, value),
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    #[inline]
    fn identity(&self) -> usize {
        self as *const Self as usize
    }

    /// Blocks until the lock is held.
    pub fn lock(&self) -> LeveledGuard<'_, T> {
        let checker = checker();
        checker.check_lock(self.level, self.identity());
        let guard = self.inner.lock();
        checker.add_lock(self.level, self.identity());
        LeveledGuard { lock: self, guard }
    }

    /// Never blocks. A failed attempt cannot deadlock, so only successful
    /// acquisitions are reported to the checker.
    pub fn try_lock(&self) -> Option<LeveledGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        checker().add_lock(self.level, self.identity());
        Some(LeveledGuard { lock: self, guard })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> fmt::Debug for LeveledLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeveledLock")
            .field("level", &self.level)
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[must_use = "if unused the lock is released immediately"]
pub struct LeveledGuard<'a, T> {
    lock: &'a LeveledLock<T>,
    guard: FastMutexGuard<'a, T>,
}

impl<'a, T> LeveledGuard<'a, T> {
    pub fn level(&self) -> LockLevel {
        self.lock.level
    }

    /// Explicit release; same as dropping the guard.
    pub fn release(self) {}
}

impl<'a, T> Deref for LeveledGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for LeveledGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Relockable for LeveledGuard<'a, T> {
    fn unlocked<U>(&mut self, f: impl FnOnce() -> U) -> U {
        let checker = checker();
        let (level, identity) = (self.lock.level, self.lock.identity());
        checker.remove_lock(level, identity);
        let result = self.guard.unlocked(|| {
            let result = f();
            checker.check_lock(level, identity);
            result
        });
        checker.add_lock(level, identity);
        result
    }
}

impl<'a, T> Drop for LeveledGuard<'a, T> {
    fn drop(&mut self) {
        // Runs before the inner guard releases the mutex.
        checker().remove_lock(self.lock.level, self.lock.identity());
    }
}

type ReentrantFastMutex<T> = lock_api::ReentrantMutex<RawFastLock, RawThreadId, T>;
type ReentrantFastGuard<'a, T> = lock_api::ReentrantMutexGuard<'a, RawFastLock, RawThreadId, T>;

/// Reentrant variant. Only shared access to the value is handed out, so
/// mutable state inside needs a `Cell` or `RefCell`.
pub struct RecursiveLeveledLock<T> {
    level: LockLevel,
    inner: ReentrantFastMutex<T>,
}

impl<T> RecursiveLeveledLock<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: ReentrantFastMutex::new(value),
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    #[inline]
    fn identity(&self) -> usize {
        self as *const Self as usize
    }

    pub fn lock(&self) -> RecursiveLeveledGuard<'_, T> {
        let checker = checker();
        checker.check_recursive_lock(self.level, self.identity());
        let guard = self.inner.lock();
        checker.add_lock(self.level, self.identity());
        RecursiveLeveledGuard { lock: self, guard }
    }

    pub fn try_lock(&self) -> Option<RecursiveLeveledGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        checker().add_lock(self.level, self.identity());
        Some(RecursiveLeveledGuard { lock: self, guard })
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.inner.is_owned_by_current_thread()
    }
}

impl<T> fmt::Debug for RecursiveLeveledLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveLeveledLock")
            .field("level", &self.level)
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}

#[must_use = "if unused the lock is released immediately"]
pub struct RecursiveLeveledGuard<'a, T> {
    lock: &'a RecursiveLeveledLock<T>,
    guard: ReentrantFastGuard<'a, T>,
}

impl<'a, T> Deref for RecursiveLeveledGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> Drop for RecursiveLeveledGuard<'a, T> {
    fn drop(&mut self) {
        checker().remove_lock(self.lock.level, self.lock.identity());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{mode, FastCondvar, HierarchyMode, HierarchyViolation};
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lock_and_try_lock() {
        let lock = LeveledLock::new(LockLevel::SUBCHUNK, 5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert_eq!(guard.level(), LockLevel::SUBCHUNK);
            assert!(lock.is_locked());
        }
        let guard = lock.try_lock().expect("lock should be free");
        assert_eq!(*guard, 6);
        guard.release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock_fails_from_other_thread() {
        let lock = LeveledLock::new(LockLevel::SUBCHUNK, ());
        let _guard = lock.lock();
        thread::scope(|s| {
            s.spawn(|| assert!(lock.try_lock().is_none()));
        });
    }

    #[test]
    fn test_increasing_levels_nest() {
        let bucket = LeveledLock::new(LockLevel::CHUNK_BUCKET, ());
        let subchunk = LeveledLock::new(LockLevel::SUBCHUNK, ());
        let _outer = bucket.lock();
        let _inner = subchunk.lock();
        let held = checker().held_levels();
        if cfg!(debug_assertions) {
            assert_eq!(held.get(&LockLevel::CHUNK_BUCKET), Some(&1));
            assert_eq!(held.get(&LockLevel::SUBCHUNK), Some(&1));
        }
    }

    #[test]
    fn test_lower_level_after_held_lock_is_rejected() {
        if mode() != HierarchyMode::Enforce {
            return;
        }
        let subchunk = LeveledLock::new(LockLevel::SUBCHUNK, ());
        let bucket = LeveledLock::new(LockLevel::CHUNK_BUCKET, ());
        let bucket_id = &bucket as *const _ as usize;

        let guard = subchunk.lock();
        let err = checker()
            .try_check_lock(LockLevel::CHUNK_BUCKET, bucket_id)
            .unwrap_err();
        assert!(matches!(
            err,
            HierarchyViolation::OutOfOrder { requested, held, .. }
                if requested == LockLevel::CHUNK_BUCKET && held == LockLevel::SUBCHUNK
        ));
        drop(guard);
        assert!(checker().try_check_lock(LockLevel::CHUNK_BUCKET, bucket_id).is_ok());

        // A non-blocking hold counts just the same.
        let guard = subchunk.try_lock().unwrap();
        assert!(checker().try_check_lock(LockLevel::CHUNK_BUCKET, bucket_id).is_err());
        drop(guard);

        // The right order still goes through.
        let _outer = bucket.lock();
        assert!(checker().try_check_lock(LockLevel::SUBCHUNK, 0x1).is_ok());
    }

    #[test]
    fn test_condvar_wait_restores_hold() {
        if mode() != HierarchyMode::Enforce {
            return;
        }
        let state = LeveledLock::new(LockLevel::SUBCHUNK, ());
        let condvar = FastCondvar::new();
        let mut guard = state.lock();
        assert!(condvar.wait_for(&mut guard, Duration::from_millis(1)).timed_out());
        assert_eq!(checker().held_levels().get(&LockLevel::SUBCHUNK), Some(&1));
        assert!(checker().try_check_lock(LockLevel::CHUNK_META, 0x1).is_err());
    }

    #[test]
    fn test_guard_drop_clears_checker_state() {
        let lock = LeveledLock::new(LockLevel::SUBCHUNK, ());
        drop(lock.lock());
        drop(lock.try_lock());
        assert!(checker().held_levels().is_empty());
    }

    #[test]
    fn test_condvar_wait_releases_leveled_lock() {
        let state = LeveledLock::new(LockLevel::SUBCHUNK, 0u32);
        let condvar = FastCondvar::new();
        let woken = AtomicUsize::new(0);
        thread::scope(|s| {
            s.spawn(|| {
                let mut guard = state.lock();
                condvar.wait_while(&mut guard, |n| *n == 0);
                woken.fetch_add(1, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(5));
            *state.lock() = 1;
            condvar.notify_all();
        });
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert!(checker().held_levels().is_empty());
    }

    #[test]
    fn test_recursive_lock_reenters() {
        let meta = RecursiveLeveledLock::new(LockLevel::CHUNK_META, Cell::new(0));
        let outer = meta.lock();
        outer.set(1);
        {
            let inner = meta.lock();
            inner.set(inner.get() + 1);
            assert!(meta.is_owned_by_current_thread());
        }
        assert_eq!(outer.get(), 2);
        thread::scope(|s| {
            s.spawn(|| assert!(meta.try_lock().is_none()));
        });
    }
}

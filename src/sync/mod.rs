//! Lock primitives shared by every world-state consumer.

pub mod condvar;
pub mod fast_lock;
pub mod fatal;
pub mod hierarchy;
pub mod leveled;

pub use condvar::{FastCondvar, Relockable, WaitTimeoutResult};
pub use fast_lock::{FastMutex, FastMutexGuard, RawFastLock};
pub use hierarchy::{
    checker, install_mode, mode, HierarchyChecker, HierarchyMode, HierarchyViolation, LockLevel,
    NullHierarchyChecker, ThreadHierarchyChecker,
};
pub use leveled::{LeveledGuard, LeveledLock, RecursiveLeveledGuard, RecursiveLeveledLock};

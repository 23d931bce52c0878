//! Lock-order checking.
//!
//! Every leveled lock carries a [`LockLevel`]. A thread may only block on a
//! lock whose level is strictly greater than every level it already holds;
//! any other order can deadlock against a thread taking the same pair the
//! other way round. Violations are caught the moment the bad order is
//! attempted, whether or not the deadlock would actually happen this run.
//!
//! Checking is a process-wide capability picked once at startup: either the
//! [`ThreadHierarchyChecker`] (per-thread bookkeeping) or the
//! [`NullHierarchyChecker`] (no-op). Both are always compiled.

use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use thread_local::ThreadLocal;

use super::fatal::abort_with;
use crate::utils::error::{Result, StoreError};

/// Position of a lock in the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockLevel(pub u32);

impl LockLevel {
    /// Guards one bucket's chain in the chunk map.
    pub const CHUNK_BUCKET: Self = Self(10);
    /// Recursive lock over a chunk's own metadata.
    pub const CHUNK_META: Self = Self(30);
    /// Guards the blocks and caches of a single subchunk.
    pub const SUBCHUNK: Self = Self(50);
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HierarchyViolation {
    #[error(
        "lock {identity:#x} at level {requested} acquired while holding level {held}; held levels: {histogram}"
    )]
    OutOfOrder {
        requested: LockLevel,
        identity: usize,
        held: LockLevel,
        histogram: String,
    },

    #[error("lock {identity:#x} at level {level} released but not held by this thread")]
    NotHeld { level: LockLevel, identity: usize },
}

pub trait HierarchyChecker: Send + Sync {
    /// Validates a blocking, non-recursive acquisition.
    fn try_check_lock(&self, level: LockLevel, identity: usize) -> std::result::Result<(), HierarchyViolation>;

    /// Like [`try_check_lock`](Self::try_check_lock), but re-entering a lock
    /// this thread already holds is always allowed.
    fn try_check_recursive_lock(
        &self,
        level: LockLevel,
        identity: usize,
    ) -> std::result::Result<(), HierarchyViolation>;

    /// Records an acquisition. Call right after the lock is taken.
    fn add_lock(&self, level: LockLevel, identity: usize);

    /// Forgets one acquisition. Call right before the lock is released.
    fn try_remove_lock(&self, level: LockLevel, identity: usize) -> std::result::Result<(), HierarchyViolation>;

    /// Held levels of the calling thread with their multiplicity.
    fn held_levels(&self) -> BTreeMap<LockLevel, usize>;

    fn check_lock(&self, level: LockLevel, identity: usize) {
        if let Err(violation) = self.try_check_lock(level, identity) {
            abort_with(&violation.to_string());
        }
    }

    fn check_recursive_lock(&self, level: LockLevel, identity: usize) {
        if let Err(violation) = self.try_check_recursive_lock(level, identity) {
            abort_with(&violation.to_string());
        }
    }

    fn remove_lock(&self, level: LockLevel, identity: usize) {
        if let Err(violation) = self.try_remove_lock(level, identity) {
            abort_with(&violation.to_string());
        }
    }
}

/// Accepts everything and records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHierarchyChecker;

impl HierarchyChecker for NullHierarchyChecker {
    fn try_check_lock(&self, _: LockLevel, _: usize) -> std::result::Result<(), HierarchyViolation> {
        Ok(())
    }

    fn try_check_recursive_lock(&self, _: LockLevel, _: usize) -> std::result::Result<(), HierarchyViolation> {
        Ok(())
    }

    fn add_lock(&self, _: LockLevel, _: usize) {}

    fn try_remove_lock(&self, _: LockLevel, _: usize) -> std::result::Result<(), HierarchyViolation> {
        Ok(())
    }

    fn held_levels(&self) -> BTreeMap<LockLevel, usize> {
        BTreeMap::new()
    }
}

#[derive(Debug, Default)]
struct HeldLocks {
    /// Multiset of held levels, one entry per distinct lock.
    levels: BTreeMap<LockLevel, usize>,
    /// Hold count per lock identity.
    holds: HashMap<usize, (LockLevel, usize)>,
}

impl HeldLocks {
    fn histogram(&self) -> String {
        let parts: Vec<String> = self
            .levels
            .iter()
            .map(|(level, count)| format!("{}x{}", level, count))
            .collect();
        format!("[{}]", parts.join(", "))
    }

    fn check(&self, requested: LockLevel, identity: usize) -> std::result::Result<(), HierarchyViolation> {
        match self.levels.keys().next_back() {
            Some(&held) if held >= requested => Err(HierarchyViolation::OutOfOrder {
                requested,
                identity,
                held,
                histogram: self.histogram(),
            }),
            _ => Ok(()),
        }
    }
}

/// Tracks held locks per thread. Each thread's state lives in a
/// `ThreadLocal` slot owned by the checker and is created on the thread's
/// first lock.
#[derive(Default)]
pub struct ThreadHierarchyChecker {
    threads: ThreadLocal<RefCell<HeldLocks>>,
}

impl ThreadHierarchyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_held<R>(&self, f: impl FnOnce(&mut HeldLocks) -> R) -> R {
        let cell = self.threads.get_or_default();
        let mut held = cell.borrow_mut();
        f(&mut held)
    }
}

impl HierarchyChecker for ThreadHierarchyChecker {
    fn try_check_lock(&self, level: LockLevel, identity: usize) -> std::result::Result<(), HierarchyViolation> {
        self.with_held(|held| held.check(level, identity))
    }

    fn try_check_recursive_lock(
        &self,
        level: LockLevel,
        identity: usize,
    ) -> std::result::Result<(), HierarchyViolation> {
        self.with_held(|held| {
            if held.holds.contains_key(&identity) {
                Ok(())
            } else {
                held.check(level, identity)
            }
        })
    }

    fn add_lock(&self, level: LockLevel, identity: usize) {
        self.with_held(|held| {
            let entry = held.holds.entry(identity).or_insert((level, 0));
            entry.1 += 1;
            if entry.1 == 1 {
                *held.levels.entry(level).or_insert(0) += 1;
            }
        })
    }

    fn try_remove_lock(&self, level: LockLevel, identity: usize) -> std::result::Result<(), HierarchyViolation> {
        self.with_held(|held| {
            let remaining = match held.holds.get_mut(&identity) {
                Some((held_level, count)) if *held_level == level => {
                    *count -= 1;
                    *count
                }
                _ => return Err(HierarchyViolation::NotHeld { level, identity }),
            };
            if remaining == 0 {
                held.holds.remove(&identity);
                if let Some(count) = held.levels.get_mut(&level) {
                    *count -= 1;
                    if *count == 0 {
                        held.levels.remove(&level);
                    }
                }
            }
            Ok(())
        })
    }

    fn held_levels(&self) -> BTreeMap<LockLevel, usize> {
        self.with_held(|held| held.levels.clone())
    }
}

/// How lock order is checked for the whole process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HierarchyMode {
    /// Enforce in debug builds, skip in release builds.
    #[default]
    Auto,
    Enforce,
    Off,
}

impl HierarchyMode {
    fn resolve(self) -> Self {
        match self {
            HierarchyMode::Auto if cfg!(debug_assertions) => HierarchyMode::Enforce,
            HierarchyMode::Auto => HierarchyMode::Off,
            other => other,
        }
    }
}

static MODE: OnceCell<HierarchyMode> = OnceCell::new();
static THREAD_CHECKER: Lazy<ThreadHierarchyChecker> = Lazy::new(ThreadHierarchyChecker::new);
static NULL_CHECKER: NullHierarchyChecker = NullHierarchyChecker;

/// Picks the process-wide checking mode. Must run before the first leveled
/// lock is taken; afterwards the mode is fixed.
pub fn install_mode(mode: HierarchyMode) -> Result<()> {
    let resolved = mode.resolve();
    MODE.set(resolved)
        .map_err(|_| StoreError::HierarchyModeAlreadySet)?;
    log::info!("lock hierarchy checking: {:?}", resolved);
    Ok(())
}

pub fn mode() -> HierarchyMode {
    *MODE.get_or_init(|| HierarchyMode::Auto.resolve())
}

/// The checker selected for this process.
pub fn checker() -> &'static dyn HierarchyChecker {
    match mode() {
        HierarchyMode::Enforce => &*THREAD_CHECKER,
        _ => &NULL_CHECKER,
    }
}

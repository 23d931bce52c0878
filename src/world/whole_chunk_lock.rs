//! Taking every subchunk lock of a chunk as one unit.
//!
//! One lock, the anchor, is taken with a blocking `lock`; the rest are only
//! ever `try_lock`ed in scan order. When a `try_lock` fails, everything taken
//! so far is dropped, the contended lock becomes the new anchor, and the scan
//! restarts once the anchor is held. A thread therefore only ever blocks while
//! holding nothing from the set, which rules out deadlock between scanners no
//! matter which order each of them scans in.

use log::debug;

use crate::sync::{LeveledGuard, LeveledLock};
use crate::world::chunk::{Chunk, SubchunkData};

/// A set of locks addressed by index.
pub trait LockSet {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocking acquisition of one lock.
    fn lock(&mut self, index: usize);

    /// Non-blocking acquisition; `false` if the lock is taken.
    fn try_lock(&mut self, index: usize) -> bool;

    /// Releases every lock this set currently holds.
    fn release_all(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireState {
    /// Blocking on the anchor with nothing else held.
    Anchoring { anchor: usize },
    /// Anchor held, trying the remaining locks in order.
    Scanning { anchor: usize },
    Acquired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Complete,
    Contended { index: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireStats {
    /// Scans started, including the successful one.
    pub passes: usize,
    /// Anchor changes caused by a failed `try_lock`.
    pub retries: usize,
}

fn scan<S: LockSet>(set: &mut S, order: &[usize], anchor: usize) -> ScanOutcome {
    for &index in order {
        if index != anchor && !set.try_lock(index) {
            return ScanOutcome::Contended { index };
        }
    }
    ScanOutcome::Complete
}

/// Drives the acquire state machine until every lock in `order` is held.
/// `order` must name each index of `set` exactly once.
pub fn acquire_all<S: LockSet>(set: &mut S, order: &[usize]) -> AcquireStats {
    debug_assert_eq!(order.len(), set.len());
    let mut stats = AcquireStats::default();
    let Some(&first) = order.first() else {
        return stats;
    };

    let mut state = AcquireState::Anchoring { anchor: first };
    loop {
        state = match state {
            AcquireState::Anchoring { anchor } => {
                set.lock(anchor);
                AcquireState::Scanning { anchor }
            }
            AcquireState::Scanning { anchor } => {
                stats.passes += 1;
                match scan(set, order, anchor) {
                    ScanOutcome::Complete => AcquireState::Acquired,
                    ScanOutcome::Contended { index } => {
                        set.release_all();
                        stats.retries += 1;
                        AcquireState::Anchoring { anchor: index }
                    }
                }
            }
            AcquireState::Acquired => return stats,
        };
    }
}

/// [`LockSet`] over leveled locks that keeps the guards it takes. Dropping it
/// (including during unwinding) releases whatever it holds.
pub struct GuardSet<'a, T> {
    locks: Vec<&'a LeveledLock<T>>,
    guards: Vec<Option<LeveledGuard<'a, T>>>,
}

impl<'a, T> GuardSet<'a, T> {
    pub fn new(locks: impl IntoIterator<Item = &'a LeveledLock<T>>) -> Self {
        let locks: Vec<_> = locks.into_iter().collect();
        let guards = locks.iter().map(|_| None).collect();
        Self { locks, guards }
    }

    pub fn held(&self) -> usize {
        self.guards.iter().filter(|guard| guard.is_some()).count()
    }

    /// Guards in index order. Only meaningful once everything is held.
    pub fn into_guards(self) -> Vec<LeveledGuard<'a, T>> {
        self.guards.into_iter().flatten().collect()
    }
}

impl<'a, T> LockSet for GuardSet<'a, T> {
    fn len(&self) -> usize {
        self.locks.len()
    }

    fn lock(&mut self, index: usize) {
        let lock: &'a LeveledLock<T> = self.locks[index];
        self.guards[index] = Some(lock.lock());
    }

    fn try_lock(&mut self, index: usize) -> bool {
        let lock: &'a LeveledLock<T> = self.locks[index];
        match lock.try_lock() {
            Some(guard) => {
                self.guards[index] = Some(guard);
                true
            }
            None => false,
        }
    }

    fn release_all(&mut self) {
        for guard in self.guards.iter_mut() {
            *guard = None;
        }
    }
}

/// Exclusive access to every subchunk of a chunk for as long as it lives.
#[must_use = "if unused the chunk is unlocked immediately"]
pub struct WholeChunkLock<'a> {
    chunk: &'a Chunk,
    guards: Vec<LeveledGuard<'a, SubchunkData>>,
    stats: AcquireStats,
}

impl<'a> WholeChunkLock<'a> {
    /// Blocks until all subchunks of `chunk` are held, scanning in index order.
    pub fn new(chunk: &'a Chunk) -> Self {
        let order: Vec<usize> = (0..chunk.subchunks().len()).collect();
        Self::with_order(chunk, &order)
    }

    /// Same as [`new`](Self::new) with a caller-chosen scan order.
    pub fn with_order(chunk: &'a Chunk, order: &[usize]) -> Self {
        let mut set = GuardSet::new(chunk.subchunks().iter().map(|s| s.raw_lock()));
        let stats = acquire_all(&mut set, order);
        if stats.retries > 0 {
            debug!(
                "whole-chunk lock on {} took {} passes",
                chunk.coord(),
                stats.passes
            );
        }
        let guards = set.into_guards();
        debug_assert_eq!(guards.len(), chunk.subchunks().len());
        Self {
            chunk,
            guards,
            stats,
        }
    }

    pub fn chunk(&self) -> &'a Chunk {
        self.chunk
    }

    pub fn stats(&self) -> AcquireStats {
        self.stats
    }

    pub fn subchunk(&self, index: usize) -> &SubchunkData {
        &self.guards[index]
    }

    pub fn subchunk_mut(&mut self, index: usize) -> &mut SubchunkData {
        &mut self.guards[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubchunkData> {
        self.guards.iter().map(|guard| &**guard)
    }

    pub fn iter_mut(&mut self) -> SubchunksMut<'_, 'a> {
        SubchunksMut {
            guards: self.guards.iter_mut(),
        }
    }
}

/// Mutable iterator over the subchunks held by a [`WholeChunkLock`].
pub struct SubchunksMut<'s, 'a> {
    guards: std::slice::IterMut<'s, LeveledGuard<'a, SubchunkData>>,
}

impl<'s, 'a> Iterator for SubchunksMut<'s, 'a> {
    type Item = &'s mut SubchunkData;

    fn next(&mut self) -> Option<Self::Item> {
        self.guards.next().map(|guard| &mut **guard)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.guards.size_hint()
    }
}

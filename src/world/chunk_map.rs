//! Fixed-size, lock-striped hash map from chunk coordinate to chunk.
//!
//! Each bucket is a small vector behind its own [`LeveledLock`], so threads
//! working on chunks in different buckets never contend. The bucket count is
//! a prime picked at construction and never changes: cursors hold bucket
//! locks across calls, and a rehash would have to move entries out from under
//! them.
//!
//! A [`ChunkCursor`] holds the lock of the bucket it points into for as long
//! as it points at an entry, and holds no lock once it reaches the end. It
//! never holds two bucket locks at the same time.

use log::debug;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::sync::fatal::abort_with;
use crate::sync::{LeveledGuard, LeveledLock, LockLevel};
use crate::utils::error::{Result, StoreError};
use crate::utils::math::next_prime;
use crate::world::chunk::Chunk;
use crate::world::chunk_coord::ChunkCoord;

pub struct Entry<V> {
    coord: ChunkCoord,
    value: Arc<V>,
}

impl<V> Entry<V> {
    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn value(&self) -> &Arc<V> {
        &self.value
    }
}

type Bucket<V> = Vec<Entry<V>>;

pub struct StripedChunkMap<V = Chunk> {
    buckets: Box<[LeveledLock<Bucket<V>>]>,
    len: AtomicUsize,
}

impl<V> StripedChunkMap<V> {
    /// Creates a map with the smallest prime bucket count `>= capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        let bucket_count = next_prime(capacity);
        debug!(
            "chunk map: requested {} buckets, using {}",
            capacity, bucket_count
        );
        Self {
            buckets: (0..bucket_count)
                .map(|_| LeveledLock::new(LockLevel::CHUNK_BUCKET, Vec::new()))
                .collect(),
            len: AtomicUsize::new(0),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_index(&self, coord: &ChunkCoord) -> usize {
        (coord.bucket_hash() % self.buckets.len() as u64) as usize
    }

    /// Number of entries. Exact only while no other thread is mutating.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the bucket `coord` hashes to, for compound find-and-mutate work.
    pub fn bucket_lock(&self, coord: &ChunkCoord) -> BucketGuard<'_, V> {
        let bucket = self.bucket_index(coord);
        BucketGuard {
            map: self,
            bucket,
            guard: self.buckets[bucket].lock(),
        }
    }

    /// Cursor at `coord`, or the end cursor. A hit keeps the bucket locked.
    pub fn find(&self, coord: &ChunkCoord) -> ChunkCursor<'_, V> {
        self.bucket_lock(coord).into_cursor(coord)
    }

    pub fn contains(&self, coord: &ChunkCoord) -> bool {
        !self.find(coord).is_end()
    }

    /// Shared handle to the chunk at `coord`; the bucket is unlocked on return.
    pub fn get(&self, coord: &ChunkCoord) -> Option<Arc<V>> {
        self.find(coord).value().cloned()
    }

    /// Find-or-insert. `make` runs under the bucket lock, only on a miss.
    pub fn create_with(
        &self,
        coord: ChunkCoord,
        make: impl FnOnce(ChunkCoord) -> V,
    ) -> (ChunkCursor<'_, V>, bool) {
        let mut bucket = self.bucket_lock(&coord);
        let inserted = bucket.get(&coord).is_none();
        if inserted {
            bucket.push(coord, Arc::new(make(coord)));
        }
        (bucket.into_cursor(&coord), inserted)
    }

    pub fn create(&self, coord: ChunkCoord) -> (ChunkCursor<'_, V>, bool)
    where
        V: From<ChunkCoord>,
    {
        self.create_with(coord, V::from)
    }

    /// Inserts an already built value unless `coord` is present; on a hit the
    /// new value is dropped and the existing entry returned.
    pub fn insert(&self, coord: ChunkCoord, value: V) -> (ChunkCursor<'_, V>, bool) {
        self.create_with(coord, move |_| value)
    }

    /// Removes the entry under `cursor` and returns a cursor to the next live
    /// entry (or the end). Erasing at the end is a no-op.
    pub fn erase<'a>(&'a self, mut cursor: ChunkCursor<'a, V>) -> ChunkCursor<'a, V> {
        if !self.owns(&cursor) {
            abort_with(&format!(
                "erase through a cursor of another chunk map (bucket {})",
                cursor.bucket
            ));
        }
        if let Some(guard) = cursor.guard.as_mut() {
            guard.swap_remove(cursor.index);
            self.len.fetch_sub(1, Ordering::Relaxed);
            // The former last entry now sits at `index`, so stay put.
            cursor.settle();
        }
        cursor
    }

    pub fn remove(&self, coord: &ChunkCoord) -> Option<Arc<V>> {
        self.bucket_lock(coord).remove(coord)
    }

    /// Whether `cursor` was produced by this map.
    pub fn owns(&self, cursor: &ChunkCursor<'_, V>) -> bool {
        ptr::eq(cursor.map, self)
    }

    /// Cursor at the first entry, in bucket order.
    pub fn begin(&self) -> ChunkCursor<'_, V> {
        let mut cursor = self.end();
        cursor.seek_from(0);
        cursor
    }

    pub fn end(&self) -> ChunkCursor<'_, V> {
        ChunkCursor {
            map: self,
            bucket: self.buckets.len(),
            index: 0,
            guard: None,
        }
    }

    /// Visits every entry with its bucket locked.
    pub fn for_each(&self, mut f: impl FnMut(ChunkCoord, &Arc<V>)) {
        let mut cursor = self.begin();
        while let Some(entry) = cursor.entry() {
            f(entry.coord, &entry.value);
            cursor.advance();
        }
    }

    pub fn coords(&self) -> Vec<ChunkCoord> {
        let mut coords = Vec::with_capacity(self.len());
        self.for_each(|coord, _| coords.push(coord));
        coords
    }

    /// Longest bucket chain, for sizing diagnostics.
    pub fn max_chain_len(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().len())
            .max()
            .unwrap_or(0)
    }

    /// Deep copy into a new map with the prime bucket count for `capacity`.
    /// Source buckets are copied one at a time and unlocked before the copies
    /// are inserted.
    pub fn copy_with_capacity(&self, capacity: usize) -> Self
    where
        V: Clone,
    {
        let copy = Self::with_capacity(capacity);
        for bucket in self.buckets.iter() {
            let entries: Vec<(ChunkCoord, Arc<V>)> = bucket
                .lock()
                .iter()
                .map(|entry| (entry.coord, Arc::clone(&entry.value)))
                .collect();
            for (coord, value) in entries {
                let cloned = V::clone(&value);
                let _ = copy.insert(coord, cloned);
            }
        }
        copy
    }
}

/// A held bucket lock with map-level helpers scoped to that bucket.
pub struct BucketGuard<'a, V> {
    map: &'a StripedChunkMap<V>,
    bucket: usize,
    guard: LeveledGuard<'a, Bucket<V>>,
}

impl<'a, V> BucketGuard<'a, V> {
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }

    fn position(&self, coord: &ChunkCoord) -> Option<usize> {
        self.guard.iter().position(|entry| entry.coord == *coord)
    }

    pub fn get(&self, coord: &ChunkCoord) -> Option<&Arc<V>> {
        self.position(coord).map(|index| &self.guard[index].value)
    }

    /// Inserts `value` unless `coord` is present. Returns whether it inserted;
    /// a `coord` that hashes to a different bucket is rejected.
    pub fn insert(&mut self, coord: ChunkCoord, value: Arc<V>) -> Result<bool> {
        let expected = self.map.bucket_index(&coord);
        if expected != self.bucket {
            return Err(StoreError::WrongBucket {
                coord,
                expected,
                locked: self.bucket,
            });
        }
        if self.position(&coord).is_some() {
            return Ok(false);
        }
        self.push(coord, value);
        Ok(true)
    }

    pub fn remove(&mut self, coord: &ChunkCoord) -> Option<Arc<V>> {
        let index = self.position(coord)?;
        self.map.len.fetch_sub(1, Ordering::Relaxed);
        Some(self.guard.swap_remove(index).value)
    }

    fn push(&mut self, coord: ChunkCoord, value: Arc<V>) {
        self.guard.push(Entry { coord, value });
        self.map.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Turns the guard into a cursor at `coord`, keeping the lock on a hit.
    pub fn into_cursor(self, coord: &ChunkCoord) -> ChunkCursor<'a, V> {
        match self.position(coord) {
            Some(index) => ChunkCursor {
                map: self.map,
                bucket: self.bucket,
                index,
                guard: Some(self.guard),
            },
            None => self.map.end(),
        }
    }
}

/// Position in a [`StripedChunkMap`]; see the module docs for its locking.
pub struct ChunkCursor<'a, V> {
    map: &'a StripedChunkMap<V>,
    bucket: usize,
    index: usize,
    guard: Option<LeveledGuard<'a, Bucket<V>>>,
}

impl<'a, V> ChunkCursor<'a, V> {
    pub fn is_end(&self) -> bool {
        self.guard.is_none()
    }

    pub fn entry(&self) -> Option<&Entry<V>> {
        self.guard.as_ref().map(|guard| &guard[self.index])
    }

    pub fn coord(&self) -> Option<ChunkCoord> {
        self.entry().map(|entry| entry.coord)
    }

    pub fn value(&self) -> Option<&Arc<V>> {
        self.entry().map(|entry| &entry.value)
    }

    pub fn bucket(&self) -> usize {
        self.bucket
    }

    /// Moves to the next entry, unlocking the current bucket when leaving it.
    pub fn advance(&mut self) {
        if self.guard.is_some() {
            self.index += 1;
            self.settle();
        }
    }

    /// Makes `index` valid, moving on to later buckets if this one is done.
    fn settle(&mut self) {
        let exhausted = match &self.guard {
            Some(guard) => self.index >= guard.len(),
            None => return,
        };
        if exhausted {
            self.guard = None;
            self.seek_from(self.bucket + 1);
        }
    }

    /// Locks buckets from `start` on until one has an entry. Ends unlocked.
    fn seek_from(&mut self, start: usize) {
        debug_assert!(self.guard.is_none());
        for bucket in start..self.map.buckets.len() {
            let guard = self.map.buckets[bucket].lock();
            if !guard.is_empty() {
                self.bucket = bucket;
                self.index = 0;
                self.guard = Some(guard);
                return;
            }
        }
        self.bucket = self.map.buckets.len();
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::block_id::BlockId;
    use glam::UVec3;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Barrier;
    use std::thread;

    fn colliding_coords(map: &StripedChunkMap, count: usize) -> Vec<ChunkCoord> {
        let target = map.bucket_index(&ChunkCoord::new(0, 0, 0));
        (0..)
            .map(|x| ChunkCoord::new(x, 0, 0))
            .filter(|coord| map.bucket_index(coord) == target)
            .take(count)
            .collect()
    }

    fn collect(map: &StripedChunkMap) -> Vec<ChunkCoord> {
        let mut coords = map.coords();
        coords.sort();
        coords
    }

    #[test]
    fn test_bucket_count_is_prime() {
        assert_eq!(StripedChunkMap::<Chunk>::with_capacity(7).bucket_count(), 7);
        assert_eq!(StripedChunkMap::<Chunk>::with_capacity(100).bucket_count(), 101);
        assert_eq!(StripedChunkMap::<Chunk>::with_capacity(0).bucket_count(), 2);
    }

    #[test]
    fn test_create_then_find_returns_same_chunk() {
        let map: StripedChunkMap = StripedChunkMap::with_capacity(31);
        let coord = ChunkCoord::new(1, 2, 3);

        let (cursor, inserted) = map.create(coord);
        assert!(inserted);
        let created = Arc::clone(cursor.value().unwrap());
        drop(cursor);

        let (cursor, inserted) = map.create(coord);
        assert!(!inserted);
        assert!(Arc::ptr_eq(cursor.value().unwrap(), &created));
        drop(cursor);

        let found = map.get(&coord).unwrap();
        assert!(Arc::ptr_eq(&found, &created));
        assert_eq!(found.coord(), coord);
        assert_eq!(map.len(), 1);
        assert!(map.find(&ChunkCoord::new(3, 2, 1)).is_end());
    }

    #[test]
    fn test_cursor_holds_bucket_lock() {
        let map: StripedChunkMap = StripedChunkMap::with_capacity(7);
        let coord = ChunkCoord::new(0, 0, 0);
        let _ = map.create(coord);
        let cursor = map.find(&coord);
        let bucket = cursor.bucket();
        assert!(map.buckets[bucket].is_locked());
        drop(cursor);
        assert!(!map.buckets[bucket].is_locked());
        assert!(map.end().is_end());
    }

    #[test]
    fn test_colliding_coords_in_seven_buckets() {
        let map: StripedChunkMap = StripedChunkMap::with_capacity(7);
        let coords = colliding_coords(&map, 3);
        for coord in &coords {
            assert!(map.create(*coord).1);
        }
        assert_eq!(map.max_chain_len(), 3);
        for coord in &coords {
            assert_eq!(map.get(coord).unwrap().coord(), *coord);
        }

        let middle = coords[1];
        let next = map.erase(map.find(&middle));
        assert!(!next.is_end());
        drop(next);

        assert!(map.find(&middle).is_end());
        let mut remaining = vec![coords[0], coords[2]];
        remaining.sort();
        assert_eq!(collect(&map), remaining);
    }

    #[test]
    fn test_erase_last_entry_moves_to_later_bucket() {
        let map: StripedChunkMap = StripedChunkMap::with_capacity(7);
        let first = (0..)
            .map(|x| ChunkCoord::new(x, 0, 0))
            .find(|coord| map.bucket_index(coord) == 0)
            .unwrap();
        let later = (0..)
            .map(|x| ChunkCoord::new(x, 0, 0))
            .find(|coord| map.bucket_index(coord) > 0)
            .unwrap();
        let _ = map.create(first);
        let _ = map.create(later);

        let next = map.erase(map.find(&first));
        assert_eq!(next.coord(), Some(later));
        drop(next);

        let end = map.erase(map.find(&later));
        assert!(end.is_end());
        let end = map.erase(end);
        assert!(end.is_end());
        assert!(map.is_empty());
    }

    #[test]
    fn test_iteration_visits_each_entry_once() {
        let map: StripedChunkMap = StripedChunkMap::with_capacity(13);
        let mut expected = Vec::new();
        for x in -5..5 {
            for z in -3..3 {
                let coord = ChunkCoord::new(x, 0, z);
                let _ = map.create(coord);
                expected.push(coord);
            }
        }
        expected.sort();

        let mut seen = HashSet::new();
        let mut cursor = map.begin();
        while let Some(coord) = cursor.coord() {
            assert!(seen.insert(coord), "{} visited twice", coord);
            cursor.advance();
        }
        assert_eq!(seen.len(), expected.len());
        assert_eq!(collect(&map), expected);
    }

    #[test]
    fn test_erase_while_iterating() {
        let map: StripedChunkMap = StripedChunkMap::with_capacity(5);
        for x in 0..40 {
            let _ = map.create(ChunkCoord::new(x, 0, 0));
        }

        let mut visited = 0;
        let mut cursor = map.begin();
        while let Some(coord) = cursor.coord() {
            visited += 1;
            if coord.x() % 2 == 0 {
                cursor = map.erase(cursor);
            } else {
                cursor.advance();
            }
        }
        assert_eq!(visited, 40);
        assert_eq!(map.len(), 20);
        assert!(map.coords().iter().all(|coord| coord.x() % 2 == 1));
    }

    #[test]
    fn test_bucket_guard_compound_update() {
        let map: StripedChunkMap = StripedChunkMap::with_capacity(11);
        let coord = ChunkCoord::new(4, 4, 4);
        {
            let mut bucket = map.bucket_lock(&coord);
            assert!(bucket.get(&coord).is_none());
            assert!(bucket.insert(coord, Arc::new(Chunk::new(coord))).unwrap());
            assert!(!bucket.insert(coord, Arc::new(Chunk::new(coord))).unwrap());
            assert_eq!(bucket.len(), 1);
        }
        assert!(map.contains(&coord));
        assert!(map.remove(&coord).is_some());
        assert!(map.remove(&coord).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_bucket_guard_rejects_coord_of_other_bucket() {
        let map: StripedChunkMap<u32> = StripedChunkMap::with_capacity(7);
        let home = ChunkCoord::new(0, 0, 0);
        let stranger = (1..)
            .map(|x| ChunkCoord::new(x, 0, 0))
            .find(|coord| map.bucket_index(coord) != map.bucket_index(&home))
            .unwrap();

        let result = map.bucket_lock(&home).insert(stranger, Arc::new(1));
        assert!(matches!(result, Err(StoreError::WrongBucket { coord, .. }) if coord == stranger));
        assert!(map.is_empty());

        let (cursor, inserted) = map.create_with(stranger, |_| 2);
        assert!(inserted);
        drop(cursor);
        assert_eq!(map.len(), 1);
        assert_eq!(map.coords(), vec![stranger]);
    }

    #[test]
    fn test_map_only_owns_its_own_cursors() {
        let map: StripedChunkMap<u32> = StripedChunkMap::with_capacity(7);
        let other: StripedChunkMap<u32> = StripedChunkMap::with_capacity(7);
        let coord = ChunkCoord::new(1, 1, 1);
        let _ = map.create_with(coord, |_| 0);
        let cursor = map.find(&coord);
        assert!(map.owns(&cursor));
        assert!(!other.owns(&cursor));
        assert!(!map.owns(&other.end()));
        let next = map.erase(cursor);
        assert!(map.owns(&next));
    }

    #[test]
    fn test_copy_with_capacity_rehashes_deeply() {
        let map: StripedChunkMap = StripedChunkMap::with_capacity(7);
        for x in 0..20 {
            let (cursor, _) = map.create(ChunkCoord::new(x, 1, 0));
            cursor
                .value()
                .unwrap()
                .set_block(UVec3::new(0, 0, 0), BlockId(x as u16 + 1));
        }

        let copy = map.copy_with_capacity(50);
        assert_eq!(copy.bucket_count(), 53);
        assert_eq!(copy.len(), 20);
        assert_eq!(collect(&copy), collect(&map));

        let coord = ChunkCoord::new(3, 1, 0);
        let original = map.get(&coord).unwrap();
        let copied = copy.get(&coord).unwrap();
        assert!(!Arc::ptr_eq(&original, &copied));
        assert_eq!(copied.get_block(UVec3::ZERO), Some(BlockId(4)));
        original.set_block(UVec3::ZERO, BlockId(99));
        assert_eq!(copied.get_block(UVec3::ZERO), Some(BlockId(4)));
    }

    #[test]
    fn test_random_ops_match_model() {
        let map: StripedChunkMap<u32> = StripedChunkMap::with_capacity(17);
        let mut model = BTreeMap::new();
        let mut rng = ChaCha12Rng::seed_from_u64(0x5eed);

        for step in 0..5_000u32 {
            let coord = ChunkCoord::new(rng.gen_range(-8..8), rng.gen_range(-2..2), 0);
            match rng.gen_range(0..3) {
                0 => {
                    let (cursor, inserted) = map.create_with(coord, |_| step);
                    assert_eq!(inserted, !model.contains_key(&coord));
                    let value = **cursor.value().unwrap();
                    assert_eq!(value, *model.entry(coord).or_insert(step));
                }
                1 => {
                    let removed = map.remove(&coord).map(|value| *value);
                    assert_eq!(removed, model.remove(&coord));
                }
                _ => {
                    let found = map.get(&coord).map(|value| *value);
                    assert_eq!(found, model.get(&coord).copied());
                }
            }
            assert_eq!(map.len(), model.len());
        }
        assert_eq!(collect_u32(&map), model.keys().copied().collect::<Vec<_>>());
    }

    fn collect_u32(map: &StripedChunkMap<u32>) -> Vec<ChunkCoord> {
        let mut coords = map.coords();
        coords.sort();
        coords
    }

    #[test]
    fn test_concurrent_create_find_and_iterate() {
        const THREADS: i32 = 4;
        const PER_THREAD: i32 = 200;

        let map: StripedChunkMap = StripedChunkMap::with_capacity(61);
        let barrier = Barrier::new(THREADS as usize + 1);

        thread::scope(|s| {
            for t in 0..THREADS {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..PER_THREAD {
                        let coord = ChunkCoord::new(t, i, 0);
                        let (cursor, inserted) = map.create(coord);
                        assert!(inserted);
                        let created = Arc::clone(cursor.value().unwrap());
                        drop(cursor);
                        let found = map.get(&coord).unwrap();
                        assert!(Arc::ptr_eq(&created, &found));
                        if i % 3 == 0 {
                            assert!(map.remove(&coord).is_some());
                            assert!(map.find(&coord).is_end());
                        }
                    }
                });
            }

            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let mut seen = HashSet::new();
                    map.for_each(|coord, chunk| {
                        assert_eq!(chunk.coord(), coord);
                        assert!(seen.insert(coord), "{} seen twice in one pass", coord);
                    });
                }
            });
        });

        let removed_per_thread = (0..PER_THREAD).filter(|i| i % 3 == 0).count();
        assert_eq!(
            map.len(),
            (THREADS as usize) * (PER_THREAD as usize - removed_per_thread)
        );
    }
}

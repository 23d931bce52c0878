use glam::UVec3;
use serde::{Deserialize, Serialize};
use std::cell::Cell;

use crate::sync::{LeveledGuard, LeveledLock, LockLevel, RecursiveLeveledLock};
use crate::utils::error::{Result, StoreError};
use crate::world::block_id::BlockId;
use crate::world::chunk_coord::ChunkCoord;
use crate::world::whole_chunk_lock::{AcquireStats, WholeChunkLock};

pub const CHUNK_SIZE: u32 = 32;
pub const CHUNK_VOLUME: usize = (CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE) as usize;
pub const SUBCHUNK_SIZE: u32 = 16;
pub const SUBCHUNK_VOLUME: usize = (SUBCHUNK_SIZE * SUBCHUNK_SIZE * SUBCHUNK_SIZE) as usize;
pub const SUBCHUNKS_PER_AXIS: u32 = CHUNK_SIZE / SUBCHUNK_SIZE;
pub const SUBCHUNK_COUNT: usize = (SUBCHUNKS_PER_AXIS * SUBCHUNKS_PER_AXIS * SUBCHUNKS_PER_AXIS) as usize;

/// How far a chunk has come through the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChunkStage {
    #[default]
    Empty,
    Generating,
    Generated,
    Meshed,
}

/// A block change queued for the simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingUpdate {
    pub index: u16,
    pub block: BlockId,
}

/// Everything a subchunk lock protects.
#[derive(Debug, Clone)]
pub struct SubchunkData {
    blocks: Box<[BlockId]>,
    non_air: u32,
    dirty: bool,
    pending: Vec<PendingUpdate>,
}

impl SubchunkData {
    fn new() -> Self {
        Self {
            blocks: vec![BlockId::AIR; SUBCHUNK_VOLUME].into_boxed_slice(),
            non_air: 0,
            dirty: false,
            pending: Vec::new(),
        }
    }

    pub fn get(&self, index: usize) -> BlockId {
        self.blocks[index]
    }

    /// Returns the block previously at `index`.
    pub fn set(&mut self, index: usize, block: BlockId) -> BlockId {
        let previous = std::mem::replace(&mut self.blocks[index], block);
        if previous != block {
            match (previous.is_air(), block.is_air()) {
                (true, false) => self.non_air += 1,
                (false, true) => self.non_air -= 1,
                _ => {}
            }
            self.dirty = true;
        }
        previous
    }

    pub fn fill(&mut self, block: BlockId) {
        self.blocks.fill(block);
        self.non_air = if block.is_air() { 0 } else { SUBCHUNK_VOLUME as u32 };
        self.dirty = true;
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn non_air_count(&self) -> u32 {
        self.non_air
    }

    pub fn is_empty(&self) -> bool {
        self.non_air == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears the dirty flag, returning whether it was set.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn queue_update(&mut self, update: PendingUpdate) {
        self.pending.push(update);
    }

    pub fn pending_updates(&self) -> &[PendingUpdate] {
        &self.pending
    }

    /// Applies and clears the queued updates. Returns how many changed a block.
    pub fn apply_pending(&mut self) -> usize {
        let mut changed = 0;
        for update in std::mem::take(&mut self.pending) {
            if self.set(update.index as usize, update.block) != update.block {
                changed += 1;
            }
        }
        changed
    }
}

pub struct Subchunk {
    index: usize,
    lock: LeveledLock<SubchunkData>,
}

impl Subchunk {
    fn new(index: usize) -> Self {
        Self {
            index,
            lock: LeveledLock::new(LockLevel::SUBCHUNK, SubchunkData::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn lock(&self) -> LeveledGuard<'_, SubchunkData> {
        self.lock.lock()
    }

    pub fn try_lock(&self) -> Option<LeveledGuard<'_, SubchunkData>> {
        self.lock.try_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub(crate) fn raw_lock(&self) -> &LeveledLock<SubchunkData> {
        &self.lock
    }
}

/// A chunk is split into subchunks that lock independently. Block data only
/// lives inside the subchunks; the chunk itself holds the immutable coordinate
/// and the stage behind a recursive lock.
pub struct Chunk {
    coord: ChunkCoord,
    stage: RecursiveLeveledLock<Cell<ChunkStage>>,
    subchunks: Box<[Subchunk]>,
}

/// Splits a chunk-local position into (subchunk index, index inside it).
pub fn split_local(local: UVec3) -> Option<(usize, usize)> {
    if local.x >= CHUNK_SIZE || local.y >= CHUNK_SIZE || local.z >= CHUNK_SIZE {
        return None;
    }
    let sub = local / SUBCHUNK_SIZE;
    let inner = local % SUBCHUNK_SIZE;
    let subchunk = sub.x + sub.y * SUBCHUNKS_PER_AXIS + sub.z * SUBCHUNKS_PER_AXIS * SUBCHUNKS_PER_AXIS;
    let index = inner.x + inner.y * SUBCHUNK_SIZE + inner.z * SUBCHUNK_SIZE * SUBCHUNK_SIZE;
    Some((subchunk as usize, index as usize))
}

fn chunk_index(local: UVec3) -> usize {
    (local.x + local.y * CHUNK_SIZE + local.z * CHUNK_SIZE * CHUNK_SIZE) as usize
}

fn chunk_positions() -> impl Iterator<Item = UVec3> {
    (0..CHUNK_SIZE).flat_map(|z| {
        (0..CHUNK_SIZE).flat_map(move |y| (0..CHUNK_SIZE).map(move |x| UVec3::new(x, y, z)))
    })
}

impl Chunk {
    pub fn new(coord: ChunkCoord) -> Self {
        Self {
            coord,
            stage: RecursiveLeveledLock::new(LockLevel::CHUNK_META, Cell::new(ChunkStage::Empty)),
            subchunks: (0..SUBCHUNK_COUNT).map(Subchunk::new).collect(),
        }
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn subchunks(&self) -> &[Subchunk] {
        &self.subchunks
    }

    pub fn subchunk(&self, index: usize) -> &Subchunk {
        &self.subchunks[index]
    }

    pub fn get_block(&self, local: UVec3) -> Option<BlockId> {
        let (subchunk, index) = split_local(local)?;
        Some(self.subchunks[subchunk].lock().get(index))
    }

    /// Returns the previous block, or `None` if `local` is outside the chunk.
    pub fn set_block(&self, local: UVec3, block: BlockId) -> Option<BlockId> {
        let (subchunk, index) = split_local(local)?;
        Some(self.subchunks[subchunk].lock().set(index, block))
    }

    /// Queues a change for the owning subchunk's next update pass.
    pub fn schedule_update(&self, local: UVec3, block: BlockId) -> bool {
        match split_local(local) {
            Some((subchunk, index)) => {
                self.subchunks[subchunk].lock().queue_update(PendingUpdate {
                    index: index as u16,
                    block,
                });
                true
            }
            None => false,
        }
    }

    /// Applies every subchunk's pending updates, one subchunk at a time.
    pub fn apply_pending_updates(&self) -> usize {
        self.subchunks
            .iter()
            .map(|subchunk| subchunk.lock().apply_pending())
            .sum()
    }

    pub fn stage(&self) -> ChunkStage {
        self.stage.lock().get()
    }

    pub fn set_stage(&self, stage: ChunkStage) {
        self.stage.lock().set(stage);
    }

    /// Moves from `from` to `to` if the chunk is still at `from`.
    pub fn advance_stage(&self, from: ChunkStage, to: ChunkStage) -> bool {
        let _held = self.stage.lock();
        if self.stage() != from {
            return false;
        }
        self.set_stage(to);
        true
    }

    /// Locks every subchunk at once.
    pub fn lock_all(&self) -> WholeChunkLock<'_> {
        WholeChunkLock::new(self)
    }

    pub fn fill(&self, block: BlockId) {
        let mut all = self.lock_all();
        for data in all.iter_mut() {
            data.fill(block);
        }
    }

    pub fn non_air_count(&self) -> u32 {
        self.lock_all().iter().map(|data| data.non_air_count()).sum()
    }

    /// Consistent copy of the whole chunk.
    pub fn snapshot(&self) -> SerializedChunk {
        self.snapshot_with_stats().0
    }

    /// Like [`snapshot`](Self::snapshot), also reporting how contended the
    /// whole-chunk acquisition behind the copy was.
    pub fn snapshot_with_stats(&self) -> (SerializedChunk, AcquireStats) {
        let stage = self.stage.lock();
        let all = self.lock_all();
        let mut blocks = vec![BlockId::AIR; CHUNK_VOLUME];
        for local in chunk_positions() {
            if let Some((subchunk, index)) = split_local(local) {
                blocks[chunk_index(local)] = all.subchunk(subchunk).get(index);
            }
        }
        let snapshot = SerializedChunk {
            coord: self.coord,
            stage: stage.get(),
            blocks,
        };
        (snapshot, all.stats())
    }

    pub fn from_serialized(serialized: SerializedChunk) -> Result<Self> {
        if serialized.blocks.len() != CHUNK_VOLUME {
            return Err(StoreError::InvalidChunkData(format!(
                "chunk {} has {} blocks, expected {}",
                serialized.coord,
                serialized.blocks.len(),
                CHUNK_VOLUME
            )));
        }
        Ok(Self::from_blocks(serialized.coord, serialized.stage, &serialized.blocks))
    }

    fn from_blocks(coord: ChunkCoord, stage: ChunkStage, blocks: &[BlockId]) -> Self {
        let mut chunk = Self::new(coord);
        chunk.stage = RecursiveLeveledLock::new(LockLevel::CHUNK_META, Cell::new(stage));
        // Not shared yet, so no locking needed.
        for local in chunk_positions() {
            if let Some((subchunk, index)) = split_local(local) {
                let data = chunk.subchunks[subchunk].lock.get_mut();
                data.set(index, blocks[chunk_index(local)]);
            }
        }
        for subchunk in chunk.subchunks.iter_mut() {
            subchunk.lock.get_mut().take_dirty();
        }
        chunk
    }
}

impl From<ChunkCoord> for Chunk {
    fn from(coord: ChunkCoord) -> Self {
        Self::new(coord)
    }
}

impl Clone for Chunk {
    fn clone(&self) -> Self {
        let snapshot = self.snapshot();
        Self::from_blocks(snapshot.coord, snapshot.stage, &snapshot.blocks)
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("coord", &self.coord)
            .field("subchunks", &self.subchunks.len())
            .finish()
    }
}

/// Flat copy of a chunk, blocks in x-major order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedChunk {
    pub coord: ChunkCoord,
    pub stage: ChunkStage,
    pub blocks: Vec<BlockId>,
}

impl SerializedChunk {
    pub fn get(&self, local: UVec3) -> Option<BlockId> {
        split_local(local)?;
        self.blocks.get(chunk_index(local)).copied()
    }
}

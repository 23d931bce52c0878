pub mod block_id;
pub mod chunk;
pub mod chunk_coord;
pub mod chunk_map;
pub mod whole_chunk_lock;

// Re-export commonly used types
pub use block_id::BlockId;
pub use chunk::{Chunk, ChunkStage, SerializedChunk, Subchunk, SubchunkData, CHUNK_SIZE, SUBCHUNK_COUNT};
pub use chunk_coord::{ChunkCoord, DimensionId};
pub use chunk_map::{BucketGuard, ChunkCursor, StripedChunkMap};
pub use whole_chunk_lock::{acquire_all, AcquireStats, LockSet, SubchunksMut, WholeChunkLock};

pub mod config;
pub mod sync;
pub mod utils;
pub mod world;

// Re-export commonly used types
pub use config::chunksys::ChunkSysConfig;
pub use sync::{FastCondvar, FastMutex, LeveledLock, LockLevel, RecursiveLeveledLock};
pub use utils::error::{Result, StoreError};
pub use world::chunk::{Chunk, SerializedChunk};
pub use world::chunk_coord::ChunkCoord;
pub use world::chunk_map::StripedChunkMap;
pub use world::whole_chunk_lock::WholeChunkLock;

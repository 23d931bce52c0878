use std::io;
use thiserror::Error;

use crate::world::chunk_coord::ChunkCoord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Lock hierarchy mode was already set")]
    HierarchyModeAlreadySet,

    #[error("Invalid chunk data: {0}")]
    InvalidChunkData(String),

    #[error("Chunk {coord} hashes to bucket {expected}, not the locked bucket {locked}")]
    WrongBucket {
        coord: ChunkCoord,
        expected: usize,
        locked: usize,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

use glam::IVec3;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// Which world a chunk belongs to (overworld, nether, ...).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DimensionId(pub u16);

impl DimensionId {
    pub const OVERWORLD: Self = Self(0);
}

/// Position key of a chunk, in chunk units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkCoord {
    pub pos: IVec3,
    pub dimension: DimensionId,
}

impl Serialize for ChunkCoord {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (self.pos.x, self.pos.y, self.pos.z, self.dimension.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChunkCoord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (x, y, z, dimension) = <(i32, i32, i32, u16)>::deserialize(deserializer)?;
        Ok(ChunkCoord::in_dimension(x, y, z, DimensionId(dimension)))
    }
}

impl PartialOrd for ChunkCoord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkCoord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pos
            .x
            .cmp(&other.pos.x)
            .then(self.pos.y.cmp(&other.pos.y))
            .then(self.pos.z.cmp(&other.pos.z))
            .then(self.dimension.cmp(&other.dimension))
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})@{}",
            self.pos.x, self.pos.y, self.pos.z, self.dimension.0
        )
    }
}

// Multiplier of the bucket hash polynomial.
const HASH_PRIME: u64 = 0x0000_0100_0000_01b3;

impl ChunkCoord {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self::in_dimension(x, y, z, DimensionId::OVERWORLD)
    }

    pub fn in_dimension(x: i32, y: i32, z: i32, dimension: DimensionId) -> Self {
        Self {
            pos: IVec3::new(x, y, z),
            dimension,
        }
    }

    pub fn x(&self) -> i32 {
        self.pos.x
    }

    pub fn y(&self) -> i32 {
        self.pos.y
    }

    pub fn z(&self) -> i32 {
        self.pos.z
    }

    /// Fixed polynomial hash used to pick a map bucket. Stable across runs and
    /// platforms, unlike `std::hash`.
    pub fn bucket_hash(&self) -> u64 {
        let mut hash = self.dimension.0 as u64;
        for component in [self.pos.x, self.pos.y, self.pos.z] {
            hash = hash.wrapping_mul(HASH_PRIME).wrapping_add(component as u32 as u64);
        }
        hash ^ (hash >> 29)
    }
}

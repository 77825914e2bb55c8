use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// Edge length of a chunk, in nodes. One node is one world unit.
pub const CHUNK_SIZE: i32 = 16;

/// Hard world limit in nodes along every axis (inclusive, both signs).
pub const MAX_WORLD_LIMIT: i32 = 31007;

/// Edge length of a coarse "far" cell, in chunks.
pub const FAR_CHUNK_FACTOR: i32 = 4;

/// Handle of a live active object. Zero is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u16);

impl ObjectId {
    /// The reserved "no object" id.
    pub const NONE: Self = Self(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Network peer that owns an observer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u16);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer{}", self.0)
    }
}

/// Integer node position containing a world-space point.
pub fn node_containing(pos: Vec3) -> IVec3 {
    pos.floor().as_ivec3()
}

/// A 3D chunk coordinate in the world grid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const ORIGIN: Self = Self { x: 0, y: 0, z: 0 };

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chunk containing the given node.
    pub fn from_node(node: IVec3) -> Self {
        Self {
            x: node.x.div_euclid(CHUNK_SIZE),
            y: node.y.div_euclid(CHUNK_SIZE),
            z: node.z.div_euclid(CHUNK_SIZE),
        }
    }

    /// Chunk containing a world-space point.
    pub fn containing(pos: Vec3) -> Self {
        Self::from_node(node_containing(pos))
    }

    pub fn as_ivec3(self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }

    /// Lowest-corner node of this chunk.
    pub fn node_origin(self) -> IVec3 {
        self.as_ivec3() * CHUNK_SIZE
    }

    /// World-space centre of this chunk.
    pub fn center(self) -> Vec3 {
        self.node_origin().as_vec3() + Vec3::splat(CHUNK_SIZE as f32 / 2.0)
    }

    /// Chebyshev (ring) distance between two chunks.
    pub fn ring_distance(self, other: Self) -> i32 {
        let d = (self.as_ivec3() - other.as_ivec3()).abs();
        d.x.max(d.y).max(d.z)
    }

    /// Whether any node of this chunk lies beyond [`MAX_WORLD_LIMIT`].
    pub fn is_over_limit(self) -> bool {
        let lo = self.node_origin();
        let hi = lo + IVec3::splat(CHUNK_SIZE - 1);
        lo.min_element() < -MAX_WORLD_LIMIT || hi.max_element() > MAX_WORLD_LIMIT
    }

    /// Coarse far cell containing this chunk.
    pub fn far_cell(self) -> Self {
        Self {
            x: self.x.div_euclid(FAR_CHUNK_FACTOR),
            y: self.y.div_euclid(FAR_CHUNK_FACTOR),
            z: self.z.div_euclid(FAR_CHUNK_FACTOR),
        }
    }
}

impl Add<IVec3> for ChunkPos {
    type Output = Self;

    fn add(self, rhs: IVec3) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl From<IVec3> for ChunkPos {
    fn from(v: IVec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

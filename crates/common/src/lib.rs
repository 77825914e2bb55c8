//! Shared types for the voxstream workspace: chunk and object addressing,
//! world limits and coordinate conversion.

mod types;

pub use types::{
    CHUNK_SIZE, ChunkPos, FAR_CHUNK_FACTOR, MAX_WORLD_LIMIT, ObjectId, PeerId, node_containing,
};

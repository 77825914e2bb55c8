//! World kernel: authoritative active objects, in-memory terrain chunks and
//! simulation stepping.
//!
//! # Invariants
//! - Every live active object is tracked by the point index at its current
//!   position; positions only change through [`ActiveObjectDirectory`].
//! - All state mutations flow through explicit operations and are logged.

pub mod map;
pub mod objects;
pub mod provider;
pub mod world;

pub use map::{Chunk, ChunkMap, ChunkStatus};
pub use objects::{ActiveObject, ActiveObjectDirectory, DirectoryError, ObjectEvent, ObjectKind};
pub use provider::{ChunkProvider, FlatTerrain};
pub use world::{World, WorldEvent};

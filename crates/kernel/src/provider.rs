use std::collections::HashMap;
use std::sync::Mutex;

use voxstream_common::ChunkPos;

use crate::map::Chunk;

/// Source of chunks for the asynchronous load/generate workers.
///
/// Called from worker threads; implementations must not touch the live
/// [`crate::ChunkMap`].
pub trait ChunkProvider: Send + Sync {
    /// Read a chunk back from storage. `None` if it was never stored.
    fn load(&self, pos: ChunkPos) -> Option<Chunk>;

    /// Run terrain generation for a chunk and store the result.
    fn generate(&self, pos: ChunkPos) -> Chunk;
}

/// Flat reference terrain: solid below `ground_level`, a visible surface
/// layer at it, open sky above. Generated chunks are kept so later loads find
/// them "on disk".
#[derive(Debug, Default)]
pub struct FlatTerrain {
    ground_level: i32,
    stored: Mutex<HashMap<ChunkPos, Chunk>>,
}

impl FlatTerrain {
    /// Terrain whose surface layer is the chunk row `y = ground_level`.
    pub fn new(ground_level: i32) -> Self {
        Self {
            ground_level,
            stored: Mutex::new(HashMap::new()),
        }
    }

    pub fn ground_level(&self) -> i32 {
        self.ground_level
    }

    /// What generation produces at `pos`.
    pub fn chunk_at(&self, pos: ChunkPos) -> Chunk {
        match pos.y.cmp(&self.ground_level) {
            std::cmp::Ordering::Less => Chunk::generated(true, false),
            std::cmp::Ordering::Equal => Chunk::generated(false, false),
            std::cmp::Ordering::Greater => Chunk::generated(false, true),
        }
    }

    /// Number of chunks written to storage so far.
    pub fn stored_count(&self) -> usize {
        self.stored.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl ChunkProvider for FlatTerrain {
    fn load(&self, pos: ChunkPos) -> Option<Chunk> {
        self.stored.lock().ok()?.get(&pos).copied()
    }

    fn generate(&self, pos: ChunkPos) -> Chunk {
        let chunk = self.chunk_at(pos);
        if let Ok(mut stored) = self.stored.lock() {
            stored.insert(pos, chunk);
        }
        chunk
    }
}

use std::collections::HashMap;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use voxstream_common::{CHUNK_SIZE, ChunkPos};

/// Summary of one in-memory terrain chunk, as far as streaming cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Terrain generation has run for this chunk.
    pub generated: bool,
    /// Placeholder for a chunk known to be absent from storage.
    pub dummy: bool,
    /// Fully solid; blocks line of sight.
    pub opaque: bool,
    /// Nothing but open sky; not worth sending from far away.
    pub sky_only: bool,
}

impl Chunk {
    /// A generated chunk with the given contents.
    pub fn generated(opaque: bool, sky_only: bool) -> Self {
        Self {
            generated: true,
            dummy: false,
            opaque,
            sky_only,
        }
    }

    /// Stored, but generation has not run yet.
    pub fn ungenerated() -> Self {
        Self {
            generated: false,
            dummy: false,
            opaque: false,
            sky_only: false,
        }
    }

    /// Known to be absent from storage and not generated.
    pub fn dummy() -> Self {
        Self {
            dummy: true,
            ..Self::ungenerated()
        }
    }
}

/// How usable a chunk position currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Not in memory; storage has not been consulted.
    Missing,
    /// In memory but not generated (possibly a dummy).
    NotGenerated,
    /// Generated and ready to send.
    Loaded,
}

/// In-memory terrain chunks keyed by position.
#[derive(Debug, Clone, Default)]
pub struct ChunkMap {
    chunks: HashMap<ChunkPos, Chunk>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, pos: ChunkPos) -> Option<&Chunk> {
        self.chunks.get(&pos)
    }

    pub fn insert(&mut self, pos: ChunkPos, chunk: Chunk) -> Option<Chunk> {
        self.chunks.insert(pos, chunk)
    }

    /// Drop a chunk from memory.
    pub fn unload(&mut self, pos: ChunkPos) -> Option<Chunk> {
        self.chunks.remove(&pos)
    }

    pub fn status(&self, pos: ChunkPos) -> ChunkStatus {
        match self.chunks.get(&pos) {
            None => ChunkStatus::Missing,
            Some(chunk) if !chunk.generated => ChunkStatus::NotGenerated,
            Some(_) => ChunkStatus::Loaded,
        }
    }

    /// Fill every chunk in the inclusive box with generated contents.
    pub fn fill(&mut self, min: ChunkPos, max: ChunkPos, chunk: Chunk) {
        for x in min.x..=max.x {
            for y in min.y..=max.y {
                for z in min.z..=max.z {
                    self.chunks.insert(ChunkPos::new(x, y, z), chunk);
                }
            }
        }
    }

    /// Approximate line-of-sight test from `eye` to the chunk at `target`.
    ///
    /// Casts rays to the chunk centre and to its eight (slightly inset)
    /// corners, sampling every half chunk. A ray is blocked by a loaded opaque
    /// chunk strictly between the eye's chunk and the target. The target is
    /// occluded only if every ray is blocked. Chunks next to the eye are
    /// never occluded.
    pub fn is_occluded(&self, target: ChunkPos, eye: Vec3) -> bool {
        let eye_chunk = ChunkPos::containing(eye);
        if eye_chunk.ring_distance(target) <= 1 {
            return false;
        }
        let inset = 0.5;
        let lo = target.node_origin().as_vec3() + Vec3::splat(inset);
        let hi = target.node_origin().as_vec3() + Vec3::splat(CHUNK_SIZE as f32 - inset);
        let corners = (0..8).map(|i| {
            Vec3::new(
                if i & 1 == 0 { lo.x } else { hi.x },
                if i & 2 == 0 { lo.y } else { hi.y },
                if i & 4 == 0 { lo.z } else { hi.z },
            )
        });
        std::iter::once(target.center())
            .chain(corners)
            .all(|end| self.ray_blocked(eye, end, eye_chunk, target))
    }

    fn ray_blocked(&self, from: Vec3, to: Vec3, eye_chunk: ChunkPos, target: ChunkPos) -> bool {
        let delta = to - from;
        let length = delta.length();
        let step = CHUNK_SIZE as f32 / 2.0;
        if length <= step {
            return false;
        }
        let dir = delta / length;
        let samples = (length / step) as usize;
        for i in 1..=samples {
            let here = ChunkPos::containing(from + dir * (step * i as f32));
            if here == target {
                return false;
            }
            if here == eye_chunk {
                continue;
            }
            if self.chunks.get(&here).is_some_and(|c| c.opaque) {
                return true;
            }
        }
        false
    }
}

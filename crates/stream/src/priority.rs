use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};
use voxstream_common::{CHUNK_SIZE, ChunkPos, FAR_CHUNK_FACTOR};

/// Granularity of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SuggestionKind {
    /// A full-detail chunk.
    Chunk,
    /// A coarse cell covering `FAR_CHUNK_FACTOR³` chunks.
    FarChunk,
}

/// Something an observer wants sent: a chunk, or a far cell in far-cell
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WantedSend {
    pub kind: SuggestionKind,
    pub pos: ChunkPos,
}

impl WantedSend {
    pub fn chunk(pos: ChunkPos) -> Self {
        Self {
            kind: SuggestionKind::Chunk,
            pos,
        }
    }

    pub fn far(cell: ChunkPos) -> Self {
        Self {
            kind: SuggestionKind::FarChunk,
            pos: cell,
        }
    }

    /// World-space centre of the covered volume.
    pub fn center(&self) -> Vec3 {
        match self.kind {
            SuggestionKind::Chunk => self.pos.center(),
            SuggestionKind::FarChunk => far_cell_center(self.pos),
        }
    }
}

impl std::fmt::Display for WantedSend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            SuggestionKind::Chunk => write!(f, "chunk {}", self.pos),
            SuggestionKind::FarChunk => write!(f, "far {}", self.pos),
        }
    }
}

/// What the scheduler hands to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkSendRequest {
    pub wanted: WantedSend,
    /// Lower is more urgent.
    pub priority: f32,
}

/// World-space centre of a far cell.
pub fn far_cell_center(cell: ChunkPos) -> Vec3 {
    let extent = FAR_CHUNK_FACTOR * CHUNK_SIZE;
    (cell.as_ivec3() * extent).as_vec3() + Vec3::splat(extent as f32 / 2.0)
}

/// Ranks suggestions relative to the observer's node position.
#[derive(Debug, Clone, Copy)]
pub struct SendPriority {
    observer: IVec3,
    far_weight: f32,
}

impl SendPriority {
    pub fn new(observer: IVec3, far_weight: f32) -> Self {
        Self {
            observer,
            far_weight,
        }
    }

    /// Distance in nodes; far cells are scaled by the far weight.
    pub fn cost(&self, wanted: &WantedSend) -> f32 {
        let distance = wanted.center().distance(self.observer.as_vec3());
        match wanted.kind {
            SuggestionKind::Chunk => distance,
            SuggestionKind::FarChunk => distance * self.far_weight,
        }
    }

    /// The cheapest candidate, ties going to the earlier one.
    pub fn best(&self, candidates: impl IntoIterator<Item = WantedSend>) -> Option<ChunkSendRequest> {
        candidates
            .into_iter()
            .map(|wanted| ChunkSendRequest {
                wanted,
                priority: self.cost(&wanted),
            })
            .fold(None, |best: Option<ChunkSendRequest>, next| match best {
                Some(b) if b.priority <= next.priority => Some(b),
                _ => Some(next),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closer_wins() {
        let prio = SendPriority::new(IVec3::ZERO, 3.0);
        let near = WantedSend::chunk(ChunkPos::new(0, 0, 1));
        let far = WantedSend::chunk(ChunkPos::new(0, 0, 4));
        let best = prio.best([far, near]).unwrap();
        assert_eq!(best.wanted, near);
    }

    #[test]
    fn far_cells_are_handicapped() {
        let prio = SendPriority::new(IVec3::ZERO, 3.0);
        let coarse = WantedSend::far(ChunkPos::new(0, 0, 0));
        assert_eq!(coarse.center(), Vec3::splat(32.0));

        // ~57 nodes away beats ~55 nodes away once the handicap applies.
        let fine = WantedSend::chunk(ChunkPos::new(3, 0, 0));
        assert_eq!(prio.best([coarse, fine]).unwrap().wanted, fine);

        // A fine chunk far enough out still loses.
        let distant = WantedSend::chunk(ChunkPos::new(20, 0, 0));
        assert_eq!(prio.best([distant, coarse]).unwrap().wanted, coarse);
    }

    #[test]
    fn empty_has_no_best() {
        let prio = SendPriority::new(IVec3::ZERO, 1.0);
        assert!(prio.best(std::iter::empty()).is_none());
    }
}

use serde::{Deserialize, Serialize};
use voxstream_common::ChunkPos;

use crate::map::ChunkMap;
use crate::objects::{ActiveObject, ActiveObjectDirectory, DirectoryError};
use voxstream_common::ObjectId;

/// A world-level change streaming has to react to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorldEvent {
    /// A loaded chunk's contents changed; observers holding it are stale.
    ChunkModified { pos: ChunkPos },
    /// Simulation advanced one tick.
    Stepped { tick: u64 },
}

/// The authoritative world state.
///
/// Owns the active objects and the in-memory terrain. The simulation tick
/// and every mutation run on one thread; streaming reads this state between
/// ticks.
#[derive(Debug, Default)]
pub struct World {
    objects: ActiveObjectDirectory,
    map: ChunkMap,
    tick: u64,
    /// Simulated seconds since creation.
    time: f64,
    events: Vec<WorldEvent>,
}

impl World {
    /// Create an empty world at tick 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a world around an existing set of chunks.
    pub fn with_map(map: ChunkMap) -> Self {
        Self {
            map,
            ..Self::default()
        }
    }

    /// Current simulation tick.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Simulated seconds since creation.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn objects(&self) -> &ActiveObjectDirectory {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ActiveObjectDirectory {
        &mut self.objects
    }

    pub fn map(&self) -> &ChunkMap {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut ChunkMap {
        &mut self.map
    }

    /// Register a new active object.
    pub fn spawn(&mut self, object: ActiveObject) -> Result<ObjectId, DirectoryError> {
        self.objects.add(object)
    }

    /// Record an edit inside a loaded chunk. Returns `false` if the chunk is
    /// not in memory.
    pub fn edit_chunk(&mut self, pos: ChunkPos) -> bool {
        if self.map.get(pos).is_none() {
            return false;
        }
        self.events.push(WorldEvent::ChunkModified { pos });
        tracing::debug!(%pos, "chunk modified");
        true
    }

    /// Drain and return the event log.
    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.events)
    }

    /// Read-only access to the event log.
    pub fn events(&self) -> &[WorldEvent] {
        &self.events
    }

    /// Advance the simulation by `dtime` seconds.
    pub fn step(&mut self, dtime: f32) {
        self.tick += 1;
        self.time += f64::from(dtime);
        self.objects.step(dtime);
        self.events.push(WorldEvent::Stepped { tick: self.tick });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Chunk;
    use glam::Vec3;

    #[test]
    fn world_starts_empty() {
        let w = World::new();
        assert_eq!(w.tick(), 0);
        assert!(w.objects().is_empty());
        assert!(w.map().is_empty());
    }

    #[test]
    fn step_moves_objects_and_counts_ticks() {
        let mut w = World::new();
        let id = w
            .spawn(ActiveObject::entity(Vec3::ZERO).with_velocity(Vec3::new(0.0, 0.0, 4.0)))
            .unwrap();
        w.step(0.25);
        w.step(0.25);
        assert_eq!(w.tick(), 2);
        assert_eq!(w.objects().get(id).unwrap().position(), Vec3::new(0.0, 0.0, 2.0));
        assert!((w.time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn edits_need_a_loaded_chunk() {
        let mut w = World::new();
        let p = ChunkPos::new(0, 1, 0);
        assert!(!w.edit_chunk(p));
        w.map_mut().insert(p, Chunk::generated(false, false));
        assert!(w.edit_chunk(p));
        assert_eq!(w.drain_events(), vec![WorldEvent::ChunkModified { pos: p }]);
        assert!(w.events().is_empty());
    }
}

use std::collections::{BTreeMap, BTreeSet};

use glam::Vec3;
use serde::{Deserialize, Serialize};
use voxstream_common::{ObjectId, PeerId};
use voxstream_index::PointIndex;

/// Errors from active object registration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DirectoryError {
    #[error("no free active object id left")]
    Full,
    #[error("active object id {0} is already in use")]
    IdInUse(ObjectId),
    #[error("active object id 0 is reserved")]
    InvalidId,
    #[error("active object position {0} is not finite")]
    NonFinitePosition(Vec3),
}

/// What an active object is, as far as visibility rules care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    /// The avatar of a connected peer.
    Player { peer: PeerId },
    /// Any other simulated entity.
    Entity,
}

/// A live simulation entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveObject {
    kind: ObjectKind,
    position: Vec3,
    velocity: Vec3,
    pending_removal: bool,
}

impl ActiveObject {
    pub fn entity(position: Vec3) -> Self {
        Self {
            kind: ObjectKind::Entity,
            position,
            velocity: Vec3::ZERO,
            pending_removal: false,
        }
    }

    pub fn player(peer: PeerId, position: Vec3) -> Self {
        Self {
            kind: ObjectKind::Player { peer },
            ..Self::entity(position)
        }
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_player(&self) -> bool {
        matches!(self.kind, ObjectKind::Player { .. })
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    /// Marked for removal; stays queryable until purged so observers can be
    /// told it is gone.
    pub fn is_pending_removal(&self) -> bool {
        self.pending_removal
    }
}

/// A record of every change to the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectEvent {
    Added { id: ObjectId, position: Vec3 },
    Moved { id: ObjectId, from: Vec3, to: Vec3 },
    Removed { id: ObjectId },
}

fn to_point(v: Vec3) -> [f32; 3] {
    v.to_array()
}

/// Owner of every live active object.
///
/// Hands out and recycles 16-bit ids and keeps each object's position in a
/// [`PointIndex`], so that radius and box lookups do not scan all objects.
#[derive(Debug, Default)]
pub struct ActiveObjectDirectory {
    objects: BTreeMap<ObjectId, ActiveObject>,
    index: PointIndex<3, f32, ObjectId>,
    last_used_id: u16,
    events: Vec<ObjectEvent>,
}

impl ActiveObjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: ObjectId) -> Option<&ActiveObject> {
        self.objects.get(&id)
    }

    /// Objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ActiveObject)> {
        self.objects.iter().map(|(id, obj)| (*id, obj))
    }

    /// Drain and return the event log.
    pub fn drain_events(&mut self) -> Vec<ObjectEvent> {
        std::mem::take(&mut self.events)
    }

    /// Read-only access to the event log.
    pub fn events(&self) -> &[ObjectEvent] {
        &self.events
    }

    /// Next unused id after the last one handed out, wrapping and skipping 0.
    fn free_id(&mut self) -> Result<ObjectId, DirectoryError> {
        let mut candidate = self.last_used_id;
        for _ in 0..u16::MAX {
            candidate = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if !self.objects.contains_key(&ObjectId(candidate)) {
                self.last_used_id = candidate;
                return Ok(ObjectId(candidate));
            }
        }
        Err(DirectoryError::Full)
    }

    /// Register an object under a fresh id.
    pub fn add(&mut self, object: ActiveObject) -> Result<ObjectId, DirectoryError> {
        check_finite(object.position)?;
        let id = self.free_id()?;
        self.insert_raw(id, object);
        Ok(id)
    }

    /// Register an object under a caller-chosen id (used when restoring).
    pub fn add_with_id(&mut self, id: ObjectId, object: ActiveObject) -> Result<(), DirectoryError> {
        if id.is_none() {
            return Err(DirectoryError::InvalidId);
        }
        if self.objects.contains_key(&id) {
            return Err(DirectoryError::IdInUse(id));
        }
        check_finite(object.position)?;
        self.insert_raw(id, object);
        Ok(())
    }

    fn insert_raw(&mut self, id: ObjectId, object: ActiveObject) {
        self.index.insert(to_point(object.position), id);
        self.objects.insert(id, object);
        self.events.push(ObjectEvent::Added {
            id,
            position: object.position,
        });
        tracing::trace!(%id, position = ?object.position, "active object added");
    }

    /// Remove an object immediately. Returns it if it existed.
    pub fn remove(&mut self, id: ObjectId) -> Option<ActiveObject> {
        let object = self.objects.remove(&id)?;
        self.index.remove(id);
        self.events.push(ObjectEvent::Removed { id });
        tracing::trace!(%id, "active object removed");
        Some(object)
    }

    /// Flag an object for removal once observers have been told.
    pub fn mark_removed(&mut self, id: ObjectId) -> bool {
        match self.objects.get_mut(&id) {
            Some(object) => {
                object.pending_removal = true;
                true
            }
            None => false,
        }
    }

    /// Remove every object flagged by [`Self::mark_removed`].
    pub fn purge_removed(&mut self) -> Vec<ObjectId> {
        let gone: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, o)| o.pending_removal)
            .map(|(id, _)| *id)
            .collect();
        for id in &gone {
            self.remove(*id);
        }
        gone
    }

    /// Move an object. Returns `false` for unknown ids and non-finite
    /// positions; the object then stays where it was.
    pub fn set_position(&mut self, id: ObjectId, position: Vec3) -> bool {
        let Some(object) = self.objects.get_mut(&id) else {
            return false;
        };
        if !position.is_finite() {
            tracing::warn!(%id, ?position, "rejected non-finite position");
            return false;
        }
        let from = object.position;
        if from == position {
            return true;
        }
        object.position = position;
        self.index.update(to_point(position), id);
        self.events.push(ObjectEvent::Moved {
            id,
            from,
            to: position,
        });
        true
    }

    /// Returns `false` for unknown ids and non-finite velocities.
    pub fn set_velocity(&mut self, id: ObjectId, velocity: Vec3) -> bool {
        if !velocity.is_finite() {
            return false;
        }
        match self.objects.get_mut(&id) {
            Some(object) => {
                object.velocity = velocity;
                true
            }
            None => false,
        }
    }

    /// Advance every moving object by `velocity * dtime`.
    pub fn step(&mut self, dtime: f32) {
        let moves: Vec<(ObjectId, Vec3)> = self
            .objects
            .iter()
            .filter(|(_, o)| o.velocity != Vec3::ZERO)
            .map(|(id, o)| (*id, o.position + o.velocity * dtime))
            .collect();
        for (id, position) in moves {
            self.set_position(id, position);
        }
    }

    /// Objects whose position lies in the inclusive box `[min, max]`.
    pub fn objects_in_area(&self, min: Vec3, max: Vec3) -> Vec<ObjectId> {
        let mut ids = self.index.ids_in_box(&to_point(min), &to_point(max));
        ids.sort_unstable();
        ids
    }

    /// Objects within `radius` of `center`. `radius` must be positive.
    pub fn objects_inside_radius(&self, center: Vec3, radius: f32) -> Vec<ObjectId> {
        debug_assert!(radius > 0.0, "objects_inside_radius: radius {radius} must be positive");
        let reach = Vec3::splat(radius);
        let mut ids = Vec::new();
        self.index.range_query(
            &to_point(center - reach),
            &to_point(center + reach),
            |p, id| {
                if Vec3::from_array(*p).distance_squared(center) <= radius * radius {
                    ids.push(id);
                }
            },
        );
        ids.sort_unstable();
        ids
    }

    /// Objects an observer at `pos` should now know about but is not in
    /// `known`. Players are visible within `player_radius` (0 = everywhere),
    /// everything else within `radius`.
    pub fn added_objects_around(
        &self,
        pos: Vec3,
        radius: f32,
        player_radius: f32,
        known: &BTreeSet<ObjectId>,
    ) -> Vec<ObjectId> {
        let mut added = BTreeSet::new();
        let mut consider = |id: ObjectId| {
            if known.contains(&id) {
                return;
            }
            let visible = self.objects.get(&id).is_some_and(|object| {
                !object.pending_removal && within_view(object, pos, radius, player_radius)
            });
            if visible {
                added.insert(id);
            }
        };

        let player_radius = player_radius.max(0.0);
        let reach = if player_radius > 0.0 {
            radius.max(player_radius)
        } else {
            radius
        };
        if reach > 0.0 {
            let r = Vec3::splat(reach);
            self.index
                .range_query(&to_point(pos - r), &to_point(pos + r), |_, id| consider(id));
        }
        if player_radius == 0.0 {
            let players: Vec<ObjectId> = self
                .objects
                .iter()
                .filter(|(_, o)| o.is_player())
                .map(|(id, _)| *id)
                .collect();
            for id in players {
                consider(id);
            }
        }
        added.into_iter().collect()
    }

    /// Members of `known` an observer at `pos` should forget: ids that no
    /// longer exist, objects pending removal, and objects out of range.
    pub fn removed_objects_around(
        &self,
        pos: Vec3,
        radius: f32,
        player_radius: f32,
        known: &BTreeSet<ObjectId>,
    ) -> Vec<ObjectId> {
        let player_radius = player_radius.max(0.0);
        known
            .iter()
            .copied()
            .filter(|id| match self.objects.get(id) {
                None => {
                    tracing::debug!(%id, "known object no longer exists");
                    true
                }
                Some(object) => {
                    object.pending_removal || !within_view(object, pos, radius, player_radius)
                }
            })
            .collect()
    }
}

fn check_finite(position: Vec3) -> Result<(), DirectoryError> {
    if position.is_finite() {
        Ok(())
    } else {
        Err(DirectoryError::NonFinitePosition(position))
    }
}

fn within_view(object: &ActiveObject, pos: Vec3, radius: f32, player_radius: f32) -> bool {
    let distance = object.position.distance(pos);
    if object.is_player() {
        player_radius == 0.0 || distance <= player_radius
    } else {
        distance <= radius
    }
}

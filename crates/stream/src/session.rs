use std::collections::{BTreeSet, HashSet};

use glam::Vec3;
use serde::{Deserialize, Serialize};
use voxstream_common::{ChunkPos, ObjectId, PeerId};
use voxstream_kernel::{ActiveObjectDirectory, ChunkMap};

use crate::autosend::Autosend;
use crate::config::StreamConfig;
use crate::emerge::EmergeQueue;
use crate::priority::{ChunkSendRequest, WantedSend};

/// Seconds since the last edit, before any edit happened.
const NEVER_BUILT: f32 = 9999.0;

/// Where an observer is and where it looks. Positions are in nodes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObserverView {
    pub eye: Vec3,
    /// Unit look direction.
    pub camera_dir: Vec3,
    /// Nodes per second.
    pub velocity: Vec3,
    /// Zoom field of view in radians; 0 when not zooming.
    pub zoom_fov: f32,
}

impl ObserverView {
    /// A stationary observer at `eye` looking along +Z.
    pub fn at(eye: Vec3) -> Self {
        Self {
            eye,
            ..Self::default()
        }
    }
}

impl Default for ObserverView {
    fn default() -> Self {
        Self {
            eye: Vec3::ZERO,
            camera_dir: Vec3::Z,
            velocity: Vec3::ZERO,
            zoom_fov: 0.0,
        }
    }
}

/// Which chunks an observer has, is receiving, or holds stale.
#[derive(Debug, Clone)]
pub struct TransferState {
    sending: HashSet<WantedSend>,
    sent: HashSet<WantedSend>,
    /// Invalidated after being sent or while in flight.
    modified: HashSet<WantedSend>,
    time_from_building: f32,
    excess_acks: u32,
}

impl Default for TransferState {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferState {
    pub fn new() -> Self {
        Self {
            sending: HashSet::new(),
            sent: HashSet::new(),
            modified: HashSet::new(),
            time_from_building: NEVER_BUILT,
            excess_acks: 0,
        }
    }

    pub fn sending_count(&self) -> usize {
        self.sending.len()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    pub fn sending(&self) -> impl Iterator<Item = &WantedSend> {
        self.sending.iter()
    }

    pub fn is_sending(&self, wanted: &WantedSend) -> bool {
        self.sending.contains(wanted)
    }

    pub fn is_sent(&self, wanted: &WantedSend) -> bool {
        self.sent.contains(wanted)
    }

    pub fn is_modified(&self, wanted: &WantedSend) -> bool {
        self.modified.contains(wanted)
    }

    /// Seconds since a world edit near this observer.
    pub fn time_from_building(&self) -> f32 {
        self.time_from_building
    }

    /// Acknowledgements for transfers that were not in flight.
    pub fn excess_acks(&self) -> u32 {
        self.excess_acks
    }

    pub fn step(&mut self, dtime: f32) {
        self.time_from_building += dtime;
    }

    pub fn note_world_edit(&mut self) {
        self.time_from_building = 0.0;
    }

    pub fn transfer_started(&mut self, wanted: WantedSend) {
        if !self.sending.insert(wanted) {
            tracing::debug!(%wanted, "transfer already in flight");
        }
    }

    /// The observer acknowledged `wanted`. Late acknowledgements (the chunk
    /// was invalidated meanwhile) only count as excess.
    pub fn transfer_finished(&mut self, wanted: WantedSend) {
        if self.sending.remove(&wanted) {
            self.sent.insert(wanted);
            self.modified.remove(&wanted);
        } else {
            self.excess_acks += 1;
        }
    }

    /// The observer dropped its copy of `wanted`. Unlike
    /// [`Self::set_not_sent`] the data itself did not change, so nothing is
    /// marked modified.
    pub fn forget_sent(&mut self, wanted: WantedSend) -> bool {
        self.sent.remove(&wanted)
    }

    /// Forget that `wanted` was sent or is being sent. Returns whether the
    /// observer had it.
    pub fn set_not_sent(&mut self, wanted: WantedSend) -> bool {
        let known = self.sending.remove(&wanted) | self.sent.remove(&wanted);
        if known {
            self.modified.insert(wanted);
        }
        known
    }
}

/// Objects that appeared or disappeared for an observer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectDelta {
    pub added: Vec<ObjectId>,
    pub removed: Vec<ObjectId>,
}

impl ObjectDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Everything the server keeps for one connected observer. Dropped on
/// disconnect.
#[derive(Debug)]
pub struct ObserverSession {
    peer: PeerId,
    view: ObserverView,
    transfers: TransferState,
    autosend: Autosend,
    known_objects: BTreeSet<ObjectId>,
}

impl ObserverSession {
    pub fn new(peer: PeerId, config: &StreamConfig) -> Self {
        Self {
            peer,
            view: ObserverView::default(),
            transfers: TransferState::new(),
            autosend: Autosend::new(config),
            known_objects: BTreeSet::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn view(&self) -> &ObserverView {
        &self.view
    }

    pub fn set_view(&mut self, view: ObserverView) {
        self.view = view;
    }

    pub fn transfers(&self) -> &TransferState {
        &self.transfers
    }

    pub fn autosend(&self) -> &Autosend {
        &self.autosend
    }

    /// Client-requested chunk and far-cell radii.
    pub fn set_radius(&mut self, map: i32, far: i32) {
        self.autosend.set_radius(map, far);
    }

    pub fn set_fov(&mut self, fov: f32) {
        self.autosend.set_fov(fov);
    }

    pub fn transfer_started(&mut self, wanted: WantedSend) {
        self.transfers.transfer_started(wanted);
    }

    pub fn transfer_finished(&mut self, wanted: WantedSend) {
        self.transfers.transfer_finished(wanted);
    }

    /// Invalidate a chunk (and the far cell holding it) for this observer.
    pub fn set_chunk_not_sent(&mut self, pos: ChunkPos) {
        let chunk = self.transfers.set_not_sent(WantedSend::chunk(pos));
        let far = self.transfers.set_not_sent(WantedSend::far(pos.far_cell()));
        if chunk || far {
            self.autosend.reset_search_radius(pos, self.view.eye);
        }
    }

    pub fn note_world_edit(&mut self) {
        self.transfers.note_world_edit();
    }

    /// The client unloaded these chunks. Returns how many it had been sent.
    pub fn chunks_deleted(&mut self, positions: &[ChunkPos]) -> usize {
        let forgotten = positions
            .iter()
            .filter(|pos| self.transfers.forget_sent(WantedSend::chunk(**pos)))
            .count();
        tracing::debug!(peer = %self.peer, reported = positions.len(), forgotten, "client deleted chunks");
        forgotten
    }

    /// Start this tick's search.
    pub fn cycle(&mut self, dtime: f32, config: &StreamConfig) {
        self.transfers.step(dtime);
        self.autosend.cycle(dtime, &self.view, &self.transfers, config);
    }

    pub fn next_suggestion(
        &mut self,
        map: &ChunkMap,
        emerge: &mut dyn EmergeQueue,
        config: &StreamConfig,
    ) -> Option<ChunkSendRequest> {
        self.autosend
            .next_suggestion(self.peer, &self.transfers, map, emerge, config)
    }

    pub fn known_objects(&self) -> &BTreeSet<ObjectId> {
        &self.known_objects
    }

    /// Bring the set of objects this observer knows about up to date.
    /// `player_radius` of 0 shows players at any distance.
    pub fn update_known_objects(
        &mut self,
        objects: &ActiveObjectDirectory,
        radius: f32,
        player_radius: f32,
    ) -> ObjectDelta {
        let eye = self.view.eye;
        let removed = objects.removed_objects_around(eye, radius, player_radius, &self.known_objects);
        for id in &removed {
            self.known_objects.remove(id);
        }
        let added = objects.added_objects_around(eye, radius, player_radius, &self.known_objects);
        self.known_objects.extend(added.iter().copied());
        ObjectDelta { added, removed }
    }

    pub fn describe_status(&self) -> String {
        format!(
            "{}: sending={} sent={} {}",
            self.peer,
            self.transfers.sending_count(),
            self.transfers.sent_count(),
            self.autosend.describe_status()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxstream_kernel::ActiveObject;

    #[test]
    fn transfer_lifecycle() {
        let mut t = TransferState::new();
        let w = WantedSend::chunk(ChunkPos::new(1, 0, 0));
        t.transfer_started(w);
        assert!(t.is_sending(&w));
        assert_eq!(t.sending_count(), 1);
        t.transfer_finished(w);
        assert!(!t.is_sending(&w));
        assert!(t.is_sent(&w));
        assert_eq!(t.excess_acks(), 0);
    }

    #[test]
    fn invalidated_in_flight_transfer_acks_as_excess() {
        let mut t = TransferState::new();
        let w = WantedSend::chunk(ChunkPos::ORIGIN);
        t.transfer_started(w);
        assert!(t.set_not_sent(w));
        assert!(t.is_modified(&w));
        t.transfer_finished(w);
        assert_eq!(t.excess_acks(), 1);
        assert!(!t.is_sent(&w));
    }

    #[test]
    fn unknown_chunk_is_not_marked_modified() {
        let mut t = TransferState::new();
        let w = WantedSend::chunk(ChunkPos::new(5, 5, 5));
        assert!(!t.set_not_sent(w));
        assert!(!t.is_modified(&w));
    }

    #[test]
    fn resend_clears_modified() {
        let mut t = TransferState::new();
        let w = WantedSend::chunk(ChunkPos::ORIGIN);
        t.transfer_started(w);
        t.transfer_finished(w);
        t.set_not_sent(w);
        t.transfer_started(w);
        t.transfer_finished(w);
        assert!(t.is_sent(&w));
        assert!(!t.is_modified(&w));
    }

    #[test]
    fn forgetting_a_chunk_does_not_mark_it_modified() {
        let mut session = ObserverSession::new(PeerId(1), &StreamConfig::default());
        let kept = ChunkPos::new(1, 0, 0);
        for pos in [ChunkPos::ORIGIN, kept] {
            session.transfer_started(WantedSend::chunk(pos));
            session.transfer_finished(WantedSend::chunk(pos));
        }
        let in_flight = WantedSend::chunk(ChunkPos::new(2, 0, 0));
        session.transfer_started(in_flight);

        let gone = [ChunkPos::ORIGIN, ChunkPos::new(2, 0, 0), ChunkPos::new(9, 9, 9)];
        assert_eq!(session.chunks_deleted(&gone), 1);
        let origin = WantedSend::chunk(ChunkPos::ORIGIN);
        assert!(!session.transfers().is_sent(&origin));
        assert!(!session.transfers().is_modified(&origin));
        assert!(session.transfers().is_sent(&WantedSend::chunk(kept)));
        assert!(session.transfers().is_sending(&in_flight));
    }

    #[test]
    fn edit_starts_cooldown() {
        let mut t = TransferState::new();
        assert!(t.time_from_building() > 100.0);
        t.note_world_edit();
        t.step(0.5);
        assert_eq!(t.time_from_building(), 0.5);
    }

    #[test]
    fn known_objects_follow_the_observer() {
        let mut objects = ActiveObjectDirectory::new();
        let near = objects.add(ActiveObject::entity(Vec3::new(5.0, 0.0, 0.0))).unwrap();
        let far = objects.add(ActiveObject::entity(Vec3::new(500.0, 0.0, 0.0))).unwrap();
        let player = objects
            .add(ActiveObject::player(PeerId(9), Vec3::new(900.0, 0.0, 0.0)))
            .unwrap();

        let mut session = ObserverSession::new(PeerId(1), &StreamConfig::default());
        let delta = session.update_known_objects(&objects, 50.0, 0.0);
        assert_eq!(delta.added, vec![near, player]);
        assert!(delta.removed.is_empty());
        assert!(!session.known_objects().contains(&far));

        // Nothing changed: empty delta.
        assert!(session.update_known_objects(&objects, 50.0, 0.0).is_empty());

        session.set_view(ObserverView::at(Vec3::new(500.0, 0.0, 0.0)));
        let delta = session.update_known_objects(&objects, 50.0, 0.0);
        assert_eq!(delta.added, vec![far]);
        assert_eq!(delta.removed, vec![near]);

        objects.mark_removed(player);
        let delta = session.update_known_objects(&objects, 50.0, 0.0);
        assert_eq!(delta.removed, vec![player]);
    }

    #[test]
    fn invalidation_covers_far_cell() {
        let mut session = ObserverSession::new(PeerId(1), &StreamConfig::default());
        let pos = ChunkPos::new(5, 1, -3);
        let far = WantedSend::far(pos.far_cell());
        session.transfer_started(far);
        session.transfer_finished(far);
        session.set_chunk_not_sent(pos);
        assert!(!session.transfers().is_sent(&far));
        assert!(session.transfers().is_modified(&far));
        assert!(session.describe_status().starts_with("peer1:"));
    }
}

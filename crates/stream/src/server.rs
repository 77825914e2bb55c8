use std::collections::BTreeMap;
use std::time::Instant;

use glam::Vec3;
use voxstream_common::{ChunkPos, PeerId};
use voxstream_kernel::{ActiveObjectDirectory, ObjectKind, World, WorldEvent};

use crate::config::{ConfigError, StreamConfig};
use crate::emerge::EmergeQueue;
use crate::priority::{ChunkSendRequest, WantedSend};
use crate::session::{ObjectDelta, ObserverSession, ObserverView};
use crate::stats::{StepHistory, StepSample, StreamStats};

/// Eye height above a player's feet, in nodes.
pub const EYE_HEIGHT: f32 = 1.625;

const TICK_HISTORY: usize = 120;

/// Runs every observer's scheduler once per tick and routes transfer
/// bookkeeping from the transport layer.
#[derive(Debug)]
pub struct StreamServer {
    config: StreamConfig,
    sessions: BTreeMap<PeerId, ObserverSession>,
    stats: StreamStats,
    history: StepHistory,
}

impl StreamServer {
    pub fn new(config: StreamConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            sessions: BTreeMap::new(),
            stats: StreamStats::default(),
            history: StepHistory::new(TICK_HISTORY),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Register an observer. Reconnecting keeps the existing session.
    pub fn connect(&mut self, peer: PeerId) -> &mut ObserverSession {
        let config = &self.config;
        self.sessions.entry(peer).or_insert_with(|| {
            tracing::info!(%peer, "observer connected");
            ObserverSession::new(peer, config)
        })
    }

    /// Drop an observer's session. Emerges it started keep running.
    pub fn disconnect(&mut self, peer: PeerId) -> bool {
        let removed = self.sessions.remove(&peer).is_some();
        if removed {
            tracing::info!(%peer, "observer disconnected");
        }
        removed
    }

    pub fn session(&self, peer: PeerId) -> Option<&ObserverSession> {
        self.sessions.get(&peer)
    }

    pub fn session_mut(&mut self, peer: PeerId) -> Option<&mut ObserverSession> {
        self.sessions.get_mut(&peer)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ObserverSession> {
        self.sessions.values()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Report a finished transfer. Returns `false` if the observer is gone.
    pub fn transfer_finished(&mut self, peer: PeerId, wanted: WantedSend) -> bool {
        match self.sessions.get_mut(&peer) {
            Some(session) => {
                session.transfer_finished(wanted);
                true
            }
            None => false,
        }
    }

    /// The client unloaded `positions`. Returns `false` if the observer is
    /// gone.
    pub fn chunks_deleted(&mut self, peer: PeerId, positions: &[ChunkPos]) -> bool {
        match self.sessions.get_mut(&peer) {
            Some(session) => {
                session.chunks_deleted(positions);
                true
            }
            None => false,
        }
    }

    /// Move every observer with a player object to that player's eye.
    pub fn follow_players(&mut self, objects: &ActiveObjectDirectory) {
        for (_, object) in objects.iter() {
            let ObjectKind::Player { peer } = object.kind() else {
                continue;
            };
            if let Some(session) = self.sessions.get_mut(&peer) {
                let view = ObserverView {
                    eye: object.position() + Vec3::new(0.0, EYE_HEIGHT, 0.0),
                    velocity: object.velocity(),
                    ..*session.view()
                };
                session.set_view(view);
            }
        }
    }

    /// Invalidate an edited chunk for every observer. Observers within send
    /// range of the edit also enter the post-edit cooldown.
    pub fn chunk_modified(&mut self, pos: ChunkPos) {
        for session in self.sessions.values_mut() {
            session.set_chunk_not_sent(pos);
            let eye_chunk = ChunkPos::containing(session.view().eye);
            if eye_chunk.ring_distance(pos) <= self.config.send_radius {
                session.note_world_edit();
            }
        }
    }

    /// Apply drained world events.
    pub fn handle_world_events(&mut self, events: &[WorldEvent]) {
        for event in events {
            if let WorldEvent::ChunkModified { pos } = event {
                self.chunk_modified(*pos);
            }
        }
    }

    /// One scheduler cycle per observer. Each observer gets at most one
    /// suggestion, already marked as in flight.
    pub fn step(
        &mut self,
        dtime: f32,
        world: &World,
        emerge: &mut dyn EmergeQueue,
    ) -> Vec<(PeerId, ChunkSendRequest)> {
        let _span = tracing::info_span!("stream_step", observers = self.sessions.len()).entered();
        let start = Instant::now();

        let mut suggestions = Vec::new();
        let mut idle = 0;
        for (peer, session) in self.sessions.iter_mut() {
            session.cycle(dtime, &self.config);
            if !session.autosend().is_active() {
                idle += 1;
            }
            if let Some(request) = session.next_suggestion(world.map(), emerge, &self.config) {
                session.transfer_started(request.wanted);
                suggestions.push((*peer, request));
            }
        }

        let tick_time = start.elapsed();
        self.history.push(StepSample {
            duration: tick_time,
            observers: self.sessions.len(),
            suggestions: suggestions.len(),
        });
        self.stats = StreamStats {
            observers: self.sessions.len(),
            suggestions_this_tick: suggestions.len(),
            in_flight: self.sessions.values().map(|s| s.transfers().sending_count()).sum(),
            sent_total: self.sessions.values().map(|s| s.transfers().sent_count()).sum(),
            idle_observers: idle,
            tick_time,
        };
        tracing::trace!(
            suggestions = suggestions.len(),
            in_flight = self.stats.in_flight,
            "stream step complete"
        );
        suggestions
    }

    /// Recompute known objects for every observer; only non-empty deltas
    /// are returned.
    pub fn update_objects(
        &mut self,
        objects: &ActiveObjectDirectory,
        radius: f32,
        player_radius: f32,
    ) -> Vec<(PeerId, ObjectDelta)> {
        self.sessions
            .iter_mut()
            .filter_map(|(peer, session)| {
                let delta = session.update_known_objects(objects, radius, player_radius);
                (!delta.is_empty()).then_some((*peer, delta))
            })
            .collect()
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Recent scheduler passes.
    pub fn step_history(&self) -> &StepHistory {
        &self.history
    }
}

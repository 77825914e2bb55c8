//! Per-observer incremental chunk search.
//!
//! Each network tick the server runs one [`Autosend::cycle`] per observer
//! and then asks [`Autosend::next_suggestion`] for the best chunk to send.
//! The search walks Chebyshev shells outward from a focus point a few shells
//! per call and remembers where anything interesting happened so the next
//! call resumes there.

use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender, unbounded};
use glam::Vec3;
use voxstream_common::{CHUNK_SIZE, ChunkPos, FAR_CHUNK_FACTOR, PeerId, node_containing};
use voxstream_kernel::ChunkMap;

use crate::config::StreamConfig;
use crate::emerge::{EmergeCompletion, EmergeFlags, EmergeQueue};
use crate::priority::{ChunkSendRequest, SendPriority, SuggestionKind, WantedSend, far_cell_center};
use crate::ring::RingCache;
use crate::session::{ObserverView, TransferState};

/// Field of view assumed when the observer's own value is unusable.
pub const DEFAULT_FOV: f32 = 1.72;

/// Radius of the sphere enclosing a chunk.
pub const CHUNK_MAX_RADIUS: f32 = 0.866_025_4 * CHUNK_SIZE as f32;

/// Speeds are in nodes per second.
const FOCUS_MIN_SPEED: f32 = 1.0;
const FAST_SPEED: f32 = 10.0;
const FORWARD_SPEED_CAP: f32 = 30.0;
const CAMERA_TURN_RESET_COS: f32 = 0.8;
const NEAREST_UNSENT_RESET_SECONDS: f32 = 20.0;
const NOTHING_SENT_TOGGLE_SECONDS: f32 = 3.0;
const SHORT_PAUSE_SECONDS: f32 = 0.2;
const FULL_SWEEP_PAUSE_SECONDS: f32 = 1.0;
const RESET_PAUSE_CAP_SECONDS: f32 = 0.1;

/// Result of looking at one candidate chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAnalysis {
    InViewAndLoaded,
    /// Not in memory; storage has not been checked.
    InViewButNotLoaded,
    /// In memory but not generated, or known absent from storage.
    InViewButNotGenerated,
    NotInView,
    AlreadySent,
}

/// In-flight cap for a candidate `distance` rings from the focus.
///
/// Close rings always get the full budget. Further out, a recent world edit
/// drops the cap to the limited value until the cooldown has passed.
pub fn max_simultaneous_transfers(config: &StreamConfig, time_from_building: f32, distance: i32) -> usize {
    if distance <= config.cooldown_exempt_distance {
        return config.max_simultaneous_transfers;
    }
    if time_from_building < config.post_edit_cooldown_seconds {
        return config.limited_simultaneous_transfers;
    }
    config.max_simultaneous_transfers
}

/// Scale a distance for an observer looking through a zoom of `zoom_fov`
/// radians. Zooms wider than the default view leave it unchanged.
pub fn adjust_dist(dist: i32, zoom_fov: f32) -> i32 {
    // Half of the default client FOV widened by 1.4.
    const THRESHOLD_FOV: f32 = 1.775 / 2.0;
    if zoom_fov < 0.001 || zoom_fov > THRESHOLD_FOV {
        return dist;
    }
    let scale = ((1.0 - THRESHOLD_FOV.cos()) / (1.0 - (zoom_fov / 2.0).cos())).cbrt();
    (dist as f32 * scale).round() as i32
}

/// Whether any part of the chunk at `pos` can be inside the view cone.
///
/// `range` is in nodes and measured to the chunk's bounding sphere. A zero
/// `fov` disables the cone test.
pub fn chunk_in_sight(pos: ChunkPos, camera: Vec3, camera_dir: Vec3, fov: f32, range: f32) -> bool {
    let relative = pos.center() - camera;
    let distance = (relative.length() - CHUNK_MAX_RADIUS).max(0.0);
    if distance > range {
        return false;
    }
    let dir = camera_dir.normalize_or_zero();
    if distance == 0.0 || fov <= 0.0 || dir == Vec3::ZERO {
        return true;
    }
    // Pull the apex back so a chunk touching the cone counts as inside.
    let apex = camera - dir * (CHUNK_MAX_RADIUS / (fov / 2.0).sin());
    let adjusted = pos.center() - apex;
    let length = adjusted.length();
    if length == 0.0 {
        return true;
    }
    adjusted.dot(dir) / length >= (fov * 0.55).cos()
}

/// Progress of one search (fine chunks or coarse far cells).
#[derive(Debug, Clone)]
struct Search {
    label: &'static str,
    /// Started this cycle.
    active: bool,

    // Reset by `start`.
    max_send_distance: i32,
    fov_limit_activation_distance: i32,
    d_start: i32,
    d_max: i32,
    d: i32,
    i: usize,
    nearest_emerge_queued: Option<i32>,
    nearest_emerge_full: Option<i32>,
    nearest_send_queued: Option<i32>,

    // Persistent.
    nearest_unsent: i32,
    /// Cleared to cover what lies outside the view cone.
    fov_limit_enabled: bool,
    nothing_to_send_timer: f32,
    /// Search is idle while positive.
    pause_timer: f32,
}

impl Search {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            active: false,
            max_send_distance: 0,
            fov_limit_activation_distance: 0,
            d_start: 0,
            d_max: 0,
            d: 0,
            i: 0,
            nearest_emerge_queued: None,
            nearest_emerge_full: None,
            nearest_send_queued: None,
            nearest_unsent: 0,
            fov_limit_enabled: true,
            nothing_to_send_timer: 0.0,
            pause_timer: 0.0,
        }
    }

    fn paused(&self) -> bool {
        self.pause_timer > 0.0
    }

    fn run_timers(&mut self, dtime: f32) {
        self.nothing_to_send_timer += dtime;
        self.pause_timer -= dtime;
    }

    fn start(&mut self, max_send_distance: i32, fov_limit_activation_distance: i32) {
        self.active = true;
        self.max_send_distance = max_send_distance;
        self.fov_limit_activation_distance = fov_limit_activation_distance;
        self.i = 0;
        self.d_start = self.nearest_unsent.max(0);
        self.d = self.d_start;

        // Near shells are small, so cover more of them per call.
        let extra = if self.d_start < 5 {
            3
        } else if self.d_start < 8 {
            2
        } else {
            1
        };
        self.d_max = (self.d_start + extra).min(max_send_distance);

        self.nearest_emerge_queued = None;
        self.nearest_emerge_full = None;
        self.nearest_send_queued = None;

        tracing::trace!(
            search = self.label,
            d_start = self.d_start,
            d_max = self.d_max,
            max_send_distance,
            fov_limit_activation_distance,
            "search started"
        );
    }

    fn finish(&mut self, enable_fov_toggle: bool) {
        self.active = false;
        let recheck = [
            self.nearest_emerge_queued,
            self.nearest_emerge_full,
            self.nearest_send_queued,
        ]
        .into_iter()
        .flatten()
        .min();

        if let Some(d) = recheck {
            // Something queued at `d` may produce data there; look again.
            self.nearest_unsent = d;
            if enable_fov_toggle && self.nothing_to_send_timer >= NOTHING_SENT_TOGGLE_SECONDS {
                if self.fov_limit_enabled {
                    tracing::debug!(search = self.label, "nothing sent for a while; FOV limit off");
                    self.fov_limit_enabled = false;
                } else {
                    tracing::debug!(search = self.label, "nothing sent without FOV limit; short sleep");
                    self.fov_limit_enabled = true;
                    self.pause_timer = SHORT_PAUSE_SECONDS;
                }
                self.nothing_to_send_timer = 0.0;
            }
        } else if self.d > self.max_send_distance {
            self.nearest_unsent = 0;
            if enable_fov_toggle && self.fov_limit_enabled {
                tracing::debug!(search = self.label, "searched full range; second pass without FOV limit");
                self.fov_limit_enabled = false;
            } else {
                tracing::debug!(search = self.label, "searched full range; idle sleep");
                self.fov_limit_enabled = true;
                self.pause_timer = FULL_SWEEP_PAUSE_SECONDS;
            }
        } else {
            self.nearest_unsent = self.d;
            tracing::trace!(search = self.label, d = self.d, "continuing next cycle");
        }
    }
}

/// Per-cycle view of the observer, fixed by `start_cycle`.
#[derive(Debug, Clone, Copy)]
struct CycleView {
    camera: Vec3,
    camera_dir: Vec3,
    /// Predicted eye position; used for occlusion.
    focus_eye: Vec3,
    focus: ChunkPos,
    fov: f32,
    max_generate: i32,
    /// Send radius in nodes.
    range: f32,
    /// Far radius in far cells, after the server cap.
    far_radius: i32,
}

/// The streaming scheduler of one observer.
#[derive(Debug)]
pub struct Autosend {
    radius_map: i32,
    radius_far: i32,
    fov: f32,
    far_weight: f32,
    last_focus: Option<ChunkPos>,
    last_camera_dir: Vec3,
    reset_timer: f32,
    map: Search,
    far: Search,
    cycle: Option<CycleView>,
    /// Positions whose emerge finished, checked before scanning.
    shortcut: VecDeque<ChunkPos>,
    completions_tx: Sender<EmergeCompletion>,
    completions_rx: Receiver<EmergeCompletion>,
    rings: RingCache,
}

impl Autosend {
    /// A scheduler using the server's send radius and default FOV. The far
    /// search stays off until a far radius is set.
    pub fn new(config: &StreamConfig) -> Self {
        let (completions_tx, completions_rx) = unbounded();
        Self {
            radius_map: config.send_radius,
            radius_far: 0,
            fov: config.fov_radians,
            far_weight: config.far_weight,
            last_focus: None,
            last_camera_dir: Vec3::ZERO,
            reset_timer: 0.0,
            map: Search::new("chunk"),
            far: Search::new("far"),
            cycle: None,
            shortcut: VecDeque::new(),
            completions_tx,
            completions_rx,
            rings: RingCache::new(),
        }
    }

    /// Chunk radius and far-cell radius.
    pub fn radius(&self) -> (i32, i32) {
        (self.radius_map, self.radius_far)
    }

    pub fn set_radius(&mut self, map: i32, far: i32) {
        self.radius_map = map.max(0);
        self.radius_far = far.max(0);
    }

    pub fn fov(&self) -> f32 {
        self.fov
    }

    pub fn set_fov(&mut self, fov: f32) {
        self.fov = if fov.is_finite() { fov.max(0.0) } else { DEFAULT_FOV };
    }

    /// Whether the current cycle will produce suggestions.
    pub fn is_active(&self) -> bool {
        self.cycle.is_some()
    }

    /// Ring the fine search resumes from.
    pub fn nearest_unsent(&self) -> i32 {
        self.map.nearest_unsent
    }

    pub fn fov_limit_enabled(&self) -> bool {
        self.map.fov_limit_enabled
    }

    /// Where completed emerges for this observer should be reported.
    pub fn completion_sender(&self) -> Sender<EmergeCompletion> {
        self.completions_tx.clone()
    }

    pub fn describe_status(&self) -> String {
        format!(
            "(chunk.nearest_unsent_d={}, far.nearest_unsent_d={})",
            self.map.nearest_unsent, self.far.nearest_unsent
        )
    }

    /// Close the previous cycle, advance timers and start the next one.
    pub fn cycle(
        &mut self,
        dtime: f32,
        view: &ObserverView,
        transfers: &TransferState,
        config: &StreamConfig,
    ) {
        self.finish_cycle();
        self.map.run_timers(dtime);
        self.far.run_timers(dtime);
        self.reset_timer += dtime;
        self.cycle = self.start_cycle(view, transfers, config);
    }

    fn finish_cycle(&mut self) {
        if self.cycle.take().is_none() {
            return;
        }
        let enable_fov_toggle = self.fov != 0.0;
        if self.map.active {
            self.map.finish(enable_fov_toggle);
        }
        if self.far.active {
            self.far.finish(enable_fov_toggle);
        }
    }

    fn reset_nearest_unsent(&mut self) {
        self.map.nearest_unsent = 0;
        self.far.nearest_unsent = 0;
    }

    fn start_cycle(
        &mut self,
        view: &ObserverView,
        transfers: &TransferState,
        config: &StreamConfig,
    ) -> Option<CycleView> {
        let map_idle = self.radius_map == 0 || self.map.paused();
        let far_radius = self.radius_far.min(config.far_send_radius);
        let far_idle = far_radius == 0 || self.far.paused();
        if map_idle && far_idle {
            tracing::trace!("autosend idle");
            return None;
        }
        if transfers.sending_count() >= config.max_simultaneous_transfers {
            tracing::trace!(sending = transfers.sending_count(), "autosend saturated");
            return None;
        }

        let camera = view.eye;
        let mut camera_dir = match view.camera_dir.normalize_or_zero() {
            Vec3::ZERO => Vec3::Z,
            dir => dir,
        };
        let speed = view.velocity.length();
        let velocity_dir = if speed > FOCUS_MIN_SPEED {
            view.velocity / speed
        } else {
            Vec3::ZERO
        };

        // Look one chunk ahead along the movement.
        let focus_eye = camera + velocity_dir * CHUNK_SIZE as f32;
        let focus = ChunkPos::containing(focus_eye);
        if self.last_focus != Some(focus) {
            self.reset_nearest_unsent();
            self.last_focus = Some(focus);
        }
        if self.last_camera_dir.dot(camera_dir) < CAMERA_TURN_RESET_COS {
            self.reset_nearest_unsent();
            self.last_camera_dir = camera_dir;
        }

        let max_send = adjust_dist(config.send_radius, view.zoom_fov).min(self.radius_map);
        let max_generate = adjust_dist(config.generate_radius, view.zoom_fov).min(self.radius_map);
        let range = (self.radius_map * CHUNK_SIZE) as f32;

        let mut fov = self.fov;
        if view.zoom_fov < 0.001 && speed > FAST_SPEED {
            // The real camera is meaningless at speed.
            if fov != 0.0 {
                fov = DEFAULT_FOV;
            }
            camera_dir = velocity_dir;
        }
        let forward = camera_dir.dot(view.velocity).clamp(0.0, FORWARD_SPEED_CAP);
        fov /= 1.0 + forward / FORWARD_SPEED_CAP;

        if self.reset_timer > NEAREST_UNSENT_RESET_SECONDS {
            self.reset_timer = 0.0;
            self.reset_nearest_unsent();
        }

        if !map_idle {
            let activation = if self.map.fov_limit_enabled {
                max_send / 5
            } else {
                max_send
            };
            self.map.start(max_send, activation);
        }
        if !far_idle {
            self.far.start(far_radius, far_radius);
        }

        Some(CycleView {
            camera,
            camera_dir,
            focus_eye,
            focus,
            fov,
            max_generate,
            range,
            far_radius,
        })
    }

    /// Best chunk to send now, if any. Candidates needing a load or
    /// generation are pushed to `emerge` along the way.
    pub fn next_suggestion(
        &mut self,
        peer: PeerId,
        transfers: &TransferState,
        map: &ChunkMap,
        emerge: &mut dyn EmergeQueue,
        config: &StreamConfig,
    ) -> Option<ChunkSendRequest> {
        let cycle = self.cycle?;

        for done in self.completions_rx.try_iter() {
            if done.outcome.is_available() {
                self.shortcut.push_back(done.pos);
            }
        }

        let mut candidates = Vec::with_capacity(2);
        if self.map.active && transfers.sent_count() < config.max_total_sent {
            if let Some(pos) = self.suggest_chunk(&cycle, peer, transfers, map, emerge, config) {
                candidates.push(WantedSend::chunk(pos));
            }
        }
        if self.far.active {
            if let Some(cell) = self.suggest_far(&cycle, transfers, config) {
                candidates.push(WantedSend::far(cell));
            }
        }

        let best = SendPriority::new(node_containing(cycle.camera), self.far_weight).best(candidates)?;
        let search = match best.wanted.kind {
            SuggestionKind::Chunk => &mut self.map,
            SuggestionKind::FarChunk => &mut self.far,
        };
        search.nearest_send_queued.get_or_insert(search.d);
        search.nothing_to_send_timer = 0.0;
        tracing::trace!(%peer, wanted = %best.wanted, priority = best.priority, "suggesting");
        Some(best)
    }

    fn suggest_chunk(
        &mut self,
        cycle: &CycleView,
        peer: PeerId,
        transfers: &TransferState,
        map: &ChunkMap,
        emerge: &mut dyn EmergeQueue,
        config: &StreamConfig,
    ) -> Option<ChunkPos> {
        let activation = self.map.fov_limit_activation_distance;
        while let Some(pos) = self.shortcut.pop_front() {
            let d = cycle.focus.ring_distance(pos);
            if transfers.sending_count() >= max_simultaneous_transfers(config, transfers.time_from_building(), d) {
                self.shortcut.push_front(pos);
                return None;
            }
            if classify(cycle, activation, transfers, map, config, pos) == ChunkAnalysis::InViewAndLoaded {
                tracing::trace!(%peer, %pos, "suggesting finished emerge");
                return Some(pos);
            }
        }

        let search = &mut self.map;
        while search.d <= search.d_max {
            let d = search.d;
            while let Some(&offset) = self.rings.ring(d).get(search.i) {
                let cap = max_simultaneous_transfers(config, transfers.time_from_building(), d);
                if transfers.sending_count() >= cap {
                    tracing::trace!(%peer, sending = transfers.sending_count(), cap, "transfer budget reached");
                    return None;
                }

                let pos = cycle.focus + offset;
                match classify(cycle, activation, transfers, map, config, pos) {
                    ChunkAnalysis::InViewAndLoaded => return Some(pos),
                    ChunkAnalysis::AlreadySent | ChunkAnalysis::NotInView => {}
                    analysis => {
                        let allow_generate = d <= cycle.max_generate;
                        let wanted = analysis == ChunkAnalysis::InViewButNotLoaded || allow_generate;
                        if wanted {
                            let flags = EmergeFlags { allow_generate };
                            if emerge.enqueue(pos, peer, flags, self.completions_tx.clone()) {
                                search.nearest_emerge_queued.get_or_insert(d);
                            } else {
                                search.nearest_emerge_full.get_or_insert(d);
                                tracing::debug!(%peer, %pos, "emerge queue full");
                                return None;
                            }
                        }
                    }
                }
                search.i += 1;
            }
            search.i = 0;
            search.d += 1;
        }
        None
    }

    fn suggest_far(
        &mut self,
        cycle: &CycleView,
        transfers: &TransferState,
        config: &StreamConfig,
    ) -> Option<ChunkPos> {
        let focus = cycle.focus.far_cell();
        let range = (cycle.far_radius * FAR_CHUNK_FACTOR * CHUNK_SIZE) as f32;
        let search = &mut self.far;
        while search.d <= search.d_max {
            let d = search.d;
            while let Some(&offset) = self.rings.ring(d).get(search.i) {
                let cap = max_simultaneous_transfers(config, transfers.time_from_building(), d);
                if transfers.sending_count() >= cap {
                    return None;
                }
                let cell = focus + offset;
                let wanted = WantedSend::far(cell);
                let visible = !far_cell_over_limit(cell)
                    && !transfers.is_sending(&wanted)
                    && far_cell_center(cell).distance(cycle.camera) <= range
                    && !(transfers.is_sent(&wanted) && !transfers.is_modified(&wanted));
                if visible {
                    return Some(cell);
                }
                search.i += 1;
            }
            search.i = 0;
            search.d += 1;
        }
        None
    }

    /// Pull the fine search back to `pos` after it changed, so it is found
    /// again soon. `eye` is the observer's current eye position.
    pub fn reset_search_radius(&mut self, pos: ChunkPos, eye: Vec3) {
        let distance = (pos.node_origin().as_vec3() - eye).length();
        let reset_to = (distance / CHUNK_SIZE as f32) as i32;
        let search = &mut self.map;

        if search.d == reset_to {
            search.i = 0;
        }
        if search.d > reset_to {
            search.d = reset_to;
            search.i = 0;
            search.fov_limit_enabled = true;
        }
        search.nearest_unsent = search.nearest_unsent.min(reset_to);
        for marker in [
            &mut search.nearest_emerge_queued,
            &mut search.nearest_emerge_full,
            &mut search.nearest_send_queued,
        ] {
            *marker = Some(marker.map_or(reset_to, |d| d.min(reset_to)));
        }
        search.pause_timer = search.pause_timer.min(RESET_PAUSE_CAP_SECONDS);
        tracing::trace!(%pos, reset_to, "search radius reset");
    }
}

fn far_cell_over_limit(cell: ChunkPos) -> bool {
    let lo = ChunkPos::from(cell.as_ivec3() * FAR_CHUNK_FACTOR);
    let hi = lo + glam::IVec3::splat(FAR_CHUNK_FACTOR - 1);
    lo.is_over_limit() || hi.is_over_limit()
}

fn classify(
    cycle: &CycleView,
    fov_limit_activation_distance: i32,
    transfers: &TransferState,
    map: &ChunkMap,
    config: &StreamConfig,
    pos: ChunkPos,
) -> ChunkAnalysis {
    if pos.is_over_limit() {
        return ChunkAnalysis::NotInView;
    }
    let wanted = WantedSend::chunk(pos);
    if transfers.is_sending(&wanted) {
        return ChunkAnalysis::AlreadySent;
    }

    let d = cycle.focus.ring_distance(pos);
    if d >= fov_limit_activation_distance {
        if !chunk_in_sight(pos, cycle.camera, cycle.camera_dir, cycle.fov, cycle.range) {
            return ChunkAnalysis::NotInView;
        }
    } else if pos.center().distance(cycle.camera) > cycle.range {
        return ChunkAnalysis::NotInView;
    }

    if transfers.is_sent(&wanted) && !transfers.is_modified(&wanted) {
        return ChunkAnalysis::AlreadySent;
    }

    let chunk = map.get(pos);
    let optimize = d >= config.optimize_distance;
    if optimize && chunk.is_some_and(|c| c.generated && c.sky_only) {
        return ChunkAnalysis::NotInView;
    }
    if config.occlusion_culling_enabled && optimize && map.is_occluded(pos, cycle.focus_eye) {
        tracing::trace!(%pos, "occluded");
        return ChunkAnalysis::NotInView;
    }

    match chunk {
        None => ChunkAnalysis::InViewButNotLoaded,
        Some(c) if c.dummy || !c.generated => ChunkAnalysis::InViewButNotGenerated,
        Some(_) => ChunkAnalysis::InViewAndLoaded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use rand::Rng;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;
    use voxstream_kernel::Chunk;

    /// Records requests; accepts up to `capacity` per tick.
    #[derive(Default)]
    struct ScriptedQueue {
        capacity: usize,
        accepted_this_tick: usize,
        rejected: usize,
        requests: Vec<(ChunkPos, EmergeFlags, Sender<EmergeCompletion>)>,
    }

    impl EmergeQueue for ScriptedQueue {
        fn enqueue(
            &mut self,
            pos: ChunkPos,
            _requester: PeerId,
            flags: EmergeFlags,
            reply: Sender<EmergeCompletion>,
        ) -> bool {
            if self.accepted_this_tick >= self.capacity {
                self.rejected += 1;
                return false;
            }
            self.accepted_this_tick += 1;
            self.requests.push((pos, flags, reply));
            true
        }
    }

    struct Harness {
        config: StreamConfig,
        view: ObserverView,
        transfers: TransferState,
        autosend: Autosend,
        map: ChunkMap,
        queue: ScriptedQueue,
    }

    impl Harness {
        fn new(config: StreamConfig, map: ChunkMap) -> Self {
            Self {
                autosend: Autosend::new(&config),
                config,
                view: ObserverView::at(ChunkPos::ORIGIN.center()),
                transfers: TransferState::new(),
                map,
                queue: ScriptedQueue {
                    capacity: usize::MAX,
                    ..ScriptedQueue::default()
                },
            }
        }

        fn tick(&mut self, dtime: f32) -> Option<ChunkSendRequest> {
            self.queue.accepted_this_tick = 0;
            self.transfers.step(dtime);
            self.autosend.cycle(dtime, &self.view, &self.transfers, &self.config);
            let next = self.autosend.next_suggestion(
                PeerId(1),
                &self.transfers,
                &self.map,
                &mut self.queue,
                &self.config,
            );
            if let Some(request) = next {
                self.transfers.transfer_started(request.wanted);
            }
            next
        }

        fn mark_sent(&mut self, pos: ChunkPos) {
            let wanted = WantedSend::chunk(pos);
            self.transfers.transfer_started(wanted);
            self.transfers.transfer_finished(wanted);
        }

        fn mark_sent_within(&mut self, radius: i32) {
            for x in -radius..=radius {
                for y in -radius..=radius {
                    for z in -radius..=radius {
                        self.mark_sent(ChunkPos::new(x, y, z));
                    }
                }
            }
        }

        fn finish_all(&mut self) {
            let sending: Vec<WantedSend> = self.transfers.sending().copied().collect();
            for wanted in sending {
                self.transfers.transfer_finished(wanted);
            }
        }

        /// Complete every recorded emerge by generating the chunk.
        fn complete_emerges(&mut self) {
            for (pos, _, reply) in self.queue.requests.drain(..) {
                self.map.insert(pos, Chunk::generated(false, false));
                reply
                    .send(EmergeCompletion {
                        pos,
                        outcome: crate::emerge::EmergeOutcome::Generated,
                    })
                    .unwrap();
            }
        }
    }

    fn test_config(radius: i32, budget: usize, fov: f32) -> StreamConfig {
        StreamConfig {
            send_radius: radius,
            generate_radius: radius,
            max_simultaneous_transfers: budget,
            fov_radians: fov,
            occlusion_culling_enabled: false,
            ..StreamConfig::default()
        }
    }

    fn loaded_map(radius: i32) -> ChunkMap {
        let mut map = ChunkMap::new();
        let r = radius + 1;
        map.fill(ChunkPos::new(-r, -r, -r), ChunkPos::new(r, r, r), Chunk::generated(false, false));
        map
    }

    fn distance(pos: ChunkPos) -> f32 {
        pos.center().distance(ChunkPos::ORIGIN.center())
    }

    #[test]
    fn transfer_cap_shrinks_after_edits() {
        let config = StreamConfig::default();
        assert_eq!(max_simultaneous_transfers(&config, 100.0, 5), 40);
        assert_eq!(max_simultaneous_transfers(&config, 0.5, 5), 1);
        assert_eq!(max_simultaneous_transfers(&config, 0.5, 1), 40);
        assert_eq!(max_simultaneous_transfers(&config, 2.0, 2), 40);
    }

    #[test]
    fn zoom_extends_distance() {
        assert_eq!(adjust_dist(10, 0.0), 10);
        assert_eq!(adjust_dist(10, 1.5), 10);
        assert!(adjust_dist(10, 0.3) > 10);
        assert!(adjust_dist(10, 0.1) > adjust_dist(10, 0.3));
    }

    #[test]
    fn sight_cone() {
        let eye = ChunkPos::ORIGIN.center();
        let range = 10.0 * CHUNK_SIZE as f32;
        assert!(chunk_in_sight(ChunkPos::new(0, 0, 5), eye, Vec3::Z, 1.0, range));
        assert!(!chunk_in_sight(ChunkPos::new(0, 0, -5), eye, Vec3::Z, 1.0, range));
        assert!(!chunk_in_sight(ChunkPos::new(5, 0, 0), eye, Vec3::Z, 1.0, range));
        // Zero FOV keeps only the range test.
        assert!(chunk_in_sight(ChunkPos::new(0, 0, -5), eye, Vec3::Z, 0.0, range));
        assert!(!chunk_in_sight(ChunkPos::new(0, 0, 12), eye, Vec3::Z, 0.0, range));
        // The chunk holding the eye is always in sight.
        assert!(chunk_in_sight(ChunkPos::ORIGIN, eye, Vec3::X, 0.1, range));
    }

    #[test]
    fn search_budget_depends_on_distance() {
        let mut search = Search::new("test");
        search.start(20, 0);
        assert_eq!((search.d_start, search.d_max), (0, 3));
        search.nearest_unsent = 6;
        search.start(20, 0);
        assert_eq!(search.d_max, 8);
        search.nearest_unsent = 12;
        search.start(20, 0);
        assert_eq!(search.d_max, 13);
        search.nearest_unsent = 4;
        search.start(5, 0);
        assert_eq!(search.d_max, 5);
    }

    #[test]
    fn radius_three_budget_eight_sends_nearest_first() {
        let mut h = Harness::new(test_config(3, 8, 0.0), loaded_map(3));

        let mut sent = Vec::new();
        for _ in 0..8 {
            let request = h.tick(0.1).expect("within budget");
            assert_eq!(request.wanted.kind, SuggestionKind::Chunk);
            sent.push(request.wanted.pos);
        }
        assert_eq!(sent[0], ChunkPos::ORIGIN);
        let distances: Vec<f32> = sent.iter().map(|p| distance(*p)).collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]), "{distances:?}");
        // Origin, the six face neighbours, then an edge neighbour.
        assert!(sent[1..7].iter().all(|p| p.ring_distance(ChunkPos::ORIGIN) == 1));
        assert!((distances[7] - 16.0 * 2f32.sqrt()).abs() < 1e-3);

        // Saturated.
        assert!(h.tick(0.1).is_none());

        h.finish_all();
        let ninth = h.tick(0.1).expect("budget freed");
        assert!(!sent.contains(&ninth.wanted.pos));
        assert!(distance(ninth.wanted.pos) >= distances[7]);
    }

    #[test]
    fn stationary_observer_receives_every_visible_chunk_once() {
        let mut h = Harness::new(test_config(3, 100, DEFAULT_FOV), loaded_map(3));
        let mut counts: HashMap<ChunkPos, usize> = HashMap::new();
        for _ in 0..3000 {
            if let Some(request) = h.tick(0.05) {
                *counts.entry(request.wanted.pos).or_default() += 1;
            }
            h.finish_all();
        }

        assert!(counts.values().all(|&n| n == 1), "a chunk was sent twice");
        assert!(counts.keys().all(|p| p.ring_distance(ChunkPos::ORIGIN) <= 3));
        let range = 3.0 * CHUNK_SIZE as f32;
        for x in -2..=2 {
            for y in -2..=2 {
                for z in -2..=2 {
                    let p = ChunkPos::new(x, y, z);
                    if distance(p) <= range {
                        assert!(counts.contains_key(&p), "{p} never sent");
                    }
                }
            }
        }
        // Straight ahead at the edge of the radius.
        assert!(counts.contains_key(&ChunkPos::new(0, 0, 3)));
    }

    #[test]
    fn never_suggests_beyond_budget() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        for _ in 0..200 {
            let budget = rng.gen_range(1..6usize);
            let in_flight = rng.gen_range(0..8usize);
            let mut h = Harness::new(test_config(3, budget, 0.0), loaded_map(3));
            if rng.gen_bool(0.5) {
                h.transfers.note_world_edit();
            }
            for n in 0..in_flight {
                h.transfers
                    .transfer_started(WantedSend::chunk(ChunkPos::new(100 + n as i32, 0, 0)));
            }
            for _ in 0..5 {
                let before = h.transfers.sending_count();
                if let Some(request) = h.tick(0.01) {
                    let d = request.wanted.pos.ring_distance(ChunkPos::ORIGIN);
                    let cap = max_simultaneous_transfers(&h.config, h.transfers.time_from_building(), d);
                    assert!(before < cap, "suggested with {before} in flight, cap {cap}");
                    assert!(before < budget);
                }
            }
        }
    }

    #[test]
    fn post_edit_cooldown_limits_distant_sends() {
        let mut h = Harness::new(test_config(3, 40, 0.0), loaded_map(3));
        h.transfers.note_world_edit();

        let mut near = 0;
        while let Some(request) = h.tick(0.01) {
            assert!(request.wanted.pos.ring_distance(ChunkPos::ORIGIN) <= 1);
            near += 1;
        }
        assert_eq!(near, 27);

        // Once the cooldown has passed the search moves on.
        let mut reached_ring_two = false;
        for _ in 0..300 {
            if let Some(request) = h.tick(0.01) {
                assert!(h.transfers.time_from_building() >= 2.0);
                reached_ring_two |= request.wanted.pos.ring_distance(ChunkPos::ORIGIN) == 2;
            }
        }
        assert!(reached_ring_two);
    }

    #[test]
    fn missing_chunks_are_emerged_with_generation_inside_generate_radius() {
        let config = StreamConfig {
            generate_radius: 1,
            ..test_config(3, 40, 0.0)
        };
        let mut h = Harness::new(config, ChunkMap::new());
        for _ in 0..4 {
            assert!(h.tick(0.1).is_none());
        }
        assert!(!h.queue.requests.is_empty());
        for (pos, flags, _) in &h.queue.requests {
            let d = pos.ring_distance(ChunkPos::ORIGIN);
            assert_eq!(flags.allow_generate, d <= 1, "{pos}");
        }
    }

    #[test]
    fn dummy_chunks_outside_generate_radius_are_skipped() {
        let config = StreamConfig {
            generate_radius: 0,
            ..test_config(2, 40, 0.0)
        };
        let mut map = ChunkMap::new();
        map.fill(ChunkPos::new(-3, -3, -3), ChunkPos::new(3, 3, 3), Chunk::dummy());
        let mut h = Harness::new(config, map);
        for _ in 0..10 {
            assert!(h.tick(0.1).is_none());
        }
        // Only the focus chunk may be generated.
        assert!(h.queue.requests.iter().all(|(pos, flags, _)| *pos == ChunkPos::ORIGIN && flags.allow_generate));
    }

    #[test]
    fn resumes_after_queue_full_without_skipping() {
        let mut h = Harness::new(test_config(2, 100, 0.0), ChunkMap::new());
        h.queue.capacity = 3;

        let mut sent = HashSet::new();
        for _ in 0..3000 {
            if let Some(request) = h.tick(0.05) {
                assert!(sent.insert(request.wanted.pos), "sent twice");
            }
            h.finish_all();
            h.complete_emerges();
        }
        assert!(h.queue.rejected > 0);

        let range = 2.0 * CHUNK_SIZE as f32;
        for x in -2..=2 {
            for y in -2..=2 {
                for z in -2..=2 {
                    let p = ChunkPos::new(x, y, z);
                    if distance(p) <= range {
                        assert!(sent.contains(&p), "{p} skipped");
                    }
                }
            }
        }
    }

    #[test]
    fn finished_emerges_are_suggested_first() {
        let mut h = Harness::new(test_config(2, 100, 0.0), ChunkMap::new());
        assert!(h.tick(0.1).is_none());
        let (pos, _, reply) = h.queue.requests.remove(0);
        h.map.insert(pos, Chunk::generated(false, false));
        reply
            .send(EmergeCompletion {
                pos,
                outcome: crate::emerge::EmergeOutcome::FromDisk,
            })
            .unwrap();
        assert_eq!(h.tick(0.1).map(|r| r.wanted.pos), Some(pos));
    }

    #[test]
    fn modified_chunk_is_sent_again_after_reset() {
        let mut h = Harness::new(test_config(1, 100, 0.0), loaded_map(1));
        let mut first = 0;
        for _ in 0..200 {
            if h.tick(0.05).is_some() {
                first += 1;
            }
            h.finish_all();
        }
        assert!(first > 0);
        assert!(h.transfers.is_sent(&WantedSend::chunk(ChunkPos::ORIGIN)));

        assert!(h.transfers.set_not_sent(WantedSend::chunk(ChunkPos::ORIGIN)));
        h.autosend.reset_search_radius(ChunkPos::ORIGIN, h.view.eye);
        let mut again = None;
        for _ in 0..5 {
            if let Some(request) = h.tick(0.1) {
                again = Some(request.wanted.pos);
                break;
            }
        }
        assert_eq!(again, Some(ChunkPos::ORIGIN));
    }

    #[test]
    fn far_search_suggests_coarse_cells() {
        let mut h = Harness::new(test_config(3, 100, 0.0), ChunkMap::new());
        h.autosend.set_radius(0, 2);
        let request = h.tick(0.1).expect("far cell");
        assert_eq!(request.wanted.kind, SuggestionKind::FarChunk);
        assert_eq!(request.wanted.pos, ChunkPos::ORIGIN);
        assert!(h.queue.requests.is_empty());
    }

    #[test]
    fn zero_radius_disables() {
        let mut h = Harness::new(test_config(3, 100, 0.0), loaded_map(3));
        h.autosend.set_radius(0, 0);
        assert!(h.tick(0.1).is_none());
        assert!(!h.autosend.is_active());
    }

    #[test]
    fn moving_focus_resets_search() {
        let mut h = Harness::new(test_config(4, 100, 0.0), loaded_map(6));
        for _ in 0..20 {
            h.tick(0.05);
            h.finish_all();
        }
        assert!(h.autosend.nearest_unsent() > 0);
        // Fast enough to shift the focus one chunk ahead.
        h.view.velocity = Vec3::new(0.0, 0.0, 5.0);
        h.tick(0.05);
        let next = h.tick(0.05).expect("new focus has unsent chunks");
        assert!(next.wanted.pos.ring_distance(ChunkPos::new(0, 0, 1)) <= 1);
        assert!(h.autosend.describe_status().contains("chunk.nearest_unsent_d="));
    }

    #[test]
    fn turning_the_camera_restarts_the_search() {
        let mut h = Harness::new(test_config(6, 1000, 0.0), loaded_map(6));
        h.mark_sent_within(3);
        assert!(h.tick(0.05).is_none());
        let request = h.tick(0.05).expect("ring 4 is unsent");
        assert_eq!(request.wanted.pos.ring_distance(ChunkPos::ORIGIN), 4);
        assert_eq!(h.autosend.map.d_start, 4);

        // A small turn keeps the progress.
        h.view.camera_dir = Vec3::new(0.3, 0.0, 1.0).normalize();
        h.tick(0.05);
        assert_eq!(h.autosend.map.d_start, 4);

        h.view.camera_dir = Vec3::NEG_Z;
        assert!(h.tick(0.05).is_none());
        assert_eq!(h.autosend.map.d_start, 0);
    }

    #[test]
    fn search_restarts_every_twenty_seconds() {
        let mut h = Harness::new(test_config(6, 1000, 0.0), loaded_map(6));
        h.mark_sent_within(3);
        assert!(h.tick(0.05).is_none());
        assert!(h.tick(19.0).is_some());
        assert_eq!(h.autosend.map.d_start, 4);

        assert!(h.tick(1.0).is_none());
        assert_eq!(h.autosend.map.d_start, 0);
        assert!(h.autosend.reset_timer < 1.0);

        // Only once per period.
        h.tick(0.05);
        assert_eq!(h.autosend.map.d_start, 4);
    }

    #[test]
    fn fov_limit_drops_after_three_idle_seconds() {
        let mut map = loaded_map(5);
        let missing = ChunkPos::new(0, 0, 1);
        map.unload(missing);
        let mut h = Harness::new(test_config(5, 1000, DEFAULT_FOV), map);
        // Everything the cone can see is already there; only chunks behind
        // the observer are left.
        for x in -5..=5 {
            for y in -5..=5 {
                for z in -1..=5 {
                    let pos = ChunkPos::new(x, y, z);
                    if pos != missing {
                        h.mark_sent(pos);
                    }
                }
            }
        }

        let mut first = None;
        for n in 0..60 {
            if n == 20 {
                assert!(h.autosend.fov_limit_enabled());
                assert_eq!(h.autosend.nearest_unsent(), 1, "pending emerge holds the search");
            }
            if let Some(request) = h.tick(0.1) {
                first = Some((n, request));
                break;
            }
        }
        let (n, request) = first.expect("chunks behind the observer are sent eventually");
        assert!(n >= 29, "sent at tick {n}, before three idle seconds");
        assert!(!h.autosend.fov_limit_enabled());
        assert!(request.wanted.pos.z <= -2);
        assert!(h.queue.requests.iter().all(|(pos, _, _)| *pos == missing));
    }

    #[test]
    fn far_radius_is_capped_by_the_server() {
        let config = StreamConfig {
            far_send_radius: 2,
            ..test_config(3, 1000, 0.0)
        };
        let mut h = Harness::new(config, ChunkMap::new());
        h.autosend.set_radius(0, 1_000_000);
        assert_eq!(h.autosend.radius(), (0, 1_000_000));

        for _ in 0..400 {
            if let Some(request) = h.tick(0.05) {
                assert_eq!(request.wanted.kind, SuggestionKind::FarChunk);
                assert!(request.wanted.pos.ring_distance(ChunkPos::ORIGIN) <= 2);
            }
            h.finish_all();
            assert!(h.autosend.far.max_send_distance <= 2);
        }
        assert!(h.autosend.rings.cached() <= 4);
        assert!(h.transfers.is_sent(&WantedSend::far(ChunkPos::new(-2, 0, 0))));
    }
}

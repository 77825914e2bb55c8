//! Streaming: per-observer chunk scheduling, emerge queue, transfer budgets.
//!
//! # Invariants
//! - An observer never has more transfers in flight than its current cap
//!   allows; the budget is the only flow control.
//! - Worker threads never touch scheduler or map state; their results are
//!   applied on the owning thread.
//! - A chunk sent and not invalidated since is never suggested again.

mod autosend;
mod config;
mod emerge;
mod priority;
mod ring;
mod server;
mod session;
mod stats;

pub use autosend::{
    Autosend, CHUNK_MAX_RADIUS, ChunkAnalysis, DEFAULT_FOV, adjust_dist, chunk_in_sight,
    max_simultaneous_transfers,
};
pub use config::{ConfigError, StreamConfig};
pub use emerge::{
    EmergeCompletion, EmergeError, EmergeFlags, EmergeManager, EmergeOutcome, EmergeQueue,
};
pub use priority::{ChunkSendRequest, SendPriority, SuggestionKind, WantedSend, far_cell_center};
pub use ring::RingCache;
pub use server::{EYE_HEIGHT, StreamServer};
pub use session::{ObjectDelta, ObserverSession, ObserverView, TransferState};
pub use stats::{StepHistory, StepSample, StreamStats};

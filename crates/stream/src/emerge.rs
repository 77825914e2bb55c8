use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use voxstream_common::{ChunkPos, PeerId};
use voxstream_kernel::{Chunk, ChunkMap, ChunkProvider};

use crate::config::StreamConfig;

/// Errors from starting the emerge worker pool.
#[derive(Debug, thiserror::Error)]
pub enum EmergeError {
    #[error("failed to spawn emerge worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("emerge pool needs at least one worker")]
    NoWorkers,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmergeFlags {
    /// Run terrain generation if the chunk is not in storage.
    pub allow_generate: bool,
}

/// How a chunk request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergeOutcome {
    /// Already generated in memory when the result was applied.
    FromMemory,
    FromDisk,
    Generated,
    /// Absent from storage and generation was not allowed. A dummy chunk is
    /// stored so the position is not requested again without generation.
    Cancelled,
}

impl EmergeOutcome {
    /// Whether the chunk is now usable by the scheduler.
    pub fn is_available(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Delivered to every requester once a chunk request is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergeCompletion {
    pub pos: ChunkPos,
    pub outcome: EmergeOutcome,
}

/// Asynchronous chunk load/generate queue.
///
/// `enqueue` returns `false` when the queue is full; the caller should stop
/// asking for this tick. Requests are keyed by position, not by requester.
pub trait EmergeQueue {
    fn enqueue(
        &mut self,
        pos: ChunkPos,
        requester: PeerId,
        flags: EmergeFlags,
        reply: Sender<EmergeCompletion>,
    ) -> bool;
}

struct EmergeJob {
    pos: ChunkPos,
    allow_generate: bool,
}

struct EmergeResult {
    pos: ChunkPos,
    outcome: EmergeOutcome,
    chunk: Option<Chunk>,
}

struct PendingEmerge {
    allow_generate: bool,
    waiters: Vec<(PeerId, Sender<EmergeCompletion>)>,
}

/// Worker pool loading and generating chunks off the simulation thread.
///
/// Workers only talk to the [`ChunkProvider`]. Results come back over a
/// channel and are applied to the [`ChunkMap`] by [`Self::process_results`]
/// on the thread that owns the map.
pub struct EmergeManager {
    jobs: Option<Sender<EmergeJob>>,
    results: Receiver<EmergeResult>,
    pending: HashMap<ChunkPos, PendingEmerge>,
    workers: Vec<JoinHandle<()>>,
    queue_limit: usize,
}

impl EmergeManager {
    pub fn new(
        provider: Arc<dyn ChunkProvider>,
        worker_count: usize,
        queue_limit: usize,
    ) -> Result<Self, EmergeError> {
        if worker_count == 0 {
            return Err(EmergeError::NoWorkers);
        }
        let (tx_job, rx_job) = bounded::<EmergeJob>(queue_limit.max(1));
        let (tx_done, rx_done) = unbounded::<EmergeResult>();

        let mut workers = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let provider = provider.clone();
            let rx_job = rx_job.clone();
            let tx_done = tx_done.clone();
            let handle = std::thread::Builder::new()
                .name(format!("emerge-{n}"))
                .spawn(move || run_worker(provider.as_ref(), rx_job, tx_done))?;
            workers.push(handle);
        }
        tracing::debug!(worker_count, queue_limit, "emerge pool started");

        Ok(Self {
            jobs: Some(tx_job),
            results: rx_done,
            pending: HashMap::new(),
            workers,
            queue_limit,
        })
    }

    pub fn from_config(
        provider: Arc<dyn ChunkProvider>,
        config: &StreamConfig,
    ) -> Result<Self, EmergeError> {
        Self::new(provider, config.emerge_workers, config.emerge_queue_limit)
    }

    /// Requests queued or running.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, pos: ChunkPos) -> bool {
        self.pending.contains_key(&pos)
    }

    pub fn queue_limit(&self) -> usize {
        self.queue_limit
    }

    /// Apply finished requests to `map` and notify their requesters.
    /// Returns how many requests completed.
    pub fn process_results(&mut self, map: &mut ChunkMap) -> usize {
        let mut completed = 0;
        for result in self.results.try_iter() {
            let pos = result.pos;
            let outcome = match (result.outcome, result.chunk) {
                _ if map.get(pos).is_some_and(|c| c.generated) => EmergeOutcome::FromMemory,
                (EmergeOutcome::Cancelled, _) | (_, None) => {
                    map.insert(pos, Chunk::dummy());
                    EmergeOutcome::Cancelled
                }
                (outcome, Some(chunk)) => {
                    map.insert(pos, chunk);
                    outcome
                }
            };
            tracing::trace!(%pos, ?outcome, "emerge finished");

            if let Some(pending) = self.pending.remove(&pos) {
                for (peer, reply) in pending.waiters {
                    if reply.send(EmergeCompletion { pos, outcome }).is_err() {
                        tracing::trace!(%peer, %pos, "emerge requester went away");
                    }
                }
            }
            completed += 1;
        }
        completed
    }
}

impl EmergeQueue for EmergeManager {
    fn enqueue(
        &mut self,
        pos: ChunkPos,
        requester: PeerId,
        flags: EmergeFlags,
        reply: Sender<EmergeCompletion>,
    ) -> bool {
        if let Some(pending) = self.pending.get_mut(&pos) {
            if flags.allow_generate && !pending.allow_generate {
                tracing::trace!(%pos, "already queued without generation");
            }
            pending.waiters.push((requester, reply));
            return true;
        }
        if self.pending.len() >= self.queue_limit {
            return false;
        }
        let Some(jobs) = &self.jobs else {
            return false;
        };
        let job = EmergeJob {
            pos,
            allow_generate: flags.allow_generate,
        };
        match jobs.try_send(job) {
            Ok(()) => {
                self.pending.insert(
                    pos,
                    PendingEmerge {
                        allow_generate: flags.allow_generate,
                        waiters: vec![(requester, reply)],
                    },
                );
                true
            }
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!(%pos, "emerge workers are gone");
                false
            }
        }
    }
}

impl Drop for EmergeManager {
    fn drop(&mut self) {
        // Closing the job channel ends every worker loop.
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("emerge worker panicked");
            }
        }
    }
}

fn run_worker(provider: &dyn ChunkProvider, rx_job: Receiver<EmergeJob>, tx_done: Sender<EmergeResult>) {
    while let Ok(job) = rx_job.recv() {
        let pos = job.pos;
        let (outcome, chunk) = match provider.load(pos) {
            Some(chunk) if chunk.generated => (EmergeOutcome::FromDisk, Some(chunk)),
            _ if job.allow_generate => (EmergeOutcome::Generated, Some(provider.generate(pos))),
            Some(chunk) => (EmergeOutcome::FromDisk, Some(chunk)),
            None => (EmergeOutcome::Cancelled, None),
        };
        if tx_done.send(EmergeResult { pos, outcome, chunk }).is_err() {
            break;
        }
    }
}

use std::collections::VecDeque;
use std::time::Duration;

/// Per-tick streaming statistics for instrumentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub observers: usize,
    pub suggestions_this_tick: usize,
    /// Transfers in flight across all observers.
    pub in_flight: usize,
    /// Chunks and far cells held by observers.
    pub sent_total: usize,
    /// Observers whose search was idle or saturated this tick.
    pub idle_observers: usize,
    pub tick_time: Duration,
}

/// One scheduler pass over every observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSample {
    pub duration: Duration,
    pub observers: usize,
    pub suggestions: usize,
}

/// Sliding window of recent scheduler passes, used to see how scheduling
/// cost scales with the number of observers.
#[derive(Debug)]
pub struct StepHistory {
    samples: VecDeque<StepSample>,
    window: usize,
}

impl StepHistory {
    /// Keeps the last `window` passes (at least one).
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn push(&mut self, sample: StepSample) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<StepSample> {
        self.samples.back().copied()
    }

    /// The most expensive pass in the window.
    pub fn slowest(&self) -> Option<StepSample> {
        self.samples.iter().copied().max_by_key(|s| s.duration)
    }

    /// Mean wall time of a pass.
    pub fn mean_step(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.total_duration() / self.samples.len() as u32
    }

    /// Mean cost of one observer's cycle. Passes without observers only
    /// count towards the time, so their overhead is not hidden.
    pub fn per_observer_cost(&self) -> Duration {
        let observers: usize = self.samples.iter().map(|s| s.observers).sum();
        if observers == 0 {
            return Duration::ZERO;
        }
        self.total_duration() / observers as u32
    }

    /// Suggestions handed out per observer cycle, between 0 and 1.
    pub fn suggestion_rate(&self) -> f32 {
        let observers: usize = self.samples.iter().map(|s| s.observers).sum();
        if observers == 0 {
            return 0.0;
        }
        let suggestions: usize = self.samples.iter().map(|s| s.suggestions).sum();
        suggestions as f32 / observers as f32
    }

    fn total_duration(&self) -> Duration {
        self.samples.iter().map(|s| s.duration).sum()
    }
}

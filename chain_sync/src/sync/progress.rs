use containers::BlockNumber;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::types::DataKind;

/// Consistent copy of a feed's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub kind: DataKind,
    pub start: BlockNumber,
    /// `None` until the first `reset`.
    pub total: Option<u64>,
    pub done: u64,
    pub queued: u64,
    pub ended: bool,
    /// Bumped on every `reset`, so rate samples from a previous range are
    /// never compared against the new one.
    pub generation: u64,
    pub updated_at: Instant,
}

impl ProgressSnapshot {
    pub fn is_initialized(&self) -> bool {
        self.total.is_some()
    }

    /// Completed fraction in percent, if the total is known.
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some(self.done as f64 * 100.0 / total as f64),
            None => None,
        }
    }
}

#[derive(Debug)]
struct ProgressState {
    start: BlockNumber,
    total: Option<u64>,
    done: u64,
    queued: u64,
    ended: bool,
    generation: u64,
    updated_at: Instant,
}

/// Progress counters of one feed.
///
/// Written by the feed task only; read by the report through
/// [`FeedProgress::snapshot`].
#[derive(Debug)]
pub struct FeedProgress {
    kind: DataKind,
    state: Mutex<ProgressState>,
}

impl FeedProgress {
    pub fn new(kind: DataKind) -> Self {
        Self {
            kind,
            state: Mutex::new(ProgressState {
                start: 0,
                total: None,
                done: 0,
                queued: 0,
                ended: false,
                generation: 0,
                updated_at: Instant::now(),
            }),
        }
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    /// Start tracking the half-open range `[from, to)`.
    pub fn reset(&self, from: BlockNumber, to: BlockNumber) {
        let mut state = self.state.lock();
        state.start = from;
        state.total = Some(to.saturating_sub(from));
        state.done = 0;
        state.queued = 0;
        state.ended = false;
        state.generation += 1;
        state.updated_at = Instant::now();
    }

    /// Grow the total; used by feeds whose size is discovered while running.
    pub fn add_total(&self, count: u64) {
        let mut state = self.state.lock();
        state.total = Some(state.total.unwrap_or(0) + count);
        state.updated_at = Instant::now();
    }

    pub fn add_queued(&self, count: u64) {
        let mut state = self.state.lock();
        state.queued += count;
        state.updated_at = Instant::now();
    }

    pub fn remove_queued(&self, count: u64) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(count);
        state.updated_at = Instant::now();
    }

    pub fn clear_queued(&self) {
        let mut state = self.state.lock();
        state.queued = 0;
        state.updated_at = Instant::now();
    }

    /// Count persisted items. `done` never exceeds `total`.
    pub fn add_done(&self, count: u64) {
        let mut state = self.state.lock();
        let done = state.done + count;
        state.done = match state.total {
            Some(total) => done.min(total),
            None => done,
        };
        state.updated_at = Instant::now();
    }

    pub fn mark_end(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        state.queued = 0;
        if let Some(total) = state.total {
            state.done = total;
        }
        state.updated_at = Instant::now();
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().total.is_some()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        ProgressSnapshot {
            kind: self.kind,
            start: state.start,
            total: state.total,
            done: state.done,
            queued: state.queued,
            ended: state.ended,
            generation: state.generation,
            updated_at: state.updated_at,
        }
    }
}

/// Lifetime counters for one loop.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct LoopStats {
    pub iterations: u64,
    pub macrotasks_run: u64,
    pub microtasks_run: u64,
    pub timers_fired: u64,
    pub cancellations: u64,
    pub failures: u64,
    pub remote_received: u64,
}

/// Work still waiting in the loop at the moment of the snapshot.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PendingWork {
    pub macrotasks: usize,
    pub microtasks: usize,
    pub timers: usize,
}

impl PendingWork {
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.macrotasks + self.microtasks + self.timers
    }
}

/// What a single `run_*` call got done.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Iterations that ran at least one task.
    pub iterations: u64,
    pub tasks_run: u64,
}

impl RunSummary {
    pub(crate) fn record(&mut self, tasks: u64) {
        self.iterations += 1;
        self.tasks_run += tasks;
    }
}

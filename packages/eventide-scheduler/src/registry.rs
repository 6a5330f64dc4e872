use crate::queue::QueueKey;
use crate::task::TaskId;
use crate::timer::TimerKey;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Where a cancellable unit currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Waiting in the macrotask queue.
    Queued(QueueKey),
    /// Owned by the timer heap. Firings already handed to the macrotask
    /// queue are tracked alongside, so cancelling reaches them too.
    Timer {
        key: TimerKey,
        firings: SmallVec<[QueueKey; 2]>,
    },
}

impl Slot {
    pub fn timer(key: TimerKey) -> Self {
        Slot::Timer {
            key,
            firings: SmallVec::new(),
        }
    }
}

/// Live-handle bookkeeping. An id absent from the registry has either run to
/// completion or been cancelled.
#[derive(Default)]
pub struct CancellationRegistry {
    slots: FxHashMap<TaskId, Slot>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: TaskId, slot: Slot) {
        self.slots.insert(id, slot);
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Slot> {
        self.slots.get_mut(&id)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Slot> {
        self.slots.remove(&id)
    }

    /// Records that a timer firing now waits in the macrotask queue under
    /// `queued`.
    pub fn add_firing(&mut self, id: TaskId, queued: QueueKey) {
        if let Some(Slot::Timer { firings, .. }) = self.slots.get_mut(&id) {
            firings.push(queued);
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

use crate::error::{IntoTaskResult, TaskResult};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a unit of work within one loop. Allocated in increasing order,
/// never reused, and never consulted for scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) struct TaskIdAllocator {
    next: Cell<u64>,
}

impl TaskIdAllocator {
    pub(crate) fn new() -> Self {
        Self { next: Cell::new(1) }
    }

    pub(crate) fn next(&self) -> TaskId {
        let id = self.next.get();
        self.next.set(id + 1);
        TaskId(id)
    }
}

/// Where a callable came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TaskOrigin {
    Micro,
    Macro,
    Timer,
    /// Submitted from another thread through a [`LoopHandle`](crate::LoopHandle).
    Remote,
}

impl fmt::Display for TaskOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskOrigin::Micro => "microtask",
            TaskOrigin::Macro => "macrotask",
            TaskOrigin::Timer => "timer",
            TaskOrigin::Remote => "remote",
        };
        f.write_str(name)
    }
}

/// A single deferred unit of work, consumed exactly once.
pub struct Callable {
    id: TaskId,
    origin: TaskOrigin,
    invoke: Box<dyn FnOnce() -> TaskResult>,
}

impl Callable {
    pub(crate) fn new<F, R>(id: TaskId, origin: TaskOrigin, f: F) -> Self
    where
        F: FnOnce() -> R + 'static,
        R: IntoTaskResult,
    {
        Self::from_boxed(id, origin, Box::new(move || f().into_task_result()))
    }

    pub(crate) fn from_boxed(
        id: TaskId,
        origin: TaskOrigin,
        invoke: Box<dyn FnOnce() -> TaskResult>,
    ) -> Self {
        Self { id, origin, invoke }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn origin(&self) -> TaskOrigin {
        self.origin
    }

    /// Runs the task. A panic inside the closure unwinds out of this call;
    /// the event loop is the boundary that catches it.
    pub fn invoke(self) -> TaskResult {
        (self.invoke)()
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LoopId(u64);

impl LoopId {
    pub(crate) fn next() -> Self {
        LoopId(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Token returned by the scheduling calls that can be undone.
///
/// A handle is bound to the loop that issued it; presenting it to a different
/// loop cancels nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancellationHandle {
    owner: LoopId,
    id: TaskId,
}

impl CancellationHandle {
    pub(crate) fn new(owner: LoopId, id: TaskId) -> Self {
        Self { owner, id }
    }

    pub(crate) fn owner(&self) -> LoopId {
        self.owner
    }

    pub fn id(&self) -> TaskId {
        self.id
    }
}

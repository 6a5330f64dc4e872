//! Single-threaded cooperative event loop.
//!
//! Work comes in three flavours:
//!
//! - **microtasks**, drained to empty after every macrotask (including the
//!   ones queued during the drain itself),
//! - **macrotasks**, run one per iteration in FIFO order,
//! - **timers**, which move into the macrotask queue once their deadline has
//!   passed, earliest deadline first.
//!
//! ```
//! use eventide_scheduler::{EventLoop, ManualClock};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! let clock = ManualClock::new();
//! let event_loop = Rc::new(EventLoop::with_clock(clock.clone()));
//! let log = Rc::new(RefCell::new(Vec::new()));
//!
//! let (l, el) = (log.clone(), event_loop.clone());
//! event_loop
//!     .schedule_macrotask(move || {
//!         l.borrow_mut().push("task");
//!         let l = l.clone();
//!         el.schedule_microtask(move || l.borrow_mut().push("microtask"))
//!     })
//!     .unwrap();
//! let l = log.clone();
//! event_loop
//!     .set_timeout(Duration::from_millis(10), move || l.borrow_mut().push("timer"))
//!     .unwrap();
//!
//! event_loop.run_until_idle().unwrap();
//! assert_eq!(*log.borrow(), vec!["task", "microtask", "timer"]);
//! ```
//!
//! Tasks that capture an `Rc<EventLoop>` form a reference cycle while they
//! are queued. Calling [`EventLoop::stop`] drops all pending work and breaks
//! those cycles; long-lived recurring timers should capture a `Weak` instead.

pub mod clock;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod stats;
pub mod task;
pub mod timer;

use std::time::{Duration, Instant};

/// The scheduling surface hosts program against.
/// Lets embedders stay generic over the loop they are handed (a real loop, or
/// a recording double in their own tests).
pub trait Scheduler {
    /// Schedule a microtask (highest priority, runs before the next macrotask).
    fn schedule_microtask(&self, task: Box<dyn FnOnce() -> TaskResult>) -> Result<(), SchedulerError>;

    /// Schedule a macrotask behind every macrotask already queued.
    fn schedule_macrotask(
        &self,
        task: Box<dyn FnOnce() -> TaskResult>,
    ) -> Result<CancellationHandle, SchedulerError>;

    /// Arm a timer firing after `delay`, then every `recurring` if given.
    fn set_timer(
        &self,
        delay: Duration,
        task: Box<dyn FnMut() -> TaskResult>,
        recurring: Option<Duration>,
    ) -> Result<CancellationHandle, SchedulerError>;

    /// Withdraw pending work. Idempotent.
    fn cancel(&self, handle: CancellationHandle) -> bool;

    /// Current reading of the monotonic clock.
    fn now(&self) -> Instant;
}

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LoopBuilder, LoopConfig};
pub use error::{CallableError, FailureCause, IntoTaskResult, SchedulerError, TaskResult};
pub use event_loop::{EventLoop, LoopState};
pub use remote::LoopHandle;
pub use stats::{LoopStats, PendingWork, RunSummary};
pub use task::{Callable, CancellationHandle, TaskId, TaskOrigin};

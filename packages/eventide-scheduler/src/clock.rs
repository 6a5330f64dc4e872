use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic time source consulted by the loop.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Called when the loop has nothing to run before `deadline`.
    ///
    /// Returns how long the loop should actually block. Simulated clocks jump
    /// straight to `deadline` and return zero.
    fn advance_toward(&self, deadline: Instant) -> Duration;
}

/// Wall-clock time from [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn advance_toward(&self, deadline: Instant) -> Duration {
        deadline.saturating_duration_since(Instant::now())
    }
}

/// Simulated time for deterministic tests. Clones share the same reading, so
/// a test can keep one clone and hand another to the loop.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let origin = Instant::now();
        Self {
            origin,
            now: Rc::new(Cell::new(origin)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    /// Moves the clock to `to`. Never moves backwards.
    pub fn set(&self, to: Instant) {
        if to > self.now.get() {
            self.now.set(to);
        }
    }

    /// Simulated time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.now.get() - self.origin
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn advance_toward(&self, deadline: Instant) -> Duration {
        self.set(deadline);
        Duration::ZERO
    }
}

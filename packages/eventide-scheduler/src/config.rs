use crate::clock::{Clock, SystemClock};
use crate::event_loop::EventLoop;
use std::time::Duration;

/// Construction-time settings for an [`EventLoop`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialize",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct LoopConfig {
    /// Label attached to the loop's tracing spans.
    pub name: String,
    /// Recurring intervals shorter than this are raised to it.
    pub min_interval: Duration,
    /// How many task failures are kept when no error hook is installed.
    pub diagnostics_limit: usize,
    /// Pre-allocated capacity of each task queue.
    pub initial_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: "eventide".to_string(),
            min_interval: Duration::from_millis(1),
            diagnostics_limit: 1024,
            initial_capacity: 64,
        }
    }
}

pub struct LoopBuilder {
    config: LoopConfig,
    clock: Option<Box<dyn Clock>>,
}

impl LoopBuilder {
    pub fn new() -> Self {
        Self {
            config: LoopConfig::default(),
            clock: None,
        }
    }

    /// Replaces every setting at once, e.g. with a deserialized config.
    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn min_interval(mut self, min_interval: Duration) -> Self {
        self.config.min_interval = min_interval;
        self
    }

    pub fn diagnostics_limit(mut self, limit: usize) -> Self {
        self.config.diagnostics_limit = limit;
        self
    }

    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.config.initial_capacity = capacity;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    pub fn build(self) -> EventLoop {
        let clock = self.clock.unwrap_or_else(|| Box::new(SystemClock));
        EventLoop::with_config(self.config, clock)
    }
}

impl Default for LoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let event_loop = LoopBuilder::new()
            .name("worker")
            .min_interval(Duration::from_millis(5))
            .diagnostics_limit(8)
            .build();

        let config = event_loop.config();
        assert_eq!(config.name, "worker");
        assert_eq!(config.min_interval, Duration::from_millis(5));
        assert_eq!(config.diagnostics_limit, 8);
        assert_eq!(config.initial_capacity, LoopConfig::default().initial_capacity);
    }
}

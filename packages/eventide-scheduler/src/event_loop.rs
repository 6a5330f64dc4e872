use crate::clock::Clock;
use crate::config::{LoopBuilder, LoopConfig};
use crate::error::{
    CallableError, FailureCause, IntoTaskResult, SchedulerError, TaskResult, panic_message,
};
use crate::queue::{MacrotaskQueue, MicrotaskQueue};
use crate::registry::{CancellationRegistry, Slot};
use crate::remote::{Envelope, Inbox, LoopHandle};
use crate::stats::{LoopStats, PendingWork, RunSummary};
use crate::task::{Callable, CancellationHandle, LoopId, TaskIdAllocator, TaskOrigin};
use crate::timer::{TimerCallback, TimerService};
use crate::Scheduler;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    RunningMacrotask,
    DrainingMicrotasks,
    /// Terminal. Entered through `stop()` from any state.
    Stopped,
}

type ErrorHook = Box<dyn FnMut(CallableError, TaskOrigin)>;

/// Result of one loop iteration.
struct Turn {
    ran: u64,
    stopped: bool,
}

/// Single-threaded cooperative event loop.
///
/// Every method takes `&self`, so tasks that need to schedule follow-up work
/// capture an `Rc<EventLoop>` (or a `Weak`) instead of a borrow.
pub struct EventLoop {
    id: LoopId,
    config: LoopConfig,
    clock: Box<dyn Clock>,
    ids: TaskIdAllocator,
    microtasks: MicrotaskQueue,
    macrotasks: MacrotaskQueue,
    timers: RefCell<TimerService>,
    registry: RefCell<CancellationRegistry>,
    inbox: Inbox,
    state: Cell<LoopState>,
    // Set while a run method is on the stack; guards against reentry from tasks.
    running: Cell<bool>,
    torn_down: Cell<bool>,
    error_hook: RefCell<Option<ErrorHook>>,
    diagnostics: RefCell<VecDeque<CallableError>>,
    stats: Cell<LoopStats>,
}

struct RunGuard<'a> {
    running: &'a Cell<bool>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.set(false);
    }
}

impl EventLoop {
    pub fn new() -> Self {
        LoopBuilder::new().build()
    }

    pub fn builder() -> LoopBuilder {
        LoopBuilder::new()
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        LoopBuilder::new().clock(clock).build()
    }

    pub(crate) fn with_config(config: LoopConfig, clock: Box<dyn Clock>) -> Self {
        let capacity = config.initial_capacity;
        Self {
            id: LoopId::next(),
            clock,
            ids: TaskIdAllocator::new(),
            microtasks: MicrotaskQueue::with_capacity(capacity),
            macrotasks: MacrotaskQueue::with_capacity(capacity),
            timers: RefCell::new(TimerService::new()),
            registry: RefCell::new(CancellationRegistry::new()),
            inbox: Inbox::new(),
            state: Cell::new(LoopState::Idle),
            running: Cell::new(false),
            torn_down: Cell::new(false),
            error_hook: RefCell::new(None),
            diagnostics: RefCell::new(VecDeque::new()),
            stats: Cell::new(LoopStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// A `Send` handle other threads can use to feed or stop this loop.
    pub fn handle(&self) -> LoopHandle {
        self.inbox.handle()
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.inbox.is_stopped()
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.get()
    }

    pub fn pending(&self) -> PendingWork {
        PendingWork {
            macrotasks: self.macrotasks.len(),
            microtasks: self.microtasks.len(),
            timers: self.timers.borrow().len(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.pending().is_empty()
    }

    /// Earliest deadline among armed timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow_mut().next_deadline()
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Queues `f` for the next drain point: the drain that follows the current
    /// macrotask, or the drain in progress if called from a microtask.
    pub fn schedule_microtask<F, R>(&self, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() -> R + 'static,
        R: IntoTaskResult,
    {
        self.ensure_accepting()?;
        let id = self.ids.next();
        self.microtasks
            .enqueue(Callable::new(id, TaskOrigin::Micro, f));
        tracing::trace!(task = %id, "microtask scheduled");
        Ok(())
    }

    /// Queues `f` behind every macrotask already waiting. Never runs it
    /// synchronously.
    pub fn schedule_macrotask<F, R>(&self, f: F) -> Result<CancellationHandle, SchedulerError>
    where
        F: FnOnce() -> R + 'static,
        R: IntoTaskResult,
    {
        self.ensure_accepting()?;
        let id = self.ids.next();
        let queued = self
            .macrotasks
            .enqueue(Callable::new(id, TaskOrigin::Macro, f));
        self.registry.borrow_mut().insert(id, Slot::Queued(queued));
        tracing::trace!(task = %id, "macrotask scheduled");
        Ok(CancellationHandle::new(self.id, id))
    }

    /// One-shot timer. A zero delay still waits for a later iteration.
    ///
    /// Fails with [`SchedulerError::DelayOutOfRange`] when `now + delay`
    /// cannot be represented.
    pub fn set_timeout<F, R>(&self, delay: Duration, f: F) -> Result<CancellationHandle, SchedulerError>
    where
        F: FnOnce() -> R + 'static,
        R: IntoTaskResult,
    {
        self.insert_timer(delay, TimerCallback::once(f), None)
    }

    /// Recurring timer firing every `interval`, first at `now + interval`.
    pub fn set_interval<F, R>(
        &self,
        interval: Duration,
        f: F,
    ) -> Result<CancellationHandle, SchedulerError>
    where
        F: FnMut() -> R + 'static,
        R: IntoTaskResult,
    {
        self.set_timer(interval, f, Some(interval))
    }

    /// Fires first at `now + delay`, then every `recurring` after that
    /// deadline if given. The cadence is fixed: each deadline is the previous
    /// deadline plus the interval, whatever time the callback actually ran.
    pub fn set_timer<F, R>(
        &self,
        delay: Duration,
        f: F,
        recurring: Option<Duration>,
    ) -> Result<CancellationHandle, SchedulerError>
    where
        F: FnMut() -> R + 'static,
        R: IntoTaskResult,
    {
        match recurring {
            Some(interval) => self.insert_timer(delay, TimerCallback::repeating(f), Some(interval)),
            None => {
                let mut f = f;
                self.insert_timer(delay, TimerCallback::once(move || f()), None)
            }
        }
    }

    /// Withdraws pending work. Returns `true` if the work had not started and
    /// now never will; `false` for work that already ran, was already
    /// cancelled, or belongs to another loop.
    ///
    /// The withdrawn closure, and anything it captured, is dropped before
    /// this returns.
    pub fn cancel(&self, handle: CancellationHandle) -> bool {
        if handle.owner() != self.id {
            return false;
        }

        let slot = self.registry.borrow_mut().remove(handle.id());
        let mut withdrawn: SmallVec<[Callable; 2]> = SmallVec::new();
        let mut callback = None;
        match slot {
            None => {}
            Some(Slot::Queued(queued)) => withdrawn.extend(self.macrotasks.remove(queued)),
            Some(Slot::Timer { key, firings }) => {
                callback = self.timers.borrow_mut().cancel(key);
                withdrawn.extend(
                    firings
                        .into_iter()
                        .filter_map(|queued| self.macrotasks.remove(queued)),
                );
            }
        }
        let cancelled = callback.is_some() || !withdrawn.is_empty();
        // User state goes here, with no borrow of the loop held.
        drop(callback);
        drop(withdrawn);

        if cancelled {
            self.bump(|stats| stats.cancellations += 1);
        }
        tracing::debug!(task = %handle.id(), cancelled, "cancel requested");
        cancelled
    }

    /// Installs the hook that receives every task failure. Without a hook,
    /// failures are kept for [`take_diagnostics`](Self::take_diagnostics).
    pub fn on_error<F>(&self, hook: F)
    where
        F: FnMut(CallableError, TaskOrigin) + 'static,
    {
        let previous = self.error_hook.borrow_mut().replace(Box::new(hook));
        if previous.is_some() {
            tracing::warn!(name = %self.config.name, "replacing installed error hook");
        }
    }

    pub fn take_diagnostics(&self) -> Vec<CallableError> {
        self.diagnostics.borrow_mut().drain(..).collect()
    }

    // ---------------------------------------------------------------------
    // Running
    // ---------------------------------------------------------------------

    /// Runs until both queues and the timer heap are empty, waiting out timer
    /// deadlines as needed. A live recurring timer keeps the loop busy until
    /// it is cancelled or the loop is stopped.
    pub fn run_until_idle(&self) -> Result<RunSummary, SchedulerError> {
        let _guard = self.enter("run_until_idle")?;
        let span = tracing::debug_span!("run_until_idle", name = %self.config.name);
        let _span = span.enter();

        let mut summary = RunSummary::default();
        loop {
            let turn = self.turn();
            if turn.ran > 0 {
                summary.record(turn.ran);
            }
            if turn.stopped {
                break;
            }
            if turn.ran > 0 || !self.inbox.is_empty() {
                continue;
            }
            match self.next_deadline() {
                Some(deadline) => self.park(Some(deadline)),
                None => break,
            }
        }

        tracing::debug!(
            iterations = summary.iterations,
            tasks = summary.tasks_run,
            "loop idle"
        );
        Ok(summary)
    }

    /// Runs everything that is runnable at the current clock reading, without
    /// waiting for timers that are not yet due.
    pub fn run_until_stalled(&self) -> Result<RunSummary, SchedulerError> {
        let _guard = self.enter("run_until_stalled")?;
        let span = tracing::debug_span!("run_until_stalled", name = %self.config.name);
        let _span = span.enter();

        let mut summary = RunSummary::default();
        loop {
            let turn = self.turn();
            if turn.ran == 0 || turn.stopped {
                if turn.ran > 0 {
                    summary.record(turn.ran);
                }
                break;
            }
            summary.record(turn.ran);
        }
        Ok(summary)
    }

    /// Runs until [`stop`](Self::stop) is called, here or through a
    /// [`LoopHandle`]. Sleeps only when no task is runnable: until the next
    /// timer deadline, or until remote work arrives.
    pub fn run_forever(&self) -> Result<RunSummary, SchedulerError> {
        let _guard = self.enter("run_forever")?;
        let span = tracing::debug_span!("run_forever", name = %self.config.name);
        let _span = span.enter();

        let mut summary = RunSummary::default();
        loop {
            let turn = self.turn();
            if turn.ran > 0 {
                summary.record(turn.ran);
            }
            if turn.stopped {
                break;
            }
            if turn.ran > 0 {
                continue;
            }
            let deadline = self.next_deadline();
            self.park(deadline);
        }
        Ok(summary)
    }

    /// One iteration: ready timers, at most one macrotask, then a full drain.
    /// Returns whether work is still pending.
    pub fn tick(&self) -> Result<bool, SchedulerError> {
        let _guard = self.enter("tick")?;
        let span = tracing::trace_span!("tick", name = %self.config.name);
        let _span = span.enter();

        let turn = self.turn();
        Ok(!turn.stopped && !self.pending().is_empty())
    }

    /// Stops the loop for good. A task that is running finishes, but nothing
    /// else is dispatched, including the rest of the current drain. Pending
    /// work and the error hook are dropped, and later scheduling fails with
    /// [`SchedulerError::Stopped`].
    pub fn stop(&self) {
        self.inbox.mark_stopped();
        self.state.set(LoopState::Stopped);
        if self.torn_down.replace(true) {
            return;
        }
        let discarded = self.discard_pending();
        tracing::info!(name = %self.config.name, discarded, "event loop stopped");
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn turn(&self) -> Turn {
        self.merge_inbox();
        if self.halt_if_stopped() {
            return Turn { ran: 0, stopped: true };
        }

        // Microtasks queued outside of any task still run before the next
        // macrotask is considered.
        let mut ran = self.drain_microtasks();
        if self.halt_if_stopped() {
            return Turn { ran, stopped: true };
        }

        self.promote_ready_timers();
        if let Some(task) = self.next_macrotask() {
            self.set_state(LoopState::RunningMacrotask);
            self.invoke(task);
            ran += 1;
            if !self.halt_if_stopped() {
                ran += self.drain_microtasks();
            }
        }
        self.set_state(LoopState::Idle);

        if ran > 0 {
            self.bump(|stats| stats.iterations += 1);
        }
        Turn {
            ran,
            stopped: self.halt_if_stopped(),
        }
    }

    fn drain_microtasks(&self) -> u64 {
        if self.microtasks.is_empty() {
            return 0;
        }
        self.set_state(LoopState::DrainingMicrotasks);
        self.microtasks.drain(|task| {
            self.invoke(task);
            if self.is_stopped() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    fn promote_ready_timers(&self) {
        let now = self.clock.now();
        let ready = self.timers.borrow_mut().pop_ready(now);
        if ready.is_empty() {
            return;
        }

        let fired = ready.len() as u64;
        for task in ready {
            let id = task.id();
            tracing::trace!(task = %id, "timer fired");
            let queued = self.macrotasks.enqueue(task);
            self.registry.borrow_mut().add_firing(id, queued);
        }
        self.bump(|stats| stats.timers_fired += fired);
    }

    /// Pops the next macrotask and settles its registry entry. A timer stays
    /// registered while its entry is armed or other firings are queued.
    fn next_macrotask(&self) -> Option<Callable> {
        let (queued, task) = self.macrotasks.pop_next()?;
        let id = task.id();

        let mut registry = self.registry.borrow_mut();
        let finished = match registry.get_mut(id) {
            Some(Slot::Queued(_)) => true,
            Some(Slot::Timer { key, firings }) => {
                firings.retain(|firing| *firing != queued);
                firings.is_empty() && !self.timers.borrow().is_pending(*key)
            }
            None => false,
        };
        if finished {
            registry.remove(id);
        }
        Some(task)
    }

    fn invoke(&self, task: Callable) {
        let id = task.id();
        let origin = task.origin();
        tracing::trace!(task = %id, %origin, "running task");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.invoke()));
        self.bump(|stats| match origin {
            TaskOrigin::Micro => stats.microtasks_run += 1,
            _ => stats.macrotasks_run += 1,
        });

        let cause = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(error)) => FailureCause::Failed(error),
            Err(payload) => FailureCause::Panicked(panic_message(payload)),
        };
        self.report(CallableError {
            task: id,
            origin,
            cause,
        });
    }

    fn report(&self, error: CallableError) {
        self.bump(|stats| stats.failures += 1);
        let origin = error.origin;

        // Taken out for the call so the hook may reinstall or replace itself.
        let hook = self.error_hook.borrow_mut().take();
        match hook {
            Some(mut hook) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| hook(error, origin)));
                if let Err(payload) = outcome {
                    tracing::error!(panic = %panic_message(payload), "error hook panicked");
                }
                let mut slot = self.error_hook.borrow_mut();
                if slot.is_none() && !self.torn_down.get() {
                    *slot = Some(hook);
                }
            }
            None => {
                tracing::warn!(%error, "task failed");
                self.collect(error);
            }
        }
    }

    fn collect(&self, error: CallableError) {
        let limit = self.config.diagnostics_limit;
        if limit == 0 {
            return;
        }
        let mut diagnostics = self.diagnostics.borrow_mut();
        if diagnostics.len() >= limit {
            diagnostics.pop_front();
            tracing::warn!(limit, "diagnostics full, dropping oldest failure");
        }
        diagnostics.push_back(error);
    }

    fn merge_inbox(&self) {
        let mut merged = 0_usize;
        while let Some(envelope) = self.inbox.try_recv() {
            self.accept(envelope);
            merged += 1;
        }
        if merged > 0 {
            tracing::debug!(merged, "merged remote inbox");
        }
    }

    fn accept(&self, envelope: Envelope) {
        match envelope {
            Envelope::Task(task) => {
                if self.is_stopped() {
                    return;
                }
                let id = self.ids.next();
                let queued = self
                    .macrotasks
                    .enqueue(Callable::from_boxed(id, TaskOrigin::Remote, task));
                self.registry.borrow_mut().insert(id, Slot::Queued(queued));
                self.bump(|stats| stats.remote_received += 1);
            }
            Envelope::Stop => self.stop(),
        }
    }

    /// Waits for `deadline` (or indefinitely with `None`), waking early when
    /// something arrives in the inbox.
    fn park(&self, deadline: Option<Instant>) {
        let timeout = match deadline {
            Some(deadline) => {
                let wait = self.clock.advance_toward(deadline);
                if wait.is_zero() {
                    return;
                }
                Some(wait)
            }
            None => None,
        };

        tracing::debug!(?timeout, "parking");
        if let Some(envelope) = self.inbox.wait(timeout) {
            self.accept(envelope);
        }
    }

    fn insert_timer(
        &self,
        delay: Duration,
        callback: TimerCallback,
        recurring: Option<Duration>,
    ) -> Result<CancellationHandle, SchedulerError> {
        self.ensure_accepting()?;
        let recurring = recurring.map(|interval| self.clamp_interval(interval));
        let Some(deadline) = self.clock.now().checked_add(delay) else {
            tracing::warn!(?delay, "timer delay does not fit the clock");
            return Err(SchedulerError::DelayOutOfRange { delay });
        };
        let id = self.ids.next();

        let key = self
            .timers
            .borrow_mut()
            .schedule(id, deadline, callback, recurring);
        self.registry.borrow_mut().insert(id, Slot::timer(key));

        tracing::debug!(task = %id, ?delay, ?recurring, "timer armed");
        Ok(CancellationHandle::new(self.id, id))
    }

    fn clamp_interval(&self, interval: Duration) -> Duration {
        // Never let a recurring entry re-arm at the deadline it just fired at.
        let floor = self.config.min_interval.max(Duration::from_nanos(1));
        if interval < floor {
            tracing::debug!(?interval, ?floor, "raising recurring interval to the minimum");
            floor
        } else {
            interval
        }
    }

    fn discard_pending(&self) -> usize {
        let microtasks = self.microtasks.clear();
        let macrotasks = self.macrotasks.clear();
        let timers = self.timers.borrow_mut().clear();
        self.registry.borrow_mut().clear();
        let remote = self.inbox.drain();
        let hook = self.error_hook.borrow_mut().take();
        // Everything above is dropped on return, after all borrows are released.
        drop(hook);
        microtasks.len() + macrotasks.len() + timers.len() + remote.len()
    }

    fn enter(&self, operation: &'static str) -> Result<RunGuard<'_>, SchedulerError> {
        if self.running.replace(true) {
            tracing::error!(operation, "run method entered from inside a task");
            return Err(SchedulerError::Reentrant { operation });
        }
        Ok(RunGuard {
            running: &self.running,
        })
    }

    fn ensure_accepting(&self) -> Result<(), SchedulerError> {
        if self.is_stopped() {
            Err(SchedulerError::Stopped)
        } else {
            Ok(())
        }
    }

    fn halt_if_stopped(&self) -> bool {
        if self.is_stopped() {
            // Finishes the teardown when the stop came in through a handle.
            self.stop();
            true
        } else {
            false
        }
    }

    fn set_state(&self, next: LoopState) {
        if self.state.get() != LoopState::Stopped {
            self.state.set(next);
        }
    }

    fn bump(&self, update: impl FnOnce(&mut LoopStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.inbox.mark_stopped();
    }
}

impl Scheduler for EventLoop {
    fn schedule_microtask(&self, task: Box<dyn FnOnce() -> TaskResult>) -> Result<(), SchedulerError> {
        EventLoop::schedule_microtask(self, task)
    }

    fn schedule_macrotask(
        &self,
        task: Box<dyn FnOnce() -> TaskResult>,
    ) -> Result<CancellationHandle, SchedulerError> {
        EventLoop::schedule_macrotask(self, task)
    }

    fn set_timer(
        &self,
        delay: Duration,
        task: Box<dyn FnMut() -> TaskResult>,
        recurring: Option<Duration>,
    ) -> Result<CancellationHandle, SchedulerError> {
        EventLoop::set_timer(self, delay, task, recurring)
    }

    fn cancel(&self, handle: CancellationHandle) -> bool {
        EventLoop::cancel(self, handle)
    }

    fn now(&self) -> Instant {
        EventLoop::now(self)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.config.name)
            .field("state", &self.state.get())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

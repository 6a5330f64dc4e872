//! Deadline-ordered timer storage.
//!
//! Entries live in a slot arena; the heap only holds `(deadline, seq, key)`
//! nodes pointing into it. Cancelling flips a tombstone flag on the entry and
//! the stale heap node is swept the next time it reaches the top, so cancel
//! never has to search the heap.

use crate::error::{IntoTaskResult, TaskResult};
use crate::task::{Callable, TaskId, TaskOrigin};
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

new_key_type! {
    pub struct TimerKey;
}

/// Produces the callable a timer hands to the macrotask queue when it fires.
pub enum TimerCallback {
    Once(Box<dyn FnOnce() -> TaskResult>),
    /// Shared so every firing can hold its own reference while the entry
    /// stays armed for the next deadline.
    Repeating(Rc<RefCell<dyn FnMut() -> TaskResult>>),
}

impl TimerCallback {
    pub fn once<F, R>(f: F) -> Self
    where
        F: FnOnce() -> R + 'static,
        R: IntoTaskResult,
    {
        TimerCallback::Once(Box::new(move || f().into_task_result()))
    }

    pub fn repeating<F, R>(mut f: F) -> Self
    where
        F: FnMut() -> R + 'static,
        R: IntoTaskResult,
    {
        let callback: Rc<RefCell<dyn FnMut() -> TaskResult>> =
            Rc::new(RefCell::new(move || f().into_task_result()));
        TimerCallback::Repeating(callback)
    }
}

struct TimerEntry {
    id: TaskId,
    deadline: Instant,
    /// `None` once the entry is cancelled.
    callback: Option<TimerCallback>,
    recurring: Option<Duration>,
    cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapNode {
    deadline: Instant,
    // Insertion order; breaks deadline ties deterministically.
    seq: u64,
    key: TimerKey,
}

#[derive(Default)]
pub struct TimerService {
    entries: SlotMap<TimerKey, TimerEntry>,
    heap: BinaryHeap<Reverse<HeapNode>>,
    next_seq: u64,
    live: usize,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        id: TaskId,
        deadline: Instant,
        callback: TimerCallback,
        recurring: Option<Duration>,
    ) -> TimerKey {
        let key = self.entries.insert(TimerEntry {
            id,
            deadline,
            callback: Some(callback),
            recurring,
            cancelled: false,
        });
        self.push_node(deadline, key);
        self.live += 1;
        key
    }

    /// Tombstones the entry behind `key`.
    ///
    /// Returns the entry's callback when it was still armed, so the caller can
    /// drop user state outside of any borrow it holds on this service. Returns
    /// `None` for entries that already fired, were swept or were cancelled.
    pub fn cancel(&mut self, key: TimerKey) -> Option<TimerCallback> {
        let entry = self.entries.get_mut(key)?;
        if entry.cancelled {
            return None;
        }
        entry.cancelled = true;
        self.live -= 1;
        entry.callback.take()
    }

    /// Whether `key` still refers to an armed entry.
    pub fn is_pending(&self, key: TimerKey) -> bool {
        self.entries.get(key).is_some_and(|entry| !entry.cancelled)
    }

    /// Removes every armed entry whose deadline is at or before `now` and
    /// turns it into a timer callable, earliest deadline first.
    ///
    /// Recurring entries are re-armed at `deadline + interval` the moment they
    /// fire. When that next deadline is also due, the entry fires again within
    /// this call. An entry whose next deadline does not fit in an `Instant`
    /// fires one last time and is retired.
    pub fn pop_ready(&mut self, now: Instant) -> SmallVec<[Callable; 4]> {
        let mut ready = SmallVec::new();

        while let Some(&Reverse(node)) = self.heap.peek() {
            if node.deadline > now {
                break;
            }
            self.heap.pop();

            let Some(entry) = self.entries.get_mut(node.key) else {
                continue;
            };
            if entry.cancelled {
                self.entries.remove(node.key);
                continue;
            }

            let shared = match &entry.callback {
                Some(TimerCallback::Repeating(callback)) => Some(callback.clone()),
                _ => None,
            };
            if let (Some(interval), Some(callback)) = (entry.recurring, shared) {
                if let Some(next) = entry.deadline.checked_add(interval) {
                    let id = entry.id;
                    entry.deadline = next;
                    self.push_node(next, node.key);
                    ready.push(repeating_callable(id, callback));
                    continue;
                }
                tracing::warn!(
                    task = %entry.id,
                    ?interval,
                    "next deadline is out of range; retiring recurring timer"
                );
            }

            let Some(entry) = self.entries.remove(node.key) else {
                continue;
            };
            self.live -= 1;
            match entry.callback {
                Some(TimerCallback::Once(invoke)) => {
                    ready.push(Callable::from_boxed(entry.id, TaskOrigin::Timer, invoke));
                }
                Some(TimerCallback::Repeating(callback)) => {
                    ready.push(repeating_callable(entry.id, callback));
                }
                None => {}
            }
        }

        ready
    }

    /// Earliest armed deadline. Tombstones sitting at the top of the heap are
    /// swept on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse(node)) = self.heap.peek() {
            if self.is_pending(node.key) {
                return Some(node.deadline);
            }
            self.heap.pop();
            self.entries.remove(node.key);
        }
        None
    }

    /// Number of armed (non-cancelled) entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drops every entry, returning the callbacks that were still armed.
    pub fn clear(&mut self) -> Vec<TimerCallback> {
        self.heap.clear();
        self.live = 0;
        self.entries
            .drain()
            .filter_map(|(_, entry)| entry.callback)
            .collect()
    }

    fn push_node(&mut self, deadline: Instant, key: TimerKey) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(HeapNode { deadline, seq, key }));
    }
}

fn repeating_callable(id: TaskId, callback: Rc<RefCell<dyn FnMut() -> TaskResult>>) -> Callable {
    Callable::from_boxed(
        id,
        TaskOrigin::Timer,
        Box::new(move || match callback.try_borrow_mut() {
            Ok(mut f) => (&mut *f)(),
            Err(_) => Err(anyhow::anyhow!(
                "recurring timer {id} fired while its previous run was still executing"
            )),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskIdAllocator;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn ids_of(ready: &[Callable]) -> Vec<TaskId> {
        ready.iter().map(Callable::id).collect()
    }

    #[test]
    fn pops_in_deadline_order_regardless_of_insertion() {
        let ids = TaskIdAllocator::new();
        let mut timers = TimerService::new();
        let start = Instant::now();

        let late = ids.next();
        let early = ids.next();
        timers.schedule(late, start + ms(100), TimerCallback::once(|| {}), None);
        timers.schedule(early, start + ms(50), TimerCallback::once(|| {}), None);

        assert_eq!(timers.next_deadline(), Some(start + ms(50)));
        assert!(timers.pop_ready(start + ms(10)).is_empty());

        let ready = timers.pop_ready(start + ms(100));
        assert_eq!(ids_of(&ready), vec![early, late]);
        assert!(timers.is_empty());
    }

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let ids = TaskIdAllocator::new();
        let mut timers = TimerService::new();
        let at = Instant::now() + ms(5);

        let expected: Vec<_> = (0..5)
            .map(|_| {
                let id = ids.next();
                timers.schedule(id, at, TimerCallback::once(|| {}), None);
                id
            })
            .collect();

        assert_eq!(ids_of(&timers.pop_ready(at)), expected);
    }

    #[test]
    fn cancelled_entries_never_fire_and_are_swept() {
        let ids = TaskIdAllocator::new();
        let mut timers = TimerService::new();
        let start = Instant::now();

        let doomed = timers.schedule(ids.next(), start, TimerCallback::once(|| {}), None);
        let kept = ids.next();
        timers.schedule(kept, start + ms(1), TimerCallback::once(|| {}), None);

        assert!(timers.cancel(doomed).is_some());
        assert!(timers.cancel(doomed).is_none());
        assert_eq!(timers.len(), 1);

        assert_eq!(timers.next_deadline(), Some(start + ms(1)));
        assert_eq!(ids_of(&timers.pop_ready(start + ms(1))), vec![kept]);
        assert!(!timers.is_pending(doomed));
    }

    #[test]
    fn recurring_entries_keep_a_fixed_cadence() {
        let ids = TaskIdAllocator::new();
        let mut timers = TimerService::new();
        let start = Instant::now();

        let id = ids.next();
        let key = timers.schedule(
            id,
            start + ms(10),
            TimerCallback::repeating(|| {}),
            Some(ms(10)),
        );

        let ready = timers.pop_ready(start + ms(35));
        assert_eq!(ids_of(&ready), vec![id, id, id]);
        assert_eq!(timers.next_deadline(), Some(start + ms(40)));
        assert!(timers.is_pending(key));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn recurring_entry_retires_when_next_deadline_overflows() {
        let ids = TaskIdAllocator::new();
        let mut timers = TimerService::new();
        let start = Instant::now();

        let id = ids.next();
        let key = timers.schedule(
            id,
            start + ms(1),
            TimerCallback::repeating(|| {}),
            Some(Duration::MAX),
        );

        assert_eq!(ids_of(&timers.pop_ready(start + ms(1))), vec![id]);
        assert!(!timers.is_pending(key));
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn repeating_callback_runs_each_firing() {
        let ids = TaskIdAllocator::new();
        let mut timers = TimerService::new();
        let start = Instant::now();
        let count = Rc::new(std::cell::Cell::new(0));

        let counter = count.clone();
        timers.schedule(
            ids.next(),
            start + ms(1),
            TimerCallback::repeating(move || counter.set(counter.get() + 1)),
            Some(ms(1)),
        );

        for task in timers.pop_ready(start + ms(3)) {
            task.invoke().unwrap();
        }
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn clear_returns_armed_callbacks() {
        let ids = TaskIdAllocator::new();
        let mut timers = TimerService::new();
        let start = Instant::now();
        let a = timers.schedule(ids.next(), start, TimerCallback::once(|| {}), None);
        timers.schedule(ids.next(), start, TimerCallback::repeating(|| {}), Some(ms(1)));
        let _ = timers.cancel(a);

        assert_eq!(timers.clear().len(), 1);
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}

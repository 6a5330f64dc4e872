use crate::task::Callable;
use slotmap::{SlotMap, new_key_type};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::ControlFlow;

/// Highest-priority work. Emptied completely after every macrotask.
///
/// The loop is single-threaded, so a RefCell<VecDeque> is enough. Borrows
/// never outlive a single push or pop, which lets a running task enqueue more
/// work into the same queue.
#[derive(Default)]
pub struct MicrotaskQueue {
    queue: RefCell<VecDeque<Callable>>,
}

impl MicrotaskQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: RefCell::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn enqueue(&self, task: Callable) {
        self.queue.borrow_mut().push_back(task);
    }

    /// Hands queued tasks to `run` until the queue is empty, including tasks
    /// that `run` itself enqueues along the way. Returns how many ran.
    ///
    /// `run` returning `Break` ends the drain early; the remaining tasks stay
    /// queued.
    pub fn drain<F>(&self, mut run: F) -> u64
    where
        F: FnMut(Callable) -> ControlFlow<()>,
    {
        let mut ran = 0;
        // Pop one at a time instead of swapping the buffer out, so that tasks
        // appended mid-drain are picked up by this same pass.
        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(task) = next else {
                break;
            };
            ran += 1;
            if run(task).is_break() {
                break;
            }
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Removes every queued task without running it.
    pub fn clear(&self) -> Vec<Callable> {
        self.queue.borrow_mut().drain(..).collect()
    }
}

new_key_type! {
    /// Position of one callable in the [`MacrotaskQueue`].
    pub struct QueueKey;
}

/// Host-level work: direct scheduling, fired timers and remote submissions.
/// One entry runs per loop iteration.
///
/// Callables sit in a slot arena with a separate FIFO of keys, so a
/// cancelled entry can be pulled out (and its captures dropped) without
/// waiting for it to reach the head. Keys left behind in the FIFO are
/// skipped when popped.
#[derive(Default)]
pub struct MacrotaskQueue {
    order: RefCell<VecDeque<QueueKey>>,
    tasks: RefCell<SlotMap<QueueKey, Callable>>,
}

impl MacrotaskQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: RefCell::new(VecDeque::with_capacity(capacity)),
            tasks: RefCell::new(SlotMap::with_capacity_and_key(capacity)),
        }
    }

    pub fn enqueue(&self, task: Callable) -> QueueKey {
        let key = self.tasks.borrow_mut().insert(task);
        self.order.borrow_mut().push_back(key);
        key
    }

    /// Oldest callable still queued, with the key it was queued under.
    pub fn pop_next(&self) -> Option<(QueueKey, Callable)> {
        let mut order = self.order.borrow_mut();
        let mut tasks = self.tasks.borrow_mut();
        while let Some(key) = order.pop_front() {
            if let Some(task) = tasks.remove(key) {
                return Some((key, task));
            }
        }
        None
    }

    /// Takes a queued callable out before it runs.
    pub fn remove(&self, key: QueueKey) -> Option<Callable> {
        let task = self.tasks.borrow_mut().remove(key);
        if self.tasks.borrow().is_empty() {
            self.order.borrow_mut().clear();
        }
        task
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    pub fn clear(&self) -> Vec<Callable> {
        self.order.borrow_mut().clear();
        self.tasks.borrow_mut().drain().map(|(_, task)| task).collect()
    }
}

//! Wakeup plumbing: the ready queue, notifiers, and completion barriers.
//!
//! [`Notifier::notify`] is the only entry point that may be called from a
//! thread other than the executor's. It sets the flow's ready flag and pushes
//! it onto the ready queue; it never runs flow code.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::queue::PriorityQueue;

/// Handle naming a flow owned by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub(crate) usize);

impl FlowId {
    /// Slot index of the flow inside its executor.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

struct ReadyState {
    queue: PriorityQueue<FlowId>,
    queued: Vec<bool>,
    retired: Vec<bool>,
    priorities: Vec<usize>,
}

/// Ready queue shared between an executor and everything that can wake its flows.
pub(crate) struct Scheduler {
    state: Mutex<ReadyState>,
    wakeup: Condvar,
}

impl Scheduler {
    pub(crate) fn new(priority_levels: usize) -> Self {
        Scheduler {
            state: Mutex::new(ReadyState {
                queue: PriorityQueue::new(priority_levels),
                queued: Vec::new(),
                retired: Vec::new(),
                priorities: Vec::new(),
            }),
            wakeup: Condvar::new(),
        }
    }

    pub(crate) fn register(&self, id: FlowId, priority: usize) {
        let mut state = self.state.lock();
        if state.queued.len() <= id.0 {
            state.queued.resize(id.0 + 1, false);
            state.retired.resize(id.0 + 1, true);
            state.priorities.resize(id.0 + 1, 0);
        }
        state.queued[id.0] = false;
        state.retired[id.0] = false;
        state.priorities[id.0] = priority;
    }

    /// Stop accepting notifications for a flow that has terminated.
    pub(crate) fn retire(&self, id: FlowId) {
        let mut state = self.state.lock();
        if let Some(retired) = state.retired.get_mut(id.0) {
            *retired = true;
        }
    }

    /// Mark `id` ready. Returns false if it was already queued.
    pub(crate) fn notify(&self, id: FlowId) -> bool {
        let mut state = self.state.lock();
        match (state.queued.get(id.0), state.retired.get(id.0)) {
            (Some(false), Some(false)) => {}
            _ => return false,
        }
        state.queued[id.0] = true;
        let priority = state.priorities[id.0];
        state.queue.push(priority, id);
        drop(state);
        self.wakeup.notify_all();
        true
    }

    pub(crate) fn pop(&self) -> Option<FlowId> {
        let mut state = self.state.lock();
        let id = state.queue.pop()?;
        state.queued[id.0] = false;
        Some(id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Block the calling thread until some flow is ready or `timeout` elapses.
    pub(crate) fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.queue.is_empty() {
            return true;
        }
        let _ = self.wakeup.wait_for(&mut state, timeout);
        !state.queue.is_empty()
    }
}

/// Wakes one flow. Cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct Notifier {
    id: FlowId,
    scheduler: Arc<Scheduler>,
}

impl Notifier {
    pub(crate) fn new(id: FlowId, scheduler: Arc<Scheduler>) -> Self {
        Notifier { id, scheduler }
    }

    /// The flow this notifier wakes.
    pub fn flow(&self) -> FlowId {
        self.id
    }

    /// Schedule the flow on its executor. Never runs flow code.
    pub fn notify(&self) {
        self.scheduler.notify(self.id);
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").field("flow", &self.id).finish()
    }
}

struct BarrierInner {
    pending: AtomicUsize,
    notifier: Notifier,
}

/// Counts outstanding [`Done`] handles and wakes its owner when the last one fires.
///
/// The barrier holds one token of its own until [`Barrier::seal`] is called, so
/// handles completing while children are still being handed out cannot trigger
/// a premature wakeup.
pub struct Barrier {
    inner: Arc<BarrierInner>,
    sealed: bool,
}

impl Barrier {
    /// Create a barrier that notifies `notifier` when every child is done.
    pub fn new(notifier: Notifier) -> Self {
        Barrier {
            inner: Arc::new(BarrierInner {
                pending: AtomicUsize::new(1),
                notifier,
            }),
            sealed: false,
        }
    }

    /// Hand out one more completion handle.
    pub fn child(&self) -> Done {
        debug_assert!(!self.sealed, "child() after seal()");
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        Done {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Stop handing out children. Returns true if all of them already completed.
    ///
    /// Completion observed here does not notify; the caller continues directly.
    pub fn seal(&mut self) -> bool {
        if !self.sealed {
            self.sealed = true;
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        }
        self.is_complete()
    }

    /// True once sealed and every child has completed.
    pub fn is_complete(&self) -> bool {
        self.sealed && self.inner.pending.load(Ordering::Acquire) == 0
    }

    /// Children that have not completed yet.
    pub fn outstanding(&self) -> usize {
        let pending = self.inner.pending.load(Ordering::Acquire);
        if self.sealed {
            pending
        } else {
            pending.saturating_sub(1)
        }
    }
}

/// A one-shot completion signal handed to a handler.
///
/// Firing happens exactly once: either through [`Done::notify`] or when the
/// handle is dropped.
pub struct Done {
    inner: Option<Arc<BarrierInner>>,
}

impl Done {
    /// A handle that is not attached to any barrier.
    pub fn detached() -> Self {
        Done { inner: None }
    }

    /// Signal completion.
    pub fn notify(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(inner) = self.inner.take() {
            if inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.notifier.notify();
            }
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        self.fire();
    }
}

impl std::fmt::Debug for Done {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Done")
            .field("attached", &self.inner.is_some())
            .finish()
    }
}

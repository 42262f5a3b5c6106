//! Priority queues: the plain container and the locked input queue of a queue flow.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::Message;
use crate::notify::Notifier;

/// FIFO-within-priority queue with a fixed number of levels.
///
/// Level 0 is the most urgent. Out-of-range priorities are clamped to the
/// last level.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    levels: Vec<VecDeque<T>>,
    len: usize,
}

impl<T> PriorityQueue<T> {
    pub fn new(levels: usize) -> Self {
        let levels = levels.max(1);
        PriorityQueue {
            levels: (0..levels).map(|_| VecDeque::new()).collect(),
            len: 0,
        }
    }

    /// Number of priority levels.
    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    pub fn push(&mut self, priority: usize, item: T) {
        let level = priority.min(self.levels.len() - 1);
        self.levels[level].push_back(item);
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.levels.iter_mut().find_map(|level| level.pop_front())?;
        self.len -= 1;
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct FlowQueueInner<M> {
    queue: PriorityQueue<Message<M>>,
    waiting: VecDeque<Notifier>,
}

/// Input queue of one or more queue flows.
///
/// Producers on any thread call [`FlowQueue::send`]. A consumer flow that
/// finds the queue empty parks its notifier here; a send wakes exactly one
/// parked consumer, and nobody when every consumer is busy.
pub struct FlowQueue<M> {
    inner: Arc<Mutex<FlowQueueInner<M>>>,
}

impl<M> Clone for FlowQueue<M> {
    fn clone(&self) -> Self {
        FlowQueue {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> FlowQueue<M> {
    pub fn new(priority_levels: usize) -> Self {
        FlowQueue {
            inner: Arc::new(Mutex::new(FlowQueueInner {
                queue: PriorityQueue::new(priority_levels),
                waiting: VecDeque::new(),
            })),
        }
    }

    /// Enqueue `msg` at `priority` and wake one idle consumer, if any.
    pub fn send(&self, mut msg: Message<M>, priority: usize) {
        msg.set_priority(priority);
        let waiter = {
            let mut inner = self.inner.lock();
            inner.queue.push(priority, msg);
            inner.waiting.pop_front()
        };
        if let Some(waiter) = waiter {
            waiter.notify();
        }
    }

    /// Take the most urgent message, or park `consumer` until the next send.
    pub(crate) fn take_or_park(&self, consumer: &Notifier) -> Option<Message<M>> {
        let mut inner = self.inner.lock();
        if let Some(msg) = inner.queue.pop() {
            inner.waiting.retain(|w| w.flow() != consumer.flow());
            return Some(msg);
        }
        if !inner.waiting.iter().any(|w| w.flow() == consumer.flow()) {
            inner.waiting.push_back(consumer.clone());
        }
        None
    }

    /// Remove the most urgent message without involving any consumer.
    pub fn try_take(&self) -> Option<Message<M>> {
        self.inner.lock().queue.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Consumers currently parked on an empty queue.
    pub fn idle_consumers(&self) -> usize {
        self.inner.lock().waiting.len()
    }
}

//! Fixed-capacity message pools.
//!
//! A [`Pool`] hands out [`Lease`]s; a lease is one slot of capacity and goes
//! back to the pool when dropped. Producers on other threads reserve with
//! [`Pool::try_lease`] or [`Pool::lease_blocking`]. Flows reserve without
//! blocking through [`FlowContext::allocate_and_call`](crate::FlowContext::allocate_and_call),
//! which parks an [`Allocation`] cell in the pool's waiter list; a released
//! slot is handed straight to the first parked waiter and its flow notified.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{PoolError, PoolResult};
use crate::notify::Notifier;

struct PoolState {
    free: usize,
    waiters: VecDeque<(Allocation, Notifier)>,
}

struct PoolInner {
    name: String,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// A bounded supply of message slots. Clones share the same slots.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                name: name.into(),
                capacity,
                state: Mutex::new(PoolState {
                    free: capacity,
                    waiters: VecDeque::new(),
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots not currently leased.
    pub fn available(&self) -> usize {
        self.inner.state.lock().free
    }

    /// Flows parked waiting for a slot.
    pub fn waiters(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Reserve a slot without blocking.
    pub fn try_lease(&self) -> PoolResult<Lease> {
        let mut state = self.inner.state.lock();
        if state.free == 0 {
            return Err(PoolError::Exhausted {
                pool: self.inner.name.clone(),
                capacity: self.inner.capacity,
            });
        }
        state.free -= 1;
        Ok(self.lease())
    }

    /// Reserve a slot, blocking the calling thread for at most `timeout`.
    ///
    /// Never call this from flow code: it would stall the executor that is
    /// supposed to release the slot.
    pub fn lease_blocking(&self, timeout: Duration) -> PoolResult<Lease> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.free == 0 {
            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.free == 0
            {
                return Err(PoolError::Timeout {
                    pool: self.inner.name.clone(),
                });
            }
        }
        state.free -= 1;
        Ok(self.lease())
    }

    /// Fill `allocation` with a slot if one is free; otherwise park it and
    /// notify `notifier` once a slot has been deposited.
    ///
    /// Returns true if `allocation` holds a lease on return.
    pub fn allocate_immediate(&self, allocation: &Allocation, notifier: &Notifier) -> bool {
        if allocation.is_ready() {
            return true;
        }
        let mut state = self.inner.state.lock();
        if state.free > 0 {
            state.free -= 1;
            drop(state);
            allocation.deposit(self.lease());
            return true;
        }
        if !state
            .waiters
            .iter()
            .any(|(a, _)| Arc::ptr_eq(&a.slot, &allocation.slot))
        {
            trace!(pool = %self.inner.name, flow = %notifier.flow(), "parking for a pool slot");
            state.waiters.push_back((allocation.clone(), notifier.clone()));
        }
        false
    }

    fn lease(&self) -> Lease {
        Lease {
            pool: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// One slot of pool capacity. Dropping it returns the slot.
pub struct Lease {
    pool: Arc<PoolInner>,
}

impl Lease {
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        while let Some((allocation, notifier)) = state.waiters.pop_front() {
            // The pool holds the only reference: its flow is gone.
            if Arc::strong_count(&allocation.slot) == 1 {
                continue;
            }
            drop(state);
            allocation.deposit(Lease {
                pool: Arc::clone(&self.pool),
            });
            notifier.notify();
            return;
        }
        state.free += 1;
        drop(state);
        self.pool.available.notify_one();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("pool", &self.pool.name).finish()
    }
}

/// Cell a flow keeps across suspensions to receive a pool slot.
#[derive(Clone, Default)]
pub struct Allocation {
    slot: Arc<Mutex<Option<Lease>>>,
}

impl Allocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a lease is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Take the deposited lease.
    pub fn take(&self) -> Option<Lease> {
        self.slot.lock().take()
    }

    fn deposit(&self, lease: Lease) {
        let previous = self.slot.lock().replace(lease);
        debug_assert!(previous.is_none(), "allocation filled twice");
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// A unit of work travelling through a flow's queue.
///
/// The optional lease ties the message to a pool slot. Ownership moves with
/// the message, so the slot is released exactly once: when the message is
/// dropped or unwrapped with [`Message::into_payload`].
pub struct Message<T> {
    payload: T,
    priority: usize,
    lease: Option<Lease>,
}

impl<T> Message<T> {
    /// A message that does not occupy a pool slot.
    pub fn new(payload: T) -> Self {
        Message {
            payload,
            priority: 0,
            lease: None,
        }
    }

    /// A message occupying the slot held by `lease`.
    pub fn with_lease(payload: T, lease: Lease) -> Self {
        Message {
            payload,
            priority: 0,
            lease: Some(lease),
        }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }

    pub fn priority(&self) -> usize {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: usize) {
        self.priority = priority;
    }

    /// True if this message holds a pool slot.
    pub fn is_leased(&self) -> bool {
        self.lease.is_some()
    }

    /// Release the slot and return the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("priority", &self.priority)
            .field("leased", &self.lease.is_some())
            .field("payload", &self.payload)
            .finish()
    }
}

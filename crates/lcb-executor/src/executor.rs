//! The run loop that owns flows and drives them on one logical thread.

use std::sync::Arc;
use std::time::Duration;

use lcb_metrics::{metric_defs, MetricLabels};
use tracing::{debug, trace};

use crate::action::Action;
use crate::buffer::{Allocation, Pool};
use crate::flow::{QueueFlow, QueueRunner, StateFlow, StateRunner};
use crate::notify::{FlowId, Notifier, Scheduler};
use crate::queue::FlowQueue;
use crate::time::FlowTime;

/// Result of running one flow until it gives up the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Suspended,
    Terminated,
}

/// A flow as the executor sees it.
pub(crate) trait Runnable<S> {
    fn run(&mut self, ctx: &mut FlowContext<'_, S>) -> Outcome;
    fn name(&self) -> &'static str;
}

/// The single timer every flow owns.
#[derive(Debug, Default)]
pub(crate) struct FlowTimer {
    deadline: Option<FlowTime>,
    /// Armed during the current step and not yet tied to the state it waits in.
    pending: bool,
    /// This activation was caused by the timer firing.
    expired: bool,
}

impl FlowTimer {
    fn arm(&mut self, deadline: FlowTime) {
        self.deadline = Some(deadline);
        self.pending = true;
        self.expired = false;
    }

    fn cancel(&mut self) {
        self.deadline = None;
        self.pending = false;
        self.expired = false;
    }

    /// The flow entered a different state. A timer armed for an earlier
    /// state can no longer be delivered.
    pub(crate) fn state_changed(&mut self) {
        if !self.pending {
            self.deadline = None;
        }
        self.expired = false;
    }

    /// Bind a timer armed in this step to the state the flow now occupies.
    pub(crate) fn commit(&mut self) {
        self.pending = false;
    }
}

struct FlowSlot<S> {
    runner: Box<dyn Runnable<S>>,
    timer: FlowTimer,
}

/// What a running state can see and do.
pub struct FlowContext<'a, S> {
    service: &'a mut S,
    now: FlowTime,
    id: FlowId,
    scheduler: &'a Arc<Scheduler>,
    pub(crate) timer: &'a mut FlowTimer,
}

impl<'a, S> FlowContext<'a, S> {
    /// The executor's service object.
    pub fn service(&self) -> &S {
        &*self.service
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut *self.service
    }

    /// Current executor time.
    pub fn now(&self) -> FlowTime {
        self.now
    }

    /// The running flow.
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// A notifier that wakes the running flow.
    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.id, Arc::clone(self.scheduler))
    }

    /// Arm the flow's timer, replacing any timer already pending.
    ///
    /// The timer belongs to the state the flow suspends in after this step.
    /// If the flow has left that state when the deadline passes, nothing is
    /// delivered.
    pub fn start_timer(&mut self, delay: Duration) {
        self.timer.arm(self.now + delay);
    }

    /// Arm the timer and suspend; `next` runs when the timer fires or the
    /// flow is notified earlier.
    pub fn sleep_and_call<St>(&mut self, delay: Duration, next: St) -> Action<St> {
        self.start_timer(delay);
        Action::WaitAndCall(next)
    }

    /// True if this activation was delivered by the flow's timer rather
    /// than by an external notification.
    pub fn timer_expired(&self) -> bool {
        self.timer.expired
    }

    /// True while a timer is pending.
    pub fn timer_armed(&self) -> bool {
        self.timer.deadline.is_some()
    }

    pub fn cancel_timer(&mut self) {
        self.timer.cancel();
    }

    /// Reserve a slot from `pool` into `allocation` without blocking.
    ///
    /// On success continues at `next` immediately. Otherwise the flow parks
    /// on the pool and `next` runs once a slot has been deposited. `next`
    /// should take the lease from `allocation` and retry the reservation if
    /// it finds the cell empty.
    pub fn allocate_and_call<St>(
        &mut self,
        pool: &Pool,
        allocation: &Allocation,
        next: St,
    ) -> Action<St> {
        if pool.allocate_immediate(allocation, &self.notifier()) {
            Action::Call(next)
        } else {
            Action::WaitAndCall(next)
        }
    }

    /// Put the running flow at the back of its ready level.
    pub(crate) fn notify_self(&self) {
        self.scheduler.notify(self.id);
    }
}

/// Owns a service value and the flows that operate on it.
///
/// Flows are addressed by [`FlowId`]. Only [`Notifier`]s (and the queues,
/// pools and barriers built on them) cross thread boundaries; everything
/// else, the service included, is touched only by the thread calling
/// [`Executor::run_until_idle`] and friends.
pub struct Executor<S> {
    service: S,
    flows: Vec<Option<FlowSlot<S>>>,
    scheduler: Arc<Scheduler>,
    now: FlowTime,
    name: String,
    labels: Vec<(&'static str, String)>,
}

impl<S: 'static> Executor<S> {
    pub fn new(service: S, priority_levels: usize) -> Self {
        Executor {
            service,
            flows: Vec::new(),
            scheduler: Arc::new(Scheduler::new(priority_levels)),
            now: FlowTime::ZERO,
            name: "executor".to_string(),
            labels: MetricLabels::new("executor", "executor").to_labels(),
        }
    }

    /// Name used in logs and metric labels.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.labels = MetricLabels::new(self.name.clone(), "executor").to_labels();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a state flow, scheduled to run `initial` right away.
    pub fn spawn<F>(&mut self, flow: F, initial: F::State, priority: usize) -> FlowId
    where
        F: StateFlow<S> + 'static,
    {
        let id = self.insert(Box::new(StateRunner::new(flow, initial)), priority);
        self.scheduler.notify(id);
        id
    }

    /// Add a queue flow consuming `queue`. It parks on the queue until a
    /// message arrives.
    pub fn spawn_queue_flow<F>(&mut self, flow: F, queue: FlowQueue<F::Message>, priority: usize) -> FlowId
    where
        F: QueueFlow<S> + 'static,
        F::Message: 'static,
    {
        let id = self.insert(Box::new(QueueRunner::new(flow, queue)), priority);
        self.scheduler.notify(id);
        id
    }

    fn insert(&mut self, runner: Box<dyn Runnable<S>>, priority: usize) -> FlowId {
        let id = FlowId(self.flows.len());
        trace!(executor = %self.name, flow = %id, name = runner.name(), priority, "spawned flow");
        self.flows.push(Some(FlowSlot {
            runner,
            timer: FlowTimer::default(),
        }));
        self.scheduler.register(id, priority);
        id
    }

    /// A notifier for flow `id`, usable from any thread.
    pub fn notifier(&self, id: FlowId) -> Notifier {
        Notifier::new(id, Arc::clone(&self.scheduler))
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    pub fn now(&self) -> FlowTime {
        self.now
    }

    /// True if flow `id` has not terminated.
    pub fn is_alive(&self, id: FlowId) -> bool {
        matches!(self.flows.get(id.0), Some(Some(_)))
    }

    /// Number of flows that have not terminated.
    pub fn flow_count(&self) -> usize {
        self.flows.iter().filter(|f| f.is_some()).count()
    }

    /// True if no flow is ready to run.
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_empty()
    }

    /// Run the most urgent ready flow until it suspends. Returns false if
    /// nothing was ready.
    pub fn run_one(&mut self) -> bool {
        let Some(id) = self.scheduler.pop() else {
            return false;
        };
        let Some(mut slot) = self.flows.get_mut(id.0).and_then(Option::take) else {
            return true;
        };
        let outcome = {
            let mut ctx = FlowContext {
                service: &mut self.service,
                now: self.now,
                id,
                scheduler: &self.scheduler,
                timer: &mut slot.timer,
            };
            slot.runner.run(&mut ctx)
        };
        slot.timer.expired = false;
        metrics::counter!(metric_defs::FLOW_RUNS.name, &self.labels).increment(1);
        match outcome {
            Outcome::Suspended => self.flows[id.0] = Some(slot),
            Outcome::Terminated => {
                debug!(executor = %self.name, flow = %id, name = slot.runner.name(), "flow terminated");
                self.scheduler.retire(id);
            }
        }
        true
    }

    /// Run ready flows until none is left. Returns the number of activations.
    pub fn run_until_idle(&mut self) -> usize {
        let mut runs = 0;
        while self.run_one() {
            runs += 1;
        }
        runs
    }

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<FlowTime> {
        self.earliest_timer().map(|(_, deadline)| deadline)
    }

    fn earliest_timer(&self) -> Option<(usize, FlowTime)> {
        self.flows
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| Some((i, slot.as_ref()?.timer.deadline?)))
            .min_by_key(|&(i, deadline)| (deadline, i))
    }

    /// Move time forward to `target`, firing every timer due on the way in
    /// deadline order and running flows to idle after each.
    pub fn advance_to(&mut self, target: FlowTime) -> usize {
        let mut runs = self.run_until_idle();
        while let Some((index, deadline)) = self.earliest_timer() {
            if deadline > target {
                break;
            }
            self.now = self.now.max(deadline);
            if let Some(Some(slot)) = self.flows.get_mut(index) {
                slot.timer.deadline = None;
                slot.timer.expired = true;
            }
            trace!(executor = %self.name, flow = index, now = %self.now, "timer fired");
            self.scheduler.notify(FlowId(index));
            runs += self.run_until_idle();
        }
        self.now = self.now.max(target);
        runs
    }

    /// Move the clock forward to `now` without firing anything. Timers due
    /// by then fire on the next [`advance_to`](Self::advance_to).
    pub fn sync_clock(&mut self, now: FlowTime) {
        self.now = self.now.max(now);
    }

    pub fn advance_by(&mut self, delta: Duration) -> usize {
        let target = self.now + delta;
        self.advance_to(target)
    }

    /// Block the calling thread until some flow is ready or `timeout` passes.
    ///
    /// Used by drivers that run the executor on its own thread.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        self.scheduler.wait_for_work(timeout)
    }

    /// Drop every flow and hand back the service.
    pub fn shutdown(self) -> S {
        let Executor {
            service,
            flows,
            name,
            ..
        } = self;
        let remaining = flows.iter().filter(|f| f.is_some()).count();
        drop(flows);
        debug!(executor = %name, remaining, "executor shut down");
        service
    }
}

impl<S> std::fmt::Debug for Executor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name)
            .field("now", &self.now)
            .field("flows", &self.flows.iter().filter(|s| s.is_some()).count())
            .finish()
    }
}

//! State machines run by the executor.
//!
//! A flow is a closed enum of states plus a step function. The step function
//! never blocks: anything that would wait returns an [`Action`] that
//! suspends, and the flow resumes when a notifier, a pool or its timer wakes
//! it.

use std::fmt::Debug;

use crate::action::Action;
use crate::buffer::Message;
use crate::executor::{FlowContext, Outcome, Runnable};
use crate::queue::FlowQueue;

/// A single-active-state cooperative machine.
pub trait StateFlow<S> {
    type State: Copy + Eq + Debug;

    /// Run `state` once.
    fn step(&mut self, state: Self::State, ctx: &mut FlowContext<'_, S>) -> Action<Self::State>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A state machine that drains a [`FlowQueue`] one message at a time.
///
/// Each message enters at [`QueueFlow::entry`] and stays with the flow until
/// a state returns [`Action::ReleaseAndExit`], which drops the message and
/// returns the flow to waiting for the next one. Returning [`Action::Exit`]
/// from a queue flow is a bug and panics.
pub trait QueueFlow<S> {
    type Message;
    type State: Copy + Eq + Debug;

    fn entry(
        &mut self,
        msg: &mut Message<Self::Message>,
        ctx: &mut FlowContext<'_, S>,
    ) -> Action<Self::State>;

    fn step(
        &mut self,
        state: Self::State,
        msg: &mut Message<Self::Message>,
        ctx: &mut FlowContext<'_, S>,
    ) -> Action<Self::State>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

pub(crate) struct StateRunner<F, St> {
    flow: F,
    state: St,
}

impl<F, St> StateRunner<F, St> {
    pub(crate) fn new(flow: F, initial: St) -> Self {
        StateRunner {
            flow,
            state: initial,
        }
    }
}

/// Move to `next`. Leaving the current state disarms a timer armed for it.
fn enter<S, St: PartialEq>(state: &mut St, next: St, ctx: &mut FlowContext<'_, S>) {
    if *state != next {
        *state = next;
        ctx.timer.state_changed();
    }
    ctx.timer.commit();
}

impl<S, F> Runnable<S> for StateRunner<F, F::State>
where
    F: StateFlow<S>,
{
    fn run(&mut self, ctx: &mut FlowContext<'_, S>) -> Outcome {
        loop {
            match self.flow.step(self.state, ctx) {
                Action::Again => ctx.timer.commit(),
                Action::Call(next) => enter(&mut self.state, next, ctx),
                Action::Wait => {
                    ctx.timer.commit();
                    return Outcome::Suspended;
                }
                Action::WaitAndCall(next) => {
                    enter(&mut self.state, next, ctx);
                    return Outcome::Suspended;
                }
                Action::YieldAndCall(next) => {
                    enter(&mut self.state, next, ctx);
                    ctx.notify_self();
                    return Outcome::Suspended;
                }
                Action::Exit | Action::ReleaseAndExit => {
                    ctx.cancel_timer();
                    return Outcome::Terminated;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        self.flow.name()
    }
}

struct Active<M, St> {
    msg: Message<M>,
    /// `None` until the entry step has handed over to a named state.
    state: Option<St>,
}

pub(crate) struct QueueRunner<F, M, St> {
    flow: F,
    queue: FlowQueue<M>,
    current: Option<Active<M, St>>,
}

impl<F, M, St> QueueRunner<F, M, St> {
    pub(crate) fn new(flow: F, queue: FlowQueue<M>) -> Self {
        QueueRunner {
            flow,
            queue,
            current: None,
        }
    }
}

impl<S, F> Runnable<S> for QueueRunner<F, F::Message, F::State>
where
    F: QueueFlow<S>,
{
    fn run(&mut self, ctx: &mut FlowContext<'_, S>) -> Outcome {
        loop {
            let Some(active) = self.current.as_mut() else {
                match self.queue.take_or_park(&ctx.notifier()) {
                    Some(msg) => {
                        self.current = Some(Active { msg, state: None });
                        continue;
                    }
                    None => return Outcome::Suspended,
                }
            };

            let action = match active.state {
                None => self.flow.entry(&mut active.msg, ctx),
                Some(state) => self.flow.step(state, &mut active.msg, ctx),
            };

            match action {
                Action::Again => ctx.timer.commit(),
                Action::Call(next) => enter(&mut active.state, Some(next), ctx),
                Action::Wait => {
                    ctx.timer.commit();
                    return Outcome::Suspended;
                }
                Action::WaitAndCall(next) => {
                    enter(&mut active.state, Some(next), ctx);
                    return Outcome::Suspended;
                }
                Action::YieldAndCall(next) => {
                    enter(&mut active.state, Some(next), ctx);
                    ctx.notify_self();
                    return Outcome::Suspended;
                }
                Action::ReleaseAndExit => {
                    ctx.cancel_timer();
                    self.current = None;
                    // Let other flows run before the next message.
                    ctx.notify_self();
                    return Outcome::Suspended;
                }
                Action::Exit => panic!(
                    "queue flow {} exited without releasing its message",
                    self.flow.name()
                ),
            }
        }
    }

    fn name(&self) -> &'static str {
        self.flow.name()
    }
}

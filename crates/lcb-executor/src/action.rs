//! The continuation a state handler returns.

/// What the flow does after a state handler returns.
///
/// Handlers build these through the named constructors, which mirror the
/// primitives flows are written in terms of. `S` is the flow's closed set of
/// state identifiers; an action never carries data beyond a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<S> {
    /// Run the current state again without yielding.
    Again,
    /// Move to the given state without yielding the processor.
    Call(S),
    /// Suspend in the current state until notified.
    Wait,
    /// Suspend; the given state runs on the next notification.
    WaitAndCall(S),
    /// Move to the given state after going to the back of the ready queue.
    YieldAndCall(S),
    /// Terminate the flow, keeping the in-flight message.
    Exit,
    /// Release the in-flight message and terminate the current activity.
    ReleaseAndExit,
}

impl<S> Action<S> {
    /// Re-invoke the current state.
    pub fn again() -> Self {
        Action::Again
    }

    /// Continue at `state` immediately.
    pub fn call_immediately(state: S) -> Self {
        Action::Call(state)
    }

    /// Suspend until notified, then re-run the current state.
    pub fn wait() -> Self {
        Action::Wait
    }

    /// Suspend until notified, then continue at `state`.
    pub fn wait_and_call(state: S) -> Self {
        Action::WaitAndCall(state)
    }

    /// Give other ready flows a turn, then continue at `state`.
    pub fn yield_and_call(state: S) -> Self {
        Action::YieldAndCall(state)
    }

    /// Terminate without releasing the in-flight message.
    pub fn exit() -> Self {
        Action::Exit
    }

    /// Release the in-flight message and terminate.
    pub fn release_and_exit() -> Self {
        Action::ReleaseAndExit
    }

    /// True if the flow gives up the processor after this action.
    pub fn suspends(&self) -> bool {
        !matches!(self, Action::Again | Action::Call(_))
    }

    /// The state the flow continues at, if the action names one.
    pub fn next_state(&self) -> Option<&S> {
        match self {
            Action::Call(s) | Action::WaitAndCall(s) | Action::YieldAndCall(s) => Some(s),
            _ => None,
        }
    }
}

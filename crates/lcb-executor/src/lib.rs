//! Cooperative state-machine flows on a single-threaded executor.
//!
//! A flow is a closed enum of states and a step function returning an
//! [`Action`]. The [`Executor`] owns every flow together with a service value
//! the flows operate on, and runs ready flows in priority order until each
//! suspends. Time is virtual: timers only fire when the owner advances the
//! executor clock.
//!
//! # Crossing threads
//!
//! Flow code and the service only ever run on the thread driving the
//! executor. Other threads interact through:
//!
//! - [`Notifier`]: wakes one flow;
//! - [`FlowQueue`]: feeds messages to queue flows in priority order;
//! - [`Pool`]: bounded message slots, with blocking and flow-friendly
//!   reservation;
//! - [`Barrier`] / [`Done`]: completion accounting for handlers that may
//!   finish later.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use lcb_executor::{Action, Executor, FlowContext, StateFlow};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! enum Blink { On, Off }
//!
//! struct Blinker;
//!
//! impl StateFlow<u32> for Blinker {
//!     type State = Blink;
//!
//!     fn step(&mut self, state: Blink, ctx: &mut FlowContext<'_, u32>) -> Action<Blink> {
//!         match state {
//!             Blink::On => {
//!                 *ctx.service_mut() += 1;
//!                 ctx.sleep_and_call(Duration::from_millis(500), Blink::Off)
//!             }
//!             Blink::Off => ctx.sleep_and_call(Duration::from_millis(500), Blink::On),
//!         }
//!     }
//! }
//!
//! let mut exec = Executor::new(0u32, 1);
//! exec.spawn(Blinker, Blink::On, 0);
//! exec.advance_by(Duration::from_secs(2));
//! assert_eq!(*exec.service(), 3);
//! ```

mod action;
mod buffer;
mod error;
mod executor;
mod flow;
mod notify;
mod queue;
mod time;

pub use action::Action;
pub use buffer::{Allocation, Lease, Message, Pool};
pub use error::{PoolError, PoolResult};
pub use executor::{Executor, FlowContext};
pub use flow::{QueueFlow, StateFlow};
pub use notify::{Barrier, Done, FlowId, Notifier};
pub use queue::{FlowQueue, PriorityQueue};
pub use time::FlowTime;

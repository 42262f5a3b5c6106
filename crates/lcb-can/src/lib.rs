//! # lcb-can
//!
//! OpenLCB over CAN: the network interface that gives nodes bus aliases and
//! moves their messages.
//!
//! - **Alias allocation**: Check-ID / Reserve-ID reservation with contention
//!   and conflict handling, plus defence of aliases already in use.
//! - **Alias caches**: local and remote Node ID / alias maps.
//! - **Dispatch**: identifier/mask frame handlers and MTI/mask message
//!   handlers, each handed its own completion signal.
//! - **Writes**: global and addressed messages, fragmentation, destination
//!   lookup with AME then Verify Node ID escalation.
//! - **GridConnect**: the `:X...N...;` text form of frames.
//!
//! An interface runs on an [`lcb_executor::Executor`]; time only moves when
//! the owner advances it, so protocol timeouts are deterministic in tests.
//!
//! ```rust
//! use crossbeam_channel::unbounded;
//! use lcb_can::{CanFrame, Completion, IfCanBuilder, Mti, NodeAlias, NodeId};
//!
//! let node = NodeId::new(0x02010D000003);
//! let (tx, bus) = unbounded();
//! let (mut exec, handle) = IfCanBuilder::new(node).build(tx);
//! exec.service_mut().add_local_node(node, NodeAlias::new(0x22A));
//!
//! handle
//!     .write_global(Mti::EVENT_REPORT, node, vec![1, 2, 3, 4, 5, 6, 7, 8], Completion::ignore())
//!     .unwrap();
//! exec.run_until_idle();
//!
//! let frame: CanFrame = bus.try_recv().unwrap();
//! assert_eq!(frame.to_string(), ":X195B422AN0102030405060708;");
//! ```

mod alias_alloc;
mod alias_cache;
mod alias_gen;
mod completion;
mod config;
mod dispatch;
mod error;
mod fragment;
mod frame;
mod iface;
mod mti;
mod node;
mod rx;
mod write;

pub use alias_cache::{AliasCache, AliasEntry, AliasState};
pub use alias_gen::{AliasSource, PrngAliasSource, RandomAliasSource, ScriptedAliasSource};
pub use completion::{Completion, CompletionReceiver};
pub use config::IfConfig;
pub use dispatch::{Dispatcher, FrameHandler, IncomingMessage, MessageHandler};
pub use error::{FrameError, IfError, IfResult};
pub use fragment::{fragment_addressed, parse_addressed, Continuation, Reassembler, ADDRESSED_CHUNK};
pub use frame::{cid_id, control_id, frame_type, message_id, CanFrame, ControlType, FrameKind};
pub use iface::{FrameSink, IfCan, IfCanBuilder, IfHandle};
pub use mti::Mti;
pub use node::{NodeAlias, NodeHandle, NodeId};

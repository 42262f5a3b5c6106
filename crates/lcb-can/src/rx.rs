//! Receive path: alias protocol upkeep, frame dispatch and message decoding.

use lcb_executor::{Action, Barrier, FlowContext, Message, QueueFlow};
use lcb_metrics::metric_defs;
use tracing::{debug, trace, warn};

use crate::alias_cache::AliasState;
use crate::dispatch::IncomingMessage;
use crate::fragment::parse_addressed;
use crate::frame::{control_id, frame_type, message_id, CanFrame, ControlType, FrameKind};
use crate::iface::IfCan;
use crate::mti::Mti;
use crate::node::{NodeAlias, NodeHandle, NodeId};

/// What the receive flow consumes.
#[derive(Debug, Clone)]
pub(crate) enum Inbound {
    /// A frame from the bus.
    Frame(CanFrame),
    /// A message written locally and addressed to (or visible to) local nodes.
    Loopback(IncomingMessage),
}

impl IfCan {
    /// Update alias state from one received extended frame and answer what
    /// the interface itself must answer.
    pub(crate) fn process_frame(&mut self, frame: &CanFrame) {
        let Some(kind) = frame.kind() else {
            return;
        };
        let src = frame.source();
        match kind {
            FrameKind::CheckId { seq, segment } => self.on_check_id(src, seq, segment),
            FrameKind::Control(control) => {
                self.on_alias_used(src);
                self.on_control(src, control, frame.data());
            }
            FrameKind::Message { frame_type: ty, mti } => {
                self.on_alias_used(src);
                if ty == frame_type::GLOBAL_ADDRESSED {
                    self.on_message(src, mti, frame.data());
                }
            }
        }
    }

    fn on_check_id(&mut self, src: NodeAlias, seq: u8, segment: u16) {
        if self.alloc.candidate.map(|c| c.alias) == Some(src) && self.contest_candidate(seq, segment) {
            self.lose_candidate();
        }
        match self.local.state(src) {
            AliasState::Reserved | AliasState::Bound => {
                debug!(iface = %self.name, alias = %src, seq, "defending alias");
                self.send_frame(CanFrame::eff(control_id(ControlType::Rid, src), &[]));
            }
            _ => {
                if self.remote.remove(src).is_some() {
                    debug!(iface = %self.name, alias = %src, "remote alias being reclaimed");
                }
            }
        }
    }

    /// A non-CID frame from `src`. If that is one of ours, someone else has it.
    fn on_alias_used(&mut self, src: NodeAlias) {
        if self.alloc.candidate.map(|c| c.alias) == Some(src) {
            self.lose_candidate();
        }
        if let Some(entry) = self.local.conflict(src) {
            self.count(&metric_defs::ALIAS_CONFLICTS);
            warn!(
                iface = %self.name,
                alias = %src,
                node = ?entry.node,
                "alias conflict, giving it up"
            );
            if entry.node.is_some() {
                self.kick();
            }
        }
    }

    fn on_control(&mut self, src: NodeAlias, control: ControlType, data: &[u8]) {
        match control {
            ControlType::Amd => {
                if let Some(node) = NodeId::from_bytes(data) {
                    self.learn_remote(node, src);
                }
            }
            ControlType::Amr => {
                if let Some(node) = NodeId::from_bytes(data) {
                    self.remote.remove_node(node);
                }
                self.remote.remove(src);
            }
            ControlType::Ame => {
                let target = NodeId::from_bytes(data);
                let replies: Vec<(NodeId, NodeAlias)> = self
                    .local
                    .bound()
                    .filter(|(node, _)| target.map_or(true, |t| t == *node))
                    .collect();
                for (node, alias) in replies {
                    self.send_frame(CanFrame::eff(control_id(ControlType::Amd, alias), &node.to_bytes()));
                }
            }
            ControlType::Rid | ControlType::Other(_) => {}
        }
    }

    fn on_message(&mut self, src: NodeAlias, mti: Mti, data: &[u8]) {
        if mti == Mti::VERIFIED_NODE_ID || mti == Mti::VERIFIED_NODE_ID_SIMPLE {
            if let Some(node) = NodeId::from_bytes(data) {
                self.learn_remote(node, src);
            }
        } else if mti == Mti::VERIFY_NODE_ID_GLOBAL {
            let target = NodeId::from_bytes(data);
            let replies: Vec<(NodeId, NodeAlias)> = self
                .local
                .bound()
                .filter(|(node, _)| target.map_or(true, |t| t == *node))
                .collect();
            for (node, alias) in replies {
                self.send_frame(CanFrame::eff(message_id(Mti::VERIFIED_NODE_ID, alias), &node.to_bytes()));
            }
        }
    }

    /// Record a remote binding and wake writers looking for it.
    fn learn_remote(&mut self, node: NodeId, alias: NodeAlias) {
        if self.local_node_for(alias).is_some() {
            return;
        }
        trace!(iface = %self.name, node = %node, alias = %alias, "learned remote alias");
        self.remote.add(node, alias);
        self.resolve_lookup(node);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxState {
    FrameHandlers,
    AwaitFrameHandlers,
    ParseMessage,
    MessageHandlers,
    AwaitMessageHandlers,
}

/// Drains the receive queue: one frame or looped-back message at a time,
/// held until every handler has signalled done.
pub(crate) struct RxFlow {
    barrier: Option<Barrier>,
    message: Option<IncomingMessage>,
}

impl RxFlow {
    pub(crate) fn new() -> Self {
        RxFlow {
            barrier: None,
            message: None,
        }
    }

    fn release(&mut self) -> Action<RxState> {
        self.barrier = None;
        self.message = None;
        Action::release_and_exit()
    }

    fn await_barrier(&mut self, mut barrier: Barrier, next: RxState, waiting: RxState) -> Action<RxState> {
        if barrier.seal() {
            Action::call_immediately(next)
        } else {
            self.barrier = Some(barrier);
            Action::wait_and_call(waiting)
        }
    }

    fn barrier_done(&self) -> bool {
        self.barrier.as_ref().map_or(true, Barrier::is_complete)
    }

    fn decode(svc: &mut IfCan, frame: &CanFrame) -> Option<IncomingMessage> {
        let Some(FrameKind::Message {
            frame_type: frame_type::GLOBAL_ADDRESSED,
            mti,
        }) = frame.kind()
        else {
            return None;
        };
        let src_alias = frame.source();
        let src = NodeHandle {
            id: svc.remote.lookup_by_alias(src_alias),
            alias: Some(src_alias),
        };

        if !mti.is_addressed() {
            return Some(IncomingMessage {
                mti,
                src,
                dst: None,
                dst_node: None,
                payload: frame.data().to_vec(),
            });
        }

        let Some((cont, dst_alias, body)) = parse_addressed(frame.data()) else {
            svc.count(&metric_defs::FRAMES_DROPPED);
            debug!(iface = %svc.name, frame = %frame, "addressed frame without destination");
            return None;
        };
        let dst_node = svc.local_node_for(dst_alias)?;
        let payload = svc.reassembler.push(src_alias, dst_alias, mti, cont, body)?;
        Some(IncomingMessage {
            mti,
            src,
            dst: Some(NodeHandle::new(dst_node, dst_alias)),
            dst_node: Some(dst_node),
            payload,
        })
    }
}

impl QueueFlow<IfCan> for RxFlow {
    type Message = Inbound;
    type State = RxState;

    fn entry(&mut self, msg: &mut Message<Inbound>, ctx: &mut FlowContext<'_, IfCan>) -> Action<RxState> {
        match msg.payload() {
            Inbound::Frame(frame) => {
                let frame = *frame;
                let svc = ctx.service_mut();
                svc.count(&metric_defs::FRAMES_RX);
                trace!(iface = %svc.name, frame = %frame, "rx");
                if !frame.is_extended() {
                    svc.count(&metric_defs::FRAMES_DROPPED);
                    debug!(iface = %svc.name, frame = %frame, "dropping standard frame");
                    return self.release();
                }
                svc.process_frame(&frame);
                Action::call_immediately(RxState::FrameHandlers)
            }
            Inbound::Loopback(message) => {
                self.message = Some(message.clone());
                Action::call_immediately(RxState::MessageHandlers)
            }
        }
    }

    fn step(
        &mut self,
        state: RxState,
        msg: &mut Message<Inbound>,
        ctx: &mut FlowContext<'_, IfCan>,
    ) -> Action<RxState> {
        match state {
            RxState::FrameHandlers => {
                let Inbound::Frame(frame) = msg.payload() else {
                    return self.release();
                };
                let handlers = ctx.service().shared.frame_handlers.lock().matching(frame.id());
                let barrier = Barrier::new(ctx.notifier());
                for handler in handlers {
                    ctx.service().count(&metric_defs::HANDLER_CALLS);
                    handler.handle_frame(frame, barrier.child());
                }
                self.await_barrier(barrier, RxState::ParseMessage, RxState::AwaitFrameHandlers)
            }
            RxState::AwaitFrameHandlers => {
                if self.barrier_done() {
                    self.barrier = None;
                    Action::call_immediately(RxState::ParseMessage)
                } else {
                    Action::wait()
                }
            }
            RxState::ParseMessage => {
                let Inbound::Frame(frame) = msg.payload() else {
                    return self.release();
                };
                match Self::decode(ctx.service_mut(), frame) {
                    Some(message) => {
                        self.message = Some(message);
                        Action::call_immediately(RxState::MessageHandlers)
                    }
                    None => self.release(),
                }
            }
            RxState::MessageHandlers => {
                let Some(message) = self.message.as_ref() else {
                    return self.release();
                };
                let key = u32::from(message.mti.raw());
                let handlers = ctx.service().shared.message_handlers.lock().matching(key);
                let barrier = Barrier::new(ctx.notifier());
                for handler in handlers {
                    ctx.service().count(&metric_defs::HANDLER_CALLS);
                    handler.handle_message(message, barrier.child());
                }
                self.await_barrier(barrier, RxState::AwaitMessageHandlers, RxState::AwaitMessageHandlers)
            }
            RxState::AwaitMessageHandlers => {
                if self.barrier_done() {
                    self.release()
                } else {
                    Action::wait()
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "can-rx"
    }
}

//! Outbound message flows.
//!
//! Each write flow owns one request from dequeue to completion: it finds a
//! source alias (reserving one if the node has none), resolves the
//! destination for addressed messages, then emits every frame of the
//! message before taking the next request. Lookups for the same destination
//! are shared: the first writer leads and sends the enquiries, later ones
//! follow and only wait for the outcome.

use std::sync::Arc;

use lcb_executor::{Action, FlowContext, Message, Notifier, QueueFlow};
use lcb_metrics::metric_defs;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::completion::Completion;
use crate::dispatch::IncomingMessage;
use crate::error::{IfError, IfResult};
use crate::fragment::fragment_addressed;
use crate::frame::{control_id, message_id, CanFrame, ControlType};
use crate::iface::IfCan;
use crate::mti::Mti;
use crate::node::{NodeAlias, NodeHandle, NodeId};
use crate::rx::Inbound;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Global,
    Addressed,
}

impl WriteKind {
    fn as_str(&self) -> &'static str {
        match self {
            WriteKind::Global => "global",
            WriteKind::Addressed => "addressed",
        }
    }
}

/// One queued write.
pub(crate) struct WriteRequest {
    pub(crate) kind: WriteKind,
    pub(crate) mti: Mti,
    pub(crate) src: NodeId,
    pub(crate) dst: NodeHandle,
    pub(crate) payload: Vec<u8>,
    completion: Option<Completion>,
}

impl WriteRequest {
    pub(crate) fn new(
        kind: WriteKind,
        mti: Mti,
        src: NodeId,
        dst: NodeHandle,
        payload: Vec<u8>,
        completion: Completion,
    ) -> Self {
        WriteRequest {
            kind,
            mti,
            src,
            dst,
            payload,
            completion: Some(completion),
        }
    }

    pub(crate) fn complete(&mut self, result: IfResult<()>) {
        if let Some(completion) = self.completion.take() {
            completion.complete(result);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupOutcome {
    Resolved,
    Abandoned,
}

/// Set once when the lookup ends; every writer on it holds a clone.
type OutcomeCell = Arc<Mutex<Option<LookupOutcome>>>;

/// An alias lookup in flight for one destination.
#[derive(Debug)]
pub(crate) struct PendingLookup {
    generation: u64,
    waiters: Vec<Notifier>,
    outcome: OutcomeCell,
}

impl IfCan {
    /// A binding for `node` arrived: end its lookup and wake every writer on it.
    pub(crate) fn resolve_lookup(&mut self, node: NodeId) {
        if let Some(lookup) = self.lookups.remove(&node) {
            trace!(iface = %self.name, node = %node, waiters = lookup.waiters.len(), "lookup resolved");
            *lookup.outcome.lock() = Some(LookupOutcome::Resolved);
            for waiter in lookup.waiters {
                waiter.notify();
            }
            self.publish_lookups();
        }
    }

    /// End lookup `generation` for `node` without a binding.
    fn abandon_lookup(&mut self, node: NodeId, generation: u64) {
        if self.lookups.get(&node).map(|l| l.generation) != Some(generation) {
            return;
        }
        if let Some(lookup) = self.lookups.remove(&node) {
            *lookup.outcome.lock() = Some(LookupOutcome::Abandoned);
            for waiter in lookup.waiters {
                waiter.notify();
            }
            self.publish_lookups();
        }
    }

    fn lookup_generation_of(&self, node: NodeId) -> Option<u64> {
        self.lookups.get(&node).map(|l| l.generation)
    }

    fn loopback(&self, message: IncomingMessage) {
        self.shared.rx_queue.send(Message::new(Inbound::Loopback(message)), 0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteState {
    GetSrcAlias,
    ResolveDst,
    AwaitLookup,
    SendAme,
    AwaitAme,
    SendVerify,
    AwaitVerify,
    Send,
}

/// Serves either the global or the addressed write queue.
pub(crate) struct WriteFlow {
    kind: WriteKind,
    src_alias: Option<NodeAlias>,
    /// The source alias was reserved for this very write.
    fresh_alias: bool,
    dst_alias: Option<NodeAlias>,
    lookup: Option<u64>,
    outcome: Option<OutcomeCell>,
    leader: bool,
}

impl WriteFlow {
    pub(crate) fn new(kind: WriteKind) -> Self {
        WriteFlow {
            kind,
            src_alias: None,
            fresh_alias: false,
            dst_alias: None,
            lookup: None,
            outcome: None,
            leader: false,
        }
    }

    fn reset(&mut self) {
        self.src_alias = None;
        self.fresh_alias = false;
        self.dst_alias = None;
        self.lookup = None;
        self.outcome = None;
        self.leader = false;
    }

    fn finish(
        &mut self,
        msg: &mut Message<WriteRequest>,
        ctx: &mut FlowContext<'_, IfCan>,
        result: IfResult<()>,
    ) -> Action<WriteState> {
        let svc = ctx.service();
        let outcome = match &result {
            Ok(()) => "ok",
            Err(IfError::LookupTimeout { .. }) => "lookup_timeout",
            Err(_) => "rejected",
        };
        let labels = svc.labels.with(&[
            ("kind", self.kind.as_str().to_string()),
            ("result", outcome.to_string()),
        ]);
        metrics::counter!(metric_defs::WRITE_COMPLETED.name, &labels).increment(1);
        if let Err(err) = &result {
            debug!(iface = %svc.name, mti = %msg.payload().mti, error = %err, "write failed");
        }
        msg.payload_mut().complete(result);
        self.reset();
        Action::release_and_exit()
    }

    fn after_src_alias(&self) -> Action<WriteState> {
        match self.kind {
            WriteKind::Global => Action::call_immediately(WriteState::Send),
            WriteKind::Addressed => Action::call_immediately(WriteState::ResolveDst),
        }
    }

    /// Destination id for lookup states.
    fn dst_id(msg: &Message<WriteRequest>) -> Option<NodeId> {
        msg.payload().dst.id
    }

    fn remote_hit(&mut self, svc: &IfCan, node: NodeId) -> bool {
        match svc.remote.lookup_by_node(node) {
            Some(alias) => {
                self.dst_alias = Some(alias);
                true
            }
            None => false,
        }
    }

    fn lookup_outcome(&self) -> Option<LookupOutcome> {
        self.outcome.as_ref().and_then(|cell| *cell.lock())
    }

    /// The lookup ended with a binding that was gone again before this
    /// writer saw it. Start over with a new lookup.
    fn restart_lookup(&mut self, svc: &IfCan, node: NodeId) -> Action<WriteState> {
        debug!(iface = %svc.name, node = %node, "resolved binding already evicted, looking up again");
        self.lookup = None;
        self.outcome = None;
        self.leader = false;
        Action::call_immediately(WriteState::ResolveDst)
    }

    fn send_frames(&self, svc: &mut IfCan, req: &WriteRequest, src: NodeAlias) {
        if req.mti.is_addressed() {
            let dst = match req.kind {
                WriteKind::Global => NodeAlias::new(0),
                WriteKind::Addressed => self.dst_alias.unwrap_or(NodeAlias::new(0)),
            };
            for data in fragment_addressed(dst, &req.payload) {
                svc.send_frame(CanFrame::eff(message_id(req.mti, src), &data));
            }
        } else {
            svc.send_frame(CanFrame::eff(message_id(req.mti, src), &req.payload));
        }
    }
}

impl QueueFlow<IfCan> for WriteFlow {
    type Message = WriteRequest;
    type State = WriteState;

    fn entry(&mut self, msg: &mut Message<WriteRequest>, ctx: &mut FlowContext<'_, IfCan>) -> Action<WriteState> {
        self.reset();
        let req = msg.payload();
        let (mti, src, dst) = (req.mti, req.src, req.dst);

        if !mti.fits_frame() {
            return self.finish(msg, ctx, Err(IfError::UnsupportedMti { mti }));
        }

        match self.kind {
            WriteKind::Global => {
                if !mti.is_addressed() && req.payload.len() > CanFrame::MAX_DATA {
                    let len = req.payload.len();
                    return self.finish(msg, ctx, Err(IfError::PayloadTooLarge { len, max: CanFrame::MAX_DATA }));
                }
                let svc = ctx.service();
                svc.loopback(IncomingMessage {
                    mti,
                    src: NodeHandle {
                        id: Some(src),
                        alias: svc.local.lookup_by_node(src),
                    },
                    dst: None,
                    dst_node: None,
                    payload: req.payload.clone(),
                });
            }
            WriteKind::Addressed => {
                if !mti.is_addressed() || dst.is_empty() {
                    return self.finish(msg, ctx, Err(IfError::InvalidDestination));
                }
                let svc = ctx.service();
                if let Some(local) = svc.local_destination(&dst) {
                    trace!(iface = %svc.name, dst = %local, mti = %mti, "addressed write stays local");
                    svc.loopback(IncomingMessage {
                        mti,
                        src: NodeHandle {
                            id: Some(src),
                            alias: svc.local.lookup_by_node(src),
                        },
                        dst: Some(local),
                        dst_node: local.id,
                        payload: req.payload.clone(),
                    });
                    return self.finish(msg, ctx, Ok(()));
                }
            }
        }
        Action::call_immediately(WriteState::GetSrcAlias)
    }

    fn step(
        &mut self,
        state: WriteState,
        msg: &mut Message<WriteRequest>,
        ctx: &mut FlowContext<'_, IfCan>,
    ) -> Action<WriteState> {
        match state {
            WriteState::GetSrcAlias => {
                let src = msg.payload().src;
                let notifier = ctx.notifier();
                let svc = ctx.service_mut();
                if let Some(alias) = svc.local.lookup_by_node(src) {
                    self.src_alias = Some(alias);
                    return self.after_src_alias();
                }
                if let Some(alias) = svc.take_reserved(src) {
                    self.src_alias = Some(alias);
                    self.fresh_alias = true;
                    return self.after_src_alias();
                }
                svc.wait_for_alias(notifier);
                Action::wait()
            }

            WriteState::ResolveDst => {
                let dst = msg.payload().dst;
                let notifier = ctx.notifier();
                let svc = ctx.service_mut();
                if let Some(id) = dst.id {
                    if self.remote_hit(svc, id) {
                        return Action::call_immediately(WriteState::Send);
                    }
                }
                if let Some(alias) = dst.alias.filter(NodeAlias::is_valid) {
                    self.dst_alias = Some(alias);
                    return Action::call_immediately(WriteState::Send);
                }
                let Some(id) = dst.id else {
                    return self.finish(msg, ctx, Err(IfError::InvalidDestination));
                };

                if let Some(lookup) = svc.lookups.get_mut(&id) {
                    lookup.waiters.push(notifier);
                    self.lookup = Some(lookup.generation);
                    self.outcome = Some(Arc::clone(&lookup.outcome));
                    trace!(iface = %svc.name, node = %id, "joining lookup");
                    return Action::wait_and_call(WriteState::AwaitLookup);
                }

                let generation = svc.next_lookup_generation();
                let outcome = OutcomeCell::default();
                svc.lookups.insert(
                    id,
                    PendingLookup {
                        generation,
                        waiters: vec![notifier],
                        outcome: Arc::clone(&outcome),
                    },
                );
                svc.publish_lookups();
                self.lookup = Some(generation);
                self.outcome = Some(outcome);
                self.leader = true;
                if self.fresh_alias {
                    Action::call_immediately(WriteState::SendVerify)
                } else {
                    Action::call_immediately(WriteState::SendAme)
                }
            }

            WriteState::AwaitLookup => {
                let Some(id) = Self::dst_id(msg) else {
                    return self.finish(msg, ctx, Err(IfError::InvalidDestination));
                };
                if self.remote_hit(ctx.service(), id) {
                    return Action::call_immediately(WriteState::Send);
                }
                match self.lookup_outcome() {
                    None => Action::wait(),
                    Some(LookupOutcome::Resolved) => self.restart_lookup(ctx.service(), id),
                    Some(LookupOutcome::Abandoned) => {
                        self.finish(msg, ctx, Err(IfError::LookupTimeout { node: id }))
                    }
                }
            }

            WriteState::SendAme => {
                let (Some(id), Some(src)) = (Self::dst_id(msg), self.src_alias) else {
                    return self.finish(msg, ctx, Err(IfError::InvalidDestination));
                };
                let svc = ctx.service_mut();
                svc.send_frame(CanFrame::eff(control_id(ControlType::Ame, src), &id.to_bytes()));
                let timeout = svc.config.alias_lookup_timeout();
                ctx.sleep_and_call(timeout, WriteState::AwaitAme)
            }

            WriteState::AwaitAme => {
                let Some(id) = Self::dst_id(msg) else {
                    return self.finish(msg, ctx, Err(IfError::InvalidDestination));
                };
                if self.remote_hit(ctx.service(), id) {
                    return Action::call_immediately(WriteState::Send);
                }
                if self.lookup_outcome() == Some(LookupOutcome::Resolved) {
                    return self.restart_lookup(ctx.service(), id);
                }
                if !ctx.timer_expired() {
                    return Action::wait();
                }
                let svc = ctx.service();
                svc.count(&metric_defs::LOOKUP_ESCALATIONS);
                debug!(iface = %svc.name, node = %id, "no AMD, escalating to verify node id");
                Action::call_immediately(WriteState::SendVerify)
            }

            WriteState::SendVerify => {
                let (Some(id), Some(src)) = (Self::dst_id(msg), self.src_alias) else {
                    return self.finish(msg, ctx, Err(IfError::InvalidDestination));
                };
                let svc = ctx.service_mut();
                svc.send_frame(CanFrame::eff(
                    message_id(Mti::VERIFY_NODE_ID_GLOBAL, src),
                    &id.to_bytes(),
                ));
                let timeout = svc.config.verify_timeout();
                ctx.sleep_and_call(timeout, WriteState::AwaitVerify)
            }

            WriteState::AwaitVerify => {
                let Some(id) = Self::dst_id(msg) else {
                    return self.finish(msg, ctx, Err(IfError::InvalidDestination));
                };
                if self.remote_hit(ctx.service(), id) {
                    return Action::call_immediately(WriteState::Send);
                }
                if self.lookup_outcome() == Some(LookupOutcome::Resolved) {
                    return self.restart_lookup(ctx.service(), id);
                }
                if !ctx.timer_expired() {
                    return Action::wait();
                }
                let svc = ctx.service_mut();
                if let Some(generation) = self.lookup {
                    svc.abandon_lookup(id, generation);
                }
                svc.count(&metric_defs::LOOKUP_TIMEOUTS);
                warn!(iface = %svc.name, node = %id, "destination did not answer alias lookup");
                self.finish(msg, ctx, Err(IfError::LookupTimeout { node: id }))
            }

            WriteState::Send => {
                let Some(src) = self.src_alias else {
                    return Action::call_immediately(WriteState::GetSrcAlias);
                };
                let svc = ctx.service_mut();
                let node = msg.payload().src;
                if svc.local.lookup_by_node(node) != Some(src) {
                    // Lost to a conflict while resolving the destination.
                    debug!(iface = %svc.name, alias = %src, node = %node, "source alias gone, rebinding");
                    self.src_alias = None;
                    self.fresh_alias = false;
                    return Action::call_immediately(WriteState::GetSrcAlias);
                }
                if self.leader {
                    if let (Some(id), Some(generation)) = (msg.payload().dst.id, self.lookup) {
                        if svc.lookup_generation_of(id) == Some(generation) {
                            svc.resolve_lookup(id);
                        }
                    }
                }
                self.send_frames(svc, msg.payload(), src);
                self.finish(msg, ctx, Ok(()))
            }
        }
    }

    fn name(&self) -> &'static str {
        match self.kind {
            WriteKind::Global => "can-write-global",
            WriteKind::Addressed => "can-write-addressed",
        }
    }
}

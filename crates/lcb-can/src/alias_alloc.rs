//! Alias reservation: the Check-ID / Reserve-ID exchange and its defence.
//!
//! The allocator flow sleeps until a writer needs an alias or the reserved
//! queue falls below its target. It then claims a candidate with four CID
//! frames, waits out the contention window, and reserves the alias with RID.
//! Any use of the candidate by someone else during the window sends it back
//! to pick another.

use std::cmp::Ordering;
use std::collections::VecDeque;

use lcb_executor::{Action, FlowContext, Notifier, StateFlow};
use lcb_metrics::metric_defs;
use tracing::{debug, info, warn};

use crate::alias_cache::AliasState;
use crate::alias_gen::AliasSource;
use crate::frame::{cid_id, control_id, CanFrame, ControlType};
use crate::iface::IfCan;
use crate::node::{NodeAlias, NodeId};

/// Candidates drawn per pick before yielding.
const PICK_ATTEMPTS: usize = 64;

/// CID sequence numbers in transmit order.
const CID_SEQUENCE: [u8; 4] = [7, 6, 5, 4];

#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub(crate) alias: NodeAlias,
    pub(crate) conflicted: bool,
    /// Node ID segments another claimant has sent for this alias, by CID
    /// sequence number minus four.
    peer: [Option<u16>; 4],
}

impl Candidate {
    fn new(alias: NodeAlias) -> Self {
        Candidate {
            alias,
            conflicted: false,
            peer: [None; 4],
        }
    }

    /// Record another claimant's CID and compare Node IDs from the most
    /// significant segment down. `None` while the segments seen so far are
    /// equal and some are still missing.
    fn contest(&mut self, ours: NodeId, seq: u8, segment: u16) -> Option<Ordering> {
        if !(4..=7).contains(&seq) {
            return None;
        }
        self.peer[usize::from(seq - 4)] = Some(segment);
        for seq in CID_SEQUENCE {
            let theirs = self.peer[usize::from(seq - 4)]?;
            match theirs.cmp(&ours.cid_segment(seq)) {
                Ordering::Equal => continue,
                decided => return Some(decided),
            }
        }
        Some(Ordering::Equal)
    }
}

/// Allocator bookkeeping kept in the interface.
pub(crate) struct AllocState {
    pub(crate) flow: Option<Notifier>,
    pub(crate) source: Box<dyn AliasSource>,
    /// Someone asked for an alias since the allocator last went idle.
    pub(crate) demand: bool,
    pub(crate) candidate: Option<Candidate>,
    /// Reserved aliases in reservation order. Entries evicted from the
    /// local cache stay here until they are reached and discarded.
    pub(crate) reserved: VecDeque<NodeAlias>,
    /// Writers waiting for a reserved alias.
    pub(crate) waiters: VecDeque<Notifier>,
}

impl AllocState {
    pub(crate) fn new(source: Box<dyn AliasSource>) -> Self {
        AllocState {
            flow: None,
            source,
            demand: false,
            candidate: None,
            reserved: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }
}

impl IfCan {
    /// Ask the allocator to top up the reserved queue.
    pub(crate) fn kick(&mut self) {
        self.alloc.demand = true;
        if let Some(flow) = &self.alloc.flow {
            flow.notify();
        }
    }

    /// Park a writer until the next alias is reserved.
    pub(crate) fn wait_for_alias(&mut self, waiter: Notifier) {
        if !self.alloc.waiters.iter().any(|w| w.flow() == waiter.flow()) {
            self.alloc.waiters.push_back(waiter);
        }
        self.kick();
    }

    /// Bind the oldest usable reserved alias to `node` and announce it with
    /// AMD.
    pub(crate) fn take_reserved(&mut self, node: NodeId) -> Option<NodeAlias> {
        while let Some(alias) = self.alloc.reserved.pop_front() {
            if self.local.state(alias) != AliasState::Reserved {
                debug!(iface = %self.name, alias = %alias, "discarding stale reserved alias");
                continue;
            }
            self.send_frame(CanFrame::eff(control_id(ControlType::Amd, alias), &node.to_bytes()));
            self.local.add(node, alias);
            self.local_nodes.insert(node);
            info!(iface = %self.name, alias = %alias, node = %node, "alias bound");
            self.kick();
            return Some(alias);
        }
        None
    }

    /// A CID for the alias we are checking. Returns true if we lost it.
    pub(crate) fn contest_candidate(&mut self, seq: u8, segment: u16) -> bool {
        let ours = self.node_id;
        let Some(candidate) = self.alloc.candidate.as_mut() else {
            return false;
        };
        match candidate.contest(ours, seq, segment) {
            Some(Ordering::Greater) | None => false,
            Some(Ordering::Less) | Some(Ordering::Equal) => {
                candidate.conflicted = true;
                true
            }
        }
    }

    /// Mark the candidate as taken and wake the allocator to restart.
    pub(crate) fn lose_candidate(&mut self) {
        if let Some(candidate) = self.alloc.candidate.as_mut() {
            candidate.conflicted = true;
            debug!(iface = %self.name, alias = %candidate.alias, "candidate alias in use");
        }
        self.count(&metric_defs::ALIAS_CONFLICTS);
        if let Some(flow) = &self.alloc.flow {
            flow.notify();
        }
    }

    fn candidate_usable(&self, alias: NodeAlias) -> bool {
        alias.is_valid()
            && !self.local.contains_alias(alias)
            && !self.remote.contains_alias(alias)
            && !self.alloc.reserved.contains(&alias)
    }

    fn reserved_short(&self) -> bool {
        self.reserved_alias_count() < self.config.reserved_alias_target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocatorState {
    Idle,
    Pick,
    SendCids,
    AwaitContention,
}

/// The flow running the reservation protocol. All of its state lives in
/// [`AllocState`] so the receive path can reach the candidate.
pub(crate) struct AliasAllocator;

impl StateFlow<IfCan> for AliasAllocator {
    type State = AllocatorState;

    fn step(&mut self, state: AllocatorState, ctx: &mut FlowContext<'_, IfCan>) -> Action<AllocatorState> {
        match state {
            AllocatorState::Idle => {
                let svc = ctx.service_mut();
                if svc.alloc.demand && (svc.reserved_short() || !svc.alloc.waiters.is_empty()) {
                    Action::call_immediately(AllocatorState::Pick)
                } else {
                    svc.alloc.demand = false;
                    Action::wait()
                }
            }
            AllocatorState::Pick => {
                let svc = ctx.service_mut();
                for _ in 0..PICK_ATTEMPTS {
                    let alias = svc.alloc.source.next_alias();
                    if svc.candidate_usable(alias) {
                        svc.alloc.candidate = Some(Candidate::new(alias));
                        return Action::call_immediately(AllocatorState::SendCids);
                    }
                }
                warn!(iface = %svc.name, "no usable alias candidate, retrying");
                Action::yield_and_call(AllocatorState::Pick)
            }
            AllocatorState::SendCids => {
                let svc = ctx.service_mut();
                let Some(candidate) = svc.alloc.candidate else {
                    return Action::call_immediately(AllocatorState::Idle);
                };
                let node = svc.node_id;
                for seq in CID_SEQUENCE {
                    let id = cid_id(seq, node.cid_segment(seq), candidate.alias);
                    svc.send_frame(CanFrame::eff(id, &[]));
                }
                debug!(iface = %svc.name, alias = %candidate.alias, "checking alias");
                let window = svc.config.contention_window();
                ctx.sleep_and_call(window, AllocatorState::AwaitContention)
            }
            AllocatorState::AwaitContention => {
                let expired = ctx.timer_expired();
                let svc = ctx.service_mut();
                let Some(candidate) = svc.alloc.candidate else {
                    return Action::call_immediately(AllocatorState::Idle);
                };
                if candidate.conflicted {
                    svc.alloc.candidate = None;
                    return Action::call_immediately(AllocatorState::Pick);
                }
                if !expired {
                    return Action::wait();
                }

                svc.alloc.candidate = None;
                svc.send_frame(CanFrame::eff(control_id(ControlType::Rid, candidate.alias), &[]));
                svc.local.reserve(candidate.alias);
                svc.alloc.reserved.push_back(candidate.alias);
                svc.count(&metric_defs::ALIAS_RESERVED);
                info!(iface = %svc.name, alias = %candidate.alias, "alias reserved");
                for waiter in svc.alloc.waiters.drain(..) {
                    waiter.notify();
                }
                Action::call_immediately(AllocatorState::Idle)
            }
        }
    }

    fn name(&self) -> &'static str {
        "alias-allocator"
    }
}

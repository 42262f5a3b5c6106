//! The CAN interface: its state, its flows and the handle producers use.
//!
//! [`IfCanBuilder::build`] returns an [`Executor`] owning an [`IfCan`] plus
//! the flows that run the protocol, and an [`IfHandle`] for feeding frames
//! and writes in from any thread. Nothing is global; several interfaces can
//! live side by side, each with its own executor.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use lcb_executor::{Executor, FlowQueue, Lease, Message, Pool, PoolResult};
use lcb_metrics::{Metric, MetricLabels};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::alias_alloc::{AliasAllocator, AllocState, AllocatorState};
use crate::alias_cache::{AliasCache, AliasState};
use crate::alias_gen::{AliasSource, PrngAliasSource};
use crate::completion::Completion;
use crate::config::IfConfig;
use crate::dispatch::{Dispatcher, FrameHandler, MessageHandler};
use crate::error::{IfError, IfResult};
use crate::fragment::Reassembler;
use crate::frame::CanFrame;
use crate::mti::Mti;
use crate::node::{NodeAlias, NodeHandle, NodeId};
use crate::rx::{Inbound, RxFlow};
use crate::write::{PendingLookup, WriteFlow, WriteKind, WriteRequest};

const RX_PRIORITY: usize = 0;
const ALLOCATOR_PRIORITY: usize = 1;
const WRITE_PRIORITY: usize = 2;

/// Where transmitted frames go.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: CanFrame);
}

impl FrameSink for Sender<CanFrame> {
    fn send_frame(&mut self, frame: CanFrame) {
        // A closed bus drops frames, like a bus with nobody listening.
        let _ = self.send(frame);
    }
}

/// State shared between the executor thread and producer threads.
pub(crate) struct IfShared {
    pub(crate) frame_handlers: Mutex<Dispatcher<dyn FrameHandler>>,
    pub(crate) message_handlers: Mutex<Dispatcher<dyn MessageHandler>>,
    pub(crate) rx_queue: FlowQueue<Inbound>,
    pub(crate) global_queue: FlowQueue<WriteRequest>,
    pub(crate) addressed_queue: FlowQueue<WriteRequest>,
    pub(crate) rx_pool: Pool,
    pub(crate) write_pool: Pool,
}

/// Protocol state of one interface. Owned by its executor; flows reach it
/// through [`FlowContext::service_mut`](lcb_executor::FlowContext::service_mut).
pub struct IfCan {
    pub(crate) name: String,
    pub(crate) config: IfConfig,
    pub(crate) node_id: NodeId,
    sink: Box<dyn FrameSink>,
    pub(crate) local: AliasCache,
    pub(crate) remote: AliasCache,
    pub(crate) local_nodes: BTreeSet<NodeId>,
    pub(crate) alloc: AllocState,
    pub(crate) lookups: HashMap<NodeId, PendingLookup>,
    lookup_generation: u64,
    pub(crate) reassembler: Reassembler,
    pub(crate) labels: MetricLabels,
    pub(crate) shared: Arc<IfShared>,
}

impl IfCan {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &IfConfig {
        &self.config
    }

    /// Node ID this interface claims aliases with.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Aliases owned by this interface.
    pub fn local_aliases(&self) -> &AliasCache {
        &self.local
    }

    pub fn local_aliases_mut(&mut self) -> &mut AliasCache {
        &mut self.local
    }

    /// Bindings learned from other nodes.
    pub fn remote_aliases(&self) -> &AliasCache {
        &self.remote
    }

    pub fn remote_aliases_mut(&mut self) -> &mut AliasCache {
        &mut self.remote
    }

    /// Register a node living on this interface with an alias it already
    /// owns. Emits nothing on the bus.
    pub fn add_local_node(&mut self, node: NodeId, alias: NodeAlias) {
        self.local.add(node, alias);
        self.local_nodes.insert(node);
    }

    /// Make `alias` available as if the allocator had just reserved it.
    pub fn add_reserved_alias(&mut self, alias: NodeAlias) {
        self.local.reserve(alias);
        self.alloc.reserved.push_back(alias);
    }

    pub fn is_local_node(&self, node: NodeId) -> bool {
        self.local_nodes.contains(&node)
    }

    /// Reserved aliases still usable.
    pub fn reserved_alias_count(&self) -> usize {
        self.alloc
            .reserved
            .iter()
            .filter(|a| self.local.state(**a) == AliasState::Reserved)
            .count()
    }

    /// Destinations with an alias lookup in flight.
    pub fn pending_lookups(&self) -> usize {
        self.lookups.len()
    }

    /// Multi-frame addressed messages waiting for their remaining frames.
    pub fn partial_messages(&self) -> usize {
        self.reassembler.pending()
    }

    pub(crate) fn send_frame(&mut self, frame: CanFrame) {
        trace!(iface = %self.name, frame = %frame, "tx");
        self.count(&lcb_metrics::metric_defs::FRAMES_TX);
        self.sink.send_frame(frame);
    }

    pub(crate) fn count(&self, metric: &Metric) {
        metrics::counter!(metric.name, &self.labels.to_labels()).increment(1);
    }

    pub(crate) fn publish_lookups(&self) {
        let pending = self.lookups.len() as f64;
        metrics::gauge!(lcb_metrics::metric_defs::PENDING_LOOKUPS.name, &self.labels.to_labels()).set(pending);
    }

    pub(crate) fn next_lookup_generation(&mut self) -> u64 {
        self.lookup_generation += 1;
        self.lookup_generation
    }

    /// The local node owning `alias`, if it is bound.
    pub(crate) fn local_node_for(&self, alias: NodeAlias) -> Option<NodeId> {
        match self.local.state(alias) {
            AliasState::Bound => self.local.lookup_by_alias(alias),
            _ => None,
        }
    }

    /// True if an addressed message for `dst` never needs to leave this
    /// interface. Returns the full local handle.
    pub(crate) fn local_destination(&self, dst: &NodeHandle) -> Option<NodeHandle> {
        if let Some(id) = dst.id.filter(|id| self.local_nodes.contains(id)) {
            let alias = self.local.lookup_by_node(id).or(dst.alias);
            return Some(NodeHandle { id: Some(id), alias });
        }
        let alias = dst.alias.filter(NodeAlias::is_valid)?;
        let id = self.local_node_for(alias)?;
        Some(NodeHandle::new(id, alias))
    }
}

impl std::fmt::Debug for IfCan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IfCan")
            .field("name", &self.name)
            .field("node_id", &self.node_id)
            .field("local", &self.local.len())
            .field("remote", &self.remote.len())
            .field("lookups", &self.lookups.len())
            .finish()
    }
}

/// Thread-safe entry point into a running interface.
#[derive(Clone)]
pub struct IfHandle {
    shared: Arc<IfShared>,
}

impl IfHandle {
    /// Queue a frame received from the bus. Fails if every receive slot is
    /// in use.
    pub fn deliver_received_frame(&self, frame: CanFrame) -> IfResult<()> {
        let lease = self.shared.rx_pool.try_lease()?;
        self.push_rx(frame, lease);
        Ok(())
    }

    /// Like [`deliver_received_frame`](Self::deliver_received_frame), but
    /// waits up to `timeout` for a slot. Must not be called from the thread
    /// running the executor.
    pub fn deliver_received_frame_blocking(&self, frame: CanFrame, timeout: Duration) -> IfResult<()> {
        let lease = self.shared.rx_pool.lease_blocking(timeout)?;
        self.push_rx(frame, lease);
        Ok(())
    }

    fn push_rx(&self, frame: CanFrame, lease: Lease) {
        self.shared
            .rx_queue
            .send(Message::with_lease(Inbound::Frame(frame), lease), RX_PRIORITY);
    }

    /// Send an unaddressed message from `src`. `completion` fires once the
    /// message is on the bus or has failed.
    pub fn write_global(&self, mti: Mti, src: NodeId, payload: Vec<u8>, completion: Completion) -> IfResult<()> {
        let request = WriteRequest::new(WriteKind::Global, mti, src, NodeHandle::default(), payload, completion);
        let lease = self.shared.write_pool.try_lease();
        Self::enqueue(&self.shared.global_queue, lease, request)
    }

    /// Send an addressed message from `src` to `dst`. The destination alias
    /// is resolved on the bus if needed.
    pub fn write_addressed(
        &self,
        mti: Mti,
        src: NodeId,
        dst: NodeHandle,
        payload: Vec<u8>,
        completion: Completion,
    ) -> IfResult<()> {
        let request = WriteRequest::new(WriteKind::Addressed, mti, src, dst, payload, completion);
        let lease = self.shared.write_pool.try_lease();
        Self::enqueue(&self.shared.addressed_queue, lease, request)
    }

    pub fn write_global_blocking(
        &self,
        mti: Mti,
        src: NodeId,
        payload: Vec<u8>,
        completion: Completion,
        timeout: Duration,
    ) -> IfResult<()> {
        let request = WriteRequest::new(WriteKind::Global, mti, src, NodeHandle::default(), payload, completion);
        let lease = self.shared.write_pool.lease_blocking(timeout);
        Self::enqueue(&self.shared.global_queue, lease, request)
    }

    pub fn write_addressed_blocking(
        &self,
        mti: Mti,
        src: NodeId,
        dst: NodeHandle,
        payload: Vec<u8>,
        completion: Completion,
        timeout: Duration,
    ) -> IfResult<()> {
        let request = WriteRequest::new(WriteKind::Addressed, mti, src, dst, payload, completion);
        let lease = self.shared.write_pool.lease_blocking(timeout);
        Self::enqueue(&self.shared.addressed_queue, lease, request)
    }

    /// Without a slot the request completes with `ResourceExhausted` and the
    /// same error is returned.
    fn enqueue(queue: &FlowQueue<WriteRequest>, lease: PoolResult<Lease>, mut request: WriteRequest) -> IfResult<()> {
        match lease {
            Ok(lease) => {
                queue.send(Message::with_lease(request, lease), 0);
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, mti = %request.mti, "write rejected");
                request.complete(Err(IfError::ResourceExhausted));
                Err(IfError::ResourceExhausted)
            }
        }
    }

    /// Call `handler` for every received frame with `frame.id() & mask == id & mask`.
    pub fn register_handler(&self, id: u32, mask: u32, handler: Arc<dyn FrameHandler>) {
        self.shared.frame_handlers.lock().register(id, mask, handler);
    }

    pub fn unregister_handler(&self, id: u32, mask: u32, handler: &Arc<dyn FrameHandler>) -> bool {
        self.shared.frame_handlers.lock().unregister(id, mask, handler)
    }

    /// Call `handler` for every message with `mti & mask == id & mask`,
    /// including messages looped back from local writes.
    pub fn register_message_handler(&self, id: u16, mask: u16, handler: Arc<dyn MessageHandler>) {
        self.shared
            .message_handlers
            .lock()
            .register(u32::from(id), u32::from(mask), handler);
    }

    pub fn unregister_message_handler(&self, id: u16, mask: u16, handler: &Arc<dyn MessageHandler>) -> bool {
        self.shared
            .message_handlers
            .lock()
            .unregister(u32::from(id), u32::from(mask), handler)
    }

    /// Free receive slots.
    pub fn rx_available(&self) -> usize {
        self.shared.rx_pool.available()
    }

    /// Free write slots.
    pub fn write_available(&self) -> usize {
        self.shared.write_pool.available()
    }
}

impl std::fmt::Debug for IfHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IfHandle")
            .field("rx_pending", &self.shared.rx_queue.len())
            .field("writes_pending", &(self.shared.global_queue.len() + self.shared.addressed_queue.len()))
            .finish()
    }
}

/// Assembles an interface and its flows.
pub struct IfCanBuilder {
    node_id: NodeId,
    config: IfConfig,
    name: String,
    alias_source: Option<Box<dyn AliasSource>>,
}

impl IfCanBuilder {
    pub fn new(node_id: NodeId) -> Self {
        IfCanBuilder {
            node_id,
            config: IfConfig::default(),
            name: format!("can-{node_id}"),
            alias_source: None,
        }
    }

    pub fn with_config(mut self, config: IfConfig) -> Self {
        self.config = config;
        self
    }

    /// Name used in logs and metric labels.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the Node ID derived alias generator.
    pub fn with_alias_source(mut self, source: impl AliasSource + 'static) -> Self {
        self.alias_source = Some(Box::new(source));
        self
    }

    pub fn build(self, sink: impl FrameSink + 'static) -> (Executor<IfCan>, IfHandle) {
        let IfCanBuilder {
            node_id,
            config,
            name,
            alias_source,
        } = self;
        let levels = config.priority_levels.max(1);
        let depth = config.queue_depth.max(1);

        let shared = Arc::new(IfShared {
            frame_handlers: Mutex::new(Dispatcher::new()),
            message_handlers: Mutex::new(Dispatcher::new()),
            rx_queue: FlowQueue::new(levels),
            global_queue: FlowQueue::new(levels),
            addressed_queue: FlowQueue::new(levels),
            rx_pool: Pool::new(format!("{name}.rx"), depth),
            write_pool: Pool::new(format!("{name}.write"), depth),
        });

        let source = alias_source.unwrap_or_else(|| Box::new(PrngAliasSource::new(node_id)));
        let service = IfCan {
            local: AliasCache::new(config.local_alias_capacity),
            remote: AliasCache::new(config.remote_alias_capacity),
            local_nodes: BTreeSet::new(),
            alloc: AllocState::new(source),
            lookups: HashMap::new(),
            lookup_generation: 0,
            reassembler: Reassembler::new(config.reassembly_slots, config.max_message_len),
            labels: MetricLabels::new(name.clone(), "iface"),
            shared: Arc::clone(&shared),
            sink: Box::new(sink),
            name: name.clone(),
            node_id,
            config: config.clone(),
        };

        let mut exec = Executor::new(service, levels).with_name(name.clone());
        exec.spawn_queue_flow(RxFlow::new(), shared.rx_queue.clone(), RX_PRIORITY);
        let allocator = exec.spawn(AliasAllocator, AllocatorState::Idle, ALLOCATOR_PRIORITY);
        let notifier = exec.notifier(allocator);
        exec.service_mut().alloc.flow = Some(notifier);
        exec.spawn_queue_flow(
            WriteFlow::new(WriteKind::Global),
            shared.global_queue.clone(),
            WRITE_PRIORITY,
        );
        for _ in 0..config.addressed_write_flows.max(1) {
            exec.spawn_queue_flow(
                WriteFlow::new(WriteKind::Addressed),
                shared.addressed_queue.clone(),
                WRITE_PRIORITY,
            );
        }
        debug!(iface = %name, node = %node_id, flows = exec.flow_count(), "interface built");

        (exec, IfHandle { shared })
    }
}

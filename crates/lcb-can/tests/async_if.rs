//! End-to-end tests of one interface against a captured bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use lcb_can::{
    cid_id, AliasState, CanFrame, Completion, CompletionReceiver, FrameHandler, IfCan, IfCanBuilder, IfConfig,
    IfError, IfHandle, IncomingMessage, MessageHandler, Mti, NodeAlias, NodeHandle, NodeId, ScriptedAliasSource,
};
use lcb_executor::{Done, Executor};
use parking_lot::Mutex;

const TEST_NODE_ID: u64 = 0x02010D000003;
const TEST_ALIAS: u16 = 0x22A;
const REMOTE_ID: u64 = 0x050101FFFFDD;
const REMOTE_ALIAS: u16 = 0x210;
const EVENT: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

struct Fixture {
    exec: Executor<IfCan>,
    handle: IfHandle,
    bus: Receiver<CanFrame>,
}

impl Fixture {
    fn new() -> Self {
        Self::with(IfConfig::default(), &[])
    }

    /// An interface whose node already owns `TEST_ALIAS`. Allocations draw
    /// from `script` first.
    fn with(config: IfConfig, script: &[u16]) -> Self {
        let node = NodeId::new(TEST_NODE_ID);
        let (tx, bus) = unbounded();
        let (mut exec, handle) = IfCanBuilder::new(node)
            .with_config(config)
            .with_name("test")
            .with_alias_source(ScriptedAliasSource::new(node, script.iter().copied()))
            .build(tx);
        exec.service_mut().add_local_node(node, NodeAlias::new(TEST_ALIAS));
        exec.run_until_idle();
        Fixture { exec, handle, bus }
    }

    fn if_can(&mut self) -> &mut IfCan {
        self.exec.service_mut()
    }

    fn send(&mut self, text: &str) {
        let frame: CanFrame = text.parse().unwrap();
        self.handle.deliver_received_frame(frame).unwrap();
        self.exec.run_until_idle();
    }

    fn advance_ms(&mut self, ms: u64) {
        self.exec.advance_by(Duration::from_millis(ms));
    }

    fn run(&mut self) {
        self.exec.run_until_idle();
    }

    fn frames(&self) -> Vec<String> {
        self.bus.try_iter().map(|f| f.to_string()).collect()
    }

    fn write_global(&mut self, mti: Mti, src: u64, payload: &[u8]) -> CompletionReceiver {
        let (completion, rx) = Completion::channel();
        self.handle
            .write_global(mti, NodeId::new(src), payload.to_vec(), completion)
            .unwrap();
        self.run();
        rx
    }

    fn write_addressed(&mut self, mti: Mti, src: u64, dst: NodeHandle, payload: &[u8]) -> CompletionReceiver {
        let (completion, rx) = Completion::channel();
        self.handle
            .write_addressed(mti, NodeId::new(src), dst, payload.to_vec(), completion)
            .unwrap();
        self.run();
        rx
    }

    fn add_remote(&mut self, id: u64, alias: u16) {
        self.if_can()
            .remote_aliases_mut()
            .add(NodeId::new(id), NodeAlias::new(alias));
    }
}

fn cids(alias: u16) -> Vec<String> {
    let node = NodeId::new(TEST_NODE_ID);
    [7u8, 6, 5, 4]
        .iter()
        .map(|&seq| {
            CanFrame::new_extended(cid_id(seq, node.cid_segment(seq), NodeAlias::new(alias)), &[])
                .unwrap()
                .to_string()
        })
        .collect()
}

fn rid(alias: u16) -> String {
    format!(":X10700{alias:03X}N;")
}

fn remote_id() -> NodeHandle {
    NodeHandle::from_id(NodeId::new(REMOTE_ID))
}

fn capture_messages(handle: &IfHandle, id: u16, mask: u16) -> Arc<Mutex<Vec<IncomingMessage>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: Arc<dyn MessageHandler> = Arc::new(move |msg: &IncomingMessage, _done: Done| {
        sink.lock().push(msg.clone());
    });
    handle.register_message_handler(id, mask, handler);
    seen
}

// ----------------------------------------------------------------------------
// Frame dispatch
// ----------------------------------------------------------------------------

#[test]
fn test_inject_frame_without_handlers() {
    let mut f = Fixture::new();
    f.send(":X195B432DN05010103;");
    assert!(f.frames().is_empty());
}

#[test]
fn test_frame_handler_mask() {
    let mut f = Fixture::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: Arc<dyn FrameHandler> = Arc::new(move |frame: &CanFrame, done: Done| {
        sink.lock().push(frame.id());
        done.notify();
    });
    f.handle.register_handler(0x195B4000, 0x1FFFF000, Arc::clone(&handler));

    f.send(":X195B432DN05010103;");
    f.send(":X195F432DN05010103;");
    f.send(":X195F432DN05010103;");
    assert_eq!(*seen.lock(), vec![0x195B432D]);

    f.send(":X195B4777N05010103;");
    f.send(":X195F4333N05010103;");
    f.send(":X195B4222N05010103;");
    assert_eq!(*seen.lock(), vec![0x195B432D, 0x195B4777, 0x195B4222]);

    assert!(f.handle.unregister_handler(0x195B4000, 0x1FFFF000, &handler));
    f.send(":X195B4111N05010103;");
    assert_eq!(seen.lock().len(), 3);
}

#[test]
fn test_overlapping_handlers_each_get_own_completion() {
    let mut f = Fixture::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let held: Arc<Mutex<Vec<Done>>> = Arc::new(Mutex::new(Vec::new()));

    // Keeps its completion until the test releases it.
    let (c, h) = (Arc::clone(&calls), Arc::clone(&held));
    let slow: Arc<dyn FrameHandler> = Arc::new(move |_: &CanFrame, done: Done| {
        c.fetch_add(1, Ordering::SeqCst);
        h.lock().push(done);
    });
    let c = Arc::clone(&calls);
    let fast: Arc<dyn FrameHandler> = Arc::new(move |_: &CanFrame, _done: Done| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    f.handle.register_handler(0x195B4000, 0x1FFFF000, slow);
    f.handle.register_handler(0x19000000, 0x1F000000, fast);

    for text in [":X195B4001N01;", ":X195B4002N02;", ":X195B4003N03;"] {
        f.handle.deliver_received_frame(text.parse().unwrap()).unwrap();
    }
    f.run();
    // The first frame is held by the slow handler.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(held.lock().len(), 1);

    for expected in [4, 6, 6] {
        held.lock().clear();
        f.run();
        assert_eq!(calls.load(Ordering::SeqCst), expected);
    }
    assert!(held.lock().is_empty());
}

#[test]
fn test_standard_frames_are_dropped() {
    let mut f = Fixture::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let handler: Arc<dyn FrameHandler> = Arc::new(move |_: &CanFrame, _done: Done| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    f.handle.register_handler(0, 0, handler);
    f.send(":S123N0A;");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    f.send(":X195B432DN05;");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_receive_slots_exhausted() {
    let config = IfConfig::default().with_queue_depth(2);
    let f = Fixture::with(config, &[]);
    let frame: CanFrame = ":X195B432DN05;".parse().unwrap();
    assert!(f.handle.deliver_received_frame(frame).is_ok());
    assert!(f.handle.deliver_received_frame(frame).is_ok());
    assert_eq!(f.handle.deliver_received_frame(frame), Err(IfError::ResourceExhausted));
}

#[test]
fn test_blocking_delivery_from_producer_thread() {
    let config = IfConfig::default().with_queue_depth(1);
    let mut f = Fixture::with(config, &[]);
    let seen = capture_messages(&f.handle, 0x5B4, 0xFFF);

    let handle = f.handle.clone();
    let producer = std::thread::spawn(move || {
        for i in 0..3u8 {
            let frame = CanFrame::new_extended(0x195B4210, &[i]).unwrap();
            handle
                .deliver_received_frame_blocking(frame, Duration::from_secs(10))
                .unwrap();
        }
    });
    while seen.lock().len() < 3 {
        f.exec.wait_for_work(Duration::from_millis(10));
        f.run();
    }
    producer.join().unwrap();
    let payloads: Vec<Vec<u8>> = seen.lock().iter().map(|m| m.payload.clone()).collect();
    assert_eq!(payloads, vec![vec![0], vec![1], vec![2]]);
}

// ----------------------------------------------------------------------------
// Global writes
// ----------------------------------------------------------------------------

#[test]
fn test_write_global() {
    let mut f = Fixture::new();
    let done = f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID, &EVENT);
    assert_eq!(f.frames(), vec![":X195B422AN0102030405060708;"]);
    assert_eq!(done.try_result(), Some(Ok(())));
}

#[test]
fn test_write_global_short() {
    let mut f = Fixture::new();
    f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID, b"12345");
    assert_eq!(f.frames(), vec![":X195B422AN3132333435;"]);
}

#[test]
fn test_write_global_addressed_mti() {
    let mut f = Fixture::new();
    f.write_global(Mti::PROTOCOL_SUPPORT_INQUIRY, TEST_NODE_ID, b"12345");
    assert_eq!(f.frames(), vec![":X1982822AN00003132333435;"]);
}

#[test]
fn test_write_global_fragmented() {
    let mut f = Fixture::new();
    f.write_global(Mti::PROTOCOL_SUPPORT_INQUIRY, TEST_NODE_ID, b"01234567890123456789");
    assert_eq!(
        f.frames(),
        vec![
            ":X1982822AN1000303132333435;",
            ":X1982822AN3000363738393031;",
            ":X1982822AN3000323334353637;",
            ":X1982822AN20003839;",
        ]
    );
}

#[test]
fn test_write_global_many() {
    let mut f = Fixture::new();
    for _ in 0..100 {
        f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID, &EVENT);
    }
    let frames = f.frames();
    assert_eq!(frames.len(), 100);
    assert!(frames.iter().all(|s| s == ":X195B422AN0102030405060708;"));
}

#[test]
fn test_write_global_ignores_datagram() {
    let mut f = Fixture::new();
    let done = f.write_global(Mti::DATAGRAM, TEST_NODE_ID, &EVENT);
    assert!(f.frames().is_empty());
    assert_eq!(done.try_result(), Some(Err(IfError::UnsupportedMti { mti: Mti::DATAGRAM })));
}

#[test]
fn test_write_global_payload_too_large() {
    let mut f = Fixture::new();
    let done = f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID, &[0; 9]);
    assert!(f.frames().is_empty());
    assert_eq!(done.try_result(), Some(Err(IfError::PayloadTooLarge { len: 9, max: 8 })));
}

#[test]
fn test_write_slots_exhausted() {
    let config = IfConfig::default().with_queue_depth(1);
    let mut f = Fixture::with(config, &[]);
    let (first, _first_rx) = Completion::channel();
    let (second, second_rx) = Completion::channel();
    let src = NodeId::new(TEST_NODE_ID);
    assert!(f.handle.write_global(Mti::EVENT_REPORT, src, EVENT.to_vec(), first).is_ok());
    assert_eq!(
        f.handle.write_global(Mti::EVENT_REPORT, src, EVENT.to_vec(), second),
        Err(IfError::ResourceExhausted)
    );
    assert_eq!(second_rx.try_result(), Some(Err(IfError::ResourceExhausted)));
    f.run();
    assert_eq!(f.frames().len(), 1);
}

#[test]
fn test_write_global_loopback() {
    let mut f = Fixture::new();
    let seen = capture_messages(&f.handle, 0, 0);
    f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID, &EVENT);
    assert_eq!(f.frames(), vec![":X195B422AN0102030405060708;"]);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].mti, Mti::EVENT_REPORT);
    assert_eq!(seen[0].payload, EVENT.to_vec());
    assert_eq!(seen[0].dst, None);
    assert_eq!(seen[0].src.id, Some(NodeId::new(TEST_NODE_ID)));
}

#[test]
fn test_write_allocates_local_alias() {
    let mut f = Fixture::with(IfConfig::default(), &[0x44C]);
    f.if_can().add_reserved_alias(NodeAlias::new(0x33A));

    let done = f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID + 1, &EVENT);
    let mut expected = vec![
        ":X1070133AN02010D000004;".to_string(),
        ":X195B433AN0102030405060708;".to_string(),
    ];
    expected.extend(cids(0x44C));
    assert_eq!(f.frames(), expected);
    assert_eq!(done.try_result(), Some(Ok(())));

    f.advance_ms(200);
    assert_eq!(f.frames(), vec![rid(0x44C)]);

    let local = f.if_can().local_aliases();
    assert_eq!(local.lookup_by_node(NodeId::new(TEST_NODE_ID + 1)), Some(NodeAlias::new(0x33A)));
    assert_eq!(local.lookup_by_alias(NodeAlias::new(0x33A)), Some(NodeId::new(TEST_NODE_ID + 1)));
    assert_eq!(local.state(NodeAlias::new(0x44C)), AliasState::Reserved);
}

#[test]
fn test_write_waits_for_allocation() {
    let mut f = Fixture::with(IfConfig::default(), &[0x33A, 0x44C]);
    let done = f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID + 1, &EVENT);
    assert_eq!(f.frames(), cids(0x33A));
    assert_eq!(done.try_result(), None);

    f.advance_ms(199);
    assert!(f.frames().is_empty());
    f.advance_ms(1);
    let mut expected = vec![
        rid(0x33A),
        ":X1070133AN02010D000004;".to_string(),
        ":X195B433AN0102030405060708;".to_string(),
    ];
    expected.extend(cids(0x44C));
    assert_eq!(f.frames(), expected);
    assert_eq!(done.try_result(), Some(Ok(())));
}

// ----------------------------------------------------------------------------
// Alias defence and conflicts
// ----------------------------------------------------------------------------

#[test]
fn test_alias_conflict_on_allocated_node() {
    let mut f = Fixture::new();
    let alias = NodeAlias::new(TEST_ALIAS);
    assert_eq!(f.if_can().local_aliases().lookup_by_alias(alias), Some(NodeId::new(TEST_NODE_ID)));

    f.send(":X1800022AN;");
    assert_eq!(f.if_can().local_aliases().lookup_by_alias(alias), None);
    // The node lost its alias, so the allocator starts on a replacement.
    let frames = f.frames();
    assert_eq!(frames.len(), 4);
    for text in frames {
        let frame: CanFrame = text.parse().unwrap();
        assert!(frame.kind().unwrap().is_check_id());
    }
}

#[test]
fn test_alias_conflict_cid_reply() {
    let mut f = Fixture::new();
    for cid in [":X1700022AN;", ":X1612322AN;", ":X1545622AN;", ":X1478922AN;"] {
        f.send(cid);
        assert_eq!(f.frames(), vec![":X1070022AN;"]);
    }
    assert_eq!(
        f.if_can().local_aliases().lookup_by_alias(NodeAlias::new(TEST_ALIAS)),
        Some(NodeId::new(TEST_NODE_ID))
    );
}

#[test]
fn test_reserved_alias_reclaimed() {
    let mut f = Fixture::with(IfConfig::default(), &[0x44C, 0x44D, 0x6AA]);
    f.if_can().local_aliases_mut().remove(NodeAlias::new(TEST_ALIAS));
    f.if_can().add_reserved_alias(NodeAlias::new(0x33A));

    f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID, &EVENT);
    let mut expected = vec![
        ":X1070133AN02010D000003;".to_string(),
        ":X195B433AN0102030405060708;".to_string(),
    ];
    expected.extend(cids(0x44C));
    assert_eq!(f.frames(), expected);
    f.advance_ms(250);
    assert_eq!(f.frames(), vec![rid(0x44C)]);
    assert_eq!(f.if_can().local_aliases().state(NodeAlias::new(0x44C)), AliasState::Reserved);

    // A CID gets an RID back and the alias stays reserved.
    f.send(":X1478944CN;");
    assert_eq!(f.frames(), vec![":X1070044CN;"]);
    assert_eq!(f.if_can().local_aliases().state(NodeAlias::new(0x44C)), AliasState::Reserved);

    // A regular frame takes it away.
    f.send(":X1800044CN;");
    assert!(f.frames().is_empty());
    assert_eq!(f.if_can().local_aliases().state(NodeAlias::new(0x44C)), AliasState::Free);
    assert_eq!(f.if_can().reserved_alias_count(), 0);

    // The next node skips the stale alias and gets a fresh one.
    let done = f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID + 1, &[1, 2, 3, 4, 5, 6, 7, 9]);
    assert_eq!(f.frames(), cids(0x44D));
    f.advance_ms(250);
    let mut expected = vec![
        rid(0x44D),
        ":X1070144DN02010D000004;".to_string(),
        ":X195B444DN0102030405060709;".to_string(),
    ];
    expected.extend(cids(0x6AA));
    assert_eq!(f.frames(), expected);
    assert_eq!(done.try_result(), Some(Ok(())));
    assert_eq!(
        f.if_can().local_aliases().lookup_by_alias(NodeAlias::new(0x44D)),
        Some(NodeId::new(TEST_NODE_ID + 1))
    );

    f.advance_ms(250);
    assert_eq!(f.frames(), vec![rid(0x6AA)]);
    assert_eq!(f.if_can().local_aliases().state(NodeAlias::new(0x6AA)), AliasState::Reserved);
}

#[test]
fn test_candidate_used_by_other_node_restarts_check() {
    let mut f = Fixture::with(IfConfig::default(), &[0x44C, 0x55D]);
    f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID + 1, &EVENT);
    assert_eq!(f.frames(), cids(0x44C));

    f.send(":X1800044CN;");
    assert_eq!(f.frames(), cids(0x55D));
    f.advance_ms(200);
    let frames = f.frames();
    assert_eq!(frames[0], rid(0x55D));
    assert!(!frames.contains(&rid(0x44C)));
    assert_eq!(
        f.if_can().local_aliases().lookup_by_node(NodeId::new(TEST_NODE_ID + 1)),
        Some(NodeAlias::new(0x55D))
    );
}

#[test]
fn test_candidate_contest_lower_node_id_wins() {
    let mut f = Fixture::with(IfConfig::default(), &[0x44C, 0x55D]);
    f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID + 1, &EVENT);
    assert_eq!(f.frames(), cids(0x44C));

    // Another node with a lower top segment claims the same alias.
    f.send(":X1701044CN;");
    assert_eq!(f.frames(), cids(0x55D));
}

#[test]
fn test_candidate_contest_higher_node_id_loses() {
    let mut f = Fixture::with(IfConfig::default(), &[0x44C, 0x55D]);
    let done = f.write_global(Mti::EVENT_REPORT, TEST_NODE_ID + 1, &EVENT);
    assert_eq!(f.frames(), cids(0x44C));

    f.send(":X1703044CN;");
    assert!(f.frames().is_empty());
    f.advance_ms(200);
    assert_eq!(f.frames()[0], rid(0x44C));
    assert_eq!(done.try_result(), Some(Ok(())));
}

#[test]
fn test_answers_alias_map_enquiry() {
    let mut f = Fixture::new();
    f.send(":X10702210N;");
    assert_eq!(f.frames(), vec![":X1070122AN02010D000003;"]);
    f.send(":X10702210N02010D000003;");
    assert_eq!(f.frames(), vec![":X1070122AN02010D000003;"]);
    f.send(":X10702210N050101FFFFDD;");
    assert!(f.frames().is_empty());
}

#[test]
fn test_answers_verify_node_id_global() {
    let mut f = Fixture::new();
    f.send(":X19490210N;");
    assert_eq!(f.frames(), vec![":X1917022AN02010D000003;"]);
    f.send(":X19490210N050101FFFFDD;");
    assert!(f.frames().is_empty());
}

#[test]
fn test_remote_cache_maintenance() {
    let mut f = Fixture::new();
    let id = NodeId::new(REMOTE_ID);
    let alias = NodeAlias::new(REMOTE_ALIAS);

    f.send(":X10701210N050101FFFFDD;");
    assert_eq!(f.if_can().remote_aliases().lookup_by_node(id), Some(alias));

    f.send(":X10703210N050101FFFFDD;");
    assert_eq!(f.if_can().remote_aliases().lookup_by_node(id), None);

    f.send(":X19170210N050101FFFFDD;");
    assert_eq!(f.if_can().remote_aliases().lookup_by_alias(alias), Some(id));

    // Someone is checking that alias: the old binding is stale.
    f.send(":X17050210N;");
    assert_eq!(f.if_can().remote_aliases().lookup_by_alias(alias), None);
    assert!(f.frames().is_empty());
}

// ----------------------------------------------------------------------------
// Inbound messages
// ----------------------------------------------------------------------------

#[test]
fn test_global_message_known_source() {
    let mut f = Fixture::new();
    let seen = capture_messages(&f.handle, 0x5B4, 0xFFFF);
    f.add_remote(REMOTE_ID, REMOTE_ALIAS);
    f.send(":X195B4210N0102030405060708;");

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].mti, Mti::EVENT_REPORT);
    assert_eq!(
        seen[0].src,
        NodeHandle::new(NodeId::new(REMOTE_ID), NodeAlias::new(REMOTE_ALIAS))
    );
    assert_eq!(seen[0].dst, None);
    assert_eq!(seen[0].dst_node, None);
    assert_eq!(seen[0].payload, EVENT.to_vec());
}

#[test]
fn test_global_message_unknown_source() {
    let mut f = Fixture::new();
    let seen = capture_messages(&f.handle, 0x5B4, 0xFFFF);
    f.send(":X195B4210N0102030405060708;");

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].src, NodeHandle::from_alias(NodeAlias::new(REMOTE_ALIAS)));
}

#[test]
fn test_addressed_message_to_local_node() {
    let mut f = Fixture::new();
    let seen = capture_messages(&f.handle, 0x488, 0xFFFF);
    f.add_remote(REMOTE_ID, REMOTE_ALIAS);
    f.send(":X19488210N022A;");

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].mti, Mti::VERIFY_NODE_ID_ADDRESSED);
    assert_eq!(seen[0].src.id, Some(NodeId::new(REMOTE_ID)));
    assert_eq!(
        seen[0].dst,
        Some(NodeHandle::new(NodeId::new(TEST_NODE_ID), NodeAlias::new(TEST_ALIAS)))
    );
    assert_eq!(seen[0].dst_node, Some(NodeId::new(TEST_NODE_ID)));
    assert!(seen[0].payload.is_empty());
}

#[test]
fn test_addressed_message_with_payload_unknown_source() {
    let mut f = Fixture::new();
    let seen = capture_messages(&f.handle, 0x488, 0xFFFF);
    f.send(":X19488210N022A010203040506;");

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].src.id, None);
    assert_eq!(seen[0].payload, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_addressed_message_for_other_node_ignored() {
    let mut f = Fixture::new();
    let seen = capture_messages(&f.handle, 0, 0);
    f.send(":X19488210N0333;");
    assert!(seen.lock().is_empty());
}

#[test]
fn test_addressed_message_reassembled() {
    let mut f = Fixture::new();
    let seen = capture_messages(&f.handle, 0x828, 0xFFFF);
    f.send(":X19828210N122A303132333435;");
    f.send(":X19828210N322A363738393031;");
    assert!(seen.lock().is_empty());
    f.send(":X19828210N222A3233;");

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload, b"01234567890123".to_vec());
}

#[test]
fn test_partial_messages_are_bounded() {
    let mut f = Fixture::with(IfConfig::default().with_reassembly_limits(2, 12), &[]);
    let seen = capture_messages(&f.handle, 0x828, 0xFFFF);
    for src in ["210", "211", "212"] {
        f.send(&format!(":X19828{src}N122A303132333435;"));
    }
    assert_eq!(f.if_can().partial_messages(), 2);

    // The oldest one was given up, so its last frame is an orphan.
    f.send(":X19828210N222A3637;");
    assert!(seen.lock().is_empty());
    f.send(":X19828212N222A3637;");
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].payload, b"01234567".to_vec());

    // Growing past the length limit drops the message.
    f.send(":X19828211N322A363738393031;");
    assert_eq!(f.if_can().partial_messages(), 1);
    f.send(":X19828211N322A323334353637;");
    assert_eq!(f.if_can().partial_messages(), 0);
    f.send(":X19828211N222A3839;");
    assert_eq!(seen.lock().len(), 1);
    assert!(f.frames().is_empty());
}

// ----------------------------------------------------------------------------
// Addressed writes
// ----------------------------------------------------------------------------

fn verify_payload() -> Vec<u8> {
    NodeId::new(REMOTE_ID).to_bytes().to_vec()
}

#[test]
fn test_addressed_write_loopback() {
    let mut f = Fixture::new();
    let seen = capture_messages(&f.handle, 0, 0);
    let dst = NodeHandle::new(NodeId::new(TEST_NODE_ID), NodeAlias::new(TEST_ALIAS));
    let done = f.write_addressed(Mti::EVENTS_IDENTIFY_ADDRESSED, TEST_NODE_ID + 1, dst, &EVENT);
    assert_eq!(done.try_result(), Some(Ok(())));
    assert!(f.frames().is_empty());

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].mti, Mti::EVENTS_IDENTIFY_ADDRESSED);
    assert_eq!(seen[0].payload, EVENT.to_vec());
    assert_eq!(seen[0].dst, Some(dst));
    assert_eq!(seen[0].dst_node, Some(NodeId::new(TEST_NODE_ID)));
    // No alias was allocated for the sender.
    assert_eq!(f.if_can().local_aliases().len(), 1);
}

#[test]
fn test_addressed_write_rejects_unaddressed_mti() {
    let mut f = Fixture::new();
    let done = f.write_addressed(Mti::EVENT_REPORT, TEST_NODE_ID, remote_id(), &EVENT);
    assert_eq!(done.try_result(), Some(Err(IfError::InvalidDestination)));
    let done = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, NodeHandle::default(), &[]);
    assert_eq!(done.try_result(), Some(Err(IfError::InvalidDestination)));
    assert!(f.frames().is_empty());
}

#[test]
fn test_addressed_write_to_alias() {
    let mut f = Fixture::new();
    let dst = NodeHandle::from_alias(NodeAlias::new(REMOTE_ALIAS));
    let done = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, dst, &verify_payload());
    assert_eq!(f.frames(), vec![":X1948822AN0210050101FFFFDD;"]);
    assert_eq!(done.try_result(), Some(Ok(())));
}

#[test]
fn test_addressed_write_cached_alias() {
    let mut f = Fixture::new();
    f.add_remote(REMOTE_ID, REMOTE_ALIAS);
    f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    assert_eq!(f.frames(), vec![":X1948822AN0210050101FFFFDD;"]);
}

#[test]
fn test_addressed_write_cache_beats_hint() {
    let mut f = Fixture::new();
    f.add_remote(REMOTE_ID, REMOTE_ALIAS);
    let dst = NodeHandle::new(NodeId::new(REMOTE_ID), NodeAlias::new(0x111));
    f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, dst, &verify_payload());
    assert_eq!(f.frames(), vec![":X1948822AN0210050101FFFFDD;"]);
}

#[test]
fn test_addressed_write_cache_miss() {
    let mut f = Fixture::new();
    let done = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    assert_eq!(f.frames(), vec![":X1070222AN050101FFFFDD;"]);
    assert_eq!(done.try_result(), None);

    f.send(":X10701210N050101FFFFDD;");
    assert_eq!(f.frames(), vec![":X1948822AN0210050101FFFFDD;"]);
    assert_eq!(done.try_result(), Some(Ok(())));
    assert_eq!(f.if_can().pending_lookups(), 0);
}

#[test]
fn test_addressed_write_rebinds_after_losing_source_alias() {
    let mut f = Fixture::with(IfConfig::default(), &[0x33A, 0x44C]);
    let done = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    assert_eq!(f.frames(), vec![":X1070222AN050101FFFFDD;"]);

    // Another node transmits from our alias while the enquiry is out.
    f.send(":X1800022AN;");
    assert_eq!(f.if_can().local_aliases().state(NodeAlias::new(TEST_ALIAS)), AliasState::Free);
    assert_eq!(f.frames(), cids(0x33A));

    f.send(":X10701210N050101FFFFDD;");
    assert!(f.frames().is_empty());
    assert_eq!(done.try_result(), None);

    f.advance_ms(200);
    let mut expected = vec![
        rid(0x33A),
        ":X1070133AN02010D000003;".to_string(),
        ":X1948833AN0210050101FFFFDD;".to_string(),
    ];
    expected.extend(cids(0x44C));
    assert_eq!(f.frames(), expected);
    assert_eq!(done.try_result(), Some(Ok(())));
}

#[test]
fn test_addressed_write_cache_miss_timeout() {
    let config = IfConfig::default()
        .with_alias_lookup_timeout_ms(20)
        .with_verify_timeout_ms(50);
    let mut f = Fixture::with(config, &[]);
    let done = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    assert_eq!(f.frames(), vec![":X1070222AN050101FFFFDD;"]);

    f.advance_ms(19);
    assert!(f.frames().is_empty());
    f.advance_ms(1);
    assert_eq!(f.frames(), vec![":X1949022AN050101FFFFDD;"]);
    assert_eq!(done.try_result(), None);

    f.advance_ms(50);
    assert_eq!(
        done.try_result(),
        Some(Err(IfError::LookupTimeout { node: NodeId::new(REMOTE_ID) }))
    );
    f.advance_ms(10_000);
    assert!(f.frames().is_empty());
    assert_eq!(f.if_can().pending_lookups(), 0);
}

#[test]
fn test_addressed_write_verified_after_escalation() {
    let config = IfConfig::default()
        .with_alias_lookup_timeout_ms(20)
        .with_verify_timeout_ms(10_000);
    let mut f = Fixture::with(config, &[]);
    let done = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    assert_eq!(f.frames(), vec![":X1070222AN050101FFFFDD;"]);
    f.advance_ms(30);
    assert_eq!(f.frames(), vec![":X1949022AN050101FFFFDD;"]);

    f.send(":X19170210N050101FFFFDD;");
    assert_eq!(f.frames(), vec![":X1948822AN0210050101FFFFDD;"]);
    assert_eq!(done.try_result(), Some(Ok(())));

    // The verify timer died with the state that armed it.
    f.advance_ms(20_000);
    assert!(f.frames().is_empty());
}

#[test]
fn test_addressed_write_from_new_node_cached_alias() {
    let mut f = Fixture::with(IfConfig::default(), &[0x44C]);
    f.add_remote(REMOTE_ID, REMOTE_ALIAS);
    f.if_can().local_aliases_mut().remove(NodeAlias::new(TEST_ALIAS));
    f.if_can().add_reserved_alias(NodeAlias::new(0x33A));

    let done = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    let mut expected = vec![
        ":X1070133AN02010D000003;".to_string(),
        ":X1948833AN0210050101FFFFDD;".to_string(),
    ];
    expected.extend(cids(0x44C));
    assert_eq!(f.frames(), expected);
    assert_eq!(done.try_result(), Some(Ok(())));
}

#[test]
fn test_addressed_write_from_new_node_skips_enquiry() {
    let mut f = Fixture::with(IfConfig::default(), &[0x44C]);
    f.if_can().local_aliases_mut().remove(NodeAlias::new(TEST_ALIAS));
    f.if_can().add_reserved_alias(NodeAlias::new(0x33A));

    let done = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    let mut expected = vec![
        ":X1070133AN02010D000003;".to_string(),
        ":X1949033AN050101FFFFDD;".to_string(),
    ];
    expected.extend(cids(0x44C));
    assert_eq!(f.frames(), expected);

    f.send(":X19170210N050101FFFFDD;");
    assert_eq!(f.frames(), vec![":X1948833AN0210050101FFFFDD;"]);
    assert_eq!(done.try_result(), Some(Ok(())));
}

#[test]
fn test_addressed_write_from_new_node_timeout() {
    let config = IfConfig::default()
        .with_alias_lookup_timeout_ms(20)
        .with_verify_timeout_ms(50);
    let mut f = Fixture::with(config, &[0x44C]);
    f.if_can().local_aliases_mut().remove(NodeAlias::new(TEST_ALIAS));
    f.if_can().add_reserved_alias(NodeAlias::new(0x33A));

    let done = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    let mut expected = vec![
        ":X1070133AN02010D000003;".to_string(),
        ":X1949033AN050101FFFFDD;".to_string(),
    ];
    expected.extend(cids(0x44C));
    assert_eq!(f.frames(), expected);

    f.advance_ms(50);
    assert_eq!(
        done.try_result(),
        Some(Err(IfError::LookupTimeout { node: NodeId::new(REMOTE_ID) }))
    );
    assert!(f.frames().is_empty());
    // Only the allocator's pending reservation is left to go out.
    f.advance_ms(10_000);
    assert_eq!(f.frames(), vec![rid(0x44C)]);
}

#[test]
fn test_concurrent_writers_share_one_lookup() {
    let mut f = Fixture::new();
    let a = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    let b = f.write_addressed(Mti::PROTOCOL_SUPPORT_INQUIRY, TEST_NODE_ID, remote_id(), &[]);
    assert_eq!(f.frames(), vec![":X1070222AN050101FFFFDD;"]);
    assert_eq!(f.if_can().pending_lookups(), 1);

    f.send(":X10701210N050101FFFFDD;");
    let mut frames = f.frames();
    frames.sort();
    assert_eq!(
        frames,
        vec![":X1948822AN0210050101FFFFDD;", ":X1982822AN0210;"]
    );
    assert_eq!(a.try_result(), Some(Ok(())));
    assert_eq!(b.try_result(), Some(Ok(())));
}

#[test]
fn test_writers_look_up_again_when_binding_released_before_they_run() {
    let mut f = Fixture::new();
    let a = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    let b = f.write_addressed(Mti::PROTOCOL_SUPPORT_INQUIRY, TEST_NODE_ID, remote_id(), &[]);
    assert_eq!(f.frames(), vec![":X1070222AN050101FFFFDD;"]);

    // AMD then AMR for the same binding, both handled before either writer wakes.
    f.handle
        .deliver_received_frame(":X10701210N050101FFFFDD;".parse().unwrap())
        .unwrap();
    f.handle
        .deliver_received_frame(":X10703210N050101FFFFDD;".parse().unwrap())
        .unwrap();
    f.run();

    assert_eq!(f.frames(), vec![":X1070222AN050101FFFFDD;"]);
    assert_eq!(f.if_can().pending_lookups(), 1);
    assert_eq!(a.try_result(), None);
    assert_eq!(b.try_result(), None);

    f.send(":X10701345N050101FFFFDD;");
    let mut frames = f.frames();
    frames.sort();
    assert_eq!(
        frames,
        vec![":X1948822AN0345050101FFFFDD;", ":X1982822AN0345;"]
    );
    assert_eq!(a.try_result(), Some(Ok(())));
    assert_eq!(b.try_result(), Some(Ok(())));
    assert_eq!(f.if_can().pending_lookups(), 0);
}

#[test]
fn test_concurrent_writers_share_one_timeout() {
    let config = IfConfig::default()
        .with_alias_lookup_timeout_ms(20)
        .with_verify_timeout_ms(50);
    let mut f = Fixture::with(config, &[]);
    let a = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    let b = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());

    f.advance_ms(100);
    assert_eq!(
        f.frames(),
        vec![":X1070222AN050101FFFFDD;", ":X1949022AN050101FFFFDD;"]
    );
    let timeout = Err(IfError::LookupTimeout { node: NodeId::new(REMOTE_ID) });
    assert_eq!(a.try_result(), Some(timeout.clone()));
    assert_eq!(b.try_result(), Some(timeout));
}

#[test]
fn test_shutdown_abandons_pending_writes() {
    let mut f = Fixture::new();
    let done = f.write_addressed(Mti::VERIFY_NODE_ID_ADDRESSED, TEST_NODE_ID, remote_id(), &verify_payload());
    assert_eq!(done.try_result(), None);
    let Fixture { exec, .. } = f;
    let if_can = exec.shutdown();
    assert_eq!(if_can.pending_lookups(), 1);
    assert_eq!(done.try_result(), Some(Err(IfError::Abandoned)));
}

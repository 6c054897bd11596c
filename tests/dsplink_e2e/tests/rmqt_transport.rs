// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RMQT over a running link against the simulated DSP
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 12 end-to-end tests
//!
//! TEST_SCENARIOS:
//!   - locate_then_put_round_trip(): LOCATE/LOCATE_ACK, put, echo into a local queue
//!   - hpi_big_endian_four_byte_words(): size field in 4-byte words through the bridge
//!   - messages_leave_in_put_order(): outgoing FIFO order
//!   - concurrent_locates(): same and different queues from several threads
//!   - odd_sized_put_is_rejected(): sizes must be whole DSP words
//!   - unknown_remote_queue_is_not_found(): negative LOCATE_ACK, put refused and freed
//!   - locate_without_answer(): NotComplete/Timeout, LOCATE frames freed once
//!   - late_locate_ack_is_dropped(): an expired request's ack answers no later locate
//!   - close_frees_queued_messages(): teardown with a stalled output channel
//!   - peer_locate_and_exit(): DSP-initiated control traffic
//!   - message_for_missing_local_queue_is_freed(): undeliverable input
//!   - open_checks_allocator_and_transfer_size(): open-time validation
//!
//! DEPENDENCIES:
//!   - dsplink_e2e::RmqtPeer on dsp_link::host::SimDsp

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dsp_link::host::{SimBoard, SimDsp};
use dsp_link::{ChannelState, DriverConfig, HandshakeConfig, Link, LinkConfig};
use dsplink_e2e::{control_frame, PeerLog, RmqtPeer};
use nexus_hal::Endianness;
use nexus_rmqt::wire::{ControlBody, EXIT, EXIT_ACK, EXIT_REQUEST, LOCATE, LOCATE_ACK};
use nexus_rmqt::{
    AllocatorTable, LocalMsgqTable, MsgqCore, PoolAllocator, QueueStatus, Rmqt, RmqtError,
    TransportAttrs,
};
use nexus_sync::Wait;

const WAIT: Wait = Wait::Timeout(Duration::from_secs(5));
const REPLY_QUEUE: u16 = 9;

fn shm_config() -> LinkConfig {
    let mut cfg = LinkConfig::shm(0, 8);
    cfg.handshake = HandshakeConfig { poll_limit: 5_000, poll_interval_us: 200 };
    cfg
}

fn hpi_config() -> LinkConfig {
    let mut cfg = LinkConfig::hpi(1, 8);
    cfg.handshake = HandshakeConfig { poll_limit: 5_000, poll_interval_us: 200 };
    cfg
}

fn peer(cfg: &LinkConfig, attrs: &TransportAttrs) -> RmqtPeer {
    RmqtPeer::new(cfg.dsp_endianness, attrs.word_size, attrs.output_channel, attrs.input_channel)
}

/// Field order is drop order: the transport says goodbye while the DSP still runs.
struct Bench {
    rmqt: Rmqt,
    local: Arc<LocalMsgqTable>,
    pool: Arc<PoolAllocator>,
    link: Arc<Link>,
    dsp: SimDsp,
    _board: SimBoard,
    log: PeerLog,
}

fn bring_up(cfg: LinkConfig, attrs: TransportAttrs, peer: RmqtPeer) -> Bench {
    let log = peer.log();
    let board = SimBoard::new(&cfg);
    let dsp = board.spawn_dsp(peer).unwrap();
    let link = Link::initialize(cfg, board.resources()).unwrap();
    link.start().unwrap();
    let pool = Arc::new(PoolAllocator::new(attrs.max_msg_size, 32));
    let allocators = AllocatorTable::new().with(attrs.default_mqa, pool.clone());
    let local = Arc::new(LocalMsgqTable::new());
    local.create(REPLY_QUEUE).unwrap();
    let rmqt = Rmqt::open(Arc::clone(&link), attrs, allocators, local.clone()).unwrap();
    Bench { rmqt, local, pool, link, dsp, _board: board, log }
}

fn wait_until(what: &str, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn pool_settled(pool: &PoolAllocator) -> bool {
    let stats = pool.stats();
    stats.in_use == 0 && stats.allocs == stats.frees
}

fn put_payload(bench: &Bench, queue_id: u16, msg_id: u16, payload: &[u8]) {
    let rmqt = &bench.rmqt;
    let mut msg = rmqt.allocators().alloc(rmqt.attrs().default_mqa, msg_id, payload.len()).unwrap();
    msg.payload_mut().copy_from_slice(payload);
    msg.set_reply_id(REPLY_QUEUE);
    rmqt.put(queue_id, msg).unwrap();
}

#[test]
fn locate_then_put_round_trip() {
    let cfg = shm_config();
    let attrs = TransportAttrs::default();
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs).with_queues(&[1]));

    assert_eq!(bench.rmqt.status(1).unwrap(), QueueStatus::Empty);
    bench.rmqt.locate(1, WAIT).unwrap();
    assert_eq!(bench.rmqt.status(1).unwrap(), QueueStatus::InUse);

    put_payload(&bench, 1, 42, b"abcdef");
    let reply = bench.local.get(REPLY_QUEUE, WAIT).unwrap();
    assert_eq!(reply.payload(), b"abcdef");
    assert_eq!(reply.msg_id(), 42);
    assert_eq!(reply.src_id(), 1);
    assert_eq!(reply.mqt_id(), attrs.mqt_id);
    bench.rmqt.allocators().free(reply);

    {
        let log = bench.log.lock();
        let (header, payload) = &log.data[0];
        assert_eq!(header.size_words, 11);
        assert_eq!(header.dst_id, 1);
        assert_eq!(header.mqt_id, attrs.mqt_id);
        assert_eq!(payload.as_slice(), b"abcdef");
        assert_eq!(log.control_of(LOCATE)[0].queue_id, 1);
        assert_eq!(log.malformed, 0);
    }
    wait_until("pool to settle", || pool_settled(&bench.pool));
}

#[test]
fn hpi_big_endian_four_byte_words() {
    let mut cfg = hpi_config();
    cfg.dsp_endianness = Endianness::Big;
    let attrs = TransportAttrs { word_size: 4, ..TransportAttrs::default() };
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs).with_queues(&[2]));

    bench.rmqt.locate(2, WAIT).unwrap();
    put_payload(&bench, 2, 7, &[0xA5; 12]);
    let reply = bench.local.get(REPLY_QUEUE, WAIT).unwrap();
    assert_eq!(reply.payload(), &[0xA5; 12]);
    bench.rmqt.allocators().free(reply);

    assert_eq!(bench.log.lock().data[0].0.size_words, 7);
    assert_eq!(bench.dsp.protocol_violations(), 0);
    wait_until("pool to settle", || pool_settled(&bench.pool));
}

#[test]
fn messages_leave_in_put_order() {
    let cfg = shm_config();
    let attrs = TransportAttrs::default();
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs).with_queues(&[1]));
    bench.rmqt.locate(1, WAIT).unwrap();

    for id in 0..12u16 {
        put_payload(&bench, 1, id, &id.to_le_bytes());
    }
    for id in 0..12u16 {
        let reply = bench.local.get(REPLY_QUEUE, WAIT).unwrap();
        assert_eq!(reply.msg_id(), id);
        bench.rmqt.allocators().free(reply);
    }
    assert_eq!(bench.log.lock().data_ids(), (0..12).collect::<Vec<_>>());
    wait_until("outgoing FIFO to drain", || bench.rmqt.pending_outgoing() == 0);
    wait_until("pool to settle", || pool_settled(&bench.pool));
}

#[test]
fn unknown_remote_queue_is_not_found() {
    let cfg = shm_config();
    let attrs = TransportAttrs::default();
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs).with_queues(&[1]));

    assert!(matches!(bench.rmqt.locate(2, WAIT), Err(RmqtError::NotFound(2))));
    assert_eq!(bench.rmqt.status(2).unwrap(), QueueStatus::Empty);
    assert_eq!(bench.log.lock().control_of(LOCATE).len(), 1);

    let msg = bench.rmqt.allocators().alloc(0, 1, 2).unwrap();
    assert!(matches!(bench.rmqt.put(2, msg), Err(RmqtError::NotFound(2))));
    assert!(matches!(
        bench.rmqt.locate(attrs.max_queues, Wait::NonBlocking),
        Err(RmqtError::InvalidArgument(_))
    ));
    wait_until("pool to settle", || pool_settled(&bench.pool));
    assert!(bench.log.lock().data.is_empty());
}

#[test]
fn locate_without_answer() {
    let cfg = shm_config();
    let attrs = TransportAttrs { exit_timeout_ms: 20, ..TransportAttrs::default() };
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs).silent());

    assert!(matches!(bench.rmqt.locate(1, Wait::NonBlocking), Err(RmqtError::NotComplete)));
    let started = Instant::now();
    assert!(matches!(
        bench.rmqt.locate(1, Wait::Timeout(Duration::from_millis(50))),
        Err(RmqtError::Timeout)
    ));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(bench.rmqt.status(1).unwrap(), QueueStatus::Empty);

    wait_until("pool to settle", || pool_settled(&bench.pool));
    assert_eq!(bench.pool.stats().allocs, 2);
    let sent = bench.log.lock().control_of(LOCATE).len();
    assert!((1..=2).contains(&sent), "{sent} LOCATE messages reached the peer");
}

#[test]
fn late_locate_ack_is_dropped() {
    let cfg = shm_config();
    let attrs = TransportAttrs::default();
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs).with_queues(&[2]));
    let input = attrs.input_channel;

    assert!(matches!(bench.rmqt.locate(2, Wait::NonBlocking), Err(RmqtError::NotComplete)));
    // The LOCATE frame was already on the link; its ack arrives after the expiry.
    // The receive request is re-posted once the ack has been handled.
    wait_until("late locate ack", || {
        bench.link.stats().bytes_in > 0 && bench.link.has_more_pending(input).unwrap()
    });
    assert_eq!(bench.rmqt.status(2).unwrap(), QueueStatus::Empty);

    bench.rmqt.release(2).unwrap();
    bench.rmqt.locate(2, WAIT).unwrap();
    assert_eq!(bench.rmqt.status(2).unwrap(), QueueStatus::InUse);

    let locates = bench.log.lock().control_of(LOCATE);
    assert_eq!(locates.len(), 2);
    assert_ne!(locates[0].sem_handle, locates[1].sem_handle);
    wait_until("pool to settle", || pool_settled(&bench.pool));
}

#[test]
fn close_frees_queued_messages() {
    let cfg = shm_config();
    let attrs = TransportAttrs { exit_timeout_ms: 20, ..TransportAttrs::default() };
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs).with_queues(&[1]));
    bench.rmqt.locate(1, WAIT).unwrap();

    bench.dsp.set_accepting(attrs.output_channel, false);
    thread::sleep(Duration::from_millis(50));
    for id in 0..5u16 {
        put_payload(&bench, 1, id, &[0; 4]);
    }
    assert_eq!(bench.rmqt.pending_outgoing(), 5);

    bench.rmqt.close().unwrap();
    assert!(!bench.rmqt.is_open());
    assert_eq!(bench.rmqt.pending_outgoing(), 0);
    assert!(pool_settled(&bench.pool));
    assert_eq!(bench.link.channel_state(attrs.output_channel).unwrap(), ChannelState::Closed);
    assert_eq!(bench.link.channel_state(attrs.input_channel).unwrap(), ChannelState::Closed);
    assert!(bench.log.lock().data.is_empty());

    bench.rmqt.close().unwrap();
    let msg = bench.rmqt.allocators().alloc(0, 9, 0).unwrap();
    assert!(matches!(bench.rmqt.put(1, msg), Err(RmqtError::NotFound(1))));
    assert!(pool_settled(&bench.pool));
}

#[test]
fn peer_locate_and_exit() {
    let cfg = shm_config();
    let attrs = TransportAttrs::default();
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs));
    let endian = cfg.dsp_endianness;
    let inject = |msg_id, body| {
        let frame = control_frame(endian, attrs.word_size, msg_id, body).unwrap();
        bench.dsp.inject(attrs.input_channel, frame);
    };

    assert!(bench.local.contains(REPLY_QUEUE));
    inject(LOCATE, ControlBody { queue_id: REPLY_QUEUE, sem_handle: 0x55, ..Default::default() });
    inject(LOCATE, ControlBody { queue_id: 4, ..Default::default() });
    wait_until("locate answers", || bench.log.lock().control_of(LOCATE_ACK).len() == 2);
    let acks = bench.log.lock().control_of(LOCATE_ACK);
    assert!(acks[0].msgq_found);
    assert_eq!(acks[0].sem_handle, 0x55);
    assert!(!acks[1].msgq_found);

    inject(EXIT, ControlBody { arg: EXIT_REQUEST, ..Default::default() });
    wait_until("exit acknowledged", || {
        bench.log.lock().control_of(EXIT).iter().any(|body| body.arg == EXIT_ACK)
    });
    assert_eq!(bench.local.exits(), [attrs.mqt_id]);
    wait_until("pool to settle", || pool_settled(&bench.pool));
}

#[test]
fn message_for_missing_local_queue_is_freed() {
    let cfg = shm_config();
    let attrs = TransportAttrs::default();
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs).with_queues(&[1]));
    bench.rmqt.locate(1, WAIT).unwrap();

    let mut msg = bench.rmqt.allocators().alloc(0, 3, 2).unwrap();
    msg.set_reply_id(REPLY_QUEUE + 1);
    bench.rmqt.put(1, msg).unwrap();

    // LOCATE, the message and its echo.
    wait_until("echo to be dropped", || {
        let stats = bench.pool.stats();
        stats.allocs == 3 && stats.frees == 3
    });
    assert_eq!(bench.local.len(REPLY_QUEUE), 0);
}

#[test]
fn open_checks_allocator_and_transfer_size() {
    let mut cfg = shm_config();
    if let DriverConfig::Shm(shm) = &mut cfg.driver {
        shm.data_size = 128;
    }
    let attrs = TransportAttrs::default();
    let board = SimBoard::new(&cfg);
    let _dsp = board.spawn_dsp(peer(&cfg, &attrs)).unwrap();
    let link = Link::initialize(cfg, board.resources()).unwrap();
    link.start().unwrap();
    let local: Arc<LocalMsgqTable> = Arc::new(LocalMsgqTable::new());
    let pool = Arc::new(PoolAllocator::new(256, 4));

    let missing = Rmqt::open(Arc::clone(&link), attrs.clone(), AllocatorTable::new(), local.clone());
    assert!(matches!(missing, Err(RmqtError::InvalidArgument(_))));

    let allocators = AllocatorTable::new().with(0, pool.clone());
    let too_big = Rmqt::open(Arc::clone(&link), attrs.clone(), allocators.clone(), local.clone());
    assert!(matches!(too_big, Err(RmqtError::Config(_))));
    assert_eq!(link.channel_state(attrs.input_channel).unwrap(), ChannelState::Closed);

    let small = TransportAttrs { max_msg_size: 128, exit_timeout_ms: 20, ..attrs };
    let rmqt = Rmqt::open(link, small, allocators, local).unwrap();
    assert!(rmqt.is_open());
}

#[test]
fn concurrent_locates() {
    let cfg = shm_config();
    let attrs = TransportAttrs::default();
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs).with_queues(&[1, 2, 3]));

    thread::scope(|scope| {
        for queue_id in [1u16, 2, 3, 1, 2, 3] {
            let rmqt = &bench.rmqt;
            scope.spawn(move || rmqt.locate(queue_id, WAIT).unwrap());
        }
    });
    for queue_id in 1..=3 {
        assert_eq!(bench.rmqt.status(queue_id).unwrap(), QueueStatus::InUse);
    }
    bench.rmqt.locate(2, Wait::NonBlocking).unwrap();
    bench.rmqt.release(2).unwrap();
    assert_eq!(bench.rmqt.status(2).unwrap(), QueueStatus::Empty);
    wait_until("pool to settle", || pool_settled(&bench.pool));
}

#[test]
fn odd_sized_put_is_rejected() {
    let cfg = shm_config();
    let attrs = TransportAttrs::default();
    let bench = bring_up(cfg.clone(), attrs.clone(), peer(&cfg, &attrs).with_queues(&[1]));
    bench.rmqt.locate(1, WAIT).unwrap();

    let odd = bench.rmqt.allocators().alloc(0, 1, 3).unwrap();
    assert!(matches!(bench.rmqt.put(1, odd), Err(RmqtError::InvalidArgument(_))));
    let big = bench.rmqt.allocators().alloc(0, 2, attrs.max_msg_size).unwrap_err();
    assert!(matches!(big, RmqtError::InvalidArgument(_)));
    wait_until("pool to settle", || pool_settled(&bench.pool));
    assert!(bench.log.lock().data.is_empty());
}

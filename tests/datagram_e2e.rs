//! End-to-end datagram exchanges over the loopback bus: client framing,
//! response correlation, inbound reassembly and the rejection paths.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use railnet::can::{CanFrame, LoopbackCan};
use railnet::config::NodeConfig;
use railnet::datagram::{
    DST_NOT_FOUND, DST_REBOOT, DatagramClientHandle, DatagramService, OPERATION_SUCCESS,
    PERMANENT_ERROR, REJECT_OUT_OF_ORDER, REJECT_PERMANENT_ERROR, REJECT_RESEND_OK,
    RESPONSE_CODE_MASK, RESPONSE_FLAGS_SHIFT, TIMEOUT,
};
use railnet::executor::{Buf, Executor, LOWEST_PRIORITY, Priority, SEC};
use railnet::iface::defs::{
    DatagramFrameType, MTI_DATAGRAM, MTI_DATAGRAM_OK, MTI_DATAGRAM_REJECTED,
    MTI_INITIALIZATION_COMPLETE, datagram_frame_id,
};
use railnet::iface::dispatcher::Handler;
use railnet::iface::message::node_id_to_bytes;
use railnet::iface::{CanInterface, Message, MtiFilter, NodeHandle};

const LOCAL_ID: u64 = 0x0501_0101_1801;
const LOCAL_ALIAS: u16 = 0x123;
const PEER_ID: u64 = 0x0501_0101_18F2;
const PEER_ALIAS: u16 = 0xABC;

// ── Harness ───────────────────────────────────────────────────

struct TestNode {
    exec: Executor,
    bus: LoopbackCan,
    iface: CanInterface,
    service: DatagramService,
}

fn make_node() -> TestNode {
    let cfg = NodeConfig::default();
    let exec = Executor::new();
    let bus = LoopbackCan::with_tx_depth(16);
    let iface = CanInterface::new(&exec, Rc::new(bus.clone()), &cfg);
    iface.add_local_node(LOCAL_ID, LOCAL_ALIAS);
    iface.remote_aliases.register(PEER_ALIAS, PEER_ID);
    let service = DatagramService::new(&iface, &cfg);
    TestNode { exec, bus, iface, service }
}

struct CaptureSink(RefCell<Vec<Message>>);

impl Handler<Buf<Message>> for CaptureSink {
    fn send(&self, msg: Buf<Message>, _priority: Priority) {
        self.0.borrow_mut().push(msg.data().clone());
    }
}

impl TestNode {
    /// Queue a datagram from the local node to the peer and run the
    /// executor until it has gone quiet.
    fn send_datagram(&self, payload: &[u8]) -> (DatagramClientHandle, Rc<Cell<bool>>) {
        let msg = self.iface.new_message();
        {
            let mut m = msg.data_mut();
            m.src = NodeHandle { id: LOCAL_ID, alias: LOCAL_ALIAS };
            m.dst = NodeHandle { id: PEER_ID, alias: PEER_ALIAS };
            m.set_payload(payload).unwrap();
        }
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        msg.set_done(move || flag.set(true));

        let client = self.service.try_acquire().expect("an idle client").clone();
        client.write_datagram(msg, LOWEST_PRIORITY);
        self.exec.run_until_idle();
        (client, done)
    }

    /// Deliver a protocol response as the peer would, post-parse.
    fn respond(&self, mti: u16, payload: &[u8]) {
        let buf = self.iface.new_message();
        {
            let mut m = buf.data_mut();
            m.mti = mti;
            m.src = NodeHandle { id: PEER_ID, alias: PEER_ALIAS };
            m.dst = NodeHandle { id: LOCAL_ID, alias: LOCAL_ALIAS };
            m.set_payload(payload).unwrap();
        }
        self.iface.dispatcher.send(buf, LOWEST_PRIORITY);
        self.exec.run_until_idle();
    }

    /// Collect every datagram the parser publishes.
    fn capture_datagrams(&self) -> Rc<CaptureSink> {
        let sink = Rc::new(CaptureSink(RefCell::new(Vec::new())));
        self.iface.dispatcher.register(MtiFilter::exact(MTI_DATAGRAM), sink.clone());
        sink
    }

    /// Drain the rejections queued on the addressed-writer seam.
    fn take_rejections(&self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some((buf, _priority)) = self.iface.addressed_out.try_recv() {
            out.push(buf.data().clone());
        }
        out
    }

    fn inject(&self, frame: CanFrame) {
        self.bus.inject(frame);
        self.exec.run_until_idle();
    }
}

fn inbound(frame_type: DatagramFrameType, src: u16, payload: &[u8]) -> CanFrame {
    CanFrame::extended(datagram_frame_id(frame_type, LOCAL_ALIAS, src), payload)
}

// ── S1: happy single-frame ────────────────────────────────────

#[test]
fn single_frame_datagram_acked() {
    let node = make_node();
    let (client, done) = node.send_datagram(&[0x20, 0xFF]);

    let frames = node.bus.take_tx();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, 0x1AAB_C123);
    assert!(frames[0].extended);
    assert_eq!(frames[0].payload(), &[0x20, 0xFF]);

    assert!(!done.get(), "no completion before the peer responds");
    node.respond(MTI_DATAGRAM_OK, &[]);

    assert_eq!(client.result(), OPERATION_SUCCESS);
    assert!(done.get());
    assert!(!client.is_busy());
}

// ── S2: fragmented happy path ─────────────────────────────────

#[test]
fn fragmented_datagram_with_response_flags() {
    let node = make_node();
    let payload: Vec<u8> = (0u8..17).collect();
    let (client, _done) = node.send_datagram(&payload);

    let frames = node.bus.take_tx();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].id, 0x1BAB_C123, "first frame");
    assert_eq!(frames[0].payload(), &payload[0..8]);
    assert_eq!(frames[1].id, 0x1CAB_C123, "middle frame");
    assert_eq!(frames[1].payload(), &payload[8..16]);
    assert_eq!(frames[2].id, 0x1DAB_C123, "final frame");
    assert_eq!(frames[2].payload(), &payload[16..17]);

    node.respond(MTI_DATAGRAM_OK, &[0x80]);
    assert_eq!(client.result(), OPERATION_SUCCESS | (0x80 << RESPONSE_FLAGS_SHIFT));
}

// ── S3: rejection ─────────────────────────────────────────────

#[test]
fn rejection_sets_error_code_and_permanent() {
    let node = make_node();
    let (client, done) = node.send_datagram(&[1, 2, 3, 4]);

    node.respond(MTI_DATAGRAM_REJECTED, &[0x10, 0x00]);
    let result = client.result();
    assert_eq!(result & RESPONSE_CODE_MASK, 0x1000);
    assert!(result & PERMANENT_ERROR != 0);
    assert_eq!(result & OPERATION_SUCCESS, 0);
    assert!(done.get());
}

// ── S4: response timeout ──────────────────────────────────────

#[test]
fn response_timeout_after_three_seconds() {
    let node = make_node();
    let (client, done) = node.send_datagram(&[1, 2, 3, 4]);

    node.exec.advance(3 * SEC);
    assert_eq!(client.result(), PERMANENT_ERROR | TIMEOUT);
    assert!(done.get());
    assert_eq!(node.iface.dispatcher.handler_count(), 0, "listener unregistered");

    // A straggling ack can no longer change the outcome.
    node.respond(MTI_DATAGRAM_OK, &[]);
    assert_eq!(client.result(), PERMANENT_ERROR | TIMEOUT);
}

// ── S5: destination reboot mid-transfer ───────────────────────

#[test]
fn destination_reboot_aborts_without_retry() {
    let cfg = NodeConfig::default();
    let exec = Executor::new();
    let bus = LoopbackCan::with_tx_depth(2);
    let iface = CanInterface::new(&exec, Rc::new(bus.clone()), &cfg);
    iface.add_local_node(LOCAL_ID, LOCAL_ALIAS);
    iface.remote_aliases.register(PEER_ALIAS, PEER_ID);
    let service = DatagramService::new(&iface, &cfg);

    let payload = [0xEE; 48]; // six frames
    let msg = iface.new_message();
    {
        let mut m = msg.data_mut();
        m.src = NodeHandle { id: LOCAL_ID, alias: LOCAL_ALIAS };
        m.dst = NodeHandle { id: PEER_ID, alias: PEER_ALIAS };
        m.set_payload(&payload).unwrap();
    }
    let client = service.try_acquire().unwrap().clone();
    client.write_datagram(msg, LOWEST_PRIORITY);
    exec.run_until_idle();
    assert_eq!(bus.tx_level(), 2, "device full after two frames");

    // The destination announces it rebooted.
    let init = iface.new_message();
    {
        let mut m = init.data_mut();
        m.mti = MTI_INITIALIZATION_COMPLETE;
        m.src = NodeHandle { id: PEER_ID, alias: PEER_ALIAS };
        m.set_payload(&node_id_to_bytes(PEER_ID)).unwrap();
    }
    iface.dispatcher.send(init, LOWEST_PRIORITY);
    exec.run_until_idle();

    let result = client.result();
    assert!(result & DST_REBOOT != 0);
    assert_eq!(result & OPERATION_SUCCESS, 0);
    assert!(!client.is_busy(), "flow finalised");

    // Drain the wire: the frames already queued go out, nothing is retried.
    let mut total = bus.take_tx().len();
    loop {
        exec.run_until_idle();
        let drained = bus.take_tx().len();
        if drained == 0 {
            break;
        }
        total += drained;
    }
    assert!(total <= 6, "no retransmission after reboot, saw {total} frames");
}

// ── S6: interleaved inbound reassembly ────────────────────────

#[test]
fn interleaved_datagrams_from_two_peers() {
    let node = make_node();
    let sink = node.capture_datagrams();

    let a: Vec<u8> = (0u8..16).collect();
    let b: Vec<u8> = (100u8..116).collect();
    node.inject(inbound(DatagramFrameType::First, 0xAAA, &a[0..8]));
    node.inject(inbound(DatagramFrameType::First, 0xBBB, &b[0..8]));
    node.inject(inbound(DatagramFrameType::Final, 0xAAA, &a[8..16]));
    node.inject(inbound(DatagramFrameType::Final, 0xBBB, &b[8..16]));

    let seen = sink.0.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(&seen[0].payload[..], &a[..]);
    assert_eq!(seen[0].src.alias, 0xAAA);
    assert_eq!(&seen[1].payload[..], &b[..]);
    assert_eq!(seen[1].src.alias, 0xBBB);
    assert_eq!(seen[0].dst_node, Some(LOCAL_ID));
    assert!(node.take_rejections().is_empty());
}

// ── Boundary framings ─────────────────────────────────────────

#[test]
fn zero_byte_payload_is_one_empty_frame() {
    let node = make_node();
    let (_client, _done) = node.send_datagram(&[]);
    let frames = node.bus.take_tx();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id >> 24, 0x1A);
    assert_eq!(frames[0].dlc, 0);

    // The parser delivers the empty payload too.
    let sink = node.capture_datagrams();
    node.inject(inbound(DatagramFrameType::One, 0xAAA, &[]));
    assert_eq!(sink.0.borrow().len(), 1);
    assert!(sink.0.borrow()[0].payload.is_empty());
}

#[test]
fn eight_byte_payload_fits_one_frame() {
    let node = make_node();
    let (_client, _done) = node.send_datagram(&[7; 8]);
    let frames = node.bus.take_tx();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id >> 24, 0x1A);
    assert_eq!(frames[0].dlc, 8);
}

#[test]
fn nine_byte_payload_splits_first_final() {
    let node = make_node();
    let (_client, _done) = node.send_datagram(&[7; 9]);
    let frames = node.bus.take_tx();
    assert_eq!(frames.len(), 2);
    assert_eq!((frames[0].id >> 24, frames[0].dlc), (0x1B, 8));
    assert_eq!((frames[1].id >> 24, frames[1].dlc), (0x1D, 1));
}

#[test]
fn seventy_two_bytes_is_first_seven_middles_final() {
    let node = make_node();
    let (_client, _done) = node.send_datagram(&[7; 72]);
    let frames = node.bus.take_tx();
    assert_eq!(frames.len(), 9);
    assert_eq!(frames[0].id >> 24, 0x1B);
    for frame in &frames[1..8] {
        assert_eq!(frame.id >> 24, 0x1C);
        assert_eq!(frame.dlc, 8);
    }
    assert_eq!(frames[8].id >> 24, 0x1D);
    assert_eq!(frames[8].dlc, 8);
}

#[test]
fn seventy_three_bytes_cannot_be_built() {
    let node = make_node();
    let msg = node.iface.new_message();
    assert!(msg.data_mut().set_payload(&[0; 73]).is_err());
}

// ── Reassembly rejections ─────────────────────────────────────

#[test]
fn duplicate_first_frame_is_rejected_out_of_order() {
    let node = make_node();
    let sink = node.capture_datagrams();

    node.inject(inbound(DatagramFrameType::First, 0xAAA, &[1; 8]));
    assert!(node.take_rejections().is_empty());

    node.inject(inbound(DatagramFrameType::First, 0xAAA, &[2; 8]));
    let rejections = node.take_rejections();
    assert_eq!(rejections.len(), 1);
    let r = &rejections[0];
    assert_eq!(r.mti, MTI_DATAGRAM_REJECTED);
    assert_eq!(&r.payload[..], &(REJECT_RESEND_OK | REJECT_OUT_OF_ORDER).to_be_bytes());
    assert_eq!(r.dst.alias, 0xAAA);
    assert_eq!(r.src.id, LOCAL_ID);
    assert!(sink.0.borrow().is_empty());
}

#[test]
fn middle_or_final_without_first_is_rejected() {
    let node = make_node();
    let sink = node.capture_datagrams();

    node.inject(inbound(DatagramFrameType::Middle, 0xAAA, &[1; 8]));
    node.inject(inbound(DatagramFrameType::Final, 0xBBB, &[1; 4]));

    let rejections = node.take_rejections();
    assert_eq!(rejections.len(), 2);
    for r in &rejections {
        assert_eq!(&r.payload[..], &(REJECT_RESEND_OK | REJECT_OUT_OF_ORDER).to_be_bytes());
    }
    assert!(sink.0.borrow().is_empty());
}

#[test]
fn oversized_reassembly_is_rejected_permanent() {
    let node = make_node();
    let sink = node.capture_datagrams();

    node.inject(inbound(DatagramFrameType::First, 0xAAA, &[0; 8]));
    for _ in 0..8 {
        node.inject(inbound(DatagramFrameType::Middle, 0xAAA, &[0; 8]));
    }
    // 72 bytes are in flight; the next 8 push past the limit.
    node.inject(inbound(DatagramFrameType::Middle, 0xAAA, &[0; 8]));

    let rejections = node.take_rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(&rejections[0].payload[..], &REJECT_PERMANENT_ERROR.to_be_bytes());

    // The pending entry is gone, so the trailing final is out-of-order.
    node.inject(inbound(DatagramFrameType::Final, 0xAAA, &[0; 8]));
    let rejections = node.take_rejections();
    assert_eq!(&rejections[0].payload[..], &(REJECT_RESEND_OK | REJECT_OUT_OF_ORDER).to_be_bytes());
    assert!(sink.0.borrow().is_empty());
}

#[test]
fn frames_for_foreign_destinations_are_dropped() {
    let node = make_node();
    let sink = node.capture_datagrams();
    // Alias 0x999 is not hosted here.
    let frame = CanFrame::extended(datagram_frame_id(DatagramFrameType::One, 0x999, 0xAAA), &[1]);
    node.inject(frame);
    assert!(sink.0.borrow().is_empty());
    assert!(node.take_rejections().is_empty());
}

// ── Reaper ────────────────────────────────────────────────────

#[test]
fn stale_reassembly_is_reaped_after_timeout() {
    let node = make_node();
    let sink = node.capture_datagrams();

    node.inject(inbound(DatagramFrameType::First, 0xAAA, &[1; 8]));
    node.exec.advance(4 * SEC);

    // The entry is gone: the final frame no longer completes anything.
    node.inject(inbound(DatagramFrameType::Final, 0xAAA, &[2; 8]));
    let rejections = node.take_rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(&rejections[0].payload[..], &(REJECT_RESEND_OK | REJECT_OUT_OF_ORDER).to_be_bytes());
    assert!(sink.0.borrow().is_empty());
}

// ── Destination resolution ────────────────────────────────────

#[test]
fn unknown_destination_times_out_with_dst_not_found() {
    let node = make_node();
    let msg = node.iface.new_message();
    {
        let mut m = msg.data_mut();
        m.src = NodeHandle { id: LOCAL_ID, alias: LOCAL_ALIAS };
        // Known by id only, and never registered.
        m.dst = NodeHandle { id: 0x0666_0000_0001, alias: 0 };
        m.set_payload(&[1]).unwrap();
    }
    let client = node.service.try_acquire().unwrap().clone();
    client.write_datagram(msg, LOWEST_PRIORITY);
    node.exec.run_until_idle();
    assert!(client.is_busy(), "client waits one lookup window");

    node.exec.advance(2 * SEC);
    assert_eq!(client.result(), PERMANENT_ERROR | DST_NOT_FOUND);
    assert!(node.bus.take_tx().is_empty(), "nothing went on the wire");
}

#[test]
fn late_alias_registration_rescues_the_lookup() {
    let node = make_node();
    let late_id: u64 = 0x0777_0000_0001;
    let msg = node.iface.new_message();
    {
        let mut m = msg.data_mut();
        m.src = NodeHandle { id: LOCAL_ID, alias: LOCAL_ALIAS };
        m.dst = NodeHandle { id: late_id, alias: 0 };
        m.set_payload(&[0x42]).unwrap();
    }
    let client = node.service.try_acquire().unwrap().clone();
    client.write_datagram(msg, LOWEST_PRIORITY);
    node.exec.run_until_idle();

    // Discovery surfaces the alias inside the lookup window.
    node.iface.remote_aliases.register(0x5E5, late_id);
    node.exec.advance(2 * SEC);

    let frames = node.bus.take_tx();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, datagram_frame_id(DatagramFrameType::One, 0x5E5, LOCAL_ALIAS));
}

// ── Client pool ───────────────────────────────────────────────

#[test]
fn acquire_skips_busy_clients() {
    let node = make_node();
    let (first, _done) = node.send_datagram(&[1]);
    assert!(first.is_busy());

    let second = node.service.try_acquire().expect("second client free").clone();
    assert!(!second.is_busy());

    // Both configured clients busy: nothing left to acquire.
    let msg = node.iface.new_message();
    {
        let mut m = msg.data_mut();
        m.src = NodeHandle { id: LOCAL_ID, alias: LOCAL_ALIAS };
        m.dst = NodeHandle { id: PEER_ID, alias: PEER_ALIAS };
    }
    second.write_datagram(msg, LOWEST_PRIORITY);
    node.exec.run_until_idle();
    assert!(node.service.try_acquire().is_none());

    node.respond(MTI_DATAGRAM_OK, &[]);
    // One response matches both outstanding operations' filters; both
    // clients correlate on (src, dst) and this response satisfies either.
    assert!(node.service.try_acquire().is_some());
}

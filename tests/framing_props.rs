//! Property tests for the datagram framing laws.
//!
//! The central law: any payload the client can render is reassembled by
//! the parser into the identical payload with the original alias pair.
//! A second family drives the parser with arbitrary fragment sequences to
//! check it never delivers an over-long payload and never wedges.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;

use railnet::can::{CanFrame, LoopbackCan};
use railnet::config::NodeConfig;
use railnet::datagram::DatagramService;
use railnet::executor::{Buf, Executor, LOWEST_PRIORITY, Priority};
use railnet::iface::defs::{DatagramFrameType, MTI_DATAGRAM, datagram_frame_id};
use railnet::iface::dispatcher::Handler;
use railnet::iface::{CanInterface, Message, MtiFilter, NodeHandle};

const SENDER_ID: u64 = 0x0501_0101_0001;
const RECEIVER_ID: u64 = 0x0501_0101_0002;

struct CaptureSink(RefCell<Vec<Message>>);

impl Handler<Buf<Message>> for CaptureSink {
    fn send(&self, msg: Buf<Message>, _priority: Priority) {
        self.0.borrow_mut().push(msg.data().clone());
    }
}

fn render_frames(payload: &[u8], src_alias: u16, dst_alias: u16) -> Vec<CanFrame> {
    let cfg = NodeConfig::default();
    let exec = Executor::new();
    let bus = LoopbackCan::with_tx_depth(16);
    let iface = CanInterface::new(&exec, Rc::new(bus.clone()), &cfg);
    iface.add_local_node(SENDER_ID, src_alias);
    iface.remote_aliases.register(dst_alias, RECEIVER_ID);
    let service = DatagramService::new(&iface, &cfg);

    let msg = iface.new_message();
    {
        let mut m = msg.data_mut();
        m.src = NodeHandle { id: SENDER_ID, alias: src_alias };
        m.dst = NodeHandle { id: RECEIVER_ID, alias: dst_alias };
        m.set_payload(payload).unwrap();
    }
    service.try_acquire().unwrap().write_datagram(msg, LOWEST_PRIORITY);
    exec.run_until_idle();
    bus.take_tx()
}

fn parse_frames(frames: &[CanFrame], dst_alias: u16) -> Vec<Message> {
    let cfg = NodeConfig::default();
    let exec = Executor::new();
    let bus = LoopbackCan::new();
    let iface = CanInterface::new(&exec, Rc::new(bus.clone()), &cfg);
    iface.add_local_node(RECEIVER_ID, dst_alias);
    let _service = DatagramService::new(&iface, &cfg);

    let sink = Rc::new(CaptureSink(RefCell::new(Vec::new())));
    iface.dispatcher.register(MtiFilter::exact(MTI_DATAGRAM), sink.clone());

    for frame in frames {
        bus.inject(*frame);
        exec.run_until_idle();
    }
    let out = sink.0.borrow().clone();
    out
}

proptest! {
    /// Encode-then-decode identity over the full payload and alias space.
    #[test]
    fn client_frames_reassemble_to_the_same_payload(
        payload in proptest::collection::vec(any::<u8>(), 0..=72),
        src_alias in 1u16..=0xFFE,
        dst_offset in 1u16..=0xFFE,
    ) {
        // Distinct aliases; the pair is otherwise arbitrary.
        let dst_alias = if dst_offset == src_alias { 0xFFF } else { dst_offset };

        let frames = render_frames(&payload, src_alias, dst_alias);
        let expected = payload.len().div_ceil(8).max(1);
        prop_assert_eq!(frames.len(), expected);

        let delivered = parse_frames(&frames, dst_alias);
        prop_assert_eq!(delivered.len(), 1);
        let m = &delivered[0];
        prop_assert_eq!(&m.payload[..], &payload[..]);
        prop_assert_eq!(m.src.alias, src_alias);
        prop_assert_eq!(m.dst.alias, dst_alias);
    }

    /// Arbitrary fragment sequences never wedge the parser and never
    /// produce an over-long delivery.
    #[test]
    fn parser_survives_arbitrary_fragment_sequences(
        ops in proptest::collection::vec(
            (0u8..4, 0u16..4, proptest::collection::vec(any::<u8>(), 0..=8)),
            1..=40,
        ),
    ) {
        let cfg = NodeConfig::default();
        let exec = Executor::new();
        let bus = LoopbackCan::new();
        let iface = CanInterface::new(&exec, Rc::new(bus.clone()), &cfg);
        let dst_alias = 0x123;
        iface.add_local_node(RECEIVER_ID, dst_alias);
        let _service = DatagramService::new(&iface, &cfg);

        let sink = Rc::new(CaptureSink(RefCell::new(Vec::new())));
        iface.dispatcher.register(MtiFilter::exact(MTI_DATAGRAM), sink.clone());

        for (kind, src_index, data) in &ops {
            let frame_type = match kind {
                0 => DatagramFrameType::One,
                1 => DatagramFrameType::First,
                2 => DatagramFrameType::Middle,
                _ => DatagramFrameType::Final,
            };
            let src_alias = 0xA00 + src_index;
            let id = datagram_frame_id(frame_type, dst_alias, src_alias);
            bus.inject(CanFrame::extended(id, data));
            exec.run_until_idle();
        }

        for m in sink.0.borrow().iter() {
            prop_assert!(m.payload.len() <= 72);
            prop_assert_eq!(m.dst.alias, dst_alias);
        }
        // The parser is still live: a fresh single-frame datagram lands.
        let before = sink.0.borrow().len();
        bus.inject(CanFrame::extended(
            datagram_frame_id(DatagramFrameType::One, dst_alias, 0xEEE),
            &[0x55],
        ));
        exec.run_until_idle();
        prop_assert_eq!(sink.0.borrow().len(), before + 1);
    }
}

//! RailNet loopback demo.
//!
//! Wires the full messaging core against the in-process loopback CAN bus
//! and runs one datagram exchange between two locally hosted nodes: the
//! client fragments the payload onto the wire, the bus echoes the frames
//! back, the parser reassembles them, and a small responder acks with
//! `DATAGRAM_OK` — exercising every flow in the crate without hardware.

use std::cell::Cell;
use std::rc::Rc;

use anyhow::Result;
use log::info;

use railnet::can::LoopbackCan;
use railnet::config::NodeConfig;
use railnet::datagram::{DatagramService, OPERATION_SUCCESS};
use railnet::executor::{Buf, Executor, LOWEST_PRIORITY, Priority};
use railnet::iface::defs::{MTI_DATAGRAM, MTI_DATAGRAM_OK};
use railnet::iface::dispatcher::Handler;
use railnet::iface::message::Payload;
use railnet::iface::{CanInterface, Message, MtiFilter, NodeHandle};

const NODE_A_ID: u64 = 0x0501_0101_1801;
const NODE_A_ALIAS: u16 = 0x123;
const NODE_B_ID: u64 = 0x0501_0101_1802;
const NODE_B_ALIAS: u16 = 0xABC;

/// Acks every datagram delivered to a local node.
struct AckResponder {
    iface: CanInterface,
    acked: Rc<Cell<u32>>,
}

impl Handler<Buf<Message>> for AckResponder {
    fn send(&self, msg: Buf<Message>, priority: Priority) {
        let (src, dst) = {
            let m = msg.data();
            info!("datagram delivered to {:012x}: {} bytes", m.dst.id, m.payload.len());
            (m.src, m.dst)
        };
        self.acked.set(self.acked.get() + 1);

        let reply = self.iface.new_message();
        {
            let mut r = reply.data_mut();
            r.reset(MTI_DATAGRAM_OK, dst.id, src, Payload::new());
            r.src.alias = dst.alias;
        }
        self.iface.dispatcher.send(reply, priority);
    }
}

fn main() -> Result<()> {
    let cfg = NodeConfig::from_json(
        r#"{
            "datagram_response_timeout_ms": 3000,
            "alias_lookup_timeout_ms": 1000,
            "reassembly_timeout_ms": 3000,
            "datagram_clients": 2,
            "frame_pool_size": 16,
            "message_pool_size": 8
        }"#,
    )?;

    let exec = Executor::new();
    let bus = LoopbackCan::new();
    bus.set_echo(true);

    let iface = CanInterface::new(&exec, Rc::new(bus.clone()), &cfg);
    iface.add_local_node(NODE_A_ID, NODE_A_ALIAS);
    iface.add_local_node(NODE_B_ID, NODE_B_ALIAS);

    let service = DatagramService::new(&iface, &cfg);

    let acked = Rc::new(Cell::new(0));
    iface.dispatcher.register(
        MtiFilter::exact(MTI_DATAGRAM),
        Rc::new(AckResponder { iface: iface.clone(), acked: acked.clone() }),
    );

    // A 17-byte payload: one FIRST, one MIDDLE, one FINAL frame.
    let payload: Vec<u8> = (0u8..17).collect();
    let msg = iface.new_message();
    {
        let mut m = msg.data_mut();
        m.src = NodeHandle { id: NODE_A_ID, alias: NODE_A_ALIAS };
        m.dst = NodeHandle { id: NODE_B_ID, alias: NODE_B_ALIAS };
        m.set_payload(&payload)?;
    }
    let done = Rc::new(Cell::new(false));
    let done_flag = done.clone();
    msg.set_done(move || done_flag.set(true));

    let client = service.try_acquire().expect("a configured client is idle");
    client.write_datagram(msg, LOWEST_PRIORITY);
    exec.run_until_idle();

    let wire = bus.take_tx();
    println!("frames on the wire : {}", wire.len());
    println!("datagrams delivered: {}", acked.get());
    println!("done fired         : {}", done.get());
    println!("result word        : 0x{:08x}", client.result());
    anyhow::ensure!(client.result() == OPERATION_SUCCESS, "datagram exchange failed");
    Ok(())
}

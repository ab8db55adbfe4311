//! Protocol interface layer: node identities, messages, registries and the
//! dispatchers that tie the transport flows to the protocol engines.

pub mod aliases;
pub mod defs;
pub mod dispatcher;
pub mod message;

use std::rc::Rc;

use crate::can::{CanDriver, CanFrame, CanFrameWriter, FrameDispatcher, spawn_frame_reader};
use crate::config::NodeConfig;
use crate::executor::{Buf, Executor, FlowRef, Mailbox, Pool};

pub use aliases::{AliasRegistry, LocalNodeTable};
pub use dispatcher::{Handler, MessageDispatcher, MtiFilter};
pub use message::{MAX_DATAGRAM_SIZE, Message, NodeHandle, Payload};

/// Full 48-bit node identifier. Zero means "unknown".
pub type NodeId = u64;

/// 12-bit CAN short alias. Zero means "unknown".
pub type NodeAlias = u16;

/// The shared hub every protocol flow hangs off: buffer pools, the two
/// dispatchers, the transport flows and the identity registries. Cheap to
/// clone; clones share state.
#[derive(Clone)]
pub struct CanInterface {
    pub exec: Executor,
    pub frame_pool: Pool<CanFrame>,
    pub message_pool: Pool<Message>,
    /// MTI-keyed protocol message demultiplexer.
    pub dispatcher: MessageDispatcher,
    /// CAN-ID-keyed inbound frame demultiplexer.
    pub frames_in: FrameDispatcher,
    /// Outbound frame flow.
    pub frames_out: CanFrameWriter,
    /// Attachment seam for the addressed-message write flow (an external
    /// collaborator); the parser emits rejections through it.
    pub addressed_out: Mailbox<Buf<Message>>,
    pub local_aliases: AliasRegistry,
    pub remote_aliases: AliasRegistry,
    pub local_nodes: LocalNodeTable,
    frame_reader: FlowRef,
}

impl CanInterface {
    pub fn new(exec: &Executor, driver: Rc<dyn CanDriver>, cfg: &NodeConfig) -> Self {
        let frame_pool: Pool<CanFrame> = Pool::new("can-frames", cfg.frame_pool_size);
        let message_pool: Pool<Message> = Pool::new("messages", cfg.message_pool_size);
        let dispatcher = MessageDispatcher::new(exec, "msg-dispatch");
        let frames_in = FrameDispatcher::new(exec, "frame-dispatch");
        let frames_out = CanFrameWriter::new(exec, driver.clone());
        let frame_reader = spawn_frame_reader(exec, driver, frame_pool.clone(), frames_in.clone());
        Self {
            exec: exec.clone(),
            frame_pool,
            message_pool,
            dispatcher,
            frames_in,
            frames_out,
            addressed_out: Mailbox::new(),
            local_aliases: AliasRegistry::new(),
            remote_aliases: AliasRegistry::new(),
            local_nodes: LocalNodeTable::new(),
            frame_reader,
        }
    }

    /// Register a node hosted on this interface under `alias`.
    pub fn add_local_node(&self, id: NodeId, alias: NodeAlias) {
        self.local_nodes.add(id);
        self.local_aliases.register(alias, id);
    }

    /// Allocate a fresh protocol message buffer.
    pub fn new_message(&self) -> Buf<Message> {
        self.message_pool.alloc()
    }
}

//! The downward interface to the network fabric.
//!
//! A [`Fabric`] accepts buffer operations and later reports their outcome as
//! [`RawCompletion`]s through the [`CompletionSink`] attached for the local
//! endpoint. The completion sink runs in whatever context the fabric delivers
//! from and must not block.

use std::sync::Arc;

use crate::addr::{EndpointAddr, Nid};
use crate::buffer::{BufferId, MemoryRegion};
use crate::error::FabricResult;
use crate::match_bits;

/// Handle of a submitted fabric operation, used to unlink (cancel) it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpHandle(pub u64);

/// The kind of event a fabric reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// The local half of an outbound put or get finished.
    Send,
    /// Data from a remote put landed in a local buffer.
    Put,
    /// A remote get read from a local buffer.
    Get,
    /// The data of a local get arrived.
    Reply,
    /// A remote acknowledged a put.
    Ack,
    /// The operation was unlinked before completing.
    Unlink,
}

/// Identity of the process that initiated an inbound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    /// Network identifier of the initiator.
    pub nid: Nid,
    /// Process identifier of the initiator.
    pub pid: u32,
}

/// One completion record as reported by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCompletion {
    /// Event kind.
    pub kind: CompletionKind,
    /// Token of the local buffer the event belongs to.
    pub buffer_id: BufferId,
    /// Zero on success, else a negative errno value.
    pub status: i32,
    /// Bytes transferred.
    pub length: u64,
    /// Offset within the local buffer.
    pub offset: u64,
    /// True if the fabric will report nothing more for this buffer.
    pub unlinked: bool,
    /// Header data carried by the inbound operation (see [`sender_tag`]).
    pub routing_tag: u64,
    /// Initiator of an inbound operation.
    pub peer: Option<PeerId>,
}

impl RawCompletion {
    /// Creates a successful, non-terminal completion with no peer information.
    pub fn new(kind: CompletionKind, buffer_id: BufferId) -> Self {
        Self {
            kind,
            buffer_id,
            status: 0,
            length: 0,
            offset: 0,
            unlinked: false,
            routing_tag: 0,
            peer: None,
        }
    }
}

/// Header data identifying the sending endpoint of a message.
pub fn sender_tag(addr: &EndpointAddr) -> u64 {
    match_bits::encode(addr.tmid.unwrap_or(0), u64::from(addr.portal))
}

/// Rebuilds a sender address from an initiator identity and its [`sender_tag`].
pub fn decode_sender(peer: PeerId, tag: u64) -> EndpointAddr {
    let (tmid, portal) = match_bits::decode(tag);
    EndpointAddr::new(peer.nid, peer.pid, portal as u32, tmid)
}

/// What a fabric operation does with its buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricOpKind {
    /// Expose the buffer to unsolicited messages addressed to the endpoint.
    AttachRecv {
        /// Maximum number of messages accepted.
        threshold: u32,
        /// The buffer retires once less than this much space remains.
        min_receive_size: usize,
    },
    /// Expose the buffer to one remote put (`accept_put`) or get.
    AttachPassive {
        /// Match bits the remote operation must carry.
        match_bits: u64,
        /// True for a remote put, false for a remote get.
        accept_put: bool,
        /// Bytes exposed.
        length: usize,
    },
    /// Write the first `length` bytes to the target.
    Put {
        /// Remote endpoint.
        target: EndpointAddr,
        /// Match bits selecting the remote buffer.
        match_bits: u64,
        /// Bytes to write.
        length: usize,
        /// Header data carried to the target.
        hdr_data: u64,
    },
    /// Read up to `length` bytes from the target.
    Get {
        /// Remote endpoint.
        target: EndpointAddr,
        /// Match bits selecting the remote buffer.
        match_bits: u64,
        /// Bytes to read.
        length: usize,
    },
}

/// A buffer operation handed to the fabric.
#[derive(Debug, Clone)]
pub struct FabricOp {
    /// Token echoed back in every completion.
    pub buffer_id: BufferId,
    /// Memory the operation reads or writes.
    pub region: Arc<MemoryRegion>,
    /// Operation details.
    pub kind: FabricOpKind,
}

/// Receiver of raw completions for one endpoint.
pub trait CompletionSink: Send + Sync {
    /// Handles one raw completion; must not block.
    fn on_completion(&self, completion: RawCompletion);
}

/// An operation-completion source: submit operations, receive completions later.
pub trait Fabric: Send + Sync {
    /// Registers `sink` to receive completions for operations at `addr`.
    fn attach(&self, addr: &EndpointAddr, sink: Arc<dyn CompletionSink>) -> FabricResult<()>;

    /// Removes the endpoint at `addr`; later inbound traffic for it is dropped.
    fn detach(&self, addr: &EndpointAddr);

    /// Starts an operation on behalf of the endpoint at `local`.
    fn submit(&self, local: &EndpointAddr, op: FabricOp) -> FabricResult<OpHandle>;

    /// Requests cancellation. Returns false if the operation already finished.
    fn unlink(&self, handle: OpHandle) -> bool;
}

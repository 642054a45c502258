//! Core buffers, buffer operations and buffer completion events.
//!
//! A [`CoreBuffer`] is a registered memory region owned by the application.
//! While an operation is in flight the core only keeps the buffer's
//! [`BufferId`] token, echoed back by the fabric in every completion, plus an
//! [`InflightOp`] record holding provisioning and reconciliation state.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::addr::EndpointAddr;
use crate::descriptor::BufDesc;
use crate::fabric::OpHandle;

/// Status of a successful completion.
pub const STATUS_OK: i32 = 0;
/// Status of a cancelled operation (`-ECANCELED`).
pub const STATUS_CANCELED: i32 = -125;
/// Status of an operation whose target could not be matched (`-ENOENT`).
pub const STATUS_NO_MATCH: i32 = -2;
/// Status of an operation whose payload did not fit (`-EMSGSIZE`).
pub const STATUS_TOO_LARGE: i32 = -90;

/// Identifying token of a registered buffer, echoed by the fabric on completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of operation a buffer participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueueType {
    /// Receives unsolicited messages, possibly several per buffer.
    MsgRecv = 0,
    /// Sends one message.
    MsgSend = 1,
    /// Exposes memory for a remote active send to write into.
    PassiveBulkRecv = 2,
    /// Exposes memory for a remote active receive to read from.
    PassiveBulkSend = 3,
    /// Reads from a remote passive send buffer.
    ActiveBulkRecv = 4,
    /// Writes into a remote passive receive buffer.
    ActiveBulkSend = 5,
}

impl QueueType {
    /// Every queue type, in wire code order.
    pub const ALL: [QueueType; 6] = [
        QueueType::MsgRecv,
        QueueType::MsgSend,
        QueueType::PassiveBulkRecv,
        QueueType::PassiveBulkSend,
        QueueType::ActiveBulkRecv,
        QueueType::ActiveBulkSend,
    ];

    /// Converts the wire code back into a queue type.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(QueueType::MsgRecv),
            1 => Some(QueueType::MsgSend),
            2 => Some(QueueType::PassiveBulkRecv),
            3 => Some(QueueType::PassiveBulkSend),
            4 => Some(QueueType::ActiveBulkRecv),
            5 => Some(QueueType::ActiveBulkSend),
            _ => None,
        }
    }

    /// Returns true for the two passive bulk queue types.
    pub fn is_passive(self) -> bool {
        matches!(self, QueueType::PassiveBulkRecv | QueueType::PassiveBulkSend)
    }
}

/// One operation to perform on a buffer, carrying only the fields it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferOp {
    /// Send the first `length` bytes of the buffer to `dest`.
    MsgSend {
        /// Destination endpoint; must have a transfer machine identifier.
        dest: EndpointAddr,
        /// Number of bytes to send.
        length: usize,
    },
    /// Receive up to `max_messages` messages into the buffer.
    MsgRecv {
        /// The buffer retires once less than this much space remains.
        min_receive_size: usize,
        /// Maximum number of messages delivered into the buffer.
        max_messages: u32,
    },
    /// Expose the first `length` bytes for a remote active receive.
    PassiveBulkSend {
        /// Number of bytes exposed.
        length: usize,
    },
    /// Expose the whole buffer for a remote active send.
    PassiveBulkRecv,
    /// Write the first `length` bytes into the remote passive buffer named by `desc`.
    ActiveBulkSend {
        /// Descriptor of the remote passive receive buffer.
        desc: BufDesc,
        /// Number of bytes to write.
        length: usize,
    },
    /// Read the remote passive buffer named by `desc` into this buffer.
    ActiveBulkRecv {
        /// Descriptor of the remote passive send buffer.
        desc: BufDesc,
    },
}

impl BufferOp {
    /// The queue type this operation belongs to.
    pub fn qtype(&self) -> QueueType {
        match self {
            BufferOp::MsgSend { .. } => QueueType::MsgSend,
            BufferOp::MsgRecv { .. } => QueueType::MsgRecv,
            BufferOp::PassiveBulkSend { .. } => QueueType::PassiveBulkSend,
            BufferOp::PassiveBulkRecv => QueueType::PassiveBulkRecv,
            BufferOp::ActiveBulkSend { .. } => QueueType::ActiveBulkSend,
            BufferOp::ActiveBulkRecv { .. } => QueueType::ActiveBulkRecv,
        }
    }

    /// Maximum number of buffer events this operation can produce.
    pub fn max_completions(&self) -> usize {
        match self {
            BufferOp::MsgRecv { max_messages, .. } => *max_messages as usize,
            _ => 1,
        }
    }
}

/// Memory backing a registered buffer.
#[derive(Debug)]
pub struct MemoryRegion {
    bytes: Mutex<Vec<u8>>,
    length: usize,
}

impl MemoryRegion {
    /// Creates a zero-filled region of `length` bytes.
    pub fn new(length: usize) -> Arc<Self> {
        Self::from_vec(vec![0u8; length])
    }

    /// Wraps existing bytes in a region.
    pub fn from_vec(bytes: Vec<u8>) -> Arc<Self> {
        let length = bytes.len();
        Arc::new(Self {
            bytes: Mutex::new(bytes),
            length,
        })
    }

    /// Region size in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns true for a zero-length region.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Copies `len` bytes starting at `offset`, or `None` if out of bounds.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        let bytes = self.bytes.lock();
        bytes.get(offset..end).map(|s| s.to_vec())
    }

    /// Writes `data` at `offset`; returns false if it does not fit.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        let end = match offset.checked_add(data.len()) {
            Some(end) if end <= self.length => end,
            _ => return false,
        };
        let mut bytes = self.bytes.lock();
        bytes[offset..end].copy_from_slice(data);
        true
    }

    /// Copies the whole region.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

/// A registered buffer: an identifier plus the memory it covers.
#[derive(Debug, Clone)]
pub struct CoreBuffer {
    id: BufferId,
    region: Arc<MemoryRegion>,
}

impl CoreBuffer {
    pub(crate) fn new(id: BufferId, region: Arc<MemoryRegion>) -> Self {
        Self { id, region }
    }

    /// The buffer's identifying token.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// The memory region backing the buffer.
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    /// Buffer size in bytes.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// Returns true for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}

/// A buffer completion event, as stored in the buffer event queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferEvent {
    /// Buffer the event belongs to.
    pub buffer_id: BufferId,
    /// Nanoseconds since the UNIX epoch when the completion was translated.
    pub timestamp_ns: u64,
    /// Zero on success, otherwise a negative errno value.
    pub status: i32,
    /// Number of bytes transferred.
    pub length: u64,
    /// Offset of the data within the buffer (receive side).
    pub offset: u64,
    /// Sender of an unsolicited message; `None` for every other event.
    pub sender: Option<EndpointAddr>,
    /// True if this is the last event the buffer will produce.
    pub unlinked: bool,
}

impl BufferEvent {
    /// Returns true if the operation completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Returns true if the operation was cancelled.
    pub fn is_canceled(&self) -> bool {
        self.status == STATUS_CANCELED
    }
}

/// Reply values saved when an active receive's reply beats its send completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyScratch {
    /// Set once a non-terminal reply has been seen.
    pub reply_seen: bool,
    /// Saved reply status.
    pub status: i32,
    /// Saved reply length.
    pub length: u64,
    /// Saved reply offset.
    pub offset: u64,
}

/// Core-side record of a buffer with an operation in flight.
#[derive(Debug, Clone)]
pub struct InflightOp {
    /// Queue type of the operation.
    pub qtype: QueueType,
    /// Event queue slots provisioned for the operation.
    pub provisioned: usize,
    /// Fabric handle, used to cancel the operation.
    pub handle: Option<OpHandle>,
    /// Out-of-order reply state, used only by active receives.
    pub scratch: ReplyScratch,
    /// When the operation was queued.
    pub queued_at: Instant,
}

impl InflightOp {
    /// Creates the record for a freshly provisioned operation.
    pub fn new(qtype: QueueType, provisioned: usize) -> Self {
        Self {
            qtype,
            provisioned,
            handle: None,
            scratch: ReplyScratch::default(),
            queued_at: Instant::now(),
        }
    }
}

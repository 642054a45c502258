//! Wire descriptors exchanged out of band between the passive and active sides of a bulk transfer.
//!
//! Every descriptor is a fixed-size frame:
//!
//! ```text
//! magic:4 | version:1 | kind:1 | payload_length:2 | payload | crc32(payload):4
//! ```
//!
//! The payload is a bincode encoding of integer-only structs, so each frame
//! kind has a constant length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::addr::{EndpointAddr, NetworkKind, Nid};
use crate::buffer::QueueType;
use crate::error::{FabricError, FabricResult};
use crate::match_bits::{self, COUNTER_UNSOLICITED, TMID_MAX};

/// Magic number opening every descriptor frame.
pub const DESC_MAGIC: u32 = 0xCF5F_0BD1;

/// Descriptor format version.
pub const DESC_VERSION: u8 = 1;

/// Frame bytes outside the payload (magic + version + kind + length + checksum).
pub const DESC_OVERHEAD: usize = 4 + 1 + 1 + 2 + 4;

const KIND_ADDRESS: u8 = 1;
const KIND_BUF_DESC: u8 = 2;
const NO_TMID: u32 = u32::MAX;

/// Encoded length of an endpoint address frame.
pub const ADDRESS_WIRE_LEN: usize = DESC_OVERHEAD + 21;

/// Encoded length of a buffer descriptor frame.
pub const BUF_DESC_WIRE_LEN: usize = DESC_OVERHEAD + 38;

#[derive(Debug, Serialize, Deserialize)]
struct WireAddr {
    kind: u8,
    net_num: u32,
    addr: u32,
    pid: u32,
    portal: u32,
    tmid: u32,
}

impl From<&EndpointAddr> for WireAddr {
    fn from(addr: &EndpointAddr) -> Self {
        Self {
            kind: addr.nid.kind as u8,
            net_num: addr.nid.net_num,
            addr: addr.nid.addr,
            pid: addr.pid,
            portal: addr.portal,
            tmid: addr.tmid.unwrap_or(NO_TMID),
        }
    }
}

impl WireAddr {
    fn into_addr(self) -> FabricResult<EndpointAddr> {
        let kind = NetworkKind::from_code(self.kind).ok_or_else(|| invalid(format!(
            "unknown network kind {}",
            self.kind
        )))?;
        let tmid = match self.tmid {
            NO_TMID => None,
            t if t <= TMID_MAX => Some(t),
            t => return Err(invalid(format!("transfer machine id {} out of range", t))),
        };
        Ok(EndpointAddr {
            nid: Nid {
                kind,
                net_num: self.net_num,
                addr: self.addr,
            },
            pid: self.pid,
            portal: self.portal,
            tmid,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBufDesc {
    match_bits: u64,
    passive_addr: WireAddr,
    qtype: u8,
    size: u64,
}

fn invalid(reason: String) -> FabricError {
    FabricError::InvalidDescriptor { reason }
}

fn encode_frame<T: Serialize>(kind: u8, payload: &T) -> FabricResult<Bytes> {
    let payload = bincode::serialize(payload).map_err(|e| invalid(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(DESC_OVERHEAD + payload.len());
    buf.put_u32(DESC_MAGIC);
    buf.put_u8(DESC_VERSION);
    buf.put_u8(kind);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(&payload);
    buf.put_u32(crc32fast::hash(&payload));
    Ok(buf.freeze())
}

fn decode_frame(kind: u8, expected_len: usize, mut data: &[u8]) -> FabricResult<&[u8]> {
    if data.len() != expected_len {
        return Err(invalid(format!(
            "expected {} bytes, got {}",
            expected_len,
            data.len()
        )));
    }
    let magic = data.get_u32();
    if magic != DESC_MAGIC {
        return Err(invalid(format!("bad magic {:#010x}", magic)));
    }
    let version = data.get_u8();
    if version != DESC_VERSION {
        return Err(invalid(format!("unsupported version {}", version)));
    }
    let found_kind = data.get_u8();
    if found_kind != kind {
        return Err(invalid(format!(
            "frame kind {} where {} was expected",
            found_kind, kind
        )));
    }
    let payload_len = data.get_u16() as usize;
    if payload_len + 4 != data.len() {
        return Err(invalid(format!("payload length {} mismatch", payload_len)));
    }
    let (payload, mut trailer) = data.split_at(payload_len);
    let checksum = trailer.get_u32();
    if crc32fast::hash(payload) != checksum {
        return Err(invalid("checksum mismatch".to_string()));
    }
    Ok(payload)
}

/// Encodes an endpoint address into its fixed-size wire form.
pub fn encode_address(addr: &EndpointAddr) -> FabricResult<Bytes> {
    encode_frame(KIND_ADDRESS, &WireAddr::from(addr))
}

/// Decodes an endpoint address produced by [`encode_address`].
pub fn decode_address(data: &[u8]) -> FabricResult<EndpointAddr> {
    let payload = decode_frame(KIND_ADDRESS, ADDRESS_WIRE_LEN, data)?;
    let wire: WireAddr = bincode::deserialize(payload).map_err(|e| invalid(e.to_string()))?;
    wire.into_addr()
}

/// Identity of a passive bulk buffer, handed to the peer that will perform the active transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufDesc {
    /// Match bits assigned to the passive buffer.
    pub match_bits: u64,
    /// Address of the endpoint holding the passive buffer.
    pub passive_addr: EndpointAddr,
    /// Queue type of the passive buffer.
    pub qtype: QueueType,
    /// Bytes exposed by the passive buffer.
    pub size: u64,
}

impl BufDesc {
    /// Encodes the descriptor into its fixed-size wire form.
    pub fn encode(&self) -> FabricResult<Bytes> {
        encode_frame(
            KIND_BUF_DESC,
            &WireBufDesc {
                match_bits: self.match_bits,
                passive_addr: WireAddr::from(&self.passive_addr),
                qtype: self.qtype as u8,
                size: self.size,
            },
        )
    }

    /// Decodes and validates a descriptor produced by [`encode`](Self::encode).
    pub fn decode(data: &[u8]) -> FabricResult<Self> {
        let payload = decode_frame(KIND_BUF_DESC, BUF_DESC_WIRE_LEN, data)?;
        let wire: WireBufDesc =
            bincode::deserialize(payload).map_err(|e| invalid(e.to_string()))?;
        let qtype = QueueType::from_code(wire.qtype)
            .ok_or_else(|| invalid(format!("unknown queue type {}", wire.qtype)))?;
        let desc = Self {
            match_bits: wire.match_bits,
            passive_addr: wire.passive_addr.into_addr()?,
            qtype,
            size: wire.size,
        };
        desc.validate()?;
        Ok(desc)
    }

    /// Checks the descriptor's internal consistency.
    pub fn validate(&self) -> FabricResult<()> {
        let Some(tmid) = self.passive_addr.tmid else {
            return Err(invalid("passive address has no transfer machine id".to_string()));
        };
        let (bits_tmid, counter) = match_bits::decode(self.match_bits);
        if counter == COUNTER_UNSOLICITED {
            return Err(invalid("match bits carry the unsolicited counter".to_string()));
        }
        if bits_tmid != tmid {
            return Err(invalid(format!(
                "match bits name transfer machine {} but passive address names {}",
                bits_tmid, tmid
            )));
        }
        if !self.qtype.is_passive() {
            return Err(invalid(format!("{:?} is not a passive queue type", self.qtype)));
        }
        Ok(())
    }

    /// Checks that an active operation of `qtype` over `length` bytes may use this descriptor.
    ///
    /// An active receive needs room for the whole passive buffer; an active
    /// send may not exceed it.
    pub fn check_active(&self, qtype: QueueType, length: usize) -> FabricResult<()> {
        self.validate()?;
        let length = length as u64;
        match (qtype, self.qtype) {
            (QueueType::ActiveBulkRecv, QueueType::PassiveBulkSend) => {
                if length < self.size {
                    return Err(invalid(format!(
                        "active receive buffer of {} bytes cannot hold {} passive bytes",
                        length, self.size
                    )));
                }
            }
            (QueueType::ActiveBulkSend, QueueType::PassiveBulkRecv) => {
                if length > self.size {
                    return Err(invalid(format!(
                        "active send of {} bytes exceeds passive buffer of {} bytes",
                        length, self.size
                    )));
                }
            }
            (active, passive) => {
                return Err(invalid(format!(
                    "{:?} cannot pair with a {:?} descriptor",
                    active, passive
                )));
            }
        }
        Ok(())
    }
}

//! In-process fabric simulation for testing without network hardware.
//!
//! [`SimFabric`] routes puts and gets between attached endpoints by match
//! bits, the way a portals-style fabric does: unsolicited messages (counter
//! zero) land in the target endpoint's receive buffers in attach order, and
//! bulk transfers land in the passive buffer registered under the exact
//! match bits. Completions are queued in the order they are generated and
//! handed to sinks outside the state lock, either before the initiating call
//! returns or from [`SimFabric::deliver_pending`] when deferred delivery is
//! configured. Sinks must not call back into the fabric.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::addr::EndpointAddr;
use crate::buffer::{BufferId, MemoryRegion, STATUS_CANCELED, STATUS_NO_MATCH, STATUS_TOO_LARGE};
use crate::error::{FabricError, FabricResult};
use crate::fabric::{
    CompletionKind, CompletionSink, Fabric, FabricOp, FabricOpKind, OpHandle, PeerId,
    RawCompletion,
};
use crate::match_bits;

/// Behaviour switches for the simulated fabric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimFabricConfig {
    /// Queue completions until [`SimFabric::deliver_pending`] instead of delivering inline.
    pub defer_completions: bool,
    /// Report an active get's reply before its send completion.
    pub reply_before_send: bool,
}

/// Counters describing simulated traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimStats {
    /// Operations that reached a terminal completion.
    pub operations_completed: u64,
    /// Operations that found no matching target buffer.
    pub operations_unmatched: u64,
    /// Payload bytes moved by puts.
    pub bytes_put: u64,
    /// Payload bytes moved by gets.
    pub bytes_get: u64,
    /// Operations cancelled through unlink.
    pub unlinks: u64,
}

struct RecvEntry {
    handle: OpHandle,
    buffer_id: BufferId,
    region: Arc<MemoryRegion>,
    remaining: u32,
    min_receive_size: usize,
    offset: usize,
}

struct PassiveEntry {
    handle: OpHandle,
    buffer_id: BufferId,
    region: Arc<MemoryRegion>,
    accept_put: bool,
    length: usize,
}

struct SimEndpoint {
    sink: Arc<dyn CompletionSink>,
    recv: VecDeque<RecvEntry>,
    passive: HashMap<u64, PassiveEntry>,
}

enum Attached {
    Recv(EndpointAddr),
    Passive(EndpointAddr, u64),
}

type Delivery = (Arc<dyn CompletionSink>, RawCompletion);

#[derive(Default)]
struct SimState {
    endpoints: HashMap<EndpointAddr, SimEndpoint>,
    attached: HashMap<OpHandle, Attached>,
    pending: VecDeque<Delivery>,
    injected_status: Option<i32>,
    stats: SimStats,
}

/// An in-process [`Fabric`] implementation.
pub struct SimFabric {
    config: SimFabricConfig,
    next_handle: AtomicU64,
    state: Mutex<SimState>,
    delivering: Mutex<()>,
}

impl SimFabric {
    /// Creates a simulated fabric.
    pub fn new(config: SimFabricConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(SimState::default()),
            delivering: Mutex::new(()),
        })
    }

    /// Makes the next active operation fail with `status` instead of moving data.
    pub fn inject_status(&self, status: i32) {
        self.state.lock().injected_status = Some(status);
    }

    /// Delivers every queued completion in order; returns how many were delivered.
    pub fn deliver_pending(&self) -> usize {
        self.flush()
    }

    /// Number of completions waiting for [`deliver_pending`](Self::deliver_pending).
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }

    /// The configuration this fabric was created with.
    pub fn config(&self) -> &SimFabricConfig {
        &self.config
    }

    fn allocate_handle(&self) -> OpHandle {
        OpHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn dispatch(&self) {
        if !self.config.defer_completions {
            self.flush();
        }
    }

    fn flush(&self) -> usize {
        // Serializes sink callbacks in queue order.
        let _order = self.delivering.lock();
        let mut delivered = 0;
        loop {
            let batch: Vec<Delivery> = self.state.lock().pending.drain(..).collect();
            if batch.is_empty() {
                return delivered;
            }
            delivered += batch.len();
            for (sink, completion) in batch {
                sink.on_completion(completion);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn put(
        state: &mut SimState,
        local: &EndpointAddr,
        op: &FabricOp,
        target: &EndpointAddr,
        bits: u64,
        length: usize,
        hdr_data: u64,
        out: &mut Vec<Delivery>,
    ) -> FabricResult<()> {
        let local_sink = Self::sink_of(state, local)?;
        let mut send = RawCompletion {
            length: length as u64,
            unlinked: true,
            ..RawCompletion::new(CompletionKind::Send, op.buffer_id)
        };

        if let Some(status) = state.injected_status.take() {
            send.status = status;
            state.stats.operations_completed += 1;
            out.push((local_sink, send));
            return Ok(());
        }

        let data = op.region.read_at(0, length).ok_or_else(|| FabricError::InvalidBuffer {
            reason: format!("put of {} bytes exceeds buffer of {}", length, op.region.len()),
        })?;
        let peer = PeerId {
            nid: local.nid,
            pid: local.pid,
        };

        let delivered = match state.endpoints.get_mut(target) {
            None => Err(STATUS_NO_MATCH),
            Some(ep) if match_bits::is_unsolicited(bits) => {
                Self::land_message(ep, &mut state.attached, &data, hdr_data, peer, out)
            }
            Some(ep) => match ep.passive.remove(&bits) {
                Some(entry) if entry.accept_put && data.len() <= entry.length => {
                    entry.region.write_at(0, &data);
                    state.attached.remove(&entry.handle);
                    let completion = RawCompletion {
                        length: data.len() as u64,
                        unlinked: true,
                        routing_tag: hdr_data,
                        peer: Some(peer),
                        ..RawCompletion::new(CompletionKind::Put, entry.buffer_id)
                    };
                    out.push((Arc::clone(&ep.sink), completion));
                    Ok(())
                }
                Some(entry) => {
                    let status = if entry.accept_put {
                        STATUS_TOO_LARGE
                    } else {
                        STATUS_NO_MATCH
                    };
                    ep.passive.insert(bits, entry);
                    Err(status)
                }
                None => Err(STATUS_NO_MATCH),
            },
        };

        match delivered {
            Ok(()) => state.stats.bytes_put += data.len() as u64,
            Err(status) => {
                debug!(remote = %target, match_bits = bits, status, "put found no target buffer");
                state.stats.operations_unmatched += 1;
                send.status = status;
            }
        }
        state.stats.operations_completed += 1;
        out.push((local_sink, send));
        Ok(())
    }

    fn land_message(
        ep: &mut SimEndpoint,
        attached: &mut HashMap<OpHandle, Attached>,
        data: &[u8],
        hdr_data: u64,
        peer: PeerId,
        out: &mut Vec<Delivery>,
    ) -> Result<(), i32> {
        let Some(entry) = ep.recv.front_mut() else {
            return Err(STATUS_NO_MATCH);
        };
        if !entry.region.write_at(entry.offset, data) {
            return Err(STATUS_TOO_LARGE);
        }
        let offset = entry.offset;
        entry.offset += data.len();
        entry.remaining = entry.remaining.saturating_sub(1);
        let space_left = entry.region.len() - entry.offset;
        let retire = entry.remaining == 0 || space_left < entry.min_receive_size;
        let completion = RawCompletion {
            length: data.len() as u64,
            offset: offset as u64,
            unlinked: retire,
            routing_tag: hdr_data,
            peer: Some(peer),
            ..RawCompletion::new(CompletionKind::Put, entry.buffer_id)
        };
        if retire {
            let handle = entry.handle;
            ep.recv.pop_front();
            attached.remove(&handle);
        }
        out.push((Arc::clone(&ep.sink), completion));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn get(
        &self,
        state: &mut SimState,
        local: &EndpointAddr,
        op: &FabricOp,
        target: &EndpointAddr,
        bits: u64,
        length: usize,
        out: &mut Vec<Delivery>,
    ) -> FabricResult<()> {
        let local_sink = Self::sink_of(state, local)?;
        let mut reply = RawCompletion::new(CompletionKind::Reply, op.buffer_id);

        if let Some(status) = state.injected_status.take() {
            reply.status = status;
        } else {
            let outcome = match state.endpoints.get_mut(target) {
                None => Err(STATUS_NO_MATCH),
                Some(ep) => match ep.passive.remove(&bits) {
                    Some(entry) if !entry.accept_put && entry.length <= length => {
                        let data = entry.region.read_at(0, entry.length).unwrap_or_default();
                        op.region.write_at(0, &data);
                        let served = RawCompletion {
                            length: data.len() as u64,
                            unlinked: true,
                            peer: Some(PeerId {
                                nid: local.nid,
                                pid: local.pid,
                            }),
                            ..RawCompletion::new(CompletionKind::Get, entry.buffer_id)
                        };
                        out.push((Arc::clone(&ep.sink), served));
                        Ok((entry.handle, data.len()))
                    }
                    Some(entry) => {
                        let status = if entry.accept_put {
                            STATUS_NO_MATCH
                        } else {
                            STATUS_TOO_LARGE
                        };
                        ep.passive.insert(bits, entry);
                        Err(status)
                    }
                    None => Err(STATUS_NO_MATCH),
                },
            };
            match outcome {
                Ok((handle, moved)) => {
                    state.attached.remove(&handle);
                    reply.length = moved as u64;
                    state.stats.bytes_get += moved as u64;
                }
                Err(status) => {
                    debug!(remote = %target, match_bits = bits, status, "get found no target buffer");
                    state.stats.operations_unmatched += 1;
                    reply.status = status;
                }
            }
        }

        let send = RawCompletion::new(CompletionKind::Send, op.buffer_id);
        if self.config.reply_before_send {
            out.push((Arc::clone(&local_sink), reply));
            out.push((local_sink, RawCompletion { unlinked: true, ..send }));
        } else {
            out.push((Arc::clone(&local_sink), send));
            out.push((local_sink, RawCompletion { unlinked: true, ..reply }));
        }
        state.stats.operations_completed += 1;
        Ok(())
    }

    fn sink_of(state: &SimState, addr: &EndpointAddr) -> FabricResult<Arc<dyn CompletionSink>> {
        state
            .endpoints
            .get(addr)
            .map(|ep| Arc::clone(&ep.sink))
            .ok_or_else(|| FabricError::Fabric {
                reason: format!("endpoint {} is not attached", addr),
            })
    }
}

impl Fabric for SimFabric {
    fn attach(&self, addr: &EndpointAddr, sink: Arc<dyn CompletionSink>) -> FabricResult<()> {
        let mut state = self.state.lock();
        if addr.tmid.is_none() {
            return Err(FabricError::InvalidAddress {
                addr: addr.to_string(),
                reason: "transfer machine id must be assigned before attach".to_string(),
            });
        }
        if state.endpoints.contains_key(addr) {
            return Err(FabricError::AddressInUse {
                addr: addr.to_string(),
            });
        }
        state.endpoints.insert(
            *addr,
            SimEndpoint {
                sink,
                recv: VecDeque::new(),
                passive: HashMap::new(),
            },
        );
        debug!(addr = %addr, "endpoint attached to simulated fabric");
        Ok(())
    }

    fn detach(&self, addr: &EndpointAddr) {
        let mut state = self.state.lock();
        if state.endpoints.remove(addr).is_some() {
            state.attached.retain(|_, a| match a {
                Attached::Recv(owner) | Attached::Passive(owner, _) => *owner != *addr,
            });
            debug!(addr = %addr, "endpoint detached from simulated fabric");
        }
    }

    fn submit(&self, local: &EndpointAddr, op: FabricOp) -> FabricResult<OpHandle> {
        let handle = self.allocate_handle();
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            match &op.kind {
                FabricOpKind::AttachRecv {
                    threshold,
                    min_receive_size,
                } => {
                    let ep = state.endpoints.get_mut(local).ok_or_else(|| FabricError::Fabric {
                        reason: format!("endpoint {} is not attached", local),
                    })?;
                    ep.recv.push_back(RecvEntry {
                        handle,
                        buffer_id: op.buffer_id,
                        region: Arc::clone(&op.region),
                        remaining: *threshold,
                        min_receive_size: *min_receive_size,
                        offset: 0,
                    });
                    state.attached.insert(handle, Attached::Recv(*local));
                }
                FabricOpKind::AttachPassive {
                    match_bits,
                    accept_put,
                    length,
                } => {
                    let ep = state.endpoints.get_mut(local).ok_or_else(|| FabricError::Fabric {
                        reason: format!("endpoint {} is not attached", local),
                    })?;
                    if ep.passive.contains_key(match_bits) {
                        return Err(FabricError::Fabric {
                            reason: format!("match bits {:#x} already attached", match_bits),
                        });
                    }
                    ep.passive.insert(
                        *match_bits,
                        PassiveEntry {
                            handle,
                            buffer_id: op.buffer_id,
                            region: Arc::clone(&op.region),
                            accept_put: *accept_put,
                            length: *length,
                        },
                    );
                    state
                        .attached
                        .insert(handle, Attached::Passive(*local, *match_bits));
                }
                FabricOpKind::Put {
                    target,
                    match_bits,
                    length,
                    hdr_data,
                } => Self::put(state, local, &op, target, *match_bits, *length, *hdr_data, &mut out)?,
                FabricOpKind::Get {
                    target,
                    match_bits,
                    length,
                } => self.get(state, local, &op, target, *match_bits, *length, &mut out)?,
            }
            state.pending.extend(out);
        }
        self.dispatch();
        Ok(handle)
    }

    fn unlink(&self, handle: OpHandle) -> bool {
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let Some(attached) = state.attached.remove(&handle) else {
                return false;
            };
            let (owner, buffer_id) = match attached {
                Attached::Recv(owner) => {
                    let Some(ep) = state.endpoints.get_mut(&owner) else {
                        return false;
                    };
                    let Some(pos) = ep.recv.iter().position(|e| e.handle == handle) else {
                        return false;
                    };
                    let entry = ep.recv.remove(pos);
                    (owner, entry.map(|e| e.buffer_id))
                }
                Attached::Passive(owner, bits) => {
                    let Some(ep) = state.endpoints.get_mut(&owner) else {
                        return false;
                    };
                    (owner, ep.passive.remove(&bits).map(|e| e.buffer_id))
                }
            };
            let (Some(buffer_id), Some(ep)) = (buffer_id, state.endpoints.get(&owner)) else {
                warn!(handle = handle.0, "unlink found a stale attachment");
                return false;
            };
            let completion = RawCompletion {
                status: STATUS_CANCELED,
                unlinked: true,
                ..RawCompletion::new(CompletionKind::Unlink, buffer_id)
            };
            let sink = Arc::clone(&ep.sink);
            state.pending.push_back((sink, completion));
            state.stats.unlinks += 1;
        }
        self.dispatch();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Nid;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<RawCompletion>>,
    }

    impl CompletionSink for Recorder {
        fn on_completion(&self, completion: RawCompletion) {
            self.seen.lock().push(completion);
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<CompletionKind> {
            self.seen.lock().iter().map(|c| c.kind).collect()
        }
    }

    fn addr(tmid: u32) -> EndpointAddr {
        EndpointAddr::new(Nid::LOOPBACK, 12345, 30, tmid)
    }

    fn setup(config: SimFabricConfig) -> (Arc<SimFabric>, Arc<Recorder>, Arc<Recorder>) {
        let fabric = SimFabric::new(config);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        fabric.attach(&addr(1), a.clone()).unwrap();
        fabric.attach(&addr(2), b.clone()).unwrap();
        (fabric, a, b)
    }

    fn op(id: u64, region: Arc<MemoryRegion>, kind: FabricOpKind) -> FabricOp {
        FabricOp {
            buffer_id: BufferId(id),
            region,
            kind,
        }
    }

    #[test]
    fn test_attach_rejects_duplicate_and_dynamic() {
        let (fabric, a, _) = setup(SimFabricConfig::default());
        assert!(matches!(
            fabric.attach(&addr(1), a.clone()),
            Err(FabricError::AddressInUse { .. })
        ));
        assert!(fabric.attach(&addr(3).without_tmid(), a).is_err());
    }

    #[test]
    fn test_message_lands_in_receive_buffer() {
        let (fabric, a, b) = setup(SimFabricConfig::default());
        let recv = MemoryRegion::new(64);
        fabric
            .submit(
                &addr(2),
                op(10, recv.clone(), FabricOpKind::AttachRecv {
                    threshold: 2,
                    min_receive_size: 8,
                }),
            )
            .unwrap();

        let msg = MemoryRegion::from_vec(b"hello".to_vec());
        let put = FabricOpKind::Put {
            target: addr(2),
            match_bits: match_bits::encode(2, 0),
            length: 5,
            hdr_data: 77,
        };
        fabric.submit(&addr(1), op(20, msg.clone(), put.clone())).unwrap();
        fabric.submit(&addr(1), op(21, msg, put)).unwrap();

        let sent = a.seen.lock().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|c| c.kind == CompletionKind::Send && c.unlinked));

        let got = b.seen.lock().clone();
        assert_eq!(got.len(), 2);
        assert_eq!((got[0].offset, got[0].unlinked), (0, false));
        assert_eq!((got[1].offset, got[1].unlinked), (5, true));
        assert_eq!(got[0].routing_tag, 77);
        assert_eq!(recv.read_at(0, 10).unwrap(), b"hellohello".to_vec());
    }

    #[test]
    fn test_receive_retires_below_min_size() {
        let (fabric, _, b) = setup(SimFabricConfig::default());
        let recv = MemoryRegion::new(16);
        fabric
            .submit(
                &addr(2),
                op(10, recv, FabricOpKind::AttachRecv {
                    threshold: 10,
                    min_receive_size: 8,
                }),
            )
            .unwrap();
        let msg = MemoryRegion::new(9);
        fabric
            .submit(
                &addr(1),
                op(20, msg, FabricOpKind::Put {
                    target: addr(2),
                    match_bits: match_bits::encode(2, 0),
                    length: 9,
                    hdr_data: 0,
                }),
            )
            .unwrap();
        assert!(b.seen.lock()[0].unlinked);
    }

    #[test]
    fn test_unmatched_put_reports_status() {
        let (fabric, a, _) = setup(SimFabricConfig::default());
        fabric
            .submit(
                &addr(1),
                op(20, MemoryRegion::new(4), FabricOpKind::Put {
                    target: addr(2),
                    match_bits: match_bits::encode(2, 0),
                    length: 4,
                    hdr_data: 0,
                }),
            )
            .unwrap();
        assert_eq!(a.seen.lock()[0].status, STATUS_NO_MATCH);
        assert_eq!(fabric.stats().operations_unmatched, 1);
    }

    #[test]
    fn test_get_from_passive_buffer() {
        let (fabric, a, b) = setup(SimFabricConfig::default());
        let bits = match_bits::encode(2, 5);
        let exposed = MemoryRegion::from_vec(vec![9u8; 32]);
        fabric
            .submit(
                &addr(2),
                op(10, exposed, FabricOpKind::AttachPassive {
                    match_bits: bits,
                    accept_put: false,
                    length: 32,
                }),
            )
            .unwrap();
        let dest = MemoryRegion::new(32);
        fabric
            .submit(
                &addr(1),
                op(20, dest.clone(), FabricOpKind::Get {
                    target: addr(2),
                    match_bits: bits,
                    length: 32,
                }),
            )
            .unwrap();

        assert_eq!(a.kinds(), vec![CompletionKind::Send, CompletionKind::Reply]);
        let reply = a.seen.lock()[1];
        assert!(reply.unlinked);
        assert_eq!(reply.length, 32);
        assert_eq!(b.kinds(), vec![CompletionKind::Get]);
        assert_eq!(dest.to_vec(), vec![9u8; 32]);
    }

    #[test]
    fn test_reply_before_send_ordering() {
        let (fabric, a, _) = setup(SimFabricConfig {
            reply_before_send: true,
            ..Default::default()
        });
        let bits = match_bits::encode(2, 6);
        fabric
            .submit(
                &addr(2),
                op(10, MemoryRegion::new(8), FabricOpKind::AttachPassive {
                    match_bits: bits,
                    accept_put: false,
                    length: 8,
                }),
            )
            .unwrap();
        fabric
            .submit(
                &addr(1),
                op(20, MemoryRegion::new(8), FabricOpKind::Get {
                    target: addr(2),
                    match_bits: bits,
                    length: 8,
                }),
            )
            .unwrap();
        let seen = a.seen.lock().clone();
        assert_eq!(seen[0].kind, CompletionKind::Reply);
        assert!(!seen[0].unlinked);
        assert_eq!(seen[1].kind, CompletionKind::Send);
        assert!(seen[1].unlinked);
    }

    #[test]
    fn test_unlink_attached_buffer() {
        let (fabric, _, b) = setup(SimFabricConfig::default());
        let handle = fabric
            .submit(
                &addr(2),
                op(10, MemoryRegion::new(8), FabricOpKind::AttachRecv {
                    threshold: 1,
                    min_receive_size: 1,
                }),
            )
            .unwrap();
        assert!(fabric.unlink(handle));
        assert!(!fabric.unlink(handle));
        let seen = b.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, CompletionKind::Unlink);
        assert!(seen[0].unlinked);
    }

    #[test]
    fn test_deferred_delivery() {
        let (fabric, a, _) = setup(SimFabricConfig {
            defer_completions: true,
            ..Default::default()
        });
        fabric.inject_status(-5);
        fabric
            .submit(
                &addr(1),
                op(20, MemoryRegion::new(4), FabricOpKind::Put {
                    target: addr(2),
                    match_bits: match_bits::encode(2, 0),
                    length: 4,
                    hdr_data: 0,
                }),
            )
            .unwrap();
        assert!(a.seen.lock().is_empty());
        assert_eq!(fabric.pending_count(), 1);
        assert_eq!(fabric.deliver_pending(), 1);
        assert_eq!(a.seen.lock()[0].status, -5);
    }

    #[test]
    fn test_submit_from_detached_endpoint_fails() {
        let (fabric, _, _) = setup(SimFabricConfig::default());
        fabric.detach(&addr(1));
        let result = fabric.submit(
            &addr(1),
            op(1, MemoryRegion::new(4), FabricOpKind::AttachRecv {
                threshold: 1,
                min_receive_size: 1,
            }),
        );
        assert!(matches!(result, Err(FabricError::Fabric { .. })));
    }
}

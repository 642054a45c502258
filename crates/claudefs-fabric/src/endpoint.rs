//! Core transfer endpoints.
//!
//! A [`CoreEndpoint`] owns one buffer event queue, the provisioning count that
//! keeps the queue large enough for every outstanding operation, and the
//! match bit counter used for passive buffers. The queue's producer half lives
//! in the endpoint's [`CompletionTranslator`]; the consumer half, together with
//! the provisioning count, sits behind the endpoint's consumer lock so that
//! growth and consumption never interleave.
//!
//! An endpoint attached to a [`BufferPool`] keeps its message receive queue
//! at a minimum length with pool buffers, topping it up whenever a receive
//! buffer retires.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::addr::EndpointAddr;
use crate::bev_queue::{BevConsumer, BevQueue};
use crate::buffer::{BufferEvent, BufferId, BufferOp, CoreBuffer, InflightOp, QueueType};
use crate::config::FabricConfig;
use crate::descriptor::BufDesc;
use crate::error::{FabricError, FabricResult};
use crate::fabric::{sender_tag, Fabric, FabricOp, FabricOpKind};
use crate::match_bits::{self, COUNTER_MIN, COUNTER_UNSOLICITED, TMID_MAX};
use crate::metrics::FabricMetrics;
use crate::pool::{BufferPool, RECV_QUEUE_DEFAULT_LEN};
use crate::semaphore::Semaphore;
use crate::translator::CompletionTranslator;

/// Started endpoints of a domain, keyed by address.
pub(crate) type EndpointRegistry = DashMap<EndpointAddr, Weak<CoreEndpoint>>;

struct ConsumerSide {
    queue: Option<BevConsumer<BufferEvent>>,
    needed: usize,
}

struct RecvProvisioning {
    pool: Arc<BufferPool>,
    min_length: usize,
    min_receive_size: usize,
    max_messages: u32,
}

/// A local fabric endpoint and its completion pipeline.
pub struct CoreEndpoint {
    addr: EndpointAddr,
    tmid: u32,
    config: FabricConfig,
    fabric: Arc<dyn Fabric>,
    registry: Arc<EndpointRegistry>,
    consumer: Mutex<ConsumerSide>,
    translator: Arc<CompletionTranslator>,
    inflight: Arc<DashMap<BufferId, InflightOp>>,
    sem: Arc<Semaphore>,
    metrics: Arc<FabricMetrics>,
    match_counter: Mutex<u64>,
    stopped: AtomicBool,
    recv_pool: Mutex<Option<RecvProvisioning>>,
    recv_deficit: AtomicUsize,
    pool_buffers: DashMap<BufferId, (CoreBuffer, Arc<BufferPool>)>,
}

impl std::fmt::Debug for CoreEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreEndpoint")
            .field("addr", &self.addr)
            .field("outstanding", &self.outstanding())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl CoreEndpoint {
    /// Creates the endpoint's queue and attaches it to the fabric. `addr` must carry a tmid.
    pub(crate) fn start(
        addr: EndpointAddr,
        config: FabricConfig,
        fabric: Arc<dyn Fabric>,
        registry: Arc<EndpointRegistry>,
    ) -> FabricResult<Arc<Self>> {
        let tmid = addr.tmid.ok_or_else(|| FabricError::InvalidAddress {
            addr: addr.to_string(),
            reason: "endpoint needs an assigned transfer machine id".to_string(),
        })?;
        if tmid > TMID_MAX {
            return Err(FabricError::InvalidAddress {
                addr: addr.to_string(),
                reason: format!("transfer machine id {} exceeds {}", tmid, TMID_MAX),
            });
        }
        let (producer, consumer) = BevQueue::new::<BufferEvent>(config.initial_queue_capacity)?;

        let inflight = Arc::new(DashMap::new());
        let sem = Arc::new(Semaphore::new(0));
        let metrics = Arc::new(FabricMetrics::new());
        let translator = Arc::new(CompletionTranslator::new(
            addr,
            producer,
            Arc::clone(&inflight),
            Arc::clone(&sem),
            Arc::clone(&metrics),
        ));
        fabric.attach(&addr, translator.clone())?;

        info!(
            endpoint = %addr,
            capacity = config.initial_queue_capacity,
            "endpoint started"
        );
        Ok(Arc::new(Self {
            addr,
            tmid,
            config,
            fabric,
            registry,
            consumer: Mutex::new(ConsumerSide {
                queue: Some(consumer),
                needed: 0,
            }),
            translator,
            inflight,
            sem,
            metrics,
            match_counter: Mutex::new(COUNTER_MIN),
            stopped: AtomicBool::new(false),
            recv_pool: Mutex::new(None),
            recv_deficit: AtomicUsize::new(0),
            pool_buffers: DashMap::new(),
        }))
    }

    /// The endpoint's address.
    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    /// Pipeline metrics for this endpoint.
    pub fn metrics(&self) -> &FabricMetrics {
        &self.metrics
    }

    /// Number of buffers with an operation in flight.
    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    /// Returns true if the given buffer has an operation in flight.
    pub fn is_queued(&self, buffer: &CoreBuffer) -> bool {
        self.inflight.contains_key(&buffer.id())
    }

    /// Event slots currently reserved for outstanding operations.
    pub fn needed(&self) -> usize {
        self.consumer.lock().needed
    }

    /// Current event queue capacity, including the consumer-owned slot.
    pub fn queue_size(&self) -> usize {
        self.consumer.lock().queue.as_ref().map_or(0, |q| q.size())
    }

    /// Returns true if no event is waiting to be consumed.
    pub fn is_queue_empty(&self) -> bool {
        self.consumer.lock().queue.as_ref().map_or(true, |q| q.is_empty())
    }

    /// Returns true after [`stop`](Self::stop) or a protocol violation.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.translator.is_failed()
    }

    fn check_running(&self) -> FabricResult<()> {
        if self.translator.is_failed() {
            return Err(FabricError::ProtocolViolation {
                reason: format!("endpoint {} lost a completion event", self.addr),
            });
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(FabricError::EndpointStopped);
        }
        Ok(())
    }

    /// Grows the event queue so that `additional` more completions are covered.
    ///
    /// On failure the provisioning count is unchanged; slots appended before
    /// the failure stay in the queue.
    pub fn provision(&self, additional: usize) -> FabricResult<()> {
        let mut side = self.consumer.lock();
        self.grow(&mut side, additional)
    }

    fn grow(&self, side: &mut ConsumerSide, additional: usize) -> FabricResult<()> {
        let needed = side.needed;
        let queue = side.queue.as_mut().ok_or(FabricError::EndpointStopped)?;

        let target = needed + additional + 1;
        let mut appended = 0u64;
        let mut result = Ok(());
        while queue.size() < target {
            if queue.size() >= self.config.max_queue_capacity {
                result = Err(FabricError::OutOfMemory {
                    requested: target,
                    limit: self.config.max_queue_capacity,
                });
                break;
            }
            if let Err(e) = queue.append() {
                result = Err(e);
                break;
            }
            appended += 1;
        }
        self.metrics.add_slots_appended(appended);

        match result {
            Ok(()) => {
                side.needed = needed + additional;
                if appended > 0 {
                    debug!(
                        endpoint = %self.addr,
                        appended,
                        needed = side.needed,
                        "event queue grown"
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_provision_failures();
                warn!(endpoint = %self.addr, additional, error = %e, "provisioning failed");
                Err(e)
            }
        }
    }

    /// Returns `amount` provisioned slots.
    pub fn release(&self, amount: usize) {
        let mut side = self.consumer.lock();
        debug_assert!(side.needed >= amount, "release exceeds provisioned slots");
        side.needed = side.needed.saturating_sub(amount);
    }

    /// Takes the next match bits for a passive buffer of this endpoint.
    pub fn next_match_bits(&self) -> u64 {
        let mut counter = self.match_counter.lock();
        let bits = match_bits::encode(self.tmid, *counter);
        *counter = match_bits::next(*counter);
        bits
    }

    fn check_op(&self, buffer: &CoreBuffer, op: &BufferOp) -> FabricResult<()> {
        let invalid = |reason: String| Err(FabricError::InvalidBuffer { reason });
        let len = buffer.len();
        match op {
            BufferOp::MsgSend { dest, length } => {
                if dest.tmid.is_none() {
                    return invalid(format!("destination {} has no transfer machine id", dest));
                }
                if *length > len {
                    return invalid(format!("send of {} bytes from a {} byte buffer", length, len));
                }
            }
            BufferOp::MsgRecv {
                min_receive_size,
                max_messages,
            } => {
                if *max_messages == 0 {
                    return invalid("receive must accept at least one message".to_string());
                }
                if *min_receive_size == 0 || *min_receive_size > len {
                    return invalid(format!(
                        "minimum receive size {} does not fit a {} byte buffer",
                        min_receive_size, len
                    ));
                }
            }
            BufferOp::PassiveBulkSend { length } => {
                if *length > len {
                    return invalid(format!("exposing {} bytes of a {} byte buffer", length, len));
                }
            }
            BufferOp::PassiveBulkRecv => {}
            BufferOp::ActiveBulkSend { desc, length } => {
                if *length > len {
                    return invalid(format!("send of {} bytes from a {} byte buffer", length, len));
                }
                desc.check_active(QueueType::ActiveBulkSend, *length)?;
            }
            BufferOp::ActiveBulkRecv { desc } => {
                desc.check_active(QueueType::ActiveBulkRecv, len)?;
            }
        }
        Ok(())
    }

    fn fabric_kind(&self, buffer: &CoreBuffer, op: &BufferOp) -> (FabricOpKind, Option<BufDesc>) {
        match op {
            BufferOp::MsgSend { dest, length } => (
                FabricOpKind::Put {
                    target: *dest,
                    match_bits: match_bits::encode(dest.tmid.unwrap_or(0), COUNTER_UNSOLICITED),
                    length: *length,
                    hdr_data: sender_tag(&self.addr),
                },
                None,
            ),
            BufferOp::MsgRecv {
                min_receive_size,
                max_messages,
            } => (
                FabricOpKind::AttachRecv {
                    threshold: *max_messages,
                    min_receive_size: *min_receive_size,
                },
                None,
            ),
            BufferOp::PassiveBulkSend { length } => {
                self.passive(QueueType::PassiveBulkSend, false, *length)
            }
            BufferOp::PassiveBulkRecv => {
                self.passive(QueueType::PassiveBulkRecv, true, buffer.len())
            }
            BufferOp::ActiveBulkSend { desc, length } => (
                FabricOpKind::Put {
                    target: desc.passive_addr,
                    match_bits: desc.match_bits,
                    length: *length,
                    hdr_data: sender_tag(&self.addr),
                },
                None,
            ),
            BufferOp::ActiveBulkRecv { desc } => (
                FabricOpKind::Get {
                    target: desc.passive_addr,
                    match_bits: desc.match_bits,
                    length: buffer.len(),
                },
                None,
            ),
        }
    }

    fn passive(
        &self,
        qtype: QueueType,
        accept_put: bool,
        length: usize,
    ) -> (FabricOpKind, Option<BufDesc>) {
        let bits = self.next_match_bits();
        let desc = BufDesc {
            match_bits: bits,
            passive_addr: self.addr,
            qtype,
            size: length as u64,
        };
        (
            FabricOpKind::AttachPassive {
                match_bits: bits,
                accept_put,
                length,
            },
            Some(desc),
        )
    }

    /// Provisions for and starts one operation on `buffer`.
    ///
    /// Passive operations return the descriptor to hand to the active peer.
    pub fn submit(&self, buffer: &CoreBuffer, op: BufferOp) -> FabricResult<Option<BufDesc>> {
        self.check_running()?;
        self.check_op(buffer, &op)?;

        let id = buffer.id();
        if self.inflight.contains_key(&id) {
            return Err(FabricError::BufferBusy { buffer_id: id });
        }

        let need = op.max_completions();
        {
            // Provisioning and registration happen under one lock so that
            // stop never sees an idle endpoint with a submit half done.
            let mut side = self.consumer.lock();
            if self.stopped.load(Ordering::Acquire) {
                return Err(FabricError::EndpointStopped);
            }
            self.grow(&mut side, need)?;
            match self.inflight.entry(id) {
                Entry::Occupied(_) => {
                    side.needed -= need;
                    return Err(FabricError::BufferBusy { buffer_id: id });
                }
                Entry::Vacant(slot) => {
                    slot.insert(InflightOp::new(op.qtype(), need));
                }
            }
        }

        let (kind, desc) = self.fabric_kind(buffer, &op);
        let fabric_op = FabricOp {
            buffer_id: id,
            region: Arc::clone(buffer.region()),
            kind,
        };
        match self.fabric.submit(&self.addr, fabric_op) {
            Ok(handle) => {
                if let Some(mut record) = self.inflight.get_mut(&id) {
                    record.handle = Some(handle);
                }
                self.metrics.record_add(op.qtype());
                debug!(
                    endpoint = %self.addr,
                    buffer = %id,
                    qtype = ?op.qtype(),
                    provisioned = need,
                    "buffer operation submitted"
                );
                Ok(desc)
            }
            Err(e) => {
                self.inflight.remove(&id);
                self.release(need);
                warn!(endpoint = %self.addr, buffer = %id, error = %e, "fabric rejected operation");
                Err(e)
            }
        }
    }

    /// Asks the fabric to cancel the buffer's operation.
    ///
    /// Cancellation races with natural completion; either way exactly one
    /// terminal event follows.
    pub fn cancel(&self, buffer: &CoreBuffer) -> FabricResult<()> {
        let id = buffer.id();
        let (qtype, handle) = match self.inflight.get(&id) {
            Some(record) => (record.qtype, record.handle),
            None => return Err(FabricError::BufferNotQueued { buffer_id: id }),
        };
        self.metrics.record_del(qtype);
        if let Some(handle) = handle {
            let unlinked = self.fabric.unlink(handle);
            debug!(endpoint = %self.addr, buffer = %id, unlinked, "cancel requested");
        }
        Ok(())
    }

    /// Cancels every outstanding operation; returns how many unlink requests were issued.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<_> = self
            .inflight
            .iter()
            .filter_map(|record| record.handle)
            .collect();
        handles
            .into_iter()
            .filter(|handle| self.fabric.unlink(*handle))
            .count()
    }

    /// Waits for a wakeup until `deadline`, then drains surplus wakeups.
    pub(crate) fn wait_wakeup(&self, deadline: Instant) -> bool {
        if !self.sem.timed_down(deadline) {
            return false;
        }
        while self.sem.try_down() {}
        true
    }

    pub(crate) fn wake(&self) {
        self.sem.up();
    }

    /// Blocks until at least one event is pending or `deadline` passes.
    pub fn wait(&self, deadline: Instant) -> FabricResult<()> {
        loop {
            self.check_running()?;
            if !self.is_queue_empty() {
                while self.sem.try_down() {}
                return Ok(());
            }
            if !self.wait_wakeup(deadline) {
                self.metrics.inc_wait_timeouts();
                return Err(FabricError::Timeout);
            }
        }
    }

    /// Pops the next event without blocking.
    ///
    /// A terminal event retires its buffer and returns its provisioned slots.
    ///
    /// A retired message receive buffer tops the receive queue up from the
    /// attached pool before its event is returned.
    pub fn next_event(&self) -> Option<BufferEvent> {
        let (event, retired) = {
            let mut side = self.consumer.lock();
            let event = side.queue.as_mut()?.pop()?;
            self.metrics.inc_events_delivered();
            let mut retired = None;
            if event.unlinked {
                match self.inflight.remove(&event.buffer_id) {
                    Some((_, record)) => {
                        side.needed = side.needed.saturating_sub(record.provisioned);
                        self.metrics.record_event(record.qtype, &event);
                        let elapsed = record.queued_at.elapsed().as_nanos() as u64;
                        self.metrics.record_retired(record.qtype, elapsed);
                        retired = Some(record.qtype);
                    }
                    None => warn!(
                        endpoint = %self.addr,
                        buffer = %event.buffer_id,
                        "terminal event for a buffer with no operation in flight"
                    ),
                }
            } else if let Some(record) = self.inflight.get(&event.buffer_id) {
                self.metrics.record_event(record.qtype, &event);
            }
            (event, retired)
        };
        if retired == Some(QueueType::MsgRecv) {
            self.provision_recv_queue();
        }
        Some(event)
    }

    /// Attaches `pool` and fills the receive queue to its default minimum length.
    ///
    /// Pool buffers are queued as message receives accepting up to
    /// `max_messages` messages, retiring once less than `min_receive_size`
    /// bytes remain.
    pub fn attach_pool(
        self: &Arc<Self>,
        pool: Arc<BufferPool>,
        min_receive_size: usize,
        max_messages: u32,
    ) -> FabricResult<()> {
        self.check_running()?;
        if max_messages == 0 || min_receive_size == 0 || min_receive_size > pool.buffer_size() {
            return Err(FabricError::InvalidConfig {
                reason: format!(
                    "receive pool of {} byte buffers cannot take {} messages of at least {} bytes",
                    pool.buffer_size(),
                    max_messages,
                    min_receive_size
                ),
            });
        }
        {
            let mut attachment = self.recv_pool.lock();
            if attachment.is_some() {
                return Err(FabricError::InvalidConfig {
                    reason: format!("endpoint {} already has a receive pool", self.addr),
                });
            }
            pool.attach(self);
            *attachment = Some(RecvProvisioning {
                pool,
                min_length: RECV_QUEUE_DEFAULT_LEN,
                min_receive_size,
                max_messages,
            });
        }
        let provisioned = self.provision_recv_queue();
        info!(endpoint = %self.addr, provisioned, "receive pool attached");
        Ok(())
    }

    /// Changes the minimum receive queue length and re-provisions.
    ///
    /// Surplus receive buffers are never returned to the pool.
    pub fn set_recv_queue_min_length(&self, len: usize) -> FabricResult<()> {
        match self.recv_pool.lock().as_mut() {
            Some(attachment) => attachment.min_length = len,
            None => {
                return Err(FabricError::InvalidConfig {
                    reason: format!("endpoint {} has no receive pool", self.addr),
                })
            }
        }
        self.provision_recv_queue();
        Ok(())
    }

    /// Receive buffers the endpoint still wants from its pool.
    pub fn recv_queue_deficit(&self) -> usize {
        self.recv_deficit.load(Ordering::Acquire)
    }

    /// Number of message receive buffers currently queued.
    pub fn recv_queue_len(&self) -> usize {
        self.inflight
            .iter()
            .filter(|record| record.qtype == QueueType::MsgRecv)
            .count()
    }

    /// Tops the receive queue up from the attached pool; returns how many
    /// buffers were queued.
    pub(crate) fn provision_recv_queue(&self) -> usize {
        let attachment = self.recv_pool.lock();
        let Some(recv) = attachment.as_ref() else {
            return 0;
        };
        if self.is_stopped() {
            return 0;
        }

        let mut need = recv.min_length.saturating_sub(self.recv_queue_len());
        let mut queued = 0;
        while need > 0 {
            let Some(buffer) = recv.pool.get() else {
                break;
            };
            let id = buffer.id();
            self.pool_buffers
                .insert(id, (buffer.clone(), Arc::clone(&recv.pool)));
            let op = BufferOp::MsgRecv {
                min_receive_size: recv.min_receive_size,
                max_messages: recv.max_messages,
            };
            if let Err(e) = self.submit(&buffer, op) {
                self.pool_buffers.remove(&id);
                if let Err(restore) = recv.pool.restore(buffer) {
                    warn!(
                        endpoint = %self.addr,
                        buffer = %id,
                        error = %restore,
                        "pool buffer lost"
                    );
                }
                warn!(endpoint = %self.addr, error = %e, "receive queue provisioning failed");
                break;
            }
            need -= 1;
            queued += 1;
        }
        self.recv_deficit.store(need, Ordering::Release);
        if need > 0 {
            debug!(endpoint = %self.addr, deficit = need, "receive queue depleted");
        }
        queued
    }

    /// A pool buffer provisioned by this endpoint, for reading what landed in it.
    pub fn pool_buffer(&self, buffer_id: BufferId) -> Option<CoreBuffer> {
        self.pool_buffers.get(&buffer_id).map(|entry| entry.0.clone())
    }

    /// Returns a retired pool buffer to its pool.
    pub fn recycle(&self, buffer_id: BufferId) -> FabricResult<()> {
        if self.inflight.contains_key(&buffer_id) {
            return Err(FabricError::BufferBusy { buffer_id });
        }
        match self.pool_buffers.remove(&buffer_id) {
            Some((_, (buffer, pool))) => pool.put(buffer),
            None => Err(FabricError::BufferNotQueued { buffer_id }),
        }
    }

    /// Stops provisioning from the attached pool and cancels the receive
    /// buffers it supplied; returns how many unlink requests were issued.
    pub fn detach_pool(&self) -> usize {
        let Some(recv) = self.recv_pool.lock().take() else {
            return 0;
        };
        recv.pool.detach(&self.addr);
        self.recv_deficit.store(0, Ordering::Release);
        let handles: Vec<_> = self
            .pool_buffers
            .iter()
            .filter_map(|entry| self.inflight.get(entry.key()).and_then(|record| record.handle))
            .collect();
        let cancelled = handles
            .into_iter()
            .filter(|handle| self.fabric.unlink(*handle))
            .count();
        info!(endpoint = %self.addr, cancelled, "receive pool detached");
        cancelled
    }

    /// Detaches from the fabric and tears the event queue down.
    ///
    /// Fails with [`FabricError::EndpointBusy`] while buffers are outstanding.
    /// Pool buffers still held by the endpoint go back to their pools.
    pub fn stop(&self) -> FabricResult<()> {
        let consumer = {
            let mut side = self.consumer.lock();
            if self.stopped.load(Ordering::Acquire) {
                return Ok(());
            }
            let outstanding = self.outstanding();
            if outstanding > 0 {
                return Err(FabricError::EndpointBusy { outstanding });
            }
            self.stopped.store(true, Ordering::Release);
            side.queue.take()
        };
        self.detach_pool();
        self.fabric.detach(&self.addr);
        self.registry.remove(&self.addr);

        let held: Vec<BufferId> = self.pool_buffers.iter().map(|entry| *entry.key()).collect();
        for id in held {
            if let Some((_, (buffer, pool))) = self.pool_buffers.remove(&id) {
                if let Err(e) = pool.put(buffer) {
                    warn!(endpoint = %self.addr, buffer = %id, error = %e, "pool buffer lost");
                }
            }
        }

        let mut slots = 0usize;
        if let (Some(consumer), Some(producer)) = (consumer, self.translator.take_producer()) {
            consumer.fini(producer, |_| slots += 1)?;
        }
        self.sem.up();
        info!(endpoint = %self.addr, slots, "endpoint stopped");
        Ok(())
    }
}

impl Drop for CoreEndpoint {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::Acquire) {
            self.fabric.detach(&self.addr);
            self.registry.remove(&self.addr);
        }
    }
}

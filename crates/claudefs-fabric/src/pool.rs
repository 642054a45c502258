//! Network buffer pools for automatic receive queue provisioning.
//!
//! A [`BufferPool`] holds registered buffers of one size, created through a
//! [`FabricDomain`](crate::FabricDomain). Endpoints attached to a pool keep
//! their message receive queue at a minimum length by taking buffers from
//! it. When the pool runs dry an endpoint records a deficit; returning a
//! buffer to an empty pool replenishes every attached endpoint that has one.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::addr::EndpointAddr;
use crate::buffer::{BufferId, CoreBuffer, MemoryRegion};
use crate::endpoint::CoreEndpoint;
use crate::error::{FabricError, FabricResult};

/// Receive queue length an endpoint keeps when a pool is first attached.
pub const RECV_QUEUE_DEFAULT_LEN: usize = 2;

/// Configuration for a buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Size of each buffer in bytes.
    pub buffer_size: usize,
    /// Buffers created with the pool.
    pub initial_count: usize,
    /// Free buffer count below which the pool reports itself low.
    pub threshold: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024, // 64KB
            initial_count: 16,
            threshold: 2,
        }
    }
}

/// Statistics for a buffer pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferPoolStats {
    /// Buffers created by this pool.
    pub total: usize,
    /// Buffers currently in the pool.
    pub free: usize,
    /// Buffers currently handed out.
    pub in_use: usize,
    /// Gets that left the pool below its threshold.
    pub below_threshold: u64,
    /// Gets that found the pool empty.
    pub exhausted: u64,
}

#[derive(Default)]
struct PoolState {
    free: VecDeque<CoreBuffer>,
    owned: HashSet<BufferId>,
}

/// A thread-safe pool of registered receive buffers.
pub struct BufferPool {
    config: BufferPoolConfig,
    ids: Arc<AtomicU64>,
    state: Mutex<PoolState>,
    total: AtomicUsize,
    below_threshold: AtomicU64,
    exhausted: AtomicU64,
    attached: Mutex<Vec<(EndpointAddr, Weak<CoreEndpoint>)>>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferPool {
    pub(crate) fn new(config: BufferPoolConfig, ids: Arc<AtomicU64>) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            ids,
            state: Mutex::new(PoolState::default()),
            total: AtomicUsize::new(0),
            below_threshold: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            attached: Mutex::new(Vec::new()),
        });
        let created = pool.provision(pool.config.initial_count);
        info!(
            buffers = created,
            buffer_size = pool.config.buffer_size,
            "buffer pool created"
        );
        pool
    }

    /// The pool configuration.
    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    /// Size of every buffer in the pool.
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Adds `count` new buffers; returns how many were added.
    pub fn provision(&self, count: usize) -> usize {
        let was_empty = {
            let mut state = self.state.lock();
            let was_empty = state.free.is_empty();
            for _ in 0..count {
                let id = BufferId(self.ids.fetch_add(1, Ordering::Relaxed));
                state.owned.insert(id);
                state
                    .free
                    .push_back(CoreBuffer::new(id, MemoryRegion::new(self.config.buffer_size)));
            }
            was_empty
        };
        self.total.fetch_add(count, Ordering::Relaxed);
        if was_empty && count > 0 {
            self.replenish_attached();
        }
        count
    }

    /// Takes the least recently returned buffer, if any.
    pub fn get(&self) -> Option<CoreBuffer> {
        let mut state = self.state.lock();
        let Some(buffer) = state.free.pop_front() else {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if state.free.len() < self.config.threshold {
            self.below_threshold.fetch_add(1, Ordering::Relaxed);
            debug!(free = state.free.len(), threshold = self.config.threshold, "buffer pool low");
        }
        Some(buffer)
    }

    /// Returns a buffer taken from this pool.
    ///
    /// Returning into an empty pool replenishes attached endpoints that are
    /// short of receive buffers.
    pub fn put(&self, buffer: CoreBuffer) -> FabricResult<()> {
        if self.restore(buffer)? {
            self.replenish_attached();
        }
        Ok(())
    }

    /// Puts a buffer back without notifying attached endpoints; returns true
    /// if the pool was empty.
    pub(crate) fn restore(&self, buffer: CoreBuffer) -> FabricResult<bool> {
        let mut state = self.state.lock();
        let id = buffer.id();
        if !state.owned.contains(&id) {
            return Err(FabricError::InvalidBuffer {
                reason: format!("buffer {} does not belong to this pool", id),
            });
        }
        if state.free.iter().any(|b| b.id() == id) {
            return Err(FabricError::InvalidBuffer {
                reason: format!("buffer {} is already in the pool", id),
            });
        }
        let was_empty = state.free.is_empty();
        state.free.push_back(buffer);
        Ok(was_empty)
    }

    /// Releases one free buffer if the pool holds more than its threshold.
    pub fn prune(&self) -> bool {
        let mut state = self.state.lock();
        if state.free.len() <= self.config.threshold {
            return false;
        }
        match state.free.pop_front() {
            Some(buffer) => {
                state.owned.remove(&buffer.id());
                self.total.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Number of buffers currently in the pool.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> BufferPoolStats {
        let free = self.free_count();
        let total = self.total.load(Ordering::Relaxed);
        BufferPoolStats {
            total,
            free,
            in_use: total.saturating_sub(free),
            below_threshold: self.below_threshold.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn attach(&self, endpoint: &Arc<CoreEndpoint>) {
        let mut attached = self.attached.lock();
        attached.retain(|(addr, weak)| weak.strong_count() > 0 && addr != endpoint.addr());
        attached.push((*endpoint.addr(), Arc::downgrade(endpoint)));
    }

    pub(crate) fn detach(&self, addr: &EndpointAddr) {
        self.attached.lock().retain(|(a, _)| a != addr);
    }

    /// Number of live endpoints provisioned from this pool.
    pub fn attached_count(&self) -> usize {
        self.attached
            .lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    /// Re-provisions every attached endpoint with a receive queue deficit;
    /// returns the number of buffers handed out.
    pub fn replenish_attached(&self) -> usize {
        let endpoints: Vec<Arc<CoreEndpoint>> = self
            .attached
            .lock()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        let mut provisioned = 0;
        for endpoint in endpoints {
            if endpoint.recv_queue_deficit() == 0 {
                continue;
            }
            provisioned += endpoint.provision_recv_queue();
        }
        if provisioned > 0 {
            debug!(provisioned, "replenished depleted receive queues");
        } else if self.free_count() == 0 {
            warn!("buffer pool empty, receive queues stay depleted");
        }
        provisioned
    }
}

//! The fabric domain: the context object every endpoint and buffer is created through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::addr::EndpointAddr;
use crate::buffer::{BufferId, CoreBuffer, MemoryRegion};
use crate::config::FabricConfig;
use crate::endpoint::{CoreEndpoint, EndpointRegistry};
use crate::error::{FabricError, FabricResult};
use crate::fabric::Fabric;
use crate::match_bits::TMID_MAX;
use crate::pool::{BufferPool, BufferPoolConfig};

/// Owns the fabric handle, configuration, endpoint registry and buffer id allocator.
pub struct FabricDomain {
    fabric: Arc<dyn Fabric>,
    config: FabricConfig,
    registry: Arc<EndpointRegistry>,
    next_buffer_id: Arc<AtomicU64>,
}

impl FabricDomain {
    /// Creates a domain over `fabric`.
    pub fn new(fabric: Arc<dyn Fabric>, config: FabricConfig) -> FabricResult<Self> {
        config.validate()?;
        Ok(Self {
            fabric,
            config,
            registry: Arc::new(DashMap::new()),
            next_buffer_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// The domain configuration.
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Largest buffer that may be registered.
    pub fn max_buffer_size(&self) -> usize {
        self.config.max_buffer_size
    }

    /// Largest single buffer segment.
    pub fn max_segment_size(&self) -> usize {
        self.config.max_segment_size
    }

    /// Maximum number of segments per buffer.
    pub fn max_buffer_segments(&self) -> u32 {
        self.config.max_buffer_segments
    }

    /// Registers `region` as a buffer usable with any endpoint of this domain.
    pub fn register_buffer(&self, region: Arc<MemoryRegion>) -> FabricResult<CoreBuffer> {
        if region.len() > self.config.max_buffer_size {
            return Err(FabricError::InvalidBuffer {
                reason: format!(
                    "buffer of {} bytes exceeds the {} byte limit",
                    region.len(),
                    self.config.max_buffer_size
                ),
            });
        }
        let id = BufferId(self.next_buffer_id.fetch_add(1, Ordering::Relaxed));
        Ok(CoreBuffer::new(id, region))
    }

    /// Allocates and registers a zero-filled buffer of `len` bytes.
    pub fn allocate_buffer(&self, len: usize) -> FabricResult<CoreBuffer> {
        if len > self.config.max_buffer_size {
            return Err(FabricError::InvalidBuffer {
                reason: format!(
                    "buffer of {} bytes exceeds the {} byte limit",
                    len, self.config.max_buffer_size
                ),
            });
        }
        self.register_buffer(MemoryRegion::new(len))
    }

    /// Creates a pool of receive buffers registered with this domain.
    pub fn create_pool(&self, config: BufferPoolConfig) -> FabricResult<Arc<BufferPool>> {
        if config.buffer_size == 0 || config.buffer_size > self.config.max_buffer_size {
            return Err(FabricError::InvalidConfig {
                reason: format!(
                    "pool buffer size {} must be between 1 and {}",
                    config.buffer_size, self.config.max_buffer_size
                ),
            });
        }
        Ok(BufferPool::new(config, Arc::clone(&self.next_buffer_id)))
    }

    /// Starts an endpoint at `addr`, assigning the highest free tmid if it has none.
    pub fn start_endpoint(&self, addr: &EndpointAddr) -> FabricResult<Arc<CoreEndpoint>> {
        let assigned = match addr.tmid {
            Some(_) => self.reserve(*addr)?,
            None => self.reserve_dynamic(addr)?,
        };

        match CoreEndpoint::start(
            assigned,
            self.config.clone(),
            Arc::clone(&self.fabric),
            Arc::clone(&self.registry),
        ) {
            Ok(endpoint) => {
                self.registry.insert(assigned, Arc::downgrade(&endpoint));
                Ok(endpoint)
            }
            Err(e) => {
                self.registry.remove(&assigned);
                Err(e)
            }
        }
    }

    fn reserve(&self, addr: EndpointAddr) -> FabricResult<EndpointAddr> {
        match self.registry.entry(addr) {
            Entry::Occupied(_) => Err(FabricError::AddressInUse {
                addr: addr.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Weak::new());
                Ok(addr)
            }
        }
    }

    fn reserve_dynamic(&self, addr: &EndpointAddr) -> FabricResult<EndpointAddr> {
        for tmid in (0..=TMID_MAX).rev() {
            let candidate = addr.with_tmid(tmid);
            if let Entry::Vacant(slot) = self.registry.entry(candidate) {
                slot.insert(Weak::new());
                info!(addr = %candidate, "assigned dynamic transfer machine id");
                return Ok(candidate);
            }
        }
        Err(FabricError::TmidExhausted)
    }

    /// Looks up a started endpoint.
    pub fn endpoint(&self, addr: &EndpointAddr) -> Option<Arc<CoreEndpoint>> {
        self.registry.get(addr).and_then(|weak| weak.upgrade())
    }

    /// Number of started endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.registry.len()
    }
}

#![warn(missing_docs)]

//! ClaudeFS fabric subsystem: asynchronous completion core for portals-style fabrics
//!
//! This crate turns raw fabric completions into ordered buffer events. Each
//! endpoint owns a lock-free single-producer single-consumer buffer event
//! queue that grows on demand so that every outstanding operation always has
//! a slot for its completion. Passive bulk buffers are addressed by match
//! bits and advertised to peers through self-describing descriptors. Message
//! receive queues can be kept provisioned from a shared buffer pool.

pub mod addr;
pub mod bev_queue;
pub mod buffer;
pub mod config;
pub mod delivery;
pub mod descriptor;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod fabric;
pub mod match_bits;
pub mod metrics;
pub mod pool;
pub mod semaphore;
pub mod sim;
pub mod translator;

pub use addr::{EndpointAddr, NetworkKind, Nid};
pub use bev_queue::{BevConsumer, BevProducer, BevQueue};
pub use buffer::{
    BufferEvent, BufferId, BufferOp, CoreBuffer, MemoryRegion, QueueType, STATUS_CANCELED,
    STATUS_NO_MATCH, STATUS_OK, STATUS_TOO_LARGE,
};
pub use config::FabricConfig;
pub use delivery::{BufferEventSink, ChannelSink, EventDelivery, ShutdownMode};
pub use descriptor::{decode_address, encode_address, BufDesc};
pub use domain::FabricDomain;
pub use endpoint::CoreEndpoint;
pub use error::{FabricError, FabricResult};
pub use fabric::{CompletionKind, CompletionSink, Fabric, RawCompletion};
pub use metrics::{FabricMetrics, MetricsSnapshot, QueueStats};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, RECV_QUEUE_DEFAULT_LEN};
pub use sim::{SimFabric, SimFabricConfig};
pub use translator::{translate, CompletionTranslator, Translation};

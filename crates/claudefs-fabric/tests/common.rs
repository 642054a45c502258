//! Shared fixtures for the fabric integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use claudefs_fabric::{
    BufferEvent, CoreEndpoint, EndpointAddr, FabricConfig, FabricDomain, SimFabric,
    SimFabricConfig,
};
use tracing_subscriber::EnvFilter;

/// Routes crate logs through the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A domain over a fresh simulated fabric.
pub fn sim_domain(sim: SimFabricConfig) -> (Arc<SimFabric>, FabricDomain) {
    sim_domain_with(sim, FabricConfig::default())
}

/// A domain over a fresh simulated fabric with a custom domain configuration.
pub fn sim_domain_with(sim: SimFabricConfig, config: FabricConfig) -> (Arc<SimFabric>, FabricDomain) {
    init_tracing();
    let fabric = SimFabric::new(sim);
    let domain = FabricDomain::new(fabric.clone(), config).expect("valid domain config");
    (fabric, domain)
}

/// Loopback TCP address on portal `portal` with an explicit transfer machine id.
pub fn addr(portal: u32, tmid: u32) -> EndpointAddr {
    EndpointAddr::parse(&format!("127.0.0.1@tcp:12345:{}:{}", portal, tmid)).expect("valid address")
}

/// Loopback TCP address on portal `portal` requesting a dynamic transfer machine id.
pub fn dynamic_addr(portal: u32) -> EndpointAddr {
    EndpointAddr::parse(&format!("127.0.0.1@tcp:12345:{}:*", portal)).expect("valid address")
}

/// Pops every pending event without blocking.
pub fn drain(endpoint: &CoreEndpoint) -> Vec<BufferEvent> {
    std::iter::from_fn(|| endpoint.next_event()).collect()
}

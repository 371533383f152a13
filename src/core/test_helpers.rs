//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::model::{Decision, Direction, Rule};
use crate::core::partition::BlockPartitioner;
use crate::core::synth::{SynthParams, synthesize_endpoint_chain};
use ipnetwork::Ipv4Network;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::net::Ipv4Addr;
use std::sync::Once;

/// One-time initialization flag for mock iptables setup
static MOCK_IPTABLES_INIT: Once = Once::new();

/// Points the exec sink at the mock iptables script.
///
/// Sets `PODWALL_IPTABLES` to `tests/mock_iptables.sh`, so every
/// [`ExecSink`](crate::core::iptables::ExecSink) constructed afterwards
/// shells out to the mock (and its `-restore` companion) instead of real
/// iptables. Tests never touch the kernel or require elevation.
pub fn setup_mock_iptables() {
    MOCK_IPTABLES_INIT.call_once(|| {
        let mock_path = format!("{}/tests/mock_iptables.sh", env!("CARGO_MANIFEST_DIR"));
        // SAFETY: This is only called once due to Once, and only in test code.
        // Test binaries typically run before any concurrent test threads start.
        unsafe {
            std::env::set_var("PODWALL_IPTABLES", &mock_path);
        }
    });
}

/// Candidate port set used throughout the test suite
pub const TEST_PORTS: [u16; 6] = [8081, 8443, 9999, 12345, 23456, 65530];

/// A /24 endpoint range shared by most scenarios
pub fn test_range() -> Ipv4Network {
    "10.244.0.0/24".parse().unwrap()
}

/// `count` consecutive endpoint addresses inside [`test_range`]
pub fn test_endpoints(count: u8) -> Vec<Ipv4Addr> {
    (1..=count).map(|i| Ipv4Addr::new(10, 244, 0, i)).collect()
}

/// A /30 partition of [`test_range`]
pub fn test_partitioner() -> BlockPartitioner {
    BlockPartitioner::new(&[test_range()], 30).expect("test partition must build")
}

/// Synthesizes a chain with a fixed seed so assertions are reproducible
pub fn seeded_chain(seed: u64, endpoint: Ipv4Addr, peers: &[Ipv4Addr]) -> Vec<Rule> {
    let params = SynthParams {
        ports: &TEST_PORTS,
        default_decision: Decision::Accept,
    };
    synthesize_endpoint_chain(
        &mut StdRng::seed_from_u64(seed),
        endpoint,
        peers,
        Direction::Ingress,
        &params,
    )
}

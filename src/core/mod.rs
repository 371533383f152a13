//! Core access-control chain management
//!
//! This module contains the core types and logic for building, compacting
//! and applying per-endpoint access-control chains. It provides:
//!
//! - [`model`]: Data structures for rules, chains and the owning table
//! - [`partition`]: Fixed-prefix address-block partitioning
//! - [`synth`]: Probabilistic per-endpoint chain synthesis
//! - [`compact`]: Rule classification and chain compaction
//! - [`sink`]: The packet-filter sink abstraction and in-memory sink
//! - [`iptables`]: The iptables-backed sink implementation
//! - [`apply`]: The transactional initialize/optimize/clear protocol
//! - [`error`]: Error types for chain operations

pub mod apply;
pub mod compact;
pub mod error;
pub mod iptables;
pub mod model;
pub mod partition;
pub mod sink;
pub mod synth;

#[cfg(test)]
pub mod test_helpers;

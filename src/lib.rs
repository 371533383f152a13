//! podwall - per-endpoint access-control chain manager
//!
//! Builds, compacts and tears down iptables chain hierarchies for a fleet
//! of workload endpoints.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, partitioning, synthesis, compaction and the
//!   transactional apply protocol
//! - [`inventory`] - Endpoint and node-range discovery
//! - [`config`] - Deployment configuration persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - All kernel mutations go through batched transactions with abort on
//!   failure
//! - Per-endpoint blast radius: one endpoint's failure never aborts the run
//! - `--dry-run` executes the full protocol against an in-memory sink
//! - Chains still referenced by jump rules are never deleted

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod inventory;
pub mod utils;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::model::{Chain, Decision, Direction, Protocol, Rule, Table};
pub use core::sink::{MemorySink, PolicySink};

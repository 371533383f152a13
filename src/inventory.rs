//! Endpoint inventory
//!
//! Where the list of managed endpoints and the node address ranges come
//! from. The source is a trait so the apply protocol never cares whether
//! it is talking to a file, an orchestrator API, or a test fixture.
//!
//! Availability semantics differ by operation: `initialize` degrades to an
//! empty endpoint set when the inventory is unreachable (nothing to manage
//! is a valid state), while `optimize` hard-fails without node ranges
//! because compacting against a guessed partition would silently widen the
//! wrong blocks.

use crate::core::error::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::warn;

/// What an inventory entry is for
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A managed workload endpoint (gets its own chains)
    #[strum(serialize = "pod")]
    Pod,
    /// An infrastructure node (contributes to the partition ranges)
    #[strum(serialize = "node")]
    Node,
}

/// One inventory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: Ipv4Addr,
    pub role: Role,
}

/// Source of endpoint and range information
#[allow(async_fn_in_trait)]
pub trait InventorySource {
    /// All known endpoints, pods and nodes alike
    async fn endpoints(&self) -> Result<Vec<Endpoint>>;

    /// Address ranges the partitioner may split into blocks
    async fn node_ranges(&self) -> Result<Vec<Ipv4Network>>;
}

/// On-disk inventory document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    endpoints: Vec<Endpoint>,
    #[serde(default)]
    node_ranges: Vec<Ipv4Network>,
}

/// Inventory backed by a JSON file on disk
#[derive(Debug, Clone)]
pub struct FileInventory {
    path: PathBuf,
}

impl FileInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<InventoryFile> {
        let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::InventoryUnavailable {
                message: format!("{}: {e}", self.path.display()),
            }
        })?;
        serde_json::from_str(&json).map_err(|e| Error::InventoryUnavailable {
            message: format!("{}: {e}", self.path.display()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InventorySource for FileInventory {
    async fn endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(self.load().await?.endpoints)
    }

    async fn node_ranges(&self) -> Result<Vec<Ipv4Network>> {
        let ranges = self.load().await?.node_ranges;
        if ranges.is_empty() {
            return Err(Error::InventoryUnavailable {
                message: format!("{}: no node ranges listed", self.path.display()),
            });
        }
        Ok(ranges)
    }
}

/// Pod addresses from the inventory, or an empty set if it is unreachable.
///
/// Used by `initialize` only; see the module docs for why `optimize` never
/// degrades this way.
pub async fn pods_or_empty<I: InventorySource>(inventory: &I) -> Vec<Ipv4Addr> {
    match inventory.endpoints().await {
        Ok(endpoints) => endpoints
            .into_iter()
            .filter(|e| e.role == Role::Pod)
            .map(|e| e.address)
            .collect(),
        Err(e) => {
            warn!(error = %e, "inventory unavailable, managing zero endpoints");
            Vec::new()
        }
    }
}

//! Address-block partitioner
//!
//! Splits a set of address ranges into fixed-size, non-overlapping blocks
//! and answers "which block contains this address" by binary search.
//!
//! Partitioning is pure and deterministic: the same ranges and block prefix
//! always yield the same sorted block set. The compactor relies on this to
//! agree with partitions computed in earlier runs.

use crate::core::error::{Error, Result};
use crate::core::model::AddressBlock;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Sorted, disjoint set of fixed-prefix address blocks
#[derive(Debug, Clone)]
pub struct BlockPartitioner {
    blocks: Vec<AddressBlock>,
    block_prefix: u8,
}

impl BlockPartitioner {
    /// Partitions `ranges` into `/block_prefix` blocks.
    ///
    /// Fails if the prefix is outside 1..=32 or coarser than any input
    /// range (a /30 split of a /16 is fine, a /8 split is not).
    #[allow(clippy::cast_possible_truncation)] // block bases stay within the 32-bit space
    pub fn new(ranges: &[Ipv4Network], block_prefix: u8) -> Result<Self> {
        if block_prefix == 0 || block_prefix > 32 {
            return Err(Error::InvalidBlockPrefix {
                range: "*".to_string(),
                prefix: block_prefix,
            });
        }

        let mut blocks = Vec::new();
        for range in ranges {
            if range.prefix() > block_prefix {
                return Err(Error::InvalidBlockPrefix {
                    range: range.to_string(),
                    prefix: block_prefix,
                });
            }

            let start = u64::from(u32::from(range.network()));
            let step = u64::from(1u32 << (32 - block_prefix));
            let count = 1u64 << (block_prefix - range.prefix());
            for i in 0..count {
                let base = Ipv4Addr::from((start + i * step) as u32);
                let network = Ipv4Network::new(base, block_prefix)
                    .map_err(|e| Error::Internal(format!("block construction: {e}")))?;
                blocks.push(AddressBlock::new(network));
            }
        }

        // Overlapping input ranges with a common prefix alignment collapse to
        // identical blocks, so sort + dedup is enough to keep the set disjoint.
        blocks.sort();
        blocks.dedup();

        Ok(Self {
            blocks,
            block_prefix,
        })
    }

    /// Finds the block containing `addr`.
    ///
    /// # Errors
    ///
    /// `PartitionOutOfRange` when the address lies outside every
    /// configured range.
    pub fn locate(&self, addr: Ipv4Addr) -> Result<AddressBlock> {
        let key = u32::from(addr);
        let idx = self
            .blocks
            .partition_point(|block| u32::from(block.base()) <= key);
        if idx == 0 {
            return Err(Error::PartitionOutOfRange { addr });
        }
        let candidate = self.blocks[idx - 1];
        if candidate.contains(addr) {
            Ok(candidate)
        } else {
            Err(Error::PartitionOutOfRange { addr })
        }
    }

    /// The sorted block set
    pub fn blocks(&self) -> &[AddressBlock] {
        &self.blocks
    }

    pub fn block_prefix(&self) -> u8 {
        self.block_prefix
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

use std::net::Ipv4Addr;
use thiserror::Error;

/// Core error types for podwall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The inventory source could not be reached or produced garbage.
    ///
    /// Callers recover by proceeding with an empty endpoint set; only
    /// operations that strictly need the inventory (block partitioning)
    /// turn this into a mode failure.
    #[error("inventory unavailable: {message}")]
    InventoryUnavailable { message: String },

    /// The packet-filter sink rejected a single chain or rule operation.
    ///
    /// Batch callers log the offending item and continue; the sink gives
    /// no cross-chain atomicity anyway.
    #[error("sink rejected operation on chain {chain}: {message}")]
    SinkRejected { chain: String, message: String },

    /// An address has no containing block in the configured partition.
    ///
    /// Fatal only to the single rule being compacted; that rule is carried
    /// forward verbatim rather than dropped.
    #[error("address {addr} is outside all configured ranges")]
    PartitionOutOfRange { addr: Ipv4Addr },

    /// The requested block prefix cannot partition a configured range.
    #[error("block prefix /{prefix} cannot partition range {range}")]
    InvalidBlockPrefix { range: String, prefix: u8 },

    /// A transaction against the sink could not be opened or committed.
    ///
    /// This is the only unrecoverable failure: the current mode invocation
    /// aborts and reports a non-zero exit.
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// A rule references a chain the table does not know about
    #[error("unknown chain: {name}")]
    UnknownChain { name: String },

    /// Internal logic error
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_out_of_range_names_the_address() {
        let err = Error::PartitionOutOfRange {
            addr: Ipv4Addr::new(192, 168, 9, 1),
        };
        assert!(err.to_string().contains("192.168.9.1"));
    }

    #[test]
    fn sink_rejected_names_the_chain() {
        let err = Error::SinkRejected {
            chain: "ep-in-10-244-0-5".to_string(),
            message: "no such target".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("ep-in-10-244-0-5"));
        assert!(text.contains("no such target"));
    }
}

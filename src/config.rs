use crate::core::model::Decision;
use crate::utils::get_data_dir;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete deployment configuration for all three operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Address range endpoint addresses are drawn from
    #[serde(default = "default_endpoint_cidr")]
    pub endpoint_cidr: Ipv4Network,
    /// Prefix length of the compaction blocks (default: /30)
    #[serde(default = "default_block_prefix")]
    pub block_prefix: u8,
    /// Candidate destination ports for synthesized TCP/UDP rules
    #[serde(default = "default_candidate_ports")]
    pub candidate_ports: Vec<u16>,
    /// Delay between per-endpoint batches, in milliseconds
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// Verdict of every chain-terminal default rule
    #[serde(default = "default_decision")]
    pub default_decision: Decision,
    /// Path of the iptables binary (overridable via `PODWALL_IPTABLES`)
    #[serde(default = "default_iptables_path")]
    pub iptables_path: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            endpoint_cidr: default_endpoint_cidr(),
            block_prefix: default_block_prefix(),
            candidate_ports: default_candidate_ports(),
            pacing_ms: default_pacing_ms(),
            default_decision: default_decision(),
            iptables_path: default_iptables_path(),
        }
    }
}

fn default_endpoint_cidr() -> Ipv4Network {
    // The conventional pod range; constructing it cannot fail
    "10.244.0.0/16".parse().expect("valid built-in CIDR")
}

fn default_block_prefix() -> u8 {
    30
}

fn default_candidate_ports() -> Vec<u16> {
    vec![8081, 8443, 9999, 12345, 23456, 65530]
}

fn default_pacing_ms() -> u64 {
    10
}

fn default_decision() -> Decision {
    Decision::Accept
}

fn default_iptables_path() -> String {
    "iptables".to_string()
}

/// Loads configuration from an explicit path, failing loudly on a broken
/// file. An explicitly named config that does not parse is an operator
/// error, not something to paper over with defaults.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_config_from(path: &Path) -> std::io::Result<DeployConfig> {
    let json = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&json).map_err(std::io::Error::other)
}

/// Loads the config from the data directory, or returns defaults if the
/// file is missing or unreadable.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_config() -> DeployConfig {
    if let Some(mut path) = get_data_dir() {
        path.push("config.json");
        if let Ok(json) = tokio::fs::read_to_string(&path).await
            && let Ok(config) = serde_json::from_str::<DeployConfig>(&json)
        {
            return config;
        }
    }
    DeployConfig::default()
}

//! Packet-filter sink abstraction
//!
//! The sink is the external kernel-side rule store. Everything the apply
//! protocol needs from it is captured by [`PolicySink`]: chain lifecycle,
//! rule CRUD, and the begin/commit/refresh batching discipline.
//!
//! [`RuleSpec`] is the wire representation: every model rule field maps
//! onto it, and jump targets travel by chain name (handles are meaningless
//! outside the in-memory [`Table`]).
//!
//! [`MemorySink`] is the in-process implementation behind `--dry-run` and
//! the test suite. It enforces the same sharp edges as the real sink, in
//! particular the refusal to delete a chain that is still referenced by a
//! jump rule.

use crate::core::error::{Error, Result};
use crate::core::model::{Decision, PeerMatch, Protocol, Rule, Table, Verdict};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire-level rule target: a verdict, or a jump to a named chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Verdict(Decision),
    Jump(String),
}

/// Wire-level rule representation accepted by the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<Ipv4Network>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<Ipv4Network>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_signature: Option<String>,
    pub target: TargetSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn peer_to_network(peer: Option<&PeerMatch>) -> Option<Ipv4Network> {
    peer.map(PeerMatch::network)
}

fn network_to_peer(network: Option<Ipv4Network>) -> Option<PeerMatch> {
    network.map(|net| {
        if net.prefix() == 32 {
            PeerMatch::Host(net.ip())
        } else {
            PeerMatch::Block(net.into())
        }
    })
}

impl Rule {
    /// Encodes the rule for the wire, resolving jump handles to names
    pub fn to_spec(&self, table: &Table) -> Result<RuleSpec> {
        let target = match self.verdict {
            Verdict::Decision(decision) => TargetSpec::Verdict(decision),
            Verdict::Jump(id) => TargetSpec::Jump(
                table
                    .name_of(id)
                    .ok_or_else(|| Error::Internal("jump to deleted chain".to_string()))?
                    .to_string(),
            ),
        };
        Ok(RuleSpec {
            src: peer_to_network(self.src.as_ref()),
            dst: peer_to_network(self.dst.as_ref()),
            protocol: self.protocol,
            port: self.port,
            payload_signature: self.payload_signature.clone(),
            target,
            comment: self.comment.clone(),
        })
    }

    /// Decodes a wire rule, resolving jump names through the table index
    pub fn from_spec(spec: &RuleSpec, table: &Table) -> Result<Self> {
        let verdict = match &spec.target {
            TargetSpec::Verdict(decision) => Verdict::Decision(*decision),
            TargetSpec::Jump(name) => Verdict::Jump(
                table
                    .chain_id(name)
                    .ok_or_else(|| Error::UnknownChain { name: name.clone() })?,
            ),
        };
        Ok(Self {
            src: network_to_peer(spec.src),
            dst: network_to_peer(spec.dst),
            protocol: spec.protocol,
            port: spec.port,
            payload_signature: spec.payload_signature.clone(),
            verdict,
            comment: spec.comment.clone(),
        })
    }
}

impl RuleSpec {
    /// Name of the jumped-to chain, if this is a jump rule
    pub fn jump_target(&self) -> Option<&str> {
        match &self.target {
            TargetSpec::Jump(name) => Some(name.as_str()),
            TargetSpec::Verdict(_) => None,
        }
    }
}

/// External packet-filter rule store.
///
/// All mutation methods may be buffered: between `begin_batch` and `commit`
/// they only queue work, and `commit` flushes the queue in order. Reads
/// always reflect committed state. No two batches may be open at once.
#[allow(async_fn_in_trait)]
pub trait PolicySink {
    async fn list_chains(&mut self) -> Result<Vec<String>>;
    async fn create_chain(&mut self, name: &str) -> Result<()>;
    async fn delete_chain(&mut self, name: &str) -> Result<()>;
    async fn flush_chain(&mut self, name: &str) -> Result<()>;
    async fn append_rule(&mut self, chain: &str, rule: RuleSpec) -> Result<()>;
    async fn insert_rule(&mut self, chain: &str, index: usize, rule: RuleSpec) -> Result<()>;
    async fn delete_rule(&mut self, chain: &str, rule: &RuleSpec) -> Result<()>;
    async fn list_rules(&mut self, chain: &str) -> Result<Vec<RuleSpec>>;
    async fn begin_batch(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn abort_batch(&mut self) -> Result<()>;
    async fn refresh(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Op {
    Create(String),
    Delete(String),
    Flush(String),
    Append(String, RuleSpec),
    Insert(String, usize, RuleSpec),
    DeleteRule(String, RuleSpec),
}

/// In-memory sink used for dry runs and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    order: Vec<String>,
    rules: HashMap<String, Vec<RuleSpec>>,
    buffering: bool,
    pending: Vec<Op>,
    commits: usize,
    /// Chain names whose creation is rejected, for fault-injection tests
    reject_creates: Vec<String>,
}

impl MemorySink {
    /// Empty sink pre-seeded with the built-in FORWARD chain
    pub fn new() -> Self {
        let mut sink = Self::default();
        sink.order.push("FORWARD".to_string());
        sink.rules.insert("FORWARD".to_string(), Vec::new());
        sink
    }

    /// Makes `create_chain(name)` fail, to exercise best-effort batching
    pub fn reject_create(&mut self, name: &str) {
        self.reject_creates.push(name.to_string());
    }

    /// Number of committed batches so far
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Committed rules of a chain, for assertions
    pub fn chain_rules(&self, name: &str) -> Option<&[RuleSpec]> {
        self.rules.get(name).map(Vec::as_slice)
    }

    fn chain_exists(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    fn apply(&mut self, op: Op) -> Result<()> {
        match op {
            Op::Create(name) => {
                if self.reject_creates.iter().any(|n| n == &name) {
                    return Err(Error::SinkRejected {
                        chain: name,
                        message: "injected create failure".to_string(),
                    });
                }
                if self.chain_exists(&name) {
                    return Err(Error::SinkRejected {
                        chain: name,
                        message: "chain already exists".to_string(),
                    });
                }
                self.order.push(name.clone());
                self.rules.insert(name, Vec::new());
                Ok(())
            }
            Op::Delete(name) => {
                if !self.chain_exists(&name) {
                    return Err(Error::SinkRejected {
                        chain: name,
                        message: "no such chain".to_string(),
                    });
                }
                let referenced = self
                    .rules
                    .iter()
                    .any(|(owner, rules)| {
                        owner != &name
                            && rules.iter().any(|r| r.jump_target() == Some(name.as_str()))
                    });
                if referenced {
                    return Err(Error::SinkRejected {
                        chain: name,
                        message: "chain is still referenced".to_string(),
                    });
                }
                self.order.retain(|n| n != &name);
                self.rules.remove(&name);
                Ok(())
            }
            Op::Flush(name) => {
                let rules = self.rules.get_mut(&name).ok_or_else(|| Error::SinkRejected {
                    chain: name.clone(),
                    message: "no such chain".to_string(),
                })?;
                rules.clear();
                Ok(())
            }
            Op::Append(chain, rule) => {
                if let Some(target) = rule.jump_target()
                    && !self.chain_exists(target)
                {
                    return Err(Error::SinkRejected {
                        chain,
                        message: format!("jump target {target} does not exist"),
                    });
                }
                let rules = self.rules.get_mut(&chain).ok_or_else(|| Error::SinkRejected {
                    chain: chain.clone(),
                    message: "no such chain".to_string(),
                })?;
                rules.push(rule);
                Ok(())
            }
            Op::Insert(chain, index, rule) => {
                let rules = self.rules.get_mut(&chain).ok_or_else(|| Error::SinkRejected {
                    chain: chain.clone(),
                    message: "no such chain".to_string(),
                })?;
                let index = index.min(rules.len());
                rules.insert(index, rule);
                Ok(())
            }
            Op::DeleteRule(chain, rule) => {
                let rules = self.rules.get_mut(&chain).ok_or_else(|| Error::SinkRejected {
                    chain: chain.clone(),
                    message: "no such chain".to_string(),
                })?;
                if let Some(pos) = rules.iter().position(|r| r == &rule) {
                    rules.remove(pos);
                    Ok(())
                } else {
                    Err(Error::SinkRejected {
                        chain,
                        message: "rule not found".to_string(),
                    })
                }
            }
        }
    }

    fn submit(&mut self, op: Op) -> Result<()> {
        if self.buffering {
            self.pending.push(op);
            Ok(())
        } else {
            self.apply(op)
        }
    }
}

impl PolicySink for MemorySink {
    async fn list_chains(&mut self) -> Result<Vec<String>> {
        Ok(self.order.clone())
    }

    async fn create_chain(&mut self, name: &str) -> Result<()> {
        self.submit(Op::Create(name.to_string()))
    }

    async fn delete_chain(&mut self, name: &str) -> Result<()> {
        self.submit(Op::Delete(name.to_string()))
    }

    async fn flush_chain(&mut self, name: &str) -> Result<()> {
        self.submit(Op::Flush(name.to_string()))
    }

    async fn append_rule(&mut self, chain: &str, rule: RuleSpec) -> Result<()> {
        self.submit(Op::Append(chain.to_string(), rule))
    }

    async fn insert_rule(&mut self, chain: &str, index: usize, rule: RuleSpec) -> Result<()> {
        self.submit(Op::Insert(chain.to_string(), index, rule))
    }

    async fn delete_rule(&mut self, chain: &str, rule: &RuleSpec) -> Result<()> {
        self.submit(Op::DeleteRule(chain.to_string(), rule.clone()))
    }

    async fn list_rules(&mut self, chain: &str) -> Result<Vec<RuleSpec>> {
        self.rules
            .get(chain)
            .cloned()
            .ok_or_else(|| Error::SinkRejected {
                chain: chain.to_string(),
                message: "no such chain".to_string(),
            })
    }

    async fn begin_batch(&mut self) -> Result<()> {
        if self.buffering {
            return Err(Error::Transaction {
                message: "a batch is already open".to_string(),
            });
        }
        self.buffering = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.buffering {
            return Err(Error::Transaction {
                message: "commit without an open batch".to_string(),
            });
        }
        // Buffering is released no matter how the replay goes; the sink
        // gives no cross-operation atomicity, so a failure leaves the
        // applied prefix in place.
        self.buffering = false;
        let pending = std::mem::take(&mut self.pending);
        for op in pending {
            self.apply(op)?;
        }
        self.commits += 1;
        Ok(())
    }

    async fn abort_batch(&mut self) -> Result<()> {
        self.buffering = false;
        self.pending.clear();
        Ok(())
    }

    async fn refresh(&mut self) -> Result<()> {
        // Committed state is already authoritative in memory
        Ok(())
    }
}

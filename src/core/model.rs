//! Rule, chain and table data structures
//!
//! This module is the shared vocabulary of the crate: an in-memory model of
//! packet-filter rules, the ordered chains that hold them, and the table that
//! owns every chain's lifecycle.
//!
//! # Semantics
//!
//! A [`Chain`] is a first-match-wins ordered sequence of [`Rule`]s; order is
//! load-bearing and every chain ends with an explicit default rule so lookup
//! is always total. Chains reference each other only through [`ChainId`]
//! handles into the [`Table`] arena, never through live references, so a
//! flush or delete can never leave a dangling pointer behind.
//!
//! # Example
//!
//! ```
//! use podwall::core::model::{Chain, Decision, Direction, Protocol, Rule, Table};
//! use std::net::Ipv4Addr;
//!
//! let mut table = Table::new();
//! let id = table
//!     .create_chain("ep-in-10-244-0-5", Some(Direction::Ingress))
//!     .unwrap();
//!
//! let rule = Rule::verdict(Decision::Accept)
//!     .with_src(Ipv4Addr::new(10, 244, 0, 9).into())
//!     .with_protocol(Protocol::Tcp)
//!     .with_port(8443);
//! table.chain_mut(id).unwrap().push(rule);
//! ```

use crate::core::error::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;

/// Verdict a rule assigns to a matching packet
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Accept the packet (allow it through)
    #[strum(serialize = "accept")]
    Accept,
    /// Drop the packet silently (no response sent)
    #[strum(serialize = "drop")]
    Drop,
    /// Reject the packet and send an unreachable response
    #[strum(serialize = "reject")]
    Reject,
    /// Stop evaluating this chain and resume in the parent chain
    #[strum(serialize = "return")]
    Return,
}

impl Decision {
    /// Returns lowercase verdict name as a static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::Drop => "drop",
            Decision::Reject => "reject",
            Decision::Return => "return",
        }
    }
}

/// Network protocol matched by a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Match all protocols
    #[default]
    #[strum(serialize = "any")]
    Any,
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
    /// Internet Control Message Protocol
    #[strum(serialize = "icmp")]
    Icmp,
}

impl Protocol {
    /// Returns lowercase protocol name as a static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Any => "any",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }

    /// Whether destination-port matching is meaningful for this protocol
    pub const fn is_port_aware(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

/// Traffic direction a chain is scoped to
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Traffic arriving at the endpoint
    #[strum(serialize = "ingress")]
    Ingress,
    /// Traffic leaving the endpoint
    #[strum(serialize = "egress")]
    Egress,
}

impl Direction {
    /// Short tag used when composing per-endpoint chain names
    pub const fn tag(self) -> &'static str {
        match self {
            Direction::Ingress => "in",
            Direction::Egress => "out",
        }
    }
}

/// A contiguous address range sharing a fixed-length prefix.
///
/// Thin wrapper over [`Ipv4Network`] that normalizes the base address and
/// provides a total ordering by (base, prefix) for deterministic iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressBlock(Ipv4Network);

impl AddressBlock {
    /// Wraps a network, normalizing the base to the network address
    pub fn new(network: Ipv4Network) -> Self {
        // Re-basing to .network() cannot change the prefix, so the inner
        // constructor cannot fail here.
        Self(Ipv4Network::new(network.network(), network.prefix()).unwrap_or(network))
    }

    /// Base (network) address of the block
    pub fn base(&self) -> Ipv4Addr {
        self.0.network()
    }

    /// Prefix length of the block
    pub fn prefix(&self) -> u8 {
        self.0.prefix()
    }

    /// Whether the block contains the given address
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.0.contains(addr)
    }

    /// The underlying CIDR network
    pub fn network(&self) -> Ipv4Network {
        self.0
    }
}

impl PartialOrd for AddressBlock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AddressBlock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (u32::from(self.base()), self.prefix()).cmp(&(u32::from(other.base()), other.prefix()))
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Ipv4Network> for AddressBlock {
    fn from(network: Ipv4Network) -> Self {
        Self::new(network)
    }
}

/// Peer match for one side (src or dst) of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerMatch {
    /// A single host address
    Host(Ipv4Addr),
    /// A whole address block
    Block(AddressBlock),
}

impl PeerMatch {
    /// Representative address of the match: the host itself, or the block base.
    ///
    /// The block base is what the compactor feeds back into the partitioner,
    /// which is what makes compaction idempotent.
    pub fn address(&self) -> Ipv4Addr {
        match self {
            PeerMatch::Host(addr) => *addr,
            PeerMatch::Block(block) => block.base(),
        }
    }

    /// CIDR representation used on the sink wire
    pub fn network(&self) -> Ipv4Network {
        match self {
            PeerMatch::Host(addr) => Ipv4Network::from(*addr),
            PeerMatch::Block(block) => block.network(),
        }
    }
}

impl From<Ipv4Addr> for PeerMatch {
    fn from(addr: Ipv4Addr) -> Self {
        PeerMatch::Host(addr)
    }
}

impl From<AddressBlock> for PeerMatch {
    fn from(block: AddressBlock) -> Self {
        PeerMatch::Block(block)
    }
}

impl fmt::Display for PeerMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMatch::Host(addr) => addr.fmt(f),
            PeerMatch::Block(block) => block.fmt(f),
        }
    }
}

/// Which side of a rule is treated as the peer dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Src,
    Dst,
}

/// Stable handle to a chain slot in a [`Table`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(usize);

/// Target of a rule: a terminal verdict or a jump to another chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Terminal verdict
    Decision(Decision),
    /// Continue evaluation in the referenced chain
    Jump(ChainId),
}

/// Coarse classification of a rule, used by the compactor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleClass {
    /// Accept verdicts: candidates for block aggregation
    Allow,
    /// Drop/Reject verdicts: relative order must survive compaction
    Deny,
    /// Return verdicts: payload-signature bypass markers
    Bypass,
    /// Jump to another chain
    Jump,
}

/// A single packet-filter rule.
///
/// Rules are immutable once appended to a chain; the compactor rewrites
/// whole chains rather than editing rules in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub src: Option<PeerMatch>,
    pub dst: Option<PeerMatch>,
    pub protocol: Protocol,
    /// Destination port, meaningful only for TCP/UDP
    pub port: Option<u16>,
    /// Payload signature of a bypass marker rule (string match on the sink)
    pub payload_signature: Option<String>,
    pub verdict: Verdict,
    pub comment: Option<String>,
}

impl Rule {
    /// A bare rule carrying only a terminal verdict
    pub fn verdict(decision: Decision) -> Self {
        Self {
            src: None,
            dst: None,
            protocol: Protocol::Any,
            port: None,
            payload_signature: None,
            verdict: Verdict::Decision(decision),
            comment: None,
        }
    }

    /// A bare rule jumping to another chain
    pub fn jump(target: ChainId) -> Self {
        Self {
            src: None,
            dst: None,
            protocol: Protocol::Any,
            port: None,
            payload_signature: None,
            verdict: Verdict::Jump(target),
            comment: None,
        }
    }

    pub fn with_src(mut self, peer: PeerMatch) -> Self {
        self.src = Some(peer);
        self
    }

    pub fn with_dst(mut self, peer: PeerMatch) -> Self {
        self.dst = Some(peer);
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.payload_signature = Some(signature.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Classifies the rule by its verdict kind
    pub fn classify(&self) -> RuleClass {
        match self.verdict {
            Verdict::Decision(Decision::Accept) => RuleClass::Allow,
            Verdict::Decision(Decision::Drop | Decision::Reject) => RuleClass::Deny,
            Verdict::Decision(Decision::Return) => RuleClass::Bypass,
            Verdict::Jump(_) => RuleClass::Jump,
        }
    }

    /// Peer match on the given side
    pub fn peer(&self, field: Field) -> Option<&PeerMatch> {
        match field {
            Field::Src => self.src.as_ref(),
            Field::Dst => self.dst.as_ref(),
        }
    }

    /// Replaces the peer match on the given side
    pub fn set_peer(&mut self, field: Field, peer: PeerMatch) {
        match field {
            Field::Src => self.src = Some(peer),
            Field::Dst => self.dst = Some(peer),
        }
    }
}

/// An ordered, first-match-wins list of rules scoped to a direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    name: String,
    direction: Option<Direction>,
    rules: Vec<Rule>,
}

impl Chain {
    pub fn new(name: impl Into<String>, direction: Option<Direction>) -> Self {
        Self {
            name: name.into(),
            direction,
            rules: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn insert(&mut self, index: usize, rule: Rule) {
        let index = index.min(self.rules.len());
        self.rules.insert(index, rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The chain-terminal default rule, if the chain has any rules
    pub fn terminal(&self) -> Option<&Rule> {
        self.rules.last()
    }

    /// Removes all rules, keeping identity and direction
    pub fn flush(&mut self) {
        self.rules.clear();
    }

    /// Replaces the whole rule sequence (explicit rewrite, used by compaction)
    pub fn rewrite(&mut self, rules: Vec<Rule>) {
        self.rules = rules;
    }

    /// Groups rules by terminal decision, preserving first-match order
    /// within each group. Jump rules carry no decision and are omitted.
    pub fn rules_by_decision(&self) -> BTreeMap<Decision, Vec<&Rule>> {
        let mut groups: BTreeMap<Decision, Vec<&Rule>> = BTreeMap::new();
        for rule in &self.rules {
            if let Verdict::Decision(decision) = rule.verdict {
                groups.entry(decision).or_default().push(rule);
            }
        }
        groups
    }
}

/// Owner of every chain in a deployment.
///
/// Chains live in an arena indexed by [`ChainId`]; deleted slots are left
/// as tombstones so outstanding handles stay valid (they resolve to `None`
/// rather than to some unrelated chain).
#[derive(Debug, Default)]
pub struct Table {
    slots: Vec<Option<Chain>>,
    index: HashMap<String, ChainId>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty chain, failing if the name is already taken
    pub fn create_chain(
        &mut self,
        name: &str,
        direction: Option<Direction>,
    ) -> Result<ChainId> {
        if self.index.contains_key(name) {
            return Err(Error::Internal(format!("chain {name} already exists")));
        }
        let id = ChainId(self.slots.len());
        self.slots.push(Some(Chain::new(name, direction)));
        self.index.insert(name.to_string(), id);
        Ok(id)
    }

    /// Returns the existing chain id, creating the chain if needed
    pub fn ensure_chain(&mut self, name: &str, direction: Option<Direction>) -> ChainId {
        if let Some(id) = self.index.get(name) {
            return *id;
        }
        let id = ChainId(self.slots.len());
        self.slots.push(Some(Chain::new(name, direction)));
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn chain_id(&self, name: &str) -> Option<ChainId> {
        self.index.get(name).copied()
    }

    pub fn chain(&self, id: ChainId) -> Option<&Chain> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn chain_mut(&mut self, id: ChainId) -> Option<&mut Chain> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn name_of(&self, id: ChainId) -> Option<&str> {
        self.chain(id).map(Chain::name)
    }

    /// Removes all rules from a chain without touching its identity
    pub fn flush(&mut self, id: ChainId) -> Result<()> {
        let chain = self
            .chain_mut(id)
            .ok_or_else(|| Error::Internal("flush of deleted chain".to_string()))?;
        chain.flush();
        Ok(())
    }

    /// Deletes a chain, refusing while any other chain still jumps into it
    pub fn delete_chain(&mut self, id: ChainId) -> Result<()> {
        let name = self
            .name_of(id)
            .ok_or_else(|| Error::Internal("delete of deleted chain".to_string()))?
            .to_string();

        let referenced = self.chains().any(|(other, chain)| {
            other != id
                && chain
                    .rules()
                    .iter()
                    .any(|rule| rule.verdict == Verdict::Jump(id))
        });
        if referenced {
            return Err(Error::SinkRejected {
                chain: name,
                message: "chain is still referenced by a jump rule".to_string(),
            });
        }

        self.index.remove(&name);
        self.slots[id.0] = None;
        Ok(())
    }

    /// Iterates live chains in creation order
    pub fn chains(&self) -> impl Iterator<Item = (ChainId, &Chain)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|chain| (ChainId(i), chain)))
    }

    /// Number of live chains
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

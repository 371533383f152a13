//! Rule classification and chain compaction
//!
//! Rewrites a deployed per-endpoint chain into a functionally-reduced form:
//! deny rules keep their original relative order and stay ahead of every
//! aggregated accept rule, accept rules collapse to one representative rule
//! per address block, and the chain-terminal default rule passes through
//! untouched. Rule count drops from O(peers) to O(blocks) + O(denies).
//!
//! Aggregating accepts by block deliberately widens matching to every
//! address in the block, including peers that had no explicit rule. That
//! mirrors the deployed behavior this compactor was built against; it is a
//! known trade-off, not an oversight.

use crate::core::error::{Error, Result};
use crate::core::model::{AddressBlock, Field, Rule, RuleClass};
use crate::core::partition::BlockPartitioner;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Outcome of compacting one chain
#[derive(Debug)]
pub struct Compaction {
    /// The rewritten rule sequence, terminal rule included
    pub rules: Vec<Rule>,
    /// Which side of the rules was treated as the peer dimension
    pub dominant: Field,
    /// Deny rules preserved in original order
    pub denies: usize,
    /// Accept groups merged into block-wide rules
    pub merged_blocks: usize,
    /// Accept rules carried forward verbatim (no containing block)
    pub carried_forward: usize,
    /// Payload-signature bypass rules dropped during compaction
    pub dropped_bypass: usize,
}

/// Picks the peer dimension by majority vote over accept-rule addresses.
///
/// The side with more distinct addresses is the one that varies per peer;
/// ties go to dst, matching egress-style chains where the endpoint side is
/// the source.
fn dominant_field(accepts: &[&Rule]) -> Field {
    let mut src_set: HashSet<Ipv4Addr> = HashSet::new();
    let mut dst_set: HashSet<Ipv4Addr> = HashSet::new();
    for rule in accepts {
        if let Some(peer) = rule.src.as_ref() {
            src_set.insert(peer.address());
        }
        if let Some(peer) = rule.dst.as_ref() {
            dst_set.insert(peer.address());
        }
    }
    if src_set.len() > dst_set.len() {
        Field::Src
    } else {
        Field::Dst
    }
}

/// Compacts a chain's rule sequence against a precomputed partition.
///
/// The input must include the chain-terminal default rule (every deployed
/// chain has one); it is split off first and re-appended unchanged.
///
/// # Errors
///
/// `Internal` if the chain is empty. `PartitionOutOfRange` never escapes:
/// an accept rule whose peer has no containing block is carried forward
/// verbatim instead of being merged or dropped.
pub fn compact_chain(rules: &[Rule], partitioner: &BlockPartitioner) -> Result<Compaction> {
    let (terminal, body) = rules
        .split_last()
        .ok_or_else(|| Error::Internal("cannot compact a chain with no terminal rule".to_string()))?;

    let mut denies: Vec<&Rule> = Vec::new();
    let mut accepts: Vec<&Rule> = Vec::new();
    let mut dropped_bypass = 0usize;

    for rule in body {
        match rule.classify() {
            RuleClass::Bypass => dropped_bypass += 1,
            RuleClass::Allow => accepts.push(rule),
            // Jump rules have no decision to merge on; they keep their slot
            // in the preserved sequence alongside the denies.
            RuleClass::Deny | RuleClass::Jump => denies.push(rule),
        }
    }

    let dominant = dominant_field(&accepts);

    // BTreeMap keys give the ascending-base block order for free.
    let mut groups: BTreeMap<AddressBlock, Vec<&Rule>> = BTreeMap::new();
    let mut carried: Vec<Rule> = Vec::new();

    for rule in &accepts {
        let Some(peer) = rule.peer(dominant) else {
            // Peerless accepts (other than the terminal) have nothing to
            // group on; keep them as they are.
            carried.push((*rule).clone());
            continue;
        };
        match partitioner.locate(peer.address()) {
            Ok(block) => groups.entry(block).or_default().push(rule),
            Err(Error::PartitionOutOfRange { addr }) => {
                warn!(%addr, "accept rule outside configured ranges, carrying forward unmerged");
                carried.push((*rule).clone());
            }
            Err(e) => return Err(e),
        }
    }

    let merged_blocks = groups.len();
    let mut out: Vec<Rule> = Vec::with_capacity(denies.len() + merged_blocks + carried.len() + 1);

    out.extend(denies.iter().map(|rule| (*rule).clone()));
    for (block, group) in groups {
        // Protocol and port come from the group's first rule, peer match
        // widens to the whole block.
        let mut representative = group[0].clone();
        representative.set_peer(dominant, block.into());
        out.push(representative);
    }
    out.extend(carried.iter().cloned());
    out.push(terminal.clone());

    debug!(
        before = rules.len(),
        after = out.len(),
        merged = merged_blocks,
        "chain compacted"
    );

    Ok(Compaction {
        dominant,
        denies: denies.len(),
        merged_blocks,
        carried_forward: carried.len(),
        dropped_bypass,
        rules: out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Decision, Protocol, RuleClass, Verdict};
    use crate::core::synth::BYPASS_SIGNATURE;
    use ipnetwork::Ipv4Network;

    fn partitioner() -> BlockPartitioner {
        let ranges: Vec<Ipv4Network> = vec!["10.0.0.0/24".parse().unwrap()];
        BlockPartitioner::new(&ranges, 30).unwrap()
    }

    fn host(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn accept(last: u8, port: u16) -> Rule {
        Rule::verdict(Decision::Accept)
            .with_src(host(last).into())
            .with_protocol(Protocol::Tcp)
            .with_port(port)
    }

    #[test]
    fn worked_example_single_slash_30() {
        // Peers 10.0.0.1-10.0.0.4; .1, .2 share the .0/30 block, .4 sits in
        // the .4/30 block, .3 is denied.
        let rules = vec![
            accept(1, 80),
            accept(2, 80),
            Rule::verdict(Decision::Drop)
                .with_src(host(3).into())
                .with_protocol(Protocol::Udp)
                .with_port(53),
            accept(4, 80),
            Rule::verdict(Decision::Accept).with_comment("chain default"),
        ];

        let compaction = compact_chain(&rules, &partitioner()).unwrap();
        let out = &compaction.rules;

        assert_eq!(out.len(), 4);
        // Deny first, untouched
        assert_eq!(out[0].verdict, Verdict::Decision(Decision::Drop));
        assert_eq!(out[0].src, Some(host(3).into()));
        // Merged accepts in ascending block order
        let block0: AddressBlock = "10.0.0.0/30".parse::<Ipv4Network>().unwrap().into();
        let block4: AddressBlock = "10.0.0.4/30".parse::<Ipv4Network>().unwrap().into();
        assert_eq!(out[1].src, Some(block0.into()));
        assert_eq!(out[1].port, Some(80));
        assert_eq!(out[2].src, Some(block4.into()));
        // Terminal preserved verbatim
        assert_eq!(out[3], rules[4]);

        assert_eq!(compaction.dominant, Field::Src);
        assert_eq!(compaction.merged_blocks, 2);
        assert_eq!(compaction.denies, 1);
    }

    #[test]
    fn deny_relative_order_is_preserved() {
        let rules = vec![
            Rule::verdict(Decision::Reject).with_src(host(9).into()),
            accept(1, 80),
            Rule::verdict(Decision::Drop).with_src(host(7).into()),
            accept(2, 80),
            Rule::verdict(Decision::Reject).with_src(host(5).into()),
            Rule::verdict(Decision::Accept),
        ];

        let out = compact_chain(&rules, &partitioner()).unwrap().rules;
        let deny_srcs: Vec<_> = out
            .iter()
            .filter(|r| r.classify() == RuleClass::Deny)
            .map(|r| r.src)
            .collect();
        assert_eq!(
            deny_srcs,
            vec![
                Some(host(9).into()),
                Some(host(7).into()),
                Some(host(5).into())
            ]
        );
        // All denies come before the first merged accept
        let first_allow = out
            .iter()
            .position(|r| r.classify() == RuleClass::Allow)
            .unwrap();
        let last_deny = out
            .iter()
            .rposition(|r| r.classify() == RuleClass::Deny)
            .unwrap();
        assert!(last_deny < first_allow);
    }

    #[test]
    fn bypass_rules_are_dropped() {
        let rules = vec![
            accept(1, 80),
            Rule::verdict(Decision::Return)
                .with_dst(host(1).into())
                .with_signature(BYPASS_SIGNATURE),
            Rule::verdict(Decision::Accept),
        ];

        let compaction = compact_chain(&rules, &partitioner()).unwrap();
        assert_eq!(compaction.dropped_bypass, 1);
        assert!(
            compaction
                .rules
                .iter()
                .all(|r| r.payload_signature.is_none())
        );
    }

    #[test]
    fn out_of_range_rule_is_carried_forward_not_dropped() {
        let rules = vec![
            accept(1, 80),
            accept(2, 80),
            Rule::verdict(Decision::Accept)
                .with_src(Ipv4Addr::new(172, 16, 0, 1).into())
                .with_protocol(Protocol::Tcp)
                .with_port(443),
            Rule::verdict(Decision::Accept),
        ];

        let compaction = compact_chain(&rules, &partitioner()).unwrap();
        assert_eq!(compaction.carried_forward, 1);
        assert_eq!(compaction.merged_blocks, 1);

        // The stray rule survives verbatim, after the merged accepts,
        // before the terminal.
        let out = &compaction.rules;
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].src, Some(Ipv4Addr::new(172, 16, 0, 1).into()));
        assert_eq!(out[1].port, Some(443));
    }

    #[test]
    fn reduction_bounded_by_distinct_blocks() {
        // 32 accepts across 8 /30 blocks
        let mut rules: Vec<Rule> = (1..=32).map(|i| accept(i, 8081)).collect();
        rules.push(Rule::verdict(Decision::Accept));

        let compaction = compact_chain(&rules, &partitioner()).unwrap();
        let allows = compaction
            .rules
            .iter()
            .filter(|r| r.classify() == RuleClass::Allow && r.src.is_some())
            .count();
        assert!(allows <= 9); // 1-32 spans 9 /30 blocks (.0 through .32)
        assert_eq!(compaction.carried_forward, 0);
    }

    #[test]
    fn compaction_is_idempotent() {
        let rules = vec![
            accept(1, 80),
            accept(2, 80),
            Rule::verdict(Decision::Drop).with_src(host(3).into()),
            accept(6, 80),
            Rule::verdict(Decision::Accept),
        ];

        let p = partitioner();
        let once = compact_chain(&rules, &p).unwrap().rules;
        let twice = compact_chain(&once, &p).unwrap().rules;
        assert_eq!(once, twice);
    }

    #[test]
    fn dominant_field_follows_the_varying_side() {
        // Egress-shaped chain: dst varies, src is the endpoint
        let endpoint = host(50);
        let rules = vec![
            Rule::verdict(Decision::Accept).with_dst(host(1).into()),
            Rule::verdict(Decision::Accept).with_dst(host(2).into()),
            Rule::verdict(Decision::Accept)
                .with_dst(host(3).into())
                .with_src(endpoint.into()),
            Rule::verdict(Decision::Accept),
        ];

        let compaction = compact_chain(&rules, &partitioner()).unwrap();
        assert_eq!(compaction.dominant, Field::Dst);
        // Merged rules widen dst, not src
        for rule in &compaction.rules[..compaction.rules.len() - 1] {
            assert!(matches!(
                rule.dst,
                Some(crate::core::model::PeerMatch::Block(_))
            ));
        }
    }

    #[test]
    fn terminal_rule_never_changes() {
        let terminal = Rule::verdict(Decision::Drop).with_comment("deployment default deny");
        let rules = vec![accept(1, 80), accept(2, 80), terminal.clone()];

        let out = compact_chain(&rules, &partitioner()).unwrap().rules;
        assert_eq!(out.last(), Some(&terminal));
    }

    #[test]
    fn empty_chain_is_an_error() {
        assert!(compact_chain(&[], &partitioner()).is_err());
    }

    #[test]
    fn peerless_accept_is_carried_forward() {
        let rules = vec![
            accept(1, 80),
            Rule::verdict(Decision::Accept).with_protocol(Protocol::Icmp),
            Rule::verdict(Decision::Accept),
        ];
        let compaction = compact_chain(&rules, &partitioner()).unwrap();
        assert_eq!(compaction.carried_forward, 1);
    }
}

//! Probabilistic per-endpoint chain synthesis
//!
//! Generates a plausible fine-grained ACL chain for one endpoint against a
//! peer population. The output is a workload generator: realistic enough
//! that compacting it tells us something, not a security policy anyone
//! authored on purpose.
//!
//! The random source is injected so tests can fix a seed and assert exact
//! rule sequences; production callers pass `rand::rng()`.

use crate::core::model::{Decision, Direction, Protocol, Rule};
use rand::Rng;
use rand::seq::IndexedRandom;
use std::net::Ipv4Addr;

/// Payload signature carried by bypass marker rules
pub const BYPASS_SIGNATURE: &str = "0x4000";

/// Protocols the synthesizer draws from (never `Any`)
const PROTOCOLS: [Protocol; 3] = [Protocol::Tcp, Protocol::Udp, Protocol::Icmp];

/// Knobs shared by every synthesized chain
#[derive(Debug, Clone, Copy)]
pub struct SynthParams<'a> {
    /// Candidate destination ports for TCP/UDP rules
    pub ports: &'a [u16],
    /// Verdict of the chain-terminal default rule
    pub default_decision: Decision,
}

fn pick_protocol<R: Rng>(rng: &mut R) -> Protocol {
    *PROTOCOLS.choose(rng).unwrap_or(&Protocol::Icmp)
}

fn pick_port<R: Rng>(rng: &mut R, ports: &[u16]) -> Option<u16> {
    ports.choose(rng).copied()
}

/// Sets the peer and endpoint sides of a rule for the given direction.
///
/// Ingress chains see the peer as source and the endpoint as destination;
/// egress chains are mirrored.
fn match_pair(rule: Rule, direction: Direction, peer: Ipv4Addr, endpoint: Ipv4Addr) -> Rule {
    match direction {
        Direction::Ingress => rule.with_src(peer.into()).with_dst(endpoint.into()),
        Direction::Egress => rule.with_dst(peer.into()).with_src(endpoint.into()),
    }
}

/// Sets only the peer side of a rule for the given direction
fn match_peer(rule: Rule, direction: Direction, peer: Ipv4Addr) -> Rule {
    match direction {
        Direction::Ingress => rule.with_src(peer.into()),
        Direction::Egress => rule.with_dst(peer.into()),
    }
}

/// Sets only the endpoint side of a rule for the given direction
fn match_endpoint(rule: Rule, direction: Direction, endpoint: Ipv4Addr) -> Rule {
    match direction {
        Direction::Ingress => rule.with_dst(endpoint.into()),
        Direction::Egress => rule.with_src(endpoint.into()),
    }
}

/// Synthesizes one direction-scoped chain for `endpoint`.
///
/// Per peer, two independent draws drive rule emission:
/// - r1 in [0.10, 0.20) adds a port-scoped Reject probe, r1 in [0.30, 0.40)
///   adds a Drop probe;
/// - r2 picks the peer's decision rule verdict (Accept 0.90, Drop 0.05,
///   Reject 0.05) and, above 0.85, appends a payload-signature Return rule
///   scoped to the endpoint itself.
///
/// The chain always closes with the configured default rule, so rule count
/// is O(peers) and lookup stays total.
pub fn synthesize_endpoint_chain<R: Rng>(
    rng: &mut R,
    endpoint: Ipv4Addr,
    peers: &[Ipv4Addr],
    direction: Direction,
    params: &SynthParams<'_>,
) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(peers.len() + 1);

    for &peer in peers {
        if peer == endpoint {
            continue;
        }

        let r1: f64 = rng.random();

        if (0.10..0.20).contains(&r1) {
            let protocol = pick_protocol(rng);
            let mut rule = match_pair(
                Rule::verdict(Decision::Reject).with_protocol(protocol),
                direction,
                peer,
                endpoint,
            );
            if protocol.is_port_aware()
                && let Some(port) = pick_port(rng, params.ports)
            {
                rule = rule.with_port(port);
            }
            rules.push(rule);
        }

        if (0.30..0.40).contains(&r1) {
            let protocol = pick_protocol(rng);
            rules.push(match_pair(
                Rule::verdict(Decision::Drop).with_protocol(protocol),
                direction,
                peer,
                endpoint,
            ));
        }

        // Every peer gets exactly one decision rule, matched on the peer
        // side only so the compactor has a single address dimension to vote
        // on.
        let protocol = pick_protocol(rng);
        let r2: f64 = rng.random();
        let decision = if r2 < 0.90 {
            Decision::Accept
        } else if r2 < 0.95 {
            Decision::Drop
        } else {
            Decision::Reject
        };

        let mut rule = match_peer(
            Rule::verdict(decision).with_protocol(protocol),
            direction,
            peer,
        );
        if decision != Decision::Accept
            && protocol.is_port_aware()
            && let Some(port) = pick_port(rng, params.ports)
        {
            rule = rule.with_port(port);
        }
        rules.push(rule);

        if r2 > 0.85 {
            rules.push(
                match_endpoint(Rule::verdict(Decision::Return), direction, endpoint)
                    .with_signature(BYPASS_SIGNATURE),
            );
        }
    }

    rules.push(
        Rule::verdict(params.default_decision).with_comment("chain default"),
    );
    rules
}

//! Integration tests for podwall
//!
//! These tests drive the full initialize/optimize/clear protocol against
//! the in-memory sink, the same code path `--dry-run` exercises. No
//! privileges and no kernel are involved.
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use podwall::config::DeployConfig;
use podwall::core::apply::{
    self, EGRESS_CHAIN, ENDPOINT_CHAIN_PREFIX, FORWARD_CHAIN, INGRESS_CHAIN, PARENT_CHAIN,
    endpoint_chain_name,
};
use podwall::core::sink::{MemorySink, PolicySink, TargetSpec};
use podwall::{Decision, Direction};
use ipnetwork::Ipv4Network;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::net::Ipv4Addr;

fn test_config() -> DeployConfig {
    DeployConfig {
        endpoint_cidr: "10.244.0.0/24".parse().unwrap(),
        block_prefix: 30,
        pacing_ms: 0,
        ..DeployConfig::default()
    }
}

fn test_pods(count: u8) -> Vec<Ipv4Addr> {
    (1..=count).map(|i| Ipv4Addr::new(10, 244, 0, i)).collect()
}

fn node_ranges(cfg: &DeployConfig) -> Vec<Ipv4Network> {
    vec![cfg.endpoint_cidr]
}

#[tokio::test]
async fn full_lifecycle_init_optimize_clear() {
    let mut sink = MemorySink::new();
    let mut rng = StdRng::seed_from_u64(1);
    let cfg = test_config();
    let pods = test_pods(25);

    // init: full hierarchy comes up
    let init = apply::initialize(&mut sink, &mut rng, &cfg, &pods)
        .await
        .unwrap();
    assert_eq!(init.endpoints, 25);
    assert_eq!(init.skipped, 0);

    let chains = sink.list_chains().await.unwrap();
    assert!(chains.contains(&PARENT_CHAIN.to_string()));
    assert!(chains.contains(&INGRESS_CHAIN.to_string()));
    assert!(chains.contains(&EGRESS_CHAIN.to_string()));
    assert_eq!(
        chains
            .iter()
            .filter(|c| c.starts_with(ENDPOINT_CHAIN_PREFIX))
            .count(),
        50
    );

    // optimize: every endpoint chain shrinks, terminals survive
    let opt = apply::optimize(&mut sink, &cfg, &node_ranges(&cfg))
        .await
        .unwrap();
    assert_eq!(opt.chains, 50);
    assert!(opt.rules_after < opt.rules_before);

    // clear: nothing of ours is left behind
    let cleared = apply::clear(&mut sink).await.unwrap();
    assert_eq!(cleared.chains_deleted, 53);
    let chains = sink.list_chains().await.unwrap();
    assert_eq!(chains, vec![FORWARD_CHAIN.to_string()]);
    assert!(sink.chain_rules(FORWARD_CHAIN).unwrap().is_empty());
}

#[tokio::test]
async fn forward_wiring_points_into_the_hierarchy() {
    let mut sink = MemorySink::new();
    let mut rng = StdRng::seed_from_u64(2);
    let cfg = test_config();

    apply::initialize(&mut sink, &mut rng, &cfg, &test_pods(3))
        .await
        .unwrap();

    // FORWARD -> podwall, scoped both ways to the endpoint range
    let forward = sink.chain_rules(FORWARD_CHAIN).unwrap();
    let wire = &forward[0];
    assert_eq!(wire.jump_target(), Some(PARENT_CHAIN));
    assert_eq!(wire.src, Some(cfg.endpoint_cidr));
    assert_eq!(wire.dst, Some(cfg.endpoint_cidr));

    // podwall dispatches by direction
    let parent = sink.chain_rules(PARENT_CHAIN).unwrap();
    assert_eq!(parent.len(), 2);
    assert_eq!(parent[0].jump_target(), Some(INGRESS_CHAIN));
    assert_eq!(parent[0].dst, Some(cfg.endpoint_cidr));
    assert_eq!(parent[1].jump_target(), Some(EGRESS_CHAIN));
    assert_eq!(parent[1].src, Some(cfg.endpoint_cidr));
}

#[tokio::test]
async fn dispatch_jumps_are_scoped_per_pod() {
    let mut sink = MemorySink::new();
    let mut rng = StdRng::seed_from_u64(3);
    let cfg = test_config();
    let pods = test_pods(4);

    apply::initialize(&mut sink, &mut rng, &cfg, &pods)
        .await
        .unwrap();

    let ingress = sink.chain_rules(INGRESS_CHAIN).unwrap();
    for (rule, &pod) in ingress.iter().zip(&pods) {
        assert_eq!(
            rule.jump_target(),
            Some(endpoint_chain_name(Direction::Ingress, pod).as_str())
        );
        assert_eq!(rule.dst, Some(Ipv4Network::from(pod)));
        assert_eq!(rule.comment.as_deref(), Some(format!("Pod: {pod}").as_str()));
    }

    let egress = sink.chain_rules(EGRESS_CHAIN).unwrap();
    for (rule, &pod) in egress.iter().zip(&pods) {
        assert_eq!(rule.src, Some(Ipv4Network::from(pod)));
    }
}

#[tokio::test]
async fn partial_failure_leaves_the_rest_of_the_fleet_managed() {
    let mut sink = MemorySink::new();
    let cfg = test_config();
    let pods = test_pods(8);
    let victim = pods[3];
    sink.reject_create(&endpoint_chain_name(Direction::Egress, victim));

    let mut rng = StdRng::seed_from_u64(4);
    let summary = apply::initialize(&mut sink, &mut rng, &cfg, &pods)
        .await
        .unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.endpoints, 7);

    // The surviving endpoints still optimize and clear normally
    let opt = apply::optimize(&mut sink, &cfg, &node_ranges(&cfg))
        .await
        .unwrap();
    assert!(opt.chains >= 14);

    apply::clear(&mut sink).await.unwrap();
    assert_eq!(
        sink.list_chains().await.unwrap(),
        vec![FORWARD_CHAIN.to_string()]
    );
}

#[tokio::test]
async fn optimized_chains_keep_denies_ahead_and_terminals_last() {
    let mut sink = MemorySink::new();
    let mut rng = StdRng::seed_from_u64(5);
    let cfg = test_config();
    let pods = test_pods(60);

    apply::initialize(&mut sink, &mut rng, &cfg, &pods)
        .await
        .unwrap();
    apply::optimize(&mut sink, &cfg, &node_ranges(&cfg))
        .await
        .unwrap();

    for &pod in &pods {
        for direction in [Direction::Ingress, Direction::Egress] {
            let rules = sink
                .chain_rules(&endpoint_chain_name(direction, pod))
                .unwrap();

            let terminal = rules.last().unwrap();
            assert_eq!(terminal.target, TargetSpec::Verdict(Decision::Accept));
            assert!(terminal.src.is_none() && terminal.dst.is_none());

            // Once accepts start, no deny follows
            let body = &rules[..rules.len() - 1];
            let first_accept = body
                .iter()
                .position(|r| r.target == TargetSpec::Verdict(Decision::Accept))
                .unwrap_or(body.len());
            for rule in &body[first_accept..] {
                assert_ne!(rule.target, TargetSpec::Verdict(Decision::Drop));
                assert_ne!(rule.target, TargetSpec::Verdict(Decision::Reject));
            }

            // Bypass markers never survive optimization
            assert!(rules.iter().all(|r| r.payload_signature.is_none()));
        }
    }
}

#[tokio::test]
async fn reinitialize_rebuilds_without_accumulating_state() {
    let mut sink = MemorySink::new();
    let cfg = test_config();
    let pods = test_pods(10);

    let mut rng = StdRng::seed_from_u64(6);
    apply::initialize(&mut sink, &mut rng, &cfg, &pods)
        .await
        .unwrap();
    apply::optimize(&mut sink, &cfg, &node_ranges(&cfg))
        .await
        .unwrap();

    // Second init replaces the optimized chains with fresh synthesis
    let mut rng = StdRng::seed_from_u64(7);
    apply::initialize(&mut sink, &mut rng, &cfg, &pods)
        .await
        .unwrap();

    let chains = sink.list_chains().await.unwrap();
    assert_eq!(
        chains
            .iter()
            .filter(|c| c.starts_with(ENDPOINT_CHAIN_PREFIX))
            .count(),
        20
    );
    let forward = sink.chain_rules(FORWARD_CHAIN).unwrap();
    assert_eq!(
        forward
            .iter()
            .filter(|r| r.jump_target() == Some(PARENT_CHAIN))
            .count(),
        1
    );
    let ingress = sink.chain_rules(INGRESS_CHAIN).unwrap();
    assert_eq!(ingress.len(), pods.len() + 1);
}

#[tokio::test]
async fn optimize_against_partial_ranges_carries_outsiders_forward() {
    let mut sink = MemorySink::new();
    let mut rng = StdRng::seed_from_u64(8);
    let cfg = test_config();
    let pods = test_pods(30);

    apply::initialize(&mut sink, &mut rng, &cfg, &pods)
        .await
        .unwrap();

    // Ranges cover only the bottom half of the pod addresses
    let narrow: Vec<Ipv4Network> = vec!["10.244.0.0/28".parse().unwrap()];
    let summary = apply::optimize(&mut sink, &cfg, &narrow).await.unwrap();
    assert_eq!(summary.skipped, 0);

    // Out-of-range peers keep exact host-scoped accepts: only addresses
    // inside the configured ranges may be widened to blocks.
    let covered: Ipv4Network = "10.244.0.0/28".parse().unwrap();
    for &pod in &pods {
        let rules = sink
            .chain_rules(&endpoint_chain_name(Direction::Ingress, pod))
            .unwrap();
        for rule in rules {
            if rule.target != TargetSpec::Verdict(Decision::Accept) {
                continue;
            }
            if let Some(src) = rule.src
                && !covered.contains(src.ip())
            {
                assert_eq!(src.prefix(), 32, "outsider {src} was widened");
            }
        }
    }
}

//! Transactional apply protocol
//!
//! The three deployment operations, each expressed against an abstract
//! [`PolicySink`]: `initialize` builds the chain hierarchy and synthesizes
//! per-endpoint chains, `optimize` rewrites deployed chains through the
//! compactor, and `clear` tears the whole hierarchy down.
//!
//! Mutations are grouped into batches via [`in_transaction`]; a failed
//! batch is aborted and the affected endpoint is skipped rather than
//! failing the whole run. Consecutive endpoint batches are paced by the
//! configured delay so a large deployment does not monopolize the sink.

use crate::config::DeployConfig;
use crate::core::compact;
use crate::core::error::{Error, Result};
use crate::core::model::{Decision, Direction, Rule, Table};
use crate::core::partition::BlockPartitioner;
use crate::core::sink::{PolicySink, RuleSpec, TargetSpec};
use crate::core::synth::{SynthParams, synthesize_endpoint_chain};
use ipnetwork::Ipv4Network;
use rand::Rng;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Root chain every deployment-owned rule hangs off
pub const PARENT_CHAIN: &str = "podwall";
/// Dispatch chain for traffic arriving at endpoints
pub const INGRESS_CHAIN: &str = "podwall-ingress";
/// Dispatch chain for traffic leaving endpoints
pub const EGRESS_CHAIN: &str = "podwall-egress";
/// Built-in chain the root chain is wired into
pub const FORWARD_CHAIN: &str = "FORWARD";
/// Name prefix shared by all per-endpoint chains
pub const ENDPOINT_CHAIN_PREFIX: &str = "ep-";

/// Per-endpoint chain name: `ep-{in|out}-{address with dots as dashes}`
pub fn endpoint_chain_name(direction: Direction, addr: Ipv4Addr) -> String {
    format!(
        "{ENDPOINT_CHAIN_PREFIX}{}-{}",
        direction.tag(),
        addr.to_string().replace('.', "-")
    )
}

/// Runs `body` inside a sink batch.
///
/// Commit and refresh happen only when the body succeeds; any error aborts
/// the batch so no buffered work leaks into the next one.
pub async fn in_transaction<S, T, F>(sink: &mut S, body: F) -> Result<T>
where
    S: PolicySink,
    F: AsyncFnOnce(&mut S) -> Result<T>,
{
    sink.begin_batch().await?;
    match body(sink).await {
        Ok(value) => {
            sink.commit().await?;
            sink.refresh().await?;
            Ok(value)
        }
        Err(e) => {
            sink.abort_batch().await?;
            Err(e)
        }
    }
}

async fn pace(cfg: &DeployConfig) {
    if cfg.pacing_ms > 0 {
        tokio::time::sleep(Duration::from_millis(cfg.pacing_ms)).await;
    }
}

fn jump_spec(target: &str) -> RuleSpec {
    RuleSpec {
        src: None,
        dst: None,
        protocol: crate::core::model::Protocol::Any,
        port: None,
        payload_signature: None,
        target: TargetSpec::Jump(target.to_string()),
        comment: None,
    }
}

/// What `initialize` did, for the operator log
#[derive(Debug, Default, Clone, Copy)]
pub struct InitSummary {
    pub endpoints: usize,
    pub chains_created: usize,
    pub rules_applied: usize,
    pub skipped: usize,
}

/// What `optimize` did, for the operator log
#[derive(Debug, Default, Clone, Copy)]
pub struct OptimizeSummary {
    pub chains: usize,
    pub rules_before: usize,
    pub rules_after: usize,
    pub skipped: usize,
}

/// What `clear` did, for the operator log
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearSummary {
    pub chains_deleted: usize,
    pub rules_deleted: usize,
}

/// Tears down any per-endpoint chains left by an earlier run.
///
/// The dispatch chains are flushed first so the endpoint chains are no
/// longer referenced when their deletes land.
async fn remove_stale_endpoint_chains<S: PolicySink>(sink: &mut S) -> Result<usize> {
    let chains = sink.list_chains().await?;
    let stale: Vec<String> = chains
        .into_iter()
        .filter(|name| name.starts_with(ENDPOINT_CHAIN_PREFIX))
        .collect();
    if stale.is_empty() {
        return Ok(0);
    }

    let count = stale.len();
    in_transaction(sink, async |sink| {
        sink.flush_chain(INGRESS_CHAIN).await?;
        sink.flush_chain(EGRESS_CHAIN).await?;
        for name in &stale {
            sink.flush_chain(name).await?;
            sink.delete_chain(name).await?;
        }
        Ok(())
    })
    .await?;

    debug!(count, "removed stale endpoint chains");
    Ok(count)
}

/// Builds one direction-scoped chain for an endpoint and wires its
/// dispatch jump. One batch per chain, matching the blast radius of a
/// single endpoint.
async fn deploy_endpoint_chain<S: PolicySink, R: Rng>(
    sink: &mut S,
    rng: &mut R,
    cfg: &DeployConfig,
    endpoint: Ipv4Addr,
    peers: &[Ipv4Addr],
    direction: Direction,
) -> Result<usize> {
    let chain = endpoint_chain_name(direction, endpoint);
    let params = SynthParams {
        ports: &cfg.candidate_ports,
        default_decision: cfg.default_decision,
    };
    let rules = synthesize_endpoint_chain(rng, endpoint, peers, direction, &params);

    // Synthesized rules carry no jumps, so an empty table suffices for
    // wire encoding.
    let table = Table::new();
    let mut specs = Vec::with_capacity(rules.len());
    for rule in &rules {
        specs.push(rule.to_spec(&table)?);
    }

    let dispatch_chain = match direction {
        Direction::Ingress => INGRESS_CHAIN,
        Direction::Egress => EGRESS_CHAIN,
    };
    let mut dispatch = jump_spec(&chain);
    let host = Ipv4Network::from(endpoint);
    match direction {
        Direction::Ingress => dispatch.dst = Some(host),
        Direction::Egress => dispatch.src = Some(host),
    }
    dispatch.comment = Some(format!("Pod: {endpoint}"));

    let applied = specs.len() + 1;
    in_transaction(sink, async |sink| {
        sink.create_chain(&chain).await?;
        for spec in specs {
            sink.append_rule(&chain, spec).await?;
        }
        sink.append_rule(dispatch_chain, dispatch).await?;
        Ok(())
    })
    .await?;

    Ok(applied)
}

/// Builds the full chain hierarchy and synthesizes a pair of chains per
/// endpoint.
///
/// Re-running is safe: stale endpoint chains from an earlier run are torn
/// down first and the FORWARD wiring is only inserted once. An endpoint
/// whose batch fails is logged and skipped; the rest of the run proceeds.
pub async fn initialize<S: PolicySink, R: Rng>(
    sink: &mut S,
    rng: &mut R,
    cfg: &DeployConfig,
    pods: &[Ipv4Addr],
) -> Result<InitSummary> {
    let mut summary = InitSummary::default();

    let existing = sink.list_chains().await?;
    let missing: Vec<&str> = [PARENT_CHAIN, INGRESS_CHAIN, EGRESS_CHAIN]
        .into_iter()
        .filter(|name| !existing.iter().any(|c| c == name))
        .collect();
    if !missing.is_empty() {
        in_transaction(sink, async |sink| {
            for name in &missing {
                sink.create_chain(name).await?;
            }
            Ok(())
        })
        .await?;
        summary.chains_created += missing.len();
    }

    remove_stale_endpoint_chains(sink).await?;

    // Root wiring: endpoint-bound traffic goes to ingress dispatch,
    // endpoint-originated traffic to egress dispatch.
    let forward_rules = sink.list_rules(FORWARD_CHAIN).await?;
    let forward_wired = forward_rules
        .iter()
        .any(|rule| rule.jump_target() == Some(PARENT_CHAIN));
    in_transaction(sink, async |sink| {
        sink.flush_chain(PARENT_CHAIN).await?;

        let mut to_ingress = jump_spec(INGRESS_CHAIN);
        to_ingress.dst = Some(cfg.endpoint_cidr);
        sink.append_rule(PARENT_CHAIN, to_ingress).await?;
        summary.rules_applied += 1;

        let mut to_egress = jump_spec(EGRESS_CHAIN);
        to_egress.src = Some(cfg.endpoint_cidr);
        sink.append_rule(PARENT_CHAIN, to_egress).await?;
        summary.rules_applied += 1;

        if !forward_wired {
            let mut to_parent = jump_spec(PARENT_CHAIN);
            to_parent.src = Some(cfg.endpoint_cidr);
            to_parent.dst = Some(cfg.endpoint_cidr);
            sink.insert_rule(FORWARD_CHAIN, 0, to_parent).await?;
            summary.rules_applied += 1;
        }
        Ok(())
    })
    .await?;

    for &endpoint in pods {
        let mut failed = false;
        for direction in [Direction::Ingress, Direction::Egress] {
            match deploy_endpoint_chain(sink, rng, cfg, endpoint, pods, direction).await {
                Ok(applied) => {
                    summary.chains_created += 1;
                    summary.rules_applied += applied;
                }
                Err(e) => {
                    warn!(%endpoint, %direction, error = %e, "endpoint deployment failed, skipping");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            summary.skipped += 1;
        } else {
            summary.endpoints += 1;
        }
        pace(cfg).await;
    }

    // Dispatch chains stay total: anything no endpoint chain claimed falls
    // through to an explicit default.
    in_transaction(sink, async |sink| {
        for chain in [INGRESS_CHAIN, EGRESS_CHAIN] {
            sink.append_rule(
                chain,
                Rule::verdict(Decision::Accept)
                    .with_comment("dispatch default")
                    .to_spec(&Table::new())?,
            )
            .await?;
            summary.rules_applied += 1;
        }
        Ok(())
    })
    .await?;

    info!(
        endpoints = summary.endpoints,
        chains = summary.chains_created,
        rules = summary.rules_applied,
        skipped = summary.skipped,
        "initialization complete"
    );
    Ok(summary)
}

/// Rebuilds a [`Table`] view of the deployed ruleset.
///
/// Chains are registered first so jump targets resolve regardless of the
/// order the sink lists them in.
pub async fn sync_table<S: PolicySink>(sink: &mut S) -> Result<Table> {
    let names = sink.list_chains().await?;
    let mut table = Table::new();
    for name in &names {
        let direction = if name.starts_with("ep-in-") {
            Some(Direction::Ingress)
        } else if name.starts_with("ep-out-") {
            Some(Direction::Egress)
        } else {
            None
        };
        table.ensure_chain(name, direction);
    }
    for name in &names {
        let specs = sink.list_rules(name).await?;
        let mut rules = Vec::with_capacity(specs.len());
        for spec in &specs {
            rules.push(Rule::from_spec(spec, &table)?);
        }
        let id = table
            .chain_id(name)
            .ok_or_else(|| Error::UnknownChain { name: name.clone() })?;
        if let Some(chain) = table.chain_mut(id) {
            chain.rewrite(rules);
        }
    }
    Ok(table)
}

/// Compacts every deployed per-endpoint chain in place.
///
/// Chains are rewritten one batch per chain; a chain whose decode,
/// compaction or rewrite fails is logged and left as deployed.
pub async fn optimize<S: PolicySink>(
    sink: &mut S,
    cfg: &DeployConfig,
    node_ranges: &[Ipv4Network],
) -> Result<OptimizeSummary> {
    let partitioner = BlockPartitioner::new(node_ranges, cfg.block_prefix)?;
    let table = sync_table(sink).await?;

    let targets: Vec<String> = table
        .chains()
        .filter(|(_, chain)| chain.name().starts_with(ENDPOINT_CHAIN_PREFIX))
        .map(|(_, chain)| chain.name().to_string())
        .collect();

    let mut summary = OptimizeSummary::default();
    for name in targets {
        let id = table
            .chain_id(&name)
            .ok_or_else(|| Error::UnknownChain { name: name.clone() })?;
        let chain = table
            .chain(id)
            .ok_or_else(|| Error::UnknownChain { name: name.clone() })?;

        let before = chain.len();
        let result = match compact::compact_chain(chain.rules(), &partitioner) {
            Ok(compaction) => compaction,
            Err(e) => {
                warn!(chain = %name, error = %e, "compaction failed, leaving chain as deployed");
                summary.skipped += 1;
                continue;
            }
        };

        let mut specs = Vec::with_capacity(result.rules.len());
        let mut encode_ok = true;
        for rule in &result.rules {
            match rule.to_spec(&table) {
                Ok(spec) => specs.push(spec),
                Err(e) => {
                    warn!(chain = %name, error = %e, "encode failed, leaving chain as deployed");
                    encode_ok = false;
                    break;
                }
            }
        }
        if !encode_ok {
            summary.skipped += 1;
            continue;
        }

        let after = specs.len();
        let rewrite = in_transaction(sink, async |sink| {
            sink.flush_chain(&name).await?;
            for spec in specs {
                sink.append_rule(&name, spec).await?;
            }
            Ok(())
        })
        .await;

        match rewrite {
            Ok(()) => {
                debug!(
                    chain = %name,
                    before,
                    after,
                    dominant = ?result.dominant,
                    merged = result.merged_blocks,
                    "chain rewritten"
                );
                summary.chains += 1;
                summary.rules_before += before;
                summary.rules_after += after;
            }
            Err(e) => {
                warn!(chain = %name, error = %e, "rewrite failed, skipping chain");
                summary.skipped += 1;
            }
        }
        pace(cfg).await;
    }

    info!(
        chains = summary.chains,
        before = summary.rules_before,
        after = summary.rules_after,
        skipped = summary.skipped,
        "optimization complete"
    );
    Ok(summary)
}

/// Removes every chain and rule this tool owns.
///
/// Jump references into the hierarchy are deleted first (including the
/// FORWARD wiring), then the chains themselves, leaves before roots.
pub async fn clear<S: PolicySink>(sink: &mut S) -> Result<ClearSummary> {
    let mut summary = ClearSummary::default();
    let chains = sink.list_chains().await?;

    let owned = |name: &str| {
        name.starts_with(ENDPOINT_CHAIN_PREFIX)
            || name == PARENT_CHAIN
            || name == INGRESS_CHAIN
            || name == EGRESS_CHAIN
    };

    // Drop external references (FORWARD -> parent, plus anything stray)
    // before flushing the hierarchy itself.
    for name in &chains {
        if owned(name) {
            continue;
        }
        let rules = sink.list_rules(name).await?;
        for rule in rules {
            if rule.jump_target().is_some_and(owned) {
                sink.delete_rule(name, &rule).await?;
                summary.rules_deleted += 1;
            }
        }
    }

    let endpoint_chains: Vec<&String> = chains
        .iter()
        .filter(|name| name.starts_with(ENDPOINT_CHAIN_PREFIX))
        .collect();

    in_transaction(sink, async |sink| {
        for name in [PARENT_CHAIN, INGRESS_CHAIN, EGRESS_CHAIN] {
            if chains.iter().any(|c| c == name) {
                sink.flush_chain(name).await?;
            }
        }
        for name in &endpoint_chains {
            sink.flush_chain(name).await?;
            sink.delete_chain(name).await?;
            summary.chains_deleted += 1;
        }
        for name in [INGRESS_CHAIN, EGRESS_CHAIN, PARENT_CHAIN] {
            if chains.iter().any(|c| c == name) {
                sink.delete_chain(name).await?;
                summary.chains_deleted += 1;
            }
        }
        Ok(())
    })
    .await?;

    info!(
        chains = summary.chains_deleted,
        rules = summary.rules_deleted,
        "teardown complete"
    );
    Ok(summary)
}

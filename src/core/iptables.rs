//! iptables-backed packet-filter sink
//!
//! [`ExecSink`] talks to the kernel through the `iptables` userland tools.
//! Batched mutations are rendered into a single `iptables-restore
//! --noflush` payload and piped over stdin in one child process per commit;
//! unbatched operations and reads shell out to `iptables` directly.
//!
//! The binary path comes from configuration and can be overridden at
//! runtime with the `PODWALL_IPTABLES` environment variable, which is also
//! how the test suite points the sink at a mock script.

use crate::core::error::{Error, Result};
use crate::core::model::{Decision, Protocol};
use crate::core::sink::{PolicySink, RuleSpec, TargetSpec};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

/// Environment variable overriding the configured iptables path
pub const IPTABLES_ENV: &str = "PODWALL_IPTABLES";

#[derive(Debug, Clone)]
enum Op {
    Create(String),
    Delete(String),
    Flush(String),
    Append(String, RuleSpec),
    Insert(String, usize, RuleSpec),
    DeleteRule(String, RuleSpec),
}

/// Sink implementation backed by the iptables userland tools
#[derive(Debug)]
pub struct ExecSink {
    program: String,
    buffering: bool,
    pending: Vec<Op>,
}

impl ExecSink {
    pub fn new(iptables_path: &str) -> Self {
        let program = std::env::var(IPTABLES_ENV).unwrap_or_else(|_| iptables_path.to_string());
        Self {
            program,
            buffering: false,
            pending: Vec::new(),
        }
    }

    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<String> {
        debug!(program, ?args, "exec");
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            error!("failed to spawn {program}: {e}");
            Error::Transaction {
                message: format!("failed to spawn {program}: {e}"),
            }
        })?;

        if let Some(payload) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(payload.as_bytes()).await?;
        } else {
            drop(child.stdin.take());
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::SinkRejected {
                chain: args.get(2).cloned().unwrap_or_default(),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    async fn run_iptables(&self, args: &[String]) -> Result<String> {
        let mut full = vec!["-w".to_string()];
        full.extend_from_slice(args);
        self.run(&self.program, &full, None).await
    }

    fn op_args(op: &Op) -> Vec<String> {
        match op {
            Op::Create(name) => vec!["-N".to_string(), name.clone()],
            Op::Delete(name) => vec!["-X".to_string(), name.clone()],
            Op::Flush(name) => vec!["-F".to_string(), name.clone()],
            Op::Append(chain, rule) => {
                let mut args = vec!["-A".to_string(), chain.clone()];
                args.extend(spec_args(rule));
                args
            }
            Op::Insert(chain, index, rule) => {
                // iptables rule indices are 1-based
                let mut args = vec!["-I".to_string(), chain.clone(), (index + 1).to_string()];
                args.extend(spec_args(rule));
                args
            }
            Op::DeleteRule(chain, rule) => {
                let mut args = vec!["-D".to_string(), chain.clone()];
                args.extend(spec_args(rule));
                args
            }
        }
    }

    /// Renders the pending batch as an `iptables-restore --noflush` payload.
    ///
    /// Chain declarations must precede rule commands within a payload, so
    /// creates are hoisted to the top; everything else keeps its order.
    fn restore_payload(&self) -> String {
        let mut out = String::from("*filter\n");
        for op in &self.pending {
            if let Op::Create(name) = op {
                out.push_str(&format!(":{name} - [0:0]\n"));
            }
        }
        for op in &self.pending {
            if matches!(op, Op::Create(_)) {
                continue;
            }
            out.push_str(&shell_join(&Self::op_args(op)));
            out.push('\n');
        }
        out.push_str("COMMIT\n");
        out
    }
}

/// Translates a wire rule into iptables match arguments
pub(crate) fn spec_args(rule: &RuleSpec) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(src) = rule.src {
        args.push("-s".to_string());
        args.push(src.to_string());
    }
    if let Some(dst) = rule.dst {
        args.push("-d".to_string());
        args.push(dst.to_string());
    }
    if rule.protocol != Protocol::Any {
        args.push("-p".to_string());
        args.push(rule.protocol.as_str().to_string());
    }
    if let Some(port) = rule.port
        && rule.protocol.is_port_aware()
    {
        args.push("--dport".to_string());
        args.push(port.to_string());
    }
    if let Some(signature) = &rule.payload_signature {
        args.extend([
            "-m".to_string(),
            "string".to_string(),
            "--string".to_string(),
            signature.clone(),
            "--algo".to_string(),
            "bm".to_string(),
        ]);
    }
    if let Some(comment) = &rule.comment {
        args.extend([
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            comment.clone(),
        ]);
    }
    args.push("-j".to_string());
    args.push(match &rule.target {
        TargetSpec::Verdict(decision) => decision.as_str().to_uppercase(),
        TargetSpec::Jump(name) => name.clone(),
    });
    args
}

/// Joins arguments into one restore line, quoting anything with whitespace
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.contains(char::is_whitespace) || arg.is_empty() {
                format!("\"{}\"", arg.replace('"', "\\\""))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits an `iptables -S` line into tokens, honoring double quotes
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parses one `-A <chain> ...` line from `iptables -S` output.
///
/// Unknown matches are skipped rather than rejected: the kernel ruleset
/// may contain modules this model does not care about.
pub(crate) fn parse_rule_line(line: &str) -> Option<RuleSpec> {
    let tokens = tokenize(line);
    if tokens.len() < 2 || tokens[0] != "-A" {
        return None;
    }

    let mut spec = RuleSpec {
        src: None,
        dst: None,
        protocol: Protocol::Any,
        port: None,
        payload_signature: None,
        target: TargetSpec::Verdict(Decision::Accept),
        comment: None,
    };
    let mut saw_target = false;

    let mut iter = tokens[2..].iter();
    while let Some(token) = iter.next() {
        match token.as_str() {
            "-s" => spec.src = iter.next().and_then(|v| v.parse().ok()),
            "-d" => spec.dst = iter.next().and_then(|v| v.parse().ok()),
            "-p" => {
                if let Some(value) = iter.next() {
                    spec.protocol = value.parse().unwrap_or(Protocol::Any);
                }
            }
            "--dport" => spec.port = iter.next().and_then(|v| v.parse().ok()),
            "--string" => spec.payload_signature = iter.next().cloned(),
            "--comment" => spec.comment = iter.next().cloned(),
            "-j" => {
                if let Some(value) = iter.next() {
                    spec.target = value
                        .to_lowercase()
                        .parse::<Decision>()
                        .map_or_else(|_| TargetSpec::Jump(value.clone()), TargetSpec::Verdict);
                    saw_target = true;
                }
            }
            // Module loaders and their leftovers (-m string --algo bm, -m
            // comment) carry no matching semantics of their own.
            "-m" | "--algo" => {
                iter.next();
            }
            _ => {}
        }
    }

    saw_target.then_some(spec)
}

impl PolicySink for ExecSink {
    async fn list_chains(&mut self) -> Result<Vec<String>> {
        let output = self.run_iptables(&["-S".to_string()]).await?;
        let mut chains = Vec::new();
        for line in output.lines() {
            let tokens = tokenize(line);
            if tokens.len() >= 2 && (tokens[0] == "-N" || tokens[0] == "-P") {
                chains.push(tokens[1].clone());
            }
        }
        Ok(chains)
    }

    async fn create_chain(&mut self, name: &str) -> Result<()> {
        let op = Op::Create(name.to_string());
        if self.buffering {
            self.pending.push(op);
            Ok(())
        } else {
            self.run_iptables(&ExecSink::op_args(&op)).await.map(|_| ())
        }
    }

    async fn delete_chain(&mut self, name: &str) -> Result<()> {
        let op = Op::Delete(name.to_string());
        if self.buffering {
            self.pending.push(op);
            Ok(())
        } else {
            self.run_iptables(&ExecSink::op_args(&op)).await.map(|_| ())
        }
    }

    async fn flush_chain(&mut self, name: &str) -> Result<()> {
        let op = Op::Flush(name.to_string());
        if self.buffering {
            self.pending.push(op);
            Ok(())
        } else {
            self.run_iptables(&ExecSink::op_args(&op)).await.map(|_| ())
        }
    }

    async fn append_rule(&mut self, chain: &str, rule: RuleSpec) -> Result<()> {
        let op = Op::Append(chain.to_string(), rule);
        if self.buffering {
            self.pending.push(op);
            Ok(())
        } else {
            self.run_iptables(&ExecSink::op_args(&op)).await.map(|_| ())
        }
    }

    async fn insert_rule(&mut self, chain: &str, index: usize, rule: RuleSpec) -> Result<()> {
        let op = Op::Insert(chain.to_string(), index, rule);
        if self.buffering {
            self.pending.push(op);
            Ok(())
        } else {
            self.run_iptables(&ExecSink::op_args(&op)).await.map(|_| ())
        }
    }

    async fn delete_rule(&mut self, chain: &str, rule: &RuleSpec) -> Result<()> {
        let op = Op::DeleteRule(chain.to_string(), rule.clone());
        if self.buffering {
            self.pending.push(op);
            Ok(())
        } else {
            self.run_iptables(&ExecSink::op_args(&op)).await.map(|_| ())
        }
    }

    async fn list_rules(&mut self, chain: &str) -> Result<Vec<RuleSpec>> {
        let output = self
            .run_iptables(&["-S".to_string(), chain.to_string()])
            .await?;
        Ok(output.lines().filter_map(parse_rule_line).collect())
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
        self.buffering = false;
        if self.pending.is_empty() {
            return Ok(());
        }
        let payload = self.restore_payload();
        self.pending.clear();

        let restore = format!("{}-restore", self.program);
        self.run(&restore, &["--noflush".to_string()], Some(&payload))
            .await
            .map(|_| ())
            .map_err(|e| Error::Transaction {
                message: format!("restore commit failed: {e}"),
            })
    }

    async fn abort_batch(&mut self) -> Result<()> {
        self.buffering = false;
        self.pending.clear();
        Ok(())
    }

    async fn refresh(&mut self) -> Result<()> {
        // The kernel is authoritative; reads always go to it directly
        Ok(())
    }
}

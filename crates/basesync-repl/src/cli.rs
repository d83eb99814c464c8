//! `basesync` command line.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::memory_store::MemoryStore;
use crate::node::SyncNode;
use crate::store::{Collection, Field, FieldKind, LocalStore, Record};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEMO_COLLECTION: &str = "posts";
const DEMO_RESOURCE: &str = "posts/live";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "basesync")]
#[command(about = "basesync multi-instance replication", long_about = None)]
pub struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "BASESYNC_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an in-process cluster, replicate records and hand off a lease.
    Demo {
        /// Number of instances.
        #[arg(short, long, default_value = "3")]
        instances: usize,
        /// Records written, spread across instances.
        #[arg(short, long, default_value = "10")]
        records: usize,
    },
    /// Print the effective configuration as TOML.
    Config {
        /// Configuration file (`.toml` or `.json`).
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

impl Cli {
    /// Execute the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Demo { instances, records } => demo(instances, records).await,
            Command::Config { ref path } => print_config(path.as_deref()),
        }
    }
}

fn print_config(path: Option<&std::path::Path>) -> Result<()> {
    let config = match path {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::for_instance("local"),
    };
    config.validate()?;
    print!("{}", config.to_toml()?);
    Ok(())
}

fn demo_config(instance_id: &str) -> SyncConfig {
    let mut config = SyncConfig::for_instance(instance_id);
    config.subscriber.fetch_wait_ms = 100;
    config.lease.lease_duration_ms = 2_000;
    config.lease.heartbeat_interval_ms = 500;
    config.lease.sweep_interval_ms = 250;
    config
}

/// Start `instances` nodes with memory stores and connect them full-mesh.
async fn build_cluster(instances: usize) -> Result<Vec<SyncNode>> {
    let mut nodes = Vec::with_capacity(instances);
    for i in 0..instances {
        let node = SyncNode::new(
            demo_config(&format!("node-{}", i + 1)),
            Arc::new(MemoryStore::new()),
        )?;
        node.start().await?;
        nodes.push(node);
    }
    for a in &nodes {
        for b in &nodes {
            if a.instance_id() != b.instance_id() {
                a.add_peer_connection(b.connect(), b.instance_id(), 0).await?;
            }
        }
    }
    Ok(nodes)
}

async fn settle(nodes: &[SyncNode]) {
    for node in nodes {
        node.wait_for_catch_up(Duration::from_secs(5)).await;
    }
}

async fn wait_for_owner(node: &SyncNode, expected: Option<&str>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if node.owner_of(DEMO_RESOURCE).await.as_deref() == expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn demo(instances: usize, records: usize) -> Result<()> {
    if instances == 0 {
        bail!("at least one instance is required");
    }
    let nodes = build_cluster(instances).await?;
    info!(instances, records, "cluster started");

    let schema = Collection::new(DEMO_COLLECTION)
        .with_field(Field::new("title", FieldKind::Text).required())
        .with_field(Field::new("author", FieldKind::Text));
    nodes[0].save_collection(schema).await?;
    settle(&nodes).await;

    for i in 0..records {
        let node = &nodes[i % nodes.len()];
        let mut record = Record::with_random_id(DEMO_COLLECTION);
        record.set("title", json!(format!("post {}", i + 1)));
        record.set("author", json!(node.instance_id()));
        node.save_record(record).await?;
    }
    settle(&nodes).await;

    println!("{:<10} {:>8} {:>8} {:>10} {:>8}", "instance", "records", "applied", "superseded", "failed");
    let mut reference: Option<Vec<Record>> = None;
    let mut converged = true;
    for node in &nodes {
        let mut rows = node.store().list_records(DEMO_COLLECTION)?;
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        let stats = node.stats().processor;
        println!(
            "{:<10} {:>8} {:>8} {:>10} {:>8}",
            node.instance_id(),
            rows.len(),
            stats.applied,
            stats.superseded,
            stats.failed
        );
        let stripped: Vec<Record> = rows
            .into_iter()
            .map(|mut r| {
                r.data.retain(|k, _| k != "created" && k != "updated");
                r
            })
            .collect();
        match &reference {
            Some(expected) if *expected != stripped => converged = false,
            Some(_) => {}
            None => reference = Some(stripped),
        }
    }
    println!("converged: {}", converged);

    if nodes.len() >= 2 {
        lease_handoff(&nodes).await?;
    }

    for node in &nodes {
        node.shutdown().await;
    }
    if !converged {
        bail!("instances did not converge");
    }
    Ok(())
}

async fn lease_handoff(nodes: &[SyncNode]) -> Result<()> {
    let (first, second) = (&nodes[0], &nodes[1]);
    first.subscribe_realtime(DEMO_RESOURCE).await?;
    if !wait_for_owner(second, Some(first.instance_id()), Duration::from_secs(5)).await {
        bail!("{} never learned the lease owner", second.instance_id());
    }
    match second.subscribe_realtime(DEMO_RESOURCE).await {
        Err(SyncError::OwnedElsewhere { owner, .. }) => {
            println!("lease {} held by {}", DEMO_RESOURCE, owner)
        }
        Ok(_) => bail!("lease claimed twice"),
        Err(e) => return Err(e.into()),
    }

    first.shutdown().await;
    if !wait_for_owner(second, None, Duration::from_secs(5)).await {
        bail!("lease was not released");
    }
    let lease = second.subscribe_realtime(DEMO_RESOURCE).await?;
    println!("lease {} handed off to {}", DEMO_RESOURCE, lease.instance_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_demo() {
        let cli = Cli::try_parse_from(["basesync", "demo", "--instances", "2", "--records", "5"]).unwrap();
        assert!(matches!(cli.command, Command::Demo { instances: 2, records: 5 }));
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_parse_log_format() {
        let cli = Cli::try_parse_from(["basesync", "--log-format", "json", "config"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Command::Config { path: None }));
    }

    #[test]
    fn test_print_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "instance_id = \"x\"\n").unwrap();
        print_config(Some(&path)).unwrap();
    }

    #[tokio::test]
    async fn test_demo_runs() {
        demo(2, 4).await.unwrap();
    }
}

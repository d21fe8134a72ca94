//! rangekv - range-sharded, raft-replicated key/value and blob store
//!
//! Runs an in-process fleet: every host shares one consensus hub, one gossip
//! network and one transport, and the meta range is bootstrapped across all hosts.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use raft::LocalRaftHub;
use storage::MemoryEngineFactory;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use rangekv::bootstrap::bootstrap_meta_range;
use rangekv::config::Config;
use rangekv::gossip::GossipNetwork;
use rangekv::store::{Store, StoreDeps};
use rangekv::transport::LocalTransport;

/// rangekv fleet configuration
#[derive(Parser, Debug)]
#[command(name = "rangekv")]
#[command(about = "rangekv - range-sharded, raft-replicated key/value store")]
struct Args {
    /// Node host ID prefix (overrides `node.nhid`)
    #[arg(long)]
    nhid: Option<String>,

    /// Number of node hosts to run
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Log level (overrides `log.level`)
    #[arg(long)]
    log_level: Option<String>,

    /// Configuration file path (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Command line values win over the file; absent flags keep the file's values
fn apply_args(config: &mut Config, args: &Args) {
    if let Some(nhid) = &args.nhid {
        config.node.nhid = nhid.clone();
    }
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    apply_args(&mut config, &args);

    let level = match config.log.level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    anyhow::ensure!(args.nodes > 0, "--nodes must be at least 1");
    info!("Starting rangekv fleet of {} hosts", args.nodes);

    let hub = LocalRaftHub::new();
    let engines = Arc::new(MemoryEngineFactory::new());
    let transport = Arc::new(LocalTransport::new());
    let gossip = GossipNetwork::new();

    let mut stores = Vec::with_capacity(args.nodes);
    for i in 1..=args.nodes {
        let host_config = config.for_host(i);
        let deps = StoreDeps {
            consensus: hub.host(host_config.node.nhid.clone()),
            engines: engines.clone(),
            transport: transport.clone(),
            gossip: gossip.clone(),
        };
        let store = Store::new(host_config, deps);
        store.start().await?;
        stores.push(store);
    }

    let hosts: Vec<_> = stores.iter().map(|s| s.node().clone()).collect();
    let meta = bootstrap_meta_range(transport.as_ref(), &hosts).await?;
    info!("Fleet ready, meta range {}", meta);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for store in &stores {
        store.stop().await;
    }
    Ok(())
}

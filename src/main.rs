use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chain_sync::{
    sim::{PeerBehaviour, SimulatedChain, SimulatedNetwork},
    sync::{
        MemoryStore, PivotNumber, StructuralValidator, SyncConfig, SyncMode, SyncService,
        service::wait_for_mode,
    },
    types::{ChainStore, DataKind},
};
use clap::Parser;
use metrics::{
    Metrics,
    server::{MetricsServerConfig, run_metrics_server},
};
use tracing::{error, info, warn};

/// Runs a chain sync session against a simulated peer set.
#[derive(Parser, Debug)]
struct Args {
    /// YAML sync configuration. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured pivot: a block number or `latest`.
    #[arg(long)]
    pivot: Option<PivotNumber>,

    #[arg(long, default_value_t = 2048)]
    chain_length: u64,

    /// Branches per state root in the generated chain.
    #[arg(long, default_value_t = 16)]
    state_width: u8,

    #[arg(long, default_value_t = 4)]
    peers: usize,

    /// Additional peers that serve corrupted bodies.
    #[arg(long, default_value_t = 0)]
    bad_peers: usize,

    #[arg(long, default_value = "127.0.0.1")]
    metrics_address: IpAddr,

    /// Serve Prometheus metrics on this port.
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Give up if the node has not caught up after this many seconds.
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SyncConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(pivot) = args.pivot {
        config.pivot_number = pivot;
    }

    let chain = Arc::new(SimulatedChain::generate(args.chain_length, args.state_width));
    let genesis = chain.genesis().cloned().context("chain length must be at least 1")?;
    let head = chain.len() - 1;

    let network = Arc::new(SimulatedNetwork::new(chain.clone()));
    for _ in 0..args.peers {
        network.add_peer(PeerBehaviour::Honest, head);
    }
    for _ in 0..args.bad_peers {
        network.add_peer(PeerBehaviour::CorruptBodies, head);
    }

    let store = Arc::new(MemoryStore::with_genesis(genesis));
    let mut service = SyncService::new(
        config,
        store.clone(),
        Arc::new(StructuralValidator),
        network.clone(),
    )?;

    if let Some(metrics_port) = args.metrics_port {
        let metrics = Arc::new(Metrics::new()?);
        let server_config = MetricsServerConfig {
            metrics_address: args.metrics_address,
            metrics_port,
        };
        let server_metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(error) = run_metrics_server(server_config, server_metrics).await {
                error!(%error, "Metrics server exited");
            }
        });
        service = service.with_report_sink(metrics);
    }

    let events = service.events();
    let mut mode = service.subscribe_mode();
    let sync_task = tokio::spawn(service.run());

    for event in network.connect_all() {
        events.send(event)?;
    }

    let caught_up = wait_for_mode(
        &mut mode,
        Duration::from_secs(args.timeout_secs),
        |mode| mode == SyncMode::WAITING_FOR_BLOCK,
    );
    tokio::select! {
        reached = caught_up => match reached {
            Some(_) => info!(head, "Caught up with the network"),
            None => warn!(timeout_secs = args.timeout_secs, "Sync did not finish in time"),
        },
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted");
        }
    }

    // The service may already be gone if every sender was dropped.
    let _ = events.send(chain_sync::types::SyncEvent::Shutdown);
    sync_task.await?;

    info!(
        best_full_block = ?store.best_full_block().map(|header| header.number),
        headers = ?store.stored_range(DataKind::Headers).map(|range| range.to_string()),
        bodies = ?store.stored_range(DataKind::Bodies).map(|range| range.to_string()),
        receipts = ?store.stored_range(DataKind::Receipts).map(|range| range.to_string()),
        state_nodes = store.state_node_count(),
        disconnected = network.disconnected().len(),
        "Sync session finished"
    );

    Ok(())
}

// Strand data distributor dev harness.
//
// Runs the distributor role against a seeded in-process cluster: an
// in-memory (or fjall-backed) system keyspace, mock snapshot targets, and
// the stub pipeline. Useful for watching the supervisor loop, the seeding
// pass, and the snapshot protocol end to end without a real cluster.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, oneshot, watch};

use strand_core::{FjallStore, MemoryStore, SystemStore, Uid};
use strand_distributor::config::DistributorConfig;
use strand_distributor::enabled::DdEnabledState;
use strand_distributor::handlers::{data_distributor, DistributorRequest};
use strand_distributor::harness::{mock_cluster_view, seed_cluster, ClusterSeed, SnapEventLog, StubPipelineBuilder};
use strand_distributor::supervisor::{DistributorData, SupervisorEnv};

#[derive(Parser, Debug)]
#[command(name = "strand-dd", about = "Run the Strand data distributor against a seeded dev cluster")]
struct Args {
    /// Number of seeded storage servers.
    #[arg(long, default_value_t = 6)]
    servers: usize,

    /// Comma-separated datacenter ids; the first is primary.
    #[arg(long, default_value = "dc0")]
    dcs: String,

    /// Replicas per team in one region.
    #[arg(long, default_value_t = 3)]
    team_size: usize,

    /// Number of seeded key ranges.
    #[arg(long, default_value_t = 8)]
    shards: usize,

    /// Persist the system keyspace here instead of running in memory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Trigger a cluster snapshot this many seconds after startup.
    #[arg(long)]
    snap_after: Option<u64>,

    /// Route relocations through the event buffer.
    #[arg(long, default_value_t = false)]
    dd_framework: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let store: Arc<dyn SystemStore> = match &args.data_dir {
        Some(dir) => Arc::new(FjallStore::open(dir).context("open system keyspace")?),
        None => Arc::new(MemoryStore::new()),
    };

    let seed = ClusterSeed {
        servers: args.servers,
        dcs: args
            .dcs
            .split(',')
            .filter(|dc| !dc.is_empty())
            .map(|dc| dc.as_bytes().to_vec())
            .collect(),
        team_size: args.team_size,
        shards: args.shards.max(1),
    };
    let seeded = seed_cluster(store.as_ref(), &seed)
        .await
        .context("seed cluster")?;
    tracing::info!(
        servers = seeded.server_ids.len(),
        shards = seeded.boundaries.len(),
        "seeded dev cluster"
    );

    let snap_log = SnapEventLog::default();
    let (_cluster_tx, cluster_rx) = watch::channel(mock_cluster_view(3, args.servers, 3, &snap_log));

    let (builder, mut builds_rx, _inject_errors) = StubPipelineBuilder::new(store.clone());
    let relocation_log = builder.log.clone();
    tokio::spawn(async move {
        while let Some(build) = builds_rx.recv().await {
            tracing::info!(build, "pipeline built");
        }
    });

    let cfg = DistributorConfig {
        dd_framework: args.dd_framework,
        ..Default::default()
    };
    let env = SupervisorEnv {
        store: store.clone(),
        cluster: cluster_rx,
        builder,
        enabled: Arc::new(DdEnabledState::new()),
        config: cfg,
    };

    let dd_id = Uid::random();
    let data = DistributorData::new(dd_id);
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (_cache_failures_tx, cache_failures_rx) = mpsc::unbounded_channel();

    if let Some(secs) = args.snap_after {
        let requests_tx = requests_tx.clone();
        let snap_log = snap_log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let (reply_tx, reply_rx) = oneshot::channel();
            let _ = requests_tx.send(DistributorRequest::Snap {
                payload: "dev-snapshot".to_string(),
                snap_uid: Uid::random(),
                reply: reply_tx,
            });
            match reply_rx.await {
                Ok(Ok(())) => {
                    tracing::info!(events = snap_log.events().len(), "snapshot finished")
                }
                Ok(Err(err)) => tracing::error!(error = %err, "snapshot failed"),
                Err(_) => tracing::error!("snapshot reply dropped"),
            }
        });
    }

    {
        let requests_tx = requests_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let (reply_tx, _reply_rx) = oneshot::channel();
                let _ = requests_tx.send(DistributorRequest::Halt {
                    requester: Uid::random(),
                    reply: reply_tx,
                });
            }
        });
    }

    let result = data_distributor(data, env, requests_rx, cache_failures_rx).await;
    tracing::info!(
        relocations = relocation_log.relocations().len(),
        "distributor exited"
    );
    result.map_err(|err| anyhow::anyhow!(err))
}

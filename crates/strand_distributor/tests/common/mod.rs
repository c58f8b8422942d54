//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use strand_core::cluster::{encode_data_move_value, encode_key_servers_value, KeyServersValue};
use strand_core::cluster::DataMoveMeta;
use strand_core::keys::{data_move_key, KEY_SERVERS_PREFIX};
use strand_core::{Error, Key, MemoryStore, Result, SystemStore, Uid};
use strand_distributor::config::DistributorConfig;
use strand_distributor::enabled::DdEnabledState;
use strand_distributor::handlers::{data_distributor, DistributorRequest};
use strand_distributor::harness::{
    mock_cluster_view, seed_cluster, ClusterSeed, PipelineLog, SeededCluster, SnapEventLog,
    StubPipelineBuilder,
};
use strand_distributor::pipeline::ClusterView;
use strand_distributor::supervisor::{DistributorData, SupervisorEnv};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Production defaults with every delay shrunk for tests.
pub fn fast_config() -> DistributorConfig {
    DistributorConfig {
        move_keys_lock_poll_delay: Duration::from_millis(50),
        dd_enabled_check_delay: Duration::from_millis(20),
        move_keys_chunk_rows: 3,
        cache_server_poll_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

/// A distributor wired to a seeded in-memory cluster and the stub pipeline.
pub struct TestCluster {
    pub store: MemoryStore,
    pub seeded: SeededCluster,
    pub builder: Arc<StubPipelineBuilder>,
    pub builds: mpsc::UnboundedReceiver<usize>,
    pub inject_errors: mpsc::UnboundedSender<Error>,
    pub log: PipelineLog,
    pub snap_log: SnapEventLog,
    pub cluster_tx: watch::Sender<ClusterView>,
    pub cluster_rx: watch::Receiver<ClusterView>,
    pub enabled: Arc<DdEnabledState>,
    pub data: Arc<DistributorData>,
    pub config: DistributorConfig,
}

impl TestCluster {
    pub async fn new(seed: ClusterSeed, config: DistributorConfig) -> Self {
        let store = MemoryStore::new();
        let seeded = seed_cluster(&store, &seed).await.expect("seed cluster");

        let snap_log = SnapEventLog::default();
        let view = mock_cluster_view(3, seed.servers, 3, &snap_log);
        let (cluster_tx, cluster_rx) = watch::channel(view);

        let (builder, builds, inject_errors) =
            StubPipelineBuilder::new(Arc::new(store.clone()) as Arc<dyn SystemStore>);
        let log = builder.log.clone();

        Self {
            store,
            seeded,
            builder,
            builds,
            inject_errors,
            log,
            snap_log,
            cluster_tx,
            cluster_rx,
            enabled: Arc::new(DdEnabledState::new()),
            data: DistributorData::new(Uid::new(0xdd, 0xdd)),
            config,
        }
    }

    pub fn supervisor_env(&self) -> SupervisorEnv {
        SupervisorEnv {
            store: Arc::new(self.store.clone()),
            cluster: self.cluster_rx.clone(),
            builder: self.builder.clone(),
            enabled: self.enabled.clone(),
            config: self.config.clone(),
        }
    }

    /// Spawn the full role actor; returns the request inlet and the task.
    pub fn spawn_distributor(
        &self,
    ) -> (
        mpsc::UnboundedSender<DistributorRequest>,
        JoinHandle<Result<()>>,
    ) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (_cache_tx, cache_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(data_distributor(
            self.data.clone(),
            self.supervisor_env(),
            requests_rx,
            cache_rx,
        ));
        (requests_tx, task)
    }

    /// Wait until the stub pipeline has been built `n` times in total and
    /// the supervisor has published its handles.
    pub async fn wait_for_build(&mut self, n: usize) {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("timed out waiting for pipeline build");
            let build = tokio::time::timeout(remaining, self.builds.recv())
                .await
                .expect("timed out waiting for pipeline build")
                .expect("builder dropped");
            if build >= n {
                break;
            }
        }
        while self.data.team_collections().is_empty() || self.data.metrics_requests().is_none() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "pipeline handles never published"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Write one key-servers boundary directly.
pub fn seed_key_servers_boundary(store: &MemoryStore, boundary: &[u8], value: &KeyServersValue) {
    let mut key: Key = KEY_SERVERS_PREFIX.to_vec();
    key.extend_from_slice(boundary);
    store.seed([(key, encode_key_servers_value(value).expect("encode"))]);
}

/// Write one persisted data-move record.
pub fn seed_data_move(store: &MemoryStore, meta: &DataMoveMeta) {
    store.seed([(
        data_move_key(meta.id),
        encode_data_move_value(meta).expect("encode"),
    )]);
}

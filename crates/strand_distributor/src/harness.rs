//! In-process cluster fixtures.
//!
//! The dev binary and the integration tests run the distributor against a
//! seeded store, mock snapshot targets, and a stub pipeline whose actors
//! record what the supervisor feeds them. Nothing here is wired into
//! production paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;

use strand_core::cluster::{
    encode_database_configuration, encode_key_servers_value, encode_mode, encode_server_list_value,
    encode_server_tag, encode_worker_list_value, DatabaseConfiguration, KeyServersValue,
    ProcessClass, ProcessData, RegionConfig, StorageServerInterface,
};
use strand_core::ids::ANONYMOUS_SHARD_ID;
use strand_core::keys::{
    self, DATABASE_CONFIGURATION_KEY, DATA_DISTRIBUTION_MODE_KEY, KEY_SERVERS_PREFIX,
};
use strand_core::{run_transaction, Key, Result, SystemStore, TxOption, Uid};

use crate::pipeline::{
    BasicMoveKeys, ClusterView, MoveKeysFacade, NamedActor, Pipeline, PipelineBuilder,
    PipelineContext, RecoveryState, ShardMetrics, ShardTrackedData, TlogClient, WorkerClient,
};
use crate::relocation::{DdEvent, RelocateShard};
use crate::teams::{TeamCollection, WigglerState};

/// Shared recorder for snapshot-protocol calls, in arrival order.
#[derive(Clone, Default)]
pub struct SnapEventLog(Arc<StdMutex<Vec<String>>>);

impl SnapEventLog {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

/// Mock transaction log for snapshot tests.
pub struct MockTlog {
    pub name: String,
    pub log: SnapEventLog,
    pub delay: Duration,
    pub fail_disable: AtomicBool,
    pub fail_snapshot: AtomicBool,
    pub fail_enable: AtomicBool,
}

impl MockTlog {
    pub fn new(name: impl Into<String>, log: SnapEventLog) -> Self {
        Self {
            name: name.into(),
            log,
            delay: Duration::ZERO,
            fail_disable: AtomicBool::new(false),
            fail_snapshot: AtomicBool::new(false),
            fail_enable: AtomicBool::new(false),
        }
    }

    async fn step(&self, kind: &str, fail: &AtomicBool) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.record(format!("{kind}:{}", self.name));
        if fail.load(Ordering::SeqCst) {
            return Err(strand_core::Error::OperationFailed);
        }
        Ok(())
    }
}

#[async_trait]
impl TlogClient for MockTlog {
    async fn disable_pop(&self, _snap_uid: Uid) -> Result<()> {
        self.step("disable_pop", &self.fail_disable).await
    }

    async fn enable_pop(&self, _snap_uid: Uid) -> Result<()> {
        self.step("enable_pop", &self.fail_enable).await
    }

    async fn snapshot(&self, _payload: &str, _snap_uid: Uid) -> Result<()> {
        self.step("tlog_snap", &self.fail_snapshot).await
    }
}

/// Mock storage or coordinator worker.
pub struct MockWorker {
    pub name: String,
    pub log: SnapEventLog,
    pub delay: Duration,
    pub fail: AtomicBool,
}

impl MockWorker {
    pub fn new(name: impl Into<String>, log: SnapEventLog) -> Self {
        Self {
            name: name.into(),
            log,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl WorkerClient for MockWorker {
    async fn snapshot(&self, _payload: &str, _snap_uid: Uid, role: &str) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.record(format!("snap:{role}:{}", self.name));
        if self.fail.load(Ordering::SeqCst) {
            return Err(strand_core::Error::OperationFailed);
        }
        Ok(())
    }
}

/// A cluster view over fresh mocks that all succeed immediately.
pub fn mock_cluster_view(
    tlogs: usize,
    storage_workers: usize,
    coordinators: usize,
    log: &SnapEventLog,
) -> ClusterView {
    ClusterView {
        generation: 1,
        recovery_state: RecoveryState::FullyRecovered,
        tlogs: (0..tlogs)
            .map(|i| Arc::new(MockTlog::new(format!("tlog{i}"), log.clone())) as Arc<dyn TlogClient>)
            .collect(),
        storage_workers: (0..storage_workers)
            .map(|i| {
                Arc::new(MockWorker::new(format!("ss{i}"), log.clone())) as Arc<dyn WorkerClient>
            })
            .collect(),
        storage_worker_failures: 0,
        coordinators: (0..coordinators)
            .map(|i| {
                Arc::new(MockWorker::new(format!("coord{i}"), log.clone())) as Arc<dyn WorkerClient>
            })
            .collect(),
    }
}

/// What to seed into a fresh system keyspace.
#[derive(Clone, Debug)]
pub struct ClusterSeed {
    pub servers: usize,
    /// Datacenter ids; the first is primary, the second remote.
    pub dcs: Vec<Vec<u8>>,
    pub team_size: usize,
    pub shards: usize,
}

impl Default for ClusterSeed {
    fn default() -> Self {
        Self {
            servers: 6,
            dcs: vec![b"dc0".to_vec()],
            team_size: 3,
            shards: 4,
        }
    }
}

/// Handles back to what was seeded.
pub struct SeededCluster {
    pub server_ids: Vec<Uid>,
    pub boundaries: Vec<Key>,
    pub configuration: DatabaseConfiguration,
}

pub fn server_uid(index: usize) -> Uid {
    Uid::new(0x5300 + index as u64, index as u64)
}

/// Seed servers, tags, workers, configuration, mode, and a contiguous
/// key-servers map into `store`.
pub async fn seed_cluster(store: &dyn SystemStore, seed: &ClusterSeed) -> Result<SeededCluster> {
    assert!(!seed.dcs.is_empty());
    let configuration = DatabaseConfiguration {
        regions: seed
            .dcs
            .iter()
            .map(|dc| RegionConfig { dc_id: dc.clone() })
            .collect(),
        usable_regions: if seed.dcs.len() > 1 { 2 } else { 1 },
        storage_team_size: seed.team_size,
    };

    let mut server_ids = Vec::new();
    let mut by_dc: Vec<Vec<Uid>> = vec![Vec::new(); seed.dcs.len()];
    let mut entries: Vec<(Key, Vec<u8>)> = Vec::new();

    for i in 0..seed.servers {
        let id = server_uid(i);
        server_ids.push(id);
        let dc_index = i % seed.dcs.len();
        by_dc[dc_index].push(id);
        let process_id = format!("proc{i}");
        let ssi = StorageServerInterface {
            id,
            address: format!("10.0.0.{i}:4500"),
            secondary_address: None,
            process_id: process_id.clone(),
            datacenter: Some(seed.dcs[dc_index].clone()),
            tss: false,
        };
        entries.push((keys::server_list_key(id), encode_server_list_value(&ssi)?));
        entries.push((keys::server_tag_key(id), encode_server_tag(i as u64)));
        let worker = ProcessData {
            process_id: process_id.clone(),
            process_class: ProcessClass::Storage,
            datacenter: Some(seed.dcs[dc_index].clone()),
        };
        entries.push((
            keys::worker_list_key(&process_id),
            encode_worker_list_value(&worker)?,
        ));
    }

    let mut boundaries: Vec<Key> = vec![Vec::new()];
    for i in 1..seed.shards {
        boundaries.push(format!("k{i:04}").into_bytes());
    }

    for (j, boundary) in boundaries.iter().enumerate() {
        let mut src = Vec::new();
        for (dc_index, members) in by_dc.iter().enumerate() {
            if dc_index > 1 || members.is_empty() {
                continue;
            }
            for k in 0..seed.team_size.min(members.len()) {
                src.push(members[(j + k) % members.len()]);
            }
        }
        let value = KeyServersValue {
            src,
            dest: Vec::new(),
            src_id: Uid::new(0x1000 + j as u64, j as u64),
            dest_id: ANONYMOUS_SHARD_ID,
        };
        let mut key = KEY_SERVERS_PREFIX.to_vec();
        key.extend_from_slice(boundary);
        entries.push((key, encode_key_servers_value(&value)?));
    }

    entries.push((DATA_DISTRIBUTION_MODE_KEY.to_vec(), encode_mode(1)));
    entries.push((
        DATABASE_CONFIGURATION_KEY.to_vec(),
        encode_database_configuration(&configuration)?,
    ));

    run_transaction(store, &[TxOption::AccessSystemKeys], move |tr| {
        let entries = entries.clone();
        async move {
            for (key, value) in &entries {
                tr.set(key, value);
            }
            Ok(())
        }
        .boxed()
    })
    .await?;

    Ok(SeededCluster {
        server_ids,
        boundaries,
        configuration,
    })
}

/// Team collection stand-in over a fixed team list.
pub struct StaticTeamCollection {
    primary: bool,
    teams: StdMutex<Vec<Vec<Uid>>>,
    wiggle: StdMutex<(WigglerState, u64)>,
}

impl StaticTeamCollection {
    pub fn new(primary: bool, teams: Vec<Vec<Uid>>) -> Arc<Self> {
        Arc::new(Self {
            primary,
            teams: StdMutex::new(teams),
            wiggle: StdMutex::new((WigglerState::Run, 0)),
        })
    }

    pub fn set_wiggler_state(&self, state: WigglerState, changed: u64) {
        *self.wiggle.lock().unwrap() = (state, changed);
    }
}

impl TeamCollection for StaticTeamCollection {
    fn is_primary(&self) -> bool {
        self.primary
    }

    fn team_count(&self) -> usize {
        self.teams.lock().unwrap().len()
    }

    fn exclusion_safety_check(&self, excluded: &[Uid]) -> bool {
        let teams = self.teams.lock().unwrap();
        for team in teams.iter() {
            if !team.is_empty() && team.iter().all(|id| excluded.contains(id)) {
                return false;
            }
        }
        true
    }

    fn random_healthy_team(&self, exclude: Uid) -> Vec<Uid> {
        let teams = self.teams.lock().unwrap();
        let healthy: Vec<&Vec<Uid>> = teams.iter().filter(|t| !t.contains(&exclude)).collect();
        healthy
            .choose(&mut rand::thread_rng())
            .map(|t| (*t).clone())
            .unwrap_or_default()
    }

    fn wiggler_state(&self) -> (WigglerState, u64) {
        *self.wiggle.lock().unwrap()
    }
}

/// Everything the stub pipeline records.
#[derive(Clone, Default)]
pub struct PipelineLog {
    pub relocations: Arc<StdMutex<Vec<RelocateShard>>>,
    pub events: Arc<StdMutex<Vec<DdEvent>>>,
}

impl PipelineLog {
    pub fn relocations(&self) -> Vec<RelocateShard> {
        self.relocations.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<DdEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// Pipeline stand-in: a queue actor that records relocations, a tracker
/// actor that answers metrics requests with synthetic sizes, and optional
/// error injection to force supervisor teardowns.
pub struct StubPipelineBuilder {
    store: Arc<dyn SystemStore>,
    pub log: PipelineLog,
    pub builds: mpsc::UnboundedSender<usize>,
    build_count: StdMutex<usize>,
    injected_errors: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<strand_core::Error>>>,
    failed_server: StdMutex<Option<Uid>>,
}

impl StubPipelineBuilder {
    /// Returns the builder, a stream of build counts, and a sender that
    /// injects a fatal error into the currently running queue actor.
    pub fn new(
        store: Arc<dyn SystemStore>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<usize>,
        mpsc::UnboundedSender<strand_core::Error>,
    ) {
        let (builds_tx, builds_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                store,
                log: PipelineLog::default(),
                builds: builds_tx,
                build_count: StdMutex::new(0),
                injected_errors: Arc::new(tokio::sync::Mutex::new(errors_rx)),
                failed_server: StdMutex::new(None),
            }),
            builds_rx,
            errors_tx,
        )
    }

    /// Make every built pipeline immediately grant a failed-server removal
    /// for `id`, as a team collection would.
    pub fn fail_server(&self, id: Uid) {
        *self.failed_server.lock().unwrap() = Some(id);
    }
}

#[async_trait]
impl PipelineBuilder for StubPipelineBuilder {
    async fn build(&self, cx: PipelineContext) -> Result<Pipeline> {
        let build = {
            let mut count = self.build_count.lock().unwrap();
            *count += 1;
            *count
        };
        let _ = self.builds.send(build);

        if let Some(id) = *self.failed_server.lock().unwrap() {
            let _ = cx.remove_failed_server.send(id);
        }

        let mut team_collections: Vec<Arc<dyn TeamCollection>> = vec![StaticTeamCollection::new(
            true,
            cx.init_data.primary_teams.iter().cloned().collect(),
        )];
        if cx.configuration.usable_regions > 1 {
            team_collections.push(StaticTeamCollection::new(
                false,
                cx.init_data.remote_teams.iter().cloned().collect(),
            ));
        }

        // Pre-populate the tracker map with synthetic sizes.
        let metrics: Vec<ShardMetrics> = cx
            .init_data
            .shards
            .windows(2)
            .enumerate()
            .map(|(i, pair)| ShardMetrics {
                begin_key: pair[0].key.clone(),
                shard_bytes: ((i + 1) as i64) << 20,
            })
            .collect();
        {
            let mut map = cx.shard_map.lock().await;
            for (i, pair) in cx.init_data.shards.windows(2).enumerate() {
                map.insert(
                    &strand_core::KeyRange::new(pair[0].key.clone(), pair[1].key.clone()),
                    ShardTrackedData {
                        shard_bytes: Some(((i + 1) as i64) << 20),
                    },
                );
            }
        }

        let log = self.log.clone();
        let mut input = cx.relocation_input;
        let mut events = cx.dd_events;
        let injected = self.injected_errors.clone();
        let queue = NamedActor::new("DDQueue", async move {
            let mut injected = injected.lock().await;
            loop {
                tokio::select! {
                    rs = input.recv() => match rs {
                        Some(rs) => log.relocations.lock().unwrap().push(rs),
                        None => return std::future::pending::<Result<()>>().await,
                    },
                    ev = events.recv() => match ev {
                        Some(ev) => log.events.lock().unwrap().push(ev),
                        None => return std::future::pending::<Result<()>>().await,
                    },
                    err = injected.recv() => match err {
                        Some(err) => return Err(err),
                        None => return std::future::pending::<Result<()>>().await,
                    },
                }
            }
        });

        let mut metrics_requests = cx.metrics_list;
        let mut restarts = cx.restart_shard_tracker;
        let tracker = NamedActor::new("DDTracker", async move {
            loop {
                tokio::select! {
                    req = metrics_requests.recv() => match req {
                        Some(req) => {
                            let mut listed: Vec<ShardMetrics> = metrics
                                .iter()
                                .filter(|m| req.keys.contains_key(&m.begin_key))
                                .cloned()
                                .collect();
                            listed.truncate(req.shard_limit);
                            let _ = req.reply.send(Ok(listed));
                        }
                        None => return std::future::pending::<Result<()>>().await,
                    },
                    restart = restarts.recv() => {
                        if let Some(range) = restart {
                            tracing::debug!(range = ?range, "tracker restart requested");
                        } else {
                            return std::future::pending::<Result<()>>().await;
                        }
                    }
                }
            }
        });

        Ok(Pipeline {
            team_collections,
            actors: vec![queue, tracker],
        })
    }

    fn move_keys(&self) -> Arc<dyn MoveKeysFacade> {
        Arc::new(BasicMoveKeys::new(self.store.clone()))
    }
}

//! Contracts toward the out-of-scope collaborators.
//!
//! The shard tracker, relocation queue, team collections, tenant cache, and
//! the key-moving machinery live outside this crate. The supervisor reaches
//! them through the seams below, and the dev harness supplies in-process
//! stand-ins.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};

use strand_core::cluster::{decode_key_servers_value, encode_key_servers_value, DatabaseConfiguration};
use strand_core::keys::{
    self, krm_get_ranges, read_range_assert_complete, KEY_SERVERS_PREFIX,
};
use strand_core::{
    Error, Key, KeyRange, RangeMap, Result, SystemStore, TxOption, Uid, TOO_MANY,
};

use crate::enabled::DdEnabledState;
use crate::initial::InitialDataDistribution;
use crate::lock::{check_move_keys_lock_read_only, MoveKeysLock};
use crate::relocation::{DdEvent, RelocateShard, RelocationSender};
use crate::teams::{ShardsAffectedByTeamFailure, TeamCollection};

/// Cluster recovery progress as published on the cluster-view watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryState {
    Reading,
    AllLogsRecruited,
    FullyRecovered,
}

/// Handle to one local transaction log.
#[async_trait]
pub trait TlogClient: Send + Sync {
    async fn disable_pop(&self, snap_uid: Uid) -> Result<()>;
    async fn enable_pop(&self, snap_uid: Uid) -> Result<()>;
    async fn snapshot(&self, payload: &str, snap_uid: Uid) -> Result<()>;
}

/// Handle to a storage or coordinator worker process.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn snapshot(&self, payload: &str, snap_uid: Uid, role: &str) -> Result<()>;
}

/// The distributor's view of the cluster, refreshed by the recruiting
/// worker. A generation bump means a recovery happened.
#[derive(Clone)]
pub struct ClusterView {
    pub generation: u64,
    pub recovery_state: RecoveryState,
    pub tlogs: Vec<Arc<dyn TlogClient>>,
    pub storage_workers: Vec<Arc<dyn WorkerClient>>,
    /// Storage workers registered but currently unreachable.
    pub storage_worker_failures: usize,
    pub coordinators: Vec<Arc<dyn WorkerClient>>,
}

impl Default for ClusterView {
    fn default() -> Self {
        Self {
            generation: 0,
            recovery_state: RecoveryState::Reading,
            tlogs: Vec::new(),
            storage_workers: Vec::new(),
            storage_worker_failures: 0,
            coordinators: Vec::new(),
        }
    }
}

/// Per-shard size figures produced by the tracker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardMetrics {
    pub begin_key: Key,
    pub shard_bytes: i64,
}

/// Request for the tracker's shard metrics listing.
pub struct MetricsListRequest {
    pub keys: KeyRange,
    pub shard_limit: usize,
    pub reply: oneshot::Sender<Result<Vec<ShardMetrics>>>,
}

/// Tracker-side record for one shard; the supervisor owns the map so a
/// cancelled tracker cannot leave it half-destroyed.
#[derive(Clone, Debug, Default)]
pub struct ShardTrackedData {
    pub shard_bytes: Option<i64>,
}

pub type SharedShardMap = Arc<tokio::sync::Mutex<RangeMap<ShardTrackedData>>>;

pub fn new_shard_map() -> SharedShardMap {
    Arc::new(tokio::sync::Mutex::new(RangeMap::new(
        ShardTrackedData::default(),
    )))
}

/// Everything the pipeline actors need from the supervisor. Built fresh for
/// every supervision iteration.
pub struct PipelineContext {
    pub store: Arc<dyn SystemStore>,
    pub dd_id: Uid,
    pub lock: MoveKeysLock,
    pub configuration: DatabaseConfiguration,
    pub primary_dc_id: Option<Key>,
    pub remote_dc_ids: Vec<Key>,
    pub init_data: Arc<InitialDataDistribution>,
    pub shards_affected: Arc<StdMutex<ShardsAffectedByTeamFailure>>,
    pub restart_shard_tracker: mpsc::UnboundedReceiver<KeyRange>,
    pub relocations: RelocationSender,
    pub relocation_input: mpsc::UnboundedReceiver<RelocateShard>,
    pub dd_events: mpsc::UnboundedReceiver<DdEvent>,
    pub shard_map: SharedShardMap,
    pub metrics_list: mpsc::UnboundedReceiver<MetricsListRequest>,
    pub remove_failed_server: oneshot::Sender<Uid>,
    pub enabled: Arc<DdEnabledState>,
    pub cluster: watch::Receiver<ClusterView>,
    pub processing_unhealthy: watch::Sender<bool>,
    pub processing_wiggle: watch::Sender<bool>,
}

/// One long-running pipeline actor with a name for error reporting.
pub struct NamedActor {
    pub name: &'static str,
    pub fut: BoxFuture<'static, Result<()>>,
}

impl NamedActor {
    pub fn new(
        name: &'static str,
        fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            name,
            fut: fut.boxed(),
        }
    }
}

/// The spawned pipeline: the per-region team collections plus every actor
/// the supervisor must run until the first error.
pub struct Pipeline {
    pub team_collections: Vec<Arc<dyn TeamCollection>>,
    pub actors: Vec<NamedActor>,
}

/// Optional tenant awareness.
#[async_trait]
pub trait TenantCache: Send + Sync {
    async fn build(&self) -> Result<()>;
    async fn monitor(&self) -> Result<()>;
}

#[async_trait]
pub trait PipelineBuilder: Send + Sync {
    async fn build(&self, cx: PipelineContext) -> Result<Pipeline>;

    fn tenant_cache(&self) -> Option<Arc<dyn TenantCache>> {
        None
    }

    fn move_keys(&self) -> Arc<dyn MoveKeysFacade>;
}

/// The slice of the key-moving machinery the supervisor needs during
/// teardown: rehosting the ranges of a failed server and retiring the
/// server itself.
#[async_trait]
pub trait MoveKeysFacade: Send + Sync {
    async fn remove_keys_from_failed_server(
        &self,
        server: Uid,
        team_for_dropped_range: Vec<Uid>,
        lock: MoveKeysLock,
        enabled: Arc<DdEnabledState>,
    ) -> Result<()>;

    async fn remove_storage_server(
        &self,
        server: Uid,
        tss_pair: Option<Uid>,
        lock: MoveKeysLock,
        enabled: Arc<DdEnabledState>,
    ) -> Result<()>;
}

/// Control-plane-only key mover: rewrites ownership records and retires
/// server registrations. Byte movement belongs to the storage servers.
pub struct BasicMoveKeys {
    store: Arc<dyn SystemStore>,
}

impl BasicMoveKeys {
    pub fn new(store: Arc<dyn SystemStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MoveKeysFacade for BasicMoveKeys {
    async fn remove_keys_from_failed_server(
        &self,
        server: Uid,
        team_for_dropped_range: Vec<Uid>,
        lock: MoveKeysLock,
        enabled: Arc<DdEnabledState>,
    ) -> Result<()> {
        if team_for_dropped_range.is_empty() {
            return Err(Error::DataMoveDestTeamNotFound);
        }
        let mut tr = self.store.transaction();
        loop {
            tr.set_option(TxOption::AccessSystemKeys);
            tr.set_option(TxOption::PrioritySystemImmediate);
            let attempt: Result<()> = async {
                check_move_keys_lock_read_only(tr.as_mut(), &lock, &enabled).await?;
                let boundaries = krm_get_ranges(
                    tr.as_mut(),
                    KEY_SERVERS_PREFIX,
                    &KeyRange::all(),
                    TOO_MANY,
                    usize::MAX,
                )
                .await?;
                for pair in boundaries.windows(2) {
                    let mut value = decode_key_servers_value(&pair[0].value)?;
                    if !value.src.contains(&server) && !value.dest.contains(&server) {
                        continue;
                    }
                    value.src = team_for_dropped_range.clone();
                    value.dest.clear();
                    value.dest_id = Uid::default();
                    let mut key = KEY_SERVERS_PREFIX.to_vec();
                    key.extend_from_slice(&pair[0].key);
                    tr.set(&key, &encode_key_servers_value(&value)?);
                }
                tr.commit().await
            }
            .await;
            match attempt {
                Ok(()) => return Ok(()),
                Err(err) => tr.on_error(err).await?,
            }
        }
    }

    async fn remove_storage_server(
        &self,
        server: Uid,
        tss_pair: Option<Uid>,
        lock: MoveKeysLock,
        enabled: Arc<DdEnabledState>,
    ) -> Result<()> {
        let mut tr = self.store.transaction();
        loop {
            tr.set_option(TxOption::AccessSystemKeys);
            tr.set_option(TxOption::PrioritySystemImmediate);
            let attempt: Result<()> = async {
                check_move_keys_lock_read_only(tr.as_mut(), &lock, &enabled).await?;
                // Registration must exist before we clear it, otherwise this
                // is a double removal racing another actor.
                let rows = read_range_assert_complete(
                    tr.as_mut(),
                    &keys::prefix_range(keys::SERVER_LIST_PREFIX),
                    TOO_MANY,
                )
                .await?;
                let registered = rows
                    .iter()
                    .any(|kv| kv.key == keys::server_list_key(server));
                if !registered {
                    tracing::warn!(server = %server, "removing a server that is not registered");
                }
                tr.clear(&keys::server_list_key(server));
                tr.clear(&keys::server_tag_key(server));
                if let Some(pair) = tss_pair {
                    tr.clear(&keys::server_list_key(pair));
                    tr.clear(&keys::server_tag_key(pair));
                }
                tr.commit().await
            }
            .await;
            match attempt {
                Ok(()) => return Ok(()),
                Err(err) => tr.on_error(err).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::cluster::KeyServersValue;
    use strand_core::MemoryStore;

    use crate::lock::take_move_keys_lock;

    fn uid(n: u64) -> Uid {
        Uid::new(n, n)
    }

    fn ks_entry(boundary: &[u8], src: Vec<Uid>) -> (Key, Vec<u8>) {
        let mut key = KEY_SERVERS_PREFIX.to_vec();
        key.extend_from_slice(boundary);
        let value = KeyServersValue {
            src,
            ..Default::default()
        };
        (key, encode_key_servers_value(&value).unwrap())
    }

    #[tokio::test]
    async fn failed_server_ranges_move_to_the_replacement_team() {
        let store = MemoryStore::new();
        store.seed([
            ks_entry(b"", vec![uid(1), uid(2)]),
            ks_entry(b"m", vec![uid(2), uid(3)]),
        ]);
        let enabled = Arc::new(DdEnabledState::new());
        let lock = take_move_keys_lock(&store, uid(9)).await.unwrap();

        let mover = BasicMoveKeys::new(Arc::new(store.clone()));
        mover
            .remove_keys_from_failed_server(uid(1), vec![uid(2), uid(3)], lock, enabled)
            .await
            .unwrap();

        let raw = store.get_raw(&ks_entry(b"", vec![]).0).unwrap();
        let rewritten = decode_key_servers_value(&raw).unwrap();
        assert_eq!(rewritten.src, vec![uid(2), uid(3)]);
        // The untouched boundary keeps its team.
        let raw = store.get_raw(&ks_entry(b"m", vec![]).0).unwrap();
        assert_eq!(decode_key_servers_value(&raw).unwrap().src, vec![uid(2), uid(3)]);
    }

    #[tokio::test]
    async fn remove_storage_server_clears_registration() {
        let store = MemoryStore::new();
        store.seed([
            (keys::server_list_key(uid(1)), b"{}".to_vec()),
            (keys::server_tag_key(uid(1)), b"1".to_vec()),
        ]);
        let enabled = Arc::new(DdEnabledState::new());
        let lock = take_move_keys_lock(&store, uid(9)).await.unwrap();

        let mover = BasicMoveKeys::new(Arc::new(store.clone()));
        mover
            .remove_storage_server(uid(1), None, lock, enabled)
            .await
            .unwrap();
        assert!(store.get_raw(&keys::server_list_key(uid(1))).is_none());
        assert!(store.get_raw(&keys::server_tag_key(uid(1))).is_none());
    }
}

//! The distribution supervisor: lock, configure, snapshot, seed, spawn,
//! and recover.
//!
//! One outer loop per supervision incarnation. Startup acquires the
//! move-keys lock, reconciles the per-datacenter replica keys against the
//! configuration, waits out a disabled cluster, snapshots placement state,
//! seeds the pipeline from it, and then runs every pipeline actor until the
//! first error. Errors in the normal queue set tear the pipeline down and
//! restart the loop; anything else is fatal to the role.

use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};

use strand_core::cluster::{
    decode_datacenter_replicas_value, decode_mode, encode_datacenter_replicas_value,
    get_database_configuration, DatabaseConfiguration,
};
use strand_core::keys::{
    decode_datacenter_replicas_key, prefix_range, read_range_assert_complete,
    DATACENTER_REPLICAS_PREFIX, DATA_DISTRIBUTION_MODE_KEY, MOVE_KEYS_LOCK_OWNER_KEY,
};
use strand_core::ids::ANONYMOUS_SHARD_ID;
use strand_core::{Error, Key, KeyRange, Result, SystemStore, TxOption, Uid, TOO_MANY};

use crate::config::DistributorConfig;
use crate::enabled::DdEnabledState;
use crate::initial::{get_initial_data_distribution, InitialDataDistribution};
use crate::lock::{owner_is_mode_lock, poll_move_keys_lock, take_move_keys_lock, MoveKeysLock};
use crate::monitor::{monitor_physical_shards, PhysicalShardCollection};
use crate::pipeline::{
    new_shard_map, ClusterView, MetricsListRequest, PipelineBuilder, PipelineContext,
    RecoveryState, SharedShardMap,
};
use crate::relocation::{
    priority, yield_relocation_stream, RelocateReason, RelocateShard, RelocationSender,
};
use crate::teams::{ShardsAffectedByTeamFailure, Team, TeamCollection};

/// State shared between the supervisor and the request handlers: the live
/// team collections and the tracker's metrics inlet, both present only
/// while a pipeline is running.
pub struct DistributorData {
    pub dd_id: Uid,
    team_collections: StdRwLock<Vec<Arc<dyn TeamCollection>>>,
    metrics_requests: StdMutex<Option<mpsc::UnboundedSender<MetricsListRequest>>>,
}

impl DistributorData {
    pub fn new(dd_id: Uid) -> Arc<Self> {
        Arc::new(Self {
            dd_id,
            team_collections: StdRwLock::new(Vec::new()),
            metrics_requests: StdMutex::new(None),
        })
    }

    pub fn team_collections(&self) -> Vec<Arc<dyn TeamCollection>> {
        self.team_collections.read().unwrap().clone()
    }

    pub fn metrics_requests(&self) -> Option<mpsc::UnboundedSender<MetricsListRequest>> {
        self.metrics_requests.lock().unwrap().clone()
    }

    fn install_pipeline(
        &self,
        team_collections: Vec<Arc<dyn TeamCollection>>,
        metrics: mpsc::UnboundedSender<MetricsListRequest>,
    ) {
        *self.team_collections.write().unwrap() = team_collections;
        *self.metrics_requests.lock().unwrap() = Some(metrics);
    }

    fn clear_pipeline(&self) {
        self.team_collections.write().unwrap().clear();
        self.metrics_requests.lock().unwrap().take();
    }
}

/// Everything the supervisor runs against.
pub struct SupervisorEnv {
    pub store: Arc<dyn SystemStore>,
    pub cluster: watch::Receiver<ClusterView>,
    pub builder: Arc<dyn PipelineBuilder>,
    pub enabled: Arc<DdEnabledState>,
    pub config: DistributorConfig,
}

/// Zeroed movement telemetry, emitted while distribution is disabled so
/// dashboards see explicit zeros rather than stale figures.
fn emit_disabled_movement_events(dd_id: Uid, usable_regions: usize) {
    tracing::info!(
        dd_id = %dd_id.short_string(),
        in_flight = 0,
        in_queue = 0,
        average_shard_size = -1,
        unhealthy_relocations = 0,
        highest_priority = 0,
        bytes_written = 0,
        priority_recover_move = 0,
        priority_rebalance_underutilized_team = 0,
        priority_rebalance_overutilized_team = 0,
        priority_team_healthy = 0,
        priority_team_contains_undesired_server = 0,
        priority_team_redundant = 0,
        priority_merge_shard = 0,
        priority_team_unhealthy = 0,
        priority_team_2_left = 0,
        priority_team_1_left = 0,
        priority_team_0_left = 0,
        priority_split_shard = 0,
        "moving data"
    );
    tracing::info!(
        dd_id = %dd_id.short_string(),
        primary = true,
        total_bytes = 0,
        unhealthy_servers = 0,
        highest_priority = 0,
        "total data in flight"
    );
    tracing::info!(
        dd_id = %dd_id.short_string(),
        primary = false,
        total_bytes = 0,
        unhealthy_servers = 0,
        highest_priority = if usable_regions > 1 { 0 } else { -1 },
        "total data in flight"
    );
}

/// Cap every configured datacenter's replica count at the storage team size
/// and drop entries for datacenters no longer configured.
pub async fn update_replica_keys(
    store: &dyn SystemStore,
    configuration: &DatabaseConfiguration,
    primary_dc_id: &Option<Key>,
    remote_dc_ids: &[Key],
) -> Result<()> {
    let primary = primary_dc_id.clone();
    let remotes = remote_dc_ids.to_vec();
    let team_size = configuration.storage_team_size;
    let usable_regions = configuration.usable_regions;
    strand_core::run_transaction(
        store,
        &[TxOption::AccessSystemKeys, TxOption::PrioritySystemImmediate],
        move |tr| {
            let primary = primary.clone();
            let remotes = remotes.clone();
            async move {
                let rows = read_range_assert_complete(
                    tr,
                    &prefix_range(DATACENTER_REPLICAS_PREFIX),
                    TOO_MANY,
                )
                .await?;
                for kv in &rows {
                    let dc_id = decode_datacenter_replicas_key(&kv.key)?;
                    let replicas = decode_datacenter_replicas_value(&kv.value)?;
                    let configured = primary.as_ref() == Some(&dc_id)
                        || (usable_regions > 1 && remotes.first() == Some(&dc_id));
                    if configured {
                        if replicas > team_size {
                            tr.set(&kv.key, &encode_datacenter_replicas_value(team_size));
                        }
                    } else {
                        tr.clear(&kv.key);
                    }
                }
                Ok(())
            }
            .boxed()
        },
    )
    .await
}

/// Block until the mode key and the in-memory flag both allow distribution.
pub async fn wait_for_dd_enabled(
    store: &dyn SystemStore,
    enabled: &DdEnabledState,
    cfg: &DistributorConfig,
) -> Result<()> {
    let mut tr = store.transaction();
    loop {
        tokio::time::sleep(cfg.dd_enabled_check_delay).await;
        let attempt: Result<bool> = async {
            match tr.get(DATA_DISTRIBUTION_MODE_KEY).await? {
                None => Ok(enabled.is_enabled()),
                Some(value) => {
                    let mode = decode_mode(&value)?;
                    tracing::debug!(mode, enabled = enabled.is_enabled(), "waiting for distribution to be enabled");
                    Ok(mode != 0 && enabled.is_enabled())
                }
            }
        }
        .await;
        match attempt {
            Ok(true) => {
                tracing::info!("wait for enabled distribution succeeded");
                return Ok(());
            }
            Ok(false) => tr.reset(),
            Err(err) => tr.on_error(err).await?,
        }
    }
}

/// One-shot check of the same condition, with the lock-owner escape hatch
/// for clusters disabled through the lock key.
pub async fn is_data_distribution_enabled(
    store: &dyn SystemStore,
    enabled: &DdEnabledState,
) -> Result<bool> {
    let mut tr = store.transaction();
    loop {
        let attempt: Result<bool> = async {
            match tr.get(DATA_DISTRIBUTION_MODE_KEY).await? {
                None => {
                    if enabled.is_enabled() {
                        return Ok(true);
                    }
                }
                Some(value) => {
                    if decode_mode(&value)? != 0 && enabled.is_enabled() {
                        return Ok(true);
                    }
                }
            }
            let owner: Uid = match tr.get(MOVE_KEYS_LOCK_OWNER_KEY).await? {
                Some(value) => serde_json::from_slice(&value)?,
                None => Uid::default(),
            };
            Ok(enabled.is_enabled() && !owner_is_mode_lock(owner))
        }
        .await;
        match attempt {
            Ok(value) => return Ok(value),
            Err(err) => tr.on_error(err).await?,
        }
    }
}

/// Remote team collections must not start before every log is recruited.
pub async fn remote_recovered(mut cluster: watch::Receiver<ClusterView>) -> Result<()> {
    tracing::info!("remote tracker starting");
    loop {
        let state = cluster.borrow_and_update().recovery_state;
        if state >= RecoveryState::AllLogsRecruited {
            return Ok(());
        }
        tracing::info!(recovery_state = ?state, "remote tracker waiting for recovery");
        if cluster.changed().await.is_err() {
            return Err(Error::BrokenPromise);
        }
    }
}

/// Prime the pipeline from the startup snapshot: register every shard with
/// its source teams and enqueue the relocations that recover in-flight and
/// cancelled moves.
pub async fn seed_pipeline(
    init_data: &InitialDataDistribution,
    configuration: &DatabaseConfiguration,
    shards_affected: &StdMutex<ShardsAffectedByTeamFailure>,
    physical_shards: Option<&StdMutex<PhysicalShardCollection>>,
    relocations: &RelocationSender,
    cfg: &DistributorConfig,
    dd_id: Uid,
) -> Result<()> {
    for window in init_data.shards.windows(2) {
        let shard = &window[0];
        let keys = KeyRange::new(shard.key.clone(), window[1].key.clone());

        let mut teams = vec![Team::new(shard.primary_src.clone(), true)];
        if configuration.usable_regions > 1 {
            teams.push(Team::new(shard.remote_src.clone(), false));
        }

        {
            let mut sabtf = shards_affected.lock().unwrap();
            sabtf.define_shard(&keys);
            sabtf.move_shard(&keys, teams.clone());
        }

        if let Some(physical) = physical_shards {
            let mut dest_teams = vec![Team::new(shard.primary_dest.clone(), true)];
            if configuration.usable_regions > 1 {
                dest_teams.push(Team::new(shard.remote_dest.clone(), false));
            }
            let mut physical = physical.lock().unwrap();
            if shard.src_id != ANONYMOUS_SHARD_ID {
                physical.update_shard_teams(shard.src_id.first, &teams);
                physical.ensure_shard(shard.src_id.first);
            }
            if shard.has_dest && shard.dest_id != ANONYMOUS_SHARD_ID {
                physical.update_shard_teams(shard.dest_id.first, &dest_teams);
                physical.ensure_shard(shard.dest_id.first);
            }
            // Ranges point at their source shard; the destination takes over
            // when the relocation is restored.
            physical.assign_range(&keys, shard.src_id.first);
        }

        if cfg.simulated {
            tracing::info!(
                dd_id = %dd_id.short_string(),
                keys = ?keys,
                primary_src = ?shard.primary_src,
                remote_src = ?shard.remote_src,
                primary_dest = ?shard.primary_dest,
                remote_dest = ?shard.remote_dest,
                src_id = %shard.src_id,
                dest_id = %shard.dest_id,
                "seeded shard"
            );
        }

        if shard.has_dest && shard.dest_id == ANONYMOUS_SHARD_ID {
            // The move predates structured metadata, so nothing tracks it.
            // Rescheduling the range is simpler than reconstructing the
            // relocation in place.
            let mut unhealthy = shard.primary_src.len() != configuration.storage_team_size;
            if !unhealthy && configuration.usable_regions > 1 {
                unhealthy = shard.remote_src.len() != configuration.storage_team_size;
            }
            let rs = RelocateShard::new(
                keys,
                if unhealthy {
                    priority::TEAM_UNHEALTHY
                } else {
                    priority::RECOVER_MOVE
                },
                RelocateReason::Other,
            );
            relocations.send(rs);
        }

        tokio::task::yield_now().await;
    }

    let entries: Vec<(KeyRange, crate::initial::SharedDataMove)> = init_data
        .data_move_map
        .ranges()
        .map(|(range, dm)| (range, dm.clone()))
        .collect();
    for (range, shared) in entries {
        let dm = shared.lock().unwrap().clone();
        if dm.is_cancelled() || (dm.valid && !cfg.shard_encode_location_metadata) {
            let mut rs = RelocateShard::new(
                dm.meta.range.clone(),
                priority::RECOVER_MOVE,
                RelocateReason::Other,
            );
            rs.data_move_id = Some(dm.meta.id);
            rs.cancelled = true;
            relocations.send(rs);
            tracing::info!(
                dd_id = %dd_id.short_string(),
                data_move = ?dm.meta,
                "scheduled cancellation of data move"
            );
        } else if dm.valid {
            tracing::debug!(dd_id = %dd_id.short_string(), data_move = ?dm.meta, "restoring data move");
            assert_eq!(dm.meta.range, range);
            let mut rs = RelocateShard::new(
                dm.meta.range.clone(),
                priority::RECOVER_MOVE,
                RelocateReason::Other,
            );
            rs.data_move_id = Some(dm.meta.id);
            rs.data_move = Some(shared.clone());

            let mut teams = vec![Team::new(dm.primary_dest.clone(), true)];
            if !dm.remote_dest.is_empty() {
                teams.push(Team::new(dm.remote_dest.clone(), false));
            }

            // A move can cover several shards (a merge in flight), so the
            // target range is redefined and its tracker restarted.
            {
                let mut sabtf = shards_affected.lock().unwrap();
                sabtf.restart_shard_tracker(rs.keys.clone());
                sabtf.define_shard(&rs.keys);
                sabtf.move_shard(&rs.keys, teams);
            }
            relocations.send(rs);
            tokio::task::yield_now().await;
        }
    }
    Ok(())
}

/// Drop the tracker's shard map a batch of boundaries at a time, yielding
/// between batches so in-flight endpoint traffic can settle.
pub async fn clear_shard_map_async(shard_map: &SharedShardMap) {
    loop {
        let removed = shard_map.lock().await.drain_boundaries(64);
        if removed == 0 {
            return;
        }
        tokio::task::yield_now().await;
    }
}

async fn report_errors_except(
    name: &'static str,
    dd_id: Uid,
    fut: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    match fut.await {
        Ok(()) => Ok(()),
        Err(err) => {
            if !err.is_normal_queue_error() && err != Error::ActorCancelled {
                tracing::error!(actor = name, dd_id = %dd_id.short_string(), error = %err, "pipeline actor failed");
            }
            Err(err)
        }
    }
}

struct IterationState {
    lock: Option<MoveKeysLock>,
    team_collections: Vec<Arc<dyn TeamCollection>>,
}

/// Run the distribution supervisor until a fatal error or role shutdown.
pub async fn data_distribution(data: Arc<DistributorData>, env: SupervisorEnv) -> Result<()> {
    let cfg = env.config.clone();
    let dd_id = data.dd_id;

    loop {
        // The shard map outlives the tracker so a cancelled tracker cannot
        // leave it half-destroyed.
        let shard_map = new_shard_map();
        let (remove_failed_tx, mut remove_failed_rx) = oneshot::channel::<Uid>();
        let mut state = IterationState {
            lock: None,
            team_collections: Vec::new(),
        };

        let result = run_iteration(
            &data,
            &env,
            &cfg,
            shard_map.clone(),
            remove_failed_tx,
            &mut state,
        )
        .await;

        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        tracing::info!(dd_id = %dd_id.short_string(), error = %err, "tearing down team collections");

        // A failed-server removal granted by a team collection is honored
        // during teardown: pick a healthy team per region to rehost the
        // dropped ranges.
        let failed_server = remove_failed_rx.try_recv().ok();
        let mut team_for_dropped_range: Vec<Uid> = Vec::new();
        if let Some(server) = failed_server {
            for tc in &state.team_collections {
                team_for_dropped_range.extend(tc.random_healthy_team(server));
            }
        }

        data.clear_pipeline();
        state.team_collections.clear();

        if err == Error::ActorCancelled {
            if !cfg.simulated {
                // Synchronous clearing outside simulation can touch
                // endpoints whose peers are still live.
                tracing::warn!(dd_id = %dd_id.short_string(), "distributor cancelled");
            }
            while shard_map.lock().await.drain_boundaries(usize::MAX) > 0 {}
            return Err(err);
        }
        clear_shard_map_async(&shard_map).await;
        tracing::info!(dd_id = %dd_id.short_string(), error = %err, "team collections destroyed");

        if let Some(server) = failed_server {
            tracing::info!(server = %server, error = %err, "removing failed server");
            let lock = state
                .lock
                .ok_or_else(|| Error::Internal("failed server removal without a lock".into()))?;
            let mover = env.builder.move_keys();
            mover
                .remove_keys_from_failed_server(
                    server,
                    team_for_dropped_range,
                    lock,
                    env.enabled.clone(),
                )
                .await?;
            mover
                .remove_storage_server(server, None, lock, env.enabled.clone())
                .await?;
        } else {
            if err != Error::MoveKeysConflict {
                return Err(err);
            }
            let dd_enabled = is_data_distribution_enabled(env.store.as_ref(), &env.enabled).await?;
            tracing::info!(error = %err, dd_enabled, "move keys lock conflict");
            if dd_enabled {
                return Err(err);
            }
            // Disabled: the conflict was expected; start over and wait.
        }
    }
}

async fn run_iteration(
    data: &Arc<DistributorData>,
    env: &SupervisorEnv,
    cfg: &DistributorConfig,
    shard_map: SharedShardMap,
    remove_failed_tx: oneshot::Sender<Uid>,
    state: &mut IterationState,
) -> Result<()> {
    let dd_id = data.dd_id;
    let store = env.store.as_ref();

    // Startup: lock, configuration, replica keys, snapshot, and the
    // enabled gate, repeated until the cluster lets us run.
    let (configuration, primary_dc_id, remote_dc_ids, init_data) = loop {
        tracing::info!(dd_id = %dd_id.short_string(), "taking move keys lock");
        let lock = take_move_keys_lock(store, dd_id).await?;
        state.lock = Some(lock);

        let configuration = get_database_configuration(store).await?;
        let primary_dc_id = configuration.primary_dc_id();
        let remote_dc_ids = if configuration.usable_regions > 1 {
            configuration.remote_dc_ids()
        } else {
            Vec::new()
        };
        tracing::info!(dd_id = %dd_id.short_string(), configuration = ?configuration, "got configuration");

        update_replica_keys(store, &configuration, &primary_dc_id, &remote_dc_ids).await?;
        tracing::info!(dd_id = %dd_id.short_string(), "updated replica keys");

        let init_data = get_initial_data_distribution(
            store,
            dd_id,
            &lock,
            &remote_dc_ids,
            &env.enabled,
            cfg,
        )
        .await?;
        if init_data.shards.len() > 1 {
            let last = &init_data.shards[init_data.shards.len() - 2];
            tracing::info!(
                dd_id = %dd_id.short_string(),
                begin = ?String::from_utf8_lossy(&last.key),
                end = ?String::from_utf8_lossy(&init_data.shards[init_data.shards.len() - 1].key),
                src = ?last.primary_src,
                dest = ?last.primary_dest,
                "got initial distribution"
            );
        } else {
            tracing::info!(dd_id = %dd_id.short_string(), "got empty initial distribution");
        }

        if init_data.mode != 0 && env.enabled.is_enabled() {
            // The mode key can flip back at any time; both gates held here.
            break (configuration, primary_dc_id, remote_dc_ids, init_data);
        }

        tracing::info!(dd_id = %dd_id.short_string(), "data distribution disabled");
        emit_disabled_movement_events(dd_id, configuration.usable_regions);
        wait_for_dd_enabled(store, &env.enabled, cfg).await?;
        tracing::info!("data distribution enabled");
    };

    let tenant_cache = if cfg.tenant_aware {
        let cache = env.builder.tenant_cache();
        if let Some(cache) = &cache {
            cache.build().await?;
        }
        cache
    } else {
        None
    };

    assert!(configuration.storage_team_size > 0);

    let init_data = Arc::new(init_data);
    let (output_tx, output_rx) = mpsc::unbounded_channel::<RelocateShard>();
    let (input_tx, input_rx) = mpsc::unbounded_channel::<RelocateShard>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let relocations = RelocationSender::new(cfg.dd_framework, output_tx, event_tx);

    let (sabtf, restart_rx) = ShardsAffectedByTeamFailure::new();
    let shards_affected = Arc::new(StdMutex::new(sabtf));
    let physical_shards = cfg
        .physical_shard_core
        .then(|| Arc::new(StdMutex::new(PhysicalShardCollection::new())));

    seed_pipeline(
        &init_data,
        &configuration,
        &shards_affected,
        physical_shards.as_deref(),
        &relocations,
        cfg,
        dd_id,
    )
    .await?;

    let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
    let (processing_unhealthy, _) = watch::channel(false);
    let (processing_wiggle, _) = watch::channel(false);

    let lock = state
        .lock
        .ok_or_else(|| Error::Internal("pipeline started without a lock".into()))?;
    let cx = PipelineContext {
        store: env.store.clone(),
        dd_id,
        lock,
        configuration: configuration.clone(),
        primary_dc_id,
        remote_dc_ids,
        init_data: init_data.clone(),
        shards_affected,
        restart_shard_tracker: restart_rx,
        relocations: relocations.clone(),
        relocation_input: input_rx,
        dd_events: event_rx,
        shard_map,
        metrics_list: metrics_rx,
        remove_failed_server: remove_failed_tx,
        enabled: env.enabled.clone(),
        cluster: env.cluster.clone(),
        processing_unhealthy,
        processing_wiggle,
    };

    let pipeline = env.builder.build(cx).await?;
    state.team_collections = pipeline.team_collections.clone();
    data.install_pipeline(pipeline.team_collections.clone(), metrics_tx.clone());

    let mut actors: FuturesUnordered<futures_util::future::BoxFuture<'static, Result<()>>> =
        FuturesUnordered::new();
    actors.push(
        report_errors_except(
            "MoveKeysLockPoller",
            dd_id,
            poll_move_keys_lock(
                env.store.clone(),
                lock,
                env.enabled.clone(),
                cfg.move_keys_lock_poll_delay,
            ),
        )
        .boxed(),
    );
    for actor in pipeline.actors {
        actors.push(report_errors_except(actor.name, dd_id, actor.fut).boxed());
    }
    actors.push(
        report_errors_except(
            "RelocationForwarder",
            dd_id,
            yield_relocation_stream(output_rx, input_tx),
        )
        .boxed(),
    );
    if let Some(physical) = physical_shards {
        actors.push(
            report_errors_except(
                "PhysicalShardMonitor",
                dd_id,
                monitor_physical_shards(
                    physical,
                    relocations.clone(),
                    Some(metrics_tx),
                    cfg.clone(),
                ),
            )
            .boxed(),
        );
    }
    if let Some(cache) = tenant_cache {
        actors.push(
            report_errors_except("TenantCacheMonitor", dd_id, async move {
                cache.monitor().await
            })
            .boxed(),
        );
    }

    while let Some(res) = actors.next().await {
        res?;
    }
    Ok(())
}

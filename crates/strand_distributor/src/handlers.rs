//! The distributor's request surface and top-level actor.
//!
//! The recruiting worker drives this role through a request channel: halt,
//! shard metrics, snapshot, exclusion safety, and wiggler state. Requests
//! are answered while the supervisor loop runs underneath; when the
//! supervisor dies with a normal error the role exits cleanly and is
//! re-recruited.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use strand_core::{Error, KeyRange, Result, SystemStore, Uid};

use crate::initial::get_server_list_and_process_classes;
use crate::pipeline::{MetricsListRequest, ShardMetrics};
use crate::snapshot::dd_snap_create;
use crate::supervisor::{data_distribution, DistributorData, SupervisorEnv};
use crate::teams::WigglerState;
use crate::watcher::cache_server_watcher;

/// An operator exclusion by address: either a whole machine (`ip`) or one
/// process (`ip:port`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressExclusion {
    pub ip: String,
    pub port: Option<u16>,
}

impl AddressExclusion {
    pub fn machine(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: None,
        }
    }

    pub fn process(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port: Some(port),
        }
    }

    pub fn excludes(&self, addr: &str) -> bool {
        match self.port {
            Some(port) => addr == format!("{}:{port}", self.ip),
            None => addr.split(':').next() == Some(self.ip.as_str()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExclusionSafetyReply {
    pub safe: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WigglerStateReply {
    pub primary: WigglerState,
    pub last_state_change_primary: u64,
    pub remote: Option<WigglerState>,
    pub last_state_change_remote: Option<u64>,
}

/// Metrics reply: the full listing, or just the median shard size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricsReply {
    List(Vec<ShardMetrics>),
    MidShardSize(i64),
}

/// Requests served by the distributor role.
pub enum DistributorRequest {
    Halt {
        requester: Uid,
        reply: oneshot::Sender<()>,
    },
    Metrics {
        keys: KeyRange,
        shard_limit: usize,
        mid_only: bool,
        reply: oneshot::Sender<Result<MetricsReply>>,
    },
    Snap {
        payload: String,
        snap_uid: Uid,
        reply: oneshot::Sender<Result<()>>,
    },
    ExclusionSafetyCheck {
        exclusions: Vec<AddressExclusion>,
        reply: oneshot::Sender<Result<ExclusionSafetyReply>>,
    },
    WigglerState {
        reply: oneshot::Sender<WigglerStateReply>,
    },
}

/// Median by nth-element selection; zero when nothing is tracked.
pub fn median_shard_size(mut metrics: Vec<ShardMetrics>) -> i64 {
    if metrics.is_empty() {
        return 0;
    }
    let mid = metrics.len() / 2;
    let (_, median, _) = metrics.select_nth_unstable_by_key(mid, |m| m.shard_bytes);
    median.shard_bytes
}

async fn dd_get_metrics(
    data: Arc<DistributorData>,
    keys: KeyRange,
    shard_limit: usize,
    mid_only: bool,
) -> Result<MetricsReply> {
    let Some(requests) = data.metrics_requests() else {
        return Err(Error::BrokenPromise);
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = MetricsListRequest {
        keys,
        shard_limit,
        reply: reply_tx,
    };
    if requests.send(request).is_err() {
        return Err(Error::BrokenPromise);
    }
    let metrics = reply_rx.await.map_err(|_| Error::BrokenPromise)??;
    if mid_only {
        Ok(MetricsReply::MidShardSize(median_shard_size(metrics)))
    } else {
        Ok(MetricsReply::List(metrics))
    }
}

async fn dd_exclusion_safety_check(
    data: Arc<DistributorData>,
    store: Arc<dyn SystemStore>,
    exclusions: Vec<AddressExclusion>,
) -> Result<ExclusionSafetyReply> {
    tracing::info!(dd_id = %data.dd_id.short_string(), "exclusion safety check begin");
    let servers = {
        let mut tr = store.transaction();
        loop {
            match get_server_list_and_process_classes(tr.as_mut()).await {
                Ok(servers) => break servers,
                Err(err) => tr.on_error(err).await?,
            }
        }
    };

    let team_collections = data.team_collections();
    let Some(primary) = team_collections.iter().find(|tc| tc.is_primary()) else {
        tracing::info!(dd_id = %data.dd_id.short_string(), "exclusion safety check without team collection");
        return Ok(ExclusionSafetyReply { safe: false });
    };
    // With a single team left, marking servers failed can wedge team
    // building entirely.
    if primary.team_count() <= 1 {
        tracing::info!(dd_id = %data.dd_id.short_string(), "exclusion safety check with too few teams");
        return Ok(ExclusionSafetyReply { safe: false });
    }

    let mut exclude_ids: Vec<Uid> = Vec::new();
    for exclusion in &exclusions {
        for (ssi, _) in &servers {
            let secondary_hit = ssi
                .secondary_address
                .as_deref()
                .map(|addr| exclusion.excludes(addr))
                .unwrap_or(false);
            if exclusion.excludes(&ssi.address) || secondary_hit {
                exclude_ids.push(ssi.id);
            }
        }
    }
    let safe = primary.exclusion_safety_check(&exclude_ids);
    tracing::info!(dd_id = %data.dd_id.short_string(), safe, "exclusion safety check finish");
    Ok(ExclusionSafetyReply { safe })
}

fn get_storage_wiggler_states(data: &DistributorData) -> WigglerStateReply {
    let mut reply = WigglerStateReply {
        primary: WigglerState::Invalid,
        last_state_change_primary: 0,
        remote: None,
        last_state_change_remote: None,
    };
    for tc in data.team_collections() {
        let (state, changed) = tc.wiggler_state();
        if tc.is_primary() {
            reply.primary = state;
            reply.last_state_change_primary = changed;
        } else {
            reply.remote = Some(state);
            reply.last_state_change_remote = Some(changed);
        }
    }
    reply
}

/// Run the distributor role: the supervision loop, the cache-server
/// watcher, and the request surface, until halt or a fatal error.
pub async fn data_distributor(
    data: Arc<DistributorData>,
    env: SupervisorEnv,
    mut requests: mpsc::UnboundedReceiver<DistributorRequest>,
    cache_failures: mpsc::UnboundedReceiver<Uid>,
) -> Result<()> {
    let dd_id = data.dd_id;
    tracing::info!(dd_id = %dd_id.short_string(), "data distributor running");

    let store = env.store.clone();
    let cluster = env.cluster.clone();
    let enabled = env.enabled.clone();
    let cfg = env.config.clone();

    let mut watcher = tokio::spawn(cache_server_watcher(
        store.clone(),
        cache_failures,
        cfg.clone(),
    ));
    let mut distributor = tokio::spawn(data_distribution(data.clone(), env));
    let mut subtasks: JoinSet<()> = JoinSet::new();

    let result: Result<()> = loop {
        tokio::select! {
            res = &mut distributor => {
                break res.unwrap_or(Err(Error::Internal("distribution task died".into())));
            }
            res = &mut watcher => {
                break res.unwrap_or(Err(Error::Internal("cache watcher task died".into())));
            }
            Some(joined) = subtasks.join_next(), if !subtasks.is_empty() => {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "request handler panicked");
                }
            }
            req = requests.recv() => {
                match req {
                    None => break Ok(()),
                    Some(DistributorRequest::Halt { requester, reply }) => {
                        let _ = reply.send(());
                        tracing::info!(
                            dd_id = %dd_id.short_string(),
                            requester = %requester.short_string(),
                            "data distributor halted"
                        );
                        break Ok(());
                    }
                    Some(DistributorRequest::Metrics { keys, shard_limit, mid_only, reply }) => {
                        let data = data.clone();
                        subtasks.spawn(async move {
                            let _ = reply.send(dd_get_metrics(data, keys, shard_limit, mid_only).await);
                        });
                    }
                    Some(DistributorRequest::Snap { payload, snap_uid, reply }) => {
                        let store = store.clone();
                        let cluster = cluster.clone();
                        let enabled = enabled.clone();
                        let cfg = cfg.clone();
                        subtasks.spawn(async move {
                            let result =
                                dd_snap_create(payload, snap_uid, store, cluster, enabled, cfg)
                                    .await;
                            let _ = reply.send(result);
                        });
                    }
                    Some(DistributorRequest::ExclusionSafetyCheck { exclusions, reply }) => {
                        let data = data.clone();
                        let store = store.clone();
                        subtasks.spawn(async move {
                            let _ = reply
                                .send(dd_exclusion_safety_check(data, store, exclusions).await);
                        });
                    }
                    Some(DistributorRequest::WigglerState { reply }) => {
                        let _ = reply.send(get_storage_wiggler_states(&data));
                    }
                }
            }
        }
    };

    distributor.abort();
    watcher.abort();
    subtasks.abort_all();

    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_normal_distributor_error() => {
            tracing::info!(dd_id = %dd_id.short_string(), error = %err, "data distributor died");
            Ok(())
        }
        Err(err) => {
            tracing::error!(dd_id = %dd_id.short_string(), error = %err, "data distributor failed");
            Err(err)
        }
    }
}

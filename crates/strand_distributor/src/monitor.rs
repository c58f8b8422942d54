//! Physical-shard accounting and its periodic status monitor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use strand_core::{KeyRange, RangeMap, Result, Uid};

use crate::config::DistributorConfig;
use crate::pipeline::{MetricsListRequest, ShardMetrics};
use crate::relocation::{priority, DdEvent, DdEventPayload, RelocationSender};
use crate::teams::Team;

/// A physical shard groups one or more key ranges stored as a unit.
#[derive(Clone, Debug)]
pub struct PhysicalShard {
    pub id: u64,
    pub bytes: i64,
}

/// Bookkeeping shared between seeding and the monitor. The real accounting
/// (creation, merging, metrics updates) is driven by the tracker; this holds
/// the mappings the distributor core reads and logs.
pub struct PhysicalShardCollection {
    /// Key range -> physical shard id; zero means unassigned.
    pub range_shard_ids: RangeMap<u64>,
    pub shards: BTreeMap<u64, PhysicalShard>,
    pub team_shard_ids: BTreeMap<Team, BTreeSet<u64>>,
}

impl Default for PhysicalShardCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalShardCollection {
    pub fn new() -> Self {
        Self {
            range_shard_ids: RangeMap::new(0),
            shards: BTreeMap::new(),
            team_shard_ids: BTreeMap::new(),
        }
    }

    pub fn ensure_shard(&mut self, id: u64) {
        self.shards
            .entry(id)
            .or_insert(PhysicalShard { id, bytes: 0 });
    }

    pub fn update_shard_teams(&mut self, id: u64, teams: &[Team]) {
        for team in teams {
            self.team_shard_ids
                .entry(team.clone())
                .or_default()
                .insert(id);
        }
    }

    pub fn assign_range(&mut self, range: &KeyRange, id: u64) {
        self.range_shard_ids.insert(range, id);
    }
}

/// Periodically log per-shard, per-team, and per-server physical-shard
/// sizes, drop shards that no longer own a range, and feed merge events for
/// undersized shards.
///
/// Sizes come from the collection's recorded figures. Re-querying the
/// tracker instead is gated behind `remeasure_physical_shards`; the
/// recorded-size path is the long-standing behavior.
pub async fn monitor_physical_shards(
    collection: Arc<StdMutex<PhysicalShardCollection>>,
    relocations: RelocationSender,
    metrics_requests: Option<mpsc::UnboundedSender<MetricsListRequest>>,
    cfg: DistributorConfig,
) -> Result<()> {
    let mut ticker = tokio::time::interval(cfg.physical_shard_monitor_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        if cfg.remeasure_physical_shards {
            if let Some(requests) = &metrics_requests {
                remeasure(&collection, requests).await;
            }
        }

        let mut small_shards: Vec<u64> = Vec::new();
        {
            let mut collection = collection.lock().unwrap();

            // Group owned ranges by shard id.
            let mut shard_ranges: BTreeMap<u64, Vec<KeyRange>> = BTreeMap::new();
            for (range, id) in collection.range_shard_ids.ranges() {
                if *id != 0 {
                    shard_ranges.entry(*id).or_default().push(range);
                }
            }

            for (id, ranges) in &shard_ranges {
                let bytes = collection.shards.get(id).map(|s| s.bytes).unwrap_or(0);
                tracing::info!(
                    physical_shard = id,
                    num_key_ranges = ranges.len(),
                    total_bytes = bytes,
                    "physical shard status"
                );
                if bytes < cfg.min_physical_shard_bytes {
                    small_shards.push(*id);
                }
            }

            // Shards that own no range are gone.
            let orphaned: Vec<u64> = collection
                .shards
                .keys()
                .filter(|id| !shard_ranges.contains_key(id))
                .copied()
                .collect();
            for id in orphaned {
                tracing::info!(physical_shard = id, "physical shard has no key range");
                collection.shards.remove(&id);
                for ids in collection.team_shard_ids.values_mut() {
                    ids.remove(&id);
                }
            }

            for (team, ids) in &collection.team_shard_ids {
                let mut total = 0i64;
                let mut max = (0u64, i64::MIN);
                let mut min = (0u64, i64::MAX);
                for id in ids {
                    let bytes = collection.shards.get(id).map(|s| s.bytes).unwrap_or(0);
                    total += bytes;
                    if bytes > max.1 {
                        max = (*id, bytes);
                    }
                    if bytes < min.1 {
                        min = (*id, bytes);
                    }
                }
                tracing::info!(
                    team = ?team.servers,
                    primary = team.primary,
                    num_physical_shards = ids.len(),
                    total_bytes = total,
                    max_physical_shard = max.0,
                    max_bytes = max.1,
                    min_physical_shard = min.0,
                    min_bytes = min.1,
                    "team physical shard status"
                );
            }

            // Per-server rollup across the server's teams.
            let mut per_server: BTreeMap<Uid, (usize, i64)> = BTreeMap::new();
            for (team, ids) in &collection.team_shard_ids {
                for server in &team.servers {
                    let entry = per_server.entry(*server).or_insert((0, 0));
                    for id in ids {
                        entry.0 += 1;
                        entry.1 += collection.shards.get(id).map(|s| s.bytes).unwrap_or(0);
                    }
                }
            }
            for (server, (count, bytes)) in per_server {
                tracing::info!(
                    server = %server.short_string(),
                    num_physical_shards = count,
                    total_bytes = bytes,
                    "server physical shard status"
                );
            }
        }

        if cfg.physical_shard_size_control {
            for id in small_shards {
                relocations.send_event(DdEvent {
                    priority: priority::MERGE_PHYSICAL_SHARD,
                    payload: DdEventPayload::MergePhysicalShard(id),
                });
            }
        }
    }
}

/// Refresh recorded sizes from the tracker's metrics listing.
async fn remeasure(
    collection: &Arc<StdMutex<PhysicalShardCollection>>,
    requests: &mpsc::UnboundedSender<MetricsListRequest>,
) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let req = MetricsListRequest {
        keys: KeyRange::all(),
        shard_limit: usize::MAX,
        reply: reply_tx,
    };
    if requests.send(req).is_err() {
        return;
    }
    let metrics: Vec<ShardMetrics> = match reply_rx.await {
        Ok(Ok(metrics)) => metrics,
        _ => return,
    };

    let mut collection = collection.lock().unwrap();
    let mut totals: BTreeMap<u64, i64> = BTreeMap::new();
    for m in &metrics {
        let id = *collection.range_shard_ids.value_at(&m.begin_key);
        if id != 0 {
            *totals.entry(id).or_insert(0) += m.shard_bytes;
        }
    }
    for (id, bytes) in totals {
        if let Some(shard) = collection.shards.get_mut(&id) {
            shard.bytes = bytes;
        }
    }
}

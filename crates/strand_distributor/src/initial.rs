//! Reconstruction of the cluster's placement state at startup.
//!
//! `get_initial_data_distribution` snapshots the server list, the
//! key-servers map, and the persisted data-move table into one immutable
//! `InitialDataDistribution`. The server and move tables are read in a
//! single transaction; the key-servers map is scanned in boundary-aligned
//! chunks, each chunk consistent at its own read version, with the
//! move-keys lock re-verified per chunk.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use strand_core::cluster::{
    decode_data_move_value, decode_healthy_zone, decode_key_servers_value, decode_mode,
    decode_server_list_value, decode_worker_list_value, DataMoveMeta, ProcessClass, ProcessData,
    StorageServerInterface,
};
use strand_core::ids::ANONYMOUS_SHARD_ID;
use strand_core::keys::{
    self, decode_server_tag_key, krm_get_ranges, prefix_range, read_range_assert_complete,
    DATA_DISTRIBUTION_MODE_KEY, HEALTHY_ZONE_KEY, KEY_SERVERS_PREFIX,
};
use strand_core::{
    Error, Key, KeyRange, RangeMap, Result, SystemStore, Transaction, TxOption, Uid, TOO_MANY,
};

use crate::config::DistributorConfig;
use crate::enabled::DdEnabledState;
use crate::lock::{check_move_keys_lock_read_only, MoveKeysLock};

/// The unit of placement: one contiguous key range and the teams serving it.
/// `key` is the range start; the next shard's `key` is the exclusive end.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DdShardInfo {
    pub key: Key,
    pub src_id: Uid,
    pub dest_id: Uid,
    pub primary_src: Vec<Uid>,
    pub remote_src: Vec<Uid>,
    pub primary_dest: Vec<Uid>,
    pub remote_dest: Vec<Uid>,
    pub has_dest: bool,
}

impl DdShardInfo {
    /// The trailing sentinel shard, carrying no servers.
    pub fn sentinel(key: Key) -> Self {
        Self {
            key,
            src_id: ANONYMOUS_SHARD_ID,
            dest_id: ANONYMOUS_SHARD_ID,
            ..Default::default()
        }
    }

    pub fn with_ids(key: Key, src_id: Uid, dest_id: Uid) -> Self {
        Self {
            key,
            src_id,
            dest_id,
            ..Default::default()
        }
    }
}

/// A persisted data move with its server lists split by datacenter role.
#[derive(Clone, Debug, Default)]
pub struct DataMove {
    pub meta: DataMoveMeta,
    pub primary_src: Vec<Uid>,
    pub remote_src: Vec<Uid>,
    pub primary_dest: Vec<Uid>,
    pub remote_dest: Vec<Uid>,
    /// The record exists and is usable.
    pub valid: bool,
    /// Validation or an external request failed; recovery cancels the move.
    pub cancelled: bool,
}

pub type SharedDataMove = Arc<Mutex<DataMove>>;

/// Both lists sorted; true when every element of `sub` appears in `sup`.
fn sorted_subset(sub: &[Uid], sup: &[Uid]) -> bool {
    let mut it = sup.iter();
    sub.iter().all(|x| it.any(|y| y == x))
}

impl DataMove {
    pub fn from_meta(meta: DataMoveMeta, server_dc: &BTreeMap<Uid, Option<Key>>, remote_dc_ids: &[Key]) -> Self {
        let mut dm = DataMove {
            meta,
            valid: true,
            ..Default::default()
        };
        let is_remote = |id: &Uid| {
            server_dc
                .get(id)
                .and_then(|dc| dc.as_ref())
                .map(|dc| remote_dc_ids.contains(dc))
                .unwrap_or(false)
        };
        for id in &dm.meta.src {
            if is_remote(id) {
                dm.remote_src.push(*id);
            } else {
                dm.primary_src.push(*id);
            }
        }
        for id in &dm.meta.dest {
            if is_remote(id) {
                dm.remote_dest.push(*id);
            } else {
                dm.primary_dest.push(*id);
            }
        }
        dm.primary_src.sort();
        dm.remote_src.sort();
        dm.primary_dest.sort();
        dm.remote_dest.sort();
        dm
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Cross-check one shard against this move record. Mismatches emit an
    /// error event and mark the move cancelled so recovery treats it as a
    /// cancellation; they never abort the reader.
    pub fn validate_shard(&mut self, shard: &DdShardInfo, range: &KeyRange) {
        if !self.valid {
            if shard.has_dest && shard.dest_id != ANONYMOUS_SHARD_ID {
                tracing::error!(
                    range = ?range,
                    reason = "DataMoveMissing",
                    shard_primary_dest = ?shard.primary_dest,
                    shard_remote_dest = ?shard.remote_dest,
                    "data move validation error"
                );
            }
            return;
        }

        assert!(self.meta.range.contains_range(range));

        if !shard.has_dest {
            tracing::error!(
                range = ?range,
                reason = "ShardMissingDest",
                data_move = ?self.meta,
                move_primary_dest = ?self.primary_dest,
                move_remote_dest = ?self.remote_dest,
                "data move validation error"
            );
            self.cancelled = true;
            return;
        }

        if shard.dest_id != self.meta.id {
            tracing::error!(
                range = ?range,
                reason = "DataMoveIDMissMatch",
                data_move = ?self.meta,
                shard_move_id = %shard.dest_id,
                "data move validation error"
            );
            self.cancelled = true;
            return;
        }

        if !sorted_subset(&shard.primary_dest, &self.primary_dest)
            || !sorted_subset(&shard.remote_dest, &self.remote_dest)
        {
            tracing::error!(
                range = ?range,
                reason = "DataMoveDestMissMatch",
                data_move = ?self.meta,
                move_primary_dest = ?self.primary_dest,
                move_remote_dest = ?self.remote_dest,
                shard_primary_dest = ?shard.primary_dest,
                shard_remote_dest = ?shard.remote_dest,
                "data move validation error"
            );
            self.cancelled = true;
        }
    }
}

/// The immutable startup snapshot shared by the tracker, queue, and team
/// collections.
pub struct InitialDataDistribution {
    /// 0 means distribution is disabled persistently.
    pub mode: i32,
    pub init_healthy_zone: Option<Key>,
    pub all_servers: Vec<(StorageServerInterface, ProcessClass)>,
    /// Contiguous over the whole keyspace, terminated by a sentinel shard.
    pub shards: Vec<DdShardInfo>,
    pub primary_teams: BTreeSet<Vec<Uid>>,
    pub remote_teams: BTreeSet<Vec<Uid>>,
    pub data_move_map: RangeMap<SharedDataMove>,
}

impl InitialDataDistribution {
    fn new() -> Self {
        Self {
            mode: 1,
            init_healthy_zone: None,
            all_servers: Vec::new(),
            shards: Vec::new(),
            primary_teams: BTreeSet::new(),
            remote_teams: BTreeSet::new(),
            data_move_map: RangeMap::new(Arc::new(Mutex::new(DataMove::default()))),
        }
    }
}

/// Read every server interface with its process class, test-storage servers
/// included.
pub async fn get_server_list_and_process_classes(
    tr: &mut dyn Transaction,
) -> Result<Vec<(StorageServerInterface, ProcessClass)>> {
    let workers =
        read_range_assert_complete(tr, &prefix_range(keys::WORKER_LIST_PREFIX), TOO_MANY).await?;
    let servers =
        read_range_assert_complete(tr, &prefix_range(keys::SERVER_LIST_PREFIX), TOO_MANY).await?;

    let mut class_by_process: BTreeMap<String, ProcessData> = BTreeMap::new();
    for kv in &workers {
        let data = decode_worker_list_value(&kv.value)?;
        class_by_process.insert(data.process_id.clone(), data);
    }

    let mut out = Vec::with_capacity(servers.len());
    for kv in &servers {
        let ssi = decode_server_list_value(&kv.value)?;
        let class = class_by_process
            .get(&ssi.process_id)
            .map(|d| d.process_class)
            .unwrap_or_default();
        out.push((ssi, class));
    }
    Ok(out)
}

type TeamCache = BTreeMap<Vec<Uid>, (Vec<Uid>, Vec<Uid>)>;

fn partition_by_dc(
    servers: &[Uid],
    server_dc: &BTreeMap<Uid, Option<Key>>,
    remote_dc_ids: &[Key],
) -> (Vec<Uid>, Vec<Uid>) {
    let mut primary = Vec::new();
    let mut remote = Vec::new();
    for id in servers {
        let is_remote = server_dc
            .get(id)
            .and_then(|dc| dc.as_ref())
            .map(|dc| remote_dc_ids.contains(dc))
            .unwrap_or(false);
        if is_remote {
            remote.push(*id);
        } else {
            primary.push(*id);
        }
    }
    (primary, remote)
}

/// Snapshot the cluster's shard/team/move state.
pub async fn get_initial_data_distribution(
    store: &dyn SystemStore,
    dd_id: Uid,
    lock: &MoveKeysLock,
    remote_dc_ids: &[Key],
    enabled: &DdEnabledState,
    cfg: &DistributorConfig,
) -> Result<InitialDataDistribution> {
    let mut result = InitialDataDistribution::new();
    let all = KeyRange::all();

    let mut server_dc: BTreeMap<Uid, Option<Key>> = BTreeMap::new();
    let mut team_cache: TeamCache = BTreeMap::new();
    let mut tss_servers: Vec<(StorageServerInterface, ProcessClass)> = Vec::new();

    let mut tr = store.transaction();

    // Phase 1: healthy zone, mode, servers, and the data-move table in one
    // transaction. Partial state is cleared on every retry so entries are
    // never duplicated.
    loop {
        server_dc.clear();
        tss_servers.clear();
        result.all_servers.clear();
        result.data_move_map = RangeMap::new(Arc::new(Mutex::new(DataMove::default())));

        tr.set_option(TxOption::ReadSystemKeys);
        tr.set_option(TxOption::ReadLockAware);

        let attempt: Result<bool> = async {
            if let Some(value) = tr.get(HEALTHY_ZONE_KEY).await? {
                let zone = decode_healthy_zone(&value)?;
                let read_version = tr.read_version().await?;
                if zone.expiration_version > read_version
                    || zone.zone == keys::IGNORE_SS_FAILURES_ZONE
                {
                    result.init_healthy_zone = Some(zone.zone);
                } else {
                    result.init_healthy_zone = None;
                }
            } else {
                result.init_healthy_zone = None;
            }

            result.mode = 1;
            tr.set_option(TxOption::PrioritySystemImmediate);
            if let Some(value) = tr.get(DATA_DISTRIBUTION_MODE_KEY).await? {
                result.mode = decode_mode(&value)?;
            }
            if result.mode == 0 || !enabled.is_enabled() {
                // Disabled persistently (mode) or transiently (enable flag).
                tracing::debug!(dd_id = %dd_id.short_string(), "initial distribution read with distribution disabled");
                return Ok(true);
            }

            for (ssi, class) in get_server_list_and_process_classes(tr.as_mut()).await? {
                if ssi.tss {
                    tss_servers.push((ssi, class));
                } else {
                    server_dc.insert(ssi.id, ssi.datacenter.clone());
                    result.all_servers.push((ssi, class));
                }
            }

            let moves =
                read_range_assert_complete(tr.as_mut(), &prefix_range(keys::DATA_MOVE_PREFIX), TOO_MANY)
                    .await?;
            for kv in &moves {
                let meta = decode_data_move_value(&kv.value)?;
                let range = meta.range.clone();
                let dm = DataMove::from_meta(meta, &server_dc, remote_dc_ids);
                for (overlap, existing) in result.data_move_map.intersecting_ranges(&range) {
                    if existing.lock().unwrap().valid {
                        return Err(Error::Internal(format!(
                            "data move ranges overlap at {overlap:?}"
                        )));
                    }
                }
                result
                    .data_move_map
                    .insert(&range, Arc::new(Mutex::new(dm)));
            }
            Ok(false)
        }
        .await;

        match attempt {
            Ok(true) => {
                result.shards.push(DdShardInfo::sentinel(all.end.clone()));
                return Ok(result);
            }
            Ok(false) => break,
            Err(err) => {
                tr.on_error(err).await?;
                tracing::info!(dd_id = %dd_id.short_string(), "retrying initial team read");
            }
        }
    }

    // Phase 2: the key-servers map, chunk by chunk. Each chunk re-verifies
    // the move-keys lock and begins where the previous chunk ended.
    let mut begin = all.begin.clone();
    while begin < all.end {
        let chunk = loop {
            tr.set_option(TxOption::PrioritySystemImmediate);
            let attempt: Result<(BTreeSet<Uid>, Vec<strand_core::KeyValue>)> = async {
                check_move_keys_lock_read_only(tr.as_mut(), lock, enabled).await?;
                let tag_rows = read_range_assert_complete(
                    tr.as_mut(),
                    &prefix_range(keys::SERVER_TAG_PREFIX),
                    TOO_MANY,
                )
                .await?;
                let mut tagged = BTreeSet::new();
                for kv in &tag_rows {
                    tagged.insert(decode_server_tag_key(&kv.key)?);
                }
                let chunk = krm_get_ranges(
                    tr.as_mut(),
                    KEY_SERVERS_PREFIX,
                    &KeyRange::new(begin.clone(), all.end.clone()),
                    cfg.move_keys_chunk_rows,
                    cfg.move_keys_chunk_bytes,
                )
                .await?;
                Ok((tagged, chunk))
            }
            .await;

            match attempt {
                Ok(chunk) => break chunk,
                Err(err) => {
                    tracing::info!(
                        dd_id = %dd_id.short_string(),
                        error = %err,
                        "retrying key servers chunk read"
                    );
                    tr.on_error(err).await?;
                }
            }
        };

        let (tagged, boundaries) = chunk;
        for pair in boundaries.windows(2) {
            let mut value = decode_key_servers_value(&pair[0].value)?;
            value.src.sort();
            value.dest.sort();
            for id in value.src.iter().chain(value.dest.iter()) {
                if !tagged.contains(id) {
                    return Err(Error::Codec(format!("server {id} has no tag")));
                }
            }

            let mut info = DdShardInfo::with_ids(pair[0].key.clone(), value.src_id, value.dest_id);
            if !remote_dc_ids.is_empty() {
                match team_cache.get(&value.src) {
                    None => {
                        let (primary, remote) =
                            partition_by_dc(&value.src, &server_dc, remote_dc_ids);
                        result.primary_teams.insert(primary.clone());
                        result.remote_teams.insert(remote.clone());
                        team_cache.insert(value.src.clone(), (primary.clone(), remote.clone()));
                        info.primary_src = primary;
                        info.remote_src = remote;
                    }
                    Some((primary, remote)) => {
                        info.primary_src = primary.clone();
                        info.remote_src = remote.clone();
                    }
                }
                if !value.dest.is_empty() {
                    info.has_dest = true;
                    match team_cache.get(&value.dest) {
                        None => {
                            let (primary, remote) =
                                partition_by_dc(&value.dest, &server_dc, remote_dc_ids);
                            result.primary_teams.insert(primary.clone());
                            result.remote_teams.insert(remote.clone());
                            team_cache
                                .insert(value.dest.clone(), (primary.clone(), remote.clone()));
                            info.primary_dest = primary;
                            info.remote_dest = remote;
                        }
                        Some((primary, remote)) => {
                            info.primary_dest = primary.clone();
                            info.remote_dest = remote.clone();
                        }
                    }
                }
            } else {
                info.primary_src = value.src.clone();
                if !team_cache.contains_key(&value.src) {
                    result.primary_teams.insert(value.src.clone());
                    team_cache.insert(value.src.clone(), (Vec::new(), Vec::new()));
                }
                if !value.dest.is_empty() {
                    info.has_dest = true;
                    info.primary_dest = value.dest.clone();
                    if !team_cache.contains_key(&value.dest) {
                        result.primary_teams.insert(value.dest.clone());
                        team_cache.insert(value.dest.clone(), (Vec::new(), Vec::new()));
                    }
                }
            }
            result.shards.push(info);
        }

        if boundaries.is_empty() {
            return Err(Error::Internal("empty key servers chunk".into()));
        }
        begin = boundaries.last().unwrap().key.clone();
        tr.reset();
    }

    // A trailing sentinel with no keys or servers simplifies range pairing
    // for everything downstream.
    result.shards.push(DdShardInfo::sentinel(all.end));

    if cfg.shard_encode_location_metadata {
        for i in 0..result.shards.len() - 1 {
            let shard = &result.shards[i];
            let range = KeyRange::new(shard.key.clone(), result.shards[i + 1].key.clone());
            let dm = result.data_move_map.value_at(&range.begin).clone();
            dm.lock().unwrap().validate_shard(shard, &range);
        }
    }

    // Test-storage servers join the server list only after team
    // reconstruction so they never influence team membership.
    result.all_servers.extend(tss_servers);

    Ok(result)
}

/// Test-support scan asserting the key-servers map is coalesced: adjacent
/// boundaries with identical ownership are reported as error events.
pub async fn debug_check_coalescing(store: &dyn SystemStore) -> Result<()> {
    let mut tr = store.transaction();
    loop {
        let attempt: Result<()> = async {
            let chunk = krm_get_ranges(
                tr.as_mut(),
                KEY_SERVERS_PREFIX,
                &KeyRange::all(),
                TOO_MANY,
                usize::MAX,
            )
            .await?;
            for pair in chunk.windows(2) {
                if pair[1].key != KeyRange::all().end && pair[0].value == pair[1].value {
                    tracing::error!(
                        key1 = ?String::from_utf8_lossy(&pair[0].key),
                        key2 = ?String::from_utf8_lossy(&pair[1].key),
                        "uncoalesced key servers boundaries"
                    );
                }
            }
            Ok(())
        }
        .await;
        match attempt {
            Ok(()) => {
                tracing::info!("done checking coalescing");
                return Ok(());
            }
            Err(err) => tr.on_error(err).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u64) -> Uid {
        Uid::new(n, n)
    }

    #[test]
    fn partition_splits_by_remote_dc_membership() {
        let mut server_dc = BTreeMap::new();
        server_dc.insert(uid(1), Some(b"dc1".to_vec()));
        server_dc.insert(uid(2), Some(b"dc2".to_vec()));
        server_dc.insert(uid(3), None);
        let remote = vec![b"dc2".to_vec()];

        let (primary, remote_part) = partition_by_dc(&[uid(1), uid(2), uid(3)], &server_dc, &remote);
        assert_eq!(primary, vec![uid(1), uid(3)]);
        assert_eq!(remote_part, vec![uid(2)]);
    }

    #[test]
    fn validate_marks_id_mismatch_cancelled() {
        let mut dm = DataMove {
            meta: DataMoveMeta {
                id: uid(7),
                range: KeyRange::all(),
                src: vec![uid(1)],
                dest: vec![uid(2)],
                priority: 0,
            },
            primary_dest: vec![uid(2)],
            valid: true,
            ..Default::default()
        };
        let mut shard = DdShardInfo::with_ids(Vec::new(), uid(1), uid(8));
        shard.has_dest = true;
        shard.primary_dest = vec![uid(2)];

        dm.validate_shard(&shard, &KeyRange::new(b"a".to_vec(), b"b".to_vec()));
        assert!(dm.cancelled);
    }

    #[test]
    fn validate_marks_missing_dest_cancelled() {
        let mut dm = DataMove {
            meta: DataMoveMeta {
                id: uid(7),
                range: KeyRange::all(),
                ..Default::default()
            },
            valid: true,
            ..Default::default()
        };
        let shard = DdShardInfo::with_ids(Vec::new(), uid(1), ANONYMOUS_SHARD_ID);
        dm.validate_shard(&shard, &KeyRange::new(b"a".to_vec(), b"b".to_vec()));
        assert!(dm.cancelled);
    }

    #[test]
    fn validate_marks_dest_superset_cancelled() {
        let mut dm = DataMove {
            meta: DataMoveMeta {
                id: uid(7),
                range: KeyRange::all(),
                ..Default::default()
            },
            primary_dest: vec![uid(2)],
            valid: true,
            ..Default::default()
        };
        let mut shard = DdShardInfo::with_ids(Vec::new(), uid(1), uid(7));
        shard.has_dest = true;
        shard.primary_dest = vec![uid(2), uid(3)];

        dm.validate_shard(&shard, &KeyRange::new(b"a".to_vec(), b"b".to_vec()));
        assert!(dm.cancelled);
    }

    #[test]
    fn validate_absent_move_does_not_cancel() {
        let mut dm = DataMove::default();
        let mut shard = DdShardInfo::with_ids(Vec::new(), uid(1), uid(9));
        shard.has_dest = true;
        dm.validate_shard(&shard, &KeyRange::new(b"a".to_vec(), b"b".to_vec()));
        assert!(!dm.cancelled);
    }

    #[test]
    fn sorted_subset_matches_std_includes() {
        let sup = vec![uid(1), uid(2), uid(4)];
        assert!(sorted_subset(&[uid(1), uid(4)], &sup));
        assert!(sorted_subset(&[], &sup));
        assert!(!sorted_subset(&[uid(3)], &sup));
        assert!(!sorted_subset(&[uid(1), uid(1)], &sup));
    }
}

//! Integration tests for startup placement reconstruction.
//!
//! These run the reader against a seeded in-memory system keyspace with a
//! chunk size small enough to force multi-transaction key-server scans.

mod common;

use std::collections::BTreeMap;

use common::{fast_config, seed_data_move, seed_key_servers_boundary, TestCluster};
use strand_core::cluster::{encode_healthy_zone, DataMoveMeta, HealthyZoneValue, KeyServersValue};
use strand_core::ids::ANONYMOUS_SHARD_ID;
use strand_core::keys::{DATA_DISTRIBUTION_MODE_KEY, HEALTHY_ZONE_KEY, IGNORE_SS_FAILURES_ZONE};
use strand_core::{KeyRange, Uid};
use strand_distributor::harness::{server_uid, ClusterSeed};
use strand_distributor::initial::{debug_check_coalescing, get_initial_data_distribution};
use strand_distributor::lock::take_move_keys_lock;
use strand_distributor::relocation::{priority, RelocationSender};
use strand_distributor::supervisor::seed_pipeline;
use strand_distributor::teams::ShardsAffectedByTeamFailure;

fn two_region_seed() -> ClusterSeed {
    ClusterSeed {
        servers: 8,
        dcs: vec![b"dc0".to_vec(), b"dc1".to_vec()],
        team_size: 2,
        shards: 5,
    }
}

#[tokio::test]
async fn reconstruction_produces_a_contiguous_partitioned_snapshot() {
    let cluster = TestCluster::new(two_region_seed(), fast_config()).await;
    debug_check_coalescing(&cluster.store).await.unwrap();
    let lock = take_move_keys_lock(&cluster.store, cluster.data.dd_id)
        .await
        .unwrap();

    let remote_dcs = vec![b"dc1".to_vec()];
    let init = get_initial_data_distribution(
        &cluster.store,
        cluster.data.dd_id,
        &lock,
        &remote_dcs,
        &cluster.enabled,
        &cluster.config,
    )
    .await
    .unwrap();

    assert_eq!(init.mode, 1);
    assert_eq!(init.all_servers.len(), 8);

    // Contiguous, strictly increasing, starting at the first key and ending
    // with the sentinel.
    assert_eq!(init.shards.len(), cluster.seeded.boundaries.len() + 1);
    assert_eq!(init.shards[0].key, Vec::<u8>::new());
    assert_eq!(init.shards.last().unwrap().key, KeyRange::all().end);
    for pair in init.shards.windows(2) {
        assert!(pair[0].key < pair[1].key);
    }

    // Primary and remote source teams never cross datacenters.
    let dc_of: BTreeMap<Uid, usize> = (0..8).map(|i| (server_uid(i), i % 2)).collect();
    for shard in &init.shards[..init.shards.len() - 1] {
        assert_eq!(shard.primary_src.len(), 2);
        assert_eq!(shard.remote_src.len(), 2);
        for id in &shard.primary_src {
            assert_eq!(dc_of[id], 0, "primary team member in the remote region");
        }
        for id in &shard.remote_src {
            assert_eq!(dc_of[id], 1, "remote team member in the primary region");
        }
        assert!(!shard.has_dest);
    }

    // Equal source vectors share one partition (the team cache round-trips).
    let mut seen: BTreeMap<Vec<Uid>, (Vec<Uid>, Vec<Uid>)> = BTreeMap::new();
    for shard in &init.shards[..init.shards.len() - 1] {
        let mut src = shard.primary_src.clone();
        src.extend(shard.remote_src.iter().copied());
        let partition = (shard.primary_src.clone(), shard.remote_src.clone());
        if let Some(previous) = seen.insert(src, partition.clone()) {
            assert_eq!(previous, partition);
        }
        assert!(init.primary_teams.contains(&shard.primary_src));
        assert!(init.remote_teams.contains(&shard.remote_src));
    }
}

#[tokio::test]
async fn healthy_zone_is_kept_only_until_expiry() {
    let cluster = TestCluster::new(ClusterSeed::default(), fast_config()).await;
    let lock = take_move_keys_lock(&cluster.store, cluster.data.dd_id)
        .await
        .unwrap();

    let read = |zone: HealthyZoneValue| {
        let store = cluster.store.clone();
        let enabled = &cluster.enabled;
        let config = &cluster.config;
        let dd_id = cluster.data.dd_id;
        let lock = lock;
        async move {
            store.seed([(
                HEALTHY_ZONE_KEY.to_vec(),
                encode_healthy_zone(&zone).unwrap(),
            )]);
            get_initial_data_distribution(&store, dd_id, &lock, &[], enabled, config)
                .await
                .unwrap()
                .init_healthy_zone
        }
    };

    let kept = read(HealthyZoneValue {
        zone: b"zone-a".to_vec(),
        expiration_version: u64::MAX,
    })
    .await;
    assert_eq!(kept, Some(b"zone-a".to_vec()));

    let expired = read(HealthyZoneValue {
        zone: b"zone-a".to_vec(),
        expiration_version: 0,
    })
    .await;
    assert_eq!(expired, None);

    // The ignore sentinel never expires.
    let ignored = read(HealthyZoneValue {
        zone: IGNORE_SS_FAILURES_ZONE.to_vec(),
        expiration_version: 0,
    })
    .await;
    assert_eq!(ignored, Some(IGNORE_SS_FAILURES_ZONE.to_vec()));
}

#[tokio::test]
async fn disabled_mode_short_circuits_to_an_empty_snapshot() {
    let cluster = TestCluster::new(ClusterSeed::default(), fast_config()).await;
    cluster.store.seed([(
        DATA_DISTRIBUTION_MODE_KEY.to_vec(),
        strand_core::cluster::encode_mode(0),
    )]);
    let lock = take_move_keys_lock(&cluster.store, cluster.data.dd_id)
        .await
        .unwrap();

    let init = get_initial_data_distribution(
        &cluster.store,
        cluster.data.dd_id,
        &lock,
        &[],
        &cluster.enabled,
        &cluster.config,
    )
    .await
    .unwrap();

    assert_eq!(init.mode, 0);
    assert!(init.all_servers.is_empty());
    assert_eq!(init.shards.len(), 1);
    assert_eq!(init.shards[0].key, KeyRange::all().end);
}

#[tokio::test]
async fn move_id_mismatch_cancels_the_move_and_schedules_a_cancellation() {
    let mut config = fast_config();
    config.shard_encode_location_metadata = true;
    let cluster = TestCluster::new(ClusterSeed::default(), config.clone()).await;

    // The shard in [k0001, k0002) claims move X while the persisted record
    // is move Y over the same range.
    let move_range = KeyRange::new(b"k0001".to_vec(), b"k0002".to_vec());
    let shard_move_id = Uid::new(0xaaaa, 1);
    let record_move_id = Uid::new(0xbbbb, 2);
    seed_key_servers_boundary(
        &cluster.store,
        b"k0001",
        &KeyServersValue {
            src: vec![server_uid(0), server_uid(1), server_uid(2)],
            dest: vec![server_uid(3)],
            src_id: Uid::new(0x1000, 1),
            dest_id: shard_move_id,
        },
    );
    seed_data_move(
        &cluster.store,
        &DataMoveMeta {
            id: record_move_id,
            range: move_range.clone(),
            src: vec![server_uid(0), server_uid(1), server_uid(2)],
            dest: vec![server_uid(3)],
            priority: 0,
        },
    );

    let lock = take_move_keys_lock(&cluster.store, cluster.data.dd_id)
        .await
        .unwrap();
    let init = get_initial_data_distribution(
        &cluster.store,
        cluster.data.dd_id,
        &lock,
        &[],
        &cluster.enabled,
        &config,
    )
    .await
    .unwrap();

    let dm = init.data_move_map.value_at(b"k0001");
    assert!(dm.lock().unwrap().cancelled, "mismatched move must cancel");

    // Seeding turns the cancelled move into a cancellation relocation.
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel();
    let (ev_tx, _ev_rx) = tokio::sync::mpsc::unbounded_channel();
    let relocations = RelocationSender::new(false, out_tx, ev_tx);
    let (sabtf, _restarts) = ShardsAffectedByTeamFailure::new();
    let sabtf = std::sync::Mutex::new(sabtf);

    seed_pipeline(
        &init,
        &cluster.seeded.configuration,
        &sabtf,
        None,
        &relocations,
        &config,
        cluster.data.dd_id,
    )
    .await
    .unwrap();

    let mut cancellations = Vec::new();
    while let Ok(rs) = out_rx.try_recv() {
        if rs.cancelled {
            cancellations.push(rs);
        }
    }
    assert_eq!(cancellations.len(), 1);
    assert_eq!(cancellations[0].keys, move_range);
    assert_eq!(cancellations[0].data_move_id, Some(record_move_id));
}

#[tokio::test]
async fn anonymous_in_flight_destinations_are_rescheduled() {
    let config = fast_config();
    let cluster = TestCluster::new(ClusterSeed::default(), config.clone()).await;

    // A healthy-sized source team with an untracked in-flight destination.
    seed_key_servers_boundary(
        &cluster.store,
        b"k0002",
        &KeyServersValue {
            src: vec![server_uid(0), server_uid(1), server_uid(2)],
            dest: vec![server_uid(3)],
            src_id: Uid::new(0x1000, 2),
            dest_id: ANONYMOUS_SHARD_ID,
        },
    );
    // An undersized source team with the same kind of destination.
    seed_key_servers_boundary(
        &cluster.store,
        b"k0003",
        &KeyServersValue {
            src: vec![server_uid(4)],
            dest: vec![server_uid(5)],
            src_id: Uid::new(0x1000, 3),
            dest_id: ANONYMOUS_SHARD_ID,
        },
    );

    let lock = take_move_keys_lock(&cluster.store, cluster.data.dd_id)
        .await
        .unwrap();
    let init = get_initial_data_distribution(
        &cluster.store,
        cluster.data.dd_id,
        &lock,
        &[],
        &cluster.enabled,
        &config,
    )
    .await
    .unwrap();

    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel();
    let (ev_tx, _ev_rx) = tokio::sync::mpsc::unbounded_channel();
    let relocations = RelocationSender::new(false, out_tx, ev_tx);
    let (sabtf, _restarts) = ShardsAffectedByTeamFailure::new();
    let sabtf = std::sync::Mutex::new(sabtf);

    seed_pipeline(
        &init,
        &cluster.seeded.configuration,
        &sabtf,
        None,
        &relocations,
        &config,
        cluster.data.dd_id,
    )
    .await
    .unwrap();

    let mut by_begin = BTreeMap::new();
    while let Ok(rs) = out_rx.try_recv() {
        by_begin.insert(rs.keys.begin.clone(), rs.priority);
    }
    assert_eq!(by_begin.get(&b"k0002".to_vec()), Some(&priority::RECOVER_MOVE));
    assert_eq!(by_begin.get(&b"k0003".to_vec()), Some(&priority::TEAM_UNHEALTHY));
}

//! Integration tests for the supervision loop's error handling.

mod common;

use std::time::Duration;

use common::{fast_config, TestCluster, TEST_TIMEOUT};
use strand_core::cluster::encode_mode;
use strand_core::ids::MODE_LOCK_OWNER;
use strand_core::keys::{server_list_key, DATA_DISTRIBUTION_MODE_KEY, MOVE_KEYS_LOCK_OWNER_KEY};
use strand_core::Error;
use strand_distributor::harness::{server_uid, ClusterSeed};
use strand_distributor::supervisor::data_distribution;

#[tokio::test]
async fn conflicts_while_enabled_are_fatal_to_the_loop() {
    let mut cluster = TestCluster::new(ClusterSeed::default(), fast_config()).await;
    let supervisor = tokio::spawn(data_distribution(
        cluster.data.clone(),
        cluster.supervisor_env(),
    ));

    cluster.wait_for_build(1).await;
    assert!(!cluster.data.team_collections().is_empty());

    cluster.inject_errors.send(Error::MoveKeysConflict).unwrap();
    let result = tokio::time::timeout(TEST_TIMEOUT, supervisor)
        .await
        .expect("supervisor must exit")
        .unwrap();
    assert_eq!(result.unwrap_err(), Error::MoveKeysConflict);
    // Teardown cleared the shared pipeline handles.
    assert!(cluster.data.team_collections().is_empty());
}

#[tokio::test]
async fn conflicts_while_disabled_restart_the_loop() {
    let mut cluster = TestCluster::new(ClusterSeed::default(), fast_config()).await;
    let supervisor = tokio::spawn(data_distribution(
        cluster.data.clone(),
        cluster.supervisor_env(),
    ));

    cluster.wait_for_build(1).await;

    // An operator disable writes mode zero and parks the lock under the
    // mode sentinel; the running pipeline then dies with the conflict. The
    // supervisor must treat it as expected and start over.
    cluster.store.seed([
        (DATA_DISTRIBUTION_MODE_KEY.to_vec(), encode_mode(0)),
        (
            MOVE_KEYS_LOCK_OWNER_KEY.to_vec(),
            serde_json::to_vec(&MODE_LOCK_OWNER).unwrap(),
        ),
    ]);
    cluster.inject_errors.send(Error::MoveKeysConflict).unwrap();

    // The restarted loop sits in the enabled gate; re-enabling lets it
    // rebuild the pipeline.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!supervisor.is_finished());
    cluster.store.seed([(
        DATA_DISTRIBUTION_MODE_KEY.to_vec(),
        encode_mode(1),
    )]);

    cluster.wait_for_build(2).await;
    supervisor.abort();
}

#[tokio::test]
async fn other_normal_queue_errors_are_fatal_when_distribution_stays_enabled() {
    let mut cluster = TestCluster::new(ClusterSeed::default(), fast_config()).await;
    let supervisor = tokio::spawn(data_distribution(
        cluster.data.clone(),
        cluster.supervisor_env(),
    ));

    cluster.wait_for_build(1).await;
    cluster
        .inject_errors
        .send(Error::DataMoveCancelled)
        .unwrap();

    let result = tokio::time::timeout(TEST_TIMEOUT, supervisor)
        .await
        .expect("supervisor must exit")
        .unwrap();
    assert_eq!(result.unwrap_err(), Error::DataMoveCancelled);
}

#[tokio::test]
async fn failed_server_removal_runs_during_teardown() {
    let mut cluster = TestCluster::new(ClusterSeed::default(), fast_config()).await;
    let failed = server_uid(1);
    cluster.builder.fail_server(failed);

    let supervisor = tokio::spawn(data_distribution(
        cluster.data.clone(),
        cluster.supervisor_env(),
    ));
    cluster.wait_for_build(1).await;
    assert!(cluster.store.get_raw(&server_list_key(failed)).is_some());

    cluster.inject_errors.send(Error::MoveKeysConflict).unwrap();

    // Removal happens during teardown and the loop then continues.
    cluster.wait_for_build(2).await;
    assert!(cluster.store.get_raw(&server_list_key(failed)).is_none());
    supervisor.abort();
}

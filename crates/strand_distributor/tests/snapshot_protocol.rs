//! Integration tests for the cluster snapshot protocol.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use common::{fast_config, TestCluster};
use strand_core::keys::WRITE_RECOVERY_KEY;
use strand_core::{Error, Uid};
use strand_distributor::harness::{ClusterSeed, MockTlog, MockWorker, SnapEventLog};
use strand_distributor::pipeline::{ClusterView, RecoveryState, TlogClient, WorkerClient};
use strand_distributor::snapshot::dd_snap_create;

struct SnapFixture {
    cluster: TestCluster,
    log: SnapEventLog,
    tlogs: Vec<Arc<MockTlog>>,
    storage: Vec<Arc<MockWorker>>,
    #[allow(dead_code)]
    coords: Vec<Arc<MockWorker>>,
    view_tx: watch::Sender<ClusterView>,
    view_rx: watch::Receiver<ClusterView>,
}

async fn fixture(tlogs: usize, storage: usize, coords: usize) -> SnapFixture {
    let cluster = TestCluster::new(ClusterSeed::default(), fast_config()).await;
    let log = SnapEventLog::default();
    let tlogs: Vec<Arc<MockTlog>> = (0..tlogs)
        .map(|i| Arc::new(MockTlog::new(format!("tlog{i}"), log.clone())))
        .collect();
    let storage: Vec<Arc<MockWorker>> = (0..storage)
        .map(|i| Arc::new(MockWorker::new(format!("ss{i}"), log.clone())))
        .collect();
    let coords: Vec<Arc<MockWorker>> = (0..coords)
        .map(|i| Arc::new(MockWorker::new(format!("coord{i}"), log.clone())))
        .collect();
    let view = ClusterView {
        generation: 1,
        recovery_state: RecoveryState::FullyRecovered,
        tlogs: tlogs
            .iter()
            .map(|t| t.clone() as Arc<dyn TlogClient>)
            .collect(),
        storage_workers: storage
            .iter()
            .map(|w| w.clone() as Arc<dyn WorkerClient>)
            .collect(),
        storage_worker_failures: 0,
        coordinators: coords
            .iter()
            .map(|w| w.clone() as Arc<dyn WorkerClient>)
            .collect(),
    };
    let (view_tx, view_rx) = watch::channel(view);
    SnapFixture {
        cluster,
        log,
        tlogs,
        storage,
        coords,
        view_tx,
        view_rx,
    }
}

impl SnapFixture {
    async fn snap(&self) -> strand_core::Result<()> {
        dd_snap_create(
            "snap-payload".to_string(),
            Uid::new(0x51a9, 1),
            Arc::new(self.cluster.store.clone()),
            self.view_rx.clone(),
            self.cluster.enabled.clone(),
            self.cluster.config.clone(),
        )
        .await
    }

    fn phase_boundary_ordered(&self, earlier: &str, later: &str) -> bool {
        let events = self.log.events();
        let last_earlier = events.iter().rposition(|e| e.starts_with(earlier));
        let first_later = events.iter().position(|e| e.starts_with(later));
        match (last_earlier, first_later) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }
}

#[tokio::test]
async fn phases_run_in_protocol_order() {
    let fx = fixture(3, 4, 3).await;
    fx.snap().await.unwrap();

    assert_eq!(fx.log.count_with_prefix("disable_pop"), 3);
    assert_eq!(fx.log.count_with_prefix("snap:storage"), 4);
    assert_eq!(fx.log.count_with_prefix("tlog_snap"), 3);
    assert_eq!(fx.log.count_with_prefix("enable_pop"), 3);
    assert_eq!(fx.log.count_with_prefix("snap:coord"), 3);

    assert!(fx.phase_boundary_ordered("disable_pop", "snap:storage"));
    assert!(fx.phase_boundary_ordered("snap:storage", "tlog_snap"));
    assert!(fx.phase_boundary_ordered("tlog_snap", "enable_pop"));
    assert!(fx.phase_boundary_ordered("enable_pop", "snap:coord"));

    // Marker cleared, distribution restored.
    assert!(fx.cluster.store.get_raw(WRITE_RECOVERY_KEY).is_none());
    assert!(fx.cluster.enabled.is_enabled());
}

#[tokio::test]
async fn tlog_snapshot_failure_reenables_popping_exactly_once() {
    let fx = fixture(3, 2, 3).await;
    fx.tlogs[1].fail_snapshot.store(true, Ordering::SeqCst);

    assert_eq!(fx.snap().await.unwrap_err(), Error::SnapTlogFailed);

    // Cleanup ran, and only cleanup: one enable per log.
    assert_eq!(fx.log.count_with_prefix("enable_pop"), 3);
    for tlog in &fx.tlogs {
        assert_eq!(
            fx.log
                .count_with_prefix(&format!("enable_pop:{}", tlog.name)),
            1
        );
    }
    // The recovery marker stays for operators to inspect.
    assert!(fx.cluster.store.get_raw(WRITE_RECOVERY_KEY).is_some());
    assert!(fx.cluster.enabled.is_enabled());
}

#[tokio::test]
async fn disable_failure_aborts_and_still_reenables() {
    let fx = fixture(2, 2, 3).await;
    fx.tlogs[0].fail_disable.store(true, Ordering::SeqCst);

    assert_eq!(fx.snap().await.unwrap_err(), Error::SnapDisableTlogPopFailed);
    assert_eq!(fx.log.count_with_prefix("snap:storage"), 0);
    assert_eq!(fx.log.count_with_prefix("enable_pop"), 2);
}

#[tokio::test]
async fn storage_failures_respect_the_fault_tolerance() {
    // Seeded team size 3 and knob 1 allow one storage failure.
    let fx = fixture(2, 3, 3).await;
    fx.storage[0].fail.store(true, Ordering::SeqCst);
    fx.snap().await.unwrap();

    let fx = fixture(2, 3, 3).await;
    fx.storage[0].fail.store(true, Ordering::SeqCst);
    fx.storage[1].fail.store(true, Ordering::SeqCst);
    assert_eq!(fx.snap().await.unwrap_err(), Error::SnapStorageFailed);
    // Both failing attempts re-enable popping on every log exactly once.
    assert_eq!(fx.log.count_with_prefix("enable_pop"), 2);
}

#[tokio::test]
async fn unreachable_workers_consume_the_fault_budget() {
    let fx = fixture(2, 3, 3).await;
    {
        let mut view = fx.view_rx.borrow().clone();
        view.storage_worker_failures = 2;
        // Replacing the view without bumping the generation would race the
        // recovery detector, so write it before the snapshot starts.
        fx.view_tx.send_replace(view);
    }
    // Tolerance is min(knob 1, team_size - 1) - 2 failures < 0.
    assert_eq!(fx.snap().await.unwrap_err(), Error::SnapStorageFailed);
    assert_eq!(fx.log.count_with_prefix("snap:storage"), 0);
}

#[tokio::test]
async fn concurrent_snapshots_are_refused() {
    let fx = fixture(2, 2, 3).await;
    assert!(fx.cluster.enabled.set_enabled(false, Uid::new(1, 2)));
    assert_eq!(fx.snap().await.unwrap_err(), Error::OperationFailed);
    // The earlier owner still holds the flag.
    assert!(!fx.cluster.enabled.is_enabled());
}

fn stuck_worker(name: &str, log: &SnapEventLog) -> Arc<dyn WorkerClient> {
    Arc::new(MockWorker {
        name: name.into(),
        log: log.clone(),
        delay: Duration::from_secs(60),
        fail: std::sync::atomic::AtomicBool::new(false),
    })
}

#[tokio::test]
async fn slow_snapshots_time_out_and_clean_up() {
    let mut fx = fixture(2, 2, 3).await;
    fx.cluster.config.snap_create_max_timeout = Duration::from_millis(200);
    {
        let mut view = fx.view_rx.borrow().clone();
        // Quorum needs one success and neither worker will provide it in
        // time.
        view.storage_workers = vec![
            stuck_worker("stuck0", &fx.log),
            stuck_worker("stuck1", &fx.log),
        ];
        fx.view_tx.send_replace(view);
    }

    let err = tokio::time::timeout(Duration::from_secs(10), fx.snap())
        .await
        .expect("must time out before the worker completes")
        .unwrap_err();
    assert_eq!(err, Error::TimedOut);
    assert!(fx.cluster.enabled.is_enabled());
    // Cancellation re-enabled popping.
    assert_eq!(fx.log.count_with_prefix("enable_pop"), 2);
}

#[tokio::test]
async fn recovery_during_a_snapshot_is_unsupported() {
    let fx = fixture(2, 2, 3).await;
    {
        let mut view = fx.view_rx.borrow().clone();
        view.storage_workers = vec![
            stuck_worker("stuck0", &fx.log),
            stuck_worker("stuck1", &fx.log),
        ];
        fx.view_tx.send_replace(view);
    }

    let snap = fx.snap();
    tokio::pin!(snap);
    // Let the snapshot get past the disable phase, then recover the cluster.
    tokio::select! {
        _ = &mut snap => panic!("snapshot finished before the recovery"),
        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
    }
    fx.view_tx.send_modify(|view| view.generation += 1);

    let err = tokio::time::timeout(Duration::from_secs(10), snap)
        .await
        .expect("recovery must abort the snapshot")
        .unwrap_err();
    assert_eq!(err, Error::SnapWithRecoveryUnsupported);
    assert!(fx.cluster.enabled.is_enabled());
}

//! Cluster-consistent snapshot orchestration.
//!
//! The protocol freezes log popping, snapshots storage then the logs
//! themselves, re-enables popping, and finally snapshots the coordinators,
//! with per-phase fault tolerance. Whatever fails after popping was
//! disabled, popping is re-enabled best effort before the error propagates.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use strand_core::cluster::get_database_configuration;
use strand_core::keys::{WRITE_RECOVERY_KEY, WRITE_RECOVERY_VALUE_TRUE};
use strand_core::{run_transaction, Error, Result, SystemStore, TxOption, Uid};

use crate::config::DistributorConfig;
use crate::enabled::DdEnabledState;
use crate::pipeline::ClusterView;

/// Wait until all but `fault_tolerance` of `futures` succeed, then linger
/// `wait_multiplier` times the elapsed time for stragglers.
///
/// Fails with `err` as soon as more than `fault_tolerance` futures fail.
/// With a multiplier of zero the function returns at quorum and the slowest
/// futures may never be polled to completion.
pub async fn wait_for_most<F>(
    futures: Vec<F>,
    fault_tolerance: usize,
    err: Error,
    wait_multiplier: f64,
) -> Result<()>
where
    F: Future<Output = Result<()>> + Send,
{
    let total = futures.len();
    let needed = total.saturating_sub(fault_tolerance);
    let start = Instant::now();

    let mut pending: FuturesUnordered<F> = futures.into_iter().collect();
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    while succeeded < needed {
        match pending.next().await {
            Some(Ok(())) => succeeded += 1,
            Some(Err(_)) => {
                failed += 1;
                if failed > fault_tolerance {
                    return Err(err);
                }
            }
            None => return Err(err),
        }
    }

    let grace = start.elapsed().mul_f64(wait_multiplier.max(0.0));
    let drain = async {
        while pending.next().await.is_some() {}
    };
    let _ = tokio::time::timeout(grace, drain).await;
    Ok(())
}

async fn disable_all_pops(view: &ClusterView, snap_uid: Uid) -> Result<()> {
    try_join_all(view.tlogs.iter().map(|tlog| {
        let tlog = tlog.clone();
        async move {
            tlog.disable_pop(snap_uid).await.map_err(|err| {
                tracing::warn!(error = %err, "disable pop request failed");
                Error::SnapDisableTlogPopFailed
            })
        }
    }))
    .await?;
    Ok(())
}

async fn enable_all_pops(view: &ClusterView, snap_uid: Uid) -> Result<()> {
    try_join_all(view.tlogs.iter().map(|tlog| {
        let tlog = tlog.clone();
        async move {
            tlog.enable_pop(snap_uid).await.map_err(|err| {
                tracing::warn!(error = %err, "enable pop request failed");
                Error::SnapEnableTlogPopFailed
            })
        }
    }))
    .await?;
    Ok(())
}

async fn snap_phases(
    payload: &str,
    snap_uid: Uid,
    store: &dyn SystemStore,
    view: &ClusterView,
    cfg: &DistributorConfig,
) -> Result<()> {
    // Phase: stop log popping everywhere. No failures tolerated.
    disable_all_pops(view, snap_uid).await?;
    tracing::info!(snap_uid = %snap_uid, payload, "disabled transaction log popping");

    // Phase: snapshot storage workers with bounded fault tolerance.
    let configuration = get_database_configuration(store).await?;
    let storage_fault_tolerance = cfg
        .max_storage_snapshot_fault_tolerance
        .min(configuration.storage_team_size.saturating_sub(1))
        as isize
        - view.storage_worker_failures as isize;
    if storage_fault_tolerance < 0 {
        // Too many storage workers already unreachable.
        return Err(Error::SnapStorageFailed);
    }
    tracing::info!(
        snap_uid = %snap_uid,
        workers = view.storage_workers.len(),
        fault_tolerance = storage_fault_tolerance,
        "snapshotting storage workers"
    );
    let storage_reqs: Vec<_> = view
        .storage_workers
        .iter()
        .map(|worker| {
            let worker = worker.clone();
            let payload = payload.to_string();
            async move {
                worker.snapshot(&payload, snap_uid, "storage").await.map_err(|err| {
                    tracing::warn!(error = %err, "storage snapshot request failed");
                    err
                })
            }
        })
        .collect();
    wait_for_most(
        storage_reqs,
        storage_fault_tolerance as usize,
        Error::SnapStorageFailed,
        cfg.snap_slow_future_wait_multiplier,
    )
    .await?;

    // Phase: snapshot every transaction log. No failures tolerated.
    try_join_all(view.tlogs.iter().map(|tlog| {
        let tlog = tlog.clone();
        let payload = payload.to_string();
        async move {
            tlog.snapshot(&payload, snap_uid).await.map_err(|err| {
                tracing::warn!(error = %err, "transaction log snapshot request failed");
                Error::SnapTlogFailed
            })
        }
    }))
    .await?;
    tracing::info!(snap_uid = %snap_uid, "snapshotted transaction logs");

    // Phase: resume log popping. No failures tolerated.
    enable_all_pops(view, snap_uid).await?;
    tracing::info!(snap_uid = %snap_uid, "re-enabled transaction log popping");

    // Phase: snapshot coordinators, tolerating a minority.
    let coord_fault_tolerance = (view.coordinators.len() / 2)
        .saturating_sub(1)
        .min(cfg.max_coordinator_snapshot_fault_tolerance);
    let coord_reqs: Vec<_> = view
        .coordinators
        .iter()
        .map(|worker| {
            let worker = worker.clone();
            let payload = payload.to_string();
            async move {
                worker.snapshot(&payload, snap_uid, "coord").await.map_err(|err| {
                    tracing::warn!(error = %err, "coordinator snapshot request failed");
                    err
                })
            }
        })
        .collect();
    wait_for_most(
        coord_reqs,
        coord_fault_tolerance,
        Error::SnapCoordFailed,
        cfg.snap_slow_future_wait_multiplier,
    )
    .await?;
    tracing::info!(snap_uid = %snap_uid, "snapshotted coordinators");
    Ok(())
}

/// Run the snapshot protocol once. `cancel` aborts between suspension
/// points; cancellation counts as a failure that still re-enables popping.
pub async fn dd_snap_create_core(
    payload: String,
    snap_uid: Uid,
    store: Arc<dyn SystemStore>,
    view: ClusterView,
    cfg: DistributorConfig,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!(snap_uid = %snap_uid, payload = %payload, "writing recovery marker");
    run_transaction(
        store.as_ref(),
        &[TxOption::AccessSystemKeys, TxOption::LockAware],
        |tr| {
            async move {
                tr.set(WRITE_RECOVERY_KEY, WRITE_RECOVERY_VALUE_TRUE);
                Ok(())
            }
            .boxed()
        },
    )
    .await?;

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(Error::OperationCancelled),
        res = snap_phases(&payload, snap_uid, store.as_ref(), &view, &cfg) => res,
    };

    if let Err(err) = &result {
        tracing::warn!(snap_uid = %snap_uid, error = %err, "snapshot attempt failed");
        if matches!(
            err,
            Error::SnapStorageFailed
                | Error::SnapTlogFailed
                | Error::OperationCancelled
                | Error::SnapDisableTlogPopFailed
        ) {
            // Logs must not stay frozen. Failures here are logged and
            // swallowed; the original error is what propagates.
            if let Err(enable_err) = enable_all_pops(&view, snap_uid).await {
                tracing::debug!(error = %enable_err, "ignoring enable pop failure during cleanup");
            }
        }
        return result;
    }

    run_transaction(
        store.as_ref(),
        &[TxOption::AccessSystemKeys, TxOption::LockAware],
        |tr| {
            async move {
                tr.clear(WRITE_RECOVERY_KEY);
                Ok(())
            }
            .boxed()
        },
    )
    .await?;
    tracing::info!(snap_uid = %snap_uid, "snapshot complete, recovery marker cleared");
    Ok(())
}

/// Operator-facing wrapper: disables data distribution for the duration of
/// the snapshot, races the protocol against cluster recovery and a hard
/// deadline, and always restores the enable flag.
pub async fn dd_snap_create(
    payload: String,
    snap_uid: Uid,
    store: Arc<dyn SystemStore>,
    cluster: watch::Receiver<ClusterView>,
    enabled: Arc<DdEnabledState>,
    cfg: DistributorConfig,
) -> Result<()> {
    if !enabled.set_enabled(false, snap_uid) {
        // Another snapshot already holds the flag.
        tracing::info!(snap_uid = %snap_uid, "snapshot refused, distribution already disabled");
        return Err(Error::OperationFailed);
    }

    let result = snap_race(payload, snap_uid, store, cluster, &cfg).await;

    let restored = enabled.set_enabled(true, snap_uid);
    assert!(restored, "snapshot owner must be able to re-enable");
    result
}

async fn snap_race(
    payload: String,
    snap_uid: Uid,
    store: Arc<dyn SystemStore>,
    mut cluster: watch::Receiver<ClusterView>,
    cfg: &DistributorConfig,
) -> Result<()> {
    let view = cluster.borrow_and_update().clone();
    let cancel = CancellationToken::new();
    let mut core = tokio::spawn(dd_snap_create_core(
        payload.clone(),
        snap_uid,
        store,
        view,
        cfg.clone(),
        cancel.clone(),
    ));

    let outcome = tokio::select! {
        res = &mut core => {
            return res.unwrap_or(Err(Error::Internal("snapshot task died".into())));
        }
        _ = cluster.changed() => {
            tracing::info!(snap_uid = %snap_uid, "cluster changed during snapshot");
            Err(Error::SnapWithRecoveryUnsupported)
        }
        _ = tokio::time::sleep(cfg.snap_timeout()) => {
            tracing::warn!(snap_uid = %snap_uid, "snapshot timed out");
            Err(Error::TimedOut)
        }
    };

    // Let the protocol run its cleanup before reporting.
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), &mut core).await;
    outcome
}

//! Cache-server registration watcher.
//!
//! Cache servers announce themselves under their registration key. The
//! watcher keeps the known set current and clears the registration of any
//! cache server the failure monitor reports dead, so stale interfaces do
//! not accumulate.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;

use strand_core::keys::{
    decode_storage_cache_server_key, prefix_range, read_range_assert_complete,
    storage_cache_server_key, STORAGE_CACHE_SERVER_PREFIX,
};
use strand_core::{run_transaction, Result, SystemStore, TxOption, Uid, TOO_MANY};

use crate::config::DistributorConfig;

/// Track registered cache servers and clear the keys of failed ones.
/// `failures` is fed by the cluster's failure monitor.
pub async fn cache_server_watcher(
    store: Arc<dyn SystemStore>,
    mut failures: mpsc::UnboundedReceiver<Uid>,
    cfg: DistributorConfig,
) -> Result<()> {
    let mut known: BTreeSet<Uid> = BTreeSet::new();
    let mut failures_open = true;
    loop {
        let mut tr = store.transaction();
        let scanned: Result<BTreeSet<Uid>> = async {
            loop {
                tr.set_option(TxOption::AccessSystemKeys);
                let attempt: Result<BTreeSet<Uid>> = async {
                    let rows = read_range_assert_complete(
                        tr.as_mut(),
                        &prefix_range(STORAGE_CACHE_SERVER_PREFIX),
                        TOO_MANY,
                    )
                    .await?;
                    let mut caches = BTreeSet::new();
                    for kv in &rows {
                        caches.insert(decode_storage_cache_server_key(&kv.key)?);
                    }
                    Ok(caches)
                }
                .await;
                match attempt {
                    Ok(caches) => return Ok(caches),
                    Err(err) => tr.on_error(err).await?,
                }
            }
        }
        .await;
        let caches = scanned?;
        for id in caches.difference(&known) {
            tracing::info!(cache_server = %id.short_string(), "cache server registered");
        }
        known = caches;

        tokio::select! {
            _ = tokio::time::sleep(cfg.cache_server_poll_delay) => {}
            failed = failures.recv(), if failures_open => {
                match failed {
                    // The failure monitor went away; keep scanning.
                    None => failures_open = false,
                    Some(id) => {
                        if known.remove(&id) {
                            clear_cache_server(store.as_ref(), id).await?;
                        }
                    }
                }
            }
        }
    }
}

async fn clear_cache_server(store: &dyn SystemStore, id: Uid) -> Result<()> {
    tracing::info!(cache_server = %id.short_string(), "clearing failed cache server");
    run_transaction(store, &[TxOption::AccessSystemKeys], move |tr| {
        async move {
            tr.clear(&storage_cache_server_key(id));
            Ok(())
        }
        .boxed()
    })
    .await
}

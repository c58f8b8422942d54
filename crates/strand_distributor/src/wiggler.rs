//! The storage wiggler: a rotation of servers queued for graceful
//! replacement.
//!
//! The queue is addressable (entries can be removed or rescored in place)
//! and totally ordered: servers flagged as wrongly configured come first,
//! then older servers before newer ones, with the server id as the final
//! tie-break. Round and per-wiggle timings are persisted so a restarted
//! distributor resumes its rotation statistics.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use strand_core::keys::storage_wiggle_metrics_key;
use strand_core::{run_transaction, Result, Smoother, SystemStore, TxOption, Uid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyValueStoreType {
    Memory,
    SsdBtreeV2,
    SsdRocksdbV1,
}

/// Placement-relevant metadata of one storage server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Unix seconds when the server's current storage file was created.
    pub created_time: u64,
    pub store_type: KeyValueStoreType,
    /// The server runs an undesired configuration and should be replaced
    /// ahead of the age-based rotation.
    pub wrong_configured: bool,
}

impl StorageMetadata {
    pub fn new(created_time: u64, store_type: KeyValueStoreType) -> Self {
        Self {
            created_time,
            store_type,
            wrong_configured: false,
        }
    }

    pub fn wrong_configured(created_time: u64, store_type: KeyValueStoreType) -> Self {
        Self {
            created_time,
            store_type,
            wrong_configured: true,
        }
    }

    pub fn current_time() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Queue position. Derived ordering gives wrongly configured servers the
/// front of the queue, then ascending creation time, then the id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    correctly_configured: bool,
    created_time: u64,
    id: Uid,
}

impl OrderKey {
    fn new(id: Uid, metadata: &StorageMetadata) -> Self {
        Self {
            correctly_configured: !metadata.wrong_configured,
            created_time: metadata.created_time,
            id,
        }
    }
}

/// Persisted rotation statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageWiggleMetrics {
    pub last_round_start: u64,
    pub last_round_finish: u64,
    pub last_wiggle_start: u64,
    pub last_wiggle_finish: u64,
    pub finished_round: u64,
    pub finished_wiggle: u64,
    pub smoothed_round_duration: Smoother,
    pub smoothed_wiggle_duration: Smoother,
}

fn encode_metrics(metrics: &StorageWiggleMetrics) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(metrics)?)
}

fn decode_metrics(value: &[u8]) -> Result<StorageWiggleMetrics> {
    Ok(serde_json::from_slice(value)?)
}

pub struct StorageWiggler {
    queue: BTreeSet<OrderKey>,
    entries: HashMap<Uid, StorageMetadata>,
    non_empty: watch::Sender<bool>,
    pub metrics: StorageWiggleMetrics,
    store: Arc<dyn SystemStore>,
    primary: bool,
}

impl StorageWiggler {
    pub fn new(store: Arc<dyn SystemStore>, primary: bool) -> Self {
        let (non_empty, _) = watch::channel(false);
        Self {
            queue: BTreeSet::new(),
            entries: HashMap::new(),
            non_empty,
            metrics: StorageWiggleMetrics::default(),
            store,
            primary,
        }
    }

    /// Observe emptiness transitions.
    pub fn subscribe_non_empty(&self) -> watch::Receiver<bool> {
        self.non_empty.subscribe()
    }

    pub fn contains(&self, id: Uid) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The caller must not add an id that is already queued.
    pub fn add_server(&mut self, id: Uid, metadata: StorageMetadata) {
        assert!(!self.entries.contains_key(&id));
        self.queue.insert(OrderKey::new(id, &metadata));
        self.entries.insert(id, metadata);
        self.non_empty.send_replace(true);
    }

    /// Idempotent; a server already popped is a no-op.
    pub fn remove_server(&mut self, id: Uid) {
        if let Some(metadata) = self.entries.remove(&id) {
            self.queue.remove(&OrderKey::new(id, &metadata));
        }
        self.non_empty.send_replace(!self.queue.is_empty());
    }

    /// Reposition a queued server; a no-op when nothing changed.
    pub fn update_metadata(&mut self, id: Uid, metadata: StorageMetadata) {
        let Some(current) = self.entries.get_mut(&id) else {
            return;
        };
        if *current == metadata {
            return;
        }
        self.queue.remove(&OrderKey::new(id, current));
        self.queue.insert(OrderKey::new(id, &metadata));
        *current = metadata;
    }

    /// Pop the next server to wiggle.
    pub fn next_server_id(&mut self) -> Option<Uid> {
        let head = self.queue.iter().next().copied()?;
        self.queue.remove(&head);
        self.entries.remove(&head.id);
        if self.queue.is_empty() {
            self.non_empty.send_replace(false);
        }
        Some(head.id)
    }

    /// A finished round leaves no round in progress.
    pub fn should_start_new_round(&self) -> bool {
        self.metrics.last_round_finish >= self.metrics.last_round_start
    }

    /// The round completes when the queue drains while a round is open.
    pub fn should_finish_round(&self) -> bool {
        self.queue.is_empty() && self.metrics.last_round_start > self.metrics.last_round_finish
    }

    async fn persist_metrics(&self) -> Result<()> {
        let key = storage_wiggle_metrics_key(self.primary);
        let value = encode_metrics(&self.metrics)?;
        run_transaction(
            self.store.as_ref(),
            &[TxOption::AccessSystemKeys],
            move |tr| {
                let key = key.clone();
                let value = value.clone();
                async move {
                    tr.set(&key, &value);
                    Ok(())
                }
                .boxed()
            },
        )
        .await
    }

    /// Clear persisted statistics, keeping the smoothed durations.
    pub async fn reset_stats(&mut self) -> Result<()> {
        self.metrics = StorageWiggleMetrics {
            smoothed_round_duration: self.metrics.smoothed_round_duration,
            smoothed_wiggle_duration: self.metrics.smoothed_wiggle_duration,
            ..Default::default()
        };
        self.persist_metrics().await
    }

    /// Load persisted statistics, if any.
    pub async fn restore_stats(&mut self) -> Result<()> {
        let key = storage_wiggle_metrics_key(self.primary);
        let stored = run_transaction(
            self.store.as_ref(),
            &[TxOption::ReadSystemKeys],
            move |tr| {
                let key = key.clone();
                async move { tr.get(&key).await }.boxed()
            },
        )
        .await?;
        if let Some(value) = stored {
            self.metrics = decode_metrics(&value)?;
        }
        Ok(())
    }

    pub async fn start_wiggle(&mut self) -> Result<()> {
        self.start_wiggle_at(StorageMetadata::current_time()).await
    }

    pub async fn start_wiggle_at(&mut self, now: u64) -> Result<()> {
        self.metrics.last_wiggle_start = now;
        if self.should_start_new_round() {
            self.metrics.last_round_start = now;
        }
        self.persist_metrics().await
    }

    pub async fn finish_wiggle(&mut self) -> Result<()> {
        self.finish_wiggle_at(StorageMetadata::current_time()).await
    }

    pub async fn finish_wiggle_at(&mut self, now: u64) -> Result<()> {
        self.metrics.last_wiggle_finish = now;
        self.metrics.finished_wiggle += 1;
        let duration = self
            .metrics
            .last_wiggle_finish
            .saturating_sub(self.metrics.last_wiggle_start);
        self.metrics.smoothed_wiggle_duration.observe(duration as f64);

        if self.should_finish_round() {
            self.metrics.last_round_finish = now;
            self.metrics.finished_round += 1;
            let duration = self
                .metrics
                .last_round_finish
                .saturating_sub(self.metrics.last_round_start);
            self.metrics.smoothed_round_duration.observe(duration as f64);
        }
        self.persist_metrics().await
    }
}

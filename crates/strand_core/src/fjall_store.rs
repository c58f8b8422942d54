//! Durable `SystemStore` backed by a fjall partition.
//!
//! Single-process deployments and long-running dev clusters persist the
//! system keyspace here. Reads are read-committed rather than snapshot
//! isolated; the control plane's retry loops tolerate that, and multi-node
//! clusters use a networked store implementation instead.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::error::{Error, Result};
use crate::store::{KeyValue, RangeResult, SystemStore, Transaction, TxOption};

const SYSTEM_PARTITION: &str = "system_keyspace";

#[derive(Clone)]
pub struct FjallStore {
    keyspace: Arc<Keyspace>,
    partition: PartitionHandle,
    version: Arc<AtomicU64>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = Arc::new(fjall::Config::new(path).open()?);
        let partition =
            keyspace.open_partition(SYSTEM_PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            partition,
            version: Arc::new(AtomicU64::new(1)),
        })
    }
}

#[async_trait]
impl SystemStore for FjallStore {
    fn transaction(&self) -> Box<dyn Transaction> {
        Box::new(FjallTransaction {
            store: self.clone(),
            writes: Vec::new(),
            backoff: Duration::from_millis(10),
        })
    }
}

enum Write {
    Set(Vec<u8>, Vec<u8>),
    Clear(Vec<u8>),
    ClearRange(Vec<u8>, Vec<u8>),
}

struct FjallTransaction {
    store: FjallStore,
    writes: Vec<Write>,
    backoff: Duration,
}

#[async_trait]
impl Transaction for FjallTransaction {
    fn set_option(&mut self, _opt: TxOption) {}

    async fn read_version(&mut self) -> Result<u64> {
        Ok(self.store.version.load(Ordering::SeqCst))
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.store.partition.get(key)?.map(|slice| slice.to_vec()))
    }

    async fn get_range(&mut self, begin: &[u8], end: &[u8], limit: usize) -> Result<RangeResult> {
        let mut kvs = Vec::new();
        let mut more = false;
        for item in self.store.partition.range(begin.to_vec()..end.to_vec()) {
            let (key, value) = item?;
            if kvs.len() == limit {
                more = true;
                break;
            }
            kvs.push(KeyValue {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(RangeResult { kvs, more })
    }

    async fn get_range_reverse(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<RangeResult> {
        let mut kvs = Vec::new();
        let mut more = false;
        for item in self
            .store
            .partition
            .range(begin.to_vec()..end.to_vec())
            .rev()
        {
            let (key, value) = item?;
            if kvs.len() == limit {
                more = true;
                break;
            }
            kvs.push(KeyValue {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(RangeResult { kvs, more })
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.writes.push(Write::Set(key.to_vec(), value.to_vec()));
    }

    fn clear(&mut self, key: &[u8]) {
        self.writes.push(Write::Clear(key.to_vec()));
    }

    fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
        self.writes
            .push(Write::ClearRange(begin.to_vec(), end.to_vec()));
    }

    async fn commit(&mut self) -> Result<()> {
        let mut batch = self.store.keyspace.batch();
        for write in self.writes.drain(..) {
            match write {
                Write::Set(key, value) => batch.insert(&self.store.partition, key, value),
                Write::Clear(key) => batch.remove(&self.store.partition, key),
                Write::ClearRange(begin, end) => {
                    for item in self.store.partition.range(begin..end) {
                        let (key, _) = item?;
                        batch.remove(&self.store.partition, key.to_vec());
                    }
                }
            }
        }
        batch.commit()?;
        self.store.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_error(&mut self, err: Error) -> Result<()> {
        if !err.is_retryable() {
            return Err(err);
        }
        self.reset();
        tokio::time::sleep(self.backoff).await;
        self.backoff = (self.backoff * 2).min(Duration::from_secs(1));
        Ok(())
    }

    fn reset(&mut self) {
        self.writes.clear();
    }
}

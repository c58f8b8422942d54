//! The transactional-store seam.
//!
//! The control plane never implements transactions; it consumes them through
//! `SystemStore` / `Transaction`. `MemoryStore` is the in-process
//! implementation used by tests and the dev harness; `FjallStore` persists
//! the same keyspace for single-process deployments.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::{Error, Result};
use crate::keys::Key;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Key,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// True when the read stopped at the row limit with keys remaining.
    pub more: bool,
}

/// Options mirrored from the underlying store's transaction API. The
/// in-process implementations accept them all; a networked implementation
/// maps them onto its own priority and locking machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxOption {
    PrioritySystemImmediate,
    AccessSystemKeys,
    ReadSystemKeys,
    LockAware,
    ReadLockAware,
}

#[async_trait]
pub trait Transaction: Send {
    fn set_option(&mut self, opt: TxOption);

    /// The version all reads in this transaction observe.
    async fn read_version(&mut self) -> Result<u64>;

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Read `[begin, end)` ascending, up to `limit` rows.
    async fn get_range(&mut self, begin: &[u8], end: &[u8], limit: usize) -> Result<RangeResult>;

    /// Read `[begin, end)` descending, up to `limit` rows.
    async fn get_range_reverse(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<RangeResult>;

    fn set(&mut self, key: &[u8], value: &[u8]);
    fn clear(&mut self, key: &[u8]);
    fn clear_range(&mut self, begin: &[u8], end: &[u8]);

    async fn commit(&mut self) -> Result<()>;

    /// Absorb a retryable error: reset the transaction, back off, and return
    /// `Ok` so the caller loops. Non-retryable errors come straight back.
    async fn on_error(&mut self, err: Error) -> Result<()>;

    fn reset(&mut self);
}

#[async_trait]
pub trait SystemStore: Send + Sync {
    fn transaction(&self) -> Box<dyn Transaction>;
}

/// Run `body` in a retry loop until it commits, re-applying `options` after
/// every reset.
pub async fn run_transaction<T, F>(
    store: &dyn SystemStore,
    options: &[TxOption],
    mut body: F,
) -> Result<T>
where
    F: for<'a> FnMut(&'a mut dyn Transaction) -> BoxFuture<'a, Result<T>> + Send,
{
    let mut tr = store.transaction();
    loop {
        for opt in options {
            tr.set_option(*opt);
        }
        let attempt = async {
            let value = body(tr.as_mut()).await?;
            tr.commit().await?;
            Ok(value)
        }
        .await;
        match attempt {
            Ok(value) => return Ok(value),
            Err(err) => tr.on_error(err).await?,
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    version: u64,
    data: BTreeMap<Key, Vec<u8>>,
}

/// In-memory system store with read-version snapshots and last-writer-wins
/// commits. Commit failures can be injected to exercise retry paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
    injected_commit_errors: Arc<Mutex<Vec<Error>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store outside any transaction.
    pub fn seed(&self, entries: impl IntoIterator<Item = (Key, Vec<u8>)>) {
        let mut inner = self.inner.write().unwrap();
        for (key, value) in entries {
            inner.data.insert(key, value);
        }
        inner.version += 1;
    }

    /// Push errors that the next commits will report, oldest first.
    pub fn inject_commit_errors(&self, errors: impl IntoIterator<Item = Error>) {
        self.injected_commit_errors
            .lock()
            .unwrap()
            .extend(errors);
    }

    pub fn current_version(&self) -> u64 {
        self.inner.read().unwrap().version
    }

    /// Direct read, for test assertions.
    pub fn get_raw(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().unwrap().data.get(key).cloned()
    }
}

#[async_trait]
impl SystemStore for MemoryStore {
    fn transaction(&self) -> Box<dyn Transaction> {
        Box::new(MemoryTransaction {
            store: self.clone(),
            snapshot: None,
            writes: Vec::new(),
            backoff: Duration::from_millis(10),
        })
    }
}

enum Write {
    Set(Key, Vec<u8>),
    Clear(Key),
    ClearRange(Key, Key),
}

struct MemorySnapshot {
    version: u64,
    data: BTreeMap<Key, Vec<u8>>,
}

struct MemoryTransaction {
    store: MemoryStore,
    snapshot: Option<MemorySnapshot>,
    writes: Vec<Write>,
    backoff: Duration,
}

impl MemoryTransaction {
    fn snapshot(&mut self) -> &MemorySnapshot {
        if self.snapshot.is_none() {
            let inner = self.store.inner.read().unwrap();
            self.snapshot = Some(MemorySnapshot {
                version: inner.version,
                data: inner.data.clone(),
            });
        }
        self.snapshot.as_ref().unwrap()
    }

    fn range_kvs(&mut self, begin: &[u8], end: &[u8]) -> Vec<(Key, Vec<u8>)> {
        self.snapshot()
            .data
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn set_option(&mut self, _opt: TxOption) {}

    async fn read_version(&mut self) -> Result<u64> {
        Ok(self.snapshot().version)
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot().data.get(key).cloned())
    }

    async fn get_range(&mut self, begin: &[u8], end: &[u8], limit: usize) -> Result<RangeResult> {
        let all = self.range_kvs(begin, end);
        let more = all.len() > limit;
        let kvs = all
            .into_iter()
            .take(limit)
            .map(|(key, value)| KeyValue { key, value })
            .collect();
        Ok(RangeResult { kvs, more })
    }

    async fn get_range_reverse(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<RangeResult> {
        let all = self.range_kvs(begin, end);
        let more = all.len() > limit;
        let kvs = all
            .into_iter()
            .rev()
            .take(limit)
            .map(|(key, value)| KeyValue { key, value })
            .collect();
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
        {
            let mut injected = self.store.injected_commit_errors.lock().unwrap();
            if !injected.is_empty() {
                return Err(injected.remove(0));
            }
        }
        let mut inner = self.store.inner.write().unwrap();
        for write in self.writes.drain(..) {
            match write {
                Write::Set(key, value) => {
                    inner.data.insert(key, value);
                }
                Write::Clear(key) => {
                    inner.data.remove(&key);
                }
                Write::ClearRange(begin, end) => {
                    let doomed: Vec<Key> = inner
                        .data
                        .range::<[u8], _>((Bound::Included(&begin[..]), Bound::Excluded(&end[..])))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        inner.data.remove(&key);
                    }
                }
            }
        }
        inner.version += 1;
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
        self.snapshot = None;
        self.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[tokio::test]
    async fn run_transaction_retries_injected_failures() {
        let store = MemoryStore::new();
        store.inject_commit_errors([Error::NotCommitted, Error::NotCommitted]);

        run_transaction(&store, &[TxOption::AccessSystemKeys], |tr| {
            async move {
                tr.set(b"k", b"v");
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap();

        assert_eq!(store.get_raw(b"k"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn run_transaction_propagates_fatal_errors() {
        let store = MemoryStore::new();
        store.inject_commit_errors([Error::OperationFailed]);

        let err = run_transaction(&store, &[], |tr| {
            async move {
                tr.set(b"k", b"v");
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap_err();

        assert_eq!(err, Error::OperationFailed);
        assert_eq!(store.get_raw(b"k"), None);
    }

    #[tokio::test]
    async fn reads_are_snapshot_consistent() {
        let store = MemoryStore::new();
        store.seed([(b"a".to_vec(), b"1".to_vec())]);

        let mut tr = store.transaction();
        assert_eq!(tr.get(b"a").await.unwrap(), Some(b"1".to_vec()));

        store.seed([(b"a".to_vec(), b"2".to_vec())]);
        assert_eq!(tr.get(b"a").await.unwrap(), Some(b"1".to_vec()));

        tr.reset();
        assert_eq!(tr.get(b"a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn range_reads_report_truncation() {
        let store = MemoryStore::new();
        store.seed((0..5u8).map(|i| (vec![b'k', i], vec![i])));

        let mut tr = store.transaction();
        let res = tr.get_range(b"k", b"l", 3).await.unwrap();
        assert_eq!(res.kvs.len(), 3);
        assert!(res.more);

        let res = tr.get_range(b"k", b"l", 10).await.unwrap();
        assert_eq!(res.kvs.len(), 5);
        assert!(!res.more);

        let rev = tr.get_range_reverse(b"k", b"l", 2).await.unwrap();
        assert_eq!(rev.kvs[0].key, vec![b'k', 4]);
        assert!(rev.more);
    }
}

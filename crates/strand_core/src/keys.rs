//! Byte-string keys, half-open key ranges, and the system keyspace layout.
//!
//! Key names below are the wire layout; changing any of them is a
//! cluster-wide format change. Values are versioned JSON documents encoded
//! by `cluster.rs`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::Uid;
use crate::store::{KeyValue, Transaction};

pub type Key = Vec<u8>;

/// A half-open interval `[begin, end)` over byte-string keys.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// The whole user keyspace. System keys live above `end`.
    pub fn all() -> Self {
        Self::new(Vec::new(), vec![0xff])
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.begin.as_slice() <= key && key < self.end.as_slice()
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.is_empty() || (self.begin <= other.begin && other.end <= self.end)
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

impl std::fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            String::from_utf8_lossy(&self.begin),
            String::from_utf8_lossy(&self.end)
        )
    }
}

pub const DATA_DISTRIBUTION_MODE_KEY: &[u8] = b"\xff/dataDistributionMode";
pub const MOVE_KEYS_LOCK_OWNER_KEY: &[u8] = b"\xff/moveKeysLock/Owner";
pub const MOVE_KEYS_LOCK_WRITE_KEY: &[u8] = b"\xff/moveKeysLock/Write";
pub const HEALTHY_ZONE_KEY: &[u8] = b"\xff\x02/healthyZone";
pub const WORKER_LIST_PREFIX: &[u8] = b"\xff/worker/";
pub const SERVER_LIST_PREFIX: &[u8] = b"\xff/serverList/";
pub const SERVER_TAG_PREFIX: &[u8] = b"\xff/serverTag/";
pub const KEY_SERVERS_PREFIX: &[u8] = b"\xff/keyServers/";
pub const DATA_MOVE_PREFIX: &[u8] = b"\xff/dataMoves/";
pub const DATACENTER_REPLICAS_PREFIX: &[u8] = b"\xff\x02/datacenterReplicas/";
pub const WRITE_RECOVERY_KEY: &[u8] = b"\xff/writeRecovery";
pub const WRITE_RECOVERY_VALUE_TRUE: &[u8] = b"1";
pub const STORAGE_CACHE_SERVER_PREFIX: &[u8] = b"\xff\x02/cacheServer/";
pub const BULK_LOAD_PREFIX: &[u8] = b"\xff/bulkLoad/";
pub const DATABASE_CONFIGURATION_KEY: &[u8] = b"\xff/conf/topology";
pub const STORAGE_WIGGLE_METRICS_PREFIX: &[u8] = b"\xff/storageWiggleMetrics/";

/// Sentinel healthy-zone id that suppresses storage-failure reactions
/// without an expiration.
pub const IGNORE_SS_FAILURES_ZONE: &[u8] = b"IgnoreSSFailures";

/// The first key lexicographically greater than every key with `prefix`.
pub fn strinc(prefix: &[u8]) -> Key {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < 0xff {
            out.push(last + 1);
            return out;
        }
    }
    // A prefix of all 0xff bytes has no strict upper bound in this keyspace.
    vec![0xff; prefix.len() + 1]
}

/// The range covering every key that starts with `prefix`.
pub fn prefix_range(prefix: &[u8]) -> KeyRange {
    KeyRange::new(prefix.to_vec(), strinc(prefix))
}

/// The key immediately after `key`.
pub fn key_after(key: &[u8]) -> Key {
    let mut out = key.to_vec();
    out.push(0x00);
    out
}

fn concat(prefix: &[u8], suffix: &[u8]) -> Key {
    let mut out = Vec::with_capacity(prefix.len() + suffix.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(suffix);
    out
}

pub fn server_list_key(id: Uid) -> Key {
    concat(SERVER_LIST_PREFIX, id.to_string().as_bytes())
}

pub fn server_tag_key(id: Uid) -> Key {
    concat(SERVER_TAG_PREFIX, id.to_string().as_bytes())
}

pub fn worker_list_key(process_id: &str) -> Key {
    concat(WORKER_LIST_PREFIX, process_id.as_bytes())
}

pub fn data_move_key(id: Uid) -> Key {
    concat(DATA_MOVE_PREFIX, id.to_string().as_bytes())
}

pub fn datacenter_replicas_key(dc_id: &[u8]) -> Key {
    concat(DATACENTER_REPLICAS_PREFIX, dc_id)
}

pub fn decode_datacenter_replicas_key(key: &[u8]) -> Result<Key> {
    key.strip_prefix(DATACENTER_REPLICAS_PREFIX)
        .map(|dc| dc.to_vec())
        .ok_or_else(|| Error::Codec("not a datacenter replicas key".into()))
}

pub fn decode_server_tag_key(key: &[u8]) -> Result<Uid> {
    let hex = key
        .strip_prefix(SERVER_TAG_PREFIX)
        .ok_or_else(|| Error::Codec("not a server tag key".into()))?;
    decode_uid_hex(hex)
}

fn decode_uid_hex(hex: &[u8]) -> Result<Uid> {
    let text = std::str::from_utf8(hex).map_err(|e| Error::Codec(e.to_string()))?;
    if text.len() != 32 {
        return Err(Error::Codec("id is not 32 hex digits".into()));
    }
    let first = u64::from_str_radix(&text[..16], 16).map_err(|e| Error::Codec(e.to_string()))?;
    let second = u64::from_str_radix(&text[16..], 16).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(Uid::new(first, second))
}

pub fn storage_cache_server_key(id: Uid) -> Key {
    concat(STORAGE_CACHE_SERVER_PREFIX, id.to_string().as_bytes())
}

pub fn decode_storage_cache_server_key(key: &[u8]) -> Result<Uid> {
    let hex = key
        .strip_prefix(STORAGE_CACHE_SERVER_PREFIX)
        .ok_or_else(|| Error::Codec("not a cache server key".into()))?;
    decode_uid_hex(hex)
}

pub fn storage_wiggle_metrics_key(primary: bool) -> Key {
    concat(
        STORAGE_WIGGLE_METRICS_PREFIX,
        if primary { b"primary" } else { b"remote" },
    )
}

/// Read a chunk of a range-encoded map (`map_prefix` + boundary key -> value)
/// aligned to `range`.
///
/// Returns at least two boundaries: the first is exactly `range.begin`
/// carrying the value in effect there, and each adjacent pair `(k_i,
/// k_{i+1})` means the value of `k_i` covers `[k_i, k_{i+1})`. When the whole
/// remainder fits under `row_limit`/`byte_limit`, the final boundary is
/// `range.end`; otherwise the final boundary is the last one read and the
/// caller continues from it.
pub async fn krm_get_ranges(
    tr: &mut dyn Transaction,
    map_prefix: &[u8],
    range: &KeyRange,
    row_limit: usize,
    byte_limit: usize,
) -> Result<Vec<KeyValue>> {
    let with_begin = concat(map_prefix, &range.begin);
    let with_end = concat(map_prefix, &range.end);

    // Value in effect at range.begin: the entry at or immediately before it.
    let prev = tr
        .get_range_reverse(map_prefix, &key_after(&with_begin), 1)
        .await?;
    let begin_value = prev.kvs.first().map(|kv| kv.value.clone()).unwrap_or_default();

    let mut out = vec![KeyValue {
        key: range.begin.clone(),
        value: begin_value,
    }];

    let read = tr
        .get_range(&key_after(&with_begin), &with_end, row_limit)
        .await?;

    let mut bytes = 0usize;
    let mut truncated = read.more;
    for kv in &read.kvs {
        bytes += kv.key.len() + kv.value.len();
        out.push(KeyValue {
            key: kv.key[map_prefix.len()..].to_vec(),
            value: kv.value.clone(),
        });
        if bytes >= byte_limit {
            truncated = truncated || out.len() - 1 < read.kvs.len();
            break;
        }
    }
    truncated = truncated || read.kvs.len() >= row_limit;

    if !truncated {
        let last_value = out.last().map(|kv| kv.value.clone()).unwrap_or_default();
        out.push(KeyValue {
            key: range.end.clone(),
            value: last_value,
        });
    }
    Ok(out)
}

/// Read an entire range, failing with `RangeTruncated` if the store reports
/// a partial result.
pub async fn read_range_assert_complete(
    tr: &mut dyn Transaction,
    range: &KeyRange,
    limit: usize,
) -> Result<Vec<KeyValue>> {
    let res = tr.get_range(&range.begin, &range.end, limit).await?;
    if res.more || res.kvs.len() >= limit {
        return Err(Error::RangeTruncated);
    }
    Ok(res.kvs)
}

//! Records persisted in the system keyspace and their codecs.
//!
//! Every value is a JSON document; the key layout lives in `keys.rs`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::Uid;
use crate::keys::{Key, KeyRange, DATABASE_CONFIGURATION_KEY};
use crate::store::SystemStore;

/// Advertised endpoints and placement attributes of one storage server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerInterface {
    pub id: Uid,
    pub address: String,
    #[serde(default)]
    pub secondary_address: Option<String>,
    pub process_id: String,
    #[serde(default)]
    pub datacenter: Option<Key>,
    /// Test-storage servers shadow a live server and never join teams.
    #[serde(default)]
    pub tss: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessClass {
    Unset,
    Storage,
    Transaction,
    Stateless,
    Test,
}

impl Default for ProcessClass {
    fn default() -> Self {
        ProcessClass::Unset
    }
}

/// One worker process as registered with the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessData {
    pub process_id: String,
    #[serde(default)]
    pub process_class: ProcessClass,
    #[serde(default)]
    pub datacenter: Option<Key>,
}

/// One region of the replication topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub dc_id: Key,
}

/// The subset of the database configuration the distributor consumes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfiguration {
    pub regions: Vec<RegionConfig>,
    pub usable_regions: usize,
    pub storage_team_size: usize,
}

impl DatabaseConfiguration {
    pub fn primary_dc_id(&self) -> Option<Key> {
        self.regions.first().map(|r| r.dc_id.clone())
    }

    pub fn remote_dc_ids(&self) -> Vec<Key> {
        self.regions.iter().skip(1).map(|r| r.dc_id.clone()).collect()
    }
}

/// Operator-set zone whose failure is currently tolerated, with the version
/// at which the grant expires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthyZoneValue {
    pub zone: Key,
    pub expiration_version: u64,
}

/// The per-range ownership record in the key-servers map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyServersValue {
    pub src: Vec<Uid>,
    pub dest: Vec<Uid>,
    pub src_id: Uid,
    pub dest_id: Uid,
}

/// Persisted metadata of one planned or in-flight data move.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMoveMeta {
    pub id: Uid,
    pub range: KeyRange,
    pub src: Vec<Uid>,
    pub dest: Vec<Uid>,
    pub priority: i32,
}

pub fn encode_mode(mode: i32) -> Vec<u8> {
    // A bare integer is valid JSON, so integer values encode infallibly.
    mode.to_string().into_bytes()
}

pub fn decode_mode(value: &[u8]) -> Result<i32> {
    Ok(serde_json::from_slice(value)?)
}

pub fn encode_healthy_zone(value: &HealthyZoneValue) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_healthy_zone(value: &[u8]) -> Result<HealthyZoneValue> {
    Ok(serde_json::from_slice(value)?)
}

pub fn encode_server_list_value(ssi: &StorageServerInterface) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(ssi)?)
}

pub fn decode_server_list_value(value: &[u8]) -> Result<StorageServerInterface> {
    Ok(serde_json::from_slice(value)?)
}

pub fn encode_worker_list_value(data: &ProcessData) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(data)?)
}

pub fn decode_worker_list_value(value: &[u8]) -> Result<ProcessData> {
    Ok(serde_json::from_slice(value)?)
}

/// Server tags are small integers assigned by the commit pipeline; the
/// distributor only checks presence.
pub fn encode_server_tag(tag: u64) -> Vec<u8> {
    tag.to_string().into_bytes()
}

pub fn decode_server_tag(value: &[u8]) -> Result<u64> {
    Ok(serde_json::from_slice(value)?)
}

pub fn encode_key_servers_value(value: &KeyServersValue) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_key_servers_value(value: &[u8]) -> Result<KeyServersValue> {
    if value.is_empty() {
        return Ok(KeyServersValue::default());
    }
    Ok(serde_json::from_slice(value)?)
}

pub fn encode_data_move_value(meta: &DataMoveMeta) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(meta)?)
}

pub fn decode_data_move_value(value: &[u8]) -> Result<DataMoveMeta> {
    Ok(serde_json::from_slice(value)?)
}

pub fn encode_datacenter_replicas_value(replicas: usize) -> Vec<u8> {
    replicas.to_string().into_bytes()
}

pub fn decode_datacenter_replicas_value(value: &[u8]) -> Result<usize> {
    Ok(serde_json::from_slice(value)?)
}

pub fn encode_database_configuration(conf: &DatabaseConfiguration) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(conf)?)
}

pub fn decode_database_configuration(value: &[u8]) -> Result<DatabaseConfiguration> {
    Ok(serde_json::from_slice(value)?)
}

/// Read the replication topology. A cluster without one is broken.
pub async fn get_database_configuration(
    store: &dyn SystemStore,
) -> Result<DatabaseConfiguration> {
    let mut tr = store.transaction();
    loop {
        let attempt: Result<DatabaseConfiguration> = async {
            match tr.get(DATABASE_CONFIGURATION_KEY).await? {
                Some(value) => decode_database_configuration(&value),
                None => Err(Error::Internal("database configuration missing".into())),
            }
        }
        .await;
        match attempt {
            Ok(conf) => return Ok(conf),
            Err(err) => tr.on_error(err).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_servers_value_round_trip() {
        let value = KeyServersValue {
            src: vec![Uid::new(1, 1), Uid::new(2, 2)],
            dest: vec![Uid::new(3, 3)],
            src_id: Uid::new(9, 9),
            dest_id: Uid::new(8, 8),
        };
        let encoded = encode_key_servers_value(&value).unwrap();
        assert_eq!(decode_key_servers_value(&encoded).unwrap(), value);
    }

    #[test]
    fn empty_key_servers_value_decodes_to_default() {
        let decoded = decode_key_servers_value(b"").unwrap();
        assert!(decoded.src.is_empty());
        assert!(!decoded.src_id.is_valid());
    }

    #[test]
    fn mode_decode_rejects_garbage() {
        assert!(decode_mode(b"not json").is_err());
        assert_eq!(decode_mode(&encode_mode(1)).unwrap(), 1);
    }
}

//! Distributor knobs.

use std::time::Duration;

/// Tunables for the distributor role. Defaults match production settings;
/// tests and the dev harness shrink the delays.
#[derive(Clone, Debug)]
pub struct DistributorConfig {
    /// How often the held move-keys lock is re-verified.
    pub move_keys_lock_poll_delay: Duration,
    /// Poll interval while waiting for data distribution to be re-enabled.
    pub dd_enabled_check_delay: Duration,
    /// Row cap per key-servers chunk during initial reconstruction.
    pub move_keys_chunk_rows: usize,
    /// Byte cap per key-servers chunk.
    pub move_keys_chunk_bytes: usize,
    /// Upper bound on tolerated storage-worker snapshot failures.
    pub max_storage_snapshot_fault_tolerance: usize,
    /// Upper bound on tolerated coordinator snapshot failures.
    pub max_coordinator_snapshot_fault_tolerance: usize,
    /// Hard deadline for one snapshot attempt. Simulation uses 70 seconds.
    pub snap_create_max_timeout: Duration,
    /// Grace multiplier applied to straggler snapshot replies after quorum.
    pub snap_slow_future_wait_multiplier: f64,
    /// Route relocations through the event buffer instead of the direct
    /// output channel. Both paths exist; this knob selects which one runs.
    pub dd_framework: bool,
    /// Shards carry structured move identifiers that must cross-validate
    /// against the persisted data-move table.
    pub shard_encode_location_metadata: bool,
    /// Maintain the physical-shard accounting and its status monitor.
    pub physical_shard_core: bool,
    /// Emit merge relocations for undersized physical shards.
    pub physical_shard_size_control: bool,
    /// Re-query storage metrics inside the physical-shard monitor instead of
    /// logging the last recorded sizes. Off by default; the recorded-size
    /// behavior is the long-standing one.
    pub remeasure_physical_shards: bool,
    /// Physical shards below this size are merge candidates.
    pub min_physical_shard_bytes: i64,
    pub physical_shard_monitor_interval: Duration,
    /// Poll interval of the cache-server watcher.
    pub cache_server_poll_delay: Duration,
    /// Build the tenant cache and run its monitor alongside the pipeline.
    pub tenant_aware: bool,
    /// In-process simulated run: teardown may clear the shard map in place.
    pub simulated: bool,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            move_keys_lock_poll_delay: Duration::from_secs(5),
            dd_enabled_check_delay: Duration::from_secs(1),
            move_keys_chunk_rows: 100,
            move_keys_chunk_bytes: 1 << 20,
            max_storage_snapshot_fault_tolerance: 1,
            max_coordinator_snapshot_fault_tolerance: 1,
            snap_create_max_timeout: Duration::from_secs(300),
            snap_slow_future_wait_multiplier: 1.0,
            dd_framework: false,
            shard_encode_location_metadata: false,
            physical_shard_core: false,
            physical_shard_size_control: false,
            remeasure_physical_shards: false,
            min_physical_shard_bytes: 16 << 20,
            physical_shard_monitor_interval: Duration::from_secs(60),
            cache_server_poll_delay: Duration::from_secs(5),
            tenant_aware: false,
            simulated: false,
        }
    }
}

impl DistributorConfig {
    /// The snapshot deadline actually applied, honoring the simulation cap.
    pub fn snap_timeout(&self) -> Duration {
        if self.simulated {
            Duration::from_secs(70)
        } else {
            self.snap_create_max_timeout
        }
    }
}

//! The Strand data distributor.
//!
//! This crate implements the control-plane role that plans and supervises
//! replica placement: it reconstructs the cluster's shard/team/move state
//! from the system keyspace, drives the shard-moving pipeline, rotates
//! storage servers through graceful replacement, and orchestrates
//! cluster-consistent snapshots. It never moves data bytes itself; the
//! tracker, relocation queue, and team collections are collaborators
//! reached through the seams in `pipeline.rs`.

pub mod config;
pub mod enabled;
pub mod handlers;
pub mod harness;
pub mod initial;
pub mod lock;
pub mod monitor;
pub mod pipeline;
pub mod relocation;
pub mod snapshot;
pub mod supervisor;
pub mod teams;
pub mod watcher;
pub mod wiggler;

pub use config::DistributorConfig;
pub use enabled::DdEnabledState;
pub use handlers::{data_distributor, DistributorRequest};
pub use initial::{DataMove, DdShardInfo, InitialDataDistribution};
pub use lock::MoveKeysLock;
pub use supervisor::DistributorData;
pub use wiggler::StorageWiggler;

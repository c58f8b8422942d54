//! Shared substrate for Strand's control plane.
//!
//! This crate holds the pieces every control-plane role needs: stable
//! identifiers, the byte-string key model and the system keyspace layout,
//! the transactional-store seam (with in-memory and fjall-backed
//! implementations), contiguous range maps, and the cluster-wide error
//! taxonomy.

pub mod cluster;
pub mod error;
pub mod ids;
pub mod keys;
pub mod range_map;
pub mod smoother;
pub mod store;

mod fjall_store;

pub use error::{Error, Result};
pub use fjall_store::FjallStore;
pub use ids::Uid;
pub use keys::{Key, KeyRange};
pub use range_map::RangeMap;
pub use smoother::Smoother;
pub use store::{
    run_transaction, KeyValue, MemoryStore, RangeResult, SystemStore, Transaction, TxOption,
};

/// Row cap used by full-table reads. Reads hitting this cap (or reporting a
/// truncated result) are an invariant violation, not a pagination request.
pub const TOO_MANY: usize = 1_000_000;

//! Coordination store primitives shared by every worker.
//!
//! The store is a TTL-based key-value service (Redis) that acts as
//! distributed lock manager, atomic counter, and ephemeral cache. Workers
//! share no memory; everything they agree on flows through here.

pub mod counter;
pub mod lock;
pub mod store;

pub use counter::RoundRobinCounter;
pub use lock::DistributedLock;
pub use store::{CoordStore, LockAcquisition};

pub mod config;
pub mod coord;
pub mod logging;
pub mod models;

pub use config::Config;
pub use coord::{CoordStore, DistributedLock, LockAcquisition, RoundRobinCounter};
pub use models::{AccountClaim, DispatchPool, Operator, OperatorRole};

pub mod error;
pub(crate) mod keys;
pub mod monitor;
pub mod quality;
pub mod source;
pub mod sources;
pub mod stats;
pub mod supervisor;
pub mod viewers;

pub use error::{Error, Result};
pub use monitor::HealthMonitor;
pub use quality::StreamQuality;
pub use sources::{CameraSources, StaticSources};
pub use stats::StreamStats;
pub use supervisor::{StartOutcome, StreamSupervisor};
pub use viewers::ViewerCounter;

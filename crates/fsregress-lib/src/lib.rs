pub mod affinity;
pub mod cli;
pub mod config;
pub mod engine;
pub mod progress;
pub mod registry;
pub mod sizing;
pub mod workloads;

pub use config::{ConfigError, HarnessConfig};
pub use engine::{EngineError, StorageEngine};
pub use registry::{Registry, RunReport, Sequencer, Status};
pub use sizing::IntensityTier;
pub use workloads::{RunContext, WorkloadError};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

//! Persisted settings for the loopback replication host.
//!
//! One RON file (`config.ron`) holds every tunable of the simulation, the
//! adjustment protocol and the host; [`CliArgs`] overrides a subset of them
//! per run. Unknown or missing fields fall back to defaults so older files
//! keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    AdjustmentConfig, CONFIG_FILE_NAME, CastingConfig, Config, DebugConfig, LoopbackConfig,
    NetworkConfig, PredictionConfig, ReplicationConfig, SimulationConfig,
};
pub use error::ConfigError;

//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration of a replication host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Fixed-timestep settings.
    pub simulation: SimulationConfig,
    /// Network settings.
    pub network: NetworkConfig,
    /// Client-side prediction settings.
    pub prediction: PredictionConfig,
    /// AOI and remote-entity replication settings.
    pub replication: ReplicationConfig,
    /// Tick adjustment protocol settings.
    pub adjustment: AdjustmentConfig,
    /// Cast settings.
    pub casting: CastingConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
    /// Headless loopback host settings.
    pub loopback: LoopbackConfig,
}

/// Fixed-timestep configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulation rate shared by server and clients (Hz).
    pub tick_rate_hz: u32,
    /// Catch-up limit per frame.
    pub max_ticks_per_frame: u32,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Handshaken players the server admits.
    pub max_players: u32,
    /// Payloads at least this large are LZ4-compressed (bytes).
    pub compression_threshold: usize,
}

/// Prediction configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PredictionConfig {
    /// Input history length in ticks. Bounds the tolerated lead.
    pub input_history_length: usize,
    /// Ticks a client starts ahead of the server.
    pub initial_tick_lead: u32,
}

/// Replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    /// AOI radius in world units.
    pub aoi_radius: f32,
    /// Initial replication offset in ticks (negative).
    pub initial_replication_offset: i32,
    /// Spatial grid cell size in world units.
    pub spatial_cell_size: f32,
    /// Movement speed in world units per second.
    pub movement_speed: f32,
}

/// Tick adjustment configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdjustmentConfig {
    /// Tick-diff samples kept per connection.
    pub history_capacity: usize,
    /// Fresh samples needed before adjusting.
    pub min_fresh_samples: usize,
    /// Fraction trimmed from each end before averaging.
    pub trim_fraction: f64,
    /// Desired client lead in ticks.
    pub target_lead: i32,
    /// Deviation tolerated without adjusting.
    pub tolerance: i32,
    /// Ticks between evaluations.
    pub interval_ticks: u32,
}

/// Cast configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CastingConfig {
    /// Global cooldown in milliseconds.
    pub global_cooldown_ms: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

/// Headless loopback host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Scripted bot clients to connect.
    pub bot_count: u32,
    /// Simulated run length in seconds.
    pub run_seconds: u32,
    /// Run ticks back to back instead of at wall-clock rate.
    pub headless_fast: bool,
}

// --- Default implementations ---

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 30,
            max_ticks_per_frame: 10,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_players: 64,
            compression_threshold: 256,
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            input_history_length: 20,
            initial_tick_lead: 2,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            aoi_radius: 50.0,
            // Absorbs pull-back adjustments worth a full input history.
            initial_replication_offset: -41,
            spatial_cell_size: 16.0,
            movement_speed: 60.0,
        }
    }
}

impl Default for AdjustmentConfig {
    fn default() -> Self {
        Self {
            history_capacity: 60,
            min_fresh_samples: 10,
            trim_fraction: 0.2,
            target_lead: 2,
            tolerance: 1,
            interval_ticks: 30,
        }
    }
}

impl Default for CastingConfig {
    fn default() -> Self {
        Self {
            global_cooldown_ms: 1000,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            bot_count: 8,
            run_seconds: 10,
            headless_fast: false,
        }
    }
}

// --- Load / Save / Reload ---

/// File name of the persisted configuration.
pub const CONFIG_FILE_NAME: &str = "config.ron";

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Platform config directory, `<config_dir>/nebula`, falling back to the
    /// working directory.
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("nebula"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Loads `config.ron` from `config_dir`, writing the defaults there first
    /// if the file does not exist.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            let config = read_config(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            return Ok(config);
        }
        let config = Config::default();
        config.save(config_dir)?;
        log::info!("Created default config at {}", config_path.display());
        Ok(config)
    }

    /// Writes `config.ron` into `config_dir`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let write_error = |source| ConfigError::Write {
            path: config_path.clone(),
            source,
        };
        std::fs::create_dir_all(config_dir).map_err(write_error)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;
        std::fs::write(&config_path, serialized).map_err(write_error)
    }

    /// Re-reads `config.ron`; `Some` only if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_config(&config_dir.join(CONFIG_FILE_NAME))?;
        if &fresh == self {
            return Ok(None);
        }
        log::info!("Config reloaded with changes");
        Ok(Some(fresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(!ron_str.is_empty());
        assert!(ron_str.contains("tick_rate_hz: 30"));
        assert!(ron_str.contains("max_players: 64"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_field_uses_default() {
        // Config missing the `adjustment` section entirely
        let ron_str = "(simulation: (), network: (), replication: (aoi_radius: 80.0), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.adjustment, AdjustmentConfig::default());
        assert_eq!(config.replication.aoi_radius, 80.0);
        assert_eq!(config.replication.initial_replication_offset, -41);
    }

    #[test]
    fn test_extra_field_ignored() {
        let ron_str = "(future_setting: true)";
        // RON with #[serde(default)] and deny_unknown_fields not set should accept this
        let result: Result<Config, _> = ron::from_str(ron_str);
        assert!(result.is_ok());
    }

    #[test]
    fn test_legacy_endpoint_fields_are_ignored() {
        let ron_str = "(network: (server_port: 9000, max_players: 3), debug: (log_to_file: true))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.max_players, 3);
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.simulation.tick_rate_hz = 60;
        config.loopback.bot_count = 3;
        config.network.max_players = 4;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.replication.aoi_radius = 75.0;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_some());
        assert_eq!(result.unwrap().replication.aoi_radius, 75.0);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{{not valid}}").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_reload_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::default().reload(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_ron_comments_preserved() {
        let ron_str = "// This is a comment\n(\n  // Another comment\n)";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config, Config::default());
    }
}

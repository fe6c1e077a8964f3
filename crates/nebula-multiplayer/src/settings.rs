//! Tunables shared by [`ReplicationServer`](crate::server::ReplicationServer)
//! and [`ReplicationClient`](crate::client::ReplicationClient).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adjustment::AdjustmentPolicy;
use crate::aoi::DEFAULT_AOI_RADIUS;
use crate::codec::CompressionConfig;
use crate::error::ReplicationError;
use crate::input_history::DEFAULT_INPUT_HISTORY_LENGTH;
use crate::offset::{DEFAULT_REPLICATION_OFFSET, offset_for_history};
use crate::spatial::DEFAULT_CELL_SIZE;
use crate::tick::{DEFAULT_MAX_TICKS_PER_FRAME, DEFAULT_TICK_RATE, tick_duration};

/// Simulation, prediction and replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Fixed simulation rate.
    pub tick_rate_hz: u32,
    /// Catch-up limit per frame.
    pub max_ticks_per_frame: u32,
    /// Input history length in ticks.
    pub input_history_length: usize,
    /// Ticks the client starts ahead of the server tick it was handed.
    pub initial_tick_lead: u32,
    /// AOI radius in world units.
    pub aoi_radius: f32,
    /// Initial replication offset in ticks. Must be negative.
    pub initial_replication_offset: i32,
    /// Spatial grid cell size.
    pub spatial_cell_size: f32,
    /// Movement speed in world units per second.
    pub movement_speed: f32,
    /// Tick adjustment policy.
    pub adjustment: AdjustmentPolicy,
    /// Global cooldown in milliseconds.
    pub global_cooldown_ms: u64,
    /// Wire compression threshold in bytes.
    pub compression_threshold: usize,
    /// Handshaken connections the server admits.
    pub max_players: usize,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick_rate_hz: DEFAULT_TICK_RATE,
            max_ticks_per_frame: DEFAULT_MAX_TICKS_PER_FRAME,
            input_history_length: DEFAULT_INPUT_HISTORY_LENGTH,
            initial_tick_lead: 2,
            aoi_radius: DEFAULT_AOI_RADIUS,
            initial_replication_offset: DEFAULT_REPLICATION_OFFSET,
            spatial_cell_size: DEFAULT_CELL_SIZE,
            movement_speed: 60.0,
            adjustment: AdjustmentPolicy::default(),
            global_cooldown_ms: 1000,
            compression_threshold: CompressionConfig::default().threshold,
            max_players: 64,
        }
    }
}

impl SimulationSettings {
    /// Rejects settings the core cannot run with.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        let invalid = |msg: &str| Err(ReplicationError::InvalidSettings(msg.to_owned()));
        if self.tick_rate_hz == 0 {
            return invalid("tick_rate_hz must be positive");
        }
        if self.input_history_length == 0 {
            return invalid("input_history_length must be positive");
        }
        if self.initial_replication_offset >= 0 {
            return invalid("initial_replication_offset must be negative");
        }
        if self.initial_replication_offset > offset_for_history(self.input_history_length) {
            return invalid(
                "initial_replication_offset must be at most -(2 * input_history_length + 1)",
            );
        }
        if !(self.aoi_radius > 0.0) {
            return invalid("aoi_radius must be positive");
        }
        if !(self.movement_speed >= 0.0) {
            return invalid("movement_speed must not be negative");
        }
        if self.initial_tick_lead as usize >= self.input_history_length {
            return invalid("initial_tick_lead must be shorter than the input history");
        }
        if !(0.0..0.5).contains(&self.adjustment.trim_fraction) {
            return invalid("adjustment.trim_fraction must be in [0, 0.5)");
        }
        if self.adjustment.interval_ticks == 0 {
            return invalid("adjustment.interval_ticks must be positive");
        }
        Ok(())
    }

    /// Duration of one tick.
    pub fn tick_duration(&self) -> Duration {
        tick_duration(self.tick_rate_hz)
    }

    /// Movement per tick in world units.
    pub fn speed_per_tick(&self) -> f32 {
        self.movement_speed / self.tick_rate_hz.max(1) as f32
    }

    /// Global cooldown.
    pub fn global_cooldown(&self) -> Duration {
        Duration::from_millis(self.global_cooldown_ms)
    }

    /// Wire compression settings.
    pub fn compression(&self) -> CompressionConfig {
        CompressionConfig {
            threshold: self.compression_threshold,
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = SimulationSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.speed_per_tick(), 2.0);
    }

    #[test]
    fn test_rejects_non_negative_offset() {
        let settings = SimulationSettings {
            initial_replication_offset: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ReplicationError::InvalidSettings(msg)) if msg.contains("offset")
        ));
    }

    #[test]
    fn test_rejects_offset_shorter_than_negative_drift() {
        let settings = SimulationSettings {
            initial_replication_offset: -3,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ReplicationError::InvalidSettings(msg)) if msg.contains("offset")
        ));

        // A shorter history tolerates a shorter offset.
        let settings = SimulationSettings {
            input_history_length: 4,
            initial_replication_offset: -9,
            ..Default::default()
        };
        settings.validate().unwrap();
    }

    #[test]
    fn test_default_offset_follows_history_length() {
        let settings = SimulationSettings::default();
        assert_eq!(
            settings.initial_replication_offset,
            offset_for_history(settings.input_history_length)
        );
        assert_eq!(settings.initial_replication_offset, -41);
    }

    #[test]
    fn test_rejects_lead_longer_than_history() {
        let settings = SimulationSettings {
            input_history_length: 4,
            initial_tick_lead: 4,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_nan_radius() {
        let settings = SimulationSettings {
            aoi_radius: f32::NAN,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}

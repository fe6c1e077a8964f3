//! Conversion from the persisted [`Config`] to the core's settings.

use nebula_config::Config;
use nebula_multiplayer::{AdjustmentPolicy, SimulationSettings};

/// Builds validated simulation settings from `config`.
pub fn simulation_settings(config: &Config) -> Result<SimulationSettings, nebula_multiplayer::ReplicationError> {
    let settings = SimulationSettings {
        tick_rate_hz: config.simulation.tick_rate_hz,
        max_ticks_per_frame: config.simulation.max_ticks_per_frame,
        input_history_length: config.prediction.input_history_length,
        initial_tick_lead: config.prediction.initial_tick_lead,
        aoi_radius: config.replication.aoi_radius,
        initial_replication_offset: config.replication.initial_replication_offset,
        spatial_cell_size: config.replication.spatial_cell_size,
        movement_speed: config.replication.movement_speed,
        adjustment: AdjustmentPolicy {
            history_capacity: config.adjustment.history_capacity,
            min_fresh_samples: config.adjustment.min_fresh_samples,
            trim_fraction: config.adjustment.trim_fraction,
            target_lead: config.adjustment.target_lead,
            tolerance: config.adjustment.tolerance,
            interval_ticks: config.adjustment.interval_ticks,
        },
        global_cooldown_ms: config.casting.global_cooldown_ms,
        compression_threshold: config.network.compression_threshold,
        max_players: config.network.max_players as usize,
    };
    settings.validate()?;
    Ok(settings)
}

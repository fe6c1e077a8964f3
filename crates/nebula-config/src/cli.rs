//! Command-line argument parsing for the replication host.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Loopback replication host command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "nebula-server", about = "Headless replication server with loopback bots")]
pub struct CliArgs {
    /// Simulation tick rate (Hz).
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// AOI radius in world units.
    #[arg(long)]
    pub aoi_radius: Option<f32>,

    /// Number of scripted bot clients.
    #[arg(long)]
    pub bots: Option<u32>,

    /// Simulated run length in seconds.
    #[arg(long)]
    pub run_seconds: Option<u32>,

    /// Run ticks back to back instead of at wall-clock rate.
    #[arg(long)]
    pub headless_fast: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(rate) = args.tick_rate {
            self.simulation.tick_rate_hz = rate;
        }
        if let Some(radius) = args.aoi_radius {
            self.replication.aoi_radius = radius;
        }
        if let Some(bots) = args.bots {
            self.loopback.bot_count = bots;
        }
        if let Some(seconds) = args.run_seconds {
            self.loopback.run_seconds = seconds;
        }
        if args.headless_fast {
            self.loopback.headless_fast = true;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            tick_rate: Some(60),
            bots: Some(2),
            headless_fast: true,
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.simulation.tick_rate_hz, 60);
        assert_eq!(config.loopback.bot_count, 2);
        assert!(config.loopback.headless_fast);
        // Non-overridden fields retain defaults
        assert_eq!(config.replication.aoi_radius, 50.0);
        assert_eq!(config.network.max_players, 64);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "nebula-server",
            "--bots",
            "4",
            "--aoi-radius",
            "75.5",
            "--headless-fast",
        ]);
        assert_eq!(args.bots, Some(4));
        assert_eq!(args.aoi_radius, Some(75.5));
        assert!(args.headless_fast);
        assert!(args.tick_rate.is_none());
    }

    #[test]
    fn test_cli_has_no_network_endpoint_flags() {
        assert!(CliArgs::try_parse_from(["nebula-server", "--port", "7777"]).is_err());
    }
}

//! Headless replication server driving scripted bots over loopback.

mod bots;
mod host;
mod settings;

use clap::Parser;
use nebula_config::{CliArgs, Config};
use tracing::{error, info};

use crate::host::{HostError, LoopbackHost};

fn run(config: &Config) -> Result<(), HostError> {
    let settings = settings::simulation_settings(config)?;
    let mut host = LoopbackHost::new(settings, &config.loopback)?;
    let report = host.run()?;
    report.log();
    Ok(())
}

fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args.config.clone().unwrap_or_else(Config::default_dir);

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    nebula_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));
    info!(config_dir = %config_dir.display(), "nebula-server starting");

    if let Err(e) = run(&config) {
        error!("{e}");
        std::process::exit(1);
    }
}

//! Loopback host: one server and a set of scripted bots in one process.

use std::time::{Duration, Instant};

use nebula_config::LoopbackConfig;
use nebula_multiplayer::{
    ClientStats, CompressionConfig, ConnectionId, ConnectionStats, LoopbackConnector,
    LoopbackServerTransport, Position, ReplicationClient, ReplicationError, ReplicationServer,
    ServerStats, SimulationSettings, Tick, TransportError, loopback,
};
use tracing::{info, warn};

use crate::bots::{Bot, host_castables};

/// Longest wall-clock frame fed to the simulation.
pub const MAX_FRAME_TIME: Duration = Duration::from_millis(250);

/// Fatal host failures.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The server's state can no longer be trusted.
    #[error("server failed: {0}")]
    Replication(#[from] ReplicationError),

    /// A bot could not open its loopback link.
    #[error("bot link failed: {0}")]
    Transport(#[from] TransportError),
}

/// Counters gathered at the end of a run.
#[derive(Debug, Clone)]
pub struct HostReport {
    /// Server ticks simulated.
    pub ticks: Tick,
    /// Server-wide counters.
    pub server: ServerStats,
    /// Counters of every connection still open.
    pub connections: Vec<(ConnectionId, ConnectionStats)>,
    /// Per bot: name, counters, and whether it is still running.
    pub bots: Vec<(String, ClientStats, bool)>,
}

impl HostReport {
    /// Logs the report at `info`.
    pub fn log(&self) {
        info!(
            ticks = self.ticks,
            accepted = self.server.connections_accepted,
            dropped = self.server.connections_dropped,
            violations = self.server.protocol_violations,
            casts_completed = self.server.casts_completed,
            casts_canceled = self.server.casts_canceled,
            "server summary"
        );
        for (connection, stats) in &self.connections {
            info!(
                connection = connection.0,
                inits = stats.inits_sent,
                deletes = stats.deletes_sent,
                movement = stats.movement_updates_sent,
                adjustments = stats.adjustments_sent,
                casts_accepted = stats.casts_accepted,
                casts_rejected = stats.casts_rejected,
                "connection summary"
            );
        }
        for (name, stats, active) in &self.bots {
            info!(
                bot = %name,
                active,
                inits = stats.inits_applied,
                deletes = stats.deletes_applied,
                corrections = stats.corrections_applied,
                mismatches = stats.input_mismatches,
                replayed = stats.inputs_replayed,
                adjustments = stats.adjustments_applied,
                casts_predicted = stats.casts_predicted,
                casts_completed = stats.casts_completed,
                casts_canceled = stats.casts_canceled,
                casts_rejected = stats.casts_rejected,
                "bot summary"
            );
        }
    }
}

/// Server plus bots sharing one loopback transport.
pub struct LoopbackHost {
    server: ReplicationServer<LoopbackServerTransport>,
    bots: Vec<Bot>,
    tick_duration: Duration,
    run_ticks: Tick,
    headless_fast: bool,
}

impl LoopbackHost {
    /// Builds the server, connects `loopback.bot_count` bots and places a
    /// pair of idle NPCs near the spawn area.
    pub fn new(settings: SimulationSettings, loopback_config: &LoopbackConfig) -> Result<Self, HostError> {
        let compression = CompressionConfig {
            threshold: settings.compression_threshold,
            ..CompressionConfig::default()
        };
        let (transport, connector) = loopback(compression);
        let gcd = Duration::from_millis(settings.global_cooldown_ms);
        let mut server = ReplicationServer::new(settings.clone(), transport)?
            .with_castables(host_castables(gcd));
        server.spawn_npc("sentinel-west", Position::new(-25.0, 0.0, 0.0));
        server.spawn_npc("sentinel-east", Position::new(25.0, 0.0, 0.0));

        let bots = (0..loopback_config.bot_count)
            .map(|index| connect_bot(&settings, &connector, index))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            bots = bots.len(),
            tick_rate = settings.tick_rate_hz,
            run_seconds = loopback_config.run_seconds,
            headless_fast = loopback_config.headless_fast,
            "loopback host ready"
        );

        Ok(Self {
            server,
            bots,
            tick_duration: settings.tick_duration(),
            run_ticks: loopback_config.run_seconds.saturating_mul(settings.tick_rate_hz),
            headless_fast: loopback_config.headless_fast,
        })
    }

    /// The server.
    pub fn server(&self) -> &ReplicationServer<LoopbackServerTransport> {
        &self.server
    }

    /// The bots, in connection order.
    pub fn bots(&self) -> &[Bot] {
        &self.bots
    }

    /// Runs until the server reaches the configured tick count.
    pub fn run(&mut self) -> Result<HostReport, HostError> {
        let mut previous = Instant::now();
        while self.server.current_tick() < self.run_ticks {
            let dt = if self.headless_fast {
                self.tick_duration
            } else {
                std::thread::sleep(self.tick_duration / 2);
                let now = Instant::now();
                let mut frame_time = now.duration_since(previous);
                previous = now;
                if frame_time > MAX_FRAME_TIME {
                    warn!(
                        "Frame time {:.1}ms exceeds maximum, clamping to {:.1}ms",
                        frame_time.as_secs_f64() * 1000.0,
                        MAX_FRAME_TIME.as_secs_f64() * 1000.0
                    );
                    frame_time = MAX_FRAME_TIME;
                }
                frame_time
            };
            self.step(dt)?;
        }
        Ok(self.report())
    }

    /// Advances the server, then every bot, by `dt`.
    pub fn step(&mut self, dt: Duration) -> Result<(), HostError> {
        self.server.frame(dt)?;
        for bot in &mut self.bots {
            let was_active = bot.is_active();
            bot.drive(dt);
            if was_active && !bot.is_active() {
                release_connection(&mut self.server, bot);
            }
        }
        Ok(())
    }

    /// Current counters.
    pub fn report(&self) -> HostReport {
        HostReport {
            ticks: self.server.current_tick(),
            server: self.server.stats(),
            connections: self
                .server
                .connections()
                .into_iter()
                .filter_map(|c| self.server.connection_stats(c).map(|s| (c, s)))
                .collect(),
            bots: self
                .bots
                .iter()
                .map(|bot| (bot.name.clone(), bot.stats(), bot.is_active()))
                .collect(),
        }
    }
}

fn connect_bot(
    settings: &SimulationSettings,
    connector: &LoopbackConnector,
    index: u32,
) -> Result<Bot, HostError> {
    let transport = connector.connect()?;
    let gcd = Duration::from_millis(settings.global_cooldown_ms);
    let client = ReplicationClient::connect(settings.clone(), transport, &format!("bot-{index}"))?
        .with_castables(host_castables(gcd));
    Ok(Bot::new(index, client))
}

/// Drops the server side of a bot whose session ended.
fn release_connection(server: &mut ReplicationServer<LoopbackServerTransport>, bot: &Bot) {
    let Some(entity) = bot.entity() else {
        return;
    };
    let connection = server
        .connections()
        .into_iter()
        .find(|&c| server.entity_of(c) == Some(entity));
    if let Some(connection) = connection {
        warn!(bot = %bot.name, connection = connection.0, "releasing connection of failed bot");
        server.disconnect(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(bot_count: u32, run_seconds: u32) -> LoopbackConfig {
        LoopbackConfig {
            bot_count,
            run_seconds,
            headless_fast: true,
        }
    }

    #[test]
    fn test_headless_run_reaches_tick_count() {
        let settings = SimulationSettings::default();
        let mut host = LoopbackHost::new(settings.clone(), &fast(3, 2)).unwrap();
        let report = host.run().unwrap();

        assert_eq!(report.ticks, 2 * settings.tick_rate_hz);
        assert_eq!(report.server.connections_accepted, 3);
        assert_eq!(report.server.protocol_violations, 0);
        assert_eq!(report.connections.len(), 3);
        for (name, stats, active) in &report.bots {
            assert!(active, "{name} stopped");
            assert!(stats.ticks > 0, "{name} never ticked");
        }
        assert!(host.bots().iter().all(|bot| bot.entity().is_some()));
        assert_eq!(host.server().connections().len(), 3);
    }

    #[test]
    fn test_bots_see_nearby_sentinels() {
        // Remote state trails the offset, so allow it to drain.
        let mut host = LoopbackHost::new(SimulationSettings::default(), &fast(1, 3)).unwrap();
        host.run().unwrap();

        // Both sentinels and the bot itself sit inside the spawn area.
        let bot = &host.bots()[0];
        assert!(bot.stats().inits_applied >= 1);
    }

    #[test]
    fn test_zero_bots_still_ticks() {
        let mut host = LoopbackHost::new(SimulationSettings::default(), &fast(0, 1)).unwrap();
        let report = host.run().unwrap();
        assert_eq!(report.ticks, SimulationSettings::default().tick_rate_hz);
        assert!(report.bots.is_empty());
    }
}

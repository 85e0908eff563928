use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use statesync_core::{
    AppConfig, DefaultState, DistributionConfig, Domain, PlaybackClock, Quat,
    StateDistributionDomain, StateSyncError, TickClock, TransportKind, Vec3,
};
use tracing_subscriber::EnvFilter;

fn main() -> statesync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(options) => run_simulate(&options),
        Commands::Render(options) => run_render(&options),
    }
}

fn run_simulate(options: &NetworkOptions) -> statesync_core::Result<()> {
    let config = options.resolve(Role::Sender)?;
    tracing::info!(
        address = %config.sender.address,
        port = config.sender.port,
        transport = ?config.sender.transport,
        "starting simulator"
    );

    let mut distribution = StateDistributionDomain::from_config(&config);
    let state = distribution.add_state_sender::<DefaultState>(None)?;
    distribution.initialize(None)?;

    let mut clock = TickClock::new(config.tick_rate_hz);
    let mut playback = PlaybackClock::default();
    let delta = clock.tick_interval().as_secs_f32();

    while options.ticks.map_or(true, |limit| clock.ticks() < limit) {
        playback.advance(delta);
        let t = f64::from(playback.time_seconds);
        state.update(|state| {
            state.pose.position = Vec3::new(t.cos(), t.sin(), 0.0);
            state.pose.orientation = Quat::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), t);
        })?;
        distribution.tick()?;
        clock.wait_next();
    }

    distribution.cleanup(None)
}

fn run_render(options: &NetworkOptions) -> statesync_core::Result<()> {
    let config = options.resolve(Role::Receiver)?;
    tracing::info!(
        address = %config.receiver.address,
        port = config.receiver.port,
        transport = ?config.receiver.transport,
        "starting renderer"
    );

    let mut distribution = StateDistributionDomain::from_config(&config);
    let state = distribution.add_state_receiver::<DefaultState>(None)?;
    distribution.initialize(None)?;

    let mut clock = TickClock::new(config.tick_rate_hz);
    while options.ticks.map_or(true, |limit| clock.ticks() < limit) {
        distribution.tick()?;
        if state.new_states() > 0 {
            let pose = state.snapshot()?.pose;
            tracing::info!(
                x = pose.position.x,
                y = pose.position.y,
                z = pose.position.z,
                "pose updated"
            );
        }
        clock.wait_next();
    }

    distribution.cleanup(None)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Replicates simulator state to renderers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Animate a pose and broadcast it every tick.
    Simulate(NetworkOptions),
    /// Receive the pose and log every update.
    Render(NetworkOptions),
}

#[derive(Args, Debug)]
struct NetworkOptions {
    /// JSON configuration file; flags below override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address to send to (simulate) or listen on (render).
    #[arg(short, long)]
    address: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(short, long, value_enum)]
    transport: Option<TransportArg>,
    /// Ticks per second.
    #[arg(short, long)]
    rate: Option<f32>,
    /// Stop after this many ticks instead of running forever.
    #[arg(long)]
    ticks: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Sender,
    Receiver,
}

impl NetworkOptions {
    fn resolve(&self, role: Role) -> statesync_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        if let Some(rate) = self.rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(StateSyncError::msg(format!("invalid tick rate {rate}")));
            }
            config.tick_rate_hz = rate;
        }

        let target: &mut DistributionConfig = match role {
            Role::Sender => &mut config.sender,
            Role::Receiver => &mut config.receiver,
        };
        if let Some(address) = &self.address {
            target.address = address.clone();
        }
        if let Some(port) = self.port {
            target.port = port;
        }
        if let Some(transport) = self.transport {
            target.transport = transport.into();
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Osc,
    Broadcast,
    Loopback,
}

impl From<TransportArg> for TransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Osc => TransportKind::Osc,
            TransportArg::Broadcast => TransportKind::Broadcast,
            TransportArg::Loopback => TransportKind::Loopback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_selected_role_only() {
        let cli = Cli::parse_from([
            "statesync",
            "simulate",
            "--address",
            "192.168.1.255",
            "--port",
            "9000",
            "--transport",
            "broadcast",
            "--rate",
            "30",
        ]);
        let Commands::Simulate(options) = cli.command else {
            panic!("expected simulate");
        };

        let config = options.resolve(Role::Sender).unwrap();
        assert_eq!(config.sender.address, "192.168.1.255");
        assert_eq!(config.sender.port, 9000);
        assert_eq!(config.sender.transport, TransportKind::Broadcast);
        assert_eq!(config.receiver, DistributionConfig::receiver_defaults());
        assert_eq!(config.tick_rate_hz, 30.0);
    }

    #[test]
    fn rejects_non_positive_rates() {
        let cli = Cli::parse_from(["statesync", "render", "--rate", "0"]);
        let Commands::Render(options) = cli.command else {
            panic!("expected render");
        };
        assert!(options.resolve(Role::Receiver).is_err());
    }

    #[test]
    fn loopback_simulation_runs_a_bounded_number_of_ticks() {
        let cli = Cli::parse_from([
            "statesync",
            "simulate",
            "--transport",
            "loopback",
            "--rate",
            "1000",
            "--ticks",
            "3",
        ]);
        let Commands::Simulate(options) = cli.command else {
            panic!("expected simulate");
        };
        run_simulate(&options).unwrap();
    }
}

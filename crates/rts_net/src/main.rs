//! Lockstep RTS dedicated server.
//!
//! # Usage
//!
//! ```bash
//! # Two players, default scenario
//! cargo run -p rts_net --bin rts_server
//!
//! # From a config file, overriding the port and ending after 10 minutes
//! cargo run -p rts_net --bin rts_server -- --config server.ron --bind 0.0.0.0:9000 --max-ticks 12000
//! ```
//!
//! Logging honours `RUST_LOG`; `--verbose` raises the default to debug.
//! Ctrl-C aborts the match for every connected player before exiting.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rts_net::barrier::DisconnectPolicy;
use rts_net::config::ServerConfig;
use rts_net::server::{LockstepServer, MatchOutcome};

#[derive(Parser)]
#[command(name = "rts_server")]
#[command(about = "Dedicated lockstep server for the RTS core")]
#[command(version)]
struct Cli {
    /// RON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    bind: Option<String>,

    /// Player slots; the scenario is trimmed to fit
    #[arg(short, long)]
    slots: Option<u8>,

    /// Ticks per second
    #[arg(long)]
    tick_rate: Option<u32>,

    /// Ticks between issuing and executing a command
    #[arg(long)]
    input_delay: Option<u64>,

    /// End the match after this many ticks
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Drop disconnected players at once instead of pausing
    #[arg(long)]
    exclude_on_disconnect: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> rts_net::error::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(slots) = self.slots {
            config.slots = slots;
            config.scenario.fit_to_slots(slots);
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        if let Some(input_delay) = self.input_delay {
            config.input_delay = input_delay;
        }
        if self.max_ticks.is_some() {
            config.max_ticks = self.max_ticks;
        }
        if self.exclude_on_disconnect {
            config.disconnect = DisconnectPolicy::Exclude;
        }
        Ok(config)
    }
}

async fn serve(cli: Cli) -> rts_net::error::Result<MatchOutcome> {
    let config = cli.into_config()?;
    let server = LockstepServer::bind(config).await?;
    server.run_until(ctrl_c()).await
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("ctrl-c received, shutting down"),
        Err(err) => {
            tracing::warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match serve(cli).await {
        Ok(MatchOutcome::Completed { ticks, checksum }) => {
            tracing::info!(ticks, ?checksum, "match completed");
            ExitCode::SUCCESS
        }
        Ok(MatchOutcome::Abandoned) => {
            tracing::info!("all players left");
            ExitCode::SUCCESS
        }
        Ok(MatchOutcome::Shutdown { tick }) => {
            tracing::info!(tick, "server stopped");
            ExitCode::SUCCESS
        }
        Ok(MatchOutcome::Desync { tick }) => {
            tracing::error!(tick, "match ended in desync");
            ExitCode::from(2)
        }
        Err(err) => {
            tracing::error!(error = %err, "server failed");
            ExitCode::FAILURE
        }
    }
}

//! # tether
//!
//! Streaming orchestrator binary. Wires settings, logging, the message store,
//! the CLI agent and the turn engine together and serves the control surface
//! over HTTP.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use tether_agent::{CliAgent, CliAgentConfig};
use tether_engine::{EngineConfig, TurnOrchestrator};
use tether_server::{ControlSurface, ServerConfig};
use tether_settings::{load_settings, load_settings_from_path, resolve_path, TetherSettings};
use tether_store::{Database, SqliteGateway};
use tether_telemetry::{init_telemetry, TelemetryConfig};

/// Tether agent session server.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Streams agent sessions to a chat UI")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Agent CLI executable. Searched on `PATH` when unset.
    #[arg(long)]
    agent_bin: Option<PathBuf>,

    /// Path to the `SQLite` message store.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Base log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(bin) = &self.agent_bin {
            settings.agent.binary = Some(bin.display().to_string());
        }
        if let Some(db) = &self.db {
            settings.store.db_path = db.display().to_string();
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);

    let _telemetry = init_telemetry(&TelemetryConfig::from_strings(
        &settings.logging.level,
        &settings.logging.modules,
        settings.logging.json,
    ));
    info!(version = %settings.version, "starting tether");

    let db_path = resolve_path(&settings.store.db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let store = Arc::new(SqliteGateway::new(db));

    let agent = CliAgent::new(CliAgentConfig {
        binary: settings.agent.binary.as_deref().map(resolve_path),
        ..CliAgentConfig::default()
    });
    match agent.resolve_binary() {
        Ok(path) => info!(path = %path.display(), "agent binary resolved"),
        Err(e) => warn!(error = %e, "agent binary not found, turns will fail until it is installed"),
    }

    let engine_config = EngineConfig::from_settings(&settings);
    let orchestrator = Arc::new(TurnOrchestrator::new(Arc::new(agent), store, engine_config));
    let control = ControlSurface::new(orchestrator.clone());

    let server_config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        request_timeout: Duration::from_millis(settings.server.request_timeout_ms),
    };
    let handle = tether_server::start(server_config, control)
        .await
        .context("Failed to start server")?;
    info!(addr = %handle.addr, "tether ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    info!("shutting down");
    let cancelled = orchestrator.shutdown();
    if cancelled > 0 {
        info!(cancelled, "cancelled in-flight turns");
    }
    handle.shutdown().await;
    Ok(())
}

//! deskgate - local control-plane server.
//!
//! Serves the control page and JSON API on the configured port and keeps
//! itself running until Ctrl+C. `deskgate reset-token` wipes the stored
//! access token so the next start goes through first-run setup again.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deskgate::{
    api::{self, AppState, NotificationDefaults, RouterConfig},
    collab::{Collaborators, LogNotifier, StaticSchedule},
    config::{self, Config, ConfigError},
    message_log::MessageLog,
    monitor::HealthMonitor,
    server::{ControlServer, StatusHandle},
    token::{TokenError, TokenStore, TOKEN_FILE},
};

/// deskgate - local control-plane server
///
/// Lets other devices on the network notify, inspect and steer this machine
/// through a small token-protected HTTP API.
#[derive(ClapParser, Debug)]
#[command(name = "deskgate", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(long, env = "DESKGATE_PORT")]
    port: Option<u16>,

    /// Directory for the token store and message logs
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Delete the stored access token; the next start requires setup again
    ResetToken,
}

#[derive(Debug, Error)]
enum DeskgateError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("token store error: {0}")]
    Token(#[from] TokenError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), DeskgateError> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.clone().or_else(config::default_config_path);
    let mut config = match &config_path {
        Some(path) => Config::load(path)?.unwrap_or_default(),
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| config.data_dir.clone())
        .unwrap_or_else(config::default_data_dir);

    match cli.command {
        Some(Commands::ResetToken) => reset_token(&data_dir),
        None => run_server(config, data_dir).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "deskgate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn reset_token(data_dir: &std::path::Path) -> Result<(), DeskgateError> {
    let path = data_dir.join(TOKEN_FILE);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "access token removed; setup is required on next start");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no access token stored");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(config: Config, data_dir: PathBuf) -> Result<(), DeskgateError> {
    tracing::info!(port = config.port, data_dir = %data_dir.display(), "deskgate starting");

    let tokens = Arc::new(TokenStore::open(&data_dir)?);
    if !tokens.is_configured() {
        tracing::warn!(
            "no access token configured; open http://127.0.0.1:{}/setup to create one",
            config.port
        );
    }

    let collaborators = Collaborators {
        notifier: Some(Arc::new(LogNotifier)),
        schedule: Some(Arc::new(StaticSchedule::new(config.class_periods()?))),
        screen: None,
        closer: None,
    };
    let (duration, effects) = config.notification_defaults();
    let status = StatusHandle::new(config.port);
    let state = AppState::new(tokens, collaborators, status.clone())
        .with_message_log(MessageLog::new(&data_dir))
        .with_notification_defaults(NotificationDefaults { duration, effects })
        .with_sweep_interval(config.sweep_interval());
    let exit_gate = state.exit_gate.clone();
    let sweep = state.sweep.clone();

    let rate_limit = Some(config.login_rate_limit).filter(|n| *n > 0);
    let app = api::router(state, RouterConfig { rate_limit });
    let server = Arc::new(ControlServer::new(app, status));

    // A failed first start is left to the health monitor.
    if let Err(e) = server.start().await {
        tracing::error!(error = %e, "initial start failed, health monitor will retry");
    }

    let monitor_cancel = CancellationToken::new();
    let monitor = HealthMonitor::new(server.clone(), config.health_config());
    let monitor_task = monitor.spawn(monitor_cancel.clone());

    wait_for_exit(&exit_gate).await?;

    monitor_cancel.cancel();
    if let Err(e) = monitor_task.await {
        tracing::warn!(error = %e, "health monitor ended abnormally");
    }
    if sweep.status().running {
        if let Err(e) = sweep.disarm() {
            tracing::debug!(error = %e, "auto-close monitor already stopped");
        }
    }
    if let Err(e) = server.shutdown().await {
        tracing::warn!(error = %e, "shutdown did not complete cleanly");
    }
    tracing::info!("deskgate stopped");
    Ok(())
}

/// Wait for Ctrl+C. While the exit gate is armed, the exit token must be
/// typed on stdin before the process is allowed to stop.
async fn wait_for_exit(exit_gate: &deskgate::exit_gate::ExitGate) -> Result<(), DeskgateError> {
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received Ctrl+C");
        if exit_gate.permit_exit(None) {
            return Ok(());
        }

        tracing::warn!("exit gate is armed; enter the exit token to stop");
        let line = tokio::select! {
            line = stdin.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        match line {
            Some(candidate) if exit_gate.permit_exit(Some(candidate.trim())) => return Ok(()),
            _ => tracing::warn!("exit token rejected, still serving"),
        }
    }
}

//! mylogd
//!
//! A local log collector: receives messages on a Unix domain socket, appends
//! each one to a log file and mirrors it to standard output.

mod cli;
mod config;
mod error;
mod listener;
mod server;
mod sink;
mod state;

use clap::Parser;
use cli::{Cli, Command};
use color_eyre::eyre::{Result, bail};
use config::Config;
use listener::Endpoint;
use server::{Server, is_daemon_running, send_log_message};
use sink::LogSink;
use state::{Lifecycle, ServiceState};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Exit code when the socket endpoint cannot be bound
const EXIT_BIND_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let socket_args = cli.socket_args().clone();

    // Load configuration
    let mut config = Config::load(cli.config.as_ref())?
        .with_socket(socket_args.socket)
        .with_transport(socket_args.transport)
        .with_log_level(cli.log_level.clone());

    // Only the collector itself logs at the configured level
    match &cli.command {
        Command::Start { .. } => {
            init_logging(&config.daemon.log_level)?;
        }
        _ => {
            // For client commands, use minimal logging
            init_logging("warn")?;
        }
    }

    match cli.command {
        Command::Start {
            log_file,
            dispatch,
            receive_timeout_ms,
            ..
        } => {
            config = config
                .with_log_file(log_file)
                .with_dispatch(dispatch)
                .with_receive_timeout_ms(receive_timeout_ms);
            cmd_start(config).await
        }
        Command::Send { message, .. } => cmd_send(&config, message).await,
        Command::Status { .. } => cmd_status(&config).await,
    }
}

/// Operational logs go to stderr; stdout carries the echoed records
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

async fn cmd_start(config: Config) -> Result<ExitCode> {
    let socket_path = config.daemon.socket.clone();
    let state = Arc::new(ServiceState::new());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %socket_path.display(),
        transport = %config.daemon.transport,
        log_file = %config.sink.log_file.display(),
        "Starting mylogd"
    );

    // Refuse to steal the path from a live collector
    if is_daemon_running(&socket_path, config.daemon.transport).await {
        tracing::error!(socket = %socket_path.display(), "Collector is already running");
        state.transition(Lifecycle::Stopped);
        return Ok(ExitCode::from(EXIT_BIND_FAILURE));
    }

    let endpoint = match Endpoint::from_config(&config.daemon) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::error!(error = %e, os_code = ?e.os_code(), "Bind failed");
            state.transition(Lifecycle::Stopped);
            return Ok(ExitCode::from(EXIT_BIND_FAILURE));
        }
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    spawn_signal_handler(shutdown_tx)?;

    let sink = Arc::new(LogSink::new(&config.sink));
    let server = Server::new(endpoint, sink, Arc::clone(&state), shutdown_rx)
        .with_dispatch(config.daemon.dispatch, config.daemon.max_in_flight);
    server.run().await;

    tracing::info!(lifecycle = %state.lifecycle(), "Collector stopped");
    Ok(ExitCode::SUCCESS)
}

/// Send the shutdown signal on SIGTERM or SIGINT
fn spawn_signal_handler(shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT");
            }
        }

        let _ = shutdown_tx.send(());
    });

    Ok(())
}

async fn cmd_send(config: &Config, message: String) -> Result<ExitCode> {
    let socket_path = &config.daemon.socket;

    if message.is_empty() {
        bail!("Refusing to send an empty message");
    }

    if let Err(e) = send_log_message(socket_path, config.daemon.transport, message.as_bytes()).await
    {
        bail!(
            "Failed to send to collector at {}: {}",
            socket_path.display(),
            e
        );
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_status(config: &Config) -> Result<ExitCode> {
    let socket_path = &config.daemon.socket;

    if is_daemon_running(socket_path, config.daemon.transport).await {
        println!(
            "Collector is running at {} ({})",
            socket_path.display(),
            config.daemon.transport
        );
        println!("Log file: {}", config.sink.log_file.display());
    } else if socket_path.exists() {
        println!(
            "Collector is not running (stale socket at {})",
            socket_path.display()
        );
    } else {
        println!("Collector is not running");
    }

    Ok(ExitCode::SUCCESS)
}

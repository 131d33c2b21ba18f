//! Command-line interface for mylogd.
//!
//! Provides commands for running the collector and talking to a running one.

use crate::config::DispatchMode;
use clap::{Parser, Subcommand};
use mylog_protocol::{SOCKET_ENV_VAR, Transport};
use std::path::PathBuf;

/// mylogd - local log collector listening on a Unix domain socket
#[derive(Debug, Parser)]
#[command(name = "mylogd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "MYLOGD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, env = "MYLOGD_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every command that talks to the socket
#[derive(Debug, Clone, clap::Args)]
pub struct SocketArgs {
    /// Override socket path
    #[arg(short, long, env = SOCKET_ENV_VAR)]
    pub socket: Option<PathBuf>,

    /// Socket type (datagram or stream)
    #[arg(short, long)]
    pub transport: Option<Transport>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the collector in the foreground
    Start {
        #[command(flatten)]
        socket: SocketArgs,

        /// Override target log file
        #[arg(short = 'f', long)]
        log_file: Option<PathBuf>,

        /// How received messages are handed to the log file
        #[arg(short, long, value_enum)]
        dispatch: Option<DispatchMode>,

        /// Receive timeout in milliseconds (0 disables it)
        #[arg(long)]
        receive_timeout_ms: Option<u64>,
    },

    /// Send one message to a running collector
    Send {
        /// Message text
        message: String,

        #[command(flatten)]
        socket: SocketArgs,
    },

    /// Show whether a collector is listening
    Status {
        #[command(flatten)]
        socket: SocketArgs,
    },
}

impl Cli {
    /// Socket options of whichever command was given
    pub fn socket_args(&self) -> &SocketArgs {
        match &self.command {
            Command::Start { socket, .. }
            | Command::Send { socket, .. }
            | Command::Status { socket } => socket,
        }
    }
}

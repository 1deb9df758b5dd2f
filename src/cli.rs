use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::server::ServerConfig;

/// Lottery coordination over TCP: a central server collects bet batches
/// from a fixed set of agencies and answers each one with its winners once
/// every agency has finished.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the central server agencies submit their bets to.
    Server(ServerArgs),
    /// Submit one agency's bet file and wait for its winners.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on; use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub listen: SocketAddr,

    /// Pending-connection queue depth for the listening socket.
    #[arg(long, default_value_t = 128)]
    pub backlog: u32,

    /// Number of agencies that must finish before the draw happens.
    #[arg(long, default_value_t = 5)]
    pub agencies: usize,

    /// Path of the append-only bet log.
    #[arg(long, default_value = "bets.csv")]
    pub data_file: PathBuf,

    /// Seconds a finished agency waits for the rest before giving up.
    #[arg(long, default_value_t = 120)]
    pub draw_timeout_secs: u64,

    /// Seconds granted to in-flight connections when shutting down.
    #[arg(long, default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}

impl ServerArgs {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            backlog: self.backlog,
            agencies: self.agencies,
            data_file: self.data_file,
            draw_timeout: Duration::from_secs(self.draw_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Agency id this client submits under.
    #[arg(long)]
    pub id: u32,

    /// Address of the lottery server.
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub server: SocketAddr,

    /// Bet file to submit: one comma-separated row per bet with first
    /// name, last name, document, birthdate and wager number.
    #[arg(long)]
    pub file: PathBuf,

    /// Maximum number of bets per submission message.
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,
}

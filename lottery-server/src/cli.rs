use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use crate::bet::DEFAULT_WINNING_NUMBER;

/// Lottery bet intake server. Every option can also be set through the
/// environment variable named in its help.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address to accept agency connections on. Use port 0 for an
    /// ephemeral port.
    #[arg(long, env = "SERVER_LISTEN", default_value = "0.0.0.0:12345")]
    pub listen: SocketAddr,

    /// Maximum number of pending connections in the accept queue.
    #[arg(long, env = "SERVER_LISTEN_BACKLOG", default_value_t = 5)]
    pub backlog: u32,

    /// Number of agencies that must report ALL_SENT before the draw.
    #[arg(
        long,
        env = "AGENCIES",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub agencies: u32,

    /// File the accepted bets are appended to.
    #[arg(long, env = "BETS_FILE", default_value = "bets.csv")]
    pub bets_file: PathBuf,

    /// Number that wins the draw.
    #[arg(long, env = "LOTTERY_WINNER_NUMBER", default_value_t = DEFAULT_WINNING_NUMBER)]
    pub winning_number: u32,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, env = "LOGGING_LEVEL", default_value = "info")]
    pub log_level: String,
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::stream::serve::{DEFAULT_MAX_SESSIONS, DEFAULT_PORT};

pub const DEFAULT_SERVER: &str = "127.0.0.1:9000";
pub const DEFAULT_FILE: &str = "test.dat";
/// Corruption probability used by `--simulate-corruption`.
pub const SIMULATED_CORRUPTION_RATE: f64 = 0.01;

#[derive(Parser)]
#[command(name = "udpfile")]
#[command(about = "Reliable file transfer over UDP", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve files from a directory
    Serve(ServeArgs),
    /// Download a file from a server
    Get(GetArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Local address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Directory requested file names are resolved against
    #[arg(short, long, default_value = ".")]
    pub root: PathBuf,

    /// Number of transfers served at once [capped to 64]
    #[arg(short, long, default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,
}

#[derive(Args)]
pub struct GetArgs {
    /// Name of the file to request
    #[arg(name = "FILE", default_value = DEFAULT_FILE)]
    pub file: String,

    /// Server address (host:port)
    #[arg(short, long, default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Output path [default: recreated_<FILE>]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Corrupt about 1% of incoming chunks to exercise retransmission
    #[arg(long)]
    pub simulate_corruption: bool,

    /// Explicit corruption probability in [0, 1]; overrides --simulate-corruption
    #[arg(long, value_parser = parse_rate)]
    pub corruption_rate: Option<f64>,
}

impl GetArgs {
    /// Effective probability of corrupting a received chunk.
    pub fn corruption_rate(&self) -> f64 {
        match (self.corruption_rate, self.simulate_corruption) {
            (Some(rate), _) => rate,
            (None, true) => SIMULATED_CORRUPTION_RATE,
            (None, false) => 0.0,
        }
    }
}

fn parse_rate(value: &str) -> Result<f64, String> {
    let rate: f64 = value
        .parse()
        .map_err(|_| format!("{value} is not a number"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{rate} is outside [0, 1]"))
    }
}

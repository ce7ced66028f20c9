use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

#[derive(Parser, Debug)]
#[clap(name = "swarmsim")]
#[command(author, version, about = "Download a generated file from a simulated swarm", long_about = None)]
pub(crate) struct Args {
    /// Size of the simulated file in bytes.
    #[clap(short, long, default_value_t = 4 * 1024 * 1024)]
    pub size: u64,

    /// Concurrent downloads.
    #[clap(short, long, default_value_t = 4)]
    pub workers: usize,

    /// Peers sending the right bytes.
    #[clap(long, default_value_t = 6)]
    pub honest: usize,

    /// Peers sending corrupt bytes.
    #[clap(long, default_value_t = 1)]
    pub liars: usize,

    /// Peers that are often busy.
    #[clap(long, default_value_t = 1)]
    pub busy: usize,

    /// Peers having only the first half of the file.
    #[clap(long, default_value_t = 1)]
    pub partial: usize,

    /// Peers that do not have the file at all.
    #[clap(long, default_value_t = 1)]
    pub empty: usize,

    /// Probe peers over UDP before downloading from them.
    #[clap(short, long)]
    pub probe: bool,

    /// Seed of the generated content and of the peers' behavior.
    #[clap(long)]
    pub seed: Option<u64>,

    /// Configuration file, the user configuration when missing.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    #[clap(short, long, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Also write debug logs to `swarmsim.log` in this directory.
    #[clap(long)]
    pub log_dir: Option<PathBuf>,
}

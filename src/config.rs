use std::str::FromStr;

use clap::Parser;

use crate::error::AppError;
use crate::stats::{SortMode, SortOrder};

const DEFAULT_PORT: u16 = 11211;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CliArgs {
    /// Network interface to capture on.
    #[clap(long, value_parser)]
    interface: String,

    /// TCP port carrying memcache traffic.
    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Requests/sec below which an entry is reaped; 0 disables reaping.
    #[clap(long, default_value = "0.0")]
    discard_threshold: f64,

    /// Seconds between leaderboard refreshes.
    #[clap(long, default_value = "1")]
    refresh_interval: u64,

    /// Initial leaderboard sort mode: calls|size|reqrate|bw.
    #[clap(long, default_value = "calls")]
    sort_mode: String,

    /// Initial leaderboard sort order: asc|desc.
    #[clap(long, default_value = "desc")]
    sort_order: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub interface: String,
    pub port: u16,
    pub discard_threshold: f64,
    pub refresh_interval: u64,
    pub sort_mode: SortMode,
    pub sort_order: SortOrder,
}

impl Config {
    pub fn from_args() -> Result<Self, AppError> {
        let cli_args = CliArgs::try_parse()
            .map_err(|e| AppError::Config(e.to_string()))?;
        Self::from_cli_args(cli_args)
    }

    fn from_cli_args(cli_args: CliArgs) -> Result<Self, AppError> {
        if cli_args.interface.trim().is_empty() {
            return Err(AppError::Config(
                "--interface must not be empty".to_string(),
            ));
        }

        let sort_mode = SortMode::from_str(&cli_args.sort_mode)
            .map_err(AppError::Config)?;
        let sort_order = SortOrder::from_str(&cli_args.sort_order)
            .map_err(AppError::Config)?;

        Ok(Config {
            interface: cli_args.interface,
            port: cli_args.port,
            discard_threshold: cli_args.discard_threshold,
            refresh_interval: cli_args.refresh_interval,
            sort_mode,
            sort_order,
        })
    }
}

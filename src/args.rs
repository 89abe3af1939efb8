use clap::Parser;
use std::path::PathBuf;

/// Personal site server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path of the config file. If omitted, we'll use edev.toml in the current
    /// working directory when there is one, and defaults plus environment
    /// variables otherwise.
    #[arg(long, env = "EDEV_CONFIG")]
    pub config: Option<PathBuf>,
}

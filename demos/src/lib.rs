//! Command line and config handling shared by the demos.
use anyhow::Result;
use clap::Parser;
use domino::MessengerConfig;

#[derive(Parser, Debug)]
#[command(about = "Domino messaging demo")]
pub struct Cli {
    /// Path to the config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<String>,
}

/// Read the config file given on the command line, or use the defaults if there is none.
pub fn load_config(cli: &Cli) -> Result<MessengerConfig> {
    match &cli.config {
        Some(path) => domino::config::parse_config(path),
        None => Ok(MessengerConfig::default()),
    }
}

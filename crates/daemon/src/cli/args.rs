pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vouch")]
#[command(about = "Watch a directory, share what lands in it, and vouch for what peers share")]
pub struct Args {
    /// Path to the vouch state directory (defaults to ~/.vouch)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// scenerun - run Plays as ordered scenes of parallel frames
#[derive(Parser, Debug)]
#[command(name = "scenerun")]
#[command(about = "Drives Plays through their phases until they finish")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Wait on every frame from a background thread per Play instead of
    /// submitting and requeueing.
    #[arg(long, global = true)]
    pub blocking: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a Play to a terminal phase on this host
    Run {
        /// Path to the Play manifest (JSON)
        play: PathBuf,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Check a Play manifest without running it
    Validate {
        /// Path to the Play manifest (JSON)
        play: PathBuf,
    },
    /// Print the backend job name of a frame
    JobName {
        /// Play name
        play: String,
        /// Frame id
        frame: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

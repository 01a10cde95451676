use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "reelforge",
    version,
    about = "Resumable batch runner for scrape, image and video generation"
)]
pub struct Args {
    /// Override the number of jobs executing at once
    #[arg(short, long, env = "CONCURRENCY")]
    pub concurrency: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process every eligible record (default)
    Run,

    /// Print job counts by status
    Stats,

    /// Delete finished jobs older than the retention period
    Cleanup {
        /// Retention in days, defaults to RETENTION_DAYS
        #[arg(long)]
        days: Option<u32>,
    },

    /// Return abandoned processing jobs to pending
    Recover {
        /// Age in seconds after which a processing job is abandoned
        #[arg(long)]
        stale_secs: Option<u64>,
    },

    /// Inspect or reset API key rotation
    Rotation {
        #[command(subcommand)]
        action: RotationAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum RotationAction {
    /// Show the current key and request count per provider
    Stats,

    /// Rewind a provider, or every provider, to its first key
    Reset {
        /// Rotation key such as fal:image; omit to reset all
        provider: Option<String>,
    },
}

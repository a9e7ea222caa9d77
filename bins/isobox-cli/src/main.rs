mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "isobox")]
#[command(about = "isobox CLI - run jobs locally, talk to the queue, manage boxes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a job file on this host and print the result (needs root)
    Run {
        /// Path to a job request JSON file
        job: PathBuf,

        /// Pretty-print the result
        #[arg(short, long)]
        pretty: bool,
    },

    /// Push a job file onto the queue
    Submit {
        /// Path to a job request JSON file
        job: PathBuf,
    },

    /// Fetch a job result from the queue
    Result {
        job_id: String,

        /// Poll until the job reaches a terminal state
        #[arg(short, long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Request cancellation of a queued or running job
    Cancel { job_id: String },

    /// List registered runtimes
    Runtimes {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Force teardown of boxes left behind by a crashed worker
    Cleanup {
        /// Box ids to tear down
        box_ids: Vec<String>,

        /// Tear down every box found on disk or in the cgroup tree
        #[arg(long, conflicts_with = "box_ids")]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { job, pretty } => commands::run_local(&job, pretty).await?,
        Commands::Submit { job } => commands::submit(&job).await?,
        Commands::Result { job_id, wait, timeout } => commands::fetch_result(&job_id, wait, timeout).await?,
        Commands::Cancel { job_id } => commands::cancel(&job_id).await?,
        Commands::Runtimes { json } => commands::list_runtimes(json)?,
        Commands::Cleanup { box_ids, all } => commands::cleanup(&box_ids, all).await?,
    }

    Ok(())
}

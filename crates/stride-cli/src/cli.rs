use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "stride")]
#[command(about = "Record workouts and keep them in sync with a companion device")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a new workout
    #[command(alias = "new")]
    Add {
        /// Workout name
        name: String,
        /// Exercise as NAME or NAME:SECONDS (repeatable)
        #[arg(short, long, value_name = "NAME[:SECONDS]")]
        exercise: Vec<String>,
    },
    /// List recent workouts
    List {
        /// Number of workouts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show sync bookkeeping for the local store
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Preview changes waiting for the companion without consuming them
    Changes {
        /// Output the wire message as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage exercise goals
    Goals {
        #[command(subcommand)]
        command: GoalsCommand,
    },
    /// Send pending changes into a second store over a loopback link
    Mirror {
        /// Path to the companion database file
        #[arg(long, value_name = "PATH")]
        peer: PathBuf,
        /// Re-send every subgraph instead of only captured changes
        #[arg(long)]
        full: bool,
    },
}

#[derive(Subcommand)]
pub enum GoalsCommand {
    /// Set the target seconds for an exercise
    Set {
        /// Exercise name
        name: String,
        /// Target duration in seconds
        seconds: u32,
    },
    /// List all goals
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

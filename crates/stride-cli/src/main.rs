//! Stride CLI - inspect a local store, record workouts, mirror to a companion store

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::{CommandFactory, Parser};

use crate::cli::{Cli, Commands, GoalsCommand};
use crate::commands::add::run_add;
use crate::commands::changes::run_changes;
use crate::commands::common::{load_settings, resolve_db_path};
use crate::commands::goals::{run_goals_list, run_goals_set};
use crate::commands::list::run_list;
use crate::commands::mirror::run_mirror;
use crate::commands::status::run_status;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let directive = "stride=info"
        .parse::<tracing_subscriber::filter::Directive>()
        .map_err(|error| CliError::Logging(error.to_string()))?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path)?;
    let settings = load_settings()?;

    match cli.command {
        Some(Commands::Add { name, exercise }) => run_add(&name, &exercise, &db_path).await?,
        Some(Commands::List { limit, json }) => run_list(limit, json, &db_path).await?,
        Some(Commands::Status { json }) => run_status(json, &db_path).await?,
        Some(Commands::Changes { json }) => run_changes(json, &db_path, &settings).await?,
        Some(Commands::Goals { command }) => match command {
            GoalsCommand::Set { name, seconds } => {
                run_goals_set(&name, seconds, &db_path).await?;
            }
            GoalsCommand::List { json } => run_goals_list(json, &db_path).await?,
        },
        Some(Commands::Mirror { peer, full }) => {
            run_mirror(&db_path, &peer, full, &settings).await?;
        }
        None => {
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}

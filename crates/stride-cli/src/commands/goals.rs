use std::path::Path;
use std::sync::Arc;

use stride_core::db::{on_store, SqliteStore, SyncStore};
use stride_core::models::GoalMap;
use stride_core::sync::set_local_goal;

use crate::commands::common::{normalize_name, open_store};
use crate::error::CliError;

pub async fn set_goal(
    store: &Arc<SqliteStore>,
    name: &str,
    seconds: u32,
) -> Result<GoalMap, CliError> {
    let name = normalize_name(name)?;
    Ok(set_local_goal(store, &name, seconds).await?)
}

pub async fn run_goals_set(name: &str, seconds: u32, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let goals = set_goal(&store, name, seconds).await?;
    println!("{} goal(s) stored", goals.len());
    Ok(())
}

pub async fn run_goals_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let goals = on_store(&store, |store| store.load_goals()).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&goals)?);
    } else if goals.is_empty() {
        println!("No goals set.");
    } else {
        for (name, seconds) in &goals {
            println!("{name:<30}  {seconds}s");
        }
    }
    Ok(())
}

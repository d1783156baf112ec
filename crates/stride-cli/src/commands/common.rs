use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use stride_core::db::SqliteStore;
use stride_core::models::Workout;
use stride_core::SyncSettings;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct WorkoutListItem {
    pub id: String,
    pub name: String,
    pub exercises: usize,
    pub is_completed: bool,
    pub duration_ms: i64,
    pub version: i64,
    pub sync_status: String,
    pub updated_at: i64,
    pub relative_time: String,
}

pub fn workout_to_list_item(workout: &Workout, exercises: usize) -> WorkoutListItem {
    let now_ms = Utc::now().timestamp_millis();
    WorkoutListItem {
        id: workout.id.to_string(),
        name: workout.name.clone(),
        exercises,
        is_completed: workout.is_completed,
        duration_ms: workout.duration_ms,
        version: workout.sync.version,
        sync_status: workout.sync.sync_status.to_string(),
        updated_at: workout.updated_at,
        relative_time: format_relative_time(workout.updated_at, now_ms),
    }
}

pub fn format_workout_lines(items: &[WorkoutListItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let short_id = item.id.chars().take(13).collect::<String>();
            let name = truncate(&item.name, 30);
            let done = if item.is_completed { "done" } else { "open" };
            format!(
                "{short_id:<13}  {name:<30}  {:>2} ex  {done:<4}  v{:<3} {:<8}  {}",
                item.exercises, item.version, item.sync_status, item.relative_time
            )
        })
        .collect()
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let mut truncated = collapsed
            .chars()
            .take(max_chars.saturating_sub(3))
            .collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

pub fn normalize_name(name: &str) -> Result<String, CliError> {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        Err(CliError::EmptyName)
    } else {
        Ok(collapsed)
    }
}

/// Parse `NAME` or `NAME:SECONDS`.
pub fn parse_exercise_arg(arg: &str) -> Result<(String, Option<i64>), CliError> {
    let invalid = || CliError::InvalidExercise(arg.to_string());
    let (name, seconds) = match arg.rsplit_once(':') {
        Some((name, seconds)) => {
            let seconds = seconds.trim().parse::<u32>().map_err(|_| invalid())?;
            (name, Some(i64::from(seconds)))
        }
        None => (arg, None),
    };
    let name = normalize_name(name).map_err(|_| invalid())?;
    Ok((name, seconds))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("STRIDE_DB_PATH").map(PathBuf::from)) {
        return Ok(path);
    }
    default_db_path().ok_or(CliError::NoDataDir)
}

pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("stride").join("stride.db"))
}

pub fn load_settings() -> Result<SyncSettings, CliError> {
    Ok(SyncSettings::from_env()?)
}

pub fn open_store(path: &Path) -> Result<Arc<SqliteStore>, CliError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    tracing::debug!(path = %path.display(), "opening store");
    Ok(Arc::new(SqliteStore::open(path)?))
}

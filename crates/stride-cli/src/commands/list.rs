use std::path::Path;

use stride_core::db::{on_store, SqliteWorkoutRepository, WorkoutRepository};

use crate::commands::common::{
    format_workout_lines, open_store, workout_to_list_item, WorkoutListItem,
};
use crate::error::CliError;

pub async fn run_list(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let items = on_store(&store, move |store| {
        store.local(|conn| {
            let repo = SqliteWorkoutRepository::new(conn);
            repo.list(limit, 0)?
                .iter()
                .map(|workout| {
                    let exercises = repo.exercises(&workout.id)?.len();
                    Ok(workout_to_list_item(workout, exercises))
                })
                .collect::<stride_core::Result<Vec<WorkoutListItem>>>()
        })
    })
    .await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if items.is_empty() {
        println!("No workouts recorded.");
    } else {
        for line in format_workout_lines(&items) {
            println!("{line}");
        }
    }

    Ok(())
}

use std::path::Path;

use stride_core::db::{on_store, SqliteWorkoutRepository, WorkoutRepository};

use crate::commands::common::{normalize_name, open_store, parse_exercise_arg};
use crate::error::CliError;

pub async fn run_add(name: &str, exercises: &[String], db_path: &Path) -> Result<(), CliError> {
    let name = normalize_name(name)?;
    let exercises = exercises
        .iter()
        .map(|arg| parse_exercise_arg(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let store = open_store(db_path)?;
    let (workout, _) = on_store(&store, move |store| {
        let exercises = exercises
            .iter()
            .map(|(exercise, seconds)| (exercise.as_str(), *seconds))
            .collect::<Vec<_>>();
        store.local(|conn| {
            SqliteWorkoutRepository::new(conn).create_with_exercises(&name, &exercises)
        })
    })
    .await?;

    println!("{}", workout.id);
    Ok(())
}

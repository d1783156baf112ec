use std::path::PathBuf;
use std::sync::Arc;

use stride_core::db::{SqliteStore, SqliteWorkoutRepository, SyncStore, WorkoutRepository};
use stride_core::models::{ChangeType, EntityKind};
use stride_core::SyncSettings;
use tempfile::TempDir;

use crate::commands::add::run_add;
use crate::commands::changes::preview_changes;
use crate::commands::common::{
    format_relative_time, normalize_name, parse_exercise_arg, resolve_db_path, truncate,
};
use crate::commands::goals::set_goal;
use crate::commands::mirror::mirror_once;
use crate::commands::status::collect_status;
use crate::error::CliError;

fn db_in(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[test]
fn parse_exercise_arg_accepts_name_and_seconds() {
    assert_eq!(
        parse_exercise_arg("Plank:90").unwrap(),
        ("Plank".to_string(), Some(90))
    );
    assert_eq!(
        parse_exercise_arg("  Wall   sit ").unwrap(),
        ("Wall sit".to_string(), None)
    );
}

#[test]
fn parse_exercise_arg_rejects_bad_input() {
    assert!(matches!(
        parse_exercise_arg("Plank:soon"),
        Err(CliError::InvalidExercise(_))
    ));
    assert!(matches!(
        parse_exercise_arg(":30"),
        Err(CliError::InvalidExercise(_))
    ));
    assert!(matches!(
        parse_exercise_arg("Plank:-5"),
        Err(CliError::InvalidExercise(_))
    ));
}

#[test]
fn normalize_name_collapses_whitespace() {
    assert_eq!(normalize_name("  Leg   day ").unwrap(), "Leg day");
    assert!(matches!(normalize_name(" \t "), Err(CliError::EmptyName)));
}

#[test]
fn truncate_adds_ellipsis() {
    assert_eq!(truncate("short", 10), "short");
    assert_eq!(truncate("a rather long workout name", 10), "a rathe...");
}

#[test]
fn format_relative_time_buckets() {
    let now = 10 * 24 * 60 * 60 * 1000;
    assert_eq!(format_relative_time(now - 5_000, now), "just now");
    assert_eq!(format_relative_time(now - 5 * 60_000, now), "5m ago");
    assert_eq!(format_relative_time(now - 3 * 60 * 60_000, now), "3h ago");
    assert_eq!(format_relative_time(0, now), "1w ago");
}

#[test]
fn resolve_db_path_prefers_explicit_path() {
    let explicit = PathBuf::from("/tmp/explicit.db");
    assert_eq!(resolve_db_path(Some(explicit.clone())).unwrap(), explicit);
}

#[tokio::test(flavor = "multi_thread")]
async fn add_records_workout_with_exercises() {
    let dir = TempDir::new().unwrap();
    let path = db_in(&dir, "nested/stride.db");

    run_add(
        "Intervals",
        &["Sprint:30".to_string(), "Jog".to_string()],
        &path,
    )
    .await
    .unwrap();

    let store = SqliteStore::open(&path).unwrap();
    let (workouts, exercises) = store
        .local(|conn| {
            let repo = SqliteWorkoutRepository::new(conn);
            let workouts = repo.list(10, 0)?;
            let exercises = repo.exercises(&workouts[0].id)?;
            Ok((workouts, exercises))
        })
        .unwrap();
    assert_eq!(workouts.len(), 1);
    assert_eq!(workouts[0].name, "Intervals");
    assert_eq!(exercises.len(), 2);
    assert_eq!(exercises[0].target_seconds, Some(30));

    let status = collect_status(&store).unwrap();
    assert_eq!(status.roots, 1);
    assert_eq!(status.pending, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn changes_preview_does_not_consume() {
    let dir = TempDir::new().unwrap();
    let path = db_in(&dir, "stride.db");
    run_add("Rowing", &[], &path).await.unwrap();
    let settings = SyncSettings::default();

    let first = preview_changes(&path, &settings).await.unwrap();
    let second = preview_changes(&path, &settings).await.unwrap();

    assert_eq!(first.records.len(), 1);
    assert_eq!(first.records[0].entity, EntityKind::Workout);
    assert_eq!(first.records[0].change_type, ChangeType::Insert);
    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread")]
async fn goals_set_merges_into_existing_map() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(db_in(&dir, "stride.db")).unwrap());

    set_goal(&store, "Plank", 60).await.unwrap();
    let goals = set_goal(&store, "Plank", 90).await.unwrap();
    let goals_after = set_goal(&store, "Squat   hold", 45).await.unwrap();

    assert_eq!(goals.get("Plank"), Some(&90));
    assert_eq!(goals_after.len(), 2);
    assert_eq!(goals_after.get("Squat hold"), Some(&45));
    assert_eq!(store.load_goals().unwrap(), goals_after);
    assert!(matches!(
        set_goal(&store, "  ", 10).await,
        Err(CliError::EmptyName)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn mirror_copies_then_sends_nothing_new() {
    let dir = TempDir::new().unwrap();
    let local = db_in(&dir, "phone.db");
    let peer = db_in(&dir, "watch.db");
    let settings = SyncSettings::default();
    run_add("Hills", &["Climb:120".to_string()], &local)
        .await
        .unwrap();
    run_add("Flats", &[], &local).await.unwrap();

    let first = mirror_once(&local, &peer, false, &settings).await.unwrap();
    assert_eq!(first.report.direct, 2);
    assert!(!first.report.held);
    assert_eq!(first.peer_workouts, 2);

    let second = mirror_once(&local, &peer, false, &settings).await.unwrap();
    assert_eq!(second.report.captured, 0);
    assert_eq!(second.report.sent(), 0);

    let full = mirror_once(&local, &peer, true, &settings).await.unwrap();
    assert_eq!(full.report.direct, 2);
    assert_eq!(full.peer_workouts, 2);

    let peer_store = SqliteStore::open(&peer).unwrap();
    let ids = peer_store
        .read(|tx| tx.root_ids(EntityKind::Workout))
        .unwrap();
    let children = peer_store
        .read(|tx| {
            ids.iter()
                .map(|id| tx.children(EntityKind::Workout, *id).map(|c| c.len()))
                .sum::<stride_core::Result<usize>>()
        })
        .unwrap();
    assert_eq!(children, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn mirror_refuses_same_store() {
    let dir = TempDir::new().unwrap();
    let path = db_in(&dir, "stride.db");
    let result = mirror_once(&path, &path, false, &SyncSettings::default()).await;
    assert!(matches!(result, Err(CliError::SamePeer)));
}

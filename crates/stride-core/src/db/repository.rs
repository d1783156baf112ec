//! Workout and template repositories for local (user-authored) writes

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use crate::error::{Error, Result};
use crate::models::{Exercise, ExerciseTemplate, RecordId, Workout, WorkoutTemplate};
use crate::util::now_millis;
use rusqlite::{params, Connection, OptionalExtension};

const WORKOUT_SELECT: &str = "SELECT id, name, started_at, ended_at, duration_ms, distance_m,
        is_completed, created_at, updated_at, version, sync_status, last_synced_at
     FROM workouts";

const EXERCISE_SELECT: &str = "SELECT id, workout_id, name, order_index, duration_ms, distance_m,
        repetitions, target_seconds, is_completed, created_at, updated_at,
        version, sync_status, last_synced_at
     FROM exercises";

const TEMPLATE_SELECT: &str = "SELECT id, name, notes, created_at, updated_at,
        version, sync_status, last_synced_at
     FROM workout_templates";

const EXERCISE_TEMPLATE_SELECT: &str = "SELECT id, workout_template_id, name, order_index,
        duration_ms, distance_m, repetitions, created_at, updated_at,
        version, sync_status, last_synced_at
     FROM exercise_templates";

/// Changes to a recorded exercise
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExerciseUpdate {
    pub duration_ms: Option<i64>,
    pub distance_m: Option<f64>,
    pub repetitions: Option<i64>,
    pub is_completed: Option<bool>,
}

/// Trait for workout storage operations
///
/// Every write leaves the touched workout `pending` for the next cloud push.
pub trait WorkoutRepository {
    /// Create a new workout
    fn create(&self, name: &str) -> Result<Workout>;

    /// Create a workout together with its exercises, in order.
    ///
    /// The parent is not touched per child, so history holds inserts only.
    fn create_with_exercises(
        &self,
        name: &str,
        exercises: &[(&str, Option<i64>)],
    ) -> Result<(Workout, Vec<Exercise>)>;

    /// Append an exercise to a workout
    fn add_exercise(
        &self,
        workout_id: &RecordId,
        name: &str,
        target_seconds: Option<i64>,
    ) -> Result<Exercise>;

    /// Get a workout by ID
    fn get(&self, id: &RecordId) -> Result<Option<Workout>>;

    /// List workouts, newest first
    fn list(&self, limit: usize, offset: usize) -> Result<Vec<Workout>>;

    /// Exercises of a workout in order
    fn exercises(&self, workout_id: &RecordId) -> Result<Vec<Exercise>>;

    /// Rename a workout
    fn rename(&self, id: &RecordId, name: &str) -> Result<Workout>;

    /// Mark a session as started now
    fn start(&self, id: &RecordId) -> Result<Workout>;

    /// Update an exercise's measurements
    fn update_exercise(&self, id: &RecordId, update: &ExerciseUpdate) -> Result<Exercise>;

    /// Record the final duration/distance and mark the workout completed
    fn complete(
        &self,
        id: &RecordId,
        ended_at: i64,
        duration_ms: i64,
        distance_m: f64,
    ) -> Result<Workout>;

    /// Delete a workout and its exercises
    fn delete(&self, id: &RecordId) -> Result<()>;
}

/// `SQLite` implementation of `WorkoutRepository`
pub struct SqliteWorkoutRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteWorkoutRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a workout from a database row
    fn parse_workout(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workout> {
        let id: String = row.get(0)?;
        let status: String = row.get(10)?;
        Ok(Workout {
            id: id.parse().unwrap_or_default(),
            name: row.get(1)?,
            started_at: row.get(2)?,
            ended_at: row.get(3)?,
            duration_ms: row.get(4)?,
            distance_m: row.get(5)?,
            is_completed: row.get::<_, i32>(6)? != 0,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            sync: crate::models::SyncMeta {
                version: row.get(9)?,
                sync_status: status.parse().unwrap_or_default(),
                last_synced_at: row.get(11)?,
            },
        })
    }

    /// Parse an exercise from a database row
    fn parse_exercise(row: &rusqlite::Row<'_>) -> rusqlite::Result<Exercise> {
        let id: String = row.get(0)?;
        let workout_id: Option<String> = row.get(1)?;
        let status: String = row.get(12)?;
        Ok(Exercise {
            id: id.parse().unwrap_or_default(),
            workout_id: workout_id.and_then(|value| value.parse().ok()),
            name: row.get(2)?,
            order_index: row.get(3)?,
            duration_ms: row.get(4)?,
            distance_m: row.get(5)?,
            repetitions: row.get(6)?,
            target_seconds: row.get(7)?,
            is_completed: row.get::<_, i32>(8)? != 0,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            sync: crate::models::SyncMeta {
                version: row.get(11)?,
                sync_status: status.parse().unwrap_or_default(),
                last_synced_at: row.get(13)?,
            },
        })
    }

    fn get_exercise(&self, id: &RecordId) -> Result<Option<Exercise>> {
        Ok(self
            .conn
            .query_row(
                &format!("{EXERCISE_SELECT} WHERE id = ?"),
                params![id.as_str()],
                Self::parse_exercise,
            )
            .optional()?)
    }

    /// Flag a workout for the next cloud push
    fn touch(&self, id: &RecordId, now: i64) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE workouts SET updated_at = ?, sync_status = 'pending' WHERE id = ?",
            params![now, id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn require(&self, id: &RecordId) -> Result<Workout> {
        self.get(id)?.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Insert an exercise at the end of a workout's order
    fn insert_exercise(
        &self,
        workout_id: &RecordId,
        name: &str,
        target_seconds: Option<i64>,
    ) -> Result<Exercise> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("Exercise name cannot be empty".into()));
        }

        let next_index: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(order_index) + 1, 0) FROM exercises WHERE workout_id = ?",
            params![workout_id.as_str()],
            |row| row.get(0),
        )?;

        let mut exercise = Exercise::new(*workout_id, name, next_index);
        exercise.target_seconds = target_seconds;

        self.conn.execute(
            "INSERT INTO exercises (id, workout_id, name, order_index, target_seconds, created_at, updated_at, sync_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending')",
            params![
                exercise.id.as_str(),
                workout_id.as_str(),
                exercise.name,
                exercise.order_index,
                exercise.target_seconds,
                exercise.created_at,
                exercise.updated_at
            ],
        )?;

        Ok(exercise)
    }
}

impl WorkoutRepository for SqliteWorkoutRepository<'_> {
    fn create(&self, name: &str) -> Result<Workout> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("Workout name cannot be empty".into()));
        }

        let workout = Workout::new(name);
        self.conn.execute(
            "INSERT INTO workouts (id, name, duration_ms, distance_m, is_completed, created_at, updated_at, sync_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending')",
            params![
                workout.id.as_str(),
                workout.name,
                workout.duration_ms,
                workout.distance_m,
                i32::from(workout.is_completed),
                workout.created_at,
                workout.updated_at
            ],
        )?;

        Ok(workout)
    }

    fn create_with_exercises(
        &self,
        name: &str,
        exercises: &[(&str, Option<i64>)],
    ) -> Result<(Workout, Vec<Exercise>)> {
        let workout = self.create(name)?;
        let exercises = exercises
            .iter()
            .map(|(exercise, target_seconds)| {
                self.insert_exercise(&workout.id, exercise, *target_seconds)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((workout, exercises))
    }

    fn add_exercise(
        &self,
        workout_id: &RecordId,
        name: &str,
        target_seconds: Option<i64>,
    ) -> Result<Exercise> {
        self.touch(workout_id, now_millis())?;
        self.insert_exercise(workout_id, name, target_seconds)
    }

    fn get(&self, id: &RecordId) -> Result<Option<Workout>> {
        Ok(self
            .conn
            .query_row(
                &format!("{WORKOUT_SELECT} WHERE id = ?"),
                params![id.as_str()],
                Self::parse_workout,
            )
            .optional()?)
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<Workout>> {
        let mut stmt = self.conn.prepare(&format!(
            "{WORKOUT_SELECT} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        ))?;

        let workouts = stmt
            .query_map(params![limit as i64, offset as i64], Self::parse_workout)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(workouts)
    }

    fn exercises(&self, workout_id: &RecordId) -> Result<Vec<Exercise>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EXERCISE_SELECT} WHERE workout_id = ? ORDER BY order_index, rowid"
        ))?;

        let exercises = stmt
            .query_map(params![workout_id.as_str()], Self::parse_exercise)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(exercises)
    }

    fn rename(&self, id: &RecordId, name: &str) -> Result<Workout> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("Workout name cannot be empty".into()));
        }

        self.conn.execute(
            "UPDATE workouts SET name = ? WHERE id = ?",
            params![name, id.as_str()],
        )?;
        self.touch(id, now_millis())?;
        self.require(id)
    }

    fn start(&self, id: &RecordId) -> Result<Workout> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "UPDATE workouts SET started_at = COALESCE(started_at, ?) WHERE id = ?",
            params![now, id.as_str()],
        )?;
        self.touch(id, now)?;
        self.require(id)
    }

    fn update_exercise(&self, id: &RecordId, update: &ExerciseUpdate) -> Result<Exercise> {
        let now = chrono::Utc::now().timestamp_millis();
        let existing = self
            .get_exercise(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        self.conn.execute(
            "UPDATE exercises SET
                duration_ms = COALESCE(?, duration_ms),
                distance_m = COALESCE(?, distance_m),
                repetitions = COALESCE(?, repetitions),
                is_completed = COALESCE(?, is_completed),
                updated_at = ?,
                sync_status = 'pending'
             WHERE id = ?",
            params![
                update.duration_ms,
                update.distance_m,
                update.repetitions,
                update.is_completed.map(i32::from),
                now,
                id.as_str()
            ],
        )?;

        if let Some(workout_id) = existing.workout_id {
            self.touch(&workout_id, now)?;
        }

        self.get_exercise(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn complete(
        &self,
        id: &RecordId,
        ended_at: i64,
        duration_ms: i64,
        distance_m: f64,
    ) -> Result<Workout> {
        self.conn.execute(
            "UPDATE workouts SET ended_at = ?, duration_ms = ?, distance_m = ?, is_completed = 1
             WHERE id = ?",
            params![ended_at, duration_ms, distance_m, id.as_str()],
        )?;
        self.touch(id, ended_at)?;
        self.require(id)
    }

    fn delete(&self, id: &RecordId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM exercises WHERE workout_id = ?",
            params![id.as_str()],
        )?;
        let rows = self
            .conn
            .execute("DELETE FROM workouts WHERE id = ?", params![id.as_str()])?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }

        Ok(())
    }
}

/// Trait for workout template storage operations
pub trait TemplateRepository {
    /// Create a new template
    fn create(&self, name: &str, notes: Option<&str>) -> Result<WorkoutTemplate>;

    /// Append a planned exercise to a template
    fn add_exercise(
        &self,
        template_id: &RecordId,
        name: &str,
        duration_ms: i64,
        repetitions: i64,
    ) -> Result<ExerciseTemplate>;

    /// List templates by name
    fn list(&self) -> Result<Vec<WorkoutTemplate>>;

    /// Planned exercises of a template in order
    fn exercises(&self, template_id: &RecordId) -> Result<Vec<ExerciseTemplate>>;

    /// Delete a template and its planned exercises
    fn delete(&self, id: &RecordId) -> Result<()>;
}

/// `SQLite` implementation of `TemplateRepository`
pub struct SqliteTemplateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteTemplateRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkoutTemplate> {
        let id: String = row.get(0)?;
        let status: String = row.get(6)?;
        Ok(WorkoutTemplate {
            id: id.parse().unwrap_or_default(),
            name: row.get(1)?,
            notes: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            sync: crate::models::SyncMeta {
                version: row.get(5)?,
                sync_status: status.parse().unwrap_or_default(),
                last_synced_at: row.get(7)?,
            },
        })
    }

    fn parse_exercise_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExerciseTemplate> {
        let id: String = row.get(0)?;
        let template_id: Option<String> = row.get(1)?;
        let status: String = row.get(10)?;
        Ok(ExerciseTemplate {
            id: id.parse().unwrap_or_default(),
            workout_template_id: template_id.and_then(|value| value.parse().ok()),
            name: row.get(2)?,
            order_index: row.get(3)?,
            duration_ms: row.get(4)?,
            distance_m: row.get(5)?,
            repetitions: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            sync: crate::models::SyncMeta {
                version: row.get(9)?,
                sync_status: status.parse().unwrap_or_default(),
                last_synced_at: row.get(11)?,
            },
        })
    }
}

impl TemplateRepository for SqliteTemplateRepository<'_> {
    fn create(&self, name: &str, notes: Option<&str>) -> Result<WorkoutTemplate> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("Template name cannot be empty".into()));
        }

        let mut template = WorkoutTemplate::new(name);
        template.notes = notes.map(str::to_string);
        self.conn.execute(
            "INSERT INTO workout_templates (id, name, notes, created_at, updated_at, sync_status)
             VALUES (?, ?, ?, ?, ?, 'pending')",
            params![
                template.id.as_str(),
                template.name,
                template.notes,
                template.created_at,
                template.updated_at
            ],
        )?;

        Ok(template)
    }

    fn add_exercise(
        &self,
        template_id: &RecordId,
        name: &str,
        duration_ms: i64,
        repetitions: i64,
    ) -> Result<ExerciseTemplate> {
        let next_index: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(order_index) + 1, 0) FROM exercise_templates WHERE workout_template_id = ?",
            params![template_id.as_str()],
            |row| row.get(0),
        )?;

        let mut exercise = ExerciseTemplate::new(*template_id, name.trim(), next_index);
        exercise.duration_ms = duration_ms;
        exercise.repetitions = repetitions;

        let rows = self.conn.execute(
            "UPDATE workout_templates SET updated_at = ?, sync_status = 'pending' WHERE id = ?",
            params![exercise.created_at, template_id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(template_id.to_string()));
        }

        self.conn.execute(
            "INSERT INTO exercise_templates (id, workout_template_id, name, order_index, duration_ms, repetitions, created_at, updated_at, sync_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending')",
            params![
                exercise.id.as_str(),
                template_id.as_str(),
                exercise.name,
                exercise.order_index,
                exercise.duration_ms,
                exercise.repetitions,
                exercise.created_at,
                exercise.updated_at
            ],
        )?;

        Ok(exercise)
    }

    fn list(&self) -> Result<Vec<WorkoutTemplate>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{TEMPLATE_SELECT} ORDER BY name COLLATE NOCASE"))?;
        let templates = stmt
            .query_map([], Self::parse_template)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(templates)
    }

    fn exercises(&self, template_id: &RecordId) -> Result<Vec<ExerciseTemplate>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EXERCISE_TEMPLATE_SELECT} WHERE workout_template_id = ? ORDER BY order_index, rowid"
        ))?;
        let exercises = stmt
            .query_map(params![template_id.as_str()], Self::parse_exercise_template)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(exercises)
    }

    fn delete(&self, id: &RecordId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM exercise_templates WHERE workout_template_id = ?",
            params![id.as_str()],
        )?;
        let rows = self.conn.execute(
            "DELETE FROM workout_templates WHERE id = ?",
            params![id.as_str()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }

        Ok(())
    }
}

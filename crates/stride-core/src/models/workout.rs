//! Workout and exercise models

use serde::{Deserialize, Serialize};

use super::entity::{RecordId, SyncMeta};

/// A recorded workout session (a root record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workout {
    pub id: RecordId,
    pub name: String,
    /// Session start (Unix ms)
    #[serde(default)]
    pub started_at: Option<i64>,
    /// Session end (Unix ms)
    #[serde(default)]
    pub ended_at: Option<i64>,
    pub duration_ms: i64,
    pub distance_m: f64,
    pub is_completed: bool,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    #[serde(flatten)]
    pub sync: SyncMeta,
}

impl Workout {
    /// Create a new, not-yet-started workout
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: RecordId::new(),
            name: name.into(),
            started_at: None,
            ended_at: None,
            duration_ms: 0,
            distance_m: 0.0,
            is_completed: false,
            created_at: now,
            updated_at: now,
            sync: SyncMeta::default(),
        }
    }
}

/// One timed/measured exercise inside a workout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub id: RecordId,
    /// Owning workout, by id. `None` while the link is unresolved.
    #[serde(default)]
    pub workout_id: Option<RecordId>,
    pub name: String,
    pub order_index: i64,
    pub duration_ms: i64,
    pub distance_m: f64,
    pub repetitions: i64,
    #[serde(default)]
    pub target_seconds: Option<i64>,
    pub is_completed: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(flatten)]
    pub sync: SyncMeta,
}

impl Exercise {
    /// Create a new exercise owned by `workout_id`
    #[must_use]
    pub fn new(workout_id: RecordId, name: impl Into<String>, order_index: i64) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: RecordId::new(),
            workout_id: Some(workout_id),
            name: name.into(),
            order_index,
            duration_ms: 0,
            distance_m: 0.0,
            repetitions: 0,
            target_seconds: None,
            is_completed: false,
            created_at: now,
            updated_at: now,
            sync: SyncMeta::default(),
        }
    }
}

/// A telemetry sample appended while a session is active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub workout_id: RecordId,
    /// Sample time (Unix ms)
    pub recorded_at: i64,
    /// Elapsed session time at the sample
    pub elapsed_ms: i64,
    pub heart_rate: Option<f64>,
    pub distance_m: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workout_new() {
        let workout = Workout::new("Intervals");
        assert_eq!(workout.name, "Intervals");
        assert!(!workout.is_completed);
        assert_eq!(workout.created_at, workout.updated_at);
        assert_eq!(workout.sync.version, 0);
    }

    #[test]
    fn test_exercise_links_parent() {
        let workout = Workout::new("Intervals");
        let exercise = Exercise::new(workout.id, "Sprint", 0);
        assert_eq!(exercise.workout_id, Some(workout.id));
    }

    #[test]
    fn test_workout_serializes_flat_meta() {
        let workout = Workout::new("Run");
        let value = serde_json::to_value(&workout).unwrap();
        assert_eq!(value["sync_status"], "pending");
        assert_eq!(value["version"], 0);
    }
}

//! Workout template models

use serde::{Deserialize, Serialize};

use super::entity::{RecordId, SyncMeta};

/// A reusable workout plan (a root record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutTemplate {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(flatten)]
    pub sync: SyncMeta,
}

impl WorkoutTemplate {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: RecordId::new(),
            name: name.into(),
            notes: None,
            created_at: now,
            updated_at: now,
            sync: SyncMeta::default(),
        }
    }
}

/// One planned exercise inside a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseTemplate {
    pub id: RecordId,
    #[serde(default)]
    pub workout_template_id: Option<RecordId>,
    pub name: String,
    pub order_index: i64,
    pub duration_ms: i64,
    pub distance_m: f64,
    pub repetitions: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(flatten)]
    pub sync: SyncMeta,
}

impl ExerciseTemplate {
    #[must_use]
    pub fn new(template_id: RecordId, name: impl Into<String>, order_index: i64) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: RecordId::new(),
            workout_template_id: Some(template_id),
            name: name.into(),
            order_index,
            duration_ms: 0,
            distance_m: 0.0,
            repetitions: 0,
            created_at: now,
            updated_at: now,
            sync: SyncMeta::default(),
        }
    }
}

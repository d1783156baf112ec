//! Data models for Stride

mod change;
mod entity;
mod template;
mod workout;

pub use change::{ChangeRecord, ChangeType, Checkpoint, FieldMap, GoalMap};
pub use entity::{
    Column, ColumnType, EntityKind, ParentLink, RecordId, SyncMeta, SyncStatus, META_COLUMNS,
};
pub use template::{ExerciseTemplate, WorkoutTemplate};
pub use workout::{Exercise, TelemetryPoint, Workout};

use crate::error::Result;

/// Any record the sync engine moves between parties.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncableRecord {
    Workout(Workout),
    Exercise(Exercise),
    WorkoutTemplate(WorkoutTemplate),
    ExerciseTemplate(ExerciseTemplate),
}

impl SyncableRecord {
    /// Build a typed record from a full field snapshot (including `id` and sync metadata).
    pub fn from_fields(kind: EntityKind, fields: FieldMap) -> Result<Self> {
        let value = serde_json::Value::Object(fields);
        Ok(match kind {
            EntityKind::Workout => Self::Workout(serde_json::from_value(value)?),
            EntityKind::Exercise => Self::Exercise(serde_json::from_value(value)?),
            EntityKind::WorkoutTemplate => Self::WorkoutTemplate(serde_json::from_value(value)?),
            EntityKind::ExerciseTemplate => Self::ExerciseTemplate(serde_json::from_value(value)?),
        })
    }

    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Workout(_) => EntityKind::Workout,
            Self::Exercise(_) => EntityKind::Exercise,
            Self::WorkoutTemplate(_) => EntityKind::WorkoutTemplate,
            Self::ExerciseTemplate(_) => EntityKind::ExerciseTemplate,
        }
    }

    pub const fn id(&self) -> RecordId {
        match self {
            Self::Workout(record) => record.id,
            Self::Exercise(record) => record.id,
            Self::WorkoutTemplate(record) => record.id,
            Self::ExerciseTemplate(record) => record.id,
        }
    }

    pub const fn sync(&self) -> SyncMeta {
        match self {
            Self::Workout(record) => record.sync,
            Self::Exercise(record) => record.sync,
            Self::WorkoutTemplate(record) => record.sync,
            Self::ExerciseTemplate(record) => record.sync,
        }
    }
}

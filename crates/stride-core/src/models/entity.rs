//! Entity kinds, identifiers, and per-kind column layout

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// A globally unique record identifier, using UUID v7 (time-sortable).
///
/// Shared by every syncable kind. Assigned once at creation, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Storage type of a syncable column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    /// Stored as INTEGER 0/1, surfaced as JSON bool
    Bool,
}

/// A column that may travel inside a field snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

const WORKOUT_COLUMNS: &[Column] = &[
    col("name", ColumnType::Text),
    col("started_at", ColumnType::Integer),
    col("ended_at", ColumnType::Integer),
    col("duration_ms", ColumnType::Integer),
    col("distance_m", ColumnType::Real),
    col("is_completed", ColumnType::Bool),
    col("created_at", ColumnType::Integer),
    col("updated_at", ColumnType::Integer),
];

const EXERCISE_COLUMNS: &[Column] = &[
    col("workout_id", ColumnType::Text),
    col("name", ColumnType::Text),
    col("order_index", ColumnType::Integer),
    col("duration_ms", ColumnType::Integer),
    col("distance_m", ColumnType::Real),
    col("repetitions", ColumnType::Integer),
    col("target_seconds", ColumnType::Integer),
    col("is_completed", ColumnType::Bool),
    col("created_at", ColumnType::Integer),
    col("updated_at", ColumnType::Integer),
];

const WORKOUT_TEMPLATE_COLUMNS: &[Column] = &[
    col("name", ColumnType::Text),
    col("notes", ColumnType::Text),
    col("created_at", ColumnType::Integer),
    col("updated_at", ColumnType::Integer),
];

const EXERCISE_TEMPLATE_COLUMNS: &[Column] = &[
    col("workout_template_id", ColumnType::Text),
    col("name", ColumnType::Text),
    col("order_index", ColumnType::Integer),
    col("duration_ms", ColumnType::Integer),
    col("distance_m", ColumnType::Real),
    col("repetitions", ColumnType::Integer),
    col("created_at", ColumnType::Integer),
    col("updated_at", ColumnType::Integer),
];

/// Sync bookkeeping columns present on every syncable table.
pub const META_COLUMNS: &[Column] = &[
    col("version", ColumnType::Integer),
    col("sync_status", ColumnType::Text),
    col("last_synced_at", ColumnType::Integer),
];

/// The four syncable record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Workout,
    Exercise,
    WorkoutTemplate,
    ExerciseTemplate,
}

/// Ownership relation from a child kind to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    /// Column on the child holding the parent's id
    pub column: &'static str,
    pub parent: EntityKind,
}

impl EntityKind {
    pub const ALL: [Self; 4] = [
        Self::Workout,
        Self::Exercise,
        Self::WorkoutTemplate,
        Self::ExerciseTemplate,
    ];

    /// Wire name used in message envelopes and the change log.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Workout => "Workout",
            Self::Exercise => "Exercise",
            Self::WorkoutTemplate => "WorkoutTemplate",
            Self::ExerciseTemplate => "ExerciseTemplate",
        }
    }

    pub const fn table(self) -> &'static str {
        match self {
            Self::Workout => "workouts",
            Self::Exercise => "exercises",
            Self::WorkoutTemplate => "workout_templates",
            Self::ExerciseTemplate => "exercise_templates",
        }
    }

    /// Columns that may be written from a field snapshot.
    pub const fn columns(self) -> &'static [Column] {
        match self {
            Self::Workout => WORKOUT_COLUMNS,
            Self::Exercise => EXERCISE_COLUMNS,
            Self::WorkoutTemplate => WORKOUT_TEMPLATE_COLUMNS,
            Self::ExerciseTemplate => EXERCISE_TEMPLATE_COLUMNS,
        }
    }

    pub fn column(self, name: &str) -> Option<Column> {
        self.columns().iter().copied().find(|column| column.name == name)
    }

    pub const fn parent(self) -> Option<ParentLink> {
        match self {
            Self::Exercise => Some(ParentLink {
                column: "workout_id",
                parent: Self::Workout,
            }),
            Self::ExerciseTemplate => Some(ParentLink {
                column: "workout_template_id",
                parent: Self::WorkoutTemplate,
            }),
            Self::Workout | Self::WorkoutTemplate => None,
        }
    }

    /// The owned child kind, if this is a root.
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Workout => Some(Self::Exercise),
            Self::WorkoutTemplate => Some(Self::ExerciseTemplate),
            Self::Exercise | Self::ExerciseTemplate => None,
        }
    }

    /// The kind that owns the subgraph this kind belongs to.
    pub const fn root(self) -> Self {
        match self {
            Self::Workout | Self::Exercise => Self::Workout,
            Self::WorkoutTemplate | Self::ExerciseTemplate => Self::WorkoutTemplate,
        }
    }

    pub const fn is_root(self) -> bool {
        matches!(self, Self::Workout | Self::WorkoutTemplate)
    }

    /// Cloud collection holding documents of this root kind.
    pub const fn collection(self) -> &'static str {
        match self.root() {
            Self::WorkoutTemplate => "workoutTemplates",
            _ => "workouts",
        }
    }

    /// Root kind stored in a cloud collection.
    pub fn from_collection(collection: &str) -> Option<Self> {
        match collection {
            "workouts" => Some(Self::Workout),
            "workoutTemplates" => Some(Self::WorkoutTemplate),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::MalformedMessage(format!("unknown entity kind '{s}'")))
    }
}

/// Cloud sync state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Syncing,
    Synced,
    Conflict,
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    /// Eligible for the next cloud push.
    pub const fn needs_push(self) -> bool {
        matches!(self, Self::Pending | Self::Error)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(Error::InvalidInput(format!("unknown sync status '{other}'"))),
        }
    }
}

/// Sync bookkeeping carried by every syncable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Incremented only by a confirmed cloud write
    pub version: i64,
    pub sync_status: SyncStatus,
    /// Unix ms of the last confirmed cloud write
    pub last_synced_at: Option<i64>,
}

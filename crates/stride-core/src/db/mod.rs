//! Database layer for Stride

mod connection;
mod migrations;
mod repository;
mod store;
mod values;

pub use connection::Database;
pub use repository::{
    ExerciseUpdate, SqliteTemplateRepository, SqliteWorkoutRepository, TemplateRepository,
    WorkoutRepository,
};
pub use store::{
    on_store, sync_payload, Author, OrphanLink, SqliteStore, StoreTxn, SyncStore, UpsertOutcome,
    WriteMeta,
};

//! stride-core - Core library for Stride
//!
//! This crate contains the workout models, the local store, and the sync engine
//! that keeps a device, its companion device, and the cloud in step.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sync;
mod util;

pub use config::{ConfigError, GoalsReplaceMode, SyncSettings};
pub use error::{Error, Result};
pub use models::{EntityKind, RecordId};

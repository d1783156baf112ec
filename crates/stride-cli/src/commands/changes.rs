use std::path::Path;

use stride_core::sync::{CaptureBatch, ChangeCaptureLog, Message, PEER_CONSUMER};
use stride_core::SyncSettings;

use crate::commands::common::open_store;
use crate::error::CliError;

/// Capture what the next companion pass would send. The checkpoint is left alone.
pub async fn preview_changes(
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<CaptureBatch, CliError> {
    let store = open_store(db_path)?;
    let log = ChangeCaptureLog::new(store, PEER_CONSUMER, settings);
    Ok(log.capture().await?)
}

pub async fn run_changes(
    as_json: bool,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let batch = preview_changes(db_path, settings).await?;

    if as_json {
        let message = Message::changes(&batch.records);
        println!("{}", serde_json::to_string_pretty(&message)?);
        return Ok(());
    }

    if batch.is_empty() {
        println!("No changes since {}.", batch.since);
        return Ok(());
    }

    println!(
        "{} change(s) since {} (next {})",
        batch.records.len(),
        batch.since,
        batch.next
    );
    for record in &batch.records {
        println!(
            "{:<7} {:<17} {}",
            record.change_type.as_str(),
            record.entity.as_str(),
            record.id
        );
    }
    Ok(())
}

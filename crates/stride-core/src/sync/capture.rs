//! Change capture log
//!
//! Reads the store's change history since a consumer's checkpoint. Capturing
//! never moves the checkpoint; the caller acknowledges a batch once it has taken
//! ownership of it (handed it to the transport).

use std::sync::Arc;

use crate::config::SyncSettings;
use crate::db::{on_store, Author, SyncStore};
use crate::error::Result;
use crate::models::{ChangeRecord, Checkpoint};

/// Authors whose writes are forwarded to the companion device.
///
/// Peer-authored writes are excluded so a merged change never echoes back.
pub const PEER_AUTHORS: &[Author] = &[Author::Local, Author::Cloud];

/// Ordered changes from one capture pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureBatch {
    /// Checkpoint the batch was read from
    pub since: Checkpoint,
    pub records: Vec<ChangeRecord>,
    /// Checkpoint to store once the batch is owned
    pub next: Checkpoint,
}

impl CaptureBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct ChangeCaptureLog<S> {
    store: Arc<S>,
    consumer: String,
    device_name: String,
    limit: usize,
    authors: &'static [Author],
}

impl<S: SyncStore> ChangeCaptureLog<S> {
    pub fn new(store: Arc<S>, consumer: impl Into<String>, settings: &SyncSettings) -> Self {
        Self {
            store,
            consumer: consumer.into(),
            device_name: settings.device_name.clone(),
            limit: settings.capture_limit,
            authors: PEER_AUTHORS,
        }
    }

    /// Capture writes by `authors` instead of the companion-bound default.
    #[must_use]
    pub fn with_authors(mut self, authors: &'static [Author]) -> Self {
        self.authors = authors;
        self
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// The consumer's stored checkpoint.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let consumer = self.consumer.clone();
        on_store(&self.store, move |store| store.load_checkpoint(&consumer)).await
    }

    /// Capture everything after the stored checkpoint.
    pub async fn capture(&self) -> Result<CaptureBatch> {
        let since = self.checkpoint().await?;
        self.capture_since(since).await
    }

    /// Capture everything after `since`, in store-commit order.
    pub async fn capture_since(&self, since: Checkpoint) -> Result<CaptureBatch> {
        let (limit, authors) = (self.limit, self.authors);
        let (records, next) = on_store(&self.store, move |store| {
            store.fetch_since(since, authors, limit)
        })
        .await?;

        let records = records
            .into_iter()
            .map(|record| record.with_origin(self.device_name.clone()))
            .collect::<Vec<_>>();

        tracing::debug!(
            consumer = %self.consumer,
            %since,
            %next,
            count = records.len(),
            "captured changes"
        );

        Ok(CaptureBatch {
            since,
            records,
            next,
        })
    }

    /// Advance the checkpoint past `batch`. Never moves it backwards.
    pub async fn acknowledge(&self, batch: &CaptureBatch) -> Result<Checkpoint> {
        let consumer = self.consumer.clone();
        let next = batch.next;
        on_store(&self.store, move |store| store.save_checkpoint(&consumer, next)).await
    }
}

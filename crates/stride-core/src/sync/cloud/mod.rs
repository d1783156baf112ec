//! Cloud document store and the coordinator that keeps the local store in step
//! with it

mod coordinator;
mod document;
mod memory;

pub use coordinator::{CloudSyncCoordinator, PushReport, RemoteOutcome, CLOUD_CONSUMER};
pub use document::{decode_subgraph, encode_subgraph, RemoteSubgraph};
pub use memory::{CloudClient, InMemoryCloud};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::FieldMap;

/// A cloud document body.
pub type Document = FieldMap;

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub collection: String,
    pub id: String,
    pub document: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotChange {
    Upserted(Document),
    Removed,
}

/// One document change delivered to a listener.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub collection: String,
    pub id: String,
    pub change: SnapshotChange,
    /// Set when the change is this client's own write, not yet confirmed
    pub has_pending_writes: bool,
}

/// Remote document database.
#[async_trait]
pub trait CloudStore: Send + Sync + 'static {
    /// Write one document; with `merge` only the given top-level keys change.
    async fn write(&self, collection: &str, id: &str, document: Document, merge: bool)
        -> Result<()>;

    /// Write several documents atomically: all land or none do.
    async fn batch_write(&self, writes: Vec<DocumentWrite>) -> Result<()>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Subscribe to a collection. Existing documents arrive first.
    async fn listen(&self, collection: &str) -> Result<mpsc::UnboundedReceiver<DocumentSnapshot>>;
}

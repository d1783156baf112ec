//! In-process cloud backend
//!
//! Shared by any number of clients. Each client sees its own writes echoed with
//! `has_pending_writes` set; other clients see them as confirmed remote changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::{CloudStore, Document, DocumentSnapshot, DocumentWrite, SnapshotChange};

struct Listener {
    client: u64,
    collection: String,
    tx: mpsc::UnboundedSender<DocumentSnapshot>,
}

#[derive(Default)]
struct Backend {
    documents: BTreeMap<(String, String), Document>,
    listeners: Vec<Listener>,
    writes: usize,
}

impl Backend {
    fn apply(&mut self, writer: u64, write: DocumentWrite, merge: bool) {
        let key = (write.collection.clone(), write.id.clone());
        let document = match self.documents.remove(&key) {
            Some(mut existing) if merge => {
                existing.extend(write.document);
                existing
            }
            _ => write.document,
        };
        self.documents.insert(key, document.clone());
        self.writes += 1;
        self.notify(
            writer,
            &write.collection,
            &write.id,
            &SnapshotChange::Upserted(document),
        );
    }

    fn notify(&mut self, writer: u64, collection: &str, id: &str, change: &SnapshotChange) {
        self.listeners.retain(|listener| {
            if listener.collection != collection {
                return true;
            }
            listener
                .tx
                .send(DocumentSnapshot {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    change: change.clone(),
                    has_pending_writes: listener.client == writer,
                })
                .is_ok()
        });
    }
}

/// Shared backend handle; hands out clients.
#[derive(Clone, Default)]
pub struct InMemoryCloud {
    backend: Arc<Mutex<Backend>>,
    next_client: Arc<AtomicU64>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client with its own connectivity and echo identity.
    pub fn client(&self) -> CloudClient {
        CloudClient {
            id: self.next_client.fetch_add(1, Ordering::SeqCst),
            backend: Arc::clone(&self.backend),
            online: AtomicBool::new(true),
        }
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        lock(&self.backend)
            .ok()?
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    /// Documents written so far, counting each document of a batch.
    pub fn write_count(&self) -> usize {
        lock(&self.backend).map_or(0, |backend| backend.writes)
    }
}

fn lock(backend: &Mutex<Backend>) -> Result<MutexGuard<'_, Backend>> {
    backend
        .lock()
        .map_err(|_| Error::CloudWriteFailure("cloud backend lock poisoned".to_string()))
}

/// One device's connection to an [`InMemoryCloud`].
pub struct CloudClient {
    id: u64,
    backend: Arc<Mutex<Backend>>,
    online: AtomicBool,
}

impl CloudClient {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::CloudWriteFailure("client is offline".to_string()))
        }
    }
}

#[async_trait]
impl CloudStore for CloudClient {
    async fn write(
        &self,
        collection: &str,
        id: &str,
        document: Document,
        merge: bool,
    ) -> Result<()> {
        self.ensure_online()?;
        let write = DocumentWrite {
            collection: collection.to_string(),
            id: id.to_string(),
            document,
        };
        lock(&self.backend)?.apply(self.id, write, merge);
        Ok(())
    }

    async fn batch_write(&self, writes: Vec<DocumentWrite>) -> Result<()> {
        self.ensure_online()?;
        let mut backend = lock(&self.backend)?;
        for write in writes {
            backend.apply(self.id, write, true);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.ensure_online()?;
        let mut backend = lock(&self.backend)?;
        if backend
            .documents
            .remove(&(collection.to_string(), id.to_string()))
            .is_some()
        {
            backend.notify(self.id, collection, id, &SnapshotChange::Removed);
        }
        Ok(())
    }

    async fn listen(&self, collection: &str) -> Result<mpsc::UnboundedReceiver<DocumentSnapshot>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut backend = lock(&self.backend)?;
        for ((doc_collection, id), document) in &backend.documents {
            if doc_collection == collection {
                let _ = tx.send(DocumentSnapshot {
                    collection: collection.to_string(),
                    id: id.clone(),
                    change: SnapshotChange::Upserted(document.clone()),
                    has_pending_writes: false,
                });
            }
        }
        backend.listeners.push(Listener {
            client: self.id,
            collection: collection.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_writer_sees_pending_echo_others_see_confirmed() {
        let cloud = InMemoryCloud::new();
        let (a, b) = (cloud.client(), cloud.client());
        let mut a_rx = a.listen("workouts").await.unwrap();
        let mut b_rx = b.listen("workouts").await.unwrap();

        a.write("workouts", "w1", doc(json!({"name": "Run"})), true)
            .await
            .unwrap();

        assert!(a_rx.recv().await.unwrap().has_pending_writes);
        let remote = b_rx.recv().await.unwrap();
        assert!(!remote.has_pending_writes);
        assert_eq!(remote.change, SnapshotChange::Upserted(doc(json!({"name": "Run"}))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_merge_write_keeps_other_keys() {
        let cloud = InMemoryCloud::new();
        let client = cloud.client();
        client
            .write("workouts", "w1", doc(json!({"name": "Run", "version": 1})), true)
            .await
            .unwrap();
        client
            .write("workouts", "w1", doc(json!({"version": 2})), true)
            .await
            .unwrap();

        assert_eq!(
            cloud.document("workouts", "w1"),
            Some(doc(json!({"name": "Run", "version": 2})))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_client_writes_nothing() {
        let cloud = InMemoryCloud::new();
        let client = cloud.client();
        client.set_online(false);

        let result = client
            .batch_write(vec![DocumentWrite {
                collection: "workouts".into(),
                id: "w1".into(),
                document: Document::new(),
            }])
            .await;

        assert!(matches!(result, Err(Error::CloudWriteFailure(_))));
        assert_eq!(cloud.write_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_listen_replays_existing_documents() {
        let cloud = InMemoryCloud::new();
        let writer = cloud.client();
        writer
            .write("workoutTemplates", "t1", doc(json!({"name": "Core"})), false)
            .await
            .unwrap();

        let mut rx = cloud.client().listen("workoutTemplates").await.unwrap();

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.id, "t1");
        assert!(!snapshot.has_pending_writes);
    }
}

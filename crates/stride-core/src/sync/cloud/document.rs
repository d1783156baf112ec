//! Subgraph <-> cloud document encoding
//!
//! A root and its children travel as one document: the root's fields at the top
//! level, the children under `exercises`, plus `version` and `lastSyncedAt`.

use serde_json::Value;

use crate::db::sync_payload;
use crate::error::{Error, Result};
use crate::models::{ChangeRecord, ChangeType, EntityKind, FieldMap, RecordId};
use crate::sync::conflict::VersionStamp;

use super::Document;

const ID_KEY: &str = "id";
const CHILDREN_KEY: &str = "exercises";
const VERSION_KEY: &str = "version";
const LAST_SYNCED_KEY: &str = "lastSyncedAt";

/// Build the cloud document for a root snapshot and its children.
pub fn encode_subgraph(root: FieldMap, children: Vec<FieldMap>, stamp: VersionStamp) -> Document {
    let id = root.get(ID_KEY).cloned().unwrap_or(Value::Null);
    let mut document = sync_payload(root);
    document.insert(ID_KEY.into(), id);
    document.insert(VERSION_KEY.into(), Value::from(stamp.version));
    document.insert(
        LAST_SYNCED_KEY.into(),
        stamp.last_synced_at.map_or(Value::Null, Value::from),
    );

    let children = children
        .into_iter()
        .map(|child| {
            let child_id = child.get(ID_KEY).cloned().unwrap_or(Value::Null);
            let mut fields = sync_payload(child);
            fields.insert(ID_KEY.into(), child_id);
            Value::Object(fields)
        })
        .collect();
    document.insert(CHILDREN_KEY.into(), Value::Array(children));
    document
}

/// A decoded cloud document.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSubgraph {
    pub kind: EntityKind,
    pub id: RecordId,
    pub stamp: VersionStamp,
    pub root: FieldMap,
    pub children: Vec<(RecordId, FieldMap)>,
}

impl RemoteSubgraph {
    pub fn child_ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.children.iter().map(|(id, _)| *id)
    }

    /// Upserts for the root and every child, root first.
    pub fn into_records(self) -> Vec<ChangeRecord> {
        let Some(child_kind) = self.kind.child() else {
            return vec![ChangeRecord::upsert(self.kind, self.id, ChangeType::Update, self.root)];
        };
        std::iter::once(ChangeRecord::upsert(
            self.kind,
            self.id,
            ChangeType::Update,
            self.root,
        ))
        .chain(self.children.into_iter().map(|(id, fields)| {
            ChangeRecord::upsert(child_kind, id, ChangeType::Update, fields)
        }))
        .collect()
    }
}

/// Parse a cloud document for root `kind`/`id`.
///
/// Children without a valid id are dropped. Every child is linked to the root.
pub fn decode_subgraph(kind: EntityKind, id: RecordId, mut document: Document) -> Result<RemoteSubgraph> {
    let version = match document.remove(VERSION_KEY) {
        None | Some(Value::Null) => 0,
        Some(value) => value.as_i64().ok_or_else(|| {
            Error::MalformedMessage(format!("{kind} {id} has a non-integer version"))
        })?,
    };
    let last_synced_at = document.remove(LAST_SYNCED_KEY).and_then(|value| value.as_i64());

    let children = match document.remove(CHILDREN_KEY) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            return Err(Error::MalformedMessage(format!(
                "{kind} {id} has a non-array {CHILDREN_KEY}"
            )))
        }
    };

    let link = kind.child().and_then(EntityKind::parent);
    let children = children
        .into_iter()
        .filter_map(|entry| {
            let Value::Object(mut fields) = entry else {
                tracing::warn!(%kind, %id, "dropping non-object child in cloud document");
                return None;
            };
            let child_id = fields
                .remove(ID_KEY)
                .and_then(|value| value.as_str().and_then(|raw| raw.parse::<RecordId>().ok()));
            let Some(child_id) = child_id else {
                tracing::warn!(%kind, %id, "dropping child without a valid id");
                return None;
            };
            if let Some(link) = link {
                fields.insert(link.column.into(), Value::String(id.to_string()));
            }
            Some((child_id, fields))
        })
        .collect();

    document.remove(ID_KEY);

    Ok(RemoteSubgraph {
        kind,
        id,
        stamp: VersionStamp {
            version,
            last_synced_at,
        },
        root: document,
        children,
    })
}

//! Change records and checkpoints

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::entity::{EntityKind, RecordId};
use crate::error::Error;

/// Attribute name to value snapshot of one record.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// Exercise name to target time in seconds.
pub type GoalMap = BTreeMap<String, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::MalformedMessage(format!(
                "unknown change type '{other}'"
            ))),
        }
    }
}

/// One captured or received change.
///
/// Deletes carry no snapshot: the id and change type are enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub entity: EntityKind,
    pub id: RecordId,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<FieldMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_device: Option<String>,
}

impl ChangeRecord {
    pub const fn delete(entity: EntityKind, id: RecordId) -> Self {
        Self {
            entity,
            id,
            change_type: ChangeType::Delete,
            values: None,
            origin_device: None,
        }
    }

    pub const fn upsert(
        entity: EntityKind,
        id: RecordId,
        change_type: ChangeType,
        values: FieldMap,
    ) -> Self {
        Self {
            entity,
            id,
            change_type,
            values: Some(values),
            origin_device: None,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, device: impl Into<String>) -> Self {
        self.origin_device = Some(device.into());
        self
    }

    /// Parent id referenced by the snapshot, if this kind has a parent.
    pub fn parent_ref(&self) -> Option<RecordId> {
        let link = self.entity.parent()?;
        self.values
            .as_ref()?
            .get(link.column)?
            .as_str()?
            .parse()
            .ok()
    }
}

/// Position in a store's change history.
///
/// Only comparable with checkpoints issued by the same store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Checkpoint(i64);

impl Checkpoint {
    pub const ORIGIN: Self = Self(0);

    pub(crate) const fn from_seq(seq: i64) -> Self {
        Self(seq)
    }

    pub(crate) const fn seq(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parent_ref_reads_link_column() {
        let workout_id = RecordId::new();
        let mut values = FieldMap::new();
        values.insert("workout_id".into(), json!(workout_id.as_str()));
        let record =
            ChangeRecord::upsert(EntityKind::Exercise, RecordId::new(), ChangeType::Insert, values);
        assert_eq!(record.parent_ref(), Some(workout_id));
    }

    #[test]
    fn test_parent_ref_absent_for_roots_and_deletes() {
        let root = ChangeRecord::upsert(
            EntityKind::Workout,
            RecordId::new(),
            ChangeType::Insert,
            FieldMap::new(),
        );
        assert_eq!(root.parent_ref(), None);
        assert_eq!(
            ChangeRecord::delete(EntityKind::Exercise, RecordId::new()).parent_ref(),
            None
        );
    }

    #[test]
    fn test_checkpoint_orders_by_sequence() {
        assert!(Checkpoint::from_seq(4) > Checkpoint::from_seq(3));
        assert_eq!(Checkpoint::default(), Checkpoint::ORIGIN);
    }
}

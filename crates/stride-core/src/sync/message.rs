//! Peer message envelope
//!
//! Every message between the two devices is a JSON object tagged by `kind`.
//! Incoming bytes are validated here; nothing loosely typed travels further.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{ChangeRecord, ChangeType, EntityKind, FieldMap, GoalMap, RecordId};

/// Named commands one device can ask the other to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    RequestAllWorkouts,
    RequestAllTemplates,
    DeleteWorkout,
    DeleteAllWorkouts,
    ClearAllData,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestAllWorkouts => "requestAllWorkouts",
            Self::RequestAllTemplates => "requestAllTemplates",
            Self::DeleteWorkout => "deleteWorkout",
            Self::DeleteAllWorkouts => "deleteAllWorkouts",
            Self::ClearAllData => "clearAllData",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Message {
    Changes {
        changes: Vec<WireChange>,
    },
    Action {
        action: Action,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Goals {
        goals: GoalMap,
    },
    /// Connectivity probe; answered with a `test` reply
    Test {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },
}

impl Message {
    pub fn changes(records: &[ChangeRecord]) -> Self {
        Self::Changes {
            changes: records.iter().map(WireChange::from).collect(),
        }
    }

    pub const fn action(action: Action) -> Self {
        Self::Action { action, id: None }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Changes { .. } => "changes",
            Self::Action { .. } => "action",
            Self::Goals { .. } => "goals",
            Self::Test { .. } => "test",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|error| Error::MalformedMessage(format!("invalid peer message: {error}")))
    }
}

/// A change as it appears on the wire, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChange {
    pub entity: String,
    #[serde(default)]
    pub id: Option<String>,
    pub change_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<FieldMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_device: Option<String>,
}

impl From<&ChangeRecord> for WireChange {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            entity: record.entity.as_str().to_string(),
            id: Some(record.id.to_string()),
            change_type: record.change_type.as_str().to_string(),
            values: record.values.clone(),
            origin_device: record.origin_device.clone(),
        }
    }
}

impl TryFrom<WireChange> for ChangeRecord {
    type Error = Error;

    fn try_from(wire: WireChange) -> Result<Self> {
        let entity: EntityKind = wire.entity.parse()?;
        let raw_id = wire
            .id
            .ok_or_else(|| Error::MalformedMessage(format!("{entity} change without id")))?;
        let id: RecordId = raw_id
            .parse()
            .map_err(|_| Error::MalformedMessage(format!("invalid {entity} id '{raw_id}'")))?;
        let change_type: ChangeType = wire.change_type.parse()?;

        let values = match change_type {
            ChangeType::Delete => None,
            ChangeType::Insert | ChangeType::Update => Some(wire.values.ok_or_else(|| {
                Error::MalformedMessage(format!("{entity} {change_type} {id} has no values"))
            })?),
        };

        Ok(Self {
            entity,
            id,
            change_type,
            values,
            origin_device: wire.origin_device,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Answer to a message delivered on the direct path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(rename = "type")]
    pub reply_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Reply {
    pub fn ok(reply_type: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            reply_type: reply_type.into(),
            payload,
        }
    }

    pub fn error(reply_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            reply_type: reply_type.into(),
            payload: Some(serde_json::Value::String(message.into())),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// The error a rejected reply stands for.
    pub fn rejection(&self) -> Error {
        let detail = match &self.payload {
            Some(serde_json::Value::String(message)) => message.clone(),
            Some(other) => other.to_string(),
            None => "no detail".to_string(),
        };
        Error::PeerRejected(format!("{}: {detail}", self.reply_type))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|error| Error::MalformedMessage(format!("invalid peer reply: {error}")))
    }
}

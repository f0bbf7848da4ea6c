// Change-feed wire types.
//
// Outbound: one JSON object per control command. Inbound: a JSON array
// per text frame, each element either a feature-negotiation object
// (top-level boolean `TopologyChange`) or a typed message with `Type`
// plus `CommandId` / `Exception` / `Value`.

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ── Outbound ─────────────────────────────────────────────────────────

/// A control command written to the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangesCommandFrame<'a> {
    pub command_id: u64,
    pub command: &'a str,
    /// Serialized as `null` when absent; the server expects the key.
    pub param: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a [String]>,
}

impl ChangesCommandFrame<'_> {
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|e| Error::InvalidCommand(format!("cannot serialize changes command: {e}")))
    }
}

// ── Notification payloads ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum DocumentChangeType {
    None,
    Put,
    Delete,
    Conflict,
    Common,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DocumentChange {
    #[serde(rename = "Type")]
    pub change_type: DocumentChangeType,
    pub id: String,
    #[serde(default)]
    pub collection_name: Option<String>,
    #[serde(default)]
    pub type_name: Option<String>,
    #[serde(default)]
    pub change_vector: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum IndexChangeType {
    None,
    BatchCompleted,
    IndexAdded,
    IndexRemoved,
    IndexDemotedToIdle,
    IndexPromotedFromIdle,
    IndexDemotedToDisabled,
    IndexMarkedAsErrored,
    SideBySideReplace,
    Renamed,
    IndexPaused,
    LockModeChanged,
    PriorityChanged,
    RollingIndexChanged,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexChange {
    #[serde(rename = "Type")]
    pub change_type: IndexChangeType,
    pub name: String,
    #[serde(default)]
    pub etag: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperationStatusChange {
    pub operation_id: i64,
    #[serde(default)]
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum CounterChangeType {
    None,
    Put,
    Delete,
    Increment,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CounterChange {
    #[serde(rename = "Type")]
    pub change_type: CounterChangeType,
    pub name: String,
    #[serde(default)]
    pub value: i64,
    pub document_id: String,
    #[serde(default)]
    pub collection_name: Option<String>,
    #[serde(default)]
    pub change_vector: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum TimeSeriesChangeType {
    None,
    Put,
    Delete,
    Mixed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimeSeriesChange {
    #[serde(rename = "Type")]
    pub change_type: TimeSeriesChangeType,
    pub name: String,
    pub document_id: String,
    #[serde(default)]
    pub collection_name: Option<String>,
    /// ISO-8601 range start, kept verbatim.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub change_vector: Option<String>,
}

/// The server asks clients to refresh topology from the given node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopologyChange {
    pub url: String,
    pub database: String,
}

/// Something cached may be stale; carries no payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggressiveCacheChange;

/// Capabilities the server announces right after connecting.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangesSupportedFeatures {
    pub topology_change: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A decoded notification, fanned out to every subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Document(DocumentChange),
    Index(IndexChange),
    Operation(OperationStatusChange),
    Counter(CounterChange),
    TimeSeries(TimeSeriesChange),
    AggressiveCache(AggressiveCacheChange),
}

// ── Inbound frame parsing ────────────────────────────────────────────

/// One element of an inbound frame.
#[derive(Debug)]
pub enum ChangesMessage {
    SupportedFeatures(ChangesSupportedFeatures),
    Confirm { command_id: u64 },
    Error { exception: String },
    Notification(Notification),
    TopologyChange(TopologyChange),
    /// A known type whose payload failed to decode.
    Malformed { message_type: String, error: Error },
    /// A `Type` this client doesn't understand.
    Unknown { message_type: String },
}

/// Parse one text frame.
///
/// Fails only when the frame is not JSON. A non-array frame yields no
/// messages; elements without a `Type` are skipped.
pub fn parse_changes_frame(text: &str) -> Result<Vec<ChangesMessage>, Error> {
    let frame: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Error::deserialization(&e, text.as_bytes()))?;

    let serde_json::Value::Array(elements) = frame else {
        tracing::debug!("Ignoring non-array change-feed frame");
        return Ok(Vec::new());
    };

    let mut messages = Vec::with_capacity(elements.len());
    for element in elements {
        if element.get("TopologyChange").is_some_and(serde_json::Value::is_boolean) {
            match serde_json::from_value::<ChangesSupportedFeatures>(element) {
                Ok(features) => messages.push(ChangesMessage::SupportedFeatures(features)),
                Err(e) => messages.push(ChangesMessage::Malformed {
                    message_type: "SupportedFeatures".into(),
                    error: Error::Deserialization {
                        message: e.to_string(),
                        body: String::new(),
                    },
                }),
            }
            continue;
        }

        let Some(message_type) = element.get("Type").and_then(serde_json::Value::as_str) else {
            continue;
        };
        messages.push(parse_element(message_type, &element));
    }
    Ok(messages)
}

fn parse_element(message_type: &str, element: &serde_json::Value) -> ChangesMessage {
    let value = element.get("Value").cloned().unwrap_or(serde_json::Value::Null);

    let decoded = match message_type {
        "Confirm" => {
            return match element.get("CommandId").and_then(serde_json::Value::as_u64) {
                Some(command_id) => ChangesMessage::Confirm { command_id },
                None => malformed(message_type, "missing CommandId", element),
            };
        }
        "Error" => {
            let exception = element
                .get("Exception")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown server error")
                .to_owned();
            return ChangesMessage::Error { exception };
        }
        "AggressiveCacheChange" => Ok(Notification::AggressiveCache(AggressiveCacheChange)),
        "DocumentChange" => serde_json::from_value(value.clone()).map(Notification::Document),
        "IndexChange" => serde_json::from_value(value.clone()).map(Notification::Index),
        "OperationStatusChange" => {
            serde_json::from_value(value.clone()).map(Notification::Operation)
        }
        "CounterChange" => serde_json::from_value(value.clone()).map(Notification::Counter),
        "TimeSeriesChange" => serde_json::from_value(value.clone()).map(Notification::TimeSeries),
        "TopologyChange" => {
            return match serde_json::from_value::<TopologyChange>(value.clone()) {
                Ok(change) => ChangesMessage::TopologyChange(change),
                Err(e) => malformed(message_type, &e.to_string(), &value),
            };
        }
        other => {
            return ChangesMessage::Unknown {
                message_type: other.to_owned(),
            };
        }
    };

    match decoded {
        Ok(notification) => ChangesMessage::Notification(notification),
        Err(e) => malformed(message_type, &e.to_string(), &value),
    }
}

fn malformed(message_type: &str, reason: &str, payload: &serde_json::Value) -> ChangesMessage {
    ChangesMessage::Malformed {
        message_type: message_type.to_owned(),
        error: Error::Deserialization {
            message: format!("{message_type}: {reason}"),
            body: payload.to_string(),
        },
    }
}

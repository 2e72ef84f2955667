//! Child record types.
//!
//! A child record is a JSON object stored under `<root>/<key>`. This module
//! defines the typed view of that object, the well-known field names, and
//! the defaults written when a record is created.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::key::ChildKey;

/// Placeholder shown for text fields that have not loaded yet.
pub const LOADING: &str = "Loading...";

/// JSON key of the message log inside a record.
pub const MESSAGES_FIELD: &str = "messages";

/// ETA written into new records.
pub const DEFAULT_ETA: &str = "Arriving in 5 minutes";

/// Image shown for children without a usable photo.
pub const DEFAULT_PHOTO_URL: &str = "gs://rollcall.appspot.com/defaults/child.png";

/// The live fields of a child record that can be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildField {
    /// Human-readable name; the source of the record's key.
    DisplayName,
    /// Free-text arrival estimate.
    Eta,
    /// Current status string.
    Status,
    /// Photo URL, or the default image URL.
    PhotoUrl,
}

impl ChildField {
    /// All observable fields.
    pub const ALL: [Self; 4] = [Self::DisplayName, Self::Eta, Self::Status, Self::PhotoUrl];

    /// The JSON key used for this field in the store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DisplayName => "displayName",
            Self::Eta => "eta",
            Self::Status => "status",
            Self::PhotoUrl => "photoUrl",
        }
    }

    /// The value emitted in place of a stream error for this field.
    ///
    /// The photo field has no text sentinel; it falls back to the default
    /// image instead, so `None` is returned for it.
    #[must_use]
    pub fn error_sentinel(self) -> Option<&'static str> {
        match self {
            Self::DisplayName => Some("Error loading name"),
            Self::Eta => Some("Error loading ETA"),
            Self::Status => Some("Error loading status"),
            Self::PhotoUrl => None,
        }
    }
}

impl fmt::Display for ChildField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChildField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "displayName" | "display_name" | "name" => Ok(Self::DisplayName),
            "eta" => Ok(Self::Eta),
            "status" => Ok(Self::Status),
            "photoUrl" | "photo_url" | "photo" => Ok(Self::PhotoUrl),
            other => Err(format!("unknown child field: {other}")),
        }
    }
}

/// Status of a child on the bus route.
///
/// The store holds plain strings and does not enforce transitions. Values
/// outside the well-known set are kept as [`ChildStatus::Other`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChildStatus {
    /// On the way to the pickup point.
    #[default]
    OnRoute,
    /// On the bus.
    Boarded,
    /// Dropped off at the destination.
    Dropped,
    /// Not riding today.
    Absent,
    /// Waiting for pickup.
    Waiting,
    /// Any other status string written by another client.
    Other(String),
}

impl ChildStatus {
    /// The stored string for this status.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::OnRoute => "On Route",
            Self::Boarded => "Boarded",
            Self::Dropped => "Dropped",
            Self::Absent => "Absent",
            Self::Waiting => "Waiting",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ChildStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "On Route" => Self::OnRoute,
            "Boarded" => Self::Boarded,
            "Dropped" => Self::Dropped,
            "Absent" => Self::Absent,
            "Waiting" => Self::Waiting,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for ChildStatus {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<ChildStatus> for String {
    fn from(status: ChildStatus) -> Self {
        match status {
            ChildStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

/// A message pushed to a child's message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// What the message is about (e.g. `"absence"`, `"pickup"`).
    pub action: String,
    /// Free-text body.
    pub message: String,
    /// When the message was written, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn new(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            message: message.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Values written into a record when it is created or back-filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDefaults {
    /// Initial ETA text.
    pub eta: String,
    /// Initial status.
    pub status: ChildStatus,
    /// URL of the default child image.
    pub photo_url: String,
}

impl Default for RecordDefaults {
    fn default() -> Self {
        Self {
            eta: DEFAULT_ETA.to_string(),
            status: ChildStatus::OnRoute,
            photo_url: DEFAULT_PHOTO_URL.to_string(),
        }
    }
}

impl RecordDefaults {
    /// Build the full JSON object for a freshly created record.
    #[must_use]
    pub fn new_record(&self, display_name: &str) -> Value {
        let mut record = Map::new();
        record.insert(ChildField::DisplayName.as_str().to_string(), json!(display_name));
        record.insert(ChildField::Eta.as_str().to_string(), json!(self.eta));
        record.insert(ChildField::Status.as_str().to_string(), json!(self.status.as_str()));
        record.insert(MESSAGES_FIELD.to_string(), json!({}));
        record.insert(ChildField::PhotoUrl.as_str().to_string(), json!(self.photo_url));
        Value::Object(record)
    }

    /// Compute the fields missing from an existing record.
    ///
    /// Only `displayName`, `status`, `messages`, and `photoUrl` are filled.
    /// The ETA is never written once a record exists. Fields that are present
    /// with any value, including the wrong type, count as present.
    #[must_use]
    pub fn missing_fields(&self, existing: &Map<String, Value>, display_name: &str) -> Map<String, Value> {
        let candidates = [
            (ChildField::DisplayName.as_str(), json!(display_name)),
            (ChildField::Status.as_str(), json!(self.status.as_str())),
            (MESSAGES_FIELD, json!({})),
            (ChildField::PhotoUrl.as_str(), json!(self.photo_url)),
        ];

        candidates
            .into_iter()
            .filter(|(name, _)| !existing.contains_key(*name))
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

/// Typed view of a stored child record.
///
/// Missing or mistyped fields read as `None` rather than failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildRecord {
    /// Key the record is stored under.
    pub key: ChildKey,
    /// Stored display name.
    pub display_name: Option<String>,
    /// Stored ETA.
    pub eta: Option<String>,
    /// Stored status.
    pub status: Option<ChildStatus>,
    /// Stored photo URL.
    pub photo_url: Option<String>,
    /// Message log, ordered by push id.
    pub messages: BTreeMap<String, Message>,
}

impl ChildRecord {
    /// Read a record out of its stored JSON value.
    ///
    /// Returns `None` if the value is not an object.
    #[must_use]
    pub fn from_value(key: ChildKey, value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let text = |field: ChildField| {
            object
                .get(field.as_str())
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let messages = object
            .get(MESSAGES_FIELD)
            .and_then(Value::as_object)
            .map(|log| {
                log.iter()
                    .filter_map(|(id, entry)| {
                        serde_json::from_value::<Message>(entry.clone())
                            .ok()
                            .map(|m| (id.clone(), m))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            key,
            display_name: text(ChildField::DisplayName),
            eta: text(ChildField::Eta),
            status: text(ChildField::Status).map(ChildStatus::from),
            photo_url: text(ChildField::PhotoUrl),
            messages,
        })
    }

    /// The key this record should live under, if its name normalizes to
    /// something non-empty.
    #[must_use]
    pub fn expected_key(&self) -> Option<ChildKey> {
        self.display_name
            .as_deref()
            .and_then(ChildKey::from_display_name)
    }

    /// Check whether the record's key agrees with its display name.
    #[must_use]
    pub fn is_key_consistent(&self) -> bool {
        self.expected_key().map_or(true, |expected| expected == self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> RecordDefaults {
        RecordDefaults {
            photo_url: "gs://bucket/defaults/child.png".to_string(),
            ..RecordDefaults::default()
        }
    }

    fn key(s: &str) -> ChildKey {
        ChildKey::from_stored(s).unwrap()
    }

    #[test]
    fn test_child_field_names() {
        assert_eq!(ChildField::DisplayName.as_str(), "displayName");
        assert_eq!(ChildField::Eta.as_str(), "eta");
        assert_eq!(ChildField::Status.as_str(), "status");
        assert_eq!(ChildField::PhotoUrl.as_str(), "photoUrl");
    }

    #[test]
    fn test_child_field_from_str() {
        assert_eq!("eta".parse::<ChildField>().unwrap(), ChildField::Eta);
        assert_eq!("photo".parse::<ChildField>().unwrap(), ChildField::PhotoUrl);
        assert!("height".parse::<ChildField>().is_err());
    }

    #[test]
    fn test_error_sentinels_are_distinct() {
        let sentinels: Vec<_> = ChildField::ALL
            .iter()
            .filter_map(|f| f.error_sentinel())
            .collect();
        assert_eq!(sentinels.len(), 3);
        assert!(sentinels.contains(&"Error loading ETA"));
        assert!(ChildField::PhotoUrl.error_sentinel().is_none());
    }

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!(ChildStatus::from("Boarded"), ChildStatus::Boarded);
        assert_eq!(ChildStatus::from("On Route").to_string(), "On Route");
        let other = ChildStatus::from("Late");
        assert_eq!(other, ChildStatus::Other("Late".to_string()));
        assert_eq!(String::from(other), "Late");
    }

    #[test]
    fn test_status_default() {
        assert_eq!(ChildStatus::default(), ChildStatus::OnRoute);
    }

    #[test]
    fn test_new_record_shape() {
        let value = defaults().new_record("Tom");
        assert_eq!(value["displayName"], "Tom");
        assert_eq!(value["eta"], "Arriving in 5 minutes");
        assert_eq!(value["status"], "On Route");
        assert_eq!(value["messages"], json!({}));
        assert_eq!(value["photoUrl"], "gs://bucket/defaults/child.png");
    }

    #[test]
    fn test_missing_fields_never_touches_eta() {
        let existing = json!({"displayName": "Tom"});
        let missing = defaults().missing_fields(existing.as_object().unwrap(), "Tom");

        assert!(!missing.contains_key("eta"));
        assert!(!missing.contains_key("displayName"));
        assert_eq!(missing["status"], "On Route");
        assert_eq!(missing["messages"], json!({}));
        assert!(missing.contains_key("photoUrl"));
    }

    #[test]
    fn test_missing_fields_complete_record() {
        let existing = defaults().new_record("Tom");
        let missing = defaults().missing_fields(existing.as_object().unwrap(), "Tom");
        assert!(missing.is_empty());
    }

    #[test]
    fn test_record_from_value() {
        let value = json!({
            "displayName": "Tom",
            "eta": "5 min",
            "status": "Boarded",
            "photoUrl": "",
            "messages": {
                "a1": {"action": "absence", "message": "sick today"},
                "a2": "garbage"
            }
        });
        let record = ChildRecord::from_value(key("tom"), &value).unwrap();

        assert_eq!(record.display_name.as_deref(), Some("Tom"));
        assert_eq!(record.status, Some(ChildStatus::Boarded));
        assert_eq!(record.messages.len(), 1);
        assert_eq!(record.messages["a1"].action, "absence");
        assert!(record.is_key_consistent());
    }

    #[test]
    fn test_record_wrong_types_read_as_absent() {
        let value = json!({"displayName": 42, "eta": ["x"]});
        let record = ChildRecord::from_value(key("tom"), &value).unwrap();
        assert!(record.display_name.is_none());
        assert!(record.eta.is_none());
        assert!(record.expected_key().is_none());
        assert!(record.is_key_consistent());
    }

    #[test]
    fn test_record_from_non_object() {
        assert!(ChildRecord::from_value(key("tom"), &json!("text")).is_none());
    }

    #[test]
    fn test_record_key_mismatch() {
        let value = json!({"displayName": "Thomas"});
        let record = ChildRecord::from_value(key("tom"), &value).unwrap();
        assert!(!record.is_key_consistent());
        assert_eq!(record.expected_key().unwrap().as_str(), "thomas");
    }

    #[test]
    fn test_message_new_has_timestamp() {
        let message = Message::new("pickup", "at the gate");
        assert!(message.timestamp.is_some());
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["action"], "pickup");
        assert!(value.get("timestamp").is_some());
    }
}

//! Actions delivered by the control plane
//!
//! Checkin responses carry loosely typed JSON actions. They are decoded once
//! into the closed [`Action`] enum; anything that cannot be decoded becomes
//! [`Action::Unknown`] so it still reaches the default handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

pub const POLICY_CHANGE: &str = "POLICY_CHANGE";
pub const UNENROLL: &str = "UNENROLL";
pub const POLICY_REASSIGN: &str = "POLICY_REASSIGN";
pub const UPGRADE: &str = "UPGRADE";
pub const INPUT_ACTION: &str = "INPUT_ACTION";

/// Action as it appears on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawAction {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
}

/// Action routed to the program that declares its input type.
///
/// The result fields are filled in by the handler and travel back in the
/// ack event.
#[derive(Debug, Clone, PartialEq)]
pub struct AppAction {
    pub id: String,
    pub input_type: String,
    pub params: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub response: Option<Value>,
}

impl AppAction {
    pub fn new(id: impl Into<String>, input_type: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            input_type: input_type.into(),
            params,
            started_at: None,
            completed_at: None,
            error: None,
            response: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    PolicyChange { id: String, policy: Value },
    Unenroll { id: String, is_detected: bool },
    PolicyReassign { id: String },
    Upgrade {
        id: String,
        version: String,
        source_uri: Option<String>,
    },
    App(AppAction),
    Unknown { id: String, original_type: String },
}

/// Variant tag used to key handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    PolicyChange,
    Unenroll,
    PolicyReassign,
    Upgrade,
    App,
    Unknown,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::PolicyChange => "policy_change",
            ActionKind::Unenroll => "unenroll",
            ActionKind::PolicyReassign => "policy_reassign",
            ActionKind::Upgrade => "upgrade",
            ActionKind::App => "app_action",
            ActionKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Action {
    pub fn id(&self) -> &str {
        match self {
            Action::PolicyChange { id, .. }
            | Action::Unenroll { id, .. }
            | Action::PolicyReassign { id }
            | Action::Upgrade { id, .. }
            | Action::Unknown { id, .. } => id,
            Action::App(app) => &app.id,
        }
    }

    /// Wire type of the action
    pub fn action_type(&self) -> &str {
        match self {
            Action::PolicyChange { .. } => POLICY_CHANGE,
            Action::Unenroll { .. } => UNENROLL,
            Action::PolicyReassign { .. } => POLICY_REASSIGN,
            Action::Upgrade { .. } => UPGRADE,
            Action::App(_) => INPUT_ACTION,
            Action::Unknown { original_type, .. } => original_type,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::PolicyChange { .. } => ActionKind::PolicyChange,
            Action::Unenroll { .. } => ActionKind::Unenroll,
            Action::PolicyReassign { .. } => ActionKind::PolicyReassign,
            Action::Upgrade { .. } => ActionKind::Upgrade,
            Action::App(_) => ActionKind::App,
            Action::Unknown { .. } => ActionKind::Unknown,
        }
    }

    /// Acks for these actions are flushed immediately by the lazy acker.
    pub fn force_ack(&self) -> bool {
        matches!(self, Action::PolicyReassign { .. })
    }

    /// Decode a wire action. Malformed payloads of known types decode as
    /// [`Action::Unknown`].
    pub fn from_raw(raw: RawAction) -> Self {
        let RawAction {
            id,
            action_type,
            data,
            input_type,
        } = raw;

        let decoded = match action_type.as_str() {
            POLICY_CHANGE => match data.get("policy") {
                Some(policy @ Value::Object(_)) => Ok(Action::PolicyChange {
                    id: id.clone(),
                    policy: policy.clone(),
                }),
                _ => Err("data.policy must be an object"),
            },
            UNENROLL => Ok(Action::Unenroll {
                id: id.clone(),
                is_detected: data
                    .get("is_detected")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            POLICY_REASSIGN => Ok(Action::PolicyReassign { id: id.clone() }),
            UPGRADE => match data.get("version").and_then(Value::as_str) {
                Some(version) if !version.is_empty() => Ok(Action::Upgrade {
                    id: id.clone(),
                    version: version.to_string(),
                    source_uri: data
                        .get("source_uri")
                        .and_then(Value::as_str)
                        .filter(|uri| !uri.is_empty())
                        .map(str::to_string),
                }),
                _ => Err("data.version is required"),
            },
            INPUT_ACTION => match input_type.filter(|t| !t.is_empty()) {
                Some(input_type) => Ok(Action::App(AppAction::new(id.clone(), input_type, data))),
                None => Err("input_type is required"),
            },
            _ => Err("unsupported action type"),
        };

        decoded.unwrap_or_else(|reason| {
            warn!("Action {} of type {}: {}", id, action_type, reason);
            Action::Unknown {
                id,
                original_type: action_type,
            }
        })
    }
}

/// Deserialize an action list entry by entry. An entry that does not fit
/// [`RawAction`] keeps its id, when it has a string one, and an empty type,
/// so it decodes as [`Action::Unknown`] instead of failing the whole list.
pub fn deserialize_actions<'de, D>(deserializer: D) -> Result<Vec<RawAction>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(entries
        .into_iter()
        .map(|entry| {
            serde_json::from_value::<RawAction>(entry.clone()).unwrap_or_else(|e| {
                warn!("Malformed action in checkin response: {}", e);
                RawAction {
                    id: entry
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    ..RawAction::default()
                }
            })
        })
        .collect())
}

/// Decode a checkin's action list, keeping its order.
pub fn decode_actions(raw: Vec<RawAction>) -> Vec<Action> {
    raw.into_iter().map(Action::from_raw).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawAction {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_decode_known_types() {
        let actions = decode_actions(vec![
            raw(json!({"id": "1", "type": "POLICY_REASSIGN"})),
            raw(json!({"id": "2", "type": "POLICY_CHANGE", "data": {"policy": {"hello": "world"}}})),
            raw(json!({"id": "3", "type": "UNENROLL"})),
            raw(json!({"id": "4", "type": "UPGRADE", "data": {"version": "8.1.0", "source_uri": ""}})),
            raw(json!({"id": "5", "type": "INPUT_ACTION", "input_type": "endpoint", "data": {"cmd": "isolate"}})),
        ]);

        assert_eq!(actions[0], Action::PolicyReassign { id: "1".into() });
        assert_eq!(
            actions[1],
            Action::PolicyChange {
                id: "2".into(),
                policy: json!({"hello": "world"})
            }
        );
        assert_eq!(
            actions[2],
            Action::Unenroll {
                id: "3".into(),
                is_detected: false
            }
        );
        assert_eq!(
            actions[3],
            Action::Upgrade {
                id: "4".into(),
                version: "8.1.0".into(),
                source_uri: None
            }
        );
        match &actions[4] {
            Action::App(app) => {
                assert_eq!(app.input_type, "endpoint");
                assert_eq!(app.params, json!({"cmd": "isolate"}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_and_unsupported_are_unknown() {
        for value in [
            json!({"id": "x", "type": "POLICY_CHANGE", "data": {}}),
            json!({"id": "x", "type": "UPGRADE", "data": {}}),
            json!({"id": "x", "type": "INPUT_ACTION", "data": {}}),
            json!({"id": "x", "type": "SETTINGS"}),
        ] {
            let action = Action::from_raw(raw(value.clone()));
            assert_eq!(action.kind(), ActionKind::Unknown, "{}", value);
            assert_eq!(action.id(), "x");
            assert_eq!(action.action_type(), value["type"].as_str().unwrap());
        }
    }

    #[test]
    fn test_force_ack_only_for_reassign() {
        assert!(Action::PolicyReassign { id: "1".into() }.force_ack());
        assert!(!Action::Unenroll {
            id: "1".into(),
            is_detected: true
        }
        .force_ack());
    }
}

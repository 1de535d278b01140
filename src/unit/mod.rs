//! The unit domain model.
//!
//! A unit is a persisted task descriptor naming a delegate endpoint, a
//! payload, a tenant, and an optional topic for publishing the terminal
//! outcome. Units are keyed by a caller-supplied id that doubles as the
//! dedup key against redelivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ephemeral identity of one runner process.
///
/// Generated fresh at process start and never reused across restarts; every
/// component that claims or sweeps units carries this value explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerId(Uuid);

impl RunnerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for RunnerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RunnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Received,
    InProgress,
    Finished,
    Failed,
}

impl UnitStatus {
    /// Terminal states are never advanced past and never reclaimed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Finished | UnitStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Received => "received",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Finished => "finished",
            UnitStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(UnitStatus::Received),
            "in_progress" => Some(UnitStatus::InProgress),
            "finished" => Some(UnitStatus::Finished),
            "failed" => Some(UnitStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Caller-supplied dedup key, taken from the inbound message key.
    pub id: String,
    /// Owning runner; `None` means unowned.
    pub runner_id: Option<RunnerId>,
    /// Delegate endpoint invoked to execute this unit.
    pub url: String,
    /// Opaque payload forwarded verbatim to the endpoint.
    pub body: serde_json::Value,
    /// Carried through for multi-tenant routing, not interpreted here.
    pub tenant: String,
    /// Where to publish the terminal outcome, if anywhere.
    pub response_topic: Option<String>,
    /// Set only on terminal states.
    pub result: Option<serde_json::Value>,
    pub status: UnitStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Unit {
    /// Build a freshly received, unowned unit.
    pub fn received(id: String, request: UnitRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            runner_id: None,
            url: request.url,
            body: request.body,
            tenant: request.tenant,
            response_topic: request.response_topic,
            result: None,
            status: UnitStatus::Received,
            created: now,
            updated: now,
        }
    }
}

/// The fields an enqueuing service must put in a unit message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRequest {
    pub url: String,
    pub body: serde_json::Value,
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_topic: Option<String>,
}

/// Result of parsing one inbound message.
#[derive(Debug)]
pub enum ParseOutcome {
    Parsed(Unit),
    /// Missing key or required field. The message is dropped for good;
    /// redelivery would fail the same way.
    Malformed(String),
}

/// Parse an inbound message into a unit.
///
/// The message key becomes the unit id. `url`, `body`, and `tenant` are
/// required; `response_topic` is optional.
pub fn parse_message(key: Option<&str>, payload: &[u8]) -> ParseOutcome {
    let id = match key {
        Some(k) if !k.is_empty() => k.to_string(),
        _ => return ParseOutcome::Malformed("message has no key".to_string()),
    };

    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => return ParseOutcome::Malformed(format!("payload is not valid JSON: {e}")),
    };

    // Field-by-field rather than a straight Deserialize so the log line can
    // name exactly what was missing.
    let Some(url) = value.get("url").and_then(|v| v.as_str()) else {
        return ParseOutcome::Malformed("missing required field: url".to_string());
    };
    let Some(body) = value.get("body") else {
        return ParseOutcome::Malformed("missing required field: body".to_string());
    };
    let Some(tenant) = value.get("tenant").and_then(|v| v.as_str()) else {
        return ParseOutcome::Malformed("missing required field: tenant".to_string());
    };
    let response_topic = match value.get("response_topic") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(topic)) => Some(topic.clone()),
        Some(_) => {
            return ParseOutcome::Malformed("response_topic must be a string".to_string());
        }
    };

    ParseOutcome::Parsed(Unit::received(
        id,
        UnitRequest {
            url: url.to_string(),
            body: body.clone(),
            tenant: tenant.to_string(),
            response_topic,
        },
    ))
}

/// Payload published to a unit's response topic on terminal completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalReport {
    pub status: UnitStatus,
    pub result: serde_json::Value,
}

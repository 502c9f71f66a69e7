use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::session_id::SessionId;

/// Identifier minted for every emitted trace event. Becomes the causation
/// id of the next event in the same request chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier shared by every event produced for one logical send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed vocabulary of delivery lifecycle steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventKind {
    Requested,
    Queued,
    DepthChanged,
    ModeSelected,
    TransformApplied,
    Applied,
    SubmitRequested,
    SubmitSent,
    Verified,
    Failed,
    Timeout,
    Dropped,
    Cleared,
}

impl fmt::Display for TraceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Requested => "requested",
            Self::Queued => "queued",
            Self::DepthChanged => "depth_changed",
            Self::ModeSelected => "mode_selected",
            Self::TransformApplied => "transform_applied",
            Self::Applied => "applied",
            Self::SubmitRequested => "submit_requested",
            Self::SubmitSent => "submit_sent",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Dropped => "dropped",
            Self::Cleared => "cleared",
        };
        write!(f, "{label}")
    }
}

/// One lifecycle event. Append-only; the engine emits and forgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub session_id: SessionId,
    pub payload: serde_json::Value,
    pub correlation_id: CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,
    pub event_id: EventId,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn event_round_trips_without_causation() {
        let event = TraceEvent {
            kind: TraceEventKind::Queued,
            session_id: SessionId::from("pane-1"),
            payload: json!({"depth": 1}),
            correlation_id: CorrelationId::new(),
            causation_id: None,
            event_id: EventId::new(),
            source: "engine".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json["kind"], "queued");
        assert!(json.get("causation_id").is_none());
    }
}

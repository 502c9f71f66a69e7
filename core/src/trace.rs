use std::sync::Arc;

use chrono::Utc;
use paneflow_protocol::CorrelationId;
use paneflow_protocol::EventId;
use paneflow_protocol::SessionId;
use paneflow_protocol::TraceEvent;
use paneflow_protocol::TraceEventKind;
use tokio::sync::broadcast;
use tracing::trace;

use crate::transport::EventSink;

const BROADCAST_CAPACITY: usize = 256;
const ENGINE_SOURCE: &str = "paneflow";

/// Correlation/causation carrier for one logical send. Every emitted event's
/// id becomes the causation id of the next event in the chain, so the whole
/// request is reconstructable even across asynchronous gate deferrals.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
}

impl TraceContext {
    /// Fresh chain with a newly minted correlation id.
    pub fn root() -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            causation_id: None,
        }
    }

    /// Continue a chain supplied by the caller's trace context.
    pub fn inherited(correlation_id: CorrelationId, causation_id: Option<EventId>) -> Self {
        Self {
            correlation_id,
            causation_id,
        }
    }
}

/// Publishes a typed lifecycle event for every protocol step: to the
/// injected sink, and to in-process subscribers over a broadcast channel.
/// Events are emitted, never stored here.
pub(crate) struct EventTracer {
    sink: Option<Arc<dyn EventSink>>,
    broadcast: broadcast::Sender<TraceEvent>,
}

impl EventTracer {
    pub(crate) fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sink, broadcast }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.broadcast.subscribe()
    }

    pub(crate) fn emit(
        &self,
        ctx: &mut TraceContext,
        kind: TraceEventKind,
        session: &SessionId,
        payload: serde_json::Value,
    ) -> EventId {
        let event_id = EventId::new();
        let event = TraceEvent {
            kind,
            session_id: session.clone(),
            payload,
            correlation_id: ctx.correlation_id,
            causation_id: ctx.causation_id,
            event_id,
            source: ENGINE_SOURCE.to_string(),
            timestamp: Utc::now(),
        };
        ctx.causation_id = Some(event_id);
        trace!(
            session_id = %session,
            correlation_id = %ctx.correlation_id,
            kind = %kind,
            "trace event"
        );
        let _ = self.broadcast.send(event.clone());
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
        event_id
    }
}

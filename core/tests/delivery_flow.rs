use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use paneflow_core::CapabilityRegistry;
use paneflow_core::ChunkedWriteOptions;
use paneflow_core::ChunkedWriteReport;
use paneflow_core::Collaborators;
use paneflow_core::EngineConfig;
use paneflow_core::EventSink;
use paneflow_core::FocusHandle;
use paneflow_core::FocusResolver;
use paneflow_core::InjectionController;
use paneflow_core::PromptComposer;
use paneflow_core::SendOptions;
use paneflow_core::StuckSignal;
use paneflow_core::Transport;
use paneflow_core::TransportError;
use paneflow_core::WriteIntent;
use paneflow_core::WriteMeta;
use paneflow_protocol::CapabilityProfile;
use paneflow_protocol::DeliverySignal;
use paneflow_protocol::FailureReason;
use paneflow_protocol::SessionId;
use paneflow_protocol::SessionMode;
use paneflow_protocol::SubmitMethod;
use paneflow_protocol::TraceEvent;
use paneflow_protocol::TraceEventKind;
use pretty_assertions::assert_eq;

#[derive(Debug, Clone)]
struct RecordedWrite {
    session: SessionId,
    bytes: Vec<u8>,
    intent: Option<WriteIntent>,
}

/// In-memory channel standing in for the pseudo-terminal transport. Submit
/// writes can trigger scripted side effects (prompt disappearing, output
/// resuming) so acceptance signals are deterministic under a paused clock.
#[derive(Default)]
struct ScriptedTransport {
    writes: StdMutex<Vec<RecordedWrite>>,
    prompt: StdMutex<HashMap<SessionId, bool>>,
    on_submit: StdMutex<Option<Box<dyn Fn(&SessionId) + Send + Sync>>>,
    payload_writes_in_flight: AtomicUsize,
    max_payload_concurrency: AtomicUsize,
    slow_payload_writes: AtomicBool,
    fail_payload_writes: AtomicBool,
}

impl ScriptedTransport {
    fn set_prompt(&self, session: &SessionId, visible: bool) {
        self.prompt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.clone(), visible);
    }

    fn set_on_submit(&self, hook: impl Fn(&SessionId) + Send + Sync + 'static) {
        *self.on_submit.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    fn recorded(&self) -> Vec<RecordedWrite> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_slow_payload_writes(&self, slow: bool) {
        self.slow_payload_writes.store(slow, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn write(
        &self,
        session: &SessionId,
        bytes: &[u8],
        meta: WriteMeta,
    ) -> Result<(), TransportError> {
        if meta.intent == Some(WriteIntent::Payload)
            && self.fail_payload_writes.load(Ordering::SeqCst)
        {
            return Err(TransportError::write(anyhow::anyhow!(
                "channel rejected write"
            )));
        }
        if meta.intent == Some(WriteIntent::Payload)
            && self.slow_payload_writes.load(Ordering::SeqCst)
        {
            let active = self.payload_writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_payload_concurrency.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(80)).await;
            self.payload_writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedWrite {
                session: session.clone(),
                bytes: bytes.to_vec(),
                intent: meta.intent,
            });
        if meta.intent == Some(WriteIntent::Submit)
            && let Some(hook) = &*self.on_submit.lock().unwrap_or_else(PoisonError::into_inner)
        {
            hook(session);
        }
        Ok(())
    }

    async fn write_chunked(
        &self,
        session: &SessionId,
        bytes: &[u8],
        opts: ChunkedWriteOptions,
        meta: WriteMeta,
    ) -> Result<ChunkedWriteReport, TransportError> {
        let chunks = bytes.len().div_ceil(opts.chunk_size);
        self.write(session, bytes, meta).await?;
        Ok(ChunkedWriteReport {
            success: true,
            chunks,
            error: None,
        })
    }

    fn prompt_visible(&self, session: &SessionId) -> Option<bool> {
        self.prompt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .copied()
    }
}

#[derive(Default)]
struct MapRegistry {
    profiles: HashMap<SessionId, CapabilityProfile>,
}

impl CapabilityRegistry for MapRegistry {
    fn capabilities(&self, session: &SessionId) -> Option<CapabilityProfile> {
        self.profiles.get(session).cloned()
    }
}

#[derive(Default)]
struct NoopFocus {
    focused: StdMutex<Vec<FocusHandle>>,
    restored: StdMutex<Vec<FocusHandle>>,
}

#[async_trait]
impl FocusResolver for NoopFocus {
    async fn locate(&self, session: &SessionId) -> Option<FocusHandle> {
        Some(FocusHandle(format!("target:{session}")))
    }

    async fn focus(&self, handle: &FocusHandle) -> bool {
        self.focused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.clone());
        true
    }

    async fn dispatch_submit_keys(&self, _handle: &FocusHandle) -> Result<(), TransportError> {
        Ok(())
    }

    async fn host_focus(&self) -> Option<FocusHandle> {
        Some(FocusHandle("host".to_string()))
    }

    async fn restore(&self, handle: FocusHandle) {
        self.restored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}

#[derive(Default)]
struct RecordingSink {
    events: StdMutex<Vec<TraceEvent>>,
}

impl EventSink for RecordingSink {
    fn emit(&self, event: TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[derive(Default)]
struct StuckRecorder {
    sessions: StdMutex<Vec<SessionId>>,
}

impl StuckSignal for StuckRecorder {
    fn mark_potentially_stuck(&self, session: &SessionId) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session.clone());
    }
}

fn pty_profile() -> CapabilityProfile {
    CapabilityProfile {
        mode: SessionMode::Pty,
        submit_method: SubmitMethod::CarriageReturn,
        bypass_global_lock: false,
        apply_compaction_gate: false,
        requires_focus_for_submit: false,
        submit_delay_ms: 50,
        sanitize_multiline: false,
        clear_line_before_write: false,
        use_chunked_write: false,
        home_reset_before_write: false,
        verify_submit_accepted: true,
        defer_submit_while_pane_active: false,
        typing_guard_when_bypassing: false,
    }
}

struct Harness {
    controller: InjectionController,
    transport: Arc<ScriptedTransport>,
    sink: Arc<RecordingSink>,
    stuck: Arc<StuckRecorder>,
}

fn harness(profiles: Vec<(SessionId, CapabilityProfile)>, config: EngineConfig) -> Harness {
    let transport = Arc::new(ScriptedTransport::default());
    let sink = Arc::new(RecordingSink::default());
    let stuck = Arc::new(StuckRecorder::default());
    let registry = MapRegistry {
        profiles: profiles.into_iter().collect(),
    };
    let controller = InjectionController::new(
        config,
        Collaborators {
            transport: transport.clone(),
            registry: Arc::new(registry),
            focus: Arc::new(NoopFocus::default()),
            composer: None,
            stuck: Some(stuck.clone()),
            sink: Some(sink.clone()),
        },
    );
    Harness {
        controller,
        transport,
        sink,
        stuck,
    }
}

#[tokio::test(start_paused = true)]
async fn end_to_end_prompt_transition() {
    let session = SessionId::from("pane-1");
    let mut profile = pty_profile();
    profile.requires_focus_for_submit = true;
    profile.clear_line_before_write = true;
    let h = harness(vec![(session.clone(), profile)], EngineConfig::default());

    h.transport.set_prompt(&session, true);
    let transport = h.transport.clone();
    h.transport.set_on_submit(move |session| transport.set_prompt(session, false));

    let rx = h
        .controller
        .send(&session, "run tests", SendOptions::default());
    let result = rx.await.expect("delivery resolves");

    assert!(result.success);
    assert!(result.verified);
    assert_eq!(result.signal, DeliverySignal::PromptTransition);

    let writes = h.transport.recorded();
    let intents: Vec<Option<WriteIntent>> = writes.iter().map(|w| w.intent).collect();
    assert_eq!(
        intents,
        [
            Some(WriteIntent::ClearLine),
            Some(WriteIntent::Payload),
            Some(WriteIntent::Submit),
        ],
    );
    assert_eq!(writes[1].bytes, b"run tests");
    assert_eq!(writes[2].bytes, b"\r");
    assert!(writes.iter().all(|w| w.session == session));
}

#[tokio::test(start_paused = true)]
async fn output_transition_verifies_when_prompt_is_steady() {
    let session = SessionId::from("pane-2");
    let h = harness(
        vec![(session.clone(), pty_profile())],
        EngineConfig::default(),
    );

    h.transport.set_prompt(&session, false);
    let feed = h.controller.activity();
    let observed = session.clone();
    h.transport
        .set_on_submit(move |_session| feed.record_output(&observed));

    let result = h
        .controller
        .send(&session, "echo hello", SendOptions::default())
        .await
        .expect("delivery resolves");

    assert!(result.success);
    assert!(result.verified);
    assert_eq!(result.signal, DeliverySignal::OutputTransition);
}

#[tokio::test(start_paused = true)]
async fn probe_unavailable_degrades_to_trust() {
    let session = SessionId::from("pane-3");
    let h = harness(
        vec![(session.clone(), pty_profile())],
        EngineConfig::default(),
    );
    // No prompt entry scripted: the probe has no readable state.

    let result = h
        .controller
        .send(&session, "bootstrap", SendOptions::default())
        .await
        .expect("delivery resolves");

    assert!(result.success);
    assert!(!result.verified);
    assert_eq!(result.signal, DeliverySignal::PromptProbeUnavailable);
}

#[tokio::test(start_paused = true)]
async fn verification_exhaustion_flags_stuck_session() {
    let session = SessionId::from("pane-4");
    let h = harness(
        vec![(session.clone(), pty_profile())],
        EngineConfig::default(),
    );
    // Prompt stays visible and output never resumes: no acceptance signal.
    h.transport.set_prompt(&session, true);

    let result = h
        .controller
        .send(&session, "stalled command", SendOptions::default())
        .await
        .expect("delivery resolves");

    assert!(!result.success);
    assert_eq!(result.reason, Some(FailureReason::SubmitNotAccepted));

    let submits = h
        .transport
        .recorded()
        .iter()
        .filter(|w| w.intent == Some(WriteIntent::Submit))
        .count();
    assert_eq!(
        submits,
        EngineConfig::default().verify.max_attempts as usize,
        "every attempt re-submitted",
    );
    let stuck = h.stuck.sessions.lock().unwrap_or_else(PoisonError::into_inner);
    assert_eq!(stuck.as_slice(), [session]);
}

#[tokio::test(start_paused = true)]
async fn skipped_verification_resolves_immediately() {
    let session = SessionId::from("pane-5");
    let h = harness(
        vec![(session.clone(), pty_profile())],
        EngineConfig::default(),
    );
    h.transport.set_prompt(&session, true);

    let mut options = SendOptions::default();
    options.overrides.verify_submit_accepted = Some(false);
    let result = h
        .controller
        .send(&session, "startup banner", options)
        .await
        .expect("delivery resolves");

    assert!(result.success);
    assert!(!result.verified);
    assert_eq!(result.signal, DeliverySignal::AcceptedUnverified);
}

#[tokio::test(start_paused = true)]
async fn teardown_resolves_all_pending_items() {
    let session = SessionId::from("pane-6");
    let h = harness(
        vec![(session.clone(), pty_profile())],
        EngineConfig::default(),
    );
    // Hold the gate closed so both items stay queued.
    h.controller.activity().set_composing(true);

    let first = h.controller.send(&session, "one", SendOptions::default());
    let second = h.controller.send(&session, "two", SendOptions::default());
    tokio::task::yield_now().await;

    let dropped = h
        .controller
        .clear_session(&session, FailureReason::PaneTeardown);
    assert_eq!(dropped, 2);
    assert_eq!(h.controller.queue_depth(&session), 0);

    for rx in [first, second] {
        let result = rx.await.expect("teardown resolves pending item");
        assert!(!result.success);
        assert_eq!(result.reason, Some(FailureReason::PaneTeardown));
    }
}

#[tokio::test(start_paused = true)]
async fn global_lock_serializes_locked_sessions() {
    let left = SessionId::from("pane-7");
    let right = SessionId::from("pane-8");
    let h = harness(
        vec![
            (left.clone(), pty_profile()),
            (right.clone(), pty_profile()),
        ],
        EngineConfig::default(),
    );
    // Slow payload writes widen the race window; the permit must still keep
    // deliveries past lock-acquired strictly serial across sessions.
    h.transport.set_slow_payload_writes(true);
    let feed = h.controller.activity();
    h.transport.set_on_submit(move |session| feed.record_output(session));

    let lhs = h.controller.send(&left, "left command", SendOptions::default());
    let rhs = h.controller.send(&right, "right command", SendOptions::default());
    let (lhs, rhs) = tokio::join!(lhs, rhs);
    assert!(lhs.expect("left resolves").success);
    assert!(rhs.expect("right resolves").success);

    assert_eq!(
        h.transport.max_payload_concurrency.load(Ordering::SeqCst),
        1,
        "at most one locked delivery past lock-acquired at a time",
    );
}

struct HeaderComposer;

impl PromptComposer for HeaderComposer {
    fn is_exec_kind(&self, _session: &SessionId) -> bool {
        true
    }

    fn build_exec_prompt(&self, session: &SessionId, text: &str) -> String {
        format!("[{session}] {text}")
    }
}

#[tokio::test(start_paused = true)]
async fn exec_prompt_header_is_composed_before_write() {
    let session = SessionId::from("pane-11");
    let transport = Arc::new(ScriptedTransport::default());
    let registry = MapRegistry {
        profiles: [(session.clone(), pty_profile())].into_iter().collect(),
    };
    let controller = InjectionController::new(
        EngineConfig::default(),
        Collaborators {
            transport: transport.clone(),
            registry: Arc::new(registry),
            focus: Arc::new(NoopFocus::default()),
            composer: Some(Arc::new(HeaderComposer)),
            stuck: None,
            sink: None,
        },
    );

    let mut options = SendOptions::default();
    options.compose_exec_prompt = true;
    let result = controller
        .send(&session, "run checks", options)
        .await
        .expect("delivery resolves");
    assert!(result.success);

    let payload = transport
        .recorded()
        .into_iter()
        .find(|w| w.intent == Some(WriteIntent::Payload))
        .expect("payload write recorded");
    assert_eq!(payload.bytes, b"[pane-11] run checks");
}

#[tokio::test(start_paused = true)]
async fn oversized_payload_goes_out_chunked() {
    let session = SessionId::from("pane-12");
    let mut profile = pty_profile();
    profile.use_chunked_write = true;
    let h = harness(vec![(session.clone(), profile)], EngineConfig::default());

    let config = EngineConfig::default();
    let text = "x".repeat(config.write.chunk_threshold_bytes + 1);
    let result = h
        .controller
        .send(&session, text.clone(), SendOptions::default())
        .await
        .expect("delivery resolves");
    assert!(result.success);

    let payload = h
        .transport
        .recorded()
        .into_iter()
        .find(|w| w.intent == Some(WriteIntent::Payload))
        .expect("payload write recorded");
    assert_eq!(payload.bytes.len(), text.len());
}

#[tokio::test(start_paused = true)]
async fn write_failure_is_classified_not_thrown() {
    let session = SessionId::from("pane-10");
    let h = harness(
        vec![(session.clone(), pty_profile())],
        EngineConfig::default(),
    );
    h.transport.fail_payload_writes.store(true, Ordering::SeqCst);

    let result = h
        .controller
        .send(&session, "doomed", SendOptions::default())
        .await
        .expect("delivery resolves");

    assert!(!result.success);
    assert_eq!(result.reason, Some(FailureReason::WriteFailed));

    let events = h.sink.events.lock().unwrap_or_else(PoisonError::into_inner).clone();
    let terminal = events.last().expect("terminal event");
    assert_eq!(terminal.kind, TraceEventKind::Failed);
    assert_eq!(terminal.payload["reason"], serde_json::json!("write_failed"));
}

#[tokio::test(start_paused = true)]
async fn trace_chain_is_causally_linked() {
    let session = SessionId::from("pane-9");
    let h = harness(
        vec![(session.clone(), pty_profile())],
        EngineConfig::default(),
    );
    h.transport.set_prompt(&session, true);
    let transport = h.transport.clone();
    h.transport.set_on_submit(move |session| transport.set_prompt(session, false));

    let result = h
        .controller
        .send(&session, "trace me", SendOptions::default())
        .await
        .expect("delivery resolves");
    assert!(result.verified);

    let events = h.sink.events.lock().unwrap_or_else(PoisonError::into_inner).clone();
    let kinds: Vec<TraceEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        [
            TraceEventKind::Requested,
            TraceEventKind::Queued,
            TraceEventKind::DepthChanged,
            TraceEventKind::DepthChanged,
            TraceEventKind::ModeSelected,
            TraceEventKind::Applied,
            TraceEventKind::SubmitRequested,
            TraceEventKind::SubmitSent,
            TraceEventKind::Verified,
        ],
    );

    let correlation = events[0].correlation_id;
    assert!(events.iter().all(|e| e.correlation_id == correlation));
    assert_eq!(events[0].causation_id, None);
    // The item's chain: requested -> queued -> depth(dequeue) -> mode ...
    // The enqueue-side depth event branches off the queued event.
    assert_eq!(events[1].causation_id, Some(events[0].event_id));
    assert_eq!(events[2].causation_id, Some(events[1].event_id));
    assert_eq!(events[3].causation_id, Some(events[1].event_id));
    assert_eq!(events[4].causation_id, Some(events[3].event_id));
    assert_eq!(events[5].causation_id, Some(events[4].event_id));
    assert_eq!(events[6].causation_id, Some(events[5].event_id));
    assert_eq!(events[7].causation_id, Some(events[6].event_id));
    assert_eq!(events[8].causation_id, Some(events[7].event_id));
}

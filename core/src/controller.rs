use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use paneflow_protocol::DeliveryResult;
use paneflow_protocol::FailureReason;
use paneflow_protocol::SessionId;
use paneflow_protocol::TraceEvent;
use paneflow_protocol::TraceEventKind;
use serde_json::json;
use tokio::sync::Notify;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backoff::BlockSuppressor;
use crate::backoff::DeferBackoff;
use crate::capability::resolve_profile;
use crate::config::EngineConfig;
use crate::delivery::Pipeline;
use crate::gate::ActivityFeed;
use crate::gate::GateBlock;
use crate::gate::GateState;
use crate::gate::GateVerdict;
use crate::queue::QueueItem;
use crate::queue::SendOverrides;
use crate::queue::SessionQueue;
use crate::trace::EventTracer;
use crate::trace::TraceContext;
use crate::transport::CapabilityRegistry;
use crate::transport::EventSink;
use crate::transport::FocusResolver;
use crate::transport::PromptComposer;
use crate::transport::StuckSignal;
use crate::transport::Transport;

/// Injected collaborator handles. The engine drives these; it owns none of
/// them.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<dyn CapabilityRegistry>,
    pub focus: Arc<dyn FocusResolver>,
    pub composer: Option<Arc<dyn PromptComposer>>,
    pub stuck: Option<Arc<dyn StuckSignal>>,
    pub sink: Option<Arc<dyn EventSink>>,
}

/// Per-send options and overrides.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: bool,
    /// User-originated send: skips idle-style gating, waits only on the
    /// global lock at a tight interval.
    pub immediate: bool,
    pub overrides: SendOverrides,
    /// Run the text through the injected prompt composer when the session
    /// is of an exec kind.
    pub compose_exec_prompt: bool,
    /// Continue a caller-supplied trace chain instead of minting a fresh
    /// correlation id.
    pub trace: Option<TraceContext>,
}

struct SessionEntry {
    queue: StdMutex<SessionQueue>,
    notify: Notify,
    worker_spawned: AtomicBool,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            queue: StdMutex::new(SessionQueue::default()),
            notify: Notify::new(),
            worker_spawned: AtomicBool::new(false),
        }
    }
}

struct ControllerInner {
    config: EngineConfig,
    gate: Arc<GateState>,
    tracer: EventTracer,
    pipeline: Pipeline,
    registry: Arc<dyn CapabilityRegistry>,
    composer: Option<Arc<dyn PromptComposer>>,
    sessions: StdMutex<HashMap<SessionId, Arc<SessionEntry>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl ControllerInner {
    fn session_entry(&self, session: &SessionId) -> Arc<SessionEntry> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            sessions
                .entry(session.clone())
                .or_insert_with(|| Arc::new(SessionEntry::new())),
        )
    }

    fn ensure_worker(self: &Arc<Self>, session: &SessionId, entry: &Arc<SessionEntry>) {
        if entry.worker_spawned.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = tokio::spawn(run_worker(
            Arc::clone(self),
            session.clone(),
            Arc::clone(entry),
        ));
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}

/// Single logical controller fronting N per-session queues. One instance
/// per process; sessions sharing host input focus are serialized through
/// its global injection lock.
pub struct InjectionController {
    inner: Arc<ControllerInner>,
}

impl InjectionController {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let gate = Arc::new(GateState::default());
        let pipeline = Pipeline {
            transport: collaborators.transport,
            focus: collaborators.focus,
            gate: Arc::clone(&gate),
            stuck: collaborators.stuck,
            config: config.clone(),
        };
        Self {
            inner: Arc::new(ControllerInner {
                tracer: EventTracer::new(collaborators.sink),
                pipeline,
                registry: collaborators.registry,
                composer: collaborators.composer,
                gate,
                config,
                sessions: StdMutex::new(HashMap::new()),
                workers: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Queue a command for delivery into `session`. The returned channel
    /// resolves exactly once with the delivery outcome; every enqueued
    /// message eventually resolves, including capacity evictions and
    /// teardown.
    pub fn send(
        &self,
        session: &SessionId,
        text: impl Into<String>,
        options: SendOptions,
    ) -> oneshot::Receiver<DeliveryResult> {
        let mut text = text.into();
        if options.compose_exec_prompt
            && let Some(composer) = &self.inner.composer
            && composer.is_exec_kind(session)
        {
            text = composer.build_exec_prompt(session, &text);
        }

        let mut ctx = options.trace.unwrap_or_else(TraceContext::root);
        self.inner.tracer.emit(
            &mut ctx,
            TraceEventKind::Requested,
            session,
            json!({
                "bytes": text.len(),
                "priority": options.priority,
                "immediate": options.immediate,
            }),
        );
        self.inner.tracer.emit(
            &mut ctx,
            TraceEventKind::Queued,
            session,
            json!({"priority": options.priority}),
        );

        let (completion_tx, completion_rx) = oneshot::channel();
        let item = QueueItem::new(
            text,
            options.priority,
            options.immediate,
            options.overrides,
            ctx.clone(),
            completion_tx,
        );

        let entry = self.inner.session_entry(session);
        let (evicted, depth, bytes) = {
            let mut queue = entry.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = queue.enqueue(
                item,
                self.inner.config.queue.max_items,
                self.inner.config.queue.max_bytes,
            );
            (evicted, queue.len(), queue.byte_size())
        };
        for victim in evicted {
            warn!(session_id = %session, "backlog over capacity, evicting oldest item");
            let mut victim_ctx = victim.resolve(DeliveryResult::failed(FailureReason::QueueCapacity));
            self.inner.tracer.emit(
                &mut victim_ctx,
                TraceEventKind::Dropped,
                session,
                json!({"reason": FailureReason::QueueCapacity}),
            );
        }
        self.inner.tracer.emit(
            &mut ctx,
            TraceEventKind::DepthChanged,
            session,
            json!({"depth": depth, "bytes": bytes}),
        );

        self.inner.ensure_worker(session, &entry);
        entry.notify.notify_one();
        completion_rx
    }

    /// Teardown cancellation path: resolve every queued item for `session`
    /// with the given reason and leave the queue empty.
    pub fn clear_session(&self, session: &SessionId, reason: FailureReason) -> usize {
        let entry = self.inner.session_entry(session);
        let traces = {
            let mut queue = entry.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.clear(reason)
        };
        let dropped = traces.len();
        for mut ctx in traces {
            self.inner.tracer.emit(
                &mut ctx,
                TraceEventKind::Cleared,
                session,
                json!({"reason": reason}),
            );
        }
        if dropped > 0 {
            info!(session_id = %session, dropped, %reason, "cleared session queue");
        }
        dropped
    }

    pub fn queue_depth(&self, session: &SessionId) -> usize {
        let entry = self.inner.session_entry(session);
        let queue = entry.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.len()
    }

    /// Write surface for the host's output/keystroke feed.
    pub fn activity(&self) -> ActivityFeed {
        ActivityFeed::new(Arc::clone(&self.inner.gate))
    }

    /// In-process subscription to the lifecycle trace.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TraceEvent> {
        self.inner.tracer.subscribe()
    }
}

impl Drop for InjectionController {
    fn drop(&mut self) {
        let workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in workers.iter() {
            handle.abort();
        }
    }
}

/// Per-session delivery loop: park until work arrives, evaluate gates with
/// backoff while blocked, then run the pipeline under the ceiling safety
/// timer and resolve the item.
async fn run_worker(inner: Arc<ControllerInner>, session: SessionId, entry: Arc<SessionEntry>) {
    let mut backoff = DeferBackoff::new(&inner.config.backoff);
    let mut suppressor = BlockSuppressor::default();

    loop {
        loop {
            let empty = {
                let queue = entry.queue.lock().unwrap_or_else(PoisonError::into_inner);
                queue.is_empty()
            };
            if !empty {
                break;
            }
            backoff.reset();
            entry.notify.notified().await;
        }

        let profile = resolve_profile(inner.registry.as_ref(), &session);
        let immediate = {
            let queue = entry.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.head_immediate().unwrap_or(false)
        };

        let verdict = inner.gate.evaluate(
            &session,
            profile.bypass_global_lock,
            profile.apply_compaction_gate,
            profile.typing_guard_when_bypassing,
            immediate,
            &inner.config.gates,
        );
        if let GateVerdict::Blocked(reason) = verdict {
            defer(&inner, &session, reason, immediate, &mut backoff, &mut suppressor).await;
            continue;
        }

        // Claim the controller-wide lock unless the profile bypasses it; a
        // lost race with another session is just another deferral.
        let permit = if profile.bypass_global_lock {
            None
        } else {
            match inner.gate.try_acquire_injection() {
                Some(permit) => Some(permit),
                None => {
                    defer(
                        &inner,
                        &session,
                        GateBlock::InjectionInFlight,
                        immediate,
                        &mut backoff,
                        &mut suppressor,
                    )
                    .await;
                    continue;
                }
            }
        };

        if let Some(summary) = suppressor.observe_clear() {
            info!(
                session_id = %session,
                reason = %summary.reason,
                repeats = summary.repeats,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "gate cleared after repeated blocks"
            );
        }
        backoff.reset();

        let item = {
            let mut queue = entry.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.dequeue_next()
        };
        let Some(mut item) = item else {
            drop(permit);
            continue;
        };
        {
            let (depth, bytes) = {
                let queue = entry.queue.lock().unwrap_or_else(PoisonError::into_inner);
                (queue.len(), queue.byte_size())
            };
            inner.tracer.emit(
                &mut item.trace,
                TraceEventKind::DepthChanged,
                &session,
                json!({
                    "depth": depth,
                    "bytes": bytes,
                    "waited_ms": item.enqueued_at.elapsed().as_millis() as u64,
                }),
            );
        }

        let ceiling = Duration::from_millis(inner.config.safety_ceiling_ms);
        let outcome = timeout(
            ceiling,
            inner
                .pipeline
                .deliver(&inner.tracer, &session, &profile, &mut item),
        )
        .await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                // The message may have been delivered; hanging here would
                // starve every other bypass-free session, so resolve as
                // unverified success and move on.
                warn!(
                    session_id = %session,
                    ceiling_ms = inner.config.safety_ceiling_ms,
                    "delivery hit the ceiling safety timer"
                );
                DeliveryResult::timed_out()
            }
        };
        drop(permit);

        let terminal_kind = match (&result.reason, result.success) {
            (Some(FailureReason::Timeout), _) => TraceEventKind::Timeout,
            (_, true) => TraceEventKind::Verified,
            (_, false) => TraceEventKind::Failed,
        };
        let payload = json!({
            "success": result.success,
            "verified": result.verified,
            "signal": result.signal,
            "reason": result.reason,
        });
        debug!(session_id = %session, success = result.success, verified = result.verified, "delivery resolved");
        let mut ctx = item.resolve(result);
        inner.tracer.emit(&mut ctx, terminal_kind, &session, payload);
    }
}

async fn defer(
    inner: &Arc<ControllerInner>,
    session: &SessionId,
    reason: GateBlock,
    immediate: bool,
    backoff: &mut DeferBackoff,
    suppressor: &mut BlockSuppressor,
) {
    let (verbose, summary) = suppressor.observe_block(reason);
    if let Some(summary) = summary {
        info!(
            session_id = %session,
            reason = %summary.reason,
            repeats = summary.repeats,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "gate block reason changed after repeated blocks"
        );
    }
    if verbose {
        debug!(session_id = %session, %reason, "delivery gated, deferring");
    }
    let delay = if immediate {
        Duration::from_millis(inner.config.backoff.immediate_poll_ms)
    } else {
        backoff.next_delay()
    };
    sleep(delay).await;
}

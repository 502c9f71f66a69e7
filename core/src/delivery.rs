use std::sync::Arc;
use std::time::Duration;

use paneflow_protocol::CapabilityProfile;
use paneflow_protocol::DeliveryResult;
use paneflow_protocol::DeliverySignal;
use paneflow_protocol::FailureReason;
use paneflow_protocol::SessionId;
use paneflow_protocol::TraceEventKind;
use serde_json::json;
use tokio::time::Instant;
use tokio::time::sleep;
use tracing::warn;

use crate::capability::SubmitStrategy;
use crate::config::EngineConfig;
use crate::config::SettleConfig;
use crate::gate::GateState;
use crate::queue::QueueItem;
use crate::trace::EventTracer;
use crate::trace::TraceContext;
use crate::transport::ChunkedWriteOptions;
use crate::transport::FocusHandle;
use crate::transport::FocusResolver;
use crate::transport::StuckSignal;
use crate::transport::Transport;
use crate::transport::WriteIntent;
use crate::transport::WriteMeta;
use crate::verify;

/// Erase-line then return to column zero; keeps a half-typed line from
/// polluting the injected command.
const CLEAR_LINE_SEQ: &[u8] = b"\r\x1b[2K";
/// Start-of-line for line-oriented input readers.
const HOME_RESET_SEQ: &[u8] = b"\x01";
const ACTIVE_OUTPUT_POLL: Duration = Duration::from_millis(50);

/// Executes the write protocol for one dequeued item: optional line-clear
/// and cursor-reset, chunked-or-atomic payload write, size-scaled settle
/// delay, then submission and verification.
pub(crate) struct Pipeline {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) focus: Arc<dyn FocusResolver>,
    pub(crate) gate: Arc<GateState>,
    pub(crate) stuck: Option<Arc<dyn StuckSignal>>,
    pub(crate) config: EngineConfig,
}

impl Pipeline {
    pub(crate) async fn deliver(
        &self,
        tracer: &EventTracer,
        session: &SessionId,
        profile: &CapabilityProfile,
        item: &mut QueueItem,
    ) -> DeliveryResult {
        let strategy = SubmitStrategy::for_profile(profile);
        let overrides = item.overrides;
        let verify_on = overrides.verify_submit_accepted.unwrap_or(
            // Startup injections are safe to repeat, so a false negative
            // costs more than a false positive; default their verification
            // off unless the caller overrode it back on.
            !overrides.startup_injection && profile.verify_submit_accepted,
        );
        tracer.emit(
            &mut item.trace,
            TraceEventKind::ModeSelected,
            session,
            json!({
                "mode": profile.mode,
                "submit_method": strategy.label(),
                "bypass_global_lock": profile.bypass_global_lock,
                "verify": verify_on,
            }),
        );

        if profile.defer_submit_while_pane_active {
            self.wait_for_quiet_pane(session).await;
        }

        // A trusted-keystroke session with no locatable input target cannot
        // possibly submit; fail before touching the channel.
        if strategy == SubmitStrategy::TrustedKeys
            && self.focus.locate(session).await.is_none()
        {
            return DeliveryResult::failed(FailureReason::MissingTarget);
        }

        if profile.clear_line_before_write
            && let Err(error) = self
                .transport
                .write(session, CLEAR_LINE_SEQ, WriteMeta::for_intent(WriteIntent::ClearLine))
                .await
        {
            warn!(session_id = %session, %error, "line-clear write failed, continuing");
        }

        let mut payload_meta = WriteMeta::for_intent(WriteIntent::Payload);
        if profile.home_reset_before_write {
            if self.transport.supports_atomic_prefix() {
                payload_meta.prefix = Some(HOME_RESET_SEQ.to_vec());
            } else if let Err(error) = self
                .transport
                .write(session, HOME_RESET_SEQ, WriteMeta::for_intent(WriteIntent::HomeReset))
                .await
            {
                warn!(session_id = %session, %error, "cursor-reset write failed, continuing");
            }
        }

        let mut text = item.text.clone();
        if profile.sanitize_multiline {
            let sanitized = sanitize_multiline(&text);
            if sanitized != text {
                tracer.emit(
                    &mut item.trace,
                    TraceEventKind::TransformApplied,
                    session,
                    json!({
                        "transform": "sanitize_multiline",
                        "from_bytes": text.len(),
                        "to_bytes": sanitized.len(),
                    }),
                );
                text = sanitized;
            }
        }

        let bytes = text.as_bytes();
        let chunked = profile.use_chunked_write && bytes.len() > self.config.write.chunk_threshold_bytes;
        if chunked {
            let opts = ChunkedWriteOptions {
                chunk_size: self.config.write.chunk_size_bytes,
                yield_every_chunks: self.config.write.yield_every_chunks,
            };
            match self
                .transport
                .write_chunked(session, bytes, opts, payload_meta)
                .await
            {
                Ok(report) if report.success => {
                    tracer.emit(
                        &mut item.trace,
                        TraceEventKind::Applied,
                        session,
                        json!({"bytes": bytes.len(), "chunked": true, "chunks": report.chunks}),
                    );
                }
                Ok(report) => {
                    warn!(
                        session_id = %session,
                        chunks = report.chunks,
                        error = report.error.as_deref().unwrap_or("unspecified"),
                        "chunked write reported failure"
                    );
                    return DeliveryResult::failed(FailureReason::WriteFailed);
                }
                Err(error) => {
                    warn!(session_id = %session, %error, "chunked write failed");
                    return DeliveryResult::failed(FailureReason::WriteFailed);
                }
            }
        } else {
            if let Err(error) = self.transport.write(session, bytes, payload_meta).await {
                warn!(session_id = %session, %error, "payload write failed");
                return DeliveryResult::failed(FailureReason::WriteFailed);
            }
            tracer.emit(
                &mut item.trace,
                TraceEventKind::Applied,
                session,
                json!({"bytes": bytes.len(), "chunked": false}),
            );
        }

        sleep(settle_delay(
            profile.submit_delay_ms,
            bytes.len(),
            &self.config.settle,
        ))
        .await;

        if !verify_on {
            return match self
                .submit_phase(tracer, &mut item.trace, session, profile, strategy, 1)
                .await
            {
                Ok(()) => DeliveryResult::unverified(DeliverySignal::AcceptedUnverified),
                Err(reason) => DeliveryResult::failed(reason),
            };
        }

        verify::run_verification(
            self,
            tracer,
            &mut item.trace,
            session,
            profile,
            strategy,
            overrides,
        )
        .await
    }

    /// Focus dance, capability-specific submit, deferred focus restore.
    /// Re-run as a unit by verification retries.
    pub(crate) async fn submit_phase(
        &self,
        tracer: &EventTracer,
        ctx: &mut TraceContext,
        session: &SessionId,
        profile: &CapabilityProfile,
        strategy: SubmitStrategy,
        attempt: u32,
    ) -> Result<(), FailureReason> {
        tracer.emit(
            ctx,
            TraceEventKind::SubmitRequested,
            session,
            json!({"attempt": attempt, "method": strategy.label()}),
        );

        match strategy {
            SubmitStrategy::TrustedKeys => {
                // The target resolved during the write phase; gone now means
                // it vanished mid-delay. Fatal, no retry.
                let Some(handle) = self.focus.locate(session).await else {
                    return Err(FailureReason::TargetDisappeared);
                };
                let previous = self.focus.host_focus().await;
                self.confirm_focus(session, &handle).await;
                if let Err(error) = self.focus.dispatch_submit_keys(&handle).await {
                    warn!(session_id = %session, %error, "trusted submit dispatch failed");
                    return Err(FailureReason::SubmitFailed);
                }
                tracer.emit(ctx, TraceEventKind::SubmitSent, session, json!({"attempt": attempt}));
                self.restore_focus_later(previous);
            }
            SubmitStrategy::DirectBytes(bytes) => {
                let mut previous = None;
                if profile.requires_focus_for_submit {
                    if let Some(handle) = self.focus.locate(session).await {
                        previous = self.focus.host_focus().await;
                        self.confirm_focus(session, &handle).await;
                    } else {
                        warn!(session_id = %session, "focus target unresolvable, submitting without focus");
                    }
                }
                if let Err(error) = self
                    .transport
                    .write(session, bytes, WriteMeta::for_intent(WriteIntent::Submit))
                    .await
                {
                    warn!(session_id = %session, %error, "submit byte write failed");
                    return Err(FailureReason::SubmitFailed);
                }
                tracer.emit(ctx, TraceEventKind::SubmitSent, session, json!({"attempt": attempt}));
                self.restore_focus_later(previous);
            }
        }
        Ok(())
    }

    /// Bounded focus confirmation. Losing focus is recoverable, losing the
    /// message is not, so exhaustion logs and proceeds.
    async fn confirm_focus(&self, session: &SessionId, handle: &FocusHandle) {
        let attempts = self.config.focus.retry_attempts.max(1);
        for attempt in 0..attempts {
            if self.focus.focus(handle).await {
                return;
            }
            if attempt + 1 < attempts {
                sleep(Duration::from_millis(self.config.focus.retry_delay_ms)).await;
            }
        }
        warn!(session_id = %session, attempts, "focus not confirmed, proceeding anyway");
    }

    /// Restore prior host focus on the next idle tick so verification
    /// retries are not fighting a just-restored focus.
    fn restore_focus_later(&self, previous: Option<FocusHandle>) {
        let Some(previous) = previous else {
            return;
        };
        let focus = Arc::clone(&self.focus);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            focus.restore(previous).await;
        });
    }

    /// Wait out an actively printing pane, bounded; a pane that never goes
    /// quiet gets the message anyway rather than starving it.
    async fn wait_for_quiet_pane(&self, session: &SessionId) {
        let window = Duration::from_millis(self.config.gates.active_output_window_ms);
        let deadline =
            Instant::now() + Duration::from_millis(self.config.gates.active_defer_max_wait_ms);
        loop {
            match self.gate.last_output_at(session) {
                Some(at) if at.elapsed() < window => {}
                _ => return,
            }
            if Instant::now() >= deadline {
                warn!(session_id = %session, "pane still active past defer bound, proceeding");
                return;
            }
            sleep(ACTIVE_OUTPUT_POLL).await;
        }
    }
}

/// Collapse embedded line breaks so a line-oriented reader cannot treat
/// them as a premature submit.
pub(crate) fn sanitize_multiline(text: &str) -> String {
    text.replace("\r\n", " ")
        .replace(['\n', '\r'], " ")
        .trim_end()
        .to_string()
}

/// Settle time before submission: the profile's base plus a capped,
/// size-proportional extra for payloads past the scale start.
pub(crate) fn settle_delay(base_ms: u64, payload_bytes: usize, config: &SettleConfig) -> Duration {
    let extra_bytes = payload_bytes.saturating_sub(config.scale_start_bytes);
    let extra_ms = if config.bytes_per_ms == 0 {
        0
    } else {
        extra_bytes.div_ceil(config.bytes_per_ms) as u64
    };
    Duration::from_millis(base_ms + extra_ms.min(config.max_extra_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_collapses_breaks_and_trims() {
        assert_eq!(sanitize_multiline("run\r\nall\ntests\n"), "run all tests");
        assert_eq!(sanitize_multiline("plain"), "plain");
    }

    #[test]
    fn settle_delay_scales_with_payload() {
        let config = SettleConfig {
            scale_start_bytes: 1_024,
            bytes_per_ms: 64,
            max_extra_ms: 1_500,
        };
        assert_eq!(settle_delay(150, 100, &config), Duration::from_millis(150));
        assert_eq!(
            settle_delay(150, 1_024 + 640, &config),
            Duration::from_millis(160),
        );
        // Capped: a huge payload only ever buys max_extra_ms.
        assert_eq!(
            settle_delay(150, 10 * 1_024 * 1_024, &config),
            Duration::from_millis(1_650),
        );
    }
}

use std::time::Duration;

use paneflow_protocol::CapabilityProfile;
use paneflow_protocol::DeliveryResult;
use paneflow_protocol::DeliverySignal;
use paneflow_protocol::FailureReason;
use paneflow_protocol::SessionId;
use tokio::time::Instant;
use tokio::time::sleep;
use tracing::debug;
use tracing::warn;

use crate::capability::SubmitStrategy;
use crate::delivery::Pipeline;
use crate::queue::SendOverrides;
use crate::trace::EventTracer;
use crate::trace::TraceContext;

/// State captured before the first submit attempt; acceptance is inferred
/// from movement relative to this.
#[derive(Debug, Clone, Copy)]
struct Baseline {
    output_at: Option<Instant>,
    prompt_visible: Option<bool>,
}

/// Submit, then poll for an acceptance signal within the verification
/// window; retry submission a bounded number of times with fixed backoff.
/// The transport has no ACK, so this is the whole acceptance story.
pub(crate) async fn run_verification(
    pipeline: &Pipeline,
    tracer: &EventTracer,
    ctx: &mut TraceContext,
    session: &SessionId,
    profile: &CapabilityProfile,
    strategy: SubmitStrategy,
    overrides: SendOverrides,
) -> DeliveryResult {
    let config = &pipeline.config.verify;
    let baseline = Baseline {
        output_at: pipeline.gate.last_output_at(session),
        prompt_visible: pipeline.transport.prompt_visible(session),
    };

    for attempt in 1..=config.max_attempts {
        if let Err(reason) = pipeline
            .submit_phase(tracer, ctx, session, profile, strategy, attempt)
            .await
        {
            return DeliveryResult::failed(reason);
        }

        if baseline.prompt_visible.is_none() && !overrides.accept_output_transition_only {
            // No readable state to poll; degrade to trust rather than
            // report a false failure.
            return DeliveryResult::unverified(DeliverySignal::PromptProbeUnavailable);
        }

        if let Some(signal) = poll_for_signal(
            pipeline,
            session,
            baseline,
            overrides.accept_output_transition_only,
        )
        .await
        {
            debug!(session_id = %session, attempt, signal = ?signal, "submission accepted");
            return DeliveryResult::verified(signal);
        }

        if attempt < config.max_attempts {
            debug!(session_id = %session, attempt, "no acceptance signal, retrying submit");
            sleep(Duration::from_millis(config.retry_backoff_ms)).await;
        }
    }

    warn!(
        session_id = %session,
        attempts = config.max_attempts,
        "verification exhausted with no acceptance signal"
    );
    if let Some(stuck) = &pipeline.stuck {
        stuck.mark_potentially_stuck(session);
    }
    if config.unverified_is_success {
        DeliveryResult::unverified(DeliverySignal::AcceptedUnverified)
    } else {
        DeliveryResult::failed(FailureReason::SubmitNotAccepted)
    }
}

async fn poll_for_signal(
    pipeline: &Pipeline,
    session: &SessionId,
    baseline: Baseline,
    output_transition_only: bool,
) -> Option<DeliverySignal> {
    let config = &pipeline.config.verify;
    let deadline = Instant::now() + Duration::from_millis(config.window_ms);
    loop {
        if !output_transition_only
            && baseline.prompt_visible == Some(true)
            && pipeline.transport.prompt_visible(session) == Some(false)
        {
            return Some(DeliverySignal::PromptTransition);
        }

        let advanced = match (baseline.output_at, pipeline.gate.last_output_at(session)) {
            (Some(before), Some(now)) => now > before,
            (None, Some(_)) => true,
            _ => false,
        };
        if advanced {
            return Some(DeliverySignal::OutputTransition);
        }

        if Instant::now() >= deadline {
            return None;
        }
        sleep(Duration::from_millis(config.poll_interval_ms)).await;
    }
}

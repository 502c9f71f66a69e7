use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Secondary evidence used to infer that a submission was accepted. The
/// transport has no acknowledgment of its own, so acceptance is read off
/// output resumption and prompt-line transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySignal {
    OutputTransition,
    PromptTransition,
    PromptProbeUnavailable,
    AcceptedUnverified,
    None,
}

/// Terminal classification for a delivery that did not fully succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    QueueCapacity,
    MissingTarget,
    WriteFailed,
    SubmitFailed,
    FocusFailed,
    TargetDisappeared,
    SubmitNotAccepted,
    Timeout,
    PaneTeardown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::QueueCapacity => "queue_capacity",
            Self::MissingTarget => "missing_target",
            Self::WriteFailed => "write_failed",
            Self::SubmitFailed => "submit_failed",
            Self::FocusFailed => "focus_failed",
            Self::TargetDisappeared => "target_disappeared",
            Self::SubmitNotAccepted => "submit_not_accepted",
            Self::Timeout => "timeout",
            Self::PaneTeardown => "pane_teardown",
        };
        write!(f, "{label}")
    }
}

/// Outcome handed to the sender's completion channel and the event trace.
/// Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub verified: bool,
    pub signal: DeliverySignal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl DeliveryResult {
    pub fn verified(signal: DeliverySignal) -> Self {
        Self {
            success: true,
            verified: true,
            signal,
            reason: None,
        }
    }

    pub fn unverified(signal: DeliverySignal) -> Self {
        Self {
            success: true,
            verified: false,
            signal,
            reason: None,
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            success: false,
            verified: false,
            signal: DeliverySignal::None,
            reason: Some(reason),
        }
    }

    /// The ceiling safety timer fired before a terminal result. The message
    /// may have been delivered, so this counts as unverified success rather
    /// than failure.
    pub fn timed_out() -> Self {
        Self {
            success: true,
            verified: false,
            signal: DeliverySignal::None,
            reason: Some(FailureReason::Timeout),
        }
    }
}

use async_trait::async_trait;
use paneflow_protocol::CapabilityProfile;
use paneflow_protocol::SessionId;
use paneflow_protocol::TraceEvent;

use crate::error::TransportError;

/// Why a write is being issued. Carried on every transport call so channel
/// implementations can log or police writes without parsing payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    ClearLine,
    HomeReset,
    Payload,
    Submit,
}

/// Metadata attached to a single transport write.
#[derive(Debug, Clone, Default)]
pub struct WriteMeta {
    pub intent: Option<WriteIntent>,
    /// Control bytes the transport should emit in the same write call as the
    /// payload, when it supports atomic prefixing.
    pub prefix: Option<Vec<u8>>,
}

impl WriteMeta {
    pub fn for_intent(intent: WriteIntent) -> Self {
        Self {
            intent: Some(intent),
            prefix: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkedWriteOptions {
    pub chunk_size: usize,
    /// Yield to the scheduler after this many chunks; 0 disables yielding.
    pub yield_every_chunks: usize,
}

/// Acknowledgment returned by a chunked write. A non-success report is
/// treated exactly like a write exception by the pipeline.
#[derive(Debug, Clone)]
pub struct ChunkedWriteReport {
    pub success: bool,
    pub chunks: usize,
    pub error: Option<String>,
}

/// Pseudo-terminal channel for one or more sessions. The engine never
/// constructs one; it is injected by the host.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write(
        &self,
        session: &SessionId,
        bytes: &[u8],
        meta: WriteMeta,
    ) -> Result<(), TransportError>;

    async fn write_chunked(
        &self,
        session: &SessionId,
        bytes: &[u8],
        opts: ChunkedWriteOptions,
        meta: WriteMeta,
    ) -> Result<ChunkedWriteReport, TransportError>;

    /// Whether [`WriteMeta::prefix`] is honored atomically. Transports that
    /// cannot prefix get the control bytes as a separate best-effort write.
    fn supports_atomic_prefix(&self) -> bool {
        false
    }

    /// Probe whether a prompt pattern is currently visible on the session's
    /// screen. `None` means the session has no readable state; verification
    /// then degrades to trust instead of false failure.
    fn prompt_visible(&self, _session: &SessionId) -> Option<bool> {
        None
    }
}

/// Opaque handle to whatever host-UI object owns input focus for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusHandle(pub String);

/// Host-UI mechanism that owns input focus. Only consulted for sessions
/// whose profile requires focus or uses trusted-keystroke submission.
#[async_trait]
pub trait FocusResolver: Send + Sync {
    async fn locate(&self, session: &SessionId) -> Option<FocusHandle>;

    /// Activate the target. Returns whether focus was confirmed.
    async fn focus(&self, handle: &FocusHandle) -> bool;

    async fn dispatch_submit_keys(&self, handle: &FocusHandle) -> Result<(), TransportError>;

    /// Whatever currently holds host focus, captured before the engine
    /// steals it.
    async fn host_focus(&self) -> Option<FocusHandle>;

    async fn restore(&self, handle: FocusHandle);
}

/// Registry mapping sessions to capability profiles. A `None` answer makes
/// the engine fall back to [`CapabilityProfile::fallback`].
pub trait CapabilityRegistry: Send + Sync {
    fn capabilities(&self, session: &SessionId) -> Option<CapabilityProfile>;
}

/// Kind-specific identity/header prefixing for outgoing command text.
pub trait PromptComposer: Send + Sync {
    fn is_exec_kind(&self, session: &SessionId) -> bool;

    fn build_exec_prompt(&self, session: &SessionId, text: &str) -> String;
}

/// Raised once verification retries are exhausted. A separate sweeper (not
/// part of this engine) decides remediation.
pub trait StuckSignal: Send + Sync {
    fn mark_potentially_stuck(&self, session: &SessionId);
}

/// Consumer for lifecycle trace events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

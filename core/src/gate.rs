use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use paneflow_protocol::SessionId;
use tokio::time::Instant;
use tracing::warn;

use crate::config::GateConfig;

/// Why a session may not proceed to delivery right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateBlock {
    CompactionGate,
    InjectionInFlight,
    Composing,
    TypingGuard,
}

impl fmt::Display for GateBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::CompactionGate => "compaction_gate",
            Self::InjectionInFlight => "injection_in_flight",
            Self::Composing => "composing",
            Self::TypingGuard => "typing_guard",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateVerdict {
    Proceed,
    Blocked(GateBlock),
}

/// Per-session shared activity slots. Timestamps are written by the external
/// activity feed, compaction by the host's output classifier; the delivery
/// worker only reads them (except for the compaction force-clear).
#[derive(Debug, Default)]
struct SessionActivity {
    last_output: StdMutex<Option<Instant>>,
    last_typed: StdMutex<Option<Instant>>,
    compaction_confirmed: AtomicBool,
    /// Set when a confirmed compaction first blocks a delivery; the basis
    /// for the force-clear safety valve.
    compaction_blocking_since: StdMutex<Option<Instant>>,
}

/// Shared mutable state consulted by gate evaluation. One instance per
/// controller. Each field has a single logical writer, so atomic flags and
/// short-lived mutexes are enough under the cooperative scheduling model.
#[derive(Debug, Default)]
pub struct GateState {
    injection_in_flight: AtomicBool,
    composing: AtomicBool,
    sessions: StdMutex<HashMap<SessionId, Arc<SessionActivity>>>,
}

impl GateState {
    fn session(&self, session: &SessionId) -> Arc<SessionActivity> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sessions.entry(session.clone()).or_default())
    }

    pub(crate) fn injection_in_flight(&self) -> bool {
        self.injection_in_flight.load(Ordering::Acquire)
    }

    /// Claim the controller-wide injection lock. At most one focus-dependent
    /// delivery may hold it across all sessions.
    pub(crate) fn try_acquire_injection(self: &Arc<Self>) -> Option<InjectionPermit> {
        self.injection_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InjectionPermit {
                state: Arc::clone(self),
            })
    }

    pub(crate) fn last_output_at(&self, session: &SessionId) -> Option<Instant> {
        *self
            .session(session)
            .last_output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn last_typed_at(&self, session: &SessionId) -> Option<Instant> {
        *self
            .session(session)
            .last_typed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn compaction_confirmed(&self, session: &SessionId) -> bool {
        self.session(session)
            .compaction_confirmed
            .load(Ordering::Acquire)
    }

    /// Evaluate whether the queue head for `session` may proceed, in gate
    /// order: compaction, global lock, composing, typing guard. `immediate`
    /// items answer only to the global lock.
    pub(crate) fn evaluate(
        &self,
        session: &SessionId,
        profile_bypasses_lock: bool,
        profile_applies_compaction: bool,
        profile_typing_guard: bool,
        immediate: bool,
        config: &GateConfig,
    ) -> GateVerdict {
        if profile_applies_compaction && !immediate && self.compaction_confirmed(session) {
            let slot = self.session(session);
            let mut since = slot
                .compaction_blocking_since
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let first_blocked = *since.get_or_insert_with(Instant::now);
            let deferred = first_blocked.elapsed();
            if deferred < Duration::from_millis(config.compaction_max_defer_ms) {
                return GateVerdict::Blocked(GateBlock::CompactionGate);
            } else {
                // False-positive safety valve: a compaction indicator must
                // never block forever.
                slot.compaction_confirmed.store(false, Ordering::Release);
                *since = None;
                warn!(
                    session_id = %session,
                    deferred_ms = deferred.as_millis() as u64,
                    "compaction gate exceeded max defer, force-clearing indicator"
                );
            }
        }

        if self.injection_in_flight() && !profile_bypasses_lock {
            return GateVerdict::Blocked(GateBlock::InjectionInFlight);
        }

        if immediate {
            // User input wins as soon as the lock is free.
            return GateVerdict::Proceed;
        }

        if self.composing.load(Ordering::Acquire) && !profile_bypasses_lock {
            return GateVerdict::Blocked(GateBlock::Composing);
        }

        if profile_bypasses_lock && profile_typing_guard {
            let window = Duration::from_millis(config.typing_guard_window_ms);
            if let Some(typed) = self.last_typed_at(session)
                && typed.elapsed() < window
            {
                return GateVerdict::Blocked(GateBlock::TypingGuard);
            }
        }

        GateVerdict::Proceed
    }
}

/// RAII claim on the global injection lock; released on drop so the lock
/// survives cancellation of the delivery future.
#[derive(Debug)]
pub(crate) struct InjectionPermit {
    state: Arc<GateState>,
}

impl Drop for InjectionPermit {
    fn drop(&mut self) {
        self.state
            .injection_in_flight
            .store(false, Ordering::Release);
    }
}

/// Externally driven write surface over the shared gate state: the host's
/// output/keystroke feed and compaction classifier report through this.
#[derive(Debug, Clone)]
pub struct ActivityFeed {
    state: Arc<GateState>,
}

impl ActivityFeed {
    pub(crate) fn new(state: Arc<GateState>) -> Self {
        Self { state }
    }

    pub fn record_output(&self, session: &SessionId) {
        let slot = self.state.session(session);
        let mut last = slot.last_output.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Some(Instant::now());
    }

    pub fn record_typed(&self, session: &SessionId) {
        let slot = self.state.session(session);
        let mut last = slot.last_typed.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Some(Instant::now());
    }

    pub fn set_compaction(&self, session: &SessionId, confirmed: bool) {
        let slot = self.state.session(session);
        slot.compaction_confirmed.store(confirmed, Ordering::Release);
        if !confirmed {
            let mut since = slot
                .compaction_blocking_since
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *since = None;
        }
    }

    pub fn set_composing(&self, composing: bool) {
        self.state.composing.store(composing, Ordering::Release);
    }
}

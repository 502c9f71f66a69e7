use serde::Deserialize;
use serde::Serialize;

/// How a session's process is attached to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Input lands directly on the pseudo-terminal channel.
    Pty,
    /// The process ignores programmatic terminal input; submission needs a
    /// trusted keystroke dispatched at the host's focused input target.
    FocusDependent,
}

/// How a session turns buffered input into a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMethod {
    CarriageReturn,
    Newline,
    TrustedKeys,
}

/// Per-session description of how that session accepts input.
///
/// Resolved once per dispatch and never mutated during a delivery attempt.
/// Unknown sessions get [`CapabilityProfile::fallback`] instead of an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub mode: SessionMode,
    pub submit_method: SubmitMethod,
    #[serde(default)]
    pub bypass_global_lock: bool,
    #[serde(default)]
    pub apply_compaction_gate: bool,
    #[serde(default)]
    pub requires_focus_for_submit: bool,
    #[serde(default = "default_submit_delay_ms")]
    pub submit_delay_ms: u64,
    #[serde(default)]
    pub sanitize_multiline: bool,
    #[serde(default)]
    pub clear_line_before_write: bool,
    #[serde(default)]
    pub use_chunked_write: bool,
    #[serde(default)]
    pub home_reset_before_write: bool,
    #[serde(default = "default_true")]
    pub verify_submit_accepted: bool,
    #[serde(default)]
    pub defer_submit_while_pane_active: bool,
    #[serde(default)]
    pub typing_guard_when_bypassing: bool,
}

fn default_submit_delay_ms() -> u64 {
    150
}

fn default_true() -> bool {
    true
}

impl CapabilityProfile {
    /// Safe default applied when the registry does not know the session:
    /// plain pty writes, no focus requirement, atomic (unchunked) payload
    /// write. Verification stays on so an unreadable session degrades to
    /// the `prompt_probe_unavailable` accept path instead of failing.
    pub fn fallback() -> Self {
        Self {
            mode: SessionMode::Pty,
            submit_method: SubmitMethod::CarriageReturn,
            bypass_global_lock: false,
            apply_compaction_gate: false,
            requires_focus_for_submit: false,
            submit_delay_ms: default_submit_delay_ms(),
            sanitize_multiline: false,
            clear_line_before_write: false,
            use_chunked_write: false,
            home_reset_before_write: false,
            verify_submit_accepted: true,
            defer_submit_while_pane_active: false,
            typing_guard_when_bypassing: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn profile_deserializes_with_sparse_fields() {
        let profile: CapabilityProfile = serde_json::from_str(
            r#"{"mode":"focus_dependent","submit_method":"trusted_keys","requires_focus_for_submit":true}"#,
        )
        .expect("deserialize profile");
        assert_eq!(profile.mode, SessionMode::FocusDependent);
        assert_eq!(profile.submit_method, SubmitMethod::TrustedKeys);
        assert!(profile.requires_focus_for_submit);
        assert!(profile.verify_submit_accepted, "verification defaults on");
        assert!(!profile.bypass_global_lock);
        assert_eq!(profile.submit_delay_ms, 150);
    }

    #[test]
    fn fallback_profile_is_unchunked_and_focus_free() {
        let profile = CapabilityProfile::fallback();
        assert!(!profile.requires_focus_for_submit);
        assert!(!profile.use_chunked_write);
        assert!(profile.verify_submit_accepted);
    }
}

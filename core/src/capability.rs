use paneflow_protocol::CapabilityProfile;
use paneflow_protocol::SessionId;
use paneflow_protocol::SubmitMethod;
use tracing::debug;

use crate::transport::CapabilityRegistry;

const CARRIAGE_RETURN: &[u8] = b"\r";
const NEWLINE: &[u8] = b"\n";

/// Resolve the capability profile for one dispatch. Unknown sessions get the
/// safe fallback profile instead of failing the request.
pub(crate) fn resolve_profile(
    registry: &dyn CapabilityRegistry,
    session: &SessionId,
) -> CapabilityProfile {
    match registry.capabilities(session) {
        Some(profile) => profile,
        None => {
            debug!(session_id = %session, "session unknown to capability registry, using fallback profile");
            CapabilityProfile::fallback()
        }
    }
}

/// Submit strategy selected once per dispatch from the resolved profile,
/// instead of re-branching on profile flags at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitStrategy {
    /// Raw control byte(s) written straight to the channel.
    DirectBytes(&'static [u8]),
    /// Trusted keystroke dispatched at the host's focused input target.
    TrustedKeys,
}

impl SubmitStrategy {
    pub(crate) fn for_profile(profile: &CapabilityProfile) -> Self {
        match profile.submit_method {
            SubmitMethod::CarriageReturn => Self::DirectBytes(CARRIAGE_RETURN),
            SubmitMethod::Newline => Self::DirectBytes(NEWLINE),
            SubmitMethod::TrustedKeys => Self::TrustedKeys,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::DirectBytes(bytes) if bytes == CARRIAGE_RETURN => "carriage_return",
            Self::DirectBytes(_) => "newline",
            Self::TrustedKeys => "trusted_keys",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paneflow_protocol::SessionMode;
    use pretty_assertions::assert_eq;

    struct EmptyRegistry;

    impl CapabilityRegistry for EmptyRegistry {
        fn capabilities(&self, _session: &SessionId) -> Option<CapabilityProfile> {
            None
        }
    }

    #[test]
    fn unknown_session_resolves_to_fallback() {
        let profile = resolve_profile(&EmptyRegistry, &SessionId::from("ghost"));
        assert_eq!(profile, CapabilityProfile::fallback());
        assert_eq!(profile.mode, SessionMode::Pty);
    }

    #[test]
    fn strategy_follows_submit_method() {
        let mut profile = CapabilityProfile::fallback();
        assert_eq!(
            SubmitStrategy::for_profile(&profile),
            SubmitStrategy::DirectBytes(b"\r"),
        );
        profile.submit_method = SubmitMethod::TrustedKeys;
        assert_eq!(SubmitStrategy::for_profile(&profile), SubmitStrategy::TrustedKeys);
    }
}

//! Wire-level vocabulary shared between the paneflow engine and its
//! collaborators: session identifiers, capability profiles, delivery
//! outcomes, and the lifecycle trace events emitted for every dispatch.

mod capabilities;
mod delivery;
mod session_id;
mod trace;

pub use capabilities::CapabilityProfile;
pub use capabilities::SessionMode;
pub use capabilities::SubmitMethod;
pub use delivery::DeliveryResult;
pub use delivery::DeliverySignal;
pub use delivery::FailureReason;
pub use session_id::SessionId;
pub use trace::CorrelationId;
pub use trace::EventId;
pub use trace::TraceEvent;
pub use trace::TraceEventKind;

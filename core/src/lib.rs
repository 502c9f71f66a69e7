//! Delivery engine for injecting text commands into concurrently running
//! interactive CLI sessions attached to pseudo-terminal channels.
//!
//! There is no transport-level ACK: acceptance is inferred from secondary
//! signals (output resumption, prompt-line transitions), submission is
//! retried without duplicating visible input, and focus-stealing deliveries
//! are serialized across sessions through a single controller-wide lock.

mod backoff;
mod capability;
mod config;
mod controller;
mod delivery;
mod error;
mod gate;
mod queue;
mod trace;
mod transport;
mod verify;

pub use config::BackoffConfig;
pub use config::ConfigError;
pub use config::EngineConfig;
pub use config::FocusConfig;
pub use config::GateConfig;
pub use config::QueueConfig;
pub use config::SettleConfig;
pub use config::VerifyConfig;
pub use config::WriteConfig;
pub use controller::Collaborators;
pub use controller::InjectionController;
pub use controller::SendOptions;
pub use error::TransportError;
pub use gate::ActivityFeed;
pub use queue::SendOverrides;
pub use trace::TraceContext;
pub use transport::CapabilityRegistry;
pub use transport::ChunkedWriteOptions;
pub use transport::ChunkedWriteReport;
pub use transport::EventSink;
pub use transport::FocusHandle;
pub use transport::FocusResolver;
pub use transport::PromptComposer;
pub use transport::StuckSignal;
pub use transport::Transport;
pub use transport::WriteIntent;
pub use transport::WriteMeta;

use thiserror::Error;

/// Faults raised by the injected transport and focus collaborators. Callers
/// inside the pipeline catch these at the point of call and fold them into a
/// `DeliveryResult` reason; they never escape the public entry points.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel write rejected: {error}")]
    Write {
        #[source]
        error: anyhow::Error,
    },
    #[error("submit dispatch rejected: {error}")]
    Submit {
        #[source]
        error: anyhow::Error,
    },
    #[error("session channel is gone")]
    ChannelClosed,
}

impl TransportError {
    pub fn write(error: anyhow::Error) -> Self {
        Self::Write { error }
    }

    pub fn submit(error: anyhow::Error) -> Self {
        Self::Submit { error }
    }
}

//! Typed error hierarchy for the conveyor dispatcher.
//!
//! A single `ConveyorError` enum covers every failure an orchestration
//! operation can surface. Callers branch on the variant (or on [`kind`]):
//! - gateway and timeout failures before any actuation can be retried as-is
//! - `NotAvailable` needs a different request, retrying it changes nothing
//! - `Stranded` means gates were already actuated and carriers are left in
//!   transit; an operator has to reconcile them
//!
//! [`kind`]: ConveyorError::kind

use std::time::Duration;

use thiserror::Error;

use crate::dispatch::models::{CarrierId, CheckpointId};

pub type Result<T, E = ConveyorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("Gateway request failed for checkpoints {checkpoints:?}: {message}")]
    Gateway {
        checkpoints: Vec<CheckpointId>,
        message: String,
    },

    #[error("Checkpoint {id} is not part of the conveyor ring")]
    UnknownCheckpoint { id: CheckpointId },

    #[error("Carrier {carrier} is not available")]
    NotAvailable { carrier: CarrierId },

    #[error("Carrier {id} not found")]
    UnknownCarrier { id: CarrierId },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out after {waited:?} waiting for a carrier on checkpoint {checkpoint}")]
    Timeout {
        checkpoint: CheckpointId,
        waited: Duration,
    },

    #[error("Operation interrupted after actuation, carriers {carriers:?} left in transit: {source}")]
    Stranded {
        carriers: Vec<CarrierId>,
        #[source]
        source: Box<ConveyorError>,
    },

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConveyorError {
    pub fn gateway(checkpoints: &[CheckpointId], message: impl Into<String>) -> Self {
        Self::Gateway {
            checkpoints: checkpoints.to_vec(),
            message: message.into(),
        }
    }

    /// Stable identifier used in API bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Gateway { .. } => "gateway",
            Self::UnknownCheckpoint { .. } => "unknown_checkpoint",
            Self::NotAvailable { .. } => "not_available",
            Self::UnknownCarrier { .. } => "unknown_carrier",
            Self::InvalidState(_) => "invalid_state",
            Self::Timeout { .. } => "timeout",
            Self::Stranded { .. } => "stranded",
            Self::Store(_) => "store",
            Self::Other(_) => "other",
        }
    }

    /// Whether resubmitting the same request may succeed.
    ///
    /// `Stranded` is never retryable even when its cause was a gateway error:
    /// the conveyor is no longer in the state the request was validated against.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Gateway { .. } | Self::Timeout { .. })
    }

    /// Precondition failures guarantee nothing was actuated.
    pub fn is_dispatch_rejection(&self) -> bool {
        matches!(self, Self::NotAvailable { .. })
    }
}

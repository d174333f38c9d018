use thiserror::Error;

use crate::id::{RegistrarId, TrackingId};

pub type Result<T> = std::result::Result<T, ObservationError>;

/// Invalid use of the tracking API.
///
/// These are precondition violations by the caller. In every case the
/// affected tracking context is discarded and no subscription is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObservationError {
    /// The context was already closed, because an enclosing context was
    /// ended first.
    #[error("tracking context {handle} was already closed")]
    ContextClosed { handle: TrackingId },

    /// The handle was ended by a registrar other than the one that opened it.
    #[error("tracking context {handle} was opened by {opened_by} but ended by {ended_by}")]
    ForeignRegistrar {
        handle: TrackingId,
        opened_by: RegistrarId,
        ended_by: RegistrarId,
    },
}

impl ObservationError {
    /// The tracking context the error refers to.
    #[must_use]
    pub fn handle(&self) -> TrackingId {
        match self {
            Self::ContextClosed { handle } | Self::ForeignRegistrar { handle, .. } => *handle,
        }
    }
}

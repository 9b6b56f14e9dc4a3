use std::fmt;

use thiserror::Error;
use ulid::Ulid;

use crate::model::StayRange;

/// Entity named by a `NotFound` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Listing,
    Booking,
    Payment,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Listing => "listing",
            Entity::Booking => "booking",
            Entity::Payment => "payment",
        })
    }
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    Internal,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: Ulid },

    #[error("invalid input: {0}")]
    Validation(String),

    /// Raised both by the fast-reject check and by the store's exclusion
    /// constraint. `position` is set for batch candidates.
    #[error(
        "{range} overlaps a booking on listing {listing_id}{}",
        position.map(|p| format!(" (batch candidate {p})")).unwrap_or_default()
    )]
    Conflict {
        listing_id: Ulid,
        range: StayRange,
        existing: Option<Ulid>,
        position: Option<usize>,
    },

    #[error("{op} failed{}: {message}", id.map(|i| format!(" for {i}")).unwrap_or_default())]
    Internal {
        op: &'static str,
        id: Option<Ulid>,
        message: String,
    },

    #[error("{op} cancelled: deadline exceeded")]
    Cancelled { op: &'static str },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::Internal { .. } => ErrorKind::Internal,
            EngineError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    pub fn not_found(entity: Entity, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn internal(op: &'static str, id: Option<Ulid>, message: impl fmt::Display) -> Self {
        EngineError::Internal {
            op,
            id,
            message: message.to_string(),
        }
    }

    /// Tag a conflict with the batch position of the offending candidate.
    pub fn at_position(self, position: usize) -> Self {
        match self {
            EngineError::Conflict {
                listing_id,
                range,
                existing,
                ..
            } => EngineError::Conflict {
                listing_id,
                range,
                existing,
                position: Some(position),
            },
            other => other,
        }
    }
}

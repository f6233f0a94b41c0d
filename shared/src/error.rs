use crate::ReservationStatus;
use thiserror::Error;
use uuid::Uuid;

/// Broad class of a rejection, used to pick the transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
}

/// Every way a reserve or pickup request can be refused by the domain rules.
///
/// None of these are transient: retrying the same request against the same
/// state yields the same answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PickupError {
    #[error("{0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(String),

    #[error("offer {0} not found")]
    OfferNotFound(Uuid),

    #[error("offer is not available yet")]
    OfferNotLive,

    #[error("offer has expired")]
    OfferExpired,

    #[error("not enough stock available: requested {requested}, {available} left")]
    InsufficientStock { requested: i32, available: i32 },

    #[error("invalid pickup code")]
    TokenNotFound,

    #[error("pickup code already used")]
    TokenAlreadyUsed,

    #[error("pickup code expired")]
    TokenExpired,

    #[error("reservation is {0}")]
    ReservationNotActive(ReservationStatus),

    #[error("this reservation is for a different store")]
    StoreMismatch,
}

impl PickupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::Forbidden(_) | Self::StoreMismatch => ErrorKind::Forbidden,
            Self::OfferNotFound(_) | Self::TokenNotFound => ErrorKind::NotFound,
            Self::OfferNotLive
            | Self::OfferExpired
            | Self::InsufficientStock { .. }
            | Self::TokenAlreadyUsed
            | Self::TokenExpired
            | Self::ReservationNotActive(_) => ErrorKind::Conflict,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::OfferNotFound(_) => "OFFER_NOT_FOUND",
            Self::OfferNotLive => "OFFER_NOT_LIVE",
            Self::OfferExpired => "OFFER_EXPIRED",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::TokenNotFound => "TOKEN_NOT_FOUND",
            Self::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::ReservationNotActive(_) => "RESERVATION_NOT_ACTIVE",
            Self::StoreMismatch => "STORE_MISMATCH",
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }
}

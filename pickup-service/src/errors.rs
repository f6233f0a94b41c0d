use crate::store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use shared::{ErrorKind, PickupError};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Refused by a domain rule; nothing was written
    #[error(transparent)]
    Pickup(#[from] PickupError),

    /// Storage stayed unavailable after retrying
    #[error("service temporarily unavailable")]
    Unavailable(#[source] StoreError),

    /// Anything else that went wrong on our side
    #[error("internal error: {0}")]
    Internal(#[source] StoreError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(rejection) => Error::Pickup(rejection),
            err if err.is_transient() => Error::Unavailable(err),
            err => Error::Internal(err),
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Pickup(err) => match err.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
                ErrorKind::Forbidden => StatusCode::FORBIDDEN,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
            },
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Pickup(err) => err.code(),
            Error::Unavailable(_) => "SERVICE_UNAVAILABLE",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show to the caller.
    pub fn user_message(&self) -> String {
        match self {
            Error::Pickup(err) => err.to_string(),
            Error::Unavailable(_) => "Service temporarily unavailable, please retry".to_string(),
            Error::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Internal(err) => tracing::error!("Internal service error: {:#}", err),
            Error::Unavailable(err) => tracing::warn!("Storage unavailable: {}", err),
            Error::Pickup(err) => match err.kind() {
                ErrorKind::Unauthenticated | ErrorKind::Forbidden => {
                    tracing::info!("Authorization error: {}", err)
                }
                _ => tracing::debug!("Client error: {}", err),
            },
        }

        let body = Json(serde_json::json!({
            "error": self.user_message(),
            "code": self.code(),
        }));
        (self.status_code(), body).into_response()
    }
}

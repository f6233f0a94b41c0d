//! Identity forwarded by the upstream identity provider.
//!
//! The proxy in front of this service authenticates the caller and sets
//! `x-principal-id`, `x-principal-role` and, for cashiers, `x-principal-store`.

use crate::errors::Error;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use shared::{PickupError, Principal, Role};
use tracing::trace;
use uuid::Uuid;

pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_ROLE_HEADER: &str = "x-principal-role";
pub const PRINCIPAL_STORE_HEADER: &str = "x-principal-store";

/// Extractor for the calling principal. Rejects with 401 when the identity
/// headers are missing or malformed.
#[derive(Debug, Clone, Copy)]
pub struct Authenticated(pub Principal);

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn uuid_header(parts: &Parts, name: &str) -> Result<Option<Uuid>, PickupError> {
    header(parts, name)
        .map(|v| Uuid::parse_str(v).map_err(|_| PickupError::Unauthenticated))
        .transpose()
}

pub fn principal_from_parts(parts: &Parts) -> Result<Principal, PickupError> {
    let id = uuid_header(parts, PRINCIPAL_ID_HEADER)?.ok_or(PickupError::Unauthenticated)?;
    let role: Role = header(parts, PRINCIPAL_ROLE_HEADER)
        .ok_or(PickupError::Unauthenticated)?
        .parse()?;
    let store = uuid_header(parts, PRINCIPAL_STORE_HEADER)?;
    Principal::from_parts(id, role, store)
}

#[async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = principal_from_parts(parts)?;
        trace!(principal_id = %principal.id(), role = ?principal.role(), "Authenticated request");
        Ok(Authenticated(principal))
    }
}

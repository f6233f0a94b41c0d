//! Rules deciding whether stock may be allocated and whether a pickup may be
//! confirmed. Storage backends call these from inside their atomic units so
//! the decision is always taken against the rows they are about to write.

use crate::{Offer, PickupError, QrToken, Reservation, ReservationStatus, TokenStatus};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub fn check_quantity(quantity: i32) -> Result<(), PickupError> {
    if quantity < 1 {
        return Err(PickupError::Validation(
            "quantity must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Preconditions for taking `quantity` units of `offer` at `now`.
pub fn check_reservable(offer: &Offer, quantity: i32, now: DateTime<Utc>) -> Result<(), PickupError> {
    check_quantity(quantity)?;
    if now >= offer.ends_at {
        return Err(PickupError::OfferExpired);
    }
    if now < offer.starts_at {
        return Err(PickupError::OfferNotLive);
    }
    if offer.quantity_available < quantity {
        return Err(PickupError::InsufficientStock {
            requested: quantity,
            available: offer.quantity_available.max(0),
        });
    }
    Ok(())
}

/// Preconditions for handing over the goods.
///
/// `required_store` is the store a store-scoped operator is bound to. The
/// store check runs first so nothing about another store's reservation is
/// revealed through the later errors.
pub fn check_pickup(
    required_store: Option<Uuid>,
    token: &QrToken,
    reservation: &Reservation,
    now: DateTime<Utc>,
) -> Result<(), PickupError> {
    if let Some(store_id) = required_store {
        if store_id != reservation.store_id {
            return Err(PickupError::StoreMismatch);
        }
    }
    match token.effective_status(now) {
        TokenStatus::Used => return Err(PickupError::TokenAlreadyUsed),
        TokenStatus::Expired => return Err(PickupError::TokenExpired),
        TokenStatus::Active => {}
    }
    match reservation.effective_status(now) {
        ReservationStatus::Active => Ok(()),
        status => Err(PickupError::ReservationNotActive(status)),
    }
}

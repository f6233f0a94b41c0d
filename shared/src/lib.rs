use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod clock;
pub mod error;
pub mod lifecycle;
pub mod principal;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorKind, PickupError};
pub use principal::{Principal, Role};

/// Stored status strings that don't match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseStatusError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

status_enum!(
    /// Sale state of an offer. The stored value is only a hint, see [`Offer::effective_status`].
    OfferStatus, "offer" {
        Scheduled => "SCHEDULED",
        Live => "LIVE",
        SoldOut => "SOLD_OUT",
        Expired => "EXPIRED",
    }
);

status_enum!(
    ReservationStatus, "reservation" {
        Active => "ACTIVE",
        PickedUp => "PICKED_UP",
        Expired => "EXPIRED",
        Cancelled => "CANCELLED",
    }
);

status_enum!(
    TokenStatus, "token" {
        Active => "ACTIVE",
        Used => "USED",
        Expired => "EXPIRED",
    }
);

/// A store's discounted batch of a product, with finite quantity and a sale window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub store_id: Uuid,
    pub product_id: Uuid,
    pub original_price: BigDecimal,
    pub discounted_price: BigDecimal,
    pub quantity_total: i32,
    pub quantity_available: i32,
    pub status: OfferStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub dlc_date: DateTime<Utc>,
}

impl Offer {
    /// Derives the sale state from the clock and the remaining quantity,
    /// ignoring whatever was last written to `status`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> OfferStatus {
        if now >= self.ends_at {
            OfferStatus::Expired
        } else if self.quantity_available <= 0 {
            OfferStatus::SoldOut
        } else if now < self.starts_at {
            OfferStatus::Scheduled
        } else {
            OfferStatus::Live
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == OfferStatus::Live
    }

    /// Status hint to persist after `quantity` units have been taken.
    pub fn status_after_decrement(&self, quantity: i32, now: DateTime<Utc>) -> OfferStatus {
        let mut next = self.clone();
        next.quantity_available -= quantity;
        next.effective_status(now)
    }

    /// Catalog-side invariants: discounted < original, 0 <= available <= total,
    /// and a non-empty sale window.
    pub fn check_invariants(&self) -> Result<(), PickupError> {
        if self.discounted_price >= self.original_price {
            return Err(PickupError::Validation(
                "discounted price must be below the original price".to_string(),
            ));
        }
        if self.quantity_available < 0 || self.quantity_available > self.quantity_total {
            return Err(PickupError::Validation(
                "available quantity must be between 0 and the total quantity".to_string(),
            ));
        }
        if self.starts_at >= self.ends_at {
            return Err(PickupError::Validation(
                "offer must start before it ends".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub offer_id: Uuid,
    pub quantity: i32,
    /// Price snapshot taken when the reservation was created.
    pub unit_price: BigDecimal,
}

impl ReservationItem {
    pub fn line_total(&self) -> BigDecimal {
        &self.unit_price * BigDecimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub consumer_id: Uuid,
    pub store_id: Uuid,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub items: Vec<ReservationItem>,
}

impl Reservation {
    /// An ACTIVE reservation past its hold window reads as EXPIRED even if no
    /// sweep has rewritten the stored status yet.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ReservationStatus {
        match self.status {
            ReservationStatus::Active if now > self.expires_at => ReservationStatus::Expired,
            status => status,
        }
    }

    pub fn total(&self) -> BigDecimal {
        self.items
            .iter()
            .fold(BigDecimal::zero(), |acc, item| acc + item.line_total())
    }

    pub fn quantity_of(&self, offer_id: Uuid) -> i32 {
        self.items
            .iter()
            .filter(|item| item.offer_id == offer_id)
            .map(|item| item.quantity)
            .sum()
    }
}

/// Single-use pickup credential. Carries no business data beyond the binding
/// to its reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrToken {
    pub token: String,
    pub reservation_id: Uuid,
    pub status: TokenStatus,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    /// Operator who confirmed the pickup.
    pub used_by: Option<Uuid>,
}

impl QrToken {
    pub fn effective_status(&self, now: DateTime<Utc>) -> TokenStatus {
        match self.status {
            TokenStatus::Active if now > self.expires_at => TokenStatus::Expired,
            status => status,
        }
    }

    /// Whether this token was spent by `actor_id` at `at`, i.e. by a pickup
    /// confirmation that already committed. Compared at microsecond
    /// precision, which is what Postgres keeps.
    pub fn confirmed_by(&self, actor_id: Uuid, at: DateTime<Utc>) -> bool {
        self.status == TokenStatus::Used
            && self.used_by == Some(actor_id)
            && self.used_at.map(|t| t.timestamp_micros()) == Some(at.timestamp_micros())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub const CONFIRM_PICKUP: &'static str = "CONFIRM_PICKUP";

    pub fn pickup_confirmed(actor_id: Uuid, reservation: &Reservation, token: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id,
            action: Self::CONFIRM_PICKUP.to_string(),
            entity_type: "RESERVATION".to_string(),
            entity_id: reservation.id,
            metadata: serde_json::json!({
                "token": token,
                "store_id": reservation.store_id,
            }),
            created_at: at,
        }
    }
}

/// A reservation together with the token that unlocks it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRecord {
    pub reservation: Reservation,
    pub token: QrToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub offer_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub line_total: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub token: String,
    pub status: TokenStatus,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// Read-side view of a reservation with statuses evaluated against `now`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationSnapshot {
    pub id: Uuid,
    pub consumer_id: Uuid,
    pub store_id: Uuid,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub items: Vec<ItemSnapshot>,
    pub total: BigDecimal,
    pub token: TokenSnapshot,
}

impl ReservationSnapshot {
    pub fn at(record: &ReservationRecord, now: DateTime<Utc>) -> Self {
        let ReservationRecord { reservation, token } = record;
        Self {
            id: reservation.id,
            consumer_id: reservation.consumer_id,
            store_id: reservation.store_id,
            status: reservation.effective_status(now),
            created_at: reservation.created_at,
            expires_at: reservation.expires_at,
            items: reservation
                .items
                .iter()
                .map(|item| ItemSnapshot {
                    offer_id: item.offer_id,
                    quantity: item.quantity,
                    unit_price: item.unit_price.clone(),
                    line_total: item.line_total(),
                })
                .collect(),
            total: reservation.total(),
            token: TokenSnapshot {
                token: token.token.clone(),
                status: token.effective_status(now),
                expires_at: token.expires_at,
                used_at: token.used_at,
            },
        }
    }
}

/// Offer as shown to browsers, with the status derived at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferView {
    #[serde(flatten)]
    pub offer: Offer,
    pub effective_status: OfferStatus,
}

impl OfferView {
    pub fn at(offer: Offer, now: DateTime<Utc>) -> Self {
        let effective_status = offer.effective_status(now);
        Self { offer, effective_status }
    }
}

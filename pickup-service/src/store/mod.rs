//! Persistence for offers, reservations and tokens.
//!
//! Each method that writes is one atomic unit: either every row it touches
//! changes, or none do. Domain rejections come back as
//! [`StoreError::Rejected`] after the unit has been rolled back.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use shared::{Offer, ParseStatusError, PickupError, ReservationRecord, ReservationStatus};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Rejected(#[from] PickupError),

    /// Serialization failure or deadlock; the unit may be re-run as is.
    #[error("transaction conflict")]
    Conflict,

    #[error("storage did not answer within {0:?}")]
    Timeout(Duration),

    #[error("connection pool: {0}")]
    Pool(String),

    /// The freshly minted pickup code is already taken.
    #[error("pickup code collision")]
    TokenCollision,

    /// The reservation id is already taken, normally by an earlier attempt
    /// of the same unit that committed.
    #[error("reservation already recorded")]
    DuplicateReservation,

    #[error("corrupt row: {0}")]
    Corrupt(#[from] ParseStatusError),

    #[error(transparent)]
    Database(DieselError),
}

impl StoreError {
    /// Whether re-running the same unit can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict | Self::Timeout(_) | Self::Pool(_))
    }
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match &err {
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => Self::Conflict,
            // 40P01 deadlock_detected has no dedicated kind in diesel
            DieselError::DatabaseError(DatabaseErrorKind::Unknown, info)
                if info.message().contains("deadlock detected") =>
            {
                Self::Conflict
            }
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)
                if info.table_name() == Some("qr_tokens") =>
            {
                Self::TokenCollision
            }
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)
                if info.table_name() == Some("reservations") =>
            {
                Self::DuplicateReservation
            }
            _ => Self::Database(err),
        }
    }
}

/// Everything the allocator decided before opening the atomic unit. The store
/// re-reads the offer inside the unit and applies the reservation rules there.
#[derive(Debug, Clone)]
pub struct ReservationDraft {
    pub reservation_id: Uuid,
    pub consumer_id: Uuid,
    pub offer_id: Uuid,
    pub quantity: i32,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct PickupConfirmation {
    pub reservation_id: Uuid,
    pub token: String,
    pub actor_id: Uuid,
    /// Set when the operator is bound to one store.
    pub required_store: Option<Uuid>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationOrder {
    NewestCreated,
    NewestUpdated,
}

#[derive(Debug, Clone)]
pub struct ReservationFilter {
    pub consumer_id: Option<Uuid>,
    /// `None` means every store.
    pub store_ids: Option<Vec<Uuid>>,
    pub status: Option<ReservationStatus>,
    pub order: ReservationOrder,
    pub limit: Option<i64>,
}

impl ReservationFilter {
    pub fn for_consumer(consumer_id: Uuid) -> Self {
        Self {
            consumer_id: Some(consumer_id),
            store_ids: None,
            status: None,
            order: ReservationOrder::NewestCreated,
            limit: None,
        }
    }

    pub fn for_stores(store_ids: Option<Vec<Uuid>>) -> Self {
        Self {
            consumer_id: None,
            store_ids,
            status: None,
            order: ReservationOrder::NewestCreated,
            limit: None,
        }
    }

    pub(crate) fn matches(&self, record: &ReservationRecord) -> bool {
        let reservation = &record.reservation;
        self.consumer_id.map_or(true, |id| reservation.consumer_id == id)
            && self
                .store_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&reservation.store_id))
            && self.status.map_or(true, |status| reservation.status == status)
    }
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reservations_expired: usize,
    pub tokens_expired: usize,
    pub units_released: i64,
    pub offers_refreshed: usize,
}

#[async_trait]
pub trait PickupStore: Send + Sync {
    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError>;

    /// Offers whose window contains `now` and that still have stock, newest
    /// window first.
    async fn live_offers(&self, now: DateTime<Utc>) -> Result<Vec<Offer>, StoreError>;

    /// Decrements stock, writes the reservation, its item and its token.
    /// Re-running a draft whose reservation already exists returns the stored
    /// record and leaves stock untouched.
    async fn allocate(&self, draft: &ReservationDraft) -> Result<ReservationRecord, StoreError>;

    async fn find_by_token(&self, token: &str) -> Result<Option<ReservationRecord>, StoreError>;

    /// Marks the token USED and the reservation PICKED_UP, then appends the
    /// audit entry. A failed audit write is logged and does not undo the pickup.
    /// Replaying a request that already applied (same actor, same `now`)
    /// returns the stored record without writing.
    async fn confirm_pickup(&self, request: &PickupConfirmation) -> Result<ReservationRecord, StoreError>;

    async fn reservations(&self, filter: &ReservationFilter) -> Result<Vec<ReservationRecord>, StoreError>;

    async fn stores_owned_by(&self, merchant_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Rewrites overdue ACTIVE reservations and tokens to EXPIRED, hands their
    /// units back to the offers and refreshes stored offer status hints.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError>;
}

use crate::allocator::Allocator;
use crate::ledger::OfferLedger;
use crate::queries::ReservationQueries;
use crate::retry::RetryPolicy;
use crate::store::{
    MemoryStore, PickupConfirmation, PickupStore, ReservationDraft, ReservationFilter, StoreError, SweepReport,
};
use crate::sweeper::ExpirySweeper;
use crate::tokens::TokenIssuer;
use crate::verifier::Verifier;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use shared::{Clock, ManualClock, Offer, OfferStatus, Principal, ReservationRecord, ReservationStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(1),
        multiplier: 1.0,
        attempt_timeout: std::time::Duration::from_secs(2),
    }
}

/// Retries quickly and gives each attempt 50ms, well under the stall in
/// [`LateAck`].
pub fn impatient_retry() -> RetryPolicy {
    RetryPolicy {
        attempt_timeout: std::time::Duration::from_millis(50),
        ..fast_retry()
    }
}

/// Store whose first write commits and then answers too late for the caller,
/// as when a connection drops after COMMIT.
pub struct LateAck {
    inner: MemoryStore,
    stalled: AtomicBool,
}

impl LateAck {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            stalled: AtomicBool::new(false),
        }
    }

    async fn stall_once(&self) {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }
}

#[async_trait]
impl PickupStore for LateAck {
    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError> {
        self.inner.get_offer(offer_id).await
    }

    async fn live_offers(&self, now: DateTime<Utc>) -> Result<Vec<Offer>, StoreError> {
        self.inner.live_offers(now).await
    }

    async fn allocate(&self, draft: &ReservationDraft) -> Result<ReservationRecord, StoreError> {
        let record = self.inner.allocate(draft).await?;
        self.stall_once().await;
        Ok(record)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<ReservationRecord>, StoreError> {
        self.inner.find_by_token(token).await
    }

    async fn confirm_pickup(&self, request: &PickupConfirmation) -> Result<ReservationRecord, StoreError> {
        let record = self.inner.confirm_pickup(request).await?;
        self.stall_once().await;
        Ok(record)
    }

    async fn reservations(&self, filter: &ReservationFilter) -> Result<Vec<ReservationRecord>, StoreError> {
        self.inner.reservations(filter).await
    }

    async fn stores_owned_by(&self, merchant_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        self.inner.stores_owned_by(merchant_id).await
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        self.inner.expire_overdue(now).await
    }
}

/// Every component wired over one in-memory store and one manual clock, with
/// a single store owned by `merchant_id`.
pub struct Fixture {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub ledger: OfferLedger,
    pub allocator: Allocator,
    pub verifier: Verifier,
    pub queries: ReservationQueries,
    pub sweeper: ExpirySweeper,
    pub store_id: Uuid,
    pub merchant_id: Uuid,
}

impl Fixture {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let backend: Arc<dyn PickupStore> = Arc::new(store.clone());
        let time: Arc<dyn Clock> = clock.clone();

        let store_id = Uuid::new_v4();
        let merchant_id = Uuid::new_v4();
        store.insert_store(store_id, merchant_id).unwrap();

        Self {
            ledger: OfferLedger::new(backend.clone(), time.clone(), fast_retry()),
            allocator: Allocator::new(
                backend.clone(),
                time.clone(),
                TokenIssuer::new(),
                Duration::hours(2),
                fast_retry(),
            ),
            verifier: Verifier::new(backend.clone(), time.clone(), fast_retry()),
            queries: ReservationQueries::new(backend.clone(), time.clone(), fast_retry()),
            sweeper: ExpirySweeper::new(backend, time, fast_retry(), std::time::Duration::from_secs(60)),
            store,
            clock,
            store_id,
            merchant_id,
        }
    }

    fn insert(&self, available: i32, price: BigDecimal, starts_in: Duration) -> Uuid {
        let now = self.clock.now();
        let offer = Offer {
            id: Uuid::new_v4(),
            store_id: self.store_id,
            product_id: Uuid::new_v4(),
            original_price: &price * BigDecimal::from(2),
            discounted_price: price,
            quantity_total: available,
            quantity_available: available,
            status: OfferStatus::Live,
            starts_at: now + starts_in,
            ends_at: now + Duration::hours(4),
            dlc_date: now + Duration::days(1),
        };
        let id = offer.id;
        self.store.insert_offer(offer).unwrap();
        id
    }

    /// A live offer that opened an hour ago and closes in four hours.
    pub fn add_offer(&self, available: i32, price: BigDecimal) -> Uuid {
        self.insert(available, price, Duration::hours(-1))
    }

    pub fn add_offer_starting_in(&self, starts_in: Duration, available: i32) -> Uuid {
        self.insert(available, BigDecimal::from(3), starts_in)
    }

    pub fn consumer(&self) -> Principal {
        Principal::Consumer { id: Uuid::new_v4() }
    }

    pub fn cashier(&self, store_id: Uuid) -> Principal {
        Principal::Cashier {
            id: Uuid::new_v4(),
            store_id,
        }
    }

    pub fn merchant(&self) -> Principal {
        Principal::Merchant {
            owner_id: self.merchant_id,
        }
    }

    pub fn admin(&self) -> Principal {
        Principal::Admin { id: Uuid::new_v4() }
    }

    pub async fn find(&self, token: &str) -> ReservationRecord {
        self.store.find_by_token(token).await.unwrap().unwrap()
    }

    /// Stored status, not the one derived from the clock.
    pub async fn assert_reservation_status(&self, token: &str, expected: ReservationStatus) {
        assert_eq!(self.find(token).await.reservation.status, expected);
    }

    pub fn available(&self, offer_id: Uuid) -> i32 {
        let state = futures::executor::block_on(self.store.get_offer(offer_id));
        state.unwrap().unwrap().quantity_available
    }

    pub fn assert_available(&self, offer_id: Uuid, expected: i32) {
        assert_eq!(self.available(offer_id), expected);
    }

    /// available + units held by ACTIVE or PICKED_UP reservations == total
    pub fn assert_stock_invariant(&self, offer_id: Uuid) {
        let offer = futures::executor::block_on(self.store.get_offer(offer_id))
            .unwrap()
            .unwrap();
        let held = self.store.allocated_units(offer_id).unwrap();
        assert_eq!(
            offer.quantity_available + held,
            offer.quantity_total,
            "stock does not add up for offer {offer_id}"
        );
    }
}

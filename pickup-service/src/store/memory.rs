//! In-process backend. Each atomic unit runs entirely under one lock and
//! commits by writing its staged rows back only when every rule has passed.

use super::{
    PickupConfirmation, PickupStore, ReservationDraft, ReservationFilter, ReservationOrder, StoreError,
    SweepReport,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::lifecycle::{check_pickup, check_reservable};
use shared::{
    AuditEntry, Offer, OfferStatus, PickupError, QrToken, Reservation, ReservationItem, ReservationRecord,
    ReservationStatus, TokenStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    store_owners: HashMap<Uuid, Uuid>,
    offers: HashMap<Uuid, Offer>,
    reservations: HashMap<Uuid, Reservation>,
    /// token code -> token
    tokens: HashMap<String, QrToken>,
    audit: Vec<AuditEntry>,
    pending_conflicts: usize,
    fail_audit: bool,
}

impl State {
    /// Simulates a serialization failure on the next N atomic units.
    fn take_conflict(&mut self) -> Result<(), StoreError> {
        if self.pending_conflicts > 0 {
            self.pending_conflicts -= 1;
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    fn record_of_reservation(&self, reservation_id: Uuid) -> Option<ReservationRecord> {
        self.tokens
            .values()
            .find(|token| token.reservation_id == reservation_id)
            .and_then(|token| self.record_for(token))
    }

    fn record_for(&self, token: &QrToken) -> Option<ReservationRecord> {
        self.reservations
            .get(&token.reservation_id)
            .map(|reservation| ReservationRecord {
                reservation: reservation.clone(),
                token: token.clone(),
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Pool("memory store lock poisoned".to_string()))
    }

    /// Catalog hook: registers a store and its owning merchant.
    pub fn insert_store(&self, store_id: Uuid, merchant_id: Uuid) -> Result<(), StoreError> {
        self.lock()?.store_owners.insert(store_id, merchant_id);
        Ok(())
    }

    /// Catalog hook: publishes an offer after checking its invariants.
    pub fn insert_offer(&self, offer: Offer) -> Result<(), StoreError> {
        offer.check_invariants()?;
        self.lock()?.offers.insert(offer.id, offer);
        Ok(())
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Catalog hook: a price edit. Existing reservations keep their snapshot.
    pub fn set_discounted_price(&self, offer_id: Uuid, price: bigdecimal::BigDecimal) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let offer = state
            .offers
            .get_mut(&offer_id)
            .ok_or(PickupError::OfferNotFound(offer_id))?;
        offer.discounted_price = price;
        Ok(())
    }

    /// Makes the next `count` atomic units fail as transient conflicts.
    pub fn inject_conflicts(&self, count: usize) -> Result<(), StoreError> {
        self.lock()?.pending_conflicts = count;
        Ok(())
    }

    /// Makes every subsequent audit append fail.
    pub fn fail_audit_writes(&self, fail: bool) -> Result<(), StoreError> {
        self.lock()?.fail_audit = fail;
        Ok(())
    }

    pub fn audit_log(&self) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self.lock()?.audit.clone())
    }

    /// Units of `offer_id` held by ACTIVE or PICKED_UP reservations, as stored.
    pub fn allocated_units(&self, offer_id: Uuid) -> Result<i32, StoreError> {
        let state = self.lock()?;
        Ok(state
            .reservations
            .values()
            .filter(|r| matches!(r.status, ReservationStatus::Active | ReservationStatus::PickedUp))
            .map(|r| r.quantity_of(offer_id))
            .sum())
    }
}

#[async_trait]
impl PickupStore for MemoryStore {
    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError> {
        Ok(self.lock()?.offers.get(&offer_id).cloned())
    }

    async fn live_offers(&self, now: DateTime<Utc>) -> Result<Vec<Offer>, StoreError> {
        let state = self.lock()?;
        let mut offers: Vec<Offer> = state
            .offers
            .values()
            .filter(|offer| offer.is_live(now))
            .cloned()
            .collect();
        offers.sort_by(|a, b| b.starts_at.cmp(&a.starts_at));
        Ok(offers)
    }

    async fn allocate(&self, draft: &ReservationDraft) -> Result<ReservationRecord, StoreError> {
        let mut state = self.lock()?;
        state.take_conflict()?;

        // A retry of a unit that already committed gets the committed record.
        if let Some(existing) = state.record_of_reservation(draft.reservation_id) {
            return Ok(existing);
        }

        let mut offer = state
            .offers
            .get(&draft.offer_id)
            .cloned()
            .ok_or(PickupError::OfferNotFound(draft.offer_id))?;
        check_reservable(&offer, draft.quantity, draft.now)?;

        if state.tokens.contains_key(&draft.token) {
            return Err(StoreError::TokenCollision);
        }

        offer.status = offer.status_after_decrement(draft.quantity, draft.now);
        offer.quantity_available -= draft.quantity;

        let reservation = Reservation {
            id: draft.reservation_id,
            consumer_id: draft.consumer_id,
            store_id: offer.store_id,
            status: ReservationStatus::Active,
            created_at: draft.now,
            updated_at: draft.now,
            expires_at: draft.expires_at,
            items: vec![ReservationItem {
                offer_id: offer.id,
                quantity: draft.quantity,
                unit_price: offer.discounted_price.clone(),
            }],
        };
        let token = QrToken {
            token: draft.token.clone(),
            reservation_id: reservation.id,
            status: TokenStatus::Active,
            expires_at: draft.expires_at,
            used_at: None,
            used_by: None,
        };

        state.offers.insert(offer.id, offer);
        state.reservations.insert(reservation.id, reservation.clone());
        state.tokens.insert(token.token.clone(), token.clone());
        Ok(ReservationRecord { reservation, token })
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<ReservationRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state.tokens.get(token).and_then(|t| state.record_for(t)))
    }

    async fn confirm_pickup(&self, request: &PickupConfirmation) -> Result<ReservationRecord, StoreError> {
        let mut state = self.lock()?;
        state.take_conflict()?;

        let ReservationRecord {
            mut reservation,
            mut token,
        } = state
            .tokens
            .get(&request.token)
            .filter(|t| t.reservation_id == request.reservation_id)
            .and_then(|t| state.record_for(t))
            .ok_or(PickupError::TokenNotFound)?;

        if token.confirmed_by(request.actor_id, request.now) {
            return Ok(ReservationRecord { reservation, token });
        }
        check_pickup(request.required_store, &token, &reservation, request.now)?;

        token.status = TokenStatus::Used;
        token.used_at = Some(request.now);
        token.used_by = Some(request.actor_id);
        reservation.status = ReservationStatus::PickedUp;
        reservation.updated_at = request.now;

        state.tokens.insert(token.token.clone(), token.clone());
        state.reservations.insert(reservation.id, reservation.clone());

        if state.fail_audit {
            error!(
                "Failed to append pickup audit entry for reservation {}: audit log unavailable",
                reservation.id
            );
        } else {
            let entry = AuditEntry::pickup_confirmed(request.actor_id, &reservation, &token.token, request.now);
            state.audit.push(entry);
        }

        Ok(ReservationRecord { reservation, token })
    }

    async fn reservations(&self, filter: &ReservationFilter) -> Result<Vec<ReservationRecord>, StoreError> {
        let state = self.lock()?;
        let mut records: Vec<ReservationRecord> = state
            .tokens
            .values()
            .filter_map(|token| state.record_for(token))
            .filter(|record| filter.matches(record))
            .collect();
        match filter.order {
            ReservationOrder::NewestCreated => {
                records.sort_by(|a, b| b.reservation.created_at.cmp(&a.reservation.created_at))
            }
            ReservationOrder::NewestUpdated => {
                records.sort_by(|a, b| b.reservation.updated_at.cmp(&a.reservation.updated_at))
            }
        }
        if let Some(limit) = filter.limit {
            records.truncate(usize::try_from(limit).unwrap_or(0));
        }
        Ok(records)
    }

    async fn stores_owned_by(&self, merchant_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .store_owners
            .iter()
            .filter(|(_, owner)| **owner == merchant_id)
            .map(|(store, _)| *store)
            .collect())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut state = self.lock()?;
        state.take_conflict()?;
        let mut report = SweepReport::default();

        let overdue: Vec<Uuid> = state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Active && r.expires_at < now)
            .map(|r| r.id)
            .collect();

        for id in overdue {
            let Some(reservation) = state.reservations.get_mut(&id) else {
                continue;
            };
            reservation.status = ReservationStatus::Expired;
            reservation.updated_at = now;
            let items = reservation.items.clone();
            report.reservations_expired += 1;

            for token in state.tokens.values_mut() {
                if token.reservation_id == id && token.status == TokenStatus::Active {
                    token.status = TokenStatus::Expired;
                    report.tokens_expired += 1;
                }
            }
            for item in items {
                if let Some(offer) = state.offers.get_mut(&item.offer_id) {
                    offer.quantity_available += item.quantity;
                    report.units_released += i64::from(item.quantity);
                }
            }
        }

        for offer in state.offers.values_mut() {
            let derived = offer.effective_status(now);
            if derived != offer.status && derived != OfferStatus::Scheduled {
                offer.status = derived;
                report.offers_refreshed += 1;
            }
        }

        Ok(report)
    }
}

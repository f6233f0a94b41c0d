use crate::errors::{Error, Result};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::{PickupStore, ReservationDraft, StoreError};
use crate::tokens::TokenIssuer;
use chrono::Duration;
use serde::Deserialize;
use shared::lifecycle::check_quantity;
use shared::{Clock, PickupError, Principal, ReservationRecord};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Stock is held for this long before an unpicked reservation expires.
pub const DEFAULT_HOLD_WINDOW_MINUTES: i64 = 120;

/// Fresh codes tried before a collision is treated as a fault.
const MAX_TOKEN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct ReserveRequest {
    pub offer_id: Uuid,
    pub quantity: i32,
}

pub struct Allocator {
    store: Arc<dyn PickupStore>,
    clock: Arc<dyn Clock>,
    issuer: TokenIssuer,
    hold_window: Duration,
    retry: RetryPolicy,
}

impl Allocator {
    pub fn new(
        store: Arc<dyn PickupStore>,
        clock: Arc<dyn Clock>,
        issuer: TokenIssuer,
        hold_window: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            issuer,
            hold_window,
            retry,
        }
    }

    /// Takes `quantity` units of an offer for a consumer and returns the new
    /// reservation with its pickup token.
    pub async fn reserve(&self, principal: &Principal, request: &ReserveRequest) -> Result<ReservationRecord> {
        let consumer_id = match principal {
            Principal::Consumer { id } => *id,
            Principal::Cashier { .. } | Principal::Merchant { .. } | Principal::Admin { .. } => {
                return Err(PickupError::forbidden("only consumers can reserve").into());
            }
        };
        check_quantity(request.quantity)?;

        let reservation_id = Uuid::new_v4();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = run_with_retry(&self.retry, "reserve", || {
                let now = self.clock.now();
                let expires_at = now + self.hold_window;
                let draft = ReservationDraft {
                    reservation_id,
                    consumer_id,
                    offer_id: request.offer_id,
                    quantity: request.quantity,
                    now,
                    expires_at,
                    token: self.issuer.mint(reservation_id, expires_at).token,
                };
                let store = Arc::clone(&self.store);
                async move { store.allocate(&draft).await }
            })
            .await;

            match outcome {
                Ok(record) => {
                    info!(
                        reservation_id = %record.reservation.id,
                        offer_id = %request.offer_id,
                        consumer_id = %consumer_id,
                        quantity = request.quantity,
                        "Reservation created"
                    );
                    return Ok(record);
                }
                Err(StoreError::TokenCollision) if attempt < MAX_TOKEN_ATTEMPTS => {
                    warn!(reservation_id = %reservation_id, attempt, "Pickup code collision, minting another");
                }
                Err(err) => {
                    if let StoreError::Rejected(rejection) = &err {
                        info!(offer_id = %request.offer_id, reason = %rejection, "Reservation refused");
                    }
                    return Err(Error::from(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{impatient_retry, Fixture, LateAck};
    use bigdecimal::BigDecimal;
    use futures::future::join_all;
    use shared::{OfferStatus, ReservationSnapshot, ReservationStatus, TokenStatus};

    #[tokio::test]
    async fn reserve_decrements_stock_and_snapshots_price() {
        let fx = Fixture::new();
        let offer_id = fx.add_offer(5, BigDecimal::from(5));

        let record = fx
            .allocator
            .reserve(&fx.consumer(), &ReserveRequest { offer_id, quantity: 2 })
            .await
            .unwrap();

        assert_eq!(record.reservation.status, ReservationStatus::Active);
        assert_eq!(record.reservation.store_id, fx.store_id);
        assert_eq!(record.reservation.expires_at, fx.clock.now() + Duration::hours(2));
        assert_eq!(record.token.status, TokenStatus::Active);
        assert_eq!(record.token.expires_at, record.reservation.expires_at);

        let snapshot = ReservationSnapshot::at(&record, fx.clock.now());
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].offer_id, offer_id);
        assert_eq!(snapshot.items[0].quantity, 2);
        assert_eq!(snapshot.items[0].unit_price, BigDecimal::from(5));

        let offer = fx.ledger.get(offer_id).await.unwrap();
        assert_eq!(offer.offer.quantity_available, 3);
        fx.assert_stock_invariant(offer_id);
    }

    #[tokio::test]
    async fn last_units_mark_the_offer_sold_out() {
        let fx = Fixture::new();
        let offer_id = fx.add_offer(2, BigDecimal::from(4));

        fx.allocator
            .reserve(&fx.consumer(), &ReserveRequest { offer_id, quantity: 2 })
            .await
            .unwrap();

        let offer = fx.ledger.get(offer_id).await.unwrap();
        assert_eq!(offer.offer.status, OfferStatus::SoldOut);
        assert_eq!(offer.effective_status, OfferStatus::SoldOut);
    }

    #[tokio::test]
    async fn only_consumers_reserve() {
        let fx = Fixture::new();
        let offer_id = fx.add_offer(5, BigDecimal::from(5));

        let err = fx
            .allocator
            .reserve(&fx.cashier(fx.store_id), &ReserveRequest { offer_id, quantity: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pickup(PickupError::Forbidden(_))));
        fx.assert_available(offer_id, 5);
    }

    #[tokio::test]
    async fn bad_quantity_never_reaches_storage() {
        let fx = Fixture::new();
        // Any storage call would trip over these and end up unavailable.
        fx.store.inject_conflicts(100).unwrap();

        let err = fx
            .allocator
            .reserve(&fx.consumer(), &ReserveRequest { offer_id: Uuid::new_v4(), quantity: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pickup(PickupError::Validation(_))));
    }

    #[tokio::test]
    async fn unknown_offer_is_not_found() {
        let fx = Fixture::new();
        let err = fx
            .allocator
            .reserve(&fx.consumer(), &ReserveRequest { offer_id: Uuid::new_v4(), quantity: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pickup(PickupError::OfferNotFound(_))));
    }

    #[tokio::test]
    async fn refusals_leave_no_partial_state() {
        let fx = Fixture::new();
        let offer_id = fx.add_offer(1, BigDecimal::from(3));
        let consumer = fx.consumer();

        let err = fx
            .allocator
            .reserve(&consumer, &ReserveRequest { offer_id, quantity: 2 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pickup(PickupError::InsufficientStock { requested: 2, available: 1 })
        ));

        fx.clock.advance(Duration::hours(10));
        let err = fx
            .allocator
            .reserve(&consumer, &ReserveRequest { offer_id, quantity: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pickup(PickupError::OfferExpired)));

        fx.assert_available(offer_id, 1);
        assert!(fx.queries.my_reservations(&consumer).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduled_offer_is_not_live() {
        let fx = Fixture::new();
        let offer_id = fx.add_offer_starting_in(Duration::hours(1), 3);

        let err = fx
            .allocator
            .reserve(&fx.consumer(), &ReserveRequest { offer_id, quantity: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pickup(PickupError::OfferNotLive)));
    }

    #[tokio::test]
    async fn transient_conflicts_are_invisible() {
        let fx = Fixture::new();
        let offer_id = fx.add_offer(3, BigDecimal::from(2));
        fx.store.inject_conflicts(2).unwrap();

        fx.allocator
            .reserve(&fx.consumer(), &ReserveRequest { offer_id, quantity: 1 })
            .await
            .unwrap();
        fx.assert_available(offer_id, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_unavailable() {
        let fx = Fixture::new();
        let offer_id = fx.add_offer(3, BigDecimal::from(2));
        fx.store.inject_conflicts(100).unwrap();

        let err = fx
            .allocator
            .reserve(&fx.consumer(), &ReserveRequest { offer_id, quantity: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(StoreError::Conflict)));
        fx.assert_available(offer_id, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_reservations_never_oversell() {
        let fx = Arc::new(Fixture::new());
        let offer_id = fx.add_offer(7, BigDecimal::from(1));

        let attempts = (0..40).map(|_| {
            let fx = Arc::clone(&fx);
            tokio::spawn(async move {
                fx.allocator
                    .reserve(&fx.consumer(), &ReserveRequest { offer_id, quantity: 1 })
                    .await
            })
        });
        let outcomes: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let won = outcomes.iter().filter(|o| o.is_ok()).count();
        let sold_out = outcomes
            .iter()
            .filter(|o| matches!(o, Err(Error::Pickup(PickupError::InsufficientStock { .. }))))
            .count();
        assert_eq!(won, 7);
        assert_eq!(sold_out, 33);
        fx.assert_available(offer_id, 0);
        fx.assert_stock_invariant(offer_id);
    }

    #[tokio::test]
    async fn price_changes_do_not_touch_existing_reservations() {
        let fx = Fixture::new();
        let offer_id = fx.add_offer(5, BigDecimal::from(5));
        let consumer = fx.consumer();

        fx.allocator
            .reserve(&consumer, &ReserveRequest { offer_id, quantity: 1 })
            .await
            .unwrap();
        fx.store.set_discounted_price(offer_id, BigDecimal::from(2)).unwrap();

        let mine = fx.queries.my_reservations(&consumer).await.unwrap();
        assert_eq!(mine[0].items[0].unit_price, BigDecimal::from(5));
    }

    #[tokio::test]
    async fn retry_after_a_lost_commit_ack_reserves_once() {
        let fx = Fixture::new();
        let offer_id = fx.add_offer(5, BigDecimal::from(5));
        let consumer = fx.consumer();
        let allocator = Allocator::new(
            Arc::new(LateAck::new(fx.store.clone())),
            fx.clock.clone(),
            TokenIssuer::new(),
            Duration::hours(2),
            impatient_retry(),
        );

        let record = allocator
            .reserve(&consumer, &ReserveRequest { offer_id, quantity: 2 })
            .await
            .unwrap();

        fx.assert_available(offer_id, 3);
        fx.assert_stock_invariant(offer_id);
        let mine = fx.queries.my_reservations(&consumer).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, record.reservation.id);
        assert_eq!(fx.find(&record.token.token).await.reservation.id, record.reservation.id);
    }
}

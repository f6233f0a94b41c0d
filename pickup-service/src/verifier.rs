use crate::errors::Result;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::{PickupConfirmation, PickupStore};
use crate::tokens::normalize;
use serde::Deserialize;
use shared::lifecycle::check_pickup;
use shared::{Clock, PickupError, Principal, ReservationSnapshot};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmRequest {
    pub reservation_id: Uuid,
    pub token: String,
}

/// Store-side operator acting on a pickup: their id, and the store they are
/// bound to if any.
fn pickup_operator(principal: &Principal) -> Result<(Uuid, Option<Uuid>), PickupError> {
    match principal {
        Principal::Cashier { id, store_id } => Ok((*id, Some(*store_id))),
        Principal::Merchant { owner_id } => Ok((*owner_id, None)),
        Principal::Admin { id } => Ok((*id, None)),
        Principal::Consumer { .. } => Err(PickupError::forbidden("only store staff can verify pickups")),
    }
}

fn required_code(token: &str) -> Result<String, PickupError> {
    normalize(token).ok_or_else(|| PickupError::Validation("token is required".to_string()))
}

pub struct Verifier {
    store: Arc<dyn PickupStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl Verifier {
    pub fn new(store: Arc<dyn PickupStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { store, clock, retry }
    }

    /// Looks a presented code up and checks it could be confirmed right now.
    /// Writes nothing.
    pub async fn validate(&self, principal: &Principal, token: &str) -> Result<ReservationSnapshot> {
        let (_, required_store) = pickup_operator(principal)?;
        let code = required_code(token)?;

        let record = run_with_retry(&self.retry, "find_by_token", || self.store.find_by_token(&code))
            .await?
            .ok_or(PickupError::TokenNotFound)?;

        let now = self.clock.now();
        check_pickup(required_store, &record.token, &record.reservation, now)?;
        Ok(ReservationSnapshot::at(&record, now))
    }

    /// Hands the goods over: the token is spent and the reservation is closed.
    pub async fn confirm(&self, principal: &Principal, reservation_id: Uuid, token: &str) -> Result<ReservationSnapshot> {
        let (actor_id, required_store) = pickup_operator(principal)?;
        let code = required_code(token)?;

        // One instant for every attempt, so a retry can recognise its own
        // committed write.
        let now = self.clock.now();
        let record = run_with_retry(&self.retry, "confirm_pickup", || {
            let request = PickupConfirmation {
                reservation_id,
                token: code.clone(),
                actor_id,
                required_store,
                now,
            };
            let store = Arc::clone(&self.store);
            async move { store.confirm_pickup(&request).await }
        })
        .await?;

        info!(
            reservation_id = %reservation_id,
            store_id = %record.reservation.store_id,
            actor_id = %actor_id,
            "Pickup confirmed"
        );
        Ok(ReservationSnapshot::at(&record, now))
    }
}

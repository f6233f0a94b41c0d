use crate::errors::Result;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::{PickupStore, ReservationFilter, ReservationOrder};
use shared::{Clock, PickupError, Principal, ReservationSnapshot, ReservationStatus};
use std::sync::Arc;
use uuid::Uuid;

/// How many recent pickups the history screen shows.
pub const HISTORY_LIMIT: i64 = 20;

/// Reservation listings, scoped to what the caller may see.
pub struct ReservationQueries {
    store: Arc<dyn PickupStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl ReservationQueries {
    pub fn new(store: Arc<dyn PickupStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { store, clock, retry }
    }

    async fn fetch(&self, filter: ReservationFilter) -> Result<Vec<ReservationSnapshot>> {
        let records = run_with_retry(&self.retry, "reservations", || self.store.reservations(&filter)).await?;
        let now = self.clock.now();
        Ok(records
            .iter()
            .map(|record| ReservationSnapshot::at(record, now))
            .collect())
    }

    async fn owned_stores(&self, merchant_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(run_with_retry(&self.retry, "stores_owned_by", || self.store.stores_owned_by(merchant_id)).await?)
    }

    /// The caller's own reservations, newest first.
    pub async fn my_reservations(&self, principal: &Principal) -> Result<Vec<ReservationSnapshot>> {
        let consumer_id = match principal {
            Principal::Consumer { id } => *id,
            Principal::Cashier { .. } | Principal::Merchant { .. } | Principal::Admin { .. } => {
                return Err(PickupError::forbidden("only consumers have reservations").into());
            }
        };
        self.fetch(ReservationFilter::for_consumer(consumer_id)).await
    }

    /// Most recent confirmed pickups the operator may see.
    pub async fn pickup_history(&self, principal: &Principal) -> Result<Vec<ReservationSnapshot>> {
        let store_ids = match principal {
            Principal::Cashier { store_id, .. } => Some(vec![*store_id]),
            Principal::Merchant { owner_id } => Some(self.owned_stores(*owner_id).await?),
            Principal::Admin { .. } => None,
            Principal::Consumer { .. } => {
                return Err(PickupError::forbidden("only store staff can see pickup history").into());
            }
        };

        let filter = ReservationFilter {
            status: Some(ReservationStatus::PickedUp),
            order: ReservationOrder::NewestUpdated,
            limit: Some(HISTORY_LIMIT),
            ..ReservationFilter::for_stores(store_ids)
        };
        self.fetch(filter).await
    }

    /// Back-office listing. Admins see every store or the one they ask for;
    /// merchants only their own.
    pub async fn list_reservations(
        &self,
        principal: &Principal,
        store_id: Option<Uuid>,
    ) -> Result<Vec<ReservationSnapshot>> {
        let store_ids = match principal {
            Principal::Admin { .. } => store_id.map(|id| vec![id]),
            Principal::Merchant { owner_id } => {
                let owned = self.owned_stores(*owner_id).await?;
                match store_id {
                    Some(id) if !owned.contains(&id) => {
                        return Err(PickupError::forbidden("store is not yours").into());
                    }
                    Some(id) => Some(vec![id]),
                    None => Some(owned),
                }
            }
            Principal::Cashier { .. } | Principal::Consumer { .. } => {
                return Err(PickupError::forbidden("back-office access required").into());
            }
        };
        self.fetch(ReservationFilter::for_stores(store_ids)).await
    }
}

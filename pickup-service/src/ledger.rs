use crate::errors::Result;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::PickupStore;
use shared::{Clock, OfferView, PickupError};
use std::sync::Arc;
use uuid::Uuid;

/// Read side of the offer stock. Writes go through the allocator only.
pub struct OfferLedger {
    store: Arc<dyn PickupStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl OfferLedger {
    pub fn new(store: Arc<dyn PickupStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { store, clock, retry }
    }

    pub async fn get(&self, offer_id: Uuid) -> Result<OfferView> {
        let offer = run_with_retry(&self.retry, "get_offer", || self.store.get_offer(offer_id))
            .await?
            .ok_or(PickupError::OfferNotFound(offer_id))?;
        Ok(OfferView::at(offer, self.clock.now()))
    }

    pub async fn list_live(&self) -> Result<Vec<OfferView>> {
        let now = self.clock.now();
        let offers = run_with_retry(&self.retry, "live_offers", || self.store.live_offers(now)).await?;
        Ok(offers.into_iter().map(|offer| OfferView::at(offer, now)).collect())
    }
}

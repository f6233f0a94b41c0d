//! Demo catalog for running against the in-memory backend.

use crate::store::{MemoryStore, StoreError};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use shared::{Offer, OfferStatus};
use tracing::info;
use uuid::Uuid;

pub const DEMO_MERCHANT_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_0001);
pub const DEMO_STORE_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_0010);
pub const DEMO_OFFER_IDS: [Uuid; 2] = [
    Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_0100),
    Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_0101),
];

fn demo_offer(id: Uuid, original: i64, discounted: i64, quantity: i32, days: i64, now: DateTime<Utc>) -> Offer {
    Offer {
        id,
        store_id: DEMO_STORE_ID,
        product_id: Uuid::new_v4(),
        original_price: BigDecimal::from(original),
        discounted_price: BigDecimal::from(discounted),
        quantity_total: quantity,
        quantity_available: quantity,
        status: OfferStatus::Live,
        starts_at: now,
        ends_at: now + Duration::days(days),
        dlc_date: now + Duration::days(days),
    }
}

pub fn seed_demo(store: &MemoryStore, now: DateTime<Utc>) -> Result<(), StoreError> {
    store.insert_store(DEMO_STORE_ID, DEMO_MERCHANT_ID)?;
    store.insert_offer(demo_offer(DEMO_OFFER_IDS[0], 10, 5, 50, 7, now))?;
    store.insert_offer(demo_offer(DEMO_OFFER_IDS[1], 10, 1, 20, 3, now))?;

    info!(
        merchant_id = %DEMO_MERCHANT_ID,
        store_id = %DEMO_STORE_ID,
        offers = DEMO_OFFER_IDS.len(),
        "Seeded demo catalog"
    );
    Ok(())
}

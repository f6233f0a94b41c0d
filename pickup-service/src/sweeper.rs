use crate::errors::Result;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::{PickupStore, SweepReport};
use shared::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

/// Periodically persists expiry: overdue reservations and tokens become
/// EXPIRED and their units go back on sale.
pub struct ExpirySweeper {
    store: Arc<dyn PickupStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    period: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn PickupStore>, clock: Arc<dyn Clock>, retry: RetryPolicy, period: Duration) -> Self {
        Self {
            store,
            clock,
            retry,
            period,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.period);

        loop {
            interval.tick().await;

            if let Err(e) = self.sweep_once().await {
                error!("Error sweeping expired reservations: {}", e);
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let report = run_with_retry(&self.retry, "expire_overdue", || {
            let now = self.clock.now();
            let store = Arc::clone(&self.store);
            async move { store.expire_overdue(now).await }
        })
        .await?;

        if report.reservations_expired > 0 || report.offers_refreshed > 0 {
            info!(
                reservations = report.reservations_expired,
                tokens = report.tokens_expired,
                units = report.units_released,
                offers = report.offers_refreshed,
                "Expired overdue reservations"
            );
        }
        Ok(report)
    }
}

use super::{
    PickupConfirmation, PickupStore, ReservationDraft, ReservationFilter, ReservationOrder, StoreError,
    SweepReport,
};
use crate::models::*;
use crate::schema::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use shared::lifecycle::{check_pickup, check_reservable};
use shared::{
    AuditEntry, Offer, OfferStatus, PickupError, QrToken, Reservation, ReservationItem, ReservationRecord,
    ReservationStatus, TokenStatus,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<AsyncPgConnection>;

/// Applies pending migrations over a blocking connection.
pub fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    let mut conn = PgConnection::establish(database_url)?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Applied {} migrations", applied.len());
    Ok(())
}

pub async fn build_pool(database_url: &str, max_size: u32, connection_timeout: Duration) -> anyhow::Result<DbPool> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(connection_timeout)
        .build(config)
        .await?;
    Ok(pool)
}

/// Upper bound on reservations expired per sweep transaction.
const SWEEP_BATCH: i64 = 500;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Catalog hook: registers a store and its owning merchant.
    pub async fn insert_store(&self, store_id: Uuid, merchant_id: Uuid, name: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        diesel::insert_into(stores::table)
            .values(NewStore {
                id: store_id,
                merchant_id,
                name: name.to_string(),
            })
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Catalog hook: publishes an offer after checking its invariants.
    pub async fn insert_offer(&self, offer: &Offer) -> Result<(), StoreError> {
        offer.check_invariants()?;
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        diesel::insert_into(offers::table)
            .values(NewOffer::from(offer))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn committed_reservation(&self, reservation_id: Uuid) -> Result<Option<ReservationRecord>, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        existing_reservation(&mut conn, reservation_id).await
    }
}

fn pool_error(err: impl std::fmt::Display) -> StoreError {
    StoreError::Pool(err.to_string())
}

#[async_trait]
impl PickupStore for PgStore {
    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let row = offers::table
            .find(offer_id)
            .first::<DbOffer>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(Offer::try_from).transpose()?)
    }

    async fn live_offers(&self, now: DateTime<Utc>) -> Result<Vec<Offer>, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let rows = offers::table
            .filter(offers::starts_at.le(now))
            .filter(offers::ends_at.gt(now))
            .filter(offers::quantity_available.gt(0))
            .order(offers::starts_at.desc())
            .load::<DbOffer>(&mut conn)
            .await?;
        rows.into_iter()
            .map(|row| Offer::try_from(row).map_err(StoreError::from))
            .collect()
    }

    async fn allocate(&self, draft: &ReservationDraft) -> Result<ReservationRecord, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let owned = draft.clone();
        let result = conn
            .build_transaction()
            .serializable()
            .run(|conn| Box::pin(async move { allocate_in(conn, &owned).await }))
            .await;
        match result {
            // A concurrent replay of the same unit committed first.
            Err(StoreError::DuplicateReservation) => self
                .committed_reservation(draft.reservation_id)
                .await?
                .ok_or(StoreError::DuplicateReservation),
            other => other,
        }
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<ReservationRecord>, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let token = token.to_string();
        conn.build_transaction()
            .read_only()
            .repeatable_read()
            .run(|conn| {
                Box::pin(async move {
                    let row = qr_tokens::table
                        .find(&token)
                        .first::<DbQrToken>(conn)
                        .await
                        .optional()?;
                    match row {
                        Some(token_row) => load_record(conn, token_row, false).await.map(Some),
                        None => Ok(None),
                    }
                })
            })
            .await
    }

    async fn confirm_pickup(&self, request: &PickupConfirmation) -> Result<ReservationRecord, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let request = request.clone();
        conn.build_transaction()
            .serializable()
            .run(|conn| Box::pin(async move { confirm_in(conn, &request).await }))
            .await
    }

    async fn reservations(&self, filter: &ReservationFilter) -> Result<Vec<ReservationRecord>, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let mut query = reservations::table.into_boxed();
        if let Some(consumer_id) = filter.consumer_id {
            query = query.filter(reservations::consumer_id.eq(consumer_id));
        }
        if let Some(store_ids) = &filter.store_ids {
            query = query.filter(reservations::store_id.eq_any(store_ids.clone()));
        }
        if let Some(status) = filter.status {
            query = query.filter(reservations::status.eq(status.as_str()));
        }
        query = match filter.order {
            ReservationOrder::NewestCreated => query.order(reservations::created_at.desc()),
            ReservationOrder::NewestUpdated => query.order(reservations::updated_at.desc()),
        };
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }

        let rows = query.load::<DbReservation>(&mut conn).await?;
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();

        let mut items: HashMap<Uuid, Vec<DbReservationItem>> = HashMap::new();
        for item in reservation_items::table
            .filter(reservation_items::reservation_id.eq_any(ids.clone()))
            .load::<DbReservationItem>(&mut conn)
            .await?
        {
            items.entry(item.reservation_id).or_default().push(item);
        }

        let mut tokens: HashMap<Uuid, DbQrToken> = qr_tokens::table
            .filter(qr_tokens::reservation_id.eq_any(ids))
            .load::<DbQrToken>(&mut conn)
            .await?
            .into_iter()
            .map(|token| (token.reservation_id, token))
            .collect();

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(token) = tokens.remove(&row.id) else {
                warn!("Reservation {} has no pickup token, skipping", row.id);
                continue;
            };
            let row_items = items.remove(&row.id).unwrap_or_default();
            records.push(ReservationRecord {
                reservation: row.into_domain(row_items)?,
                token: token.try_into()?,
            });
        }
        Ok(records)
    }

    async fn stores_owned_by(&self, merchant_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let ids = stores::table
            .filter(stores::merchant_id.eq(merchant_id))
            .select(stores::id)
            .load::<Uuid>(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        conn.build_transaction()
            .serializable()
            .run(|conn| Box::pin(async move { sweep_in(conn, now).await }))
            .await
    }
}

async fn load_record(
    conn: &mut AsyncPgConnection,
    token_row: DbQrToken,
    lock: bool,
) -> Result<ReservationRecord, StoreError> {
    let reservation_query = reservations::table.find(token_row.reservation_id);
    let reservation_row = if lock {
        reservation_query.for_update().first::<DbReservation>(conn).await?
    } else {
        reservation_query.first::<DbReservation>(conn).await?
    };
    let items = reservation_items::table
        .filter(reservation_items::reservation_id.eq(reservation_row.id))
        .load::<DbReservationItem>(conn)
        .await?;

    Ok(ReservationRecord {
        reservation: reservation_row.into_domain(items)?,
        token: token_row.try_into()?,
    })
}

async fn existing_reservation(
    conn: &mut AsyncPgConnection,
    reservation_id: Uuid,
) -> Result<Option<ReservationRecord>, StoreError> {
    let token_row = qr_tokens::table
        .filter(qr_tokens::reservation_id.eq(reservation_id))
        .first::<DbQrToken>(conn)
        .await
        .optional()?;
    match token_row {
        Some(token_row) => load_record(conn, token_row, false).await.map(Some),
        None => Ok(None),
    }
}

async fn allocate_in(conn: &mut AsyncPgConnection, draft: &ReservationDraft) -> Result<ReservationRecord, StoreError> {
    // A retry of a unit that already committed gets the committed record.
    if let Some(existing) = existing_reservation(conn, draft.reservation_id).await? {
        return Ok(existing);
    }

    let offer: Offer = match offers::table
        .find(draft.offer_id)
        .for_update()
        .first::<DbOffer>(conn)
        .await
        .optional()?
    {
        Some(row) => row.try_into()?,
        None => return Err(PickupError::OfferNotFound(draft.offer_id).into()),
    };

    check_reservable(&offer, draft.quantity, draft.now)?;

    // The row is locked and the isolation level is serializable; the guard on
    // quantity_available keeps the decrement safe even if either were relaxed.
    let hint = offer.status_after_decrement(draft.quantity, draft.now);
    let remaining = diesel::update(
        offers::table
            .filter(offers::id.eq(offer.id))
            .filter(offers::quantity_available.ge(draft.quantity)),
    )
    .set((
        offers::quantity_available.eq(offers::quantity_available - draft.quantity),
        offers::status.eq(hint.as_str()),
    ))
    .returning(offers::quantity_available)
    .get_result::<i32>(conn)
    .await
    .optional()?;

    if remaining.is_none() {
        return Err(PickupError::InsufficientStock {
            requested: draft.quantity,
            available: offer.quantity_available,
        }
        .into());
    }

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

    diesel::insert_into(reservations::table)
        .values(NewReservation::from(&reservation))
        .execute(conn)
        .await?;
    diesel::insert_into(reservation_items::table)
        .values(DbReservationItem::rows_for(&reservation))
        .execute(conn)
        .await?;
    diesel::insert_into(qr_tokens::table)
        .values(DbQrToken::from(&token))
        .execute(conn)
        .await?;

    Ok(ReservationRecord { reservation, token })
}

async fn confirm_in(conn: &mut AsyncPgConnection, request: &PickupConfirmation) -> Result<ReservationRecord, StoreError> {
    let token_row = qr_tokens::table
        .find(&request.token)
        .for_update()
        .first::<DbQrToken>(conn)
        .await
        .optional()?;
    let token_row = match token_row {
        Some(row) if row.reservation_id == request.reservation_id => row,
        _ => return Err(PickupError::TokenNotFound.into()),
    };

    let ReservationRecord {
        mut reservation,
        mut token,
    } = load_record(conn, token_row, true).await?;
    if token.confirmed_by(request.actor_id, request.now) {
        return Ok(ReservationRecord { reservation, token });
    }
    check_pickup(request.required_store, &token, &reservation, request.now)?;

    let used = diesel::update(
        qr_tokens::table
            .filter(qr_tokens::token.eq(&token.token))
            .filter(qr_tokens::status.eq(TokenStatus::Active.as_str())),
    )
    .set((
        qr_tokens::status.eq(TokenStatus::Used.as_str()),
        qr_tokens::used_at.eq(Some(request.now)),
        qr_tokens::used_by.eq(Some(request.actor_id)),
    ))
    .execute(conn)
    .await?;
    if used != 1 {
        return Err(PickupError::TokenAlreadyUsed.into());
    }

    let picked_up = diesel::update(
        reservations::table
            .filter(reservations::id.eq(reservation.id))
            .filter(reservations::status.eq(ReservationStatus::Active.as_str())),
    )
    .set((
        reservations::status.eq(ReservationStatus::PickedUp.as_str()),
        reservations::updated_at.eq(request.now),
    ))
    .execute(conn)
    .await?;
    if picked_up != 1 {
        return Err(PickupError::ReservationNotActive(reservation.status).into());
    }

    token.status = TokenStatus::Used;
    token.used_at = Some(request.now);
    token.used_by = Some(request.actor_id);
    reservation.status = ReservationStatus::PickedUp;
    reservation.updated_at = request.now;

    // Savepoint: a failing audit insert rolls back only itself.
    let entry = NewAuditLog::from(&AuditEntry::pickup_confirmed(
        request.actor_id,
        &reservation,
        &token.token,
        request.now,
    ));
    let audit = conn
        .transaction::<_, diesel::result::Error, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(audit_logs::table)
                    .values(&entry)
                    .execute(conn)
                    .await
                    .map(|_| ())
            })
        })
        .await;
    if let Err(e) = audit {
        error!("Failed to append pickup audit entry for reservation {}: {}", reservation.id, e);
    }

    Ok(ReservationRecord { reservation, token })
}

async fn sweep_in(conn: &mut AsyncPgConnection, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
    let mut report = SweepReport::default();

    let overdue = reservations::table
        .filter(reservations::status.eq(ReservationStatus::Active.as_str()))
        .filter(reservations::expires_at.lt(now))
        .order(reservations::expires_at.asc())
        .limit(SWEEP_BATCH)
        .for_update()
        .skip_locked()
        .load::<DbReservation>(conn)
        .await?;

    for row in overdue {
        let flipped = diesel::update(
            reservations::table
                .filter(reservations::id.eq(row.id))
                .filter(reservations::status.eq(ReservationStatus::Active.as_str())),
        )
        .set((
            reservations::status.eq(ReservationStatus::Expired.as_str()),
            reservations::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
        if flipped == 0 {
            continue;
        }
        report.reservations_expired += 1;

        report.tokens_expired += diesel::update(
            qr_tokens::table
                .filter(qr_tokens::reservation_id.eq(row.id))
                .filter(qr_tokens::status.eq(TokenStatus::Active.as_str())),
        )
        .set(qr_tokens::status.eq(TokenStatus::Expired.as_str()))
        .execute(conn)
        .await?;

        let items = reservation_items::table
            .filter(reservation_items::reservation_id.eq(row.id))
            .load::<DbReservationItem>(conn)
            .await?;
        for item in items {
            diesel::update(offers::table.filter(offers::id.eq(item.offer_id)))
                .set(offers::quantity_available.eq(offers::quantity_available + item.quantity))
                .execute(conn)
                .await?;
            report.units_released += i64::from(item.quantity);
        }
    }

    report.offers_refreshed += diesel::update(
        offers::table
            .filter(offers::ends_at.le(now))
            .filter(offers::status.ne(OfferStatus::Expired.as_str())),
    )
    .set(offers::status.eq(OfferStatus::Expired.as_str()))
    .execute(conn)
    .await?;

    report.offers_refreshed += diesel::update(
        offers::table
            .filter(offers::ends_at.gt(now))
            .filter(offers::quantity_available.eq(0))
            .filter(offers::status.ne(OfferStatus::SoldOut.as_str())),
    )
    .set(offers::status.eq(OfferStatus::SoldOut.as_str()))
    .execute(conn)
    .await?;

    report.offers_refreshed += diesel::update(
        offers::table
            .filter(offers::starts_at.le(now))
            .filter(offers::ends_at.gt(now))
            .filter(offers::quantity_available.gt(0))
            .filter(offers::status.ne(OfferStatus::Live.as_str())),
    )
    .set(offers::status.eq(OfferStatus::Live.as_str()))
    .execute(conn)
    .await?;

    Ok(report)
}

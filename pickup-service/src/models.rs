use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::{
    AuditEntry, Offer, ParseStatusError, QrToken, Reservation, ReservationItem,
};
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::offers)]
pub struct DbOffer {
    pub id: Uuid,
    pub store_id: Uuid,
    pub product_id: Uuid,
    pub original_price: BigDecimal,
    pub discounted_price: BigDecimal,
    pub quantity_total: i32,
    pub quantity_available: i32,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub dlc_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stores)]
pub struct NewStore {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::offers)]
pub struct NewOffer {
    pub id: Uuid,
    pub store_id: Uuid,
    pub product_id: Uuid,
    pub original_price: BigDecimal,
    pub discounted_price: BigDecimal,
    pub quantity_total: i32,
    pub quantity_available: i32,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub dlc_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct DbReservation {
    pub id: Uuid,
    pub consumer_id: Uuid,
    pub store_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct NewReservation {
    pub id: Uuid,
    pub consumer_id: Uuid,
    pub store_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::reservation_items)]
pub struct DbReservationItem {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub offer_id: Uuid,
    pub position: i32,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::qr_tokens)]
pub struct DbQrToken {
    pub token: String,
    pub reservation_id: Uuid,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<Uuid>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::audit_logs)]
pub struct NewAuditLog {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbOffer> for Offer {
    type Error = ParseStatusError;

    fn try_from(row: DbOffer) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            store_id: row.store_id,
            product_id: row.product_id,
            original_price: row.original_price,
            discounted_price: row.discounted_price,
            quantity_total: row.quantity_total,
            quantity_available: row.quantity_available,
            status: row.status.parse()?,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            dlc_date: row.dlc_date,
        })
    }
}

impl From<&Offer> for NewOffer {
    fn from(offer: &Offer) -> Self {
        Self {
            id: offer.id,
            store_id: offer.store_id,
            product_id: offer.product_id,
            original_price: offer.original_price.clone(),
            discounted_price: offer.discounted_price.clone(),
            quantity_total: offer.quantity_total,
            quantity_available: offer.quantity_available,
            status: offer.status.as_str().to_string(),
            starts_at: offer.starts_at,
            ends_at: offer.ends_at,
            dlc_date: offer.dlc_date,
        }
    }
}

impl DbReservation {
    /// Assembles the domain reservation; `items` may arrive in any order.
    pub fn into_domain(self, mut items: Vec<DbReservationItem>) -> Result<Reservation, ParseStatusError> {
        items.sort_by_key(|item| item.position);
        Ok(Reservation {
            id: self.id,
            consumer_id: self.consumer_id,
            store_id: self.store_id,
            status: self.status.parse()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            items: items
                .into_iter()
                .map(|item| ReservationItem {
                    offer_id: item.offer_id,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .collect(),
        })
    }
}

impl From<&Reservation> for NewReservation {
    fn from(reservation: &Reservation) -> Self {
        Self {
            id: reservation.id,
            consumer_id: reservation.consumer_id,
            store_id: reservation.store_id,
            status: reservation.status.as_str().to_string(),
            created_at: reservation.created_at,
            updated_at: reservation.updated_at,
            expires_at: reservation.expires_at,
        }
    }
}

impl DbReservationItem {
    pub fn rows_for(reservation: &Reservation) -> Vec<Self> {
        reservation
            .items
            .iter()
            .enumerate()
            .map(|(position, item)| Self {
                id: Uuid::new_v4(),
                reservation_id: reservation.id,
                offer_id: item.offer_id,
                position: position as i32,
                quantity: item.quantity,
                unit_price: item.unit_price.clone(),
            })
            .collect()
    }
}

impl TryFrom<DbQrToken> for QrToken {
    type Error = ParseStatusError;

    fn try_from(row: DbQrToken) -> Result<Self, Self::Error> {
        Ok(Self {
            token: row.token,
            reservation_id: row.reservation_id,
            status: row.status.parse()?,
            expires_at: row.expires_at,
            used_at: row.used_at,
            used_by: row.used_by,
        })
    }
}

impl From<&QrToken> for DbQrToken {
    fn from(token: &QrToken) -> Self {
        Self {
            token: token.token.clone(),
            reservation_id: token.reservation_id,
            status: token.status.as_str().to_string(),
            expires_at: token.expires_at,
            used_at: token.used_at,
            used_by: token.used_by,
        }
    }
}

impl From<&AuditEntry> for NewAuditLog {
    fn from(entry: &AuditEntry) -> Self {
        Self {
            id: entry.id,
            actor_id: entry.actor_id,
            action: entry.action.clone(),
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id,
            metadata: entry.metadata.clone(),
            created_at: entry.created_at,
        }
    }
}

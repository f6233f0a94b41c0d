diesel::table! {
    audit_logs (id) {
        id -> Uuid,
        actor_id -> Uuid,
        action -> Varchar,
        entity_type -> Varchar,
        entity_id -> Uuid,
        metadata -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    offers (id) {
        id -> Uuid,
        store_id -> Uuid,
        product_id -> Uuid,
        original_price -> Numeric,
        discounted_price -> Numeric,
        quantity_total -> Int4,
        quantity_available -> Int4,
        status -> Varchar,
        starts_at -> Timestamptz,
        ends_at -> Timestamptz,
        dlc_date -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    qr_tokens (token) {
        token -> Varchar,
        reservation_id -> Uuid,
        status -> Varchar,
        expires_at -> Timestamptz,
        used_at -> Nullable<Timestamptz>,
        used_by -> Nullable<Uuid>,
    }
}

diesel::table! {
    reservation_items (id) {
        id -> Uuid,
        reservation_id -> Uuid,
        offer_id -> Uuid,
        position -> Int4,
        quantity -> Int4,
        unit_price -> Numeric,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        consumer_id -> Uuid,
        store_id -> Uuid,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        expires_at -> Timestamptz,
    }
}

diesel::table! {
    stores (id) {
        id -> Uuid,
        merchant_id -> Uuid,
        name -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(offers -> stores (store_id));
diesel::joinable!(qr_tokens -> reservations (reservation_id));
diesel::joinable!(reservation_items -> offers (offer_id));
diesel::joinable!(reservation_items -> reservations (reservation_id));
diesel::joinable!(reservations -> stores (store_id));

diesel::allow_tables_to_appear_in_same_query!(
    audit_logs,
    offers,
    qr_tokens,
    reservation_items,
    reservations,
    stores,
);

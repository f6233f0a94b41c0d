use crate::allocator::{Allocator, ReserveRequest};
use crate::auth::Authenticated;
use crate::errors::Result;
use crate::extract::{ValidJson, ValidPath, ValidQuery};
use crate::ledger::OfferLedger;
use crate::queries::ReservationQueries;
use crate::verifier::{ConfirmRequest, ScanRequest, Verifier};
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{OfferView, PickupError, ReservationSnapshot, TokenSnapshot};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<OfferLedger>,
    pub allocator: Arc<Allocator>,
    pub verifier: Arc<Verifier>,
    pub queries: Arc<ReservationQueries>,
}

#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    pub success: bool,
    pub reservation_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub reservation: ReservationSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub success: bool,
    pub reservation: ReservationSnapshot,
    pub token: TokenSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub success: bool,
    pub reservation: ReservationSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct StoreQuery {
    /// A store id, or `ALL` / absent for no filter.
    pub store_id: Option<String>,
}

impl StoreQuery {
    fn store_filter(&self) -> Result<Option<Uuid>, PickupError> {
        match self.store_id.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(all) if all.eq_ignore_ascii_case("ALL") => Ok(None),
            Some(raw) => Uuid::parse_str(raw)
                .map(Some)
                .map_err(|_| PickupError::Validation(format!("invalid store id: {raw}"))),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/offers", get(list_offers))
        .route("/offers/:id", get(get_offer))
        .route("/reservations", post(create_reservation))
        .route("/reservations/mine", get(my_reservations))
        .route("/pickup/scan", post(scan))
        .route("/pickup/confirm", post(confirm))
        .route("/pickup/history", get(pickup_history))
        .route("/admin/reservations", get(list_reservations))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn list_offers(State(state): State<AppState>) -> Result<Json<Vec<OfferView>>> {
    Ok(Json(state.ledger.list_live().await?))
}

pub async fn get_offer(State(state): State<AppState>, ValidPath(id): ValidPath<Uuid>) -> Result<Json<OfferView>> {
    Ok(Json(state.ledger.get(id).await?))
}

pub async fn create_reservation(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    ValidJson(request): ValidJson<ReserveRequest>,
) -> Result<Json<ReserveResponse>> {
    let record = state.allocator.reserve(&principal, &request).await?;
    Ok(Json(ReserveResponse {
        success: true,
        reservation_id: record.reservation.id,
        expires_at: record.reservation.expires_at,
        reservation: ReservationSnapshot::at(&record, record.reservation.created_at),
    }))
}

pub async fn my_reservations(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> Result<Json<Vec<ReservationSnapshot>>> {
    Ok(Json(state.queries.my_reservations(&principal).await?))
}

pub async fn scan(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    ValidJson(request): ValidJson<ScanRequest>,
) -> Result<Json<ScanResponse>> {
    let reservation = state.verifier.validate(&principal, &request.token).await?;
    Ok(Json(ScanResponse {
        success: true,
        token: reservation.token.clone(),
        reservation,
    }))
}

pub async fn confirm(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    ValidJson(request): ValidJson<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>> {
    let reservation = state
        .verifier
        .confirm(&principal, request.reservation_id, &request.token)
        .await?;
    Ok(Json(ConfirmResponse {
        success: true,
        reservation,
    }))
}

pub async fn pickup_history(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> Result<Json<Vec<ReservationSnapshot>>> {
    Ok(Json(state.queries.pickup_history(&principal).await?))
}

pub async fn list_reservations(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    ValidQuery(query): ValidQuery<StoreQuery>,
) -> Result<Json<Vec<ReservationSnapshot>>> {
    let store_id = query.store_filter()?;
    Ok(Json(state.queries.list_reservations(&principal, store_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{PRINCIPAL_ID_HEADER, PRINCIPAL_ROLE_HEADER, PRINCIPAL_STORE_HEADER};
    use crate::test_utils::{fast_retry, Fixture};
    use crate::tokens::TokenIssuer;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use bigdecimal::BigDecimal;
    use serde_json::{json, Value};
    use shared::{Clock, Principal};
    use tower::ServiceExt;

    struct Harness {
        fx: Fixture,
        app: Router,
    }

    impl Harness {
        fn new() -> Self {
            let fx = Fixture::new();
            let backend: Arc<dyn crate::store::PickupStore> = Arc::new(fx.store.clone());
            let clock: Arc<dyn Clock> = fx.clock.clone();
            let state = AppState {
                ledger: Arc::new(OfferLedger::new(backend.clone(), clock.clone(), fast_retry())),
                allocator: Arc::new(Allocator::new(
                    backend.clone(),
                    clock.clone(),
                    TokenIssuer::new(),
                    chrono::Duration::hours(2),
                    fast_retry(),
                )),
                verifier: Arc::new(Verifier::new(backend.clone(), clock.clone(), fast_retry())),
                queries: Arc::new(ReservationQueries::new(backend, clock, fast_retry())),
            };
            Self {
                fx,
                app: create_router(state),
            }
        }

        async fn call(&self, method: &str, uri: &str, principal: Option<Principal>, body: Option<Value>) -> (StatusCode, Value) {
            self.send(method, uri, principal, body.map(|value| value.to_string())).await
        }

        async fn send(&self, method: &str, uri: &str, principal: Option<Principal>, body: Option<String>) -> (StatusCode, Value) {
            let mut request = Request::builder().method(method).uri(uri);
            if let Some(principal) = principal {
                request = request
                    .header(PRINCIPAL_ID_HEADER, principal.id().to_string())
                    .header(PRINCIPAL_ROLE_HEADER, principal.role().to_string());
                if let Principal::Cashier { store_id, .. } = principal {
                    request = request.header(PRINCIPAL_STORE_HEADER, store_id.to_string());
                }
            }
            let body = match body {
                Some(raw) => {
                    request = request.header("content-type", "application/json");
                    Body::from(raw)
                }
                None => Body::empty(),
            };

            let response = self
                .app
                .clone()
                .oneshot(request.body(body).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = Harness::new();
        let response = h
            .app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn offer_feed_shows_derived_status() {
        let h = Harness::new();
        let offer_id = h.fx.add_offer(3, BigDecimal::from(4));
        h.fx.add_offer_starting_in(chrono::Duration::hours(1), 2);

        let (status, body) = h.call("GET", "/offers", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let feed = body.as_array().unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0]["id"], json!(offer_id));
        assert_eq!(feed[0]["effective_status"], json!("LIVE"));

        let (status, body) = h.call("GET", &format!("/offers/{}", Uuid::new_v4()), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("OFFER_NOT_FOUND"));
    }

    #[tokio::test]
    async fn reserve_then_scan_then_confirm() {
        let h = Harness::new();
        let offer_id = h.fx.add_offer(3, BigDecimal::from(4));
        let consumer = h.fx.consumer();

        let (status, body) = h
            .call(
                "POST",
                "/reservations",
                Some(consumer),
                Some(json!({ "offer_id": offer_id, "quantity": 2 })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        let reservation_id = body["reservation_id"].clone();
        let token = body["reservation"]["token"]["token"].as_str().unwrap().to_string();

        let cashier = h.fx.cashier(h.fx.store_id);
        let (status, body) = h
            .call("POST", "/pickup/scan", Some(cashier), Some(json!({ "token": token })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reservation"]["id"], reservation_id);
        assert_eq!(body["reservation"]["items"][0]["quantity"], json!(2));
        assert_eq!(body["token"]["status"], json!("ACTIVE"));

        let confirm = json!({ "reservation_id": reservation_id, "token": token });
        let (status, body) = h
            .call("POST", "/pickup/confirm", Some(cashier), Some(confirm.clone()))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reservation"]["status"], json!("PICKED_UP"));

        h.fx.clock.advance(chrono::Duration::seconds(5));
        let (status, body) = h.call("POST", "/pickup/confirm", Some(cashier), Some(confirm)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], json!("TOKEN_ALREADY_USED"));

        let (status, body) = h.call("GET", "/pickup/history", Some(cashier), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn error_statuses() {
        let h = Harness::new();
        let offer_id = h.fx.add_offer(1, BigDecimal::from(4));
        let reserve = |quantity: i32| json!({ "offer_id": offer_id, "quantity": quantity });

        let (status, body) = h.call("POST", "/reservations", None, Some(reserve(1))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], json!("UNAUTHENTICATED"));

        let (status, _) = h
            .call("POST", "/reservations", Some(h.fx.admin()), Some(reserve(1)))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = h
            .call("POST", "/reservations", Some(h.fx.consumer()), Some(reserve(0)))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = h
            .call("POST", "/reservations", Some(h.fx.consumer()), Some(reserve(2)))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], json!("INSUFFICIENT_STOCK"));

        let (status, body) = h
            .call(
                "POST",
                "/pickup/scan",
                Some(h.fx.admin()),
                Some(json!({ "token": "RES-0000-0000-0000" })),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("TOKEN_NOT_FOUND"));

        h.fx.store.inject_conflicts(100).unwrap();
        let (status, body) = h
            .call("POST", "/reservations", Some(h.fx.consumer()), Some(reserve(1)))
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], json!("SERVICE_UNAVAILABLE"));
    }

    #[tokio::test]
    async fn admin_listing_filters_by_store() {
        let h = Harness::new();
        let offer_id = h.fx.add_offer(3, BigDecimal::from(4));
        h.call(
            "POST",
            "/reservations",
            Some(h.fx.consumer()),
            Some(json!({ "offer_id": offer_id, "quantity": 1 })),
        )
        .await;

        let (status, body) = h
            .call("GET", "/admin/reservations?store_id=ALL", Some(h.fx.admin()), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let uri = format!("/admin/reservations?store_id={}", h.fx.store_id);
        let (status, body) = h.call("GET", &uri, Some(h.fx.merchant()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = h
            .call("GET", "/admin/reservations?store_id=nope", Some(h.fx.admin()), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h
            .call("GET", "/admin/reservations", Some(h.fx.cashier(h.fx.store_id)), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn malformed_input_gets_the_error_body() {
        let h = Harness::new();
        let offer_id = h.fx.add_offer(3, BigDecimal::from(4));
        let consumer = h.fx.consumer();

        let (status, body) = h
            .call("POST", "/reservations", Some(consumer), Some(json!({ "offer_id": offer_id })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));
        assert!(body["error"].as_str().unwrap().contains("quantity"));

        let (status, body) = h
            .send("POST", "/pickup/scan", Some(h.fx.admin()), Some("{not json".to_string()))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let (status, body) = h
            .call(
                "POST",
                "/pickup/confirm",
                Some(h.fx.admin()),
                Some(json!({ "reservation_id": "not-a-uuid", "token": "RES-0000-0000-0000" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let (status, body) = h.call("GET", "/offers/not-a-uuid", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let (status, _) = h.call("GET", "/reservations/mine", Some(consumer), None).await;
        assert_eq!(status, StatusCode::OK);
    }
}

//! HTTP surface: storefront proxy, platform webhooks and the admin API.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, MatchedPath, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::booking::{
    AdminCancelOutcome, BookingService, CompleteOutcome, HoldError, HoldOutcome, HoldRequest, ORDERS_CREATE,
    ReleaseOutcome,
};
use crate::dates::parse_date;
use crate::engine::{EngineError, GuardFailure};
use crate::limits::MAX_WEBHOOK_BODY_BYTES;
use crate::model::*;
use crate::ratelimit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BookingService>,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/proxy/hold", post(place_hold))
        .route("/proxy/release", post(release))
        .route("/proxy/availability", get(availability))
        .route(
            "/webhooks/orders/create",
            post(order_webhook).layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES)),
        )
        .route("/admin/bookings", get(list_bookings))
        .route("/admin/bookings/:token", get(booking_detail))
        .route("/admin/bookings/:token/cancel", post(cancel_booking))
        .route("/admin/bookings/:token/complete", post(complete_booking))
        .route("/admin/shops", put(put_shop))
        .route("/admin/locations", put(put_location))
        .route("/admin/products", put(put_product))
        .route("/admin/inventory", put(put_inventory))
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let start = Instant::now();
    let response = next.run(req).await;
    metrics::histogram!(
        crate::observability::HTTP_REQUEST_DURATION_SECONDS,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .record(start.elapsed().as_secs_f64());
    response
}

// ── Errors ──────────────────────────────────────────────────────

/// Every failure leaves as `{ok: false, error: {code, reason}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    reason: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, reason: impl Into<String>) -> Self {
        Self {
            status,
            code,
            reason: reason.into(),
        }
    }

    fn bad_request(code: &'static str, reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, reason)
    }

    fn not_found(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", reason)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "ok": false,
            "error": { "code": self.code, "reason": self.reason },
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Guard(g @ GuardFailure::CapacityBelowReserved { .. }) => {
                Self::new(StatusCode::CONFLICT, "capacity_below_reserved", g.to_string())
            }
            EngineError::Guard(g @ GuardFailure::CapacityExhausted { .. }) => {
                Self::new(StatusCode::CONFLICT, "capacity_exceeded", g.to_string())
            }
            EngineError::Guard(g) => Self::new(StatusCode::CONFLICT, "conflict", g.to_string()),
            EngineError::Invalid(msg) => Self::bad_request("invalid_request", msg),
            EngineError::LimitExceeded(msg) => Self::bad_request("limit_exceeded", msg),
            EngineError::WalError(msg) => {
                tracing::error!("request failed on storage: {msg}");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error")
            }
        }
    }
}

impl From<HoldError> for ApiError {
    fn from(e: HoldError) -> Self {
        let status = if e.is_capacity_conflict() {
            StatusCode::CONFLICT
        } else {
            StatusCode::BAD_REQUEST
        };
        Self::new(status, e.code(), e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request("invalid_body", e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::bad_request("invalid_query", e.body_text())
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn require_shop(shop: Option<String>) -> Result<String, ApiError> {
    shop.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing_shop", "shop parameter is required"))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map_or("", str::trim)
}

/// Best-effort client identity for rate limiting.
fn client_key(headers: &HeaderMap) -> &str {
    let forwarded = header_str(headers, "x-forwarded-for");
    let first = forwarded.split(',').next().map_or("", str::trim);
    if !first.is_empty() {
        return first;
    }
    match header_str(headers, "x-real-ip") {
        "" => "unknown",
        ip => ip,
    }
}

fn date_param(raw: Option<&str>, name: &'static str) -> Result<Option<jiff::civil::Date>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => parse_date(s)
            .map(Some)
            .ok_or_else(|| ApiError::bad_request("invalid_dates", format!("{name} must be YYYY-MM-DD"))),
    }
}

async fn health() -> &'static str {
    "OK"
}

// ── Storefront proxy ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ShopQuery {
    shop: Option<String>,
}

async fn place_hold(
    State(state): State<AppState>,
    query: Result<Query<ShopQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Result<Json<HoldRequest>, JsonRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let shop = require_shop(query.shop)?;
    let key = format!("{shop}|{}", client_key(&headers));
    if !state.limiter.check(&key, state.service.now()) {
        metrics::counter!(crate::observability::RATE_LIMITED_TOTAL).increment(1);
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "too many hold requests, try again shortly",
        ));
    }
    let Json(request) = body?;
    match state.service.place_hold(&shop, &request).await? {
        HoldOutcome::Held(receipt) => Ok(Json(json!({
            "ok": true,
            "booking_token": receipt.booking_token,
            "expires_at": receipt.expires_at,
        }))),
        HoldOutcome::Rejected(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseBody {
    booking_token: String,
}

async fn release(
    State(state): State<AppState>,
    query: Result<Query<ShopQuery>, QueryRejection>,
    body: Result<Json<ReleaseBody>, JsonRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let shop = require_shop(query.shop)?;
    let Json(body) = body?;
    match state.service.release_by_token(&shop, body.booking_token.trim()).await? {
        ReleaseOutcome::Released(status) | ReleaseOutcome::Unchanged(status) => {
            Ok(Json(json!({ "ok": true, "status": status })))
        }
        ReleaseOutcome::NotFound => Err(ApiError::not_found("unknown booking")),
    }
}

#[derive(Debug, Deserialize)]
struct AvailabilityQuery {
    shop: Option<String>,
    product_id: Option<i64>,
    start_date: Option<String>,
    end_date: Option<String>,
}

async fn availability(
    State(state): State<AppState>,
    query: Result<Query<AvailabilityQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let shop = require_shop(query.shop)?;
    let product_id = query
        .product_id
        .ok_or_else(|| ApiError::bad_request("invalid_request", "product_id is required"))?;
    let (Some(start), Some(end)) = (
        date_param(query.start_date.as_deref(), "start_date")?,
        date_param(query.end_date.as_deref(), "end_date")?,
    ) else {
        return Err(ApiError::bad_request("invalid_dates", "start_date and end_date are required"));
    };
    let engine = state.service.engine();
    if engine.product(&shop, product_id).await.is_none() {
        return Err(ApiError::not_found(format!("unknown product {product_id}")));
    }
    let days = engine
        .availability(&shop, product_id, start, end)
        .await
        .ok_or_else(|| ApiError::bad_request("invalid_dates", "date range is empty or too wide"))?;
    Ok(Json(json!({ "ok": true, "product_id": product_id, "days": days })))
}

// ── Webhooks ────────────────────────────────────────────────────

async fn order_webhook(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    let shop = header_str(&headers, "x-shopify-shop-domain");
    if shop.is_empty() {
        return ApiError::bad_request("missing_shop", "X-Shopify-Shop-Domain header is required").into_response();
    }
    let topic = match header_str(&headers, "x-shopify-topic") {
        "" => ORDERS_CREATE,
        topic => topic,
    };
    let event_id = header_str(&headers, "x-shopify-webhook-id");
    let outcome = state.service.confirm_from_order(shop, event_id, topic, &body).await;
    let status = StatusCode::from_u16(outcome.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(outcome.summary)).into_response()
}

// ── Admin ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListQuery {
    shop: Option<String>,
    status: Option<String>,
    from: Option<String>,
    to: Option<String>,
    q: Option<String>,
    limit: Option<usize>,
}

async fn list_bookings(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let shop = require_shop(query.shop)?;
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => Some(
            BookingStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request("invalid_status", format!("unknown status {raw}")))?,
        ),
    };
    let filter = BookingFilter {
        status,
        from: date_param(query.from.as_deref(), "from")?,
        to: date_param(query.to.as_deref(), "to")?,
        text: query.q,
        limit: query.limit,
    };
    let bookings = state.service.engine().list_bookings(&shop, &filter).await;
    Ok(Json(json!({ "ok": true, "bookings": bookings })))
}

async fn booking_detail(
    State(state): State<AppState>,
    Path(token): Path<String>,
    query: Result<Query<ShopQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let shop = require_shop(query.shop)?;
    let detail = state
        .service
        .engine()
        .booking_detail(&shop, &token)
        .await
        .ok_or_else(|| ApiError::not_found("unknown booking"))?;
    Ok(Json(json!({
        "ok": true,
        "booking": detail.booking,
        "items": detail.items,
        "days": detail.days,
    })))
}

async fn cancel_booking(
    State(state): State<AppState>,
    Path(token): Path<String>,
    query: Result<Query<ShopQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let shop = require_shop(query.shop)?;
    match state.service.admin_cancel(&shop, &token).await? {
        AdminCancelOutcome::Cancelled { previous, order } => Ok(Json(json!({
            "ok": true,
            "status": BookingStatus::Cancelled,
            "previous": previous,
            "order_cancellation": order,
        }))),
        AdminCancelOutcome::NotCancellable(status) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "not_cancellable",
            format!("booking is {status}"),
        )),
        AdminCancelOutcome::NotFound => Err(ApiError::not_found("unknown booking")),
    }
}

async fn complete_booking(
    State(state): State<AppState>,
    Path(token): Path<String>,
    query: Result<Query<ShopQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let shop = require_shop(query.shop)?;
    match state.service.complete_booking(&shop, &token).await? {
        CompleteOutcome::Fulfilled { order_id } => {
            Ok(Json(json!({ "ok": true, "fulfilled": true, "order_id": order_id })))
        }
        CompleteOutcome::AlreadyFulfilled => Ok(Json(json!({ "ok": true, "fulfilled": true, "already": true }))),
        CompleteOutcome::NotConfirmed(status) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "not_confirmed",
            format!("booking is {status}"),
        )),
        CompleteOutcome::FulfillmentFailed(reason) => {
            Err(ApiError::new(StatusCode::BAD_GATEWAY, "fulfillment_failed", reason))
        }
        CompleteOutcome::NotFound => Err(ApiError::not_found("unknown booking")),
    }
}

#[derive(Debug, Deserialize)]
struct ShopBody {
    domain: String,
    #[serde(default = "utc")]
    timezone: String,
}

fn utc() -> String {
    "UTC".into()
}

fn default_true() -> bool {
    true
}

async fn put_shop(State(state): State<AppState>, body: Result<Json<ShopBody>, JsonRejection>) -> ApiResult {
    let Json(body) = body?;
    let shop = state
        .service
        .engine()
        .upsert_shop(&body.domain, &body.timezone, state.service.now())
        .await?;
    Ok(Json(json!({ "ok": true, "shop": shop })))
}

#[derive(Debug, Deserialize)]
struct LocationBody {
    code: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default)]
    lead_time_days: i64,
    #[serde(default)]
    min_duration_days: i64,
}

async fn put_location(
    State(state): State<AppState>,
    query: Result<Query<ShopQuery>, QueryRejection>,
    body: Result<Json<LocationBody>, JsonRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let shop = require_shop(query.shop)?;
    let Json(body) = body?;
    let location = Location {
        shop,
        code: body.code.trim().to_string(),
        name: body.name,
        active: body.active,
        lead_time_days: body.lead_time_days,
        min_duration_days: body.min_duration_days,
    };
    state.service.engine().upsert_location(location.clone()).await?;
    Ok(Json(json!({ "ok": true, "location": location })))
}

#[derive(Debug, Deserialize)]
struct ProductBody {
    product_id: i64,
    #[serde(default)]
    variant_id: Option<i64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default = "default_true")]
    rentable: bool,
    default_capacity: i64,
    #[serde(default)]
    deposit_variant_id: Option<i64>,
    #[serde(default)]
    deposit_multiplier: Option<i64>,
}

async fn put_product(
    State(state): State<AppState>,
    query: Result<Query<ShopQuery>, QueryRejection>,
    body: Result<Json<ProductBody>, JsonRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let shop = require_shop(query.shop)?;
    let Json(body) = body?;
    let product = Product {
        shop,
        product_id: body.product_id,
        variant_id: body.variant_id,
        title: body.title,
        rentable: body.rentable,
        default_capacity: body.default_capacity,
        deposit_variant_id: body.deposit_variant_id,
        deposit_multiplier: body.deposit_multiplier,
    };
    state.service.engine().upsert_product(product.clone()).await?;
    Ok(Json(json!({ "ok": true, "product": product })))
}

#[derive(Debug, Deserialize)]
struct InventoryBody {
    product_id: i64,
    date: String,
    capacity: i64,
}

async fn put_inventory(
    State(state): State<AppState>,
    query: Result<Query<ShopQuery>, QueryRejection>,
    body: Result<Json<InventoryBody>, JsonRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let shop = require_shop(query.shop)?;
    let Json(body) = body?;
    let date = date_param(Some(body.date.as_str()), "date")?
        .ok_or_else(|| ApiError::bad_request("invalid_dates", "date is required"))?;
    let engine = state.service.engine();
    engine.set_day_capacity(&shop, body.product_id, date, body.capacity).await?;
    let day = engine.inventory_day(&shop, body.product_id, date).await;
    Ok(Json(json!({ "ok": true, "day": day })))
}

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use ulid::Ulid;

use rentd::api::{self, AppState};
use rentd::booking::{BookingService, HoldSettings};
use rentd::clock::ManualClock;
use rentd::engine::Engine;
use rentd::gateway::{GatewayCall, RecordingGateway};
use rentd::ratelimit::RateLimiter;

// ── Test infrastructure ──────────────────────────────────────

const SHOP: &str = "http-playa.myshopify.com";
const NOW: i64 = 1_748_779_200_000; // 2025-06-01T12:00:00Z

struct TestApp {
    router: Router,
    gateway: Arc<RecordingGateway>,
    clock: Arc<ManualClock>,
}

fn test_app(rate_limit: u32) -> TestApp {
    let dir = std::env::temp_dir().join(format!("rentd_http_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("rentd.wal")).unwrap());
    let gateway = Arc::new(RecordingGateway::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let service = Arc::new(BookingService::new(
        engine,
        gateway.clone(),
        clock.clone(),
        HoldSettings::default(),
    ));
    let limiter = Arc::new(RateLimiter::per_minute(rate_limit));
    TestApp {
        router: api::router(AppState { service, limiter }),
        gateway,
        clock,
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn hold_from(ip: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(format!("/proxy/hold?shop={SHOP}"))
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn webhook(topic: Option<&str>, event_id: &str, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/orders/create")
        .header("content-type", "application/json")
        .header("x-shopify-shop-domain", SHOP)
        .header("x-shopify-webhook-id", event_id);
    if let Some(topic) = topic {
        builder = builder.header("x-shopify-topic", topic);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

/// Shop, one location without lead time, one product with a single unit.
async fn seed(app: &TestApp) {
    let (status, body) = send(
        app,
        json_request(Method::PUT, "/admin/shops", &json!({"domain": SHOP, "timezone": "UTC"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = send(
        app,
        json_request(
            Method::PUT,
            &format!("/admin/locations?shop={SHOP}"),
            &json!({"code": "PLAYA", "name": "Playa", "lead_time_days": 0, "min_duration_days": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = send(
        app,
        json_request(
            Method::PUT,
            &format!("/admin/products?shop={SHOP}"),
            &json!({"product_id": 1, "variant_id": 10, "title": "Kayak", "default_capacity": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

fn hold_body(start: &str, end: &str) -> Value {
    json!({
        "location": "PLAYA",
        "start_date": start,
        "end_date": end,
        "items": [{"product_id": 1, "qty": 1}],
    })
}

fn order_body(order_id: i64, token: &str, start: &str, end: &str) -> Value {
    json!({
        "id": order_id,
        "email": "ana@example.com",
        "customer": {"first_name": "Ana", "last_name": "Ruiz"},
        "line_items": [{
            "product_id": 1,
            "variant_id": 10,
            "quantity": 1,
            "price": "40.00",
            "properties": [
                {"name": "_booking_token", "value": token},
                {"name": "Start Date", "value": start},
                {"name": "End Date", "value": end},
                {"name": "Location", "value": "PLAYA"},
                {"name": "Fulfillment Type", "value": "pickup"}
            ]
        }]
    })
}

async fn place_hold(app: &TestApp, start: &str, end: &str) -> String {
    let (status, body) = send(app, hold_from("10.0.0.1", &hold_body(start, end))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], true);
    body["booking_token"].as_str().unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn hold_confirm_and_fulfill_over_http() {
    let app = test_app(100);
    seed(&app).await;

    let token = place_hold(&app, "2025-06-05", "2025-06-06").await;

    let (status, body) = send(
        &app,
        get(&format!(
            "/proxy/availability?shop={SHOP}&product_id=1&start_date=2025-06-04&end_date=2025-06-06"
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let available: Vec<i64> = body["days"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["available"].as_i64().unwrap())
        .collect();
    assert_eq!(available, vec![1, 0, 0]);

    let (status, body) = send(&app, webhook(Some("orders/create"), "evt-100", &order_body(5001, &token, "2025-06-05", "2025-06-06"))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "processed");
    assert_eq!(body["confirmed"], 1);
    assert_eq!(body["tokens"][0]["outcome"], "confirmed");

    let (status, body) = send(&app, get(&format!("/admin/bookings/{token}?shop={SHOP}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["booking"]["status"], "CONFIRMED");
    assert_eq!(body["booking"]["order_id"], 5001);
    assert_eq!(body["booking"]["customer_name"], "Ana Ruiz");
    assert_eq!(body["days"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app, get(&format!("/admin/bookings?shop={SHOP}&status=confirmed"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["bookings"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        json_request(Method::POST, &format!("/admin/bookings/{token}/complete?shop={SHOP}"), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["fulfilled"], true);
    assert_eq!(
        app.gateway.calls(),
        vec![GatewayCall::Fulfill { shop: SHOP.into(), order_id: 5001 }]
    );
}

#[tokio::test]
async fn webhook_redelivery_is_acknowledged_once() {
    let app = test_app(100);
    seed(&app).await;
    let token = place_hold(&app, "2025-06-05", "2025-06-05").await;
    let order = order_body(5002, &token, "2025-06-05", "2025-06-05");

    let (status, first) = send(&app, webhook(None, "evt-200", &order)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "processed");

    let (status, again) = send(&app, webhook(None, "evt-200", &order)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["status"], "duplicate");
    assert_eq!(again["confirmed"], 0);
}

#[tokio::test]
async fn webhook_edge_cases() {
    let app = test_app(100);
    seed(&app).await;
    let order = order_body(5003, "no-such-token", "2025-06-05", "2025-06-05");

    let (status, body) = send(&app, webhook(Some("orders/updated"), "evt-300", &order)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");

    let (status, body) = send(&app, webhook(Some("orders/create"), "", &order)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "missing_event_id");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/orders/create")
        .header("x-shopify-webhook-id", "evt-301")
        .body(Body::from(order.to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "missing_shop");

    // A token nobody issued still invalidates the order.
    let (status, body) = send(&app, webhook(None, "evt-302", &order)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalid"], 1);
    assert!(matches!(app.gateway.calls().as_slice(), [GatewayCall::Cancel { order_id: 5003, .. }]));
}

#[tokio::test]
async fn errors_share_one_shape() {
    let app = test_app(100);
    seed(&app).await;

    let request = json_request(Method::POST, "/proxy/hold", &hold_body("2025-06-05", "2025-06-05"));
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "missing_shop");
    assert!(body["error"]["reason"].is_string());

    let malformed = Request::builder()
        .method(Method::POST)
        .uri(format!("/proxy/hold?shop={SHOP}"))
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_body");

    let mut unknown_location = hold_body("2025-06-05", "2025-06-05");
    unknown_location["location"] = json!("NOWHERE");
    let (status, body) = send(&app, hold_from("10.0.0.2", &unknown_location)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "unknown_location");

    let (status, body) = send(
        &app,
        get(&format!("/proxy/availability?shop={SHOP}&product_id=99&start_date=2025-06-05&end_date=2025-06-06")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = send(
        &app,
        get(&format!("/proxy/availability?shop={SHOP}&product_id=1&start_date=2025-06-07&end_date=2025-06-05")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_dates");

    let (status, _) = send(&app, get(&format!("/admin/bookings/missing?shop={SHOP}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, get(&format!("/admin/bookings?shop={SHOP}&status=PENDING"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_status");

    let (status, body) = send(
        &app,
        json_request(Method::PUT, "/admin/shops", &json!({"domain": SHOP, "timezone": "Nowhere/Special"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn capacity_conflicts_are_409() {
    let app = test_app(100);
    seed(&app).await;
    let token = place_hold(&app, "2025-06-05", "2025-06-07").await;

    let (status, body) = send(&app, hold_from("10.0.0.3", &hold_body("2025-06-07", "2025-06-08"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "capacity_exceeded");

    let (status, body) = send(
        &app,
        json_request(
            Method::PUT,
            &format!("/admin/inventory?shop={SHOP}"),
            &json!({"product_id": 1, "date": "2025-06-06", "capacity": 0}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "capacity_below_reserved");

    // Raising capacity frees room for a second hold on that day.
    let (status, body) = send(
        &app,
        json_request(
            Method::PUT,
            &format!("/admin/inventory?shop={SHOP}"),
            &json!({"product_id": 1, "date": "2025-06-07", "capacity": 2}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["day"]["reserved_qty"], 1);
    place_hold(&app, "2025-06-07", "2025-06-07").await;

    let (status, body) = send(
        &app,
        json_request(Method::POST, &format!("/admin/bookings/{token}/cancel?shop={SHOP}"), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["previous"], "HOLD");
    assert_eq!(body["order_cancellation"], "not_needed");

    let (status, body) = send(
        &app,
        json_request(Method::POST, &format!("/admin/bookings/{token}/cancel?shop={SHOP}"), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "not_cancellable");
}

#[tokio::test]
async fn release_is_idempotent() {
    let app = test_app(100);
    seed(&app).await;
    let token = place_hold(&app, "2025-06-05", "2025-06-05").await;
    let release = || {
        json_request(
            Method::POST,
            &format!("/proxy/release?shop={SHOP}"),
            &json!({"booking_token": token}),
        )
    };

    let (status, body) = send(&app, release()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "RELEASED");
    let (status, body) = send(&app, release()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "RELEASED");

    let (status, _) = send(
        &app,
        json_request(Method::POST, &format!("/proxy/release?shop={SHOP}"), &json!({"booking_token": "nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Capacity came back.
    place_hold(&app, "2025-06-05", "2025-06-05").await;
}

#[tokio::test]
async fn holds_are_rate_limited_per_client() {
    let app = test_app(2);
    seed(&app).await;
    let mut body = hold_body("2025-06-05", "2025-06-05");
    body["location"] = json!("NOWHERE");

    for _ in 0..2 {
        let (status, _) = send(&app, hold_from("192.0.2.7", &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    let (status, limited) = send(&app, hold_from("192.0.2.7", &body)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited["error"]["code"], "rate_limited");

    let (status, _) = send(&app, hold_from("192.0.2.8", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The window rolls over after a minute.
    app.clock.advance(60_000);
    let (status, _) = send(&app, hold_from("192.0.2.7", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

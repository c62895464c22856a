use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use referral_commission_engine::{AppState, Config, MemoryStore, init_router};
use serde_json::{Value, json};
use tower::ServiceExt;

fn app() -> Router {
    let config = Config {
        server_port: 0,
        database_url: None,
        database_max_connections: 1,
        referral_link_base: "/r/".into(),
    };
    init_router(AppState::new(MemoryStore::default(), config))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_is_ok() {
    let (status, _) = send(&app(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn completed_order_pays_the_chain() {
    let app = app();
    for (user, referrer) in [(2, None), (1, Some(2)), (3, Some(1))] {
        let (status, _) = send(
            &app,
            "POST",
            "/referrals/users",
            Some(json!({ "user_id": user, "referred_by": referrer })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(
        &app,
        "POST",
        "/orders/completed",
        Some(json!({ "order_id": "ORD-1", "buyer_id": 3, "net_amount": 10000 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "order commissions recorded");
    assert_eq!(body["data"]["pool"], 2000);
    assert_eq!(body["data"]["payouts"][0]["amount"], 1000);
    assert_eq!(body["data"]["payouts"][1]["amount"], 500);
    assert!(body["meta"]["request_id"].is_string());

    let (_, again) = send(
        &app,
        "POST",
        "/orders/completed",
        Some(json!({ "order_id": "ORD-1", "buyer_id": 3, "net_amount": 10000 })),
    )
    .await;
    assert_eq!(again["message"], "order already processed");
    assert_eq!(again["data"]["ledger_written"], false);

    let (status, history) = send(&app, "GET", "/referrals/commissions?limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["pagination"]["total"], 2);
    assert_eq!(history["pagination"]["total_pages"], 2);
    assert_eq!(history["data"].as_array().map(Vec::len), Some(1));

    let (_, grouped) = send(&app, "GET", "/referrals/commissions?group=order", None).await;
    assert_eq!(grouped["data"][0]["order_id"], "ORD-1");
    assert_eq!(grouped["data"][0]["total"], 1500);
}

#[tokio::test]
async fn order_needs_exactly_one_amount() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/orders/completed",
        Some(json!({ "order_id": "ORD-2", "buyer_id": 1, "net_amount": 10, "gross_amount": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_AMOUNT");

    let (status, body) = send(
        &app,
        "POST",
        "/orders/completed",
        Some(json!({ "order_id": "ORD-3", "buyer_id": 1, "net_amount": -1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_AMOUNT");
}

#[tokio::test]
async fn gross_amount_is_netted() {
    let (status, body) = send(
        &app(),
        "POST",
        "/orders/completed",
        Some(json!({ "order_id": "ORD-G", "buyer_id": 9, "gross_amount": 10000 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["net_amount"], 9750);
}

#[tokio::test]
async fn settings_round_trip_with_versions() {
    let app = app();
    let (status, current) = send(&app, "GET", "/referrals/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(current["data"]["version"], 1);
    assert_eq!(
        current["data"]["settings"]["referral_commission_model"],
        "option1"
    );

    let mut settings = current["data"]["settings"].clone();
    settings["referral_commission_model"] = json!("option2");
    let (status, updated) = send(&app, "PUT", "/referrals/settings", Some(settings)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["data"]["version"], 2);
    assert_eq!(
        updated["data"]["settings"]["referral_commission_model"],
        "option2"
    );
}

#[tokio::test]
async fn invalid_settings_are_rejected() {
    let app = app();
    let (_, current) = send(&app, "GET", "/referrals/settings", None).await;
    let mut settings = current["data"]["settings"].clone();
    settings["referral_total_payout_percent"] = json!("150");

    let (status, body) = send(&app, "PUT", "/referrals/settings", Some(settings)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_SETTINGS");

    let (_, after) = send(&app, "GET", "/referrals/settings", None).await;
    assert_eq!(after["data"]["version"], 1);
}

#[tokio::test]
async fn tier_table_with_gap_is_rejected() {
    let app = app();
    let (status, current) = send(&app, "GET", "/referrals/tiers", None).await;
    assert_eq!(status, StatusCode::OK);

    let mut tiers = current["data"]["tiers"].clone();
    tiers["bands"][1]["min_amount"] = json!(6000);
    let (status, body) = send(&app, "PUT", "/referrals/tiers", Some(tiers)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_SETTINGS");
}

#[tokio::test]
async fn tier_table_must_cover_every_amount() {
    let app = app();
    let (_, current) = send(&app, "GET", "/referrals/tiers", None).await;
    let tiers = current["data"]["tiers"].clone();

    let mut closed = tiers.clone();
    let last = closed["bands"].as_array().map_or(0, |b| b.len() - 1);
    closed["bands"][last]["max_amount"] = json!(1_000_000);
    let (status, body) = send(&app, "PUT", "/referrals/tiers", Some(closed)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_SETTINGS");

    let mut raised = tiers;
    raised["bands"][0]["min_amount"] = json!(1);
    let (status, body) = send(&app, "PUT", "/referrals/tiers", Some(raised)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_SETTINGS");

    let (_, after) = send(&app, "GET", "/referrals/tiers", None).await;
    assert_eq!(after["data"]["version"], 1);
}

#[tokio::test]
async fn user_errors_map_to_statuses() {
    let app = app();
    let (status, body) = send(&app, "GET", "/referrals/users/77", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "USER_NOT_FOUND");

    send(&app, "POST", "/referrals/users", Some(json!({ "user_id": 77 }))).await;
    let (status, body) = send(
        &app,
        "POST",
        "/referrals/users",
        Some(json!({ "user_id": 77 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "USER_CONFLICT");

    let (status, body) = send(
        &app,
        "POST",
        "/referrals/users",
        Some(json!({ "user_id": 78, "referred_by": 77, "referral_code": "ABC" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REFERRER");

    let (status, users) = send(&app, "GET", "/referrals/users?page=1&per_page=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(users["pagination"]["total"], 1);
    assert_eq!(users["data"][0]["user_id"], 77);
    assert_eq!(users["data"][0]["referral_link"], Value::Null);
}

#[tokio::test]
async fn reversal_of_unknown_order_is_not_found() {
    let (status, body) = send(&app(), "POST", "/orders/ORD-404/reversal", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "ORDER_NOT_FOUND");
}

#[tokio::test]
async fn request_id_is_echoed() {
    let request = Request::builder()
        .uri("/referrals/settings")
        .header("x-request-id", "checkout-retry-7")
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "checkout-retry-7");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["meta"]["request_id"], "checkout-retry-7");
}

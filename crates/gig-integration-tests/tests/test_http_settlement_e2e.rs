//! End-to-end through the HTTP API with the real HTTP settlement client
//! pointed at a wiremock rail that accepts every leg asynchronously.
//! Milestones complete only once the rail acknowledges.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gig_api::state::AppConfig;

async fn accepting_rail() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/settlements"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    server
}

fn app_against(rail: &MockServer) -> axum::Router {
    let config = AppConfig {
        settlement_gateway_url: Some(rail.uri()),
        settlement_base_delay_ms: 1,
        ..AppConfig::default()
    };
    let state = gig_api::bootstrap::bootstrap(config, None).unwrap();
    gig_api::app(state)
}

async fn send(app: &axum::Router, method: &str, uri: &str, user: Option<Uuid>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(u) = user {
        builder = builder.header("x-user-id", u.to_string());
    }
    let request = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&v).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Confirm every pending leg of the milestone's in-flight batch, as the
/// rail would. Acks are sent with system authority.
async fn confirm_pending(app: &axum::Router, milestone: &Value) -> Value {
    let batch = milestone["pending_batch"].as_str().expect("batch in flight");
    let (status, legs) = send(app, "GET", &format!("/v1/settlement/batches/{batch}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let mut last = Value::Null;
    for leg in legs.as_array().unwrap() {
        let intent_id = leg["intent"]["intent_id"].as_str().unwrap();
        let (status, update) = send(
            app,
            "POST",
            "/v1/settlement/acks",
            None,
            Some(json!({
                "intent_id": intent_id,
                "status": "confirmed",
                "settlement_reference": format!("rail-{intent_id}")
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{update}");
        last = update;
    }
    last
}

#[tokio::test]
async fn milestone_completes_only_after_the_rail_acknowledges() {
    let rail = accepting_rail().await;
    let app = app_against(&rail);
    let client = Uuid::new_v4();
    let freelancer = Uuid::new_v4();

    let (_, job) = send(
        &app,
        "POST",
        "/v1/jobs",
        Some(client),
        Some(json!({
            "title": "Data pipeline",
            "category": "engineering",
            "budget_min": "500",
            "budget_max": "2000"
        })),
    )
    .await;
    let job_id = job["id"].as_str().unwrap().to_string();
    let (_, bid) = send(
        &app,
        "POST",
        &format!("/v1/jobs/{job_id}/bids"),
        Some(freelancer),
        Some(json!({ "amount": "1000", "delivery_days": 14 })),
    )
    .await;
    let (status, _) = send(
        &app,
        "POST",
        &format!("/v1/jobs/{job_id}/accept"),
        Some(client),
        Some(json!({ "bid_id": bid["id"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, m) = send(
        &app,
        "POST",
        &format!("/v1/jobs/{job_id}/milestones"),
        Some(client),
        Some(json!({ "title": "Ingestion", "amount": "1000" })),
    )
    .await;
    let mid = m["id"].as_str().unwrap().to_string();

    // Funding is accepted, not confirmed: work cannot start yet.
    let (status, funded) = send(&app, "POST", &format!("/v1/milestones/{mid}/fund"), Some(client), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(funded["status"], "funded");
    let (status, _) = send(&app, "POST", &format!("/v1/milestones/{mid}/start"), Some(freelancer), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    confirm_pending(&app, &funded).await;
    let (status, started) = send(&app, "POST", &format!("/v1/milestones/{mid}/start"), Some(freelancer), None).await;
    assert_eq!(status, StatusCode::OK, "{started}");

    let (status, _) = send(
        &app,
        "POST",
        &format!("/v1/milestones/{mid}/submit"),
        Some(freelancer),
        Some(json!({
            "files": [{
                "name": "pipeline.tar.gz",
                "content_ref": "s3://deliveries/pipeline.tar.gz",
                "size_bytes": 48213,
                "sha256": "9F86D081884C7D659A2FEAA0C55AD015A3BF4F1B2B0B822CD15D6C15B0F00A08"
            }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, approved) = send(&app, "POST", &format!("/v1/milestones/{mid}/approve"), Some(client), None).await;
    assert_eq!(status, StatusCode::OK, "{approved}");
    assert_eq!(approved["status"], "approved");
    let (_, job) = send(&app, "GET", &format!("/v1/jobs/{job_id}"), Some(client), None).await;
    assert_eq!(job["status"], "in_progress");

    let update = confirm_pending(&app, &approved).await;
    assert_eq!(update["milestone"]["status"], "completed");
    let (_, job) = send(&app, "GET", &format!("/v1/jobs/{job_id}"), Some(client), None).await;
    assert_eq!(job["status"], "completed");

    // A repeated acknowledgment changes nothing.
    let (_, legs) = send(
        &app,
        "GET",
        &format!("/v1/settlement/batches/{}", approved["pending_batch"].as_str().unwrap()),
        None,
        None,
    )
    .await;
    let intent_id = legs[0]["intent"]["intent_id"].as_str().unwrap();
    let (status, again) = send(
        &app,
        "POST",
        "/v1/settlement/acks",
        None,
        Some(json!({ "intent_id": intent_id, "status": "confirmed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["milestone"]["version"], update["milestone"]["version"]);

    let (_, deliveries) = send(&app, "GET", &format!("/v1/milestones/{mid}/deliveries"), Some(client), None).await;
    let files = &deliveries[0]["files"];
    assert_eq!(
        files[0]["sha256"],
        "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
    );
}

#[tokio::test]
async fn failed_acknowledgment_rolls_back_the_approval() {
    let rail = accepting_rail().await;
    let app = app_against(&rail);
    let client = Uuid::new_v4();
    let freelancer = Uuid::new_v4();

    let (_, job) = send(
        &app,
        "POST",
        "/v1/jobs",
        Some(client),
        Some(json!({ "title": "Audit", "category": "security", "budget_min": "100", "budget_max": "900" })),
    )
    .await;
    let job_id = job["id"].as_str().unwrap().to_string();
    let (_, bid) = send(
        &app,
        "POST",
        &format!("/v1/jobs/{job_id}/bids"),
        Some(freelancer),
        Some(json!({ "amount": "600", "delivery_days": 5 })),
    )
    .await;
    send(&app, "POST", &format!("/v1/jobs/{job_id}/accept"), Some(client), Some(json!({ "bid_id": bid["id"] }))).await;
    let (_, m) = send(
        &app,
        "POST",
        &format!("/v1/jobs/{job_id}/milestones"),
        Some(client),
        Some(json!({ "title": "Report", "amount": "600" })),
    )
    .await;
    let mid = m["id"].as_str().unwrap().to_string();
    let (_, funded) = send(&app, "POST", &format!("/v1/milestones/{mid}/fund"), Some(client), None).await;
    confirm_pending(&app, &funded).await;
    send(&app, "POST", &format!("/v1/milestones/{mid}/start"), Some(freelancer), None).await;
    send(
        &app,
        "POST",
        &format!("/v1/milestones/{mid}/submit"),
        Some(freelancer),
        Some(json!({ "reference": "https://example.com/report.pdf" })),
    )
    .await;
    let (_, approved) = send(&app, "POST", &format!("/v1/milestones/{mid}/approve"), Some(client), None).await;

    let batch = approved["pending_batch"].as_str().unwrap();
    let (_, legs) = send(&app, "GET", &format!("/v1/settlement/batches/{batch}"), None, None).await;
    let (status, update) = send(
        &app,
        "POST",
        "/v1/settlement/acks",
        None,
        Some(json!({
            "intent_id": legs[0]["intent"]["intent_id"],
            "status": "failed",
            "reason": "beneficiary account closed"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{update}");
    assert_eq!(update["milestone"]["status"], "submitted");
    assert!(update["milestone"]["pending_batch"].is_null());
}

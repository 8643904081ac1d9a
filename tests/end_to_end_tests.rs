//! Full request flow through the gateway and admin apps against mock services

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{body_string, header, header_exists, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use common::{get, get_with_token, healthy_backend, json_body, proxied_requests, Harness, HarnessOptions};
use intent_gateway::gateway::{admin_app, AdminState};
use intent_gateway::{CircuitState, RouteDefinition};

fn echo_routes() -> Vec<RouteDefinition> {
    vec![
        RouteDefinition::new("echo", "/api/v1/echo").auth(false),
        RouteDefinition::new("context_service", "/api/v1/context").scopes(["read"]),
    ]
}

fn harness() -> Harness {
    Harness::new(HarnessOptions {
        routes: echo_routes(),
        ..HarnessOptions::default()
    })
}

#[tokio::test]
async fn test_request_is_forwarded_with_prefix_stripped() {
    let backend = healthy_backend().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .and(query_param("verbose", "1"))
        .and(header("x-request-id", "req-e2e-1"))
        .and(header_exists("x-forwarded-for"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_json(json!({ "pong": true })),
        )
        .expect(1)
        .mount(&backend)
        .await;

    let harness = harness();
    harness.register_healthy("echo", &backend).await;

    let request = Request::builder()
        .uri("/api/v1/echo/ping?verbose=1")
        .header("x-request-id", "req-e2e-1")
        .body(Body::empty())
        .unwrap();
    let response = harness.send(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-e2e-1");
    assert_eq!(response.headers()["x-ratelimit-limit"], "100");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "99");
    assert_eq!(json_body(response).await, json!({ "pong": true }));
}

#[tokio::test]
async fn test_request_id_is_generated_when_absent() {
    let backend = healthy_backend().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .and(header_exists("x-request-id"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&backend)
        .await;

    let harness = harness();
    harness.register_healthy("echo", &backend).await;

    let response = harness.send(get("/api/v1/echo/ping")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let generated = response.headers()["x-request-id"].to_str().unwrap().to_string();
    assert!(uuid::Uuid::parse_str(&generated).is_ok());

    let forwarded = proxied_requests(&backend).await;
    assert_eq!(
        forwarded[0].headers.get("x-request-id").unwrap().to_str().unwrap(),
        generated
    );
}

#[tokio::test]
async fn test_body_is_streamed_upstream_and_hop_headers_dropped() {
    let backend = healthy_backend().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .and(body_string("{\"text\":\"hello\"}"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-upstream", "echo")
                .set_body_string("stored"),
        )
        .mount(&backend)
        .await;

    let harness = harness();
    harness.register_healthy("echo", &backend).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/echo/upload")
        .header("content-type", "application/json")
        .header("content-length", "16")
        .header("connection", "keep-alive, x-secret-hop")
        .header("x-secret-hop", "drop-me")
        .header("proxy-authorization", "Basic abc")
        .body(Body::from("{\"text\":\"hello\"}"))
        .unwrap();
    let response = harness.send(request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-upstream"], "echo");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"stored");

    let forwarded = proxied_requests(&backend).await;
    assert_eq!(forwarded.len(), 1);
    assert!(forwarded[0].headers.get("x-secret-hop").is_none());
    assert!(forwarded[0].headers.get("proxy-authorization").is_none());
    assert_eq!(
        forwarded[0].headers.get("content-type").unwrap().to_str().unwrap(),
        "application/json"
    );
}

#[tokio::test]
async fn test_body_without_length_header_is_forwarded() {
    let backend = healthy_backend().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .and(body_string("hello"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&backend)
        .await;

    let harness = harness();
    harness.register_healthy("echo", &backend).await;

    let chunks = futures::stream::iter(vec![
        Ok::<_, std::io::Error>(bytes::Bytes::from("hel")),
        Ok(bytes::Bytes::from("lo")),
    ]);
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/echo/upload")
        .body(Body::from_stream(chunks))
        .unwrap();
    let response = harness.send(request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let forwarded = proxied_requests(&backend).await;
    assert_eq!(forwarded.len(), 1);
    assert_eq!(&forwarded[0].body[..], b"hello");
}

#[tokio::test]
async fn test_authenticated_request_reaches_protected_service() {
    let backend = healthy_backend().await;
    Mock::given(method("GET"))
        .and(path("/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&backend)
        .await;

    let harness = harness();
    harness.register_healthy("context_service", &backend).await;

    let token = harness.token("alice", &["read"]);
    let response = harness
        .send(get_with_token("/api/v1/context/sessions", &token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // the bearer token itself is passed through to the service
    let forwarded = proxied_requests(&backend).await;
    assert!(forwarded[0].headers.get("authorization").is_some());

    // a second identity gets its own budget
    let other = harness.token("bob", &["read"]);
    let response = harness
        .send(get_with_token("/api/v1/context/sessions", &other))
        .await;
    assert_eq!(response.headers()["x-ratelimit-remaining"], "99");
}

#[tokio::test]
async fn test_gateway_health_is_answered_locally() {
    let harness = harness();
    let response = harness.send(get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "healthy");
}

fn admin(harness: &Harness) -> axum::Router {
    admin_app(
        AdminState {
            gateway: Arc::clone(&harness.gateway),
            prometheus: None,
        },
        "/metrics",
    )
}

#[tokio::test]
async fn test_admin_registers_and_lists_services() {
    let backend = healthy_backend().await;
    let harness = harness();
    let admin = admin(&harness);

    let addr = backend.address();
    let registration = json!({
        "service_name": "echo",
        "host": addr.ip().to_string(),
        "port": addr.port(),
        "check_interval_seconds": 1,
    });
    let response = admin
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/services")
                .header("content-type", "application/json")
                .body(Body::from(registration.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let instance = json_body(response).await;
    assert_eq!(instance["status"], "STARTING");
    let instance_id = instance["instance_id"].as_str().unwrap().to_string();

    let response = admin.clone().oneshot(get("/services/echo")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let service = json_body(response).await;
    assert_eq!(service["check_endpoint"], "/health");
    assert!(service["instances"][instance_id.as_str()].is_object());

    let response = admin
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/services/echo/instances/{}", instance_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = admin.clone().oneshot(get("/services/echo")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_admin_rejects_invalid_registration() {
    let harness = harness();
    let response = admin(&harness)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/services")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "service_name": "echo", "host": "bad host", "port": 80 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(body["error"]["details"]["field"], "host");
}

#[tokio::test]
async fn test_admin_resets_circuit_breaker() {
    let harness = harness();
    let admin = admin(&harness);

    let breaker = harness.gateway.breakers().get_or_create("echo");
    breaker.try_acquire().unwrap().record_failure();
    breaker.try_acquire().unwrap().record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    let response = admin.clone().oneshot(get("/circuit-breakers")).await.unwrap();
    let snapshots = json_body(response).await;
    assert_eq!(snapshots[0]["name"], "echo");
    assert_eq!(snapshots[0]["state"], "OPEN");

    let response = admin
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/circuit-breakers/echo/reset")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["state"], "CLOSED");
    assert_eq!(breaker.state(), CircuitState::Closed);

    let response = admin
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/circuit-breakers/unknown/reset")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_reports_routes_and_rate_limits() {
    let harness = harness();
    let admin = admin(&harness);

    let routes = json_body(admin.clone().oneshot(get("/routes")).await.unwrap()).await;
    assert_eq!(routes.as_array().unwrap().len(), 2);
    assert_eq!(routes[0]["path_prefix"], "/api/v1/context");

    let stats = json_body(admin.clone().oneshot(get("/rate-limits/stats")).await.unwrap()).await;
    assert_eq!(stats["limit"], 100);
    assert_eq!(stats["window_seconds"], 60);

    let metrics = admin.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(metrics.status(), StatusCode::NOT_FOUND);
}

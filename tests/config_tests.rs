//! Configuration loading tests against files on disk

use axum::http::Method;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

use intent_gateway::{GatewayConfig, RouteTable};

fn sample_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/gateway.yaml")
}

#[tokio::test]
async fn test_sample_config_loads() {
    let config = GatewayConfig::load_from_file(sample_config_path())
        .await
        .expect("sample config should be valid");

    let names: Vec<&str> = config
        .services
        .iter()
        .map(|s| s.service_name.as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "context_service",
            "intent_service",
            "prediction_service",
            "realtime_service"
        ]
    );

    let prediction = &config.circuit_breaker.overrides["prediction_service"];
    assert_eq!(prediction.failure_threshold, 3);
    assert_eq!(prediction.recovery_timeout, Duration::from_secs(30));
    // unspecified override fields keep their defaults
    assert_eq!(prediction.success_threshold, 1);

    assert_eq!(config.rate_limiting.store_timeout, Duration::from_millis(250));
    assert_eq!(config.auth.jwt.issuer.as_deref(), Some("intent-platform"));
}

#[tokio::test]
async fn test_sample_config_builds_route_table_and_registrations() {
    let config = GatewayConfig::load_from_file(sample_config_path())
        .await
        .unwrap();

    let table = tokio_test::assert_ok!(RouteTable::new(config.routes()));
    assert_eq!(table.len(), 4);

    let context = table
        .match_route(&Method::POST, "/api/v1/context/sessions")
        .unwrap();
    assert_eq!(context.route.service_name, "context_service");
    assert_eq!(context.forward_path, "/sessions");
    assert!(table
        .match_route(&Method::DELETE, "/api/v1/context/sessions")
        .is_none());

    let realtime = table.match_route(&Method::GET, "/api/v1/realtime").unwrap();
    assert!(!realtime.route.circuit_breaker_enabled);

    let registrations = config.registrations();
    assert_eq!(registrations.len(), 4);
    let realtime = registrations
        .iter()
        .find(|r| r.service_name == "realtime_service")
        .unwrap();
    assert_eq!(realtime.port, 8004);
    assert_eq!(realtime.check_interval_seconds, 15);
}

#[tokio::test]
async fn test_minimal_yaml_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.yaml");
    tokio::fs::write(
        &path,
        r#"
services:
  - service_name: echo
    path_prefix: /api/v1/echo
    auth_required: false
    instances:
      - host: 127.0.0.1
        port: 9000
"#,
    )
    .await
    .unwrap();

    let config = GatewayConfig::load_from_file(&path).await.unwrap();
    assert_eq!(config.server.http_port, 8080);
    assert_eq!(config.server.admin_port, 9080);
    assert_eq!(config.rate_limiting.max_requests, 100);
    assert_eq!(config.services.len(), 1);

    let route = &config.routes()[0];
    assert_eq!(route.allowed_methods.len(), 4);
    assert_eq!(route.timeout, Duration::from_secs(30));
    assert!(!route.auth_required);
}

#[tokio::test]
async fn test_validation_reports_every_problem() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.yaml");
    tokio::fs::write(
        &path,
        r#"
server:
  http_port: 9080
  admin_port: 9080
rate_limiting:
  burst_multiplier: 0.5
services:
  - service_name: a
    path_prefix: /api/v1/context
  - service_name: b
    path_prefix: /api/v1/context/
    methods: [GET]
"#,
    )
    .await
    .unwrap();

    let err = tokio_test::assert_err!(GatewayConfig::load_from_file(&path).await);
    let message = err.to_string();
    assert!(message.contains("must differ"));
    assert!(message.contains("burst_multiplier"));
    assert!(message.contains("Duplicate route: GET /api/v1/context"));
}

#[tokio::test]
async fn test_metrics_path_must_not_shadow_admin_routes() {
    let dir = TempDir::new().unwrap();
    for (endpoint, expected) in [
        ("/health", "collides with an admin route"),
        ("/services/metrics", "collides with an admin route"),
        ("metrics", "must start with '/'"),
        ("/metrics/:kind", "cannot contain path parameters"),
    ] {
        let path = dir.path().join("gateway.yaml");
        tokio::fs::write(
            &path,
            format!(
                "observability:\n  metrics:\n    endpoint_path: \"{}\"\n",
                endpoint
            ),
        )
        .await
        .unwrap();

        let err = tokio_test::assert_err!(GatewayConfig::load_from_file(&path).await);
        assert!(
            err.to_string().contains(expected),
            "{} should be rejected with '{}', got: {}",
            endpoint,
            expected,
            err
        );
    }

    let mut config = GatewayConfig::default();
    config.observability.metrics.endpoint_path = "/internal/metrics".to_string();
    tokio_test::assert_ok!(config.validate());
}

#[tokio::test]
async fn test_json_config_and_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.json");
    tokio::fs::write(
        &path,
        r#"{
  "server": { "http_port": 18080, "admin_port": 19080 },
  "services": [
    { "service_name": "echo", "path_prefix": "/echo", "methods": ["get"], "timeout": "5s" }
  ]
}"#,
    )
    .await
    .unwrap();

    let config = GatewayConfig::load_or_default(&path).await.unwrap();
    assert_eq!(config.server.http_port, 18080);
    assert_eq!(config.services[0].methods, vec![Method::GET]);
    assert_eq!(config.services[0].timeout, Duration::from_secs(5));

    let missing = GatewayConfig::load_or_default(dir.path().join("absent.yaml"))
        .await
        .unwrap();
    assert_eq!(missing.services.len(), 4);
}

#[tokio::test]
async fn test_malformed_yaml_is_configuration_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.yaml");
    tokio::fs::write(&path, "server: [not, a, map").await.unwrap();

    let err = GatewayConfig::load_from_file(&path).await.unwrap_err();
    assert_eq!(err.code(), "INTERNAL_ERROR");
    assert!(err.to_string().contains("Failed to parse config"));
}

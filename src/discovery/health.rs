//! # Health Probes
//!
//! A probe answers one question: did this instance respond to its health endpoint with a
//! 2xx within the timeout? The registry's per-service loops own scheduling and status
//! updates; probes only perform the request.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

use crate::core::types::ServiceInstance;

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Responded, but not with a 2xx status
    BadStatus(u16),
    /// Connection failed before a response arrived
    Unreachable(String),
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }

    /// Label used for `gateway_health_checks_total{result}`
    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Healthy => "healthy",
            ProbeOutcome::BadStatus(_) => "bad_status",
            ProbeOutcome::Unreachable(_) => "unreachable",
            ProbeOutcome::TimedOut => "timeout",
        }
    }
}

/// Health probe trait for different probe types
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `check_endpoint` on the instance; must never panic or hang past its timeout
    async fn check(&self, instance: &ServiceInstance, check_endpoint: &str) -> ProbeOutcome;
}

/// HTTP GET health probe
pub struct HttpHealthProbe {
    client: HttpClient,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(client: HttpClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Probe with its own client, bounded by `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(HttpClient::new(), timeout)
    }

    fn url_for(instance: &ServiceInstance, check_endpoint: &str) -> String {
        if check_endpoint.starts_with('/') {
            format!("{}{}", instance.base_url(), check_endpoint)
        } else {
            format!("{}/{}", instance.base_url(), check_endpoint)
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, instance: &ServiceInstance, check_endpoint: &str) -> ProbeOutcome {
        let url = Self::url_for(instance, check_endpoint);
        let start_time = Instant::now();

        let result = timeout(self.timeout, self.client.get(&url).send()).await;
        let outcome = match result {
            Ok(Ok(response)) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(Ok(response)) => ProbeOutcome::BadStatus(response.status().as_u16()),
            Ok(Err(e)) => ProbeOutcome::Unreachable(e.to_string()),
            Err(_) => ProbeOutcome::TimedOut,
        };

        debug!(
            url = %url,
            outcome = outcome.label(),
            latency_ms = start_time.elapsed().as_millis() as u64,
            "Health probe completed"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::InstanceStatus;
    use chrono::Utc;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn instance_for(server: &MockServer) -> ServiceInstance {
        let addr = server.address();
        ServiceInstance {
            instance_id: ServiceInstance::make_id(&addr.ip().to_string(), addr.port()),
            host: addr.ip().to_string(),
            port: addr.port(),
            status: InstanceStatus::Starting,
            last_check: None,
            registered_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_probe_success_and_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = HttpHealthProbe::with_timeout(Duration::from_secs(1));
        let instance = instance_for(&server);

        assert_eq!(probe.check(&instance, "/health").await, ProbeOutcome::Healthy);
        assert_eq!(
            probe.check(&instance, "broken").await,
            ProbeOutcome::BadStatus(503)
        );
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let probe = HttpHealthProbe::with_timeout(Duration::from_millis(50));
        let outcome = probe.check(&instance_for(&server), "/health").await;
        assert_eq!(outcome, ProbeOutcome::TimedOut);
    }
}

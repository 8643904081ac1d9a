//! # Service Registry
//!
//! Tracks which instances of each downstream service exist and whether they are reachable.
//!
//! ## Locking
//! - `membership` serializes register/deregister so the set of services and instances
//!   changes one mutation at a time
//! - each service's instance map sits behind its own `RwLock`, held only long enough to
//!   clone `Arc`s out of it
//! - each instance's status sits behind its own `RwLock`, written only by that service's
//!   health loop (or by deregistration)
//!
//! A slow probe therefore never blocks `get_healthy_instance` or a registration; the loop
//! holds no lock while it awaits the network.
//!
//! ## Health loops
//! One Tokio task per service probes every instance concurrently, then sleeps for the
//! service's check interval. The loop is cancelled through a child of the registry's
//! `CancellationToken` when the service loses its last instance or the registry shuts down.

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::error::GatewayError;
use crate::core::types::{
    InstanceStatus, RegistrationRequest, ServiceDefinition, ServiceInstance,
};
use crate::discovery::health::{HealthProbe, HttpHealthProbe, ProbeOutcome};

/// Errors returned by registry operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid registration field '{field}': {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Service '{0}' not found in registry")]
    ServiceNotFound(String),

    #[error("Instance '{instance_id}' not found for service '{service}'")]
    InstanceNotFound { service: String, instance_id: String },

    #[error("No healthy instances available for service '{0}'")]
    NoHealthyInstance(String),

    #[error("Service registry is shut down")]
    ShutDown,
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation { field, reason } => GatewayError::validation(field, reason),
            RegistryError::ServiceNotFound(_) | RegistryError::InstanceNotFound { .. } => {
                GatewayError::not_found(err.to_string())
            }
            RegistryError::NoHealthyInstance(service) => {
                GatewayError::service_unavailable(service, "no healthy instances")
            }
            RegistryError::ShutDown => {
                GatewayError::service_unavailable("registry", "registry is shut down")
            }
        }
    }
}

/// Registry-wide counters and gauges for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub services: usize,
    pub instances: usize,
    pub healthy_instances: usize,
    pub registrations: u64,
    pub deregistrations: u64,
    pub health_checks: u64,
    pub health_check_failures: u64,
    /// Calls to `get_healthy_instance`
    pub instance_lookups: u64,
}

#[derive(Debug, Default)]
struct RegistryCounters {
    instance_lookups: AtomicU64,
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    health_checks: AtomicU64,
    health_check_failures: AtomicU64,
}

type SharedInstance = Arc<RwLock<ServiceInstance>>;

struct CheckSettings {
    check_endpoint: String,
    check_interval: Duration,
}

/// Live state of one service: its instances plus the handle of its health loop
struct ServiceEntry {
    name: String,
    settings: RwLock<CheckSettings>,
    instances: RwLock<BTreeMap<String, SharedInstance>>,
    cursor: AtomicUsize,
    /// Wakes the loop early so a new instance is probed without waiting a full interval
    wake: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceEntry {
    fn snapshot(&self) -> ServiceDefinition {
        let settings = self.settings.read();
        let instances = self
            .instances
            .read()
            .iter()
            .map(|(id, instance)| (id.clone(), instance.read().clone()))
            .collect();

        ServiceDefinition {
            service_name: self.name.clone(),
            check_endpoint: settings.check_endpoint.clone(),
            check_interval_seconds: settings.check_interval.as_secs(),
            instances,
        }
    }

    fn instance_handles(&self) -> Vec<SharedInstance> {
        self.instances.read().values().cloned().collect()
    }
}

/// Registry of service instances with per-service health checking
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<ServiceEntry>>>,
    membership: Mutex<()>,
    probe: Arc<dyn HealthProbe>,
    shutdown: CancellationToken,
    counters: Arc<RegistryCounters>,
}

impl ServiceRegistry {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            membership: Mutex::new(()),
            probe,
            shutdown: CancellationToken::new(),
            counters: Arc::new(RegistryCounters::default()),
        }
    }

    /// Registry probing over HTTP with the given per-probe timeout
    pub fn with_http_probe(client: reqwest::Client, probe_timeout: Duration) -> Self {
        Self::new(Arc::new(HttpHealthProbe::new(client, probe_timeout)))
    }

    /// Add (or refresh) an instance; it starts as `STARTING` and is not routable until
    /// its first successful health check
    ///
    /// Re-registering an existing `host:port` replaces the instance and resets it to
    /// `STARTING`. Must be called from within a Tokio runtime.
    pub fn register(&self, request: RegistrationRequest) -> Result<ServiceInstance, RegistryError> {
        validate_registration(&request)?;
        if self.shutdown.is_cancelled() {
            return Err(RegistryError::ShutDown);
        }

        let _membership = self.membership.lock();

        let instance = ServiceInstance {
            instance_id: ServiceInstance::make_id(&request.host, request.port),
            host: request.host.clone(),
            port: request.port,
            status: InstanceStatus::Starting,
            last_check: None,
            registered_at: Utc::now(),
            metadata: request.metadata.clone(),
        };
        let check_interval = Duration::from_secs(request.check_interval_seconds);

        let existing = self.services.read().get(&request.service_name).cloned();
        let entry = match existing {
            Some(entry) => {
                let mut settings = entry.settings.write();
                settings.check_endpoint = request.check_endpoint.clone();
                settings.check_interval = check_interval;
                drop(settings);
                entry
            }
            None => {
                let entry = Arc::new(ServiceEntry {
                    name: request.service_name.clone(),
                    settings: RwLock::new(CheckSettings {
                        check_endpoint: request.check_endpoint.clone(),
                        check_interval,
                    }),
                    instances: RwLock::new(BTreeMap::new()),
                    cursor: AtomicUsize::new(0),
                    wake: Notify::new(),
                    cancel: self.shutdown.child_token(),
                    task: Mutex::new(None),
                });
                self.services
                    .write()
                    .insert(request.service_name.clone(), entry.clone());

                let handle = tokio::spawn(run_health_loop(
                    entry.clone(),
                    self.probe.clone(),
                    self.counters.clone(),
                ));
                *entry.task.lock() = Some(handle);
                debug!(service = %request.service_name, "Started health check loop");
                entry
            }
        };

        let replaced = entry.instances.write().insert(
            instance.instance_id.clone(),
            Arc::new(RwLock::new(instance.clone())),
        );
        if let Some(previous) = replaced {
            previous.write().status = InstanceStatus::Deregistered;
        }
        entry.wake.notify_one();

        self.counters.registrations.fetch_add(1, Ordering::Relaxed);
        info!(
            service = %request.service_name,
            instance = %instance.instance_id,
            check_endpoint = %request.check_endpoint,
            check_interval_secs = request.check_interval_seconds,
            "Registered service instance"
        );

        Ok(instance)
    }

    /// Remove an instance; the service's health loop stops with its last instance
    pub fn deregister(&self, service_name: &str, instance_id: &str) -> Result<(), RegistryError> {
        let _membership = self.membership.lock();

        let entry = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| RegistryError::ServiceNotFound(service_name.to_string()))?;

        let removed = entry.instances.write().remove(instance_id);
        let removed = removed.ok_or_else(|| RegistryError::InstanceNotFound {
            service: service_name.to_string(),
            instance_id: instance_id.to_string(),
        })?;
        removed.write().status = InstanceStatus::Deregistered;

        if entry.instances.read().is_empty() {
            self.services.write().remove(service_name);
            entry.cancel.cancel();
            info!(service = %service_name, "Last instance removed, stopping health checks");
        }

        self.counters.deregistrations.fetch_add(1, Ordering::Relaxed);
        info!(
            service = %service_name,
            instance = %instance_id,
            "Deregistered service instance"
        );
        Ok(())
    }

    /// Pick a `HEALTHY` instance, rotating round-robin across calls
    pub fn get_healthy_instance(&self, service_name: &str) -> Result<ServiceInstance, RegistryError> {
        self.counters.instance_lookups.fetch_add(1, Ordering::Relaxed);
        let entry = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| RegistryError::NoHealthyInstance(service_name.to_string()))?;

        let healthy: Vec<ServiceInstance> = entry
            .instance_handles()
            .iter()
            .filter_map(|handle| {
                let instance = handle.read();
                instance.status.is_routable().then(|| instance.clone())
            })
            .collect();

        if healthy.is_empty() {
            return Err(RegistryError::NoHealthyInstance(service_name.to_string()));
        }

        let index = entry.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        healthy
            .into_iter()
            .nth(index)
            .ok_or_else(|| RegistryError::NoHealthyInstance(service_name.to_string()))
    }

    /// Snapshots of every service, sorted by name
    pub fn get_services(&self) -> Vec<ServiceDefinition> {
        let entries: Vec<Arc<ServiceEntry>> = self.services.read().values().cloned().collect();
        let mut services: Vec<ServiceDefinition> = entries.iter().map(|e| e.snapshot()).collect();
        services.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        services
    }

    pub fn get_service(&self, service_name: &str) -> Result<ServiceDefinition, RegistryError> {
        self.services
            .read()
            .get(service_name)
            .cloned()
            .map(|entry| entry.snapshot())
            .ok_or_else(|| RegistryError::ServiceNotFound(service_name.to_string()))
    }

    pub fn stats(&self) -> RegistryStats {
        let services = self.get_services();
        RegistryStats {
            services: services.len(),
            instances: services.iter().map(|s| s.instances.len()).sum(),
            healthy_instances: services.iter().map(ServiceDefinition::healthy_count).sum(),
            registrations: self.counters.registrations.load(Ordering::Relaxed),
            deregistrations: self.counters.deregistrations.load(Ordering::Relaxed),
            health_checks: self.counters.health_checks.load(Ordering::Relaxed),
            health_check_failures: self.counters.health_check_failures.load(Ordering::Relaxed),
            instance_lookups: self.counters.instance_lookups.load(Ordering::Relaxed),
        }
    }

    /// Cancel every health loop and wait for them to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .services
            .read()
            .values()
            .filter_map(|entry| entry.task.lock().take())
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "Health check loop terminated abnormally");
                }
            }
        }
        info!("Service registry shut down");
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn validate_registration(request: &RegistrationRequest) -> Result<(), RegistryError> {
    if request.service_name.trim().is_empty() {
        return Err(RegistryError::Validation {
            field: "service_name",
            reason: "must not be empty".to_string(),
        });
    }

    let host = request.host.trim();
    let parsed = if host.contains(':') && !host.starts_with('[') {
        url::Host::parse(&format!("[{}]", host))
    } else {
        url::Host::parse(host)
    };
    if host.is_empty() || host != request.host || parsed.is_err() {
        return Err(RegistryError::Validation {
            field: "host",
            reason: format!("'{}' is not a valid hostname or IP address", request.host),
        });
    }

    if request.port == 0 {
        return Err(RegistryError::Validation {
            field: "port",
            reason: "must be between 1 and 65535".to_string(),
        });
    }

    if request.check_interval_seconds == 0 {
        return Err(RegistryError::Validation {
            field: "check_interval_seconds",
            reason: "must be at least 1".to_string(),
        });
    }

    if request.check_endpoint.trim().is_empty() {
        return Err(RegistryError::Validation {
            field: "check_endpoint",
            reason: "must not be empty".to_string(),
        });
    }

    Ok(())
}

async fn run_health_loop(
    entry: Arc<ServiceEntry>,
    probe: Arc<dyn HealthProbe>,
    counters: Arc<RegistryCounters>,
) {
    loop {
        tokio::select! {
            _ = entry.cancel.cancelled() => break,
            _ = check_service(&entry, probe.as_ref(), &counters) => {}
        }

        let interval = entry.settings.read().check_interval;
        tokio::select! {
            _ = entry.cancel.cancelled() => break,
            _ = entry.wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(service = %entry.name, "Health check loop stopped");
}

/// Probe every current instance once and record the results
async fn check_service(entry: &ServiceEntry, probe: &dyn HealthProbe, counters: &RegistryCounters) {
    let check_endpoint = entry.settings.read().check_endpoint.clone();
    let handles = entry.instance_handles();

    let probes = handles.iter().map(|handle| {
        let instance = handle.read().clone();
        let check_endpoint = check_endpoint.as_str();
        async move {
            AssertUnwindSafe(probe.check(&instance, check_endpoint))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| ProbeOutcome::Unreachable("health probe panicked".to_string()))
        }
    });
    let outcomes = join_all(probes).await;

    for (handle, outcome) in handles.iter().zip(outcomes) {
        counters.health_checks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "gateway_health_checks_total",
            "service" => entry.name.clone(),
            "result" => outcome.label()
        )
        .increment(1);

        let mut instance = handle.write();
        if instance.status == InstanceStatus::Deregistered {
            continue;
        }

        let previous = instance.status;
        instance.last_check = Some(Utc::now());
        instance.status = if outcome.is_healthy() {
            InstanceStatus::Healthy
        } else {
            counters.health_check_failures.fetch_add(1, Ordering::Relaxed);
            InstanceStatus::Unhealthy
        };

        if outcome.is_healthy() {
            if previous != InstanceStatus::Healthy {
                info!(
                    service = %entry.name,
                    instance = %instance.instance_id,
                    from = %previous,
                    "Instance is healthy"
                );
            }
        } else {
            warn!(
                service = %entry.name,
                instance = %instance.instance_id,
                outcome = ?outcome,
                "Health check failed"
            );
        }
    }
}

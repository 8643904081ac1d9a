//! Service discovery: the instance registry and the health probes that feed it.

pub mod health;
pub mod registry;

pub use health::{HealthProbe, HttpHealthProbe, ProbeOutcome};
pub use registry::{RegistryError, RegistryStats, ServiceRegistry};

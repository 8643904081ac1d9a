//! Logging and metrics setup.

pub mod logging;
pub mod metrics;

pub use self::logging::init_logging;
pub use self::metrics::{install_prometheus, record_request};

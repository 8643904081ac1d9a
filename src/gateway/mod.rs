//! Request proxying and the HTTP listeners in front of it.

pub mod proxy;
pub mod server;

pub use proxy::{context_from_request, Gateway};
pub use server::{admin_app, gateway_app, AdminState, GatewayServer};

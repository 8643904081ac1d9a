pub mod middleware;
pub mod providers;

pub use middleware::{authenticate_request, authorize, extract_token, AuthSettings, JwtSettings};
pub use providers::{Authenticator, Claims, JwtAuthenticator};

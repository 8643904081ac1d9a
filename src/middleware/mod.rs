//! Request-path policies applied ahead of upstream forwarding.

pub mod rate_limiting;

pub use rate_limiting::{
    Clock, InMemoryStore, ManualClock, RateLimitConfig, RateLimitError, RateLimitResult,
    RateLimitStore, RateLimiter, RedisStore, SystemClock,
};

//! Request middleware: admin authentication and source rate limiting.

pub mod auth;
pub mod rate_limit;

pub use auth::admin_auth;
pub use rate_limit::{RateDecision, RateLimiter, RateStore};

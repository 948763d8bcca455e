//! HTTP surface for the notification pipeline.
//!
//! Two route groups share one Axum router: the public ingestion endpoint
//! that payment processors post signed events to, and a bearer-protected
//! admin group for operators. Rate limiting runs before signature
//! verification so a flooding source is rejected cheaply.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server, AppState};

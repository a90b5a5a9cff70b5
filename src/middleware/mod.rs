//! Middleware for observability.
//!
//! This module provides request logging with latency tracking. Rate
//! limiting, auth, and CORS live outside this crate's scope.

pub mod logging;

pub use logging::request_logging;

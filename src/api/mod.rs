//! HTTP surface beyond the proxy path: liveness, daemon introspection,
//! temp-profile management, and per-request ID middleware.

pub mod admin;
pub mod health;
pub mod request_id;

//! Selkie Server
//!
//! The thin HTTP layer over a [`selkie_runtime::Environment`]: unmarshals
//! requests, applies the wire limits and timeouts, and maps error kinds to
//! status codes (410 for blacklisted activations, 500 otherwise).

mod http;

pub use http::Server;

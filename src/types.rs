//! Core type aliases shared across the proxy: a streaming inbound request
//! body and a boxed error type used at the seams between components.

use hyper::body::Incoming;

/// Inbound HTTP request with Hyper's streaming body.
pub type Request = hyper::Request<Incoming>;

/// Boxed error type for thread-safe, type-erased error handling.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#![cfg_attr(docsrs, feature(doc_cfg))]

//! A service-discovery-driven HTTP reverse proxy.
//!
//! Requests arrive on one `Host` header-scoped listener; the router parses
//! the host into a `(service, tag)` selector, resolves it against an
//! external Consul-compatible catalog agent through a coalescing, TTL-backed
//! cache, picks one of the returned endpoints with soft tag affinity, and
//! streams the request through to it without buffering either body.
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - HTTP: `hyper` 1.x
//!
//! # Key modules
//! - [config] parses CLI flags into an immutable [`config::RouterConfig`].
//! - [host] decomposes a `Host` header into a [`host::ServiceKey`].
//! - [catalog] queries the external service-discovery agent.
//! - [cache] memoizes catalog answers with single-flight coalescing and TTL.
//! - [selector] picks one endpoint out of a resolved set.
//! - [transport] is the shared, pooled outbound HTTP client.
//! - [proxy] is the end-to-end request pipeline tying the above together.
//! - [health] and [pprof] are the optional side listeners.
//! - [lifecycle] is the accept loop and shutdown state machine.

/// Streaming HTTP body type shared by locally-generated and proxied responses.
pub mod body;

/// Catalog client: queries the external service-discovery agent.
pub mod catalog;

/// Single-flight, TTL-based resolution cache in front of the catalog client.
pub mod cache;

/// Command-line parsing and the immutable `RouterConfig` it produces.
pub mod config;

/// Process-wide health status and its standalone listener.
pub mod health;

/// Decomposes an inbound `Host` header into a `ServiceKey`.
pub mod host;

/// Lifecycle supervisor: accept loop and shutdown state machine.
pub mod lifecycle;

/// Optional CPU-profiling endpoint.
#[cfg(feature = "pprof")]
#[cfg_attr(docsrs, doc(cfg(feature = "pprof")))]
pub mod pprof;

/// The end-to-end proxy request pipeline.
pub mod proxy;

/// Endpoint selection with soft tag affinity.
pub mod selector;

/// Shared, pooled outbound HTTP transport.
pub mod transport;

/// Structured logging setup.
pub mod tracing;

/// Core type aliases used throughout the crate.
pub mod types;

/// Global memory allocator using jemalloc for improved performance.
#[cfg(feature = "jemalloc")]
#[cfg_attr(docsrs, doc(cfg(feature = "jemalloc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

//! Shared, pooled outbound HTTP transport used to forward requests to
//! selected endpoints.
//!
//! Built on `hyper_util::client::legacy::Client`, the same pooled-client
//! foundation as [`crate::catalog::CatalogClient`] — generalized here to
//! carry an arbitrary [`crate::body::ProxyBody`] request and hand back the
//! upstream's raw, unbuffered [`hyper::body::Incoming`] response so the
//! proxy pipeline can stream it straight through.

use std::time::Duration;

use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::body::ProxyBody;
use crate::config::RouterConfig;

/// Why an outbound request to a selected endpoint failed.
///
/// A dial failure, a header-read timeout, and any other transport error are
/// all treated identically by the proxy handler — every one of them means
/// the upstream failed before headers came back, so the client gets a
/// uniform 502; the variants are kept distinct here only so logs say what
/// actually happened.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connecting to upstream failed: {0}")]
    DialFailure(hyper_util::client::legacy::Error),
    #[error("waiting for upstream response headers timed out")]
    ReadTimeout,
    #[error("upstream request failed: {0}")]
    Request(hyper_util::client::legacy::Error),
}

/// Pooled HTTP/1 client shared by every proxied request.
///
/// `max_idle_conns` (a global cap) has no equivalent knob in
/// `hyper_util`'s legacy pool, which only exposes a per-host idle cap; it is
/// accepted on [`RouterConfig`] for interface parity but only
/// `max_idle_conns_per_host` is actually wired here (see `DESIGN.md`).
/// `max_header_bytes` bounds the *inbound* HTTP/1 server, not this outbound
/// client, and is applied where the server is built.
#[derive(Clone)]
pub struct Transport {
    client: Client<HttpConnector, ProxyBody>,
    read_timeout: Duration,
}

impl Transport {
    pub fn new(config: &RouterConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.dial_timeout));
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_conns_per_host)
            .build(connector);

        Self {
            client,
            read_timeout: config.read_timeout,
        }
    }

    /// Forwards `request` to whatever authority its URI names, returning the
    /// upstream's response with its body left unread.
    pub async fn send(
        &self,
        request: hyper::Request<ProxyBody>,
    ) -> Result<hyper::Response<Incoming>, TransportError> {
        match tokio::time::timeout(self.read_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) if err.is_connect() => Err(TransportError::DialFailure(err)),
            Ok(Err(err)) => Err(TransportError::Request(err)),
            Err(_) => Err(TransportError::ReadTimeout),
        }
    }
}

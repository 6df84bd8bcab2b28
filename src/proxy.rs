//! The proxy request pipeline: resolve, select, rewrite, forward, stream
//! back.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use hyper::body::Body;
use hyper::{Response, StatusCode, Uri};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::body::ProxyBody;
use crate::cache::ResolutionCache;
use crate::host::{self, HostError};
use crate::selector;
use crate::transport::{Transport, TransportError};
use crate::types::{BoxError, Request};

/// Per-request outcomes that never reach the client as a response because
/// the client is already gone. Kept as a real error type (rather than just a
/// status code) so the cancellation path logs the same way every other
/// per-component failure does.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The inbound connection closed while the outbound request to the
    /// selected endpoint was still pending.
    #[error("client disconnected before the upstream responded")]
    ClientCancelled,
}

/// Nonstandard status nginx popularized for "client closed the connection
/// before we could respond" — never actually reaches the client, which is
/// already gone; used only so the handler's infallible signature has a
/// value to return.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Headers that are connection-scoped and must never be forwarded upstream
/// (the classic RFC 7230 §6.1 hop-by-hop list plus the historical
/// `Proxy-Connection`).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Shared state every proxied request needs: where to send it and how.
pub struct ProxyContext {
    domain: String,
    prefer: String,
    cache: ResolutionCache,
    transport: Transport,
    enable_compression: bool,
}

impl ProxyContext {
    pub fn new(
        domain: String,
        prefer: String,
        cache: ResolutionCache,
        transport: Transport,
        enable_compression: bool,
    ) -> Self {
        Self {
            domain,
            prefer,
            cache,
            transport,
            enable_compression,
        }
    }
}

/// Handles one inbound request end to end. Infallible: every failure mode
/// becomes a locally-generated HTTP response rather than a propagated error,
/// since this is installed directly as a hyper `service_fn` target.
pub async fn handle(req: Request, ctx: Arc<ProxyContext>) -> Result<Response<ProxyBody>, std::convert::Infallible> {
    Ok(handle_inner(req, &ctx).await)
}

async fn handle_inner<B>(req: hyper::Request<B>, ctx: &ProxyContext) -> Response<ProxyBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let client_addr = req.extensions().get::<SocketAddr>().copied();
    // Cancelled by the connection's disconnect watcher (see `lifecycle.rs`)
    // the moment the client closes or resets the inbound connection.
    let disconnect = req.extensions().get::<CancellationToken>().cloned();

    let Some(host_header) = host_header(&req) else {
        return plain_text(StatusCode::BAD_REQUEST, "missing Host header");
    };

    let key = match host::parse_host(&host_header, &ctx.domain) {
        Ok(key) => key,
        Err(HostError::UnknownDomain) => {
            return plain_text(StatusCode::NOT_FOUND, "host is not served by this router");
        }
        Err(HostError::InvalidHost) => {
            return plain_text(StatusCode::BAD_REQUEST, "host has an invalid label structure");
        }
    };

    let endpoints = match ctx.cache.resolve(&key).await {
        Ok(endpoints) => endpoints,
        Err(err) => {
            warn!(service = %key.name, tag = %key.tag, error = %err, "catalog resolution failed");
            return plain_text(StatusCode::BAD_GATEWAY, "service discovery is unavailable");
        }
    };

    // `key.tag`, when present, already narrowed the catalog query itself;
    // `ctx.prefer` is the separate, always-applied soft affinity within
    // whatever set came back.
    let Some(endpoint) = selector::select(&endpoints, &ctx.prefer) else {
        return plain_text(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("no healthy endpoints for service {:?}", key.name),
        );
    };

    let outbound = match rewrite_request(req, endpoint, &host_header, client_addr, ctx.enable_compression) {
        Ok(outbound) => outbound,
        Err(status) => return plain_text(status, "malformed request"),
    };

    // Raced against the per-connection disconnect signal so a client that
    // goes away while the upstream is still working doesn't leave the
    // forward running to completion for nobody.
    let forwarded = match disconnect {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = ctx.transport.send(outbound) => Some(result),
            }
        }
        None => Some(ctx.transport.send(outbound).await),
    };

    // Any failure before upstream headers arrive — dial failure,
    // header-read timeout, or transport I/O error — is a 502; none of these
    // distinctions are surfaced to the client, only logged.
    match forwarded {
        None => {
            warn!(
                error = %ProxyError::ClientCancelled,
                endpoint = %endpoint.authority(),
                "client disconnected before upstream responded; cancelling forward"
            );
            plain_text(
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).expect("499 is a valid status code"),
                "client disconnected",
            )
        }
        Some(Ok(upstream)) => stream_back(upstream),
        Some(Err(TransportError::DialFailure(err))) => {
            warn!(error = %err, endpoint = %endpoint.authority(), "failed to connect to upstream");
            plain_text(StatusCode::BAD_GATEWAY, "failed to connect to upstream")
        }
        Some(Err(TransportError::ReadTimeout)) => {
            warn!(endpoint = %endpoint.authority(), "upstream response headers timed out");
            plain_text(StatusCode::BAD_GATEWAY, "upstream took too long to respond")
        }
        Some(Err(TransportError::Request(err))) => {
            error!(error = %err, endpoint = %endpoint.authority(), "upstream request failed");
            plain_text(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    }
}

fn host_header<B>(req: &hyper::Request<B>) -> Option<String> {
    req.headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Rewrites the inbound request into one addressed at `endpoint`: new
/// authority, stripped hop-by-hop headers, `X-Forwarded-*` headers set, and
/// `Accept-Encoding` dropped when compression is disabled.
fn rewrite_request<B>(
    req: hyper::Request<B>,
    endpoint: &crate::catalog::Endpoint,
    original_host: &str,
    client_addr: Option<SocketAddr>,
    enable_compression: bool,
) -> Result<hyper::Request<ProxyBody>, StatusCode>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = Uri::builder()
        .scheme("http")
        .authority(endpoint.authority())
        .path_and_query(path_and_query)
        .build()
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    parts.uri = uri;

    // RFC 7230 §6.1: the `Connection` header's value itself lists additional
    // per-hop header names beyond the fixed set above — collect them before
    // `Connection` is removed by the fixed-list pass below.
    let mut named_by_connection: Vec<HeaderName> = Vec::new();
    for value in parts.headers.get_all(http::header::CONNECTION).iter() {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                if let Ok(name) = HeaderName::from_bytes(token.trim().as_bytes()) {
                    named_by_connection.push(name);
                }
            }
        }
    }

    for name in HOP_BY_HOP {
        parts.headers.remove(*name);
    }
    for name in named_by_connection {
        parts.headers.remove(name);
    }
    if !enable_compression {
        parts.headers.remove(http::header::ACCEPT_ENCODING);
    }

    parts.headers.insert(
        http::header::HOST,
        HeaderValue::from_str(&endpoint.authority()).map_err(|_| StatusCode::BAD_REQUEST)?,
    );
    // "set if unset": an inbound request may already carry these from an
    // earlier hop, in which case that value is preserved rather than
    // clobbered — unlike `X-Forwarded-For` below, which always appends.
    if let http::header::Entry::Vacant(entry) = parts.headers.entry(HeaderName::from_static("x-forwarded-host")) {
        entry.insert(HeaderValue::from_str(original_host).map_err(|_| StatusCode::BAD_REQUEST)?);
    }
    if let http::header::Entry::Vacant(entry) = parts.headers.entry(HeaderName::from_static("x-forwarded-proto")) {
        entry.insert(HeaderValue::from_static("http"));
    }

    if let Some(addr) = client_addr {
        let forwarded_for = HeaderName::from_static("x-forwarded-for");
        let ip = addr.ip().to_string();
        match parts.headers.get(&forwarded_for).and_then(|v| v.to_str().ok()) {
            Some(existing) => {
                let combined = format!("{existing}, {ip}");
                if let Ok(value) = HeaderValue::from_str(&combined) {
                    parts.headers.insert(forwarded_for, value);
                }
            }
            None => {
                if let Ok(value) = HeaderValue::from_str(&ip) {
                    parts.headers.insert(forwarded_for, value);
                }
            }
        }
    }

    let body = ProxyBody::new(body);
    Ok(hyper::Request::from_parts(parts, body))
}

/// Streams the upstream response straight through: headers and trailers are
/// copied, the body is relayed frame-by-frame without ever being collected
/// into memory.
fn stream_back(upstream: hyper::Response<hyper::body::Incoming>) -> Response<ProxyBody> {
    let (parts, body) = upstream.into_parts();
    Response::from_parts(parts, ProxyBody::new(body))
}

fn plain_text(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(ProxyBody::from(message.to_owned()))
        .expect("static response parts are always valid")
}

//! Catalog client: queries an external Consul-compatible service-discovery
//! agent for the healthy endpoints of a named service.
//!
//! The client is stateless and does not cache — coalescing and TTL memoization
//! live one layer up, in [`crate::cache`].

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::host::ServiceKey;

/// A reachable upstream address plus zero or more classification tags.
///
/// Value object: no identity beyond its fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tags: Vec<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, tags: Vec<String>) -> Self {
        Self {
            host: host.into(),
            port,
            tags,
        }
    }

    /// Whether this endpoint carries the given tag (case-insensitive, tags
    /// are canonicalized lowercase on decode).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// The `host:port` authority used to rewrite the outbound request.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Why a catalog lookup failed. An empty, successful result ("no healthy
/// endpoints") is explicitly not an error and has no variant here.
#[derive(Debug, Error, Clone)]
pub enum CatalogError {
    /// The agent could not be reached, or returned a transport-level error.
    #[error("catalog agent unavailable: {0}")]
    Unavailable(String),
    /// The agent's response body could not be parsed.
    #[error("catalog response could not be decoded: {0}")]
    Decode(String),
}

/// A Consul `/v1/health/service/<name>` response entry, trimmed to the
/// fields the router needs.
#[derive(Debug, Deserialize)]
struct HealthServiceEntry {
    #[serde(rename = "Service")]
    service: ServiceEntry,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    #[serde(default)]
    tags: Vec<String>,
}

/// Builds the catalog query URL, percent-encoding `key.name` (a path
/// segment) and `key.tag` (a query value) so that a `Host` header crafted to
/// contain query-string metacharacters (`&`, `=`) or path separators (`/`)
/// cannot inject an additional query parameter or escape the service-name
/// path segment — `key.name`/`key.tag` are attacker-controlled via
/// [`crate::host::parse_host`], which does not restrict label characters.
fn build_url(base_url: &str, key: &ServiceKey) -> String {
    let mut url = format!(
        "{}/v1/health/service/{}?passing=true",
        base_url,
        utf8_percent_encode(&key.name, NON_ALPHANUMERIC)
    );
    if !key.tag.is_empty() {
        let _ = write!(url, "&tag={}", utf8_percent_encode(&key.tag, NON_ALPHANUMERIC));
    }
    url
}

/// Stateless client for an external service-discovery agent.
///
/// Concurrency safety is provided entirely by the underlying pooled HTTP
/// client.
#[derive(Clone)]
pub struct CatalogClient {
    base_url: Arc<str>,
    http: Client<HttpConnector, Empty<Bytes>>,
    dial_timeout: Duration,
}

impl CatalogClient {
    /// `agent_addr` is `host:port`, e.g. `localhost:8500`.
    pub fn new(agent_addr: &str, dial_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(dial_timeout));
        connector.enforce_http(true);

        let http = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            base_url: Arc::from(format!("http://{}", agent_addr.trim_end_matches('/'))),
            http,
            dial_timeout,
        }
    }

    /// Queries the catalog agent for the healthy, passing instances of
    /// `key.name`, filtered by `key.tag` when non-empty.
    ///
    /// Returns the full healthy set in the order the agent returns it. An
    /// empty `Vec` with `Ok` is the valid "no healthy endpoints" signal —
    /// it is never an error.
    pub async fn lookup(&self, key: &ServiceKey) -> Result<Vec<Endpoint>, CatalogError> {
        let url = build_url(&self.base_url, key);

        let request = hyper::Request::builder()
            .uri(&url)
            .body(Empty::new())
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;

        let response = tokio::time::timeout(self.dial_timeout, self.http.request(request))
            .await
            .map_err(|_| CatalogError::Unavailable("dial timeout".into()))?
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Unavailable(format!(
                "catalog agent returned {}",
                response.status()
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?
            .to_bytes();

        let entries: Vec<HealthServiceEntry> = serde_json::from_slice(&body).map_err(|e| {
            warn!(error = %e, "failed to decode catalog response");
            CatalogError::Decode(e.to_string())
        })?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                Endpoint::new(
                    entry.service.address,
                    entry.service.port,
                    entry
                        .service
                        .tags
                        .into_iter()
                        .map(|t| t.to_ascii_lowercase())
                        .collect(),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn build_url_percent_encodes_query_injection_attempt() {
        let key = ServiceKey::new("api", "a&passing=false");
        let url = build_url("http://consul:8500", &key);
        assert_eq!(
            url,
            "http://consul:8500/v1/health/service/api?passing=true&tag=a%26passing%3Dfalse"
        );
    }

    #[test]
    fn build_url_percent_encodes_path_traversal_attempt() {
        let key = ServiceKey::new("api/../secret", "");
        let url = build_url("http://consul:8500", &key);
        assert_eq!(
            url,
            "http://consul:8500/v1/health/service/api%2F%2E%2E%2Fsecret?passing=true"
        );
    }

    #[tokio::test]
    async fn lookup_decodes_healthy_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .and(query_param("passing", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Service": {"Address": "10.0.0.1", "Port": 8001, "Tags": ["ZoneA"]}},
                {"Service": {"Address": "10.0.0.2", "Port": 8002, "Tags": []}},
            ])))
            .mount(&server)
            .await;

        let client = CatalogClient::new(
            server.address().to_string().as_str(),
            Duration::from_secs(1),
        );
        let key = ServiceKey::new("api", "");
        let endpoints = client.lookup(&key).await.unwrap();

        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].authority(), "10.0.0.1:8001");
        assert!(endpoints[0].has_tag("zonea"));
        assert!(endpoints[1].tags.is_empty());
    }

    #[tokio::test]
    async fn empty_result_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/ghost"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = CatalogClient::new(server.address().to_string().as_str(), Duration::from_secs(1));
        let endpoints = client
            .lookup(&ServiceKey::new("ghost", ""))
            .await
            .unwrap();
        assert!(endpoints.is_empty());
    }

    #[tokio::test]
    async fn unreachable_agent_is_unavailable() {
        let client = CatalogClient::new("127.0.0.1:1", Duration::from_millis(200));
        let result = client.lookup(&ServiceKey::new("api", "")).await;
        assert!(matches!(result, Err(CatalogError::Unavailable(_))));
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = CatalogClient::new(server.address().to_string().as_str(), Duration::from_secs(1));
        let result = client.lookup(&ServiceKey::new("api", "")).await;
        assert!(matches!(result, Err(CatalogError::Decode(_))));
    }
}

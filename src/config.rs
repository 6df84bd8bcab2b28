//! Command-line parsing and the immutable [`RouterConfig`] it produces.
//!
//! Flag *syntax* is Rust-idiomatic (`--long-name` via `clap`'s derive API
//! rather than a single-dash convention), and duration flags accept
//! `humantime` syntax (`10s`, `30s`, `1m30s`, ...). This mirrors how `neon`'s
//! `local_proxy` binary parses its own duration flags with
//! `value_parser = humantime::parse_duration`.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// Process-wide configuration, frozen for the lifetime of the router.
///
/// Readable without synchronization once constructed: every field is set
/// once at startup and never mutated afterward.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Public proxy listener address.
    pub bind_http: SocketAddr,
    /// Optional health-check listener address.
    pub bind_health_check: Option<SocketAddr>,
    /// Optional profiling listener address (feature `pprof`).
    pub bind_pprof: Option<SocketAddr>,
    /// Catalog agent address, `host:port`.
    pub consul: String,
    /// Metrics sink address. Stored but never dialed — metrics emission is
    /// left to an external collaborator, not implemented here.
    pub datadog: String,
    /// Parent DNS suffix, normalized to begin with `.` (e.g. `.example.com`).
    pub domain: String,
    /// Preferred tag for endpoint selection; empty means no preference.
    pub prefer: String,
    /// Resolution cache TTL.
    pub cache_timeout: Duration,
    /// Upstream connect timeout.
    pub dial_timeout: Duration,
    /// Upstream response-header read timeout.
    pub read_timeout: Duration,
    /// Response write timeout (budget for streaming the body back to the
    /// client). Hyper's HTTP/1 server has no per-connection write-deadline
    /// knob to hang this off without wrapping the client `IO`, so — like
    /// `max_idle_conns` in [`crate::transport`] — it is parsed and stored
    /// but not enforced (see `DESIGN.md`).
    pub write_timeout: Duration,
    /// Idle pooled-connection timeout.
    pub idle_timeout: Duration,
    /// Drain deadline during shutdown.
    pub shutdown_timeout: Duration,
    /// Global idle connection cap across all upstream hosts.
    pub max_idle_conns: usize,
    /// Per-upstream-host idle connection cap.
    pub max_idle_conns_per_host: usize,
    /// Max response header bytes accepted from an upstream.
    pub max_header_bytes: usize,
    /// Whether to advertise compressed encodings to upstreams.
    pub enable_compression: bool,
}

/// Service-discovery-driven HTTP reverse proxy.
#[derive(Parser, Debug)]
#[command(name = "catalog-router", version, about)]
struct Cli {
    /// Proxy listener address
    #[arg(long = "bind-http", default_value = "0.0.0.0:4000")]
    bind_http: SocketAddr,

    /// Health endpoint listener address (off by default)
    #[arg(long = "bind-health-check")]
    bind_health_check: Option<SocketAddr>,

    /// Profiling endpoint listener address (off by default, requires the `pprof` feature)
    #[arg(long = "bind-pprof")]
    bind_pprof: Option<SocketAddr>,

    /// Catalog agent address
    #[arg(long, default_value = "localhost:8500")]
    consul: String,

    /// Metrics sink address (accepted for interface compatibility; not dialed)
    #[arg(long, default_value = "localhost:8125")]
    datadog: String,

    /// Parent domain requests are scoped under
    #[arg(long, default_value = "localhost")]
    domain: String,

    /// Preferred tag for endpoint selection
    #[arg(long, default_value = "")]
    prefer: String,

    /// Resolution cache TTL
    #[arg(long = "cache-timeout", default_value = "10s", value_parser = humantime::parse_duration)]
    cache_timeout: Duration,

    /// Upstream connect timeout
    #[arg(long = "dial-timeout", default_value = "10s", value_parser = humantime::parse_duration)]
    dial_timeout: Duration,

    /// Upstream response-header read timeout
    #[arg(long = "read-timeout", default_value = "30s", value_parser = humantime::parse_duration)]
    read_timeout: Duration,

    /// Response write timeout
    #[arg(long = "write-timeout", default_value = "30s", value_parser = humantime::parse_duration)]
    write_timeout: Duration,

    /// Idle pooled-connection timeout
    #[arg(long = "idle-timeout", default_value = "90s", value_parser = humantime::parse_duration)]
    idle_timeout: Duration,

    /// Drain deadline on shutdown
    #[arg(long = "shutdown-timeout", default_value = "10s", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,

    /// Global idle connection cap
    #[arg(long = "max-idle-conns", default_value_t = 10_000)]
    max_idle_conns: usize,

    /// Per-host idle connection cap
    #[arg(long = "max-idle-conns-per-host", default_value_t = 100)]
    max_idle_conns_per_host: usize,

    /// Max response header bytes accepted from an upstream
    #[arg(long = "max-header-bytes", default_value_t = 65_536)]
    max_header_bytes: usize,

    /// Advertise compressed encodings to upstreams
    #[arg(long = "enable-compression", default_value_t = false)]
    enable_compression: bool,
}

/// Error produced while assembling a [`RouterConfig`] from parsed arguments.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The domain flag was empty.
    #[error("--domain must not be empty")]
    EmptyDomain,
}

impl RouterConfig {
    /// Parses process arguments into a [`RouterConfig`].
    ///
    /// Exits the process with clap's usage/help behavior on malformed
    /// arguments (clap's default `Parser::parse` semantics), and returns
    /// [`ConfigError`] for semantic errors clap cannot catch structurally.
    pub fn parse() -> Result<Self, ConfigError> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let domain = cli.domain.trim();
        if domain.is_empty() {
            return Err(ConfigError::EmptyDomain);
        }
        let domain = domain.trim_start_matches('.').to_ascii_lowercase();
        let domain = format!(".{domain}");

        Ok(RouterConfig {
            bind_http: cli.bind_http,
            bind_health_check: cli.bind_health_check,
            bind_pprof: cli.bind_pprof,
            consul: cli.consul,
            datadog: cli.datadog,
            domain,
            prefer: cli.prefer.to_ascii_lowercase(),
            cache_timeout: cli.cache_timeout,
            dial_timeout: cli.dial_timeout,
            read_timeout: cli.read_timeout,
            write_timeout: cli.write_timeout,
            idle_timeout: cli.idle_timeout,
            shutdown_timeout: cli.shutdown_timeout,
            max_idle_conns: cli.max_idle_conns,
            max_idle_conns_per_host: cli.max_idle_conns_per_host,
            max_header_bytes: cli.max_header_bytes,
            enable_compression: cli.enable_compression,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn domain_is_normalized_with_leading_dot() {
        let cli = Cli::parse_from(["catalog-router", "--domain", "Example.com"]);
        let cfg = RouterConfig::from_cli(cli).unwrap();
        assert_eq!(cfg.domain, ".example.com");
    }

    #[test]
    fn rejects_empty_domain() {
        let cli = Cli::parse_from(["catalog-router", "--domain", "  "]);
        assert!(matches!(
            RouterConfig::from_cli(cli),
            Err(ConfigError::EmptyDomain)
        ));
    }

    #[test]
    fn defaults_are_sane() {
        let cli = Cli::parse_from(["catalog-router"]);
        let cfg = RouterConfig::from_cli(cli).unwrap();
        assert_eq!(cfg.bind_http.to_string(), "0.0.0.0:4000");
        assert_eq!(cfg.consul, "localhost:8500");
        assert_eq!(cfg.cache_timeout, Duration::from_secs(10));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(90));
        assert_eq!(cfg.max_idle_conns, 10_000);
        assert!(!cfg.enable_compression);
    }
}

//! Decomposes an inbound `Host` header into a [`ServiceKey`] given the
//! router's configured parent domain.

use thiserror::Error;

/// The `(service, tag)` selector used as the resolution cache key.
///
/// Canonicalized (lowercase name, lowercase tag) before lookup. Empty tag
/// means "no tag filter".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub name: String,
    pub tag: String,
}

impl ServiceKey {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }
}

/// Why a `Host` header could not be resolved into a [`ServiceKey`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// The host does not end in the router's configured parent domain.
    #[error("host is not under the configured domain")]
    UnknownDomain,
    /// The host is under the parent domain but has an unsupported label
    /// count (zero, or three-or-more).
    #[error("host has an invalid label structure")]
    InvalidHost,
}

/// Parses a `Host` header (which may carry a `:port` suffix) into a
/// [`ServiceKey`], given `domain` — the router's parent suffix, guaranteed
/// by [`crate::config::RouterConfig`] to begin with `.`.
///
/// Label rules:
/// - one label (`api`)       → `ServiceKey{name: "api", tag: ""}`
/// - two labels (`a.api`)    → `ServiceKey{name: "api", tag: "a"}`
/// - zero or 3+ labels       → [`HostError::InvalidHost`]
/// - doesn't end in `domain` → [`HostError::UnknownDomain`]
pub fn parse_host(host: &str, domain: &str) -> Result<ServiceKey, HostError> {
    debug_assert!(domain.starts_with('.'));

    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    let host = host.to_ascii_lowercase();

    let bare_domain = domain.trim_start_matches('.');
    if host == bare_domain {
        // Host equals the parent domain alone: zero labels.
        return Err(HostError::InvalidHost);
    }

    let Some(residual) = host.strip_suffix(domain) else {
        return Err(HostError::UnknownDomain);
    };

    if residual.is_empty() {
        // Host ends with `domain` but is exactly `domain` itself after the
        // leading-dot suffix was consumed from an empty residual — can only
        // happen if `domain` is a bare "." which RouterConfig never produces.
        return Err(HostError::InvalidHost);
    }

    let mut labels = residual.split('.');
    let first = labels.next().unwrap();
    match (first, labels.next(), labels.next()) {
        (name, None, None) => Ok(ServiceKey::new(name, "")),
        (tag, Some(name), None) => Ok(ServiceKey::new(name, tag)),
        _ => Err(HostError::InvalidHost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = ".example.com";

    #[test]
    fn single_label_is_bare_service_name() {
        assert_eq!(
            parse_host("api.example.com", DOMAIN).unwrap(),
            ServiceKey::new("api", "")
        );
    }

    #[test]
    fn two_labels_put_left_label_as_tag() {
        assert_eq!(
            parse_host("zoneA.api.example.com", DOMAIN).unwrap(),
            ServiceKey::new("api", "zonea")
        );
    }

    #[test]
    fn three_labels_is_invalid() {
        assert_eq!(
            parse_host("a.b.api.example.com", DOMAIN),
            Err(HostError::InvalidHost)
        );
    }

    #[test]
    fn bare_domain_is_invalid() {
        assert_eq!(parse_host("example.com", DOMAIN), Err(HostError::InvalidHost));
    }

    #[test]
    fn other_domain_is_unknown() {
        assert_eq!(
            parse_host("api.other.com", DOMAIN),
            Err(HostError::UnknownDomain)
        );
    }

    #[test]
    fn port_suffix_is_stripped() {
        assert_eq!(
            parse_host("api.example.com:8080", DOMAIN).unwrap(),
            ServiceKey::new("api", "")
        );
    }

    #[test]
    fn host_is_lowercased() {
        assert_eq!(
            parse_host("API.EXAMPLE.COM", DOMAIN).unwrap(),
            ServiceKey::new("api", "")
        );
    }

    #[test]
    fn domain_is_total_over_all_inputs() {
        for host in [
            "",
            ".",
            "example.com",
            "api.example.com",
            "a.api.example.com",
            "a.b.api.example.com",
            "api.other.com",
            ":4000",
        ] {
            let _ = parse_host(host, DOMAIN);
        }
    }
}

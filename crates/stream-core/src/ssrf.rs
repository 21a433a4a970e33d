//! SSRF guards for outbound webhook/callback URLs. Revalidated before
//! every delivery attempt and on every redirect hop per the dispatcher's
//! safety contract — a URL that is safe on attempt 1 may resolve
//! differently by attempt 3 if DNS changes underfoot.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::net::lookup_host;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SsrfError {
    #[error("url is not absolute http(s): {0}")]
    BadScheme(String),
    #[error("url has no host")]
    NoHost,
    #[error("host resolves to a disallowed address: {0}")]
    DisallowedAddress(IpAddr),
    #[error("dns resolution failed for host {0}")]
    ResolutionFailed(String),
}

/// Addresses that should never be reachable from an outbound webhook
/// call unless the caller explicitly opts in for in-cluster traffic.
fn is_disallowed(ip: IpAddr, allow_private: bool) -> bool {
    if allow_private {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => is_disallowed_v4(v4),
        IpAddr::V6(v6) => is_disallowed_v6(v6),
    }
}

fn is_disallowed_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_link_local()
        || ip.is_private()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_unspecified()
}

fn is_disallowed_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_disallowed_v4(v4);
    }
    // fc00::/7 unique local addresses and fe80::/10 link-local.
    let segments = ip.segments();
    (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
}

/// Validates scheme and resolves the host, rejecting disallowed address
/// classes. Called fresh before every delivery attempt and redirect hop.
pub async fn validate_outbound_url(url: &str, allow_private: bool) -> Result<(), SsrfError> {
    let parsed = Url::parse(url).map_err(|_| SsrfError::BadScheme(url.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(SsrfError::BadScheme(url.to_string()));
    }
    let host = parsed.host_str().ok_or(SsrfError::NoHost)?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        return if is_disallowed(ip, allow_private) {
            Err(SsrfError::DisallowedAddress(ip))
        } else {
            Ok(())
        };
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|_| SsrfError::ResolutionFailed(host.to_string()))?
        .collect();

    if addrs.is_empty() {
        return Err(SsrfError::ResolutionFailed(host.to_string()));
    }

    for addr in addrs {
        if is_disallowed(addr.ip(), allow_private) {
            return Err(SsrfError::DisallowedAddress(addr.ip()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_scheme() {
        let err = validate_outbound_url("ftp://example.com/x", false)
            .await
            .unwrap_err();
        assert_eq!(err, SsrfError::BadScheme("ftp://example.com/x".into()));
    }

    #[tokio::test]
    async fn rejects_loopback_literal() {
        let err = validate_outbound_url("http://127.0.0.1:8080/hook", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SsrfError::DisallowedAddress(_)));
    }

    #[tokio::test]
    async fn rejects_private_literal() {
        let err = validate_outbound_url("http://10.0.0.5/hook", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SsrfError::DisallowedAddress(_)));
    }

    #[tokio::test]
    async fn allow_private_opt_in_permits_loopback() {
        assert!(validate_outbound_url("http://127.0.0.1:8080/hook", true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn link_local_v6_is_rejected() {
        let err = validate_outbound_url("http://[fe80::1]/hook", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SsrfError::DisallowedAddress(_)));
    }
}

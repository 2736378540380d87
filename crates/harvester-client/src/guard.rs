//! Refuses requests to private, loopback and link-local addresses.
//!
//! Source URLs come from operators through the admin surface, so a fetch or
//! probe must not be usable to reach internal services.

use std::net::IpAddr;

use harvester_core::error::FetchError;
use url::Url;

pub(crate) async fn validate_url(url: &Url) -> Result<(), FetchError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::Unsupported(format!(
            "scheme '{}' is not allowed",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| FetchError::Unsupported("URL has no host".into()))?;
    let bare = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = bare.parse::<IpAddr>() {
        return check(host, ip);
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| FetchError::Network(format!("DNS lookup for {host} failed: {e}")))?;
    let mut any = false;
    for addr in resolved {
        any = true;
        check(host, addr.ip())?;
    }
    if !any {
        return Err(FetchError::Network(format!("{host} has no addresses")));
    }
    Ok(())
}

fn check(host: &str, ip: IpAddr) -> Result<(), FetchError> {
    if is_internal(ip) {
        tracing::warn!(%host, %ip, "Request to internal address refused");
        return Err(FetchError::Unsupported(format!(
            "{host} resolves to internal address {ip}"
        )));
    }
    Ok(())
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // 100.64.0.0/10, carrier-grade NAT
                || (a == 100 && (b & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xFFC0) == 0xFE80
                || (first & 0xFE00) == 0xFC00
                || v6.to_ipv4_mapped().is_some_and(|v4| is_internal(IpAddr::V4(v4)))
        }
    }
}

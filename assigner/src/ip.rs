use http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Client address of a request.
///
/// The socket peer wins unless `trust_forwarded_for` is set, in which case
/// the first `X-Forwarded-For` entry does. Either one is the fallback for
/// the other.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> Option<String> {
    let peer_ip = peer.map(|addr| addr.ip().to_canonical().to_string());
    if trust_forwarded_for {
        forwarded_ip(headers).or(peer_ip)
    } else {
        peer_ip.or_else(|| forwarded_ip(headers))
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Truncates an address so it no longer identifies a single host.
///
/// IPv4 keeps the first three octets, IPv6 the first four hextets. Input
/// that is not an address is returned unchanged.
pub fn anonymize_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>().map(|addr| addr.to_canonical()) {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            Ipv4Addr::new(a, b, c, 0).to_string()
        }
        Ok(IpAddr::V6(v6)) => {
            let [a, b, c, d, ..] = v6.segments();
            Ipv6Addr::new(a, b, c, d, 0, 0, 0, 0).to_string()
        }
        Err(_) => {
            tracing::warn!("Failed to parse client address, keeping it as is");
            ip.to_string()
        }
    }
}

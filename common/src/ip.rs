use std::net::IpAddr;
use std::str::FromStr;

use axum::http::HeaderMap;

/// Unwraps an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) to its v4 form.
fn unwrap_mapped(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    IpAddr::from_str(first).ok()
}

fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let raw = headers.get("x-real-ip")?.to_str().ok()?.trim();
    IpAddr::from_str(raw).ok()
}

/// Client-source IP extraction order: `X-Forwarded-For` first hop, then
/// `X-Real-IP`. Callers fall back to the transport peer address (the
/// `ClientIp` extractor's own result) when this returns `None`.
pub fn extract_ip_from_headers(headers: &HeaderMap) -> Option<IpAddr> {
    forwarded_for(headers).or_else(|| real_ip(headers)).map(unwrap_mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        headers
    }

    #[test]
    fn prefers_x_forwarded_for_first_hop() {
        let headers = headers_with(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "203.0.113.8"),
        ]);
        assert_eq!(
            extract_ip_from_headers(&headers),
            Some("203.0.113.7".parse().unwrap())
        );
    }

    #[test]
    fn falls_back_to_x_real_ip() {
        let headers = headers_with(&[("x-real-ip", "203.0.113.8")]);
        assert_eq!(
            extract_ip_from_headers(&headers),
            Some("203.0.113.8".parse().unwrap())
        );
    }

    #[test]
    fn unwraps_ipv4_mapped_ipv6() {
        let headers = headers_with(&[("x-real-ip", "::ffff:203.0.113.8")]);
        assert_eq!(
            extract_ip_from_headers(&headers),
            Some("203.0.113.8".parse().unwrap())
        );
    }

    #[test]
    fn returns_none_without_headers() {
        let headers = HeaderMap::new();
        assert_eq!(extract_ip_from_headers(&headers), None);
    }
}

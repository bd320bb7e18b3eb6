//! Client IP resolution.
//!
//! # Forwarding Headers
//!
//! By default the direct peer address is used and `X-Forwarded-For` is
//! ignored. Behind a reverse proxy, enable `TRUST_PROXY_HEADERS` and set
//! `TRUSTED_PROXY_COUNT` to the number of proxies in front of this service.
//!
//! The header is an ordered list `client, proxy1, proxy2, ...` where each
//! entry is one hop closer to this server. The last N entries were appended
//! by trusted proxies, so the client is the entry immediately before them:
//!
//! ```text
//! X-Forwarded-For: 1.2.3.4, 5.6.7.8, 9.9.9.9     (N = 2)
//!                  ^^^^^^^  └─── trusted hops ──┘
//!                  client
//! ```
//!
//! A header shorter than N + 1 entries resolves to its first entry rather
//! than failing the request.
//!
//! # Security Warning
//!
//! With trust enabled, a client that reaches this service directly can put
//! any address it likes into the header. Only enable trust when the service
//! is reachable exclusively through the configured proxies.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;

/// Address used when the peer address is unavailable.
pub const FALLBACK_IP: &str = "127.0.0.1";

/// Forwarding header consulted when proxy trust is enabled.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Proxy trust settings for client IP resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyTrust {
    pub trust_headers: bool,
    pub trusted_hops: usize,
}

impl ProxyTrust {
    pub fn new(trust_headers: bool, trusted_hops: usize) -> Self {
        Self {
            trust_headers,
            trusted_hops,
        }
    }
}

/// Resolved client IP, stored in request extensions for handlers and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl std::fmt::Display for ClientIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the client IP from the peer address and forwarding header.
///
/// Pure function of its inputs.
pub fn resolve_client_ip(peer: Option<IpAddr>, forwarded: Option<&str>, trust: ProxyTrust) -> String {
    let peer_ip = || peer.map_or_else(|| FALLBACK_IP.to_string(), |ip| ip.to_string());

    if !trust.trust_headers {
        return peer_ip();
    }
    let Some(header) = forwarded else {
        return peer_ip();
    };

    let hops: Vec<&str> = header.split(',').map(str::trim).collect();
    let index = if hops.len() > trust.trusted_hops {
        hops.len() - trust.trusted_hops - 1
    } else {
        0
    };

    match hops.get(index) {
        Some(ip) if !ip.is_empty() => (*ip).to_string(),
        _ => peer_ip(),
    }
}

/// Resolve the client IP of `req`.
///
/// The peer address comes from axum's `ConnectInfo<SocketAddr>` extension,
/// present when the server is started with
/// `into_make_service_with_connect_info`.
pub fn client_ip_from_request<B>(req: &Request<B>, trust: ProxyTrust) -> String {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let forwarded = req
        .headers()
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok());

    resolve_client_ip(peer, forwarded, trust)
}

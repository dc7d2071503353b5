//! Request inspection.
//!
//! # Responsibilities
//! - Generate a UUID v4 request ID for every request
//! - Identify the client IP from the accepted socket
//! - Classify download requests for the rate limiter
//! - Hand handlers the connection's close token

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, Extensions, HeaderValue, Method, Request},
};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestId, RequestId};

use crate::net::ConnectionContext;
use crate::security::validator::METADATA_SUFFIX;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Prefix shared by every snapshot route.
pub const SNAPSHOTS_PREFIX: &str = "/snapshots/";

/// UUID v4 request IDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestUuid;

impl MakeRequestId for RequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// The peer address of the TCP connection a request arrived on.
///
/// Proxy headers are not consulted. Requests that did not come through the
/// accept loop (router-level tests) fall back to `0.0.0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl ClientIp {
    pub fn from_extensions(extensions: &Extensions) -> IpAddr {
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .or_else(|| extensions.get::<ConnectionContext>().map(|c| c.peer.ip()))
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn from_request(request: &Request<Body>) -> IpAddr {
        Self::from_extensions(request.extensions())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(Self::from_extensions(&parts.extensions)))
    }
}

/// Token that closes the request's connection when cancelled.
///
/// Outside the accept loop this is a fresh token nobody else holds.
#[derive(Debug, Clone)]
pub struct ConnectionClose(pub CancellationToken);

impl ConnectionClose {
    pub fn from_extensions(extensions: &Extensions) -> CancellationToken {
        extensions
            .get::<ConnectionContext>()
            .map(|c| c.close.clone())
            .unwrap_or_default()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ConnectionClose {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(Self::from_extensions(&parts.extensions)))
    }
}

/// True for `GET /snapshots/<archive>`, excluding metadata lookups.
pub fn is_download_request(method: &Method, path: &str) -> bool {
    if method != Method::GET {
        return false;
    }
    match path.strip_prefix(SNAPSHOTS_PREFIX) {
        Some(name) => !name.is_empty() && !name.contains('/') && !name.ends_with(METADATA_SUFFIX),
        None => false,
    }
}

/// Bounded label for request metrics.
pub fn route_label(path: &str) -> &'static str {
    match path {
        "/health" => "/health",
        "/snapshots" => "/snapshots",
        p if p.starts_with(SNAPSHOTS_PREFIX) && p.ends_with(METADATA_SUFFIX) => {
            "/snapshots/{name}.header.json"
        }
        p if p.starts_with(SNAPSHOTS_PREFIX) => "/snapshots/{name}",
        _ => "unmatched",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_download_requests() {
        let name = "/snapshots/snapshot_1_2025-01-01_00-00-00.gz";
        assert!(is_download_request(&Method::GET, name));
        assert!(!is_download_request(&Method::HEAD, name));
        assert!(!is_download_request(
            &Method::GET,
            "/snapshots/snapshot_1_2025-01-01_00-00-00.gz.header.json"
        ));
        assert!(!is_download_request(&Method::GET, "/snapshots"));
        assert!(!is_download_request(&Method::GET, "/snapshots/"));
        assert!(!is_download_request(&Method::GET, "/snapshots/a/b"));
        assert!(!is_download_request(&Method::GET, "/health"));
    }

    #[test]
    fn route_labels_are_bounded() {
        assert_eq!(route_label("/health"), "/health");
        assert_eq!(route_label("/snapshots/x.gz"), "/snapshots/{name}");
        assert_eq!(route_label("/snapshots/x.gz.header.json"), "/snapshots/{name}.header.json");
        assert_eq!(route_label("/wp-admin"), "unmatched");
    }

    #[test]
    fn client_ip_prefers_connect_info() {
        let mut request = Request::new(Body::empty());
        assert_eq!(ClientIp::from_request(&request), IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let addr: SocketAddr = "203.0.113.5:5000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        assert_eq!(ClientIp::from_request(&request), addr.ip());
    }

    #[test]
    fn request_ids_are_uuids() {
        let request = Request::new(Body::empty());
        let id = RequestUuid.make_request_id(&request).unwrap();
        let text = id.header_value().to_str().unwrap();
        assert!(uuid::Uuid::parse_str(text).is_ok());
    }
}

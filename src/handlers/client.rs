//! Who is calling, and under which base URL they reached us.

use crate::services::share_service::ShareService;
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, request::Parts},
};
use std::{convert::Infallible, net::SocketAddr};

/// The caller's address as used for access decisions.
///
/// The socket peer, unless proxy headers are trusted: then the rightmost
/// `X-Forwarded-For` entry (appended by our own proxy), then `X-Real-IP`.
/// A missing peer address yields `"unknown"`, which classifies as external.
#[derive(Debug, Clone)]
pub struct ClientAddr(pub String);

impl FromRequestParts<ShareService> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ShareService,
    ) -> Result<Self, Self::Rejection> {
        let peer = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let trust_proxy = state.config().snapshot().trust_proxy;
        Ok(ClientAddr(resolve_client(&parts.headers, peer, trust_proxy)))
    }
}

fn resolve_client(headers: &HeaderMap, peer: Option<String>, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit(',').map(str::trim).find(|s| !s.is_empty()));
        if let Some(addr) = forwarded {
            return addr.to_string();
        }
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(addr) = real_ip {
            return addr.to_string();
        }
    }
    peer.unwrap_or_else(|| "unknown".to_string())
}

/// `scheme://host` the request was addressed to, for building links when no
/// public base URL is configured.
pub fn request_base(headers: &HeaderMap, trust_proxy: bool) -> String {
    let forwarded = |name: &str| {
        if !trust_proxy {
            return None;
        }
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };
    let scheme = forwarded("x-forwarded-proto").unwrap_or("http");
    let host = forwarded("x-forwarded-host")
        .or_else(|| headers.get("host").and_then(|v| v.to_str().ok()))
        .unwrap_or("localhost");
    format!("{}://{}", scheme, host)
}

//! Bearer-token authentication
//!
//! With a token configured every request except `/health` and CORS
//! preflights must present it. Without one, only loopback peers are served.

use axum::{
    extract::{connect_info::MockConnectInfo, ConnectInfo, Request, State},
    http::{header::AUTHORIZATION, Method},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use super::error::ServiceError;
use super::ServerState;

/// Paths reachable without credentials
const PUBLIC_PATHS: &[&str] = &["/health"];

pub async fn require_auth(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    if request.method() == Method::OPTIONS || PUBLIC_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    match &state.config.api_token {
        Some(expected) => {
            let presented = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|header| header.to_str().ok())
                .and_then(|header| header.strip_prefix("Bearer "));
            match presented {
                Some(token) if tokens_match(token, expected) => {}
                _ => {
                    debug!("Rejected request to {} with missing or bad token", request.uri().path());
                    return Err(ServiceError::Unauthorized);
                }
            }
        }
        None => {
            let loopback = peer_ip(&request).is_some_and(|ip| ip.is_loopback());
            if !loopback {
                debug!("Rejected non-loopback peer {:?} with no token configured", peer_ip(&request));
                return Err(ServiceError::Unauthorized);
            }
        }
    }

    Ok(next.run(request).await)
}

/// Remote address of the connection, when the server was started with
/// connect info
pub fn peer_ip(request: &Request) -> Option<IpAddr> {
    let extensions = request.extensions();
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .or_else(|| {
            extensions
                .get::<MockConnectInfo<SocketAddr>>()
                .map(|MockConnectInfo(addr)| addr.ip())
        })
}

/// Compare digests so timing does not depend on where the inputs differ
fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "secreT"));
        assert!(!tokens_match("", "secret"));
    }

    #[test]
    fn test_peer_ip_from_connect_info() {
        let mut request = Request::new(Body::empty());
        assert_eq!(peer_ip(&request), None);

        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 4000))));
        assert_eq!(peer_ip(&request), Some(IpAddr::from([10, 0, 0, 7])));
    }
}

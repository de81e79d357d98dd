//! CORS with an explicit origin allow-list

use axum::{
    extract::Request,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        request::Parts,
        HeaderValue, Method, StatusCode,
    },
    middleware::Next,
    response::Response,
};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Preflight cache lifetime, one day
const MAX_AGE: Duration = Duration::from_secs(86_400);

/// CORS layer for the configured origins
///
/// An empty list falls back to localhost origins only; `"*"` allows any.
pub fn layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<String> = origins
        .iter()
        .map(|o| o.trim().trim_end_matches('/').to_string())
        .filter(|o| !o.is_empty())
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::predicate(|origin: &HeaderValue, _: &Parts| {
            origin.to_str().map(is_localhost_origin).unwrap_or(false)
        })
    } else if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(MAX_AGE)
}

/// `CorsLayer` answers preflights with 200; clients expect 204
pub async fn preflight_no_content(request: Request, next: Next) -> Response {
    let preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

fn is_localhost_origin(origin: &str) -> bool {
    url::Url::parse(origin)
        .ok()
        .and_then(|url| url.host_str().map(|h| matches!(h, "localhost" | "127.0.0.1" | "[::1]")))
        .unwrap_or(false)
}

//! Sliding-window rate limiting per client IP

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use super::auth::peer_ip;
use super::error::ServiceError;
use super::ServerState;

/// Tracked IPs before idle entries are swept
const SWEEP_THRESHOLD: usize = 10_000;

/// Keeps the timestamps of recent requests per IP and drops the expired
/// ones on every check, so the count is exact for any window position
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request at `now`, or return how long until one is allowed
    pub fn check(&self, ip: IpAddr, now: Instant) -> Result<(), Duration> {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());

        if hits.len() > SWEEP_THRESHOLD {
            let window = self.window;
            hits.retain(|_, times| times.back().is_some_and(|t| now.duration_since(*t) < window));
        }

        let times = hits.entry(ip).or_default();
        while let Some(oldest) = times.front() {
            if now.duration_since(*oldest) >= self.window {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() >= self.limit {
            let wait = times
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(wait);
        }

        times.push_back(now);
        Ok(())
    }
}

pub async fn enforce(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let ip = peer_ip(&request).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    if let Err(wait) = state.limiter.check(ip, Instant::now()) {
        let retry_after_secs = wait.as_secs_f64().ceil().max(1.0) as u64;
        debug!("Rate limited {} for {}s", ip, retry_after_secs);
        return Err(ServiceError::RateLimited { retry_after_secs });
    }
    Ok(next.run(request).await)
}

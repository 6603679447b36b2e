//! Fixed-window request limiter keyed by client IP and endpoint.
//!
//! Each (client, path) pair gets its own bucket of `requests` units that
//! refills all at once when the window elapses.

use std::hash::{DefaultHasher, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use serde_json::json;
use tracing::warn;

use crate::config::RateLimitConfig;

/// Buckets tracked before expired ones are swept.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Clone, Copy, Debug)]
struct Window {
    used: u32,
    reset_at: Instant,
}

/// Outcome of charging one request against a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32, reset_after: Duration },
    Limited { retry_after: Duration },
}

/// Shared limiter state. Cloning shares the buckets.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<DashMap<u64, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(DashMap::new()),
        }
    }

    /// Charge one request from `client` to `endpoint`.
    pub fn check(&self, client: &str, endpoint: &str) -> Decision {
        self.check_at(client, endpoint, Instant::now())
    }

    fn check_at(&self, client: &str, endpoint: &str, now: Instant) -> Decision {
        if self.buckets.len() > SWEEP_THRESHOLD {
            self.buckets.retain(|_, window| window.reset_at > now);
        }

        let limit = self.config.requests;
        let mut window = self
            .buckets
            .entry(bucket_key(client, endpoint))
            .or_insert(Window {
                used: 0,
                reset_at: now + self.config.window,
            });

        if now >= window.reset_at {
            window.used = 0;
            window.reset_at = now + self.config.window;
        }

        let reset_after = window.reset_at.saturating_duration_since(now);
        if window.used >= limit {
            return Decision::Limited {
                retry_after: reset_after,
            };
        }

        window.used += 1;
        Decision::Allowed {
            remaining: limit - window.used,
            reset_after,
        }
    }
}

fn bucket_key(client: &str, endpoint: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(client.as_bytes());
    hasher.write_u8(0);
    hasher.write(endpoint.as_bytes());
    hasher.finish()
}

fn client_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.ip().to_string())
        .unwrap_or_default()
}

fn header_secs(duration: Duration) -> HeaderValue {
    // Round up so a client never retries before the window resets
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    HeaderValue::from(secs)
}

/// Middleware rejecting requests over budget with 429.
pub async fn rate_limit(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_ip(&request);
    let endpoint = request.uri().path().to_string();

    match limiter.check(&client, &endpoint) {
        Decision::Allowed {
            remaining,
            reset_after,
        } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limiter.config.requests));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            headers.insert("x-ratelimit-reset-after", header_secs(reset_after));
            response
        }
        Decision::Limited { retry_after } => {
            warn!(client = %client, endpoint = %endpoint, "Rate limit exceeded");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "Too many requests" })),
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, header_secs(retry_after));
            headers.insert("x-ratelimit-limit", HeaderValue::from(limiter.config.requests));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
            response
        }
    }
}

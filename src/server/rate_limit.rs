//! Per-client token-bucket rate limiting.
//!
//! One keyed bucket per client id: capacity `burst`, refilled at
//! `requests_per_minute / 60` per second. The client id is the remote
//! address, optionally replaced by the leftmost `x-forwarded-for` entry
//! when proxy headers are trusted.

use axum::http::HeaderMap;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::net::SocketAddr;
use std::num::NonZeroU32;

use crate::error::{CoordResult, CoordinatorError};

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Process-wide client rate limiter owned by the HTTP server.
pub struct ClientRateLimiter {
    limiter: KeyedLimiter,
    trust_proxy_headers: bool,
}

impl ClientRateLimiter {
    pub fn new(requests_per_minute: u32, burst: u32, trust_proxy_headers: bool) -> Self {
        let per_minute = NonZeroU32::new(requests_per_minute.max(1)).expect("clamped above zero");
        let burst = NonZeroU32::new(burst.max(1)).expect("clamped above zero");
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute).allow_burst(burst)),
            trust_proxy_headers,
        }
    }

    /// Take one token for this client; empty bucket means 429.
    pub fn check(&self, remote: SocketAddr, headers: &HeaderMap) -> CoordResult<()> {
        let client_id = self.client_id(remote, headers);
        self.limiter
            .check_key(&client_id)
            .map_err(|_| CoordinatorError::RateLimited)
    }

    fn client_id(&self, remote: SocketAddr, headers: &HeaderMap) -> String {
        if self.trust_proxy_headers {
            if let Some(forwarded) = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
            {
                let forwarded = forwarded.trim();
                if !forwarded.is_empty() {
                    return forwarded.to_string();
                }
            }
        }
        remote.ip().to_string()
    }
}

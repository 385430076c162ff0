//! Connection admission: per-IP rate limiting, origin allow-list, shared secret.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! ```text
//! attempt ──► rate (429) ──► origin (403) ──► credential (401) ──► admitted
//! ```
//!
//! The rate table is the only state shared between concurrent accepts. It is a
//! `DashMap`, so increment-or-reset for one IP and the periodic sweep never
//! race on the same bucket.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;

/// Allow-list entry that admits any origin.
pub const ANY_ORIGIN: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("too many connection attempts")]
    RateLimited,
    #[error("origin not allowed")]
    ForbiddenOrigin,
    #[error("missing or invalid api key")]
    Unauthorized,
}

impl AdmissionError {
    /// HTTP status returned to the rejected client.
    pub fn status(&self) -> u16 {
        match self {
            AdmissionError::RateLimited => 429,
            AdmissionError::ForbiddenOrigin => 403,
            AdmissionError::Unauthorized => 401,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::RateLimited => "Too Many Requests",
            AdmissionError::ForbiddenOrigin => "Forbidden",
            AdmissionError::Unauthorized => "Unauthorized",
        }
    }
}

/// Fixed-window counter for one client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBucket {
    pub window_start: Instant,
    pub count: u32,
}

/// Fixed-window connection counter keyed by client IP.
pub struct RateLimiter {
    buckets: DashMap<String, RateBucket>,
    window: Duration,
    max: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            window,
            max,
        }
    }

    /// Count one attempt from `ip` at `now`.
    ///
    /// A bucket older than the window restarts at `now`; the attempt is
    /// rejected once the count exceeds the maximum.
    pub fn check(&self, ip: &str, now: Instant) -> Result<(), AdmissionError> {
        let mut bucket = self.buckets.entry(ip.to_string()).or_insert(RateBucket {
            window_start: now,
            count: 0,
        });
        if now.saturating_duration_since(bucket.window_start) > self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        bucket.count = bucket.count.saturating_add(1);
        if bucket.count > self.max {
            return Err(AdmissionError::RateLimited);
        }
        Ok(())
    }

    /// Drop buckets whose window has expired. Returns how many were removed.
    ///
    /// Buckets inserted by concurrent checks are never counted.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, b| {
            let live = now.saturating_duration_since(b.window_start) <= self.window;
            if !live {
                removed += 1;
            }
            live
        });
        removed
    }

    pub fn bucket(&self, ip: &str) -> Option<RateBucket> {
        self.buckets.get(ip).map(|b| *b)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// What the relay knows about a connection attempt before upgrading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub ip: String,
    pub origin: Option<String>,
    pub credential: Option<String>,
    pub room: String,
}

impl AdmissionRequest {
    /// Extract the admission inputs from a WebSocket upgrade request.
    ///
    /// The client IP is the first `x-forwarded-for` entry when present,
    /// else the socket peer address.
    pub fn from_upgrade(req: &Request, peer: SocketAddr) -> Self {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let ip = header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| peer.ip().to_string());

        let credential = req
            .uri()
            .query()
            .and_then(|q| query_param(q, "apiKey"))
            .or_else(|| header("x-api-key"));

        Self {
            ip,
            origin: header("origin"),
            credential,
            room: room_from_path(req.uri().path()),
        }
    }

    /// Parsed client address, when the IP string is one.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip.parse().ok()
    }
}

/// Room id is the path without its leading `/`; the bare path maps to `default`.
pub fn room_from_path(path: &str) -> String {
    let room = path.trim_start_matches('/');
    if room.is_empty() {
        "default".to_string()
    } else {
        room.to_string()
    }
}

/// First non-empty, percent-decoded value of `key`.
fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k != key || v.is_empty() {
            return None;
        }
        match urlencoding::decode(v) {
            Ok(decoded) => Some(decoded.into_owned()),
            Err(e) => {
                log::debug!("Ignoring undecodable {key} query value: {e}");
                None
            }
        }
    })
}

/// Origin + credential policy together with the rate table.
pub struct Gatekeeper {
    limiter: RateLimiter,
    allowed_origins: Vec<String>,
    api_key: Option<String>,
}

impl Gatekeeper {
    pub fn new(limiter: RateLimiter, allowed_origins: Vec<String>, api_key: Option<String>) -> Self {
        Self {
            limiter,
            allowed_origins,
            api_key,
        }
    }

    /// Run all checks in order. A rejected attempt still counts against the rate.
    pub fn admit(&self, req: &AdmissionRequest, now: Instant) -> Result<(), AdmissionError> {
        self.limiter.check(&req.ip, now)?;

        if !self.origin_allowed(req.origin.as_deref()) {
            return Err(AdmissionError::ForbiddenOrigin);
        }

        if let Some(expected) = &self.api_key {
            if req.credential.as_deref() != Some(expected.as_str()) {
                return Err(AdmissionError::Unauthorized);
            }
        }

        Ok(())
    }

    fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.iter().any(|o| o == ANY_ORIGIN) {
            return true;
        }
        origin.is_some_and(|origin| self.allowed_origins.iter().any(|o| o == origin))
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

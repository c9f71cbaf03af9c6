//! Fixed-window request limiting per client address.

use super::schema::ErrorMessage;
use log::{debug, warn};
use poem::http::StatusCode;
use poem::{async_trait, Endpoint, IntoResponse, Middleware, Request, Response, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_REQUESTS: u32 = 100;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    clients: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        RateLimiter {
            max_requests,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Counts the request and tells whether it is still within the limit of its window.
    pub fn check(&self, ip: IpAddr, now: Instant) -> bool {
        let mut clients = match self.clients.lock() {
            Ok(clients) => clients,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Forget the clients whose window is over, so the map doesn't grow without bound.
        if clients.len() > 10_000 {
            let window = self.window;
            clients.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = clients.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

pub struct RateLimit {
    limiter: Arc<RateLimiter>,
}

impl RateLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        RateLimit {
            limiter: Arc::new(RateLimiter::new(max_requests, window)),
        }
    }
}

impl<E: Endpoint> Middleware<E> for RateLimit {
    type Output = RateLimitEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        RateLimitEndpoint {
            ep,
            limiter: self.limiter.clone(),
        }
    }
}

pub struct RateLimitEndpoint<E> {
    ep: E,
    limiter: Arc<RateLimiter>,
}

fn too_many_requests() -> Response {
    let body = ErrorMessage {
        msg: "Too many requests from this IP, please try again later.".to_string(),
    };
    let body = serde_json::to_string(&body).unwrap_or_default();
    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .content_type("application/json")
        .body(body)
}

#[async_trait]
impl<E: Endpoint> Endpoint for RateLimitEndpoint<E> {
    type Output = Response;

    async fn call(&self, req: Request) -> Result<Self::Output> {
        // Requests without a socket address (e.g. unix sockets, tests) are not limited.
        if let Some(addr) = req.remote_addr().as_socket_addr() {
            if !self.limiter.check(addr.ip(), Instant::now()) {
                warn!("Rate limit exceeded by {}.", addr.ip());
                return Ok(too_many_requests());
            }
            debug!("{} {} from {}", req.method(), req.uri(), addr.ip());
        }

        self.ep.call(req).await.map(IntoResponse::into_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_check() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let now = Instant::now();

        assert!(limiter.check(ip, now));
        assert!(limiter.check(ip, now + Duration::from_secs(1)));
        assert!(!limiter.check(ip, now + Duration::from_secs(2)));
        assert!(limiter.check(other, now + Duration::from_secs(2)));

        // A new window starts once the old one is over.
        assert!(limiter.check(ip, now + Duration::from_secs(61)));
    }

    #[test]
    fn test_default_limits() {
        let limiter = RateLimiter::default();
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let now = Instant::now();
        for _ in 0..DEFAULT_MAX_REQUESTS {
            assert!(limiter.check(ip, now));
        }
        assert!(!limiter.check(ip, now));
    }
}

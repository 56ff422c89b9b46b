//! Rate limiting middleware using token bucket algorithm
//!
//! One bucket per client address. Behind a single reverse proxy the address
//! comes from the last `X-Forwarded-For` hop when `trust_proxy` is set.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use petpal_common::config::RateLimitConfig;
use petpal_common::errors::AppError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter keyed by client IP
pub type ClientRateLimiter = DefaultKeyedRateLimiter<IpAddr>;

/// Shared limiter plus the configured rate, for error messages
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<ClientRateLimiter>,
    requests_per_minute: u32,
    trust_proxy: bool,
}

impl RateLimitState {
    pub fn new(config: &RateLimitConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(per_minute);

        let quota = Quota::per_minute(per_minute).allow_burst(burst);

        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            requests_per_minute: per_minute.get(),
            trust_proxy: config.trust_proxy,
        }
    }

    fn check(&self, ip: IpAddr) -> Result<(), AppError> {
        self.limiter
            .check_key(&ip)
            .map_err(|_| AppError::RateLimited {
                limit: self.requests_per_minute,
            })
    }
}

/// Address a request is counted against
fn client_ip(request: &Request, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit(',').map(str::trim).find(|hop| !hop.is_empty()))
            .and_then(|hop| hop.parse::<IpAddr>().ok());

        if let Some(ip) = forwarded {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ip = client_ip(&request, state.trust_proxy);

    if let Err(e) = state.check(ip) {
        tracing::warn!(ip = %ip, path = %request.uri().path(), "Rate limit exceeded");
        return Err(e);
    }

    Ok(next.run(request).await)
}

//! Per-client-IP rate limiting built atop `governor`.
//!
//! A single keyed limiter shared by the rate-limit middleware. The quota is a
//! fixed budget of `requests` per `window_secs`, with the full budget
//! available as burst. Clients without a resolvable IP fall back to a shared
//! bucket key.
use std::{net::IpAddr, num::NonZeroU32, sync::Arc, time::Duration};

use governor::{
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};

use crate::config::models::RateLimitConfig;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Keyed per-IP limiter. Cheap to clone; clones share limiter state.
#[derive(Clone)]
pub struct IpRateLimiter {
    limiter: Arc<KeyedLimiter>,
}

impl IpRateLimiter {
    /// Build a limiter from configuration. Returns an error when the quota
    /// parameters cannot express a valid rate.
    pub fn new(config: &RateLimitConfig) -> Result<Self, String> {
        let requests = NonZeroU32::new(config.requests)
            .ok_or_else(|| "rate_limit.requests must be greater than 0".to_string())?;
        let window = Duration::from_secs(config.window_secs.max(1));

        let period = window / requests.get();
        let quota = Quota::with_period(period)
            .ok_or_else(|| format!("invalid rate limit period: {period:?}"))?
            .allow_burst(requests);

        Ok(Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        })
    }

    /// Check whether a request from `ip` is within quota.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn config(requests: u32, window_secs: u64) -> RateLimitConfig {
        RateLimitConfig {
            enable: true,
            requests,
            window_secs,
        }
    }

    #[test]
    fn allows_up_to_burst_then_limits() {
        let limiter = IpRateLimiter::new(&config(3, 60)).unwrap();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }

    #[test]
    fn limits_are_per_ip() {
        let limiter = IpRateLimiter::new(&config(1, 60)).unwrap();
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }

    #[test]
    fn zero_requests_is_invalid() {
        assert!(IpRateLimiter::new(&config(0, 60)).is_err());
    }
}

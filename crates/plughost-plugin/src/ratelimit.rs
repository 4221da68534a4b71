//! Per-capability rate limiting for sandbox calls, backed by `governor`.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;

type Direct<C> =
    governor::RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Allows a burst of `limit` calls, refilled evenly over `window`.
///
/// A limit of zero denies every call.
pub struct RateLimiter<C: Clock = DefaultClock> {
    inner: Option<Direct<C>>,
}

impl<C: Clock> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("open", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_clock(limit, window, DefaultClock::default())
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(limit: u32, window: Duration, clock: C) -> Self {
        let inner = NonZeroU32::new(limit)
            .and_then(|burst| {
                let period = (window / limit).max(Duration::from_nanos(1));
                Quota::with_period(period).map(|quota| quota.allow_burst(burst))
            })
            .map(|quota| governor::RateLimiter::direct_with_clock(quota, clock));
        Self { inner }
    }

    /// Consume one call if within quota. Returns whether it is allowed.
    pub fn check(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|limiter| limiter.check().is_ok())
    }
}

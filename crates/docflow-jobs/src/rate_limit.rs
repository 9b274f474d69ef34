//! Process-wide limiter for requests to the classification/embedding service.

use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};

/// Direct quota, no keyed bucketing: one model server per process.
type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Enforces a minimum interval between service requests.
///
/// Clones share the same limiter, so every Classify and Embed stage in the
/// process draws from one budget. A zero interval disables limiting.
#[derive(Clone, Default)]
pub struct ServiceLimiter {
    inner: Option<Arc<DirectRateLimiter>>,
    min_interval: Duration,
}

impl ServiceLimiter {
    pub fn new(min_interval: Duration) -> Self {
        let inner = Quota::with_period(min_interval).map(|quota| Arc::new(RateLimiter::direct(quota)));
        Self {
            inner,
            min_interval,
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next request may be sent.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }
}

impl std::fmt::Debug for ServiceLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLimiter")
            .field("enabled", &self.is_enabled())
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

/*!
 * # Rate Limiting Module
 *
 * Sliding-window limiter guarding outbound calls to third-party APIs
 * (the Printify client allows 600 requests per rolling minute).
 *
 * ```ignore
 * let limiter = SlidingWindowLimiter::new(RateLimitConfig::per_minute(600, "printify"))?;
 * limiter.acquire().await;
 * ```
 */
use metrics::counter;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded, retry in {0:?}")]
    LimitExceeded(Duration),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_duration: Duration,
    /// Label used in logs and metrics
    pub name: String,
}

impl RateLimitConfig {
    pub fn per_minute(requests: u32, name: impl Into<String>) -> Self {
        Self {
            requests_per_window: requests,
            window_duration: Duration::from_secs(60),
            name: name.into(),
        }
    }
}

/// Admits at most `requests_per_window` calls in any rolling window.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    hits: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        if config.requests_per_window == 0 {
            return Err(RateLimitError::InvalidConfig(
                "requests_per_window must be greater than 0".to_string(),
            ));
        }
        if config.window_duration.is_zero() {
            return Err(RateLimitError::InvalidConfig(
                "window_duration must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            hits: Mutex::new(VecDeque::with_capacity(config.requests_per_window as usize)),
            config,
        })
    }

    /// Records a request if a slot is free, otherwise returns how long
    /// until the oldest request leaves the window.
    pub async fn try_acquire(&self) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;

        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= self.config.window_duration {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() < self.config.requests_per_window as usize {
            hits.push_back(now);
            return Ok(());
        }

        let wait = hits
            .front()
            .map(|oldest| self.config.window_duration - now.duration_since(*oldest))
            .unwrap_or(self.config.window_duration);
        Err(RateLimitError::LimitExceeded(wait))
    }

    /// Waits until a slot is free, then records the request.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire().await {
                Ok(()) => return,
                Err(RateLimitError::LimitExceeded(wait)) => {
                    counter!(
                        "storefront.rate_limiter.throttled",
                        1,
                        "limiter" => self.config.name.clone()
                    );
                    debug!(
                        limiter = %self.config.name,
                        wait_ms = wait.as_millis() as u64,
                        "Throttling outbound request"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(RateLimitError::InvalidConfig(_)) => return,
            }
        }
    }

    /// Requests currently counted in the window.
    pub async fn in_flight(&self) -> usize {
        let now = Instant::now();
        let hits = self.hits.lock().await;
        hits.iter()
            .filter(|t| now.duration_since(**t) < self.config.window_duration)
            .count()
    }
}

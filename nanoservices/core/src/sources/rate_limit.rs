//! Request-spacing policies.
//!
//! A policy only ever answers "how long until the next request", given the
//! latest response. Sources pick one (or compose their own) and return it
//! from `Source::request_spacing`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::traits::Response;

pub trait RequestSpacing: Send + Sync {
    fn spacing(&self, response: &Response) -> Duration;
}

/// Sleeps between requests. Swappable so tests can observe pacing.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Constant delay, optionally with a longer delay after a 429.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpacing {
    pub delay: Duration,
    pub throttled_delay: Option<Duration>,
}

impl FixedSpacing {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            throttled_delay: None,
        }
    }

    pub fn on_throttle(mut self, delay: Duration) -> Self {
        self.throttled_delay = Some(delay);
        self
    }
}

impl RequestSpacing for FixedSpacing {
    fn spacing(&self, response: &Response) -> Duration {
        match self.throttled_delay {
            Some(delay) if response.status == 429 => delay,
            _ => self.delay,
        }
    }
}

/// Doubles the base delay for each consecutive throttled response, up to
/// `max_multiplier`; any non-throttled response resets the multiplier.
pub struct ExponentialBackoff {
    base: Duration,
    max_multiplier: u32,
    consecutive: AtomicU32,
    is_throttled: fn(&Response) -> bool,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max_multiplier: u32) -> Self {
        Self {
            base,
            max_multiplier: max_multiplier.max(1),
            consecutive: AtomicU32::new(0),
            is_throttled: |r| r.status == 429,
        }
    }

    /// Override what counts as throttling (some APIs use 403 with a body).
    pub fn throttled_when(mut self, predicate: fn(&Response) -> bool) -> Self {
        self.is_throttled = predicate;
        self
    }

    pub fn multiplier(&self) -> u32 {
        let n = self.consecutive.load(Ordering::SeqCst).min(31);
        (1u32 << n).min(self.max_multiplier)
    }
}

impl RequestSpacing for ExponentialBackoff {
    fn spacing(&self, response: &Response) -> Duration {
        if (self.is_throttled)(response) {
            let prior = self.consecutive.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(status = response.status, consecutive = prior + 1, "throttled, backing off");
        } else {
            self.consecutive.store(0, Ordering::SeqCst);
        }
        self.base * self.multiplier()
    }
}

/// How a reset header expresses the end of the rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetFormat {
    /// Unix epoch seconds, as GitHub sends.
    EpochSeconds,
    /// An RFC 3339 or HTTP (RFC 2822) date, as Jira sends.
    Date,
}

/// Header-driven limits: when the remaining budget drops below `floor`, sleep
/// until the reported reset plus `pad` for clock skew. Without a remaining
/// header, a reset header on its own means the window is exhausted.
/// `Retry-After` (seconds) is honoured when present.
#[derive(Debug, Clone)]
pub struct ResetWindowSpacing {
    pub remaining_header: Option<String>,
    pub reset_header: String,
    pub reset_format: ResetFormat,
    pub retry_after_header: Option<String>,
    /// Remaining counts strictly below this are treated as throttled.
    pub floor: i64,
    pub pad: Duration,
    pub default_delay: Duration,
    /// Used when throttled but no reset time was reported.
    pub missing_reset_delay: Duration,
}

impl ResetWindowSpacing {
    pub fn new(remaining_header: impl Into<String>, reset_header: impl Into<String>) -> Self {
        Self {
            remaining_header: Some(remaining_header.into()),
            reset_header: reset_header.into(),
            reset_format: ResetFormat::EpochSeconds,
            retry_after_header: Some("retry-after".to_string()),
            floor: 1,
            pad: Duration::from_secs(5),
            default_delay: super::traits::DEFAULT_REQUEST_SPACING,
            missing_reset_delay: Duration::from_secs(5 * 60),
        }
    }

    /// GitHub-style `x-ratelimit-remaining` / `x-ratelimit-reset` headers.
    pub fn github() -> Self {
        Self::new("x-ratelimit-remaining", "x-ratelimit-reset")
    }

    /// Jira-style: a dated `x-ratelimit-reset` only appears once throttled,
    /// and `Retry-After` takes precedence over it.
    pub fn jira() -> Self {
        Self {
            remaining_header: None,
            reset_format: ResetFormat::Date,
            ..Self::new("", "x-ratelimit-reset")
        }
    }

    pub fn floor(mut self, floor: i64) -> Self {
        self.floor = floor;
        self
    }

    pub fn pad(mut self, pad: Duration) -> Self {
        self.pad = pad;
        self
    }

    pub fn default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn reset_format(mut self, format: ResetFormat) -> Self {
        self.reset_format = format;
        self
    }

    pub fn spacing_at(&self, response: &Response, now: DateTime<Utc>) -> Duration {
        let remaining = self
            .remaining_header
            .as_deref()
            .and_then(|header| response.numeric_header(header));
        if let Some(remaining) = remaining.filter(|r| *r < self.floor) {
            let Some(until_reset) = self.until_reset(response, now) else {
                tracing::warn!(
                    remaining,
                    "rate limited but no reset time reported; using fallback delay"
                );
                return self.missing_reset_delay;
            };
            let spacing = until_reset + self.pad;
            tracing::warn!(remaining, spacing_ms = spacing.as_millis() as u64, "rate limited until reset");
            return spacing;
        }

        if let Some(header) = &self.retry_after_header {
            if let Some(secs) = response.numeric_header(header).filter(|s| *s > 0) {
                tracing::warn!(retry_after = secs, "server requested retry-after");
                return Duration::from_secs(secs as u64);
            }
        }

        if self.remaining_header.is_none() {
            if let Some(until_reset) = self.until_reset(response, now) {
                let spacing = until_reset + self.pad;
                tracing::warn!(spacing_ms = spacing.as_millis() as u64, "rate limited until reset");
                return spacing;
            }
        }

        self.default_delay
    }

    /// Time left until the reported reset, never negative. `None` when the
    /// header is absent or unreadable.
    fn until_reset(&self, response: &Response, now: DateTime<Utc>) -> Option<Duration> {
        let value = response.header(&self.reset_header)?.first()?.trim();
        let reset_ms = match self.reset_format {
            ResetFormat::EpochSeconds => value.parse::<i64>().ok()?.saturating_mul(1000),
            ResetFormat::Date => DateTime::parse_from_rfc3339(value)
                .or_else(|_| DateTime::parse_from_rfc2822(value))
                .ok()?
                .timestamp_millis(),
        };
        let ms = reset_ms.saturating_sub(now.timestamp_millis()).max(0);
        Some(Duration::from_millis(ms as u64))
    }
}

impl RequestSpacing for ResetWindowSpacing {
    fn spacing(&self, response: &Response) -> Duration {
        self.spacing_at(response, Utc::now())
    }
}

//! Failure classification and rate-limit backoff.
//!
//! Maps HTTP statuses and transport errors onto the [`ProviderError`]
//! taxonomy, and computes how long a rate-limited provider sits out before
//! it is offered another turn. Nothing here sleeps: a rate-limited provider
//! is skipped, never waited on.

use crate::api::provider::ProviderError;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;

/// Exponential backoff used when a backend rate-limits without telling us
/// how long to wait.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first rate limit.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Whether to shave the delay to avoid synchronized retries.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Delay for the `attempt`-th consecutive rate limit (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            // Deterministic jitter keyed on the attempt number.
            let jitter_factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                _ => 0.85,
            };
            Duration::from_secs_f64(capped * jitter_factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Parse `Retry-After` (seconds) or `retry-after-ms`. Values outside
/// `(0, 10min)` are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let limit = Duration::from_secs(600);

    if let Some(val) = headers.get("retry-after-ms")
        && let Ok(s) = val.to_str()
        && let Ok(ms) = s.trim().parse::<f64>()
    {
        let delay = Duration::from_secs_f64(ms.max(0.0) / 1000.0);
        if delay > Duration::ZERO && delay < limit {
            return Some(delay);
        }
    }

    if let Some(val) = headers.get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        let delay = Duration::from_secs(secs);
        if delay > Duration::ZERO && delay < limit {
            return Some(delay);
        }
    }

    None
}

/// Classify an unsuccessful HTTP response.
pub fn classify_status(
    provider: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> ProviderError {
    let snippet: String = body.chars().take(200).collect();
    let detail = format!("{provider} HTTP {status}: {snippet}");
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(detail),
        429 => ProviderError::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        408 | 504 => ProviderError::Timeout(detail),
        _ => ProviderError::Unavailable(detail),
    }
}

/// Pass a successful response through; classify anything else.
pub async fn ensure_success(
    provider: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let headers = resp.headers().clone();
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(provider, status, &headers, &body))
}

/// Classify a transport-level reqwest error.
pub fn classify_transport(provider: &str, err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(format!("{provider}: {err}"))
    } else {
        ProviderError::Unavailable(format!("{provider}: request failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn delay_increases_exponentially() {
        let config = BackoffConfig {
            jitter: false,
            ..BackoffConfig::default()
        };
        let d0 = config.delay_for_attempt(0);
        let d1 = config.delay_for_attempt(1);
        let d2 = config.delay_for_attempt(2);

        assert!(d1 > d0, "d1={d1:?} should be > d0={d0:?}");
        assert!(d2 > d1, "d2={d2:?} should be > d1={d1:?}");
    }

    #[test]
    fn delay_capped_at_max() {
        let config = BackoffConfig {
            jitter: false,
            max_delay: Duration::from_secs(5),
            ..BackoffConfig::default()
        };
        assert!(config.delay_for_attempt(20) <= Duration::from_secs(5));
    }

    #[test]
    fn jitter_reduces_delay() {
        let jittered = BackoffConfig::default();
        let plain = BackoffConfig {
            jitter: false,
            ..BackoffConfig::default()
        };
        assert!(jittered.delay_for_attempt(2) <= plain.delay_for_attempt(2));
    }

    #[test]
    fn retry_after_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert("retry-after", HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        assert_eq!(
            parse_retry_after(&headers),
            Some(Duration::from_millis(1500))
        );

        let mut absurd = HeaderMap::new();
        absurd.insert("retry-after", HeaderValue::from_static("86400"));
        assert_eq!(parse_retry_after(&absurd), None);
    }

    #[test]
    fn statuses_map_onto_taxonomy() {
        let headers = HeaderMap::new();
        let auth = classify_status("openai", StatusCode::UNAUTHORIZED, &headers, "bad key");
        assert!(matches!(auth, ProviderError::Auth(ref m) if m.contains("bad key")));

        assert!(matches!(
            classify_status("openai", StatusCode::FORBIDDEN, &headers, ""),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            classify_status("openai", StatusCode::TOO_MANY_REQUESTS, &headers, ""),
            ProviderError::RateLimited { retry_after: None }
        ));
        assert!(matches!(
            classify_status("openai", StatusCode::GATEWAY_TIMEOUT, &headers, ""),
            ProviderError::Timeout(_)
        ));
        assert!(matches!(
            classify_status("openai", StatusCode::BAD_GATEWAY, &headers, ""),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status("openai", StatusCode::BAD_REQUEST, &headers, ""),
            ProviderError::Unavailable(_)
        ));
    }
}

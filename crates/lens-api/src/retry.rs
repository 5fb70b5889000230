//! Retry classification and backoff for backend requests.

use std::time::Duration;

use chrono::{DateTime, Utc};

const MAX_BACKOFF_SHIFT: usize = 6;

pub fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 425 || status == 429 || status >= 500
}

pub fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

/// Exponential backoff for the given 1-based attempt.
pub fn next_backoff_ms(base_delay_ms: u64, attempt: usize) -> u64 {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    base_delay_ms.saturating_mul(1_u64 << shift)
}

/// Backoff delay, stretched to honor a server-provided `retry-after`.
pub fn retry_delay(base_delay_ms: u64, attempt: usize, retry_after_ms: Option<u64>) -> Duration {
    let backoff_ms = next_backoff_ms(base_delay_ms, attempt);
    let delay_ms = match retry_after_ms {
        Some(retry_after_ms) => backoff_ms.max(retry_after_ms),
        None => backoff_ms,
    };
    Duration::from_millis(delay_ms)
}

pub fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.saturating_mul(1000));
    }

    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delay_ms = retry_at.signed_duration_since(Utc::now()).num_milliseconds();
    if delay_ms <= 0 {
        return Some(0);
    }
    u64::try_from(delay_ms).ok()
}

pub fn truncate_for_error(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let mut truncated = body.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use reqwest::header::{HeaderMap, HeaderValue};

    use super::{
        next_backoff_ms, parse_retry_after_ms, retry_delay, should_retry_status,
        truncate_for_error,
    };

    #[test]
    fn unit_retry_status_selection() {
        for status in [408, 425, 429, 500, 502, 503] {
            assert!(should_retry_status(status), "{status} should retry");
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert!(!should_retry_status(status), "{status} should not retry");
        }
    }

    #[test]
    fn unit_backoff_doubles_per_attempt_and_caps() {
        assert_eq!(next_backoff_ms(100, 1), 100);
        assert_eq!(next_backoff_ms(100, 2), 200);
        assert_eq!(next_backoff_ms(100, 3), 400);
        assert_eq!(next_backoff_ms(100, 50), 6_400);
    }

    #[test]
    fn functional_retry_after_extends_backoff() {
        assert_eq!(retry_delay(100, 1, Some(2_000)), Duration::from_millis(2_000));
        assert_eq!(retry_delay(100, 3, Some(10)), Duration::from_millis(400));
    }

    #[test]
    fn functional_parse_retry_after_supports_seconds_and_http_dates() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("3"));
        assert_eq!(parse_retry_after_ms(&headers), Some(3_000));

        let past = (Utc::now() - chrono::Duration::seconds(30)).to_rfc2822();
        headers.insert("retry-after", HeaderValue::from_str(&past).expect("header"));
        assert_eq!(parse_retry_after_ms(&headers), Some(0));

        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after_ms(&headers), None);
    }

    #[test]
    fn unit_truncate_for_error_respects_char_boundaries() {
        assert_eq!(truncate_for_error("short", 10), "short");
        assert_eq!(truncate_for_error("ééééé", 2), "éé...");
    }
}

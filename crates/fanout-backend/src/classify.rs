//! Failure classification for the retry/fallback controller.
//!
//! All the string heuristics for recognizing rate limits live here so the
//! controller only ever sees a typed [`Classification`].

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::error::CallFailure;

/// What the controller should do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Backend asked us to slow down. Carries the parsed delay hint if the
    /// failure had one; the policy default applies otherwise.
    RateLimited(Option<Duration>),
    /// Network-level problem; retry the same candidate after backoff.
    Transient,
    /// Never retried.
    Fatal,
}

const RATE_LIMIT_WORDING: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "quota",
    "retry after",
    "retry-after",
    "concurrency limit",
];

/// Classify a failed call.
pub fn classify(failure: &CallFailure) -> Classification {
    match failure {
        CallFailure::Status {
            status,
            body,
            retry_after,
        } => match *status {
            429 => Classification::RateLimited(retry_after.or_else(|| parse_retry_hint(body))),
            408 | 500..=599 => {
                if mentions_rate_limit(body) {
                    Classification::RateLimited(retry_after.or_else(|| parse_retry_hint(body)))
                } else {
                    Classification::Transient
                }
            }
            _ => Classification::Fatal,
        },
        CallFailure::Network(message) => {
            if mentions_rate_limit(message) {
                Classification::RateLimited(parse_retry_hint(message))
            } else {
                Classification::Transient
            }
        }
        CallFailure::Timeout(_) | CallFailure::StreamEnded => Classification::Transient,
        CallFailure::Remote(message) => {
            if mentions_rate_limit(message) {
                Classification::RateLimited(parse_retry_hint(message))
            } else {
                Classification::Fatal
            }
        }
        CallFailure::Launch(_) | CallFailure::Protocol(_) => Classification::Fatal,
    }
}

fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_WORDING.iter().any(|w| lower.contains(w)) || status_429_regex().is_match(&lower)
}

/// A bare 429 only counts as a whole number, not inside ids like `#4291`.
fn status_429_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b429\b").expect("status regex is valid"))
}

fn retry_hint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:retry[- _]?after|try again in|retry in|wait)[\s:=]*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)?\b",
        )
        .expect("retry hint regex is valid")
    })
}

/// Parse a delay hint such as "retry after 30s", "Retry-After: 5",
/// "try again in 2.5 seconds", or "retry in 500ms". A bare number is
/// seconds, matching the HTTP `Retry-After` header.
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    let caps = retry_hint_regex().captures(message)?;
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();

    let millis = if unit.starts_with("ms") || unit.starts_with("milli") {
        amount
    } else if unit.starts_with('m') {
        amount * 60_000.0
    } else {
        amount * 1_000.0
    };
    Some(Duration::from_millis(millis.round() as u64))
}

/// Parse an HTTP `Retry-After` header value in delta-seconds form.
pub fn parse_retry_after_header(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

//! Classification of opaque upstream failures
//!
//! The upstream client gives us nothing but an error message, so mapping a
//! failure onto the taxonomy is a best-effort scan of that message against a
//! fixed, ordered table. The first matching row wins; rows are ordered from
//! most to least specific (a "connection timed out" is a timeout, not a
//! network error; "RESOURCE_EXHAUSTED" is quota, even when it also mentions
//! a rate).
//!
//! Errors that are already classified (for instance the admission gate's own
//! rate-limit and quota denials) pass through unchanged.

use crate::error::{ClassifiedError, ErrorKind};
use std::time::Duration;

/// One row of the classification table
#[derive(Debug, Clone, Copy)]
pub struct ClassificationRule {
    pub kind: ErrorKind,
    /// Lowercase needles; purely numeric needles must appear as a whole token
    pub needles: &'static [&'static str],
}

/// Ordered mapping from message fragments to error kinds
pub const CLASSIFICATION_TABLE: &[ClassificationRule] = &[
    ClassificationRule {
        kind: ErrorKind::Quota,
        needles: &[
            "resource_exhausted",
            "resource exhausted",
            "quota",
            "tokens per day",
            "tokens per hour",
        ],
    },
    ClassificationRule {
        kind: ErrorKind::RateLimit,
        needles: &[
            "rate limit",
            "ratelimit",
            "rate_limit",
            "too many requests",
            "429",
        ],
    },
    ClassificationRule {
        kind: ErrorKind::Auth,
        needles: &[
            "unauthenticated",
            "permission_denied",
            "permission denied",
            "unauthorized",
            "forbidden",
            "invalid_grant",
            "invalid credentials",
            "access token",
            "401",
            "403",
        ],
    },
    ClassificationRule {
        kind: ErrorKind::Validation,
        needles: &[
            "invalid_argument",
            "invalid argument",
            "bad request",
            "validation",
            "unknown dimension",
            "unknown metric",
            "400",
            "422",
        ],
    },
    ClassificationRule {
        kind: ErrorKind::Config,
        needles: &[
            "not configured",
            "missing configuration",
            "credentials not found",
            "invalid configuration",
            "failed_precondition",
        ],
    },
    ClassificationRule {
        kind: ErrorKind::Timeout,
        needles: &[
            "deadline_exceeded",
            "deadline exceeded",
            "timed out",
            "timeout",
            "etimedout",
            "408",
            "504",
        ],
    },
    ClassificationRule {
        kind: ErrorKind::Network,
        needles: &[
            "econnreset",
            "econnrefused",
            "enotfound",
            "eai_again",
            "socket hang up",
            "network",
            "connection",
            "dns",
            "unavailable",
            "502",
            "503",
        ],
    },
    ClassificationRule {
        kind: ErrorKind::Cache,
        needles: &["redis", "cache store", "cache backend"],
    },
];

/// Classify any error, passing already-classified errors through.
pub fn classify(err: &(dyn std::error::Error + 'static)) -> ClassifiedError {
    if let Some(classified) = err.downcast_ref::<ClassifiedError>() {
        return classified.clone();
    }
    classify_message(&err.to_string())
}

/// Classify a raw upstream message.
pub fn classify_message(message: &str) -> ClassifiedError {
    let lowered = message.to_lowercase();
    let kind = CLASSIFICATION_TABLE
        .iter()
        .find(|rule| rule.needles.iter().any(|needle| matches_needle(&lowered, needle)))
        .map_or(ErrorKind::Generic, |rule| rule.kind);

    let classified = ClassifiedError::new(kind, message).with_cause(message);
    match parse_retry_after(&lowered) {
        Some(hint) => classified.with_retry_after(hint),
        None => classified,
    }
}

fn matches_needle(haystack: &str, needle: &str) -> bool {
    if !needle.bytes().all(|b| b.is_ascii_digit()) {
        return haystack.contains(needle);
    }
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_alphanumeric())
            && !after.is_some_and(|c| c.is_ascii_alphanumeric())
    })
}

const RETRY_MARKERS: &[&str] = &["retry-after", "retry after", "retry_after", "retry in"];

/// Longest wait hint honored; larger values are clamped
const MAX_RETRY_HINT_SECS: f64 = 86_400.0;

/// Extract a provider wait hint such as `retry after 30s` or `Retry-After: 2 minutes`.
pub fn parse_retry_after(lowered: &str) -> Option<Duration> {
    RETRY_MARKERS.iter().find_map(|marker| {
        let start = lowered.find(marker)? + marker.len();
        let rest = lowered[start..].trim_start_matches([' ', ':', '=', '\t']);

        let digits_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let value: f64 = rest[..digits_end].parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }

        let unit = rest[digits_end..].trim_start();
        let seconds = if unit.starts_with("ms") || unit.starts_with("millisecond") {
            value / 1000.0
        } else if unit.starts_with("min") || unit.starts_with("m ") || unit == "m" {
            value * 60.0
        } else if unit.starts_with('h') {
            value * 3600.0
        } else {
            value
        };
        Some(Duration::from_secs_f64(seconds.min(MAX_RETRY_HINT_SECS)))
    })
}

//! Request key normalization
//!
//! A [`RequestKey`] identifies one logical analytics query. Two callers asking
//! for the same data must end up with the same key regardless of dimension
//! order, dimension casing or incidental whitespace, because the key drives
//! both cache lookups and in-flight deduplication.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Write};

/// Prefix shared by every key this crate produces
pub const KEY_PREFIX: &str = "pulse";

/// Default date range applied when a query does not carry one
pub const DEFAULT_START: &str = "7daysago";
pub const DEFAULT_END: &str = "today";

/// Inclusive date range in the provider's own vocabulary
/// (`2024-01-01`, `30daysAgo`, `today`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

impl DateRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Lowercased, trimmed copy used inside keys and usage aggregates.
    pub fn normalized(&self) -> Self {
        Self {
            start: normalize_segment(&self.start),
            end: normalize_segment(&self.end),
        }
    }
}

impl Default for DateRange {
    fn default() -> Self {
        Self::new(DEFAULT_START, DEFAULT_END)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Caller-supplied query options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub date_range: Option<DateRange>,
    pub dimensions: Vec<String>,
    pub limit: Option<u32>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_date_range(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.date_range = Some(DateRange::new(start, end));
        self
    }

    pub fn with_dimension(mut self, dimension: impl Into<String>) -> Self {
        self.dimensions.push(dimension.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Date range with the default applied and normalized.
    pub fn effective_date_range(&self) -> DateRange {
        self.date_range
            .as_ref()
            .map_or_else(DateRange::default, DateRange::normalized)
    }

    /// Sorted, deduplicated, lowercased dimension set.
    pub fn normalized_dimensions(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .map(|d| normalize_segment(d))
            .filter(|d| !d.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Normalized key for one logical query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    /// Build the key for `data_type` against `target_id`.
    ///
    /// Layout: `pulse:{data_type}:{target}:{start}..{end}:{dims}:{limit}`
    pub fn new(data_type: &str, target_id: &str, options: &QueryOptions) -> Self {
        let range = options.effective_date_range();
        let dimensions = options.normalized_dimensions();

        let mut key = String::with_capacity(96);
        key.push_str(KEY_PREFIX);
        key.push(':');
        key.push_str(&escape(&normalize_segment(data_type)));
        key.push(':');
        key.push_str(&escape(target_id.trim()));
        key.push(':');
        let _ = write!(key, "{}..{}", escape(&range.start), escape(&range.end));
        key.push(':');
        if dimensions.is_empty() {
            key.push('-');
        } else {
            let escaped: Vec<String> = dimensions.iter().map(|d| escape(d)).collect();
            key.push_str(&escaped.join(","));
        }
        key.push(':');
        match options.limit {
            Some(limit) => {
                let _ = write!(key, "{limit}");
            }
            None => key.push('-'),
        }

        Self(key)
    }

    /// Wrap an already-normalized key (e.g. one read back from a scan).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scan pattern matching every key for `target_id`, across data types.
    pub fn target_pattern(target_id: &str) -> String {
        format!("{KEY_PREFIX}:*:{}:*", escape(target_id.trim()))
    }

    /// Scan pattern matching every key of one data type.
    pub fn data_type_pattern(data_type: &str) -> String {
        format!("{KEY_PREFIX}:{}:*", escape(&normalize_segment(data_type)))
    }

    /// Data type segment, if the key has the expected layout.
    pub fn data_type(&self) -> Option<&str> {
        self.0.split(':').nth(1)
    }

    /// Target segment, if the key has the expected layout. Still escaped.
    pub fn target_id(&self) -> Option<&str> {
        self.0.split(':').nth(2)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RequestKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn normalize_segment(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Percent-encode one key segment. Separators (`:`, `,`, `.`), glob
/// metacharacters and `%` itself never appear raw, so distinct inputs keep
/// distinct keys.
fn escape(segment: &str) -> String {
    urlencoding::encode(segment).replace('.', "%2E")
}

/// Redis-style glob match supporting `*` (any run) and `?` (any single char).
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while c < candidate.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = c;
            p += 1;
        } else if let Some(star_pos) = star {
            p = star_pos + 1;
            resume += 1;
            c = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_key_layout() {
        let options = QueryOptions::new()
            .with_date_range("30daysAgo", "today")
            .with_dimension("country")
            .with_limit(50);
        let key = RequestKey::new("sessions", "propX", &options);
        assert_eq!(key.as_str(), "pulse:sessions:propX:30daysago..today:country:50");
        assert_eq!(key.data_type(), Some("sessions"));
        assert_eq!(key.target_id(), Some("propX"));
    }

    #[test]
    fn test_defaults_applied() {
        let key = RequestKey::new("sessions", "propX", &QueryOptions::default());
        assert_eq!(key.as_str(), "pulse:sessions:propX:7daysago..today:-:-");
    }

    #[test]
    fn test_dimension_order_and_case_ignored() {
        let a = QueryOptions::new()
            .with_dimension("Country")
            .with_dimension("deviceCategory");
        let b = QueryOptions::new()
            .with_dimension("devicecategory")
            .with_dimension(" country ")
            .with_dimension("COUNTRY");
        assert_eq!(
            RequestKey::new("Traffic", "p1", &a),
            RequestKey::new("traffic", "p1", &b)
        );
    }

    #[test]
    fn test_target_cannot_break_layout() {
        let key = RequestKey::new("sessions", "a:b*c", &QueryOptions::default());
        assert_eq!(key.target_id(), Some("a%3Ab%2Ac"));
        assert_eq!(key.data_type(), Some("sessions"));
    }

    #[test]
    fn test_distinct_targets_keep_distinct_keys() {
        let options = QueryOptions::default();
        let pairs = [
            ("acct:1", "acct_1"),
            ("a b", "a_b"),
            ("a*", "a?"),
            ("a,b", "a_b"),
            ("a%3Ab", "a:b"),
        ];
        for (left, right) in pairs {
            assert_ne!(
                RequestKey::new("sessions", left, &options),
                RequestKey::new("sessions", right, &options),
                "{left} vs {right}"
            );
        }

        let pattern = RequestKey::target_pattern("acct:1");
        assert!(glob_match(&pattern, RequestKey::new("sessions", "acct:1", &options).as_str()));
        assert!(!glob_match(&pattern, RequestKey::new("sessions", "acct_1", &options).as_str()));
    }

    #[test]
    fn test_date_range_split_is_unambiguous() {
        let a = QueryOptions::new().with_date_range("a..b", "c");
        let b = QueryOptions::new().with_date_range("a", "b..c");
        assert_ne!(RequestKey::new("sessions", "p", &a), RequestKey::new("sessions", "p", &b));
    }

    #[test]
    fn test_dimension_separator_is_unambiguous() {
        let joined = QueryOptions::new().with_dimension("a,b");
        let split = QueryOptions::new().with_dimension("a").with_dimension("b");
        assert_ne!(
            RequestKey::new("sessions", "p", &joined),
            RequestKey::new("sessions", "p", &split)
        );
    }

    #[test]
    fn test_target_pattern_matches_only_that_target() {
        let pattern = RequestKey::target_pattern("propX");
        let hit = RequestKey::new("sessions", "propX", &QueryOptions::default());
        let miss = RequestKey::new("sessions", "propY", &QueryOptions::default());
        assert!(glob_match(&pattern, hit.as_str()));
        assert!(!glob_match(&pattern, miss.as_str()));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("pulse:*", "pulse:sessions:x"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(glob_match("a*b*c", "a123b456c"));
        assert!(!glob_match("a*b*c", "a123b456"));
        assert!(!glob_match("", "a"));
    }

    proptest! {
        #[test]
        fn prop_dimension_permutations_share_key(
            dims in proptest::collection::vec("[a-zA-Z]{1,8}", 0..6),
            limit in proptest::option::of(1u32..10_000),
        ) {
            let mut reversed = dims.clone();
            reversed.reverse();
            let upper: Vec<String> = dims.iter().map(|d| d.to_uppercase()).collect();

            let base = QueryOptions { dimensions: dims, limit, ..QueryOptions::default() };
            let rev = QueryOptions { dimensions: reversed, limit, ..QueryOptions::default() };
            let up = QueryOptions { dimensions: upper, limit, ..QueryOptions::default() };

            let key = RequestKey::new("pages", "t", &base);
            prop_assert_eq!(&key, &RequestKey::new("pages", "t", &rev));
            prop_assert_eq!(&key, &RequestKey::new("pages", "t", &up));
        }
    }
}

//! Core domain model shared by the CIQ storage, adapter and pipeline crates.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ciq-core";

/// Opaque identifier handed back by the orchestrator on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Price,
    Rank,
    Rating,
    ReviewCount,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Rank => "rank",
            Self::Rating => "rating",
            Self::ReviewCount => "review_count",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-side view of a target as returned by a fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetrics {
    pub target_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u32>,
    #[serde(default = "default_available")]
    pub available: bool,
    pub fetched_at: DateTime<Utc>,
    /// Targets the provider lists alongside this one; discovery jobs use them
    /// as competitor candidates.
    #[serde(default)]
    pub related_targets: Vec<String>,
}

fn default_available() -> bool {
    true
}

/// Immutable point-in-time metrics for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub entity_id: String,
    pub captured_at: DateTime<Utc>,
    pub price: Option<f64>,
    pub rank: Option<u32>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub available: bool,
}

impl MetricSnapshot {
    /// Snapshots take their capture time from the fetch, so re-deriving a
    /// snapshot from the same cached payload yields the same identity.
    pub fn from_raw(raw: &RawMetrics) -> Self {
        Self {
            entity_id: raw.target_id.clone(),
            captured_at: raw.fetched_at,
            price: raw.price,
            rank: raw.rank,
            rating: raw.rating,
            review_count: raw.review_count,
            available: raw.available,
        }
    }

    pub fn metric(&self, name: MetricName) -> Option<f64> {
        match name {
            MetricName::Price => self.price,
            MetricName::Rank => self.rank.map(f64::from),
            MetricName::Rating => self.rating,
            MetricName::ReviewCount => self.review_count.map(f64::from),
        }
    }
}

/// Input handed to the analysis provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptContext {
    pub target_id: String,
    pub title: Option<String>,
    pub current: MetricSnapshot,
    pub previous: Option<MetricSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredInsight {
    pub summary: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub opportunities: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    /// Threshold is a fraction of the previous value (0.10 == 10 %).
    Percentage,
    Absolute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub entity_id: String,
    pub metric: MetricName,
    pub kind: ThresholdKind,
    pub threshold: f64,
    pub cooldown_secs: u64,
}

impl AlertRule {
    pub fn rule_id(&self) -> String {
        format!("{}:{}", self.entity_id, self.metric)
    }

    pub fn cooldown(&self) -> ChronoDuration {
        ChronoDuration::seconds(i64::try_from(self.cooldown_secs).unwrap_or(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub rule_id: String,
    pub entity_id: String,
    pub metric: MetricName,
    pub triggered_at: DateTime<Utc>,
    pub old_value: f64,
    pub new_value: f64,
    pub delta: f64,
}

/// Failure reported by an external provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Timeouts, 5xx responses and provider-side throttling.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Malformed target ids and other 4xx-class validation failures.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Deterministic identity of a unit of cacheable work.
///
/// Rendered as `{target}:{provider}:{kind}:{digest}` so that every entry for a
/// target shares the `{target}:` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn builder(provider: &str, target: &str, kind: &str) -> FingerprintBuilder {
        FingerprintBuilder {
            provider: normalize(provider),
            target: normalize(target),
            kind: normalize(kind),
            params: Vec::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix matching every fingerprint built for `target`.
    pub fn target_prefix(target: &str) -> String {
        format!("{}:", normalize(target))
    }

    /// Brings a caller-supplied prefix into the same case as built
    /// fingerprints.
    pub fn normalize_prefix(prefix: &str) -> String {
        normalize(prefix)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    provider: String,
    target: String,
    kind: String,
    params: Vec<(String, String)>,
}

impl FingerprintBuilder {
    pub fn param(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.params.push((normalize(key), normalize(&value.to_string())));
        self
    }

    pub fn build(mut self) -> Fingerprint {
        self.params.sort();
        let mut hasher = Sha256::new();
        hasher.update(self.provider.as_bytes());
        hasher.update([0]);
        hasher.update(self.target.as_bytes());
        hasher.update([0]);
        hasher.update(self.kind.as_bytes());
        for (key, value) in &self.params {
            hasher.update([0]);
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        Fingerprint(format!(
            "{}:{}:{}:{}",
            self.target,
            self.provider,
            self.kind,
            &digest[..16]
        ))
    }
}

fn normalize(input: &str) -> String {
    input.trim().to_ascii_lowercase()
}

/// Source of "now" for every time-based decision.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-advanced clock for simulated-time tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fingerprint_is_normalized_and_order_insensitive() {
        let a = Fingerprint::builder("Metrics", " B00TEST01 ", "raw")
            .param("window", 42)
            .param("version", "v1")
            .build();
        let b = Fingerprint::builder("metrics", "b00test01", "RAW")
            .param("version", "V1")
            .param("window", 42)
            .build();
        assert_eq!(a, b);
        assert!(a.as_str().starts_with(&Fingerprint::target_prefix("B00TEST01")));
    }

    #[test]
    fn normalized_prefix_matches_built_fingerprints() {
        let fp = Fingerprint::builder("metrics", "B001", "raw").build();
        let prefix = Fingerprint::normalize_prefix(" B001:METRICS");
        assert_eq!(prefix, "b001:metrics");
        assert!(fp.as_str().starts_with(&prefix));
    }

    #[test]
    fn fingerprint_changes_with_params() {
        let a = Fingerprint::builder("metrics", "b00test01", "raw")
            .param("window", 1)
            .build();
        let b = Fingerprint::builder("metrics", "b00test01", "raw")
            .param("window", 2)
            .build();
        assert_ne!(a, b);
    }

    #[test]
    fn snapshot_takes_identity_from_fetch() {
        let fetched_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let raw = RawMetrics {
            target_id: "B00TEST01".into(),
            title: None,
            price: Some(19.99),
            rank: Some(1200),
            rating: Some(4.4),
            review_count: Some(312),
            available: true,
            fetched_at,
            related_targets: vec![],
        };
        let snapshot = MetricSnapshot::from_raw(&raw);
        assert_eq!(snapshot.captured_at, fetched_at);
        assert_eq!(snapshot.metric(MetricName::Rank), Some(1200.0));
        assert_eq!(snapshot, MetricSnapshot::from_raw(&raw));
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let clock = ManualClock::new(start);
        clock.advance(ChronoDuration::hours(25));
        assert_eq!(clock.now() - start, ChronoDuration::hours(25));
    }

    #[test]
    fn provider_error_classification() {
        assert!(ProviderError::Transient("503".into()).is_transient());
        assert!(!ProviderError::Permanent("bad asin".into()).is_transient());
    }
}

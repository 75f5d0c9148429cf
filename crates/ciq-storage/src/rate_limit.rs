//! Admission control in front of every external-provider call.
//!
//! Each `(subject, rule class)` pair owns one [`RateLimitBucket`] holding
//! minute/hour/day window counters plus a continuously refilled burst bucket.
//! Buckets are read, advanced and written back through
//! [`SharedStore::compare_and_swap`], so two racing admissions for the same key
//! can never both consume the last slot.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ciq_core::Clock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::{SharedStore, StoreError};

const MAX_CAS_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleClass {
    Default,
    Auth,
    HeavyRead,
    AiAnalysis,
}

impl RuleClass {
    pub const ALL: [RuleClass; 4] = [
        RuleClass::Default,
        RuleClass::Auth,
        RuleClass::HeavyRead,
        RuleClass::AiAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Auth => "auth",
            Self::HeavyRead => "heavy-read",
            Self::AiAnalysis => "ai-analysis",
        }
    }

    /// Unknown names fall back to the default rule set.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "auth" => Self::Auth,
            "heavy-read" | "api-heavy" => Self::HeavyRead,
            "ai-analysis" => Self::AiAnalysis,
            _ => Self::Default,
        }
    }
}

impl fmt::Display for RuleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    /// Zero disables burst gating.
    pub burst_limit: u32,
    pub burst_window: Duration,
}

impl RateLimitRule {
    pub fn for_class(class: RuleClass) -> Self {
        match class {
            RuleClass::Default => Self {
                per_minute: 60,
                per_hour: 1000,
                per_day: 1440,
                burst_limit: 10,
                burst_window: Duration::from_secs(10),
            },
            RuleClass::Auth => Self {
                per_minute: 5,
                per_hour: 30,
                per_day: 100,
                burst_limit: 3,
                burst_window: Duration::from_secs(60),
            },
            RuleClass::HeavyRead => Self {
                per_minute: 20,
                per_hour: 200,
                per_day: 1000,
                burst_limit: 5,
                burst_window: Duration::from_secs(30),
            },
            RuleClass::AiAnalysis => Self {
                per_minute: 10,
                per_hour: 100,
                per_day: 500,
                burst_limit: 2,
                burst_window: Duration::from_secs(60),
            },
        }
    }

    fn refill_per_sec(&self) -> f64 {
        let window = self.burst_window.as_secs_f64();
        if window <= 0.0 {
            f64::INFINITY
        } else {
            f64::from(self.burst_limit) / window
        }
    }
}

/// Enumerated rule configuration, one rule per [`RuleClass`].
#[derive(Debug, Clone)]
pub struct RuleTable {
    default: RateLimitRule,
    auth: RateLimitRule,
    heavy_read: RateLimitRule,
    ai_analysis: RateLimitRule,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self {
            default: RateLimitRule::for_class(RuleClass::Default),
            auth: RateLimitRule::for_class(RuleClass::Auth),
            heavy_read: RateLimitRule::for_class(RuleClass::HeavyRead),
            ai_analysis: RateLimitRule::for_class(RuleClass::AiAnalysis),
        }
    }
}

impl RuleTable {
    pub fn get(&self, class: RuleClass) -> &RateLimitRule {
        match class {
            RuleClass::Default => &self.default,
            RuleClass::Auth => &self.auth,
            RuleClass::HeavyRead => &self.heavy_read,
            RuleClass::AiAnalysis => &self.ai_analysis,
        }
    }

    pub fn with_rule(mut self, class: RuleClass, rule: RateLimitRule) -> Self {
        match class {
            RuleClass::Default => self.default = rule,
            RuleClass::Auth => self.auth = rule,
            RuleClass::HeavyRead => self.heavy_read = rule,
            RuleClass::AiAnalysis => self.ai_analysis = rule,
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Minute,
    Hour,
    Day,
    Burst,
}

impl Tier {
    fn window(&self) -> ChronoDuration {
        match self {
            Self::Minute => ChronoDuration::minutes(1),
            Self::Hour => ChronoDuration::hours(1),
            Self::Day => ChronoDuration::days(1),
            Self::Burst => ChronoDuration::zero(),
        }
    }

    fn limit(&self, rule: &RateLimitRule) -> u32 {
        match self {
            Self::Minute => rule.per_minute,
            Self::Hour => rule.per_hour,
            Self::Day => rule.per_day,
            Self::Burst => rule.burst_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowCounter {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

impl WindowCounter {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// Window starts only ever move forward; a clock reading behind the current
    /// start leaves the window untouched.
    fn roll(&mut self, now: DateTime<Utc>, size: ChronoDuration) {
        if now >= self.window_start && now - self.window_start >= size {
            self.window_start = now;
            self.count = 0;
        }
    }

    fn resets_at(&self, size: ChronoDuration) -> DateTime<Utc> {
        self.window_start + size
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub minute: WindowCounter,
    pub hour: WindowCounter,
    pub day: WindowCounter,
    pub burst_tokens: f64,
    pub burst_refilled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed {
        /// Smallest remaining allowance across the window tiers.
        remaining: u32,
    },
    Denied {
        retry_after: Duration,
        tier: Tier,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

impl RateLimitBucket {
    pub fn new(now: DateTime<Utc>, rule: &RateLimitRule) -> Self {
        Self {
            minute: WindowCounter::new(now),
            hour: WindowCounter::new(now),
            day: WindowCounter::new(now),
            burst_tokens: f64::from(rule.burst_limit),
            burst_refilled_at: now,
        }
    }

    fn counter(&self, tier: Tier) -> Option<&WindowCounter> {
        match tier {
            Tier::Minute => Some(&self.minute),
            Tier::Hour => Some(&self.hour),
            Tier::Day => Some(&self.day),
            Tier::Burst => None,
        }
    }

    /// Resets elapsed windows and refills burst tokens up to `now`.
    pub fn advance(&mut self, now: DateTime<Utc>, rule: &RateLimitRule) {
        self.minute.roll(now, Tier::Minute.window());
        self.hour.roll(now, Tier::Hour.window());
        self.day.roll(now, Tier::Day.window());

        if now > self.burst_refilled_at {
            let elapsed = (now - self.burst_refilled_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
            let cap = f64::from(rule.burst_limit);
            self.burst_tokens = (self.burst_tokens + elapsed * rule.refill_per_sec()).min(cap);
            self.burst_refilled_at = now;
        }
    }

    /// Evaluates every tier against the same bucket state and consumes one slot
    /// from each only when all of them permit the call.
    pub fn try_admit(&mut self, now: DateTime<Utc>, rule: &RateLimitRule) -> Decision {
        self.advance(now, rule);

        let mut blocking: Option<(Tier, ChronoDuration)> = None;
        let mut block = |tier: Tier, wait: ChronoDuration| {
            if blocking.map_or(true, |(_, longest)| wait > longest) {
                blocking = Some((tier, wait));
            }
        };

        for tier in [Tier::Minute, Tier::Hour, Tier::Day] {
            if let Some(counter) = self.counter(tier) {
                if counter.count >= tier.limit(rule) {
                    block(tier, counter.resets_at(tier.window()) - now);
                }
            }
        }

        if rule.burst_limit > 0 && self.burst_tokens < 1.0 {
            let missing = 1.0 - self.burst_tokens;
            let secs = missing / rule.refill_per_sec();
            let wait = Duration::try_from_secs_f64(secs.max(0.0))
                .ok()
                .and_then(|wait| ChronoDuration::from_std(wait).ok())
                .unwrap_or(ChronoDuration::MAX);
            block(Tier::Burst, wait);
        }

        if let Some((tier, wait)) = blocking {
            let retry_after = wait
                .to_std()
                .unwrap_or_default()
                .max(Duration::from_millis(1));
            return Decision::Denied { retry_after, tier };
        }

        self.minute.count += 1;
        self.hour.count += 1;
        self.day.count += 1;
        if rule.burst_limit > 0 {
            self.burst_tokens -= 1.0;
        }

        let remaining = [Tier::Minute, Tier::Hour, Tier::Day]
            .into_iter()
            .filter_map(|tier| {
                self.counter(tier)
                    .map(|c| tier.limit(rule).saturating_sub(c.count))
            })
            .min()
            .unwrap_or(0);
        Decision::Allowed { remaining }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub subject: String,
    pub rule_class: RuleClass,
    pub tiers: Vec<TierStatus>,
    pub burst_tokens: f64,
    pub burst_limit: u32,
}

impl RateLimitStatus {
    /// Moment every exhausted tier has reset, if any tier is exhausted.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.tiers
            .iter()
            .filter(|t| t.remaining == 0)
            .map(|t| t.reset_at)
            .max()
    }
}

pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    rules: RuleTable,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, rules: RuleTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            rules,
            clock,
        }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    fn bucket_key(subject: &str, class: RuleClass) -> String {
        format!("ratelimit:{class}:{subject}")
    }

    /// Buckets outlive their longest window by a day, then the store evicts them.
    fn bucket_ttl() -> Duration {
        Duration::from_secs(2 * 24 * 60 * 60)
    }

    /// Decodes a stored bucket. An undecodable one is replaced by a fresh bucket.
    fn decode_or_fresh(
        key: &str,
        bytes: Option<&[u8]>,
        now: DateTime<Utc>,
        rule: &RateLimitRule,
    ) -> RateLimitBucket {
        let Some(bytes) = bytes else {
            return RateLimitBucket::new(now, rule);
        };
        serde_json::from_slice(bytes).unwrap_or_else(|err| {
            warn!(%key, error = %err, "discarding undecodable rate-limit bucket");
            RateLimitBucket::new(now, rule)
        })
    }

    pub async fn admit(&self, subject: &str, class: RuleClass) -> Result<Decision, StoreError> {
        let key = Self::bucket_key(subject, class);
        let rule = self.rules.get(class);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(&key).await?;
            let now = self.clock.now();
            let mut bucket = Self::decode_or_fresh(&key, current.as_deref(), now, rule);

            let decision = bucket.try_admit(now, rule);
            let encoded =
                serde_json::to_vec(&bucket).map_err(|err| StoreError::Codec(err.to_string()))?;

            if self
                .store
                .compare_and_swap(&key, current.as_deref(), encoded, Some(Self::bucket_ttl()))
                .await?
            {
                match decision {
                    Decision::Allowed { remaining } => {
                        debug!(subject, rule = %class, remaining, "rate limit admitted")
                    }
                    Decision::Denied { retry_after, tier } => warn!(
                        subject,
                        rule = %class,
                        ?tier,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "rate limit exceeded"
                    ),
                }
                return Ok(decision);
            }
        }

        Err(StoreError::Contention {
            key,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Read-only view of a bucket as it would look right now.
    pub async fn status(&self, subject: &str, class: RuleClass) -> Result<RateLimitStatus, StoreError> {
        let key = Self::bucket_key(subject, class);
        let rule = self.rules.get(class);
        let now = self.clock.now();
        let stored = self.store.get(&key).await?;
        let mut bucket = Self::decode_or_fresh(&key, stored.as_deref(), now, rule);
        bucket.advance(now, rule);

        let tiers = [Tier::Minute, Tier::Hour, Tier::Day]
            .into_iter()
            .filter_map(|tier| {
                bucket.counter(tier).map(|counter| {
                    let limit = tier.limit(rule);
                    TierStatus {
                        tier,
                        limit,
                        used: counter.count,
                        remaining: limit.saturating_sub(counter.count),
                        reset_at: counter.resets_at(tier.window()),
                    }
                })
            })
            .collect();

        Ok(RateLimitStatus {
            subject: subject.to_string(),
            rule_class: class,
            tiers,
            burst_tokens: bucket.burst_tokens,
            burst_limit: rule.burst_limit,
        })
    }

    pub async fn reset(&self, subject: &str, class: RuleClass) -> Result<bool, StoreError> {
        let removed = self.store.delete(&Self::bucket_key(subject, class)).await?;
        tracing::info!(subject, rule = %class, removed, "rate limits reset");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use ciq_core::ManualClock;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn limiter_with(rule: RateLimitRule) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let rules = RuleTable::default().with_rule(RuleClass::Default, rule);
        (clock.clone(), RateLimiter::new(store, rules, clock))
    }

    fn small_rule() -> RateLimitRule {
        RateLimitRule {
            per_minute: 5,
            per_hour: 1000,
            per_day: 10_000,
            burst_limit: 3,
            burst_window: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn six_rapid_calls_admit_five_then_deny() {
        let (clock, limiter) = limiter_with(small_rule());
        let mut decisions = Vec::new();
        for _ in 0..6 {
            decisions.push(limiter.admit("user:1", RuleClass::Default).await.unwrap());
            clock.advance(ChronoDuration::milliseconds(190));
        }

        assert!(decisions[..5].iter().all(Decision::is_allowed), "{decisions:?}");
        match decisions[5] {
            Decision::Denied { retry_after, .. } => assert!(retry_after > Duration::ZERO),
            other => panic!("expected denial, got {other:?}"),
        }

        let status = limiter.status("user:1", RuleClass::Default).await.unwrap();
        assert_eq!(status.tiers[0].used, 5);
        assert_eq!(status.tiers[0].remaining, 0);
        assert!(status.reset_at().is_some());
    }

    #[tokio::test]
    async fn reset_at_waits_for_the_latest_exhausted_tier() {
        let rule = RateLimitRule {
            per_minute: 2,
            per_hour: 2,
            per_day: 100,
            burst_limit: 0,
            burst_window: Duration::from_secs(1),
        };
        let (_clock, limiter) = limiter_with(rule);
        for _ in 0..2 {
            assert!(limiter.admit("user:1", RuleClass::Default).await.unwrap().is_allowed());
        }

        let status = limiter.status("user:1", RuleClass::Default).await.unwrap();
        let minute = status.tiers.iter().find(|t| t.tier == Tier::Minute).unwrap();
        let hour = status.tiers.iter().find(|t| t.tier == Tier::Hour).unwrap();
        assert_eq!((minute.remaining, hour.remaining), (0, 0));
        assert!(hour.reset_at > minute.reset_at);
        assert_eq!(status.reset_at(), Some(hour.reset_at));
    }

    #[tokio::test]
    async fn undecodable_bucket_reads_as_fresh() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let rules = RuleTable::default().with_rule(RuleClass::Default, small_rule());
        let limiter = RateLimiter::new(store.clone(), rules, clock);
        let key = RateLimiter::bucket_key("user:1", RuleClass::Default);
        store.set(&key, b"not json".to_vec(), None).await.unwrap();

        let status = limiter.status("user:1", RuleClass::Default).await.unwrap();
        assert!(status.tiers.iter().all(|t| t.used == 0 && t.remaining == t.limit));
        assert_eq!(status.reset_at(), None);

        assert!(limiter.admit("user:1", RuleClass::Default).await.unwrap().is_allowed());
        let status = limiter.status("user:1", RuleClass::Default).await.unwrap();
        assert_eq!(status.tiers[0].used, 1);
    }

    #[tokio::test]
    async fn burst_bucket_denies_back_to_back_calls() {
        let (_clock, limiter) = limiter_with(small_rule());
        for _ in 0..3 {
            assert!(limiter.admit("user:1", RuleClass::Default).await.unwrap().is_allowed());
        }
        match limiter.admit("user:1", RuleClass::Default).await.unwrap() {
            Decision::Denied { tier, retry_after } => {
                assert_eq!(tier, Tier::Burst);
                assert!(retry_after <= Duration::from_millis(334));
            }
            other => panic!("expected burst denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn minute_window_resets() {
        let (clock, limiter) = limiter_with(small_rule());
        for _ in 0..5 {
            assert!(limiter.admit("user:1", RuleClass::Default).await.unwrap().is_allowed());
            clock.advance(ChronoDuration::seconds(1));
        }
        assert!(!limiter.admit("user:1", RuleClass::Default).await.unwrap().is_allowed());

        clock.advance(ChronoDuration::seconds(60));
        assert!(limiter.admit("user:1", RuleClass::Default).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn subjects_and_classes_are_isolated() {
        let (_clock, limiter) = limiter_with(small_rule());
        for _ in 0..3 {
            limiter.admit("user:1", RuleClass::Default).await.unwrap();
        }
        assert!(limiter.admit("user:2", RuleClass::Default).await.unwrap().is_allowed());
        assert!(limiter.admit("user:1", RuleClass::Auth).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn reset_clears_bucket() {
        let (_clock, limiter) = limiter_with(small_rule());
        for _ in 0..3 {
            limiter.admit("user:1", RuleClass::Default).await.unwrap();
        }
        assert!(limiter.reset("user:1", RuleClass::Default).await.unwrap());
        assert!(limiter.admit("user:1", RuleClass::Default).await.unwrap().is_allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_admissions_never_share_the_last_slot() {
        let rule = RateLimitRule {
            per_minute: 1,
            per_hour: 100,
            per_day: 100,
            burst_limit: 0,
            burst_window: Duration::from_secs(1),
        };
        let (_clock, limiter) = limiter_with(rule);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.admit("user:1", RuleClass::Default).await })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
    }

    #[test]
    fn class_names_parse_with_default_fallback() {
        assert_eq!(RuleClass::parse("ai_analysis"), RuleClass::AiAnalysis);
        assert_eq!(RuleClass::parse("api_heavy"), RuleClass::HeavyRead);
        assert_eq!(RuleClass::parse("nope"), RuleClass::Default);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Admitted calls sharing a window start never exceed that tier's ceiling.
        #[test]
        fn admitted_calls_stay_under_every_ceiling(
            gaps_ms in proptest::collection::vec(0u64..20_000, 1..200),
            per_minute in 1u32..8,
            per_hour in 1u32..40,
            burst in 0u32..4,
        ) {
            let rule = RateLimitRule {
                per_minute,
                per_hour,
                per_day: per_hour * 3,
                burst_limit: burst,
                burst_window: Duration::from_secs(5),
            };
            let (clock, limiter) = limiter_with(rule);
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();

            let mut per_window: std::collections::HashMap<(Tier, DateTime<Utc>), u32> =
                std::collections::HashMap::new();
            runtime.block_on(async {
                for gap in gaps_ms {
                    clock.advance(ChronoDuration::milliseconds(gap as i64));
                    let decision = limiter.admit("subject", RuleClass::Default).await.unwrap();
                    if decision.is_allowed() {
                        let status = limiter.status("subject", RuleClass::Default).await.unwrap();
                        for tier in status.tiers {
                            let start = tier.reset_at;
                            *per_window.entry((tier.tier, start)).or_default() += 1;
                        }
                    }
                }
            });

            for ((tier, _), admitted) in per_window {
                prop_assert!(admitted <= tier.limit(&rule), "{tier:?} admitted {admitted}");
            }
        }
    }
}

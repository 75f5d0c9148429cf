//! Threshold-based change detection between consecutive snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use ciq_core::{AlertEvent, AlertRule, Clock, MetricName, MetricSnapshot, ThresholdKind};
use tracing::{debug, info};

/// Fallback rules applied to entities that have no explicit rules.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultRules {
    pub price_change: f64,
    pub rank_change: f64,
    pub cooldown_secs: u64,
}

impl Default for DefaultRules {
    fn default() -> Self {
        Self {
            price_change: 0.10,
            rank_change: 0.30,
            cooldown_secs: 24 * 60 * 60,
        }
    }
}

impl DefaultRules {
    fn for_entity(&self, entity_id: &str) -> Vec<AlertRule> {
        vec![
            AlertRule {
                entity_id: entity_id.to_string(),
                metric: MetricName::Price,
                kind: ThresholdKind::Percentage,
                threshold: self.price_change,
                cooldown_secs: self.cooldown_secs,
            },
            AlertRule {
                entity_id: entity_id.to_string(),
                metric: MetricName::Rank,
                kind: ThresholdKind::Percentage,
                threshold: self.rank_change,
                cooldown_secs: self.cooldown_secs,
            },
        ]
    }
}

pub struct ChangeDetector {
    defaults: DefaultRules,
    rules: HashMap<String, Vec<AlertRule>>,
    /// Last emission per rule id.
    anchors: Mutex<HashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("defaults", &self.defaults)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl ChangeDetector {
    pub fn new(defaults: DefaultRules, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            rules: HashMap::new(),
            anchors: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Explicit rules replace the defaults for their entity.
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = AlertRule>) -> Self {
        for rule in rules {
            self.rules.entry(rule.entity_id.clone()).or_default().push(rule);
        }
        self
    }

    pub fn rules_for(&self, entity_id: &str) -> Vec<AlertRule> {
        self.rules
            .get(entity_id)
            .cloned()
            .unwrap_or_else(|| self.defaults.for_entity(entity_id))
    }

    /// Compares `current` against `previous` under every rule for the entity
    /// and returns the candidate events. Returns nothing on a first
    /// observation. Cooldowns only start once an event is [`commit`]ted.
    ///
    /// [`commit`]: ChangeDetector::commit
    pub fn evaluate(
        &self,
        entity_id: &str,
        previous: Option<&MetricSnapshot>,
        current: &MetricSnapshot,
    ) -> Vec<AlertEvent> {
        let Some(previous) = previous else {
            debug!(entity_id, "first observation; nothing to compare");
            return Vec::new();
        };

        let now = self.clock.now();
        let anchors = self.anchors.lock().unwrap_or_else(PoisonError::into_inner);
        let mut events = Vec::new();
        for rule in self.rules_for(entity_id) {
            let (Some(old_value), Some(new_value)) =
                (previous.metric(rule.metric), current.metric(rule.metric))
            else {
                continue;
            };
            let Some(delta) = compute_delta(rule.kind, old_value, new_value) else {
                continue;
            };
            if delta.abs() < rule.threshold {
                continue;
            }

            let rule_id = rule.rule_id();
            if let Some(anchor) = anchors.get(&rule_id) {
                if now - *anchor < rule.cooldown() {
                    debug!(%rule_id, delta, "alert suppressed by cooldown");
                    continue;
                }
            }
            info!(%rule_id, old_value, new_value, delta, "alert triggered");
            events.push(AlertEvent {
                rule_id,
                entity_id: entity_id.to_string(),
                metric: rule.metric,
                triggered_at: now,
                old_value,
                new_value,
                delta,
            });
        }
        events
    }

    /// Starts the cooldown of the event's rule. Call once the event is stored.
    pub fn commit(&self, event: &AlertEvent) {
        let mut anchors = self.anchors.lock().unwrap_or_else(PoisonError::into_inner);
        let anchor = anchors.entry(event.rule_id.clone()).or_insert(event.triggered_at);
        if event.triggered_at > *anchor {
            *anchor = event.triggered_at;
        }
    }
}

fn compute_delta(kind: ThresholdKind, old_value: f64, new_value: f64) -> Option<f64> {
    match kind {
        ThresholdKind::Percentage if old_value == 0.0 => None,
        ThresholdKind::Percentage => Some((new_value - old_value) / old_value),
        ThresholdKind::Absolute => Some(new_value - old_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ciq_core::ManualClock;

    fn snapshot(price: Option<f64>, rank: Option<u32>) -> MetricSnapshot {
        MetricSnapshot {
            entity_id: "B001".into(),
            captured_at: Utc::now(),
            price,
            rank,
            rating: None,
            review_count: None,
            available: true,
        }
    }

    fn detector() -> (Arc<ManualClock>, ChangeDetector) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
        ));
        let detector = ChangeDetector::new(DefaultRules::default(), clock.clone()).with_rules([
            AlertRule {
                entity_id: "B001".into(),
                metric: MetricName::Price,
                kind: ThresholdKind::Percentage,
                threshold: 0.10,
                cooldown_secs: 24 * 60 * 60,
            },
        ]);
        (clock, detector)
    }

    #[test]
    fn price_drop_respects_cooldown() {
        let (clock, detector) = detector();
        let previous = snapshot(Some(100.0), None);
        let current = snapshot(Some(89.0), None);

        let events = detector.evaluate("B001", Some(&previous), &current);
        assert_eq!(events.len(), 1);
        assert!((events[0].delta + 0.11).abs() < 1e-9);
        assert_eq!(events[0].old_value, 100.0);
        assert_eq!(events[0].new_value, 89.0);
        detector.commit(&events[0]);

        clock.advance(Duration::hours(1));
        assert!(detector.evaluate("B001", Some(&previous), &current).is_empty());

        clock.advance(Duration::hours(24));
        assert_eq!(detector.evaluate("B001", Some(&previous), &current).len(), 1);
    }

    #[test]
    fn uncommitted_events_do_not_start_a_cooldown() {
        let (clock, detector) = detector();
        let previous = snapshot(Some(100.0), None);
        let current = snapshot(Some(89.0), None);

        // Storing the first event failed, so it is never committed.
        assert_eq!(detector.evaluate("B001", Some(&previous), &current).len(), 1);

        clock.advance(Duration::hours(1));
        let retried = detector.evaluate("B001", Some(&previous), &current);
        assert_eq!(retried.len(), 1);
        detector.commit(&retried[0]);

        clock.advance(Duration::hours(1));
        assert!(detector.evaluate("B001", Some(&previous), &current).is_empty());
    }

    #[test]
    fn first_observation_never_alerts() {
        let (_clock, detector) = detector();
        assert!(detector
            .evaluate("B001", None, &snapshot(Some(1.0), Some(1)))
            .is_empty());
    }

    #[test]
    fn default_rules_cover_rank_in_both_directions() {
        let (_clock, detector) = detector();
        let improved = detector.evaluate(
            "B002",
            Some(&snapshot(None, Some(1000))),
            &snapshot(None, Some(650)),
        );
        assert_eq!(improved.len(), 1);
        assert_eq!(improved[0].metric, MetricName::Rank);

        let degraded = detector.evaluate(
            "B003",
            Some(&snapshot(None, Some(1000))),
            &snapshot(None, Some(1300)),
        );
        assert_eq!(degraded.len(), 1);
    }

    #[test]
    fn small_moves_zero_baselines_and_gaps_are_ignored() {
        let (_clock, detector) = detector();
        assert!(detector
            .evaluate("B001", Some(&snapshot(Some(100.0), None)), &snapshot(Some(95.0), None))
            .is_empty());
        assert!(detector
            .evaluate("B001", Some(&snapshot(Some(0.0), None)), &snapshot(Some(5.0), None))
            .is_empty());
        assert!(detector
            .evaluate("B001", Some(&snapshot(None, None)), &snapshot(Some(5.0), None))
            .is_empty());
    }

    #[test]
    fn absolute_rules_use_raw_difference() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let detector = ChangeDetector::new(DefaultRules::default(), clock).with_rules([AlertRule {
            entity_id: "B001".into(),
            metric: MetricName::Price,
            kind: ThresholdKind::Absolute,
            threshold: 2.0,
            cooldown_secs: 0,
        }]);
        let events = detector.evaluate(
            "B001",
            Some(&snapshot(Some(10.0), None)),
            &snapshot(Some(12.5), None),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].delta, 2.5);
    }
}

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use ciq_core::{AlertRule, MetricName, ThresholdKind};
use ciq_storage::{RateLimitRule, RuleClass, RuleTable};
use serde::{Deserialize, Serialize};

use crate::change::DefaultRules;
use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// In-memory persistence when unset.
    pub database_url: Option<String>,
    pub workers: usize,
    pub job_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    pub retry_jitter: f64,
    pub alert_cooldown_secs: u64,
    pub scheduler_enabled: bool,
    pub subject: String,
    pub workspace_root: PathBuf,
    pub fetch_api_url: Option<String>,
    pub fetch_api_key: Option<String>,
    pub analyze_api_url: String,
    pub analyze_api_key: Option<String>,
    pub analyze_model: String,
    pub http_timeout_secs: u64,
    pub fixtures: Option<PathBuf>,
    pub rate_limit_per_minute: Option<u32>,
    pub rate_limit_per_hour: Option<u32>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse_var<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }
        let parsed_lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: non_empty("DATABASE_URL"),
            workers: parse_var(parsed_lookup, "CIQ_WORKERS").unwrap_or(8),
            job_timeout_secs: parse_var(parsed_lookup, "CIQ_JOB_TIMEOUT_SECS").unwrap_or(30 * 60),
            retry_max_attempts: parse_var(parsed_lookup, "CIQ_RETRY_MAX_ATTEMPTS").unwrap_or(3),
            retry_base_secs: parse_var(parsed_lookup, "CIQ_RETRY_BASE_SECS").unwrap_or(60),
            retry_max_secs: parse_var(parsed_lookup, "CIQ_RETRY_MAX_SECS").unwrap_or(900),
            retry_jitter: parse_var(parsed_lookup, "CIQ_RETRY_JITTER").unwrap_or(0.2),
            alert_cooldown_secs: parse_var(parsed_lookup, "CIQ_ALERT_COOLDOWN_SECS").unwrap_or(24 * 60 * 60),
            scheduler_enabled: lookup("CIQ_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            subject: non_empty("CIQ_SUBJECT").unwrap_or_else(|| "scheduler".to_string()),
            workspace_root: lookup("CIQ_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            fetch_api_url: non_empty("CIQ_FETCH_API_URL"),
            fetch_api_key: non_empty("CIQ_FETCH_API_KEY"),
            analyze_api_url: non_empty("CIQ_ANALYZE_API_URL")
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            analyze_api_key: non_empty("CIQ_ANALYZE_API_KEY"),
            analyze_model: non_empty("CIQ_ANALYZE_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            http_timeout_secs: parse_var(parsed_lookup, "CIQ_HTTP_TIMEOUT_SECS").unwrap_or(30),
            fixtures: non_empty("CIQ_FIXTURES").map(PathBuf::from),
            rate_limit_per_minute: parse_var(parsed_lookup, "RATE_LIMIT_PER_MINUTE"),
            rate_limit_per_hour: parse_var(parsed_lookup, "RATE_LIMIT_PER_HOUR"),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay: Duration::from_secs(self.retry_base_secs),
            max_delay: Duration::from_secs(self.retry_max_secs.max(self.retry_base_secs)),
            jitter: self.retry_jitter,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            workers: self.workers.max(1),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            retry: self.retry_policy(),
            ..OrchestratorConfig::default()
        }
    }

    /// Built-in rule table with the env overrides applied to the default class.
    pub fn rule_table(&self) -> RuleTable {
        let mut default_rule = RateLimitRule::for_class(RuleClass::Default);
        if let Some(per_minute) = self.rate_limit_per_minute {
            default_rule.per_minute = per_minute;
        }
        if let Some(per_hour) = self.rate_limit_per_hour {
            default_rule.per_hour = per_hour;
        }
        RuleTable::default().with_rule(RuleClass::Default, default_rule)
    }

    pub fn default_alert_rules(&self) -> DefaultRules {
        DefaultRules {
            cooldown_secs: self.alert_cooldown_secs,
            ..DefaultRules::default()
        }
    }

    pub fn targets_path(&self) -> PathBuf {
        self.workspace_root.join("targets.yaml")
    }

    pub fn schedules_path(&self) -> PathBuf {
        self.workspace_root.join("rules").join("schedules.yaml")
    }

    pub fn alerts_path(&self) -> PathBuf {
        self.workspace_root.join("rules").join("alerts.yaml")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AlertRulesFile {
    #[serde(default)]
    rules: Vec<AlertRuleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AlertRuleEntry {
    entity_id: String,
    metric: MetricName,
    kind: ThresholdKind,
    threshold: f64,
    #[serde(default)]
    cooldown_secs: Option<u64>,
}

/// Reads explicit alert rules; a missing file means "defaults only".
pub fn load_alert_rules(path: impl AsRef<Path>, default_cooldown_secs: u64) -> Result<Vec<AlertRule>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: AlertRulesFile =
        serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file
        .rules
        .into_iter()
        .map(|entry| AlertRule {
            entity_id: entry.entity_id,
            metric: entry.metric,
            kind: entry.kind,
            threshold: entry.threshold,
            cooldown_secs: entry.cooldown_secs.unwrap_or(default_cooldown_secs),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn config_from(pairs: &[(&str, &str)]) -> PipelineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let config = config_from(&[]);
        assert_eq!(config.workers, 8);
        assert_eq!(config.job_timeout_secs, 1800);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(!config.scheduler_enabled);
        assert_eq!(config.subject, "scheduler");
        assert!(config.database_url.is_none());
        assert_eq!(config.alerts_path(), PathBuf::from("./rules/alerts.yaml"));
    }

    #[test]
    fn env_overrides_apply() {
        let config = config_from(&[
            ("CIQ_WORKERS", "2"),
            ("CIQ_SCHEDULER_ENABLED", "true"),
            ("RATE_LIMIT_PER_MINUTE", "30"),
            ("CIQ_RETRY_BASE_SECS", "not-a-number"),
            ("DATABASE_URL", " "),
        ]);
        assert_eq!(config.workers, 2);
        assert!(config.scheduler_enabled);
        assert_eq!(config.retry_base_secs, 60);
        assert!(config.database_url.is_none());
        let rules = config.rule_table();
        assert_eq!(rules.get(RuleClass::Default).per_minute, 30);
        assert_eq!(rules.get(RuleClass::Default).per_hour, 1000);
        assert_eq!(rules.get(RuleClass::Auth).per_minute, 5);
    }

    #[test]
    fn alert_rules_take_default_cooldown() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "rules:\n  - entity_id: B001\n    metric: price\n    kind: absolute\n    threshold: 2.5\n  - entity_id: B001\n    metric: rank\n    kind: percentage\n    threshold: 0.5\n    cooldown_secs: 60"
        )
        .expect("write");
        let rules = load_alert_rules(file.path(), 86_400).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].cooldown_secs, 86_400);
        assert_eq!(rules[0].kind, ThresholdKind::Absolute);
        assert_eq!(rules[1].cooldown_secs, 60);

        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_alert_rules(dir.path().join("alerts.yaml"), 1).unwrap().is_empty());
    }
}

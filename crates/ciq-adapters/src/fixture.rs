//! File-backed providers for offline runs and demos.
//!
//! A fixture file maps target ids to canned metrics or a scripted failure:
//!
//! ```yaml
//! targets:
//!   B00TEST01:
//!     title: Desk Lamp
//!     price: 24.99
//!     rank: 1532
//!     related_targets: [B00COMP01, B00COMP02]
//!   B00GONE01:
//!     failure: { kind: permanent, message: listing removed }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ciq_core::{Clock, PromptContext, ProviderError, RawMetrics, StructuredInsight, SystemClock};
use serde::{Deserialize, Serialize};

use crate::{InsightProvider, MetricsProvider};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub targets: BTreeMap<String, FixtureTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureTarget {
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
    #[serde(default)]
    pub available: Option<bool>,
    #[serde(default)]
    pub related_targets: Vec<String>,
    #[serde(default)]
    pub failure: Option<FixtureFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixtureFailure {
    Transient { message: String },
    Permanent { message: String },
}

/// Reads a fixture file; `.json` files are parsed as JSON, anything else as YAML.
pub fn load_fixture_file(path: impl AsRef<Path>) -> Result<FixtureFile> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }
}

pub struct FixtureProvider {
    fixtures: FixtureFile,
    clock: Arc<dyn Clock>,
}

impl FixtureProvider {
    pub fn new(fixtures: FixtureFile) -> Self {
        Self {
            fixtures,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_file(path)?))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn target_ids(&self) -> impl Iterator<Item = &str> {
        self.fixtures.targets.keys().map(String::as_str)
    }
}

#[async_trait]
impl MetricsProvider for FixtureProvider {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(&self, target_id: &str) -> Result<RawMetrics, ProviderError> {
        let Some(target) = self.fixtures.targets.get(target_id) else {
            return Err(ProviderError::Permanent(format!(
                "no fixture for target {target_id}"
            )));
        };
        match &target.failure {
            Some(FixtureFailure::Transient { message }) => {
                return Err(ProviderError::Transient(message.clone()))
            }
            Some(FixtureFailure::Permanent { message }) => {
                return Err(ProviderError::Permanent(message.clone()))
            }
            None => {}
        }
        Ok(RawMetrics {
            target_id: target_id.to_string(),
            title: target.title.clone(),
            price: target.price,
            rank: target.rank,
            rating: target.rating,
            review_count: target.review_count,
            available: target.available.unwrap_or(true),
            fetched_at: self.clock.now(),
            related_targets: target.related_targets.clone(),
        })
    }
}

#[async_trait]
impl InsightProvider for FixtureProvider {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn analyze(&self, context: &PromptContext) -> Result<StructuredInsight, ProviderError> {
        let mut recommendations = Vec::new();
        let mut summary = format!(
            "{} is {}",
            context.title.as_deref().unwrap_or(&context.target_id),
            if context.current.available { "in stock" } else { "unavailable" }
        );
        if let (Some(now), Some(before)) = (
            context.current.price,
            context.previous.as_ref().and_then(|p| p.price),
        ) {
            summary.push_str(&format!(", price moved from {before:.2} to {now:.2}"));
            if now > before {
                recommendations.push("Consider whether the price increase hurts rank".to_string());
            }
        }
        summary.push('.');
        Ok(StructuredInsight {
            summary,
            recommendations,
            opportunities: Vec::new(),
            generated_at: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const YAML: &str = r#"
targets:
  B00TEST01:
    title: Desk Lamp
    price: 24.99
    rank: 1532
    related_targets: [B00COMP01, B00COMP02]
  B00GONE01:
    failure: { kind: permanent, message: listing removed }
  B00FLAKY1:
    failure: { kind: transient, message: upstream 503 }
"#;

    fn write_fixture(suffix: &str, body: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("tempfile");
        file.write_all(body.as_bytes()).expect("write fixture");
        file
    }

    #[tokio::test]
    async fn yaml_fixtures_serve_metrics_and_failures() {
        let file = write_fixture(".yaml", YAML);
        let provider = FixtureProvider::from_path(file.path()).unwrap();

        let metrics = provider.fetch("B00TEST01").await.unwrap();
        assert_eq!(metrics.price, Some(24.99));
        assert!(metrics.available);
        assert_eq!(metrics.related_targets.len(), 2);

        assert!(matches!(
            provider.fetch("B00GONE01").await,
            Err(ProviderError::Permanent(_))
        ));
        assert!(provider.fetch("B00FLAKY1").await.unwrap_err().is_transient());
        assert!(!provider.fetch("B00NOPE00").await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn json_fixtures_are_detected_by_extension() {
        let file = write_fixture(".json", r#"{"targets":{"B00TEST01":{"rank":10}}}"#);
        let provider = FixtureProvider::from_path(file.path()).unwrap();
        assert_eq!(provider.fetch("B00TEST01").await.unwrap().rank, Some(10));
        assert_eq!(provider.target_ids().collect::<Vec<_>>(), vec!["B00TEST01"]);
    }

    #[tokio::test]
    async fn canned_insight_describes_price_move() {
        let provider = FixtureProvider::new(FixtureFile::default());
        let raw = RawMetrics {
            target_id: "B00TEST01".into(),
            title: Some("Desk Lamp".into()),
            price: Some(30.0),
            rank: None,
            rating: None,
            review_count: None,
            available: true,
            fetched_at: chrono::Utc::now(),
            related_targets: vec![],
        };
        let current = ciq_core::MetricSnapshot::from_raw(&raw);
        let mut previous = current.clone();
        previous.price = Some(25.0);
        let insight = provider
            .analyze(&PromptContext {
                target_id: "B00TEST01".into(),
                title: raw.title.clone(),
                current,
                previous: Some(previous),
            })
            .await
            .unwrap();
        assert!(insight.summary.contains("25.00 to 30.00"));
        assert_eq!(insight.recommendations.len(), 1);
    }
}

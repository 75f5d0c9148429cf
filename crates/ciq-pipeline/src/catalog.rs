//! Tracked targets and their competitor lists.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::job::MAX_COMPETITORS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTarget {
    pub target_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub competitors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetsFile {
    #[serde(default)]
    pub targets: Vec<TrackedTarget>,
}

#[async_trait]
pub trait TargetCatalog: Send + Sync {
    async fn targets(&self) -> Vec<TrackedTarget>;

    async fn get(&self, target_id: &str) -> Option<TrackedTarget>;

    /// Replaces the competitor list of `target_id`, tracking it if needed.
    async fn record_competitors(&self, target_id: &str, competitors: Vec<String>);
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    targets: RwLock<BTreeMap<String, TrackedTarget>>,
}

impl MemoryCatalog {
    pub fn new(targets: impl IntoIterator<Item = TrackedTarget>) -> Self {
        Self {
            targets: RwLock::new(
                targets
                    .into_iter()
                    .map(|t| (t.target_id.clone(), t))
                    .collect(),
            ),
        }
    }

    /// Loads `targets.yaml`; a missing file yields an empty catalog.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: TargetsFile =
            serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(file.targets))
    }
}

#[async_trait]
impl TargetCatalog for MemoryCatalog {
    async fn targets(&self) -> Vec<TrackedTarget> {
        self.targets.read().await.values().cloned().collect()
    }

    async fn get(&self, target_id: &str) -> Option<TrackedTarget> {
        self.targets.read().await.get(target_id).cloned()
    }

    async fn record_competitors(&self, target_id: &str, mut competitors: Vec<String>) {
        competitors.truncate(MAX_COMPETITORS);
        let mut targets = self.targets.write().await;
        let entry = targets
            .entry(target_id.to_string())
            .or_insert_with(|| TrackedTarget {
                target_id: target_id.to_string(),
                title: None,
                competitors: Vec::new(),
            });
        info!(target_id, count = competitors.len(), "competitors recorded");
        entry.competitors = competitors;
    }
}

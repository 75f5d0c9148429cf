//! Wires providers, storage and the orchestrator together from a
//! [`PipelineConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ciq_adapters::{
    FixtureProvider, HttpInsightProvider, HttpMetricsProvider, HttpProviderConfig,
    InsightProvider, MetricsProvider,
};
use ciq_core::{Clock, SystemClock};
use ciq_storage::{MemoryRepository, MemoryStore, PgRepository, SnapshotRepository};
use tokio_cron_scheduler::JobScheduler;
use tracing::info;

use crate::catalog::MemoryCatalog;
use crate::change::ChangeDetector;
use crate::config::{load_alert_rules, PipelineConfig};
use crate::notify::LogSink;
use crate::orchestrator::Orchestrator;
use crate::schedule::{load_schedules, ScheduleEntry, ScheduleRunner};

pub struct Pipeline {
    pub config: PipelineConfig,
    pub orchestrator: Orchestrator,
    pub schedule: Vec<ScheduleEntry>,
}

impl Pipeline {
    pub async fn from_env() -> Result<Self> {
        Self::new(PipelineConfig::from_env()).await
    }

    pub async fn new(config: PipelineConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let repository = open_repository(&config).await?;
        let metrics = metrics_provider(&config, Arc::clone(&clock))?;
        let catalog = MemoryCatalog::from_yaml_file(config.targets_path())?;
        let alert_rules = load_alert_rules(config.alerts_path(), config.alert_cooldown_secs)?;
        let schedule = load_schedules(config.schedules_path())?;
        let detector = ChangeDetector::new(config.default_alert_rules(), Arc::clone(&clock))
            .with_rules(alert_rules);

        let mut builder = Orchestrator::builder(
            Arc::new(MemoryStore::new(Arc::clone(&clock))),
            metrics,
            repository,
        )
        .config(config.orchestrator_config())
        .rules(config.rule_table())
        .detector(detector)
        .notifier(Arc::new(LogSink))
        .catalog(Arc::new(catalog))
        .clock(clock);
        if let Some(insights) = insight_provider(&config)? {
            builder = builder.insights(insights);
        }

        info!(
            workers = config.workers,
            schedules = schedule.len(),
            persistent = config.database_url.is_some(),
            "pipeline assembled"
        );
        Ok(Self {
            orchestrator: builder.build(),
            schedule,
            config,
        })
    }

    /// Scheduler with every schedule entry registered, or `None` when
    /// scheduling is disabled. The caller starts it.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let runner = ScheduleRunner::new(self.orchestrator.clone(), self.config.subject.as_str());
        runner.build_scheduler(&self.schedule).await.map(Some)
    }
}

async fn open_repository(config: &PipelineConfig) -> Result<Arc<dyn SnapshotRepository>> {
    match &config.database_url {
        Some(url) => {
            let repository = PgRepository::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            Ok(Arc::new(repository))
        }
        None => Ok(Arc::new(MemoryRepository::new())),
    }
}

fn metrics_provider(config: &PipelineConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn MetricsProvider>> {
    if let Some(path) = &config.fixtures {
        let provider = FixtureProvider::from_path(path)?.with_clock(clock);
        return Ok(Arc::new(provider));
    }
    let Some(base_url) = &config.fetch_api_url else {
        bail!("set CIQ_FETCH_API_URL or CIQ_FIXTURES to choose a metrics provider");
    };
    let provider = HttpMetricsProvider::new(HttpProviderConfig {
        api_key: config.fetch_api_key.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        ..HttpProviderConfig::new(base_url.as_str())
    })?;
    Ok(Arc::new(provider))
}

fn insight_provider(config: &PipelineConfig) -> Result<Option<Arc<dyn InsightProvider>>> {
    if config.analyze_api_key.is_none() {
        if let Some(path) = &config.fixtures {
            return Ok(Some(Arc::new(FixtureProvider::from_path(path)?)));
        }
        return Ok(None);
    }
    let provider = HttpInsightProvider::new(
        HttpProviderConfig {
            api_key: config.analyze_api_key.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..HttpProviderConfig::new(config.analyze_api_url.as_str())
        },
        config.analyze_model.as_str(),
    )?;
    Ok(Some(Arc::new(provider)))
}

/// Applies the SQL migrations to `DATABASE_URL`.
pub async fn migrate_from_env() -> Result<()> {
    let config = PipelineConfig::from_env();
    let Some(url) = config.database_url else {
        bail!("DATABASE_URL is required for migrate");
    };
    let repository = PgRepository::connect(&url)
        .await
        .context("connecting to DATABASE_URL")?;
    repository.migrate().await.context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TargetCatalog;
    use crate::job::{JobKind, JobSpec, JobState};
    use std::collections::HashMap;

    #[tokio::test]
    async fn fixture_workspace_runs_an_analysis_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("rules")).expect("rules dir");
        std::fs::write(
            dir.path().join("fixtures.yaml"),
            "targets:\n  B001:\n    title: Desk Lamp\n    price: 24.99\n    rank: 10\n",
        )
        .expect("fixtures");
        std::fs::write(
            dir.path().join("targets.yaml"),
            "targets:\n  - target_id: B001\n",
        )
        .expect("targets");

        let vars: HashMap<&str, String> = HashMap::from([
            ("CIQ_WORKSPACE_ROOT", dir.path().display().to_string()),
            ("CIQ_FIXTURES", dir.path().join("fixtures.yaml").display().to_string()),
        ]);
        let config = PipelineConfig::from_lookup(|key| vars.get(key).cloned());
        let pipeline = Pipeline::new(config).await.unwrap();
        assert_eq!(pipeline.schedule.len(), 3);
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
        assert_eq!(pipeline.orchestrator.catalog().targets().await.len(), 1);

        let job_id = pipeline
            .orchestrator
            .submit(JobSpec::new(JobKind::Analysis, "B001", "cli"))
            .unwrap();
        let status = pipeline.orchestrator.wait(job_id).await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        let insight = status.primary().unwrap().outcome.as_ref().unwrap().insight.clone();
        assert!(insight.unwrap().summary.starts_with("Desk Lamp"));
    }

    #[tokio::test]
    async fn http_provider_needs_a_url() {
        let config = PipelineConfig::from_lookup(|_| None);
        assert!(Pipeline::new(config).await.is_err());
    }
}

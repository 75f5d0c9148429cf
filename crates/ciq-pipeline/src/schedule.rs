//! Declarative schedule table and the scheduler loop that turns each tick into
//! jobs for the selected targets.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ciq_core::JobId;
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

use crate::catalog::TargetCatalog;
use crate::job::{JobKind, JobSpec};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Explicit target ids; every tracked target when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub include_competitors: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Every(Duration),
    Cron(String),
}

impl ScheduleEntry {
    pub fn trigger(&self) -> Result<Trigger> {
        match (&self.every_secs, &self.cron) {
            (Some(0), None) => bail!("schedule {} has a zero interval", self.name),
            (Some(secs), None) => Ok(Trigger::Every(Duration::from_secs(*secs))),
            (None, Some(cron)) => Ok(Trigger::Cron(cron.clone())),
            _ => bail!("schedule {} needs exactly one of every_secs or cron", self.name),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulesFile {
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

pub fn default_schedule() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry {
            name: "hourly-metric-refresh".to_string(),
            kind: JobKind::PeriodicRefresh,
            every_secs: Some(60 * 60),
            cron: None,
            targets: None,
            include_competitors: false,
        },
        ScheduleEntry {
            name: "daily-competitor-discovery".to_string(),
            kind: JobKind::Discovery,
            every_secs: Some(24 * 60 * 60),
            cron: None,
            targets: None,
            include_competitors: false,
        },
        ScheduleEntry {
            name: "competitor-metric-refresh".to_string(),
            kind: JobKind::PeriodicRefresh,
            every_secs: Some(6 * 60 * 60),
            cron: None,
            targets: None,
            include_competitors: true,
        },
    ]
}

/// Reads `rules/schedules.yaml`, falling back to [`default_schedule`] when the
/// file is missing.
pub fn load_schedules(path: impl AsRef<Path>) -> Result<Vec<ScheduleEntry>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(default_schedule());
    }
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: SchedulesFile =
        serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    for entry in &file.schedules {
        entry.trigger()?;
    }
    Ok(file.schedules)
}

/// Turns schedule ticks into submitted jobs.
#[derive(Clone)]
pub struct ScheduleRunner {
    orchestrator: Orchestrator,
    catalog: Arc<dyn TargetCatalog>,
    subject: String,
}

impl ScheduleRunner {
    pub fn new(orchestrator: Orchestrator, subject: impl Into<String>) -> Self {
        Self {
            catalog: orchestrator.catalog(),
            orchestrator,
            subject: subject.into(),
        }
    }

    /// Submits one job per selected target. Submission failures are logged
    /// and skipped.
    pub async fn fire(&self, entry: &ScheduleEntry) -> Vec<JobId> {
        let targets = match &entry.targets {
            Some(ids) => {
                let mut targets = Vec::with_capacity(ids.len());
                for id in ids {
                    let competitors = self
                        .catalog
                        .get(id)
                        .await
                        .map(|t| t.competitors)
                        .unwrap_or_default();
                    targets.push((id.clone(), competitors));
                }
                targets
            }
            None => self
                .catalog
                .targets()
                .await
                .into_iter()
                .map(|t| (t.target_id, t.competitors))
                .collect(),
        };

        let mut submitted = Vec::with_capacity(targets.len());
        for (target_id, competitors) in targets {
            let mut spec = JobSpec::new(entry.kind, target_id.as_str(), self.subject.as_str());
            if entry.include_competitors {
                spec = spec.with_competitors(competitors);
            }
            match self.orchestrator.submit(spec) {
                Ok(job_id) => submitted.push(job_id),
                Err(err) => warn!(schedule = %entry.name, %target_id, error = %err, "scheduled job rejected"),
            }
        }
        info!(schedule = %entry.name, jobs = submitted.len(), "schedule fired");
        submitted
    }

    /// Registers every entry with a fresh scheduler. The caller starts it.
    pub async fn build_scheduler(&self, entries: &[ScheduleEntry]) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for entry in entries {
            let runner = self.clone();
            let tick_entry = entry.clone();
            let run = move |_uuid: uuid::Uuid, _lock: JobScheduler| {
                let runner = runner.clone();
                let entry = tick_entry.clone();
                Box::pin(async move {
                    let span = info_span!("schedule_tick", schedule = %entry.name);
                    runner.fire(&entry).instrument(span).await;
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            };
            let job = match entry.trigger()? {
                Trigger::Every(every) => Job::new_repeated_async(every, run)
                    .with_context(|| format!("creating scheduler job {}", entry.name))?,
                Trigger::Cron(cron) => Job::new_async(cron.as_str(), run)
                    .with_context(|| format!("creating scheduler job {} for cron {cron}", entry.name))?,
            };
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_table_has_three_entries() {
        let table = default_schedule();
        assert_eq!(table.len(), 3);
        assert_eq!(table[0].trigger().unwrap(), Trigger::Every(Duration::from_secs(3600)));
        assert_eq!(table[1].kind, JobKind::Discovery);
        assert!(table[2].include_competitors);
    }

    #[test]
    fn yaml_entries_need_exactly_one_trigger() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "schedules:\n  - name: nightly\n    kind: discovery\n    cron: \"0 3 * * *\"\n    targets: [B001]"
        )
        .expect("write");
        let entries = load_schedules(file.path()).unwrap();
        assert_eq!(entries[0].trigger().unwrap(), Trigger::Cron("0 3 * * *".into()));
        assert_eq!(entries[0].targets.as_deref(), Some(&["B001".to_string()][..]));

        let mut bad = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            bad,
            "schedules:\n  - name: both\n    kind: analysis\n    cron: \"0 3 * * *\"\n    every_secs: 60"
        )
        .expect("write");
        assert!(load_schedules(bad.path()).is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entries = load_schedules(dir.path().join("schedules.yaml")).unwrap();
        assert_eq!(entries, default_schedule());
    }
}

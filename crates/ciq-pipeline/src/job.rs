//! Job model: specs, sub-task descriptors and the status snapshots handed to
//! callers.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ciq_core::{JobId, MetricSnapshot, ProviderError, StructuredInsight};
use ciq_storage::Tier;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on competitor sub-tasks per job.
pub const MAX_COMPETITORS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Fetch fresh metrics for the target and its competitors.
    PeriodicRefresh,
    /// Fetch the target and record the competitors its provider lists.
    Discovery,
    /// Fetch everything and ask the insight provider about the target.
    Analysis,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeriodicRefresh => "periodic-refresh",
            Self::Discovery => "discovery",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: JobKind,
    pub target_id: String,
    #[serde(default)]
    pub competitors: Vec<String>,
    /// Rate-limit subject the job's provider calls are charged to.
    pub subject: String,
}

impl JobSpec {
    pub fn new(kind: JobKind, target_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            kind,
            target_id: target_id.into(),
            competitors: Vec::new(),
            subject: subject.into(),
        }
    }

    pub fn with_competitors<I, S>(mut self, competitors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.competitors = competitors.into_iter().map(Into::into).collect();
        self
    }

    /// Validates the job and expands it into sub-task descriptors: the primary
    /// fetch first, then one per distinct competitor.
    pub fn subtasks(&self) -> Result<Vec<SubtaskDescriptor>, SubmitError> {
        let target = self.target_id.trim();
        if target.is_empty() {
            return Err(SubmitError::EmptyTarget);
        }
        if self.subject.trim().is_empty() {
            return Err(SubmitError::EmptySubject);
        }

        let mut competitors: Vec<&str> = Vec::new();
        for competitor in self.competitors.iter().map(|c| c.trim()) {
            if !competitor.is_empty() && competitor != target && !competitors.contains(&competitor) {
                competitors.push(competitor);
            }
        }
        if competitors.len() > MAX_COMPETITORS {
            return Err(SubmitError::TooManyCompetitors {
                given: competitors.len(),
                max: MAX_COMPETITORS,
            });
        }

        let mut subtasks = vec![SubtaskDescriptor {
            index: 0,
            role: SubtaskRole::Primary,
            target_id: target.to_string(),
        }];
        subtasks.extend(competitors.into_iter().enumerate().map(|(i, competitor)| {
            SubtaskDescriptor {
                index: i + 1,
                role: SubtaskRole::Competitor,
                target_id: competitor.to_string(),
            }
        }));
        Ok(subtasks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskRole {
    Primary,
    Competitor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskDescriptor {
    pub index: usize,
    pub role: SubtaskRole,
    pub target_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    /// At least one sub-task is waiting out a backoff.
    Retrying,
    Succeeded,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::PartiallyFailed | Self::Failed | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl SubtaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Why a single sub-task attempt failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubtaskError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("rate limited on {tier:?} tier, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration, tier: Tier },
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("cache failure: {0}")]
    Cache(String),
    #[error("job timed out")]
    Timeout,
    #[error("job cancelled")]
    Cancelled,
}

impl SubtaskError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider(err) => err.is_transient(),
            Self::RateLimited { .. } => true,
            Self::Persistence(_) | Self::Cache(_) | Self::Timeout | Self::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("job target id is empty")]
    EmptyTarget,
    #[error("job subject is empty")]
    EmptySubject,
    #[error("{given} competitors given, at most {max} allowed")]
    TooManyCompetitors { given: usize, max: usize },
}

/// What a successful sub-task produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskOutcome {
    pub snapshot: MetricSnapshot,
    /// False when an identical snapshot had already been persisted.
    pub snapshot_persisted: bool,
    pub alerts_emitted: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight: Option<StructuredInsight>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discovered_competitors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskStatus {
    pub descriptor: SubtaskDescriptor,
    pub state: SubtaskState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SubtaskOutcome>,
}

impl SubtaskStatus {
    pub fn pending(descriptor: SubtaskDescriptor) -> Self {
        Self {
            descriptor,
            state: SubtaskState::Pending,
            attempts: 0,
            last_error: None,
            outcome: None,
        }
    }
}

/// Point-in-time view of a job as exposed through `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub kind: JobKind,
    pub target_id: String,
    pub state: JobState,
    pub subtasks: Vec<SubtaskStatus>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn succeeded(&self) -> impl Iterator<Item = &SubtaskStatus> {
        self.subtasks
            .iter()
            .filter(|s| s.state == SubtaskState::Succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &SubtaskStatus> {
        self.subtasks.iter().filter(|s| s.state == SubtaskState::Failed)
    }

    pub fn primary(&self) -> Option<&SubtaskStatus> {
        self.subtasks
            .iter()
            .find(|s| s.descriptor.role == SubtaskRole::Primary)
    }

    /// Terminal state implied by the sub-task results once fan-in is over.
    pub(crate) fn settled_state(&self) -> JobState {
        let primary_ok = self
            .primary()
            .is_some_and(|p| p.state == SubtaskState::Succeeded);
        if !primary_ok {
            JobState::Failed
        } else if self.subtasks.iter().all(|s| s.state == SubtaskState::Succeeded) {
            JobState::Succeeded
        } else {
            JobState::PartiallyFailed
        }
    }

    /// Running vs. Retrying while the job is in flight.
    pub(crate) fn in_flight_state(&self) -> JobState {
        if self
            .subtasks
            .iter()
            .any(|s| s.state == SubtaskState::Retrying)
        {
            JobState::Retrying
        } else {
            JobState::Running
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtasks_put_primary_first_and_dedupe_competitors() {
        let spec = JobSpec::new(JobKind::PeriodicRefresh, " B001 ", "user-1")
            .with_competitors(["B002", "B001", "B002", " ", "B003"]);
        let subtasks = spec.subtasks().unwrap();
        let ids: Vec<_> = subtasks.iter().map(|s| s.target_id.as_str()).collect();
        assert_eq!(ids, vec!["B001", "B002", "B003"]);
        assert_eq!(subtasks[0].role, SubtaskRole::Primary);
        assert!(subtasks[1..].iter().all(|s| s.role == SubtaskRole::Competitor));
    }

    #[test]
    fn competitor_list_is_capped() {
        let spec = JobSpec::new(JobKind::Analysis, "B001", "user-1")
            .with_competitors((2..=7).map(|i| format!("B00{i}")));
        assert_eq!(
            spec.subtasks(),
            Err(SubmitError::TooManyCompetitors { given: 6, max: 5 })
        );
        assert_eq!(
            JobSpec::new(JobKind::Analysis, "", "user-1").subtasks(),
            Err(SubmitError::EmptyTarget)
        );
    }

    #[test]
    fn settled_state_follows_primary() {
        let spec = JobSpec::new(JobKind::PeriodicRefresh, "B001", "u").with_competitors(["B002"]);
        let mut status = JobStatus {
            job_id: JobId::new(),
            kind: spec.kind,
            target_id: spec.target_id.clone(),
            state: JobState::Running,
            subtasks: spec
                .subtasks()
                .unwrap()
                .into_iter()
                .map(SubtaskStatus::pending)
                .collect(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        status.subtasks[0].state = SubtaskState::Succeeded;
        status.subtasks[1].state = SubtaskState::Failed;
        assert_eq!(status.settled_state(), JobState::PartiallyFailed);

        status.subtasks[1].state = SubtaskState::Succeeded;
        assert_eq!(status.settled_state(), JobState::Succeeded);

        status.subtasks[0].state = SubtaskState::Failed;
        assert_eq!(status.settled_state(), JobState::Failed);

        status.subtasks[1].state = SubtaskState::Retrying;
        assert_eq!(status.in_flight_state(), JobState::Retrying);
    }
}

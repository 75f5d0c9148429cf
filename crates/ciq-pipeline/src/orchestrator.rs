//! Job orchestration: fan-out of rate-limited, cached provider calls, per
//! sub-task retry, fan-in into a terminal job state.
//!
//! Every job runs on its own task. Its sub-tasks run concurrently inside that
//! task and each attempt holds a worker permit, so the pool size bounds the
//! number of provider calls and persistence steps in progress at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ciq_adapters::{InsightProvider, MetricsProvider};
use ciq_core::{
    Clock, Fingerprint, JobId, MetricSnapshot, PromptContext, ProviderError, RawMetrics,
    StructuredInsight, SystemClock,
};
use ciq_storage::{
    CacheError, CacheLayer, CacheStats, Decision, RateLimitStatus, RateLimiter, RuleClass,
    RuleTable, SharedStore, SnapshotRepository, StoreError, TtlClass,
};
use futures::future::join_all;
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::catalog::{MemoryCatalog, TargetCatalog};
use crate::change::{ChangeDetector, DefaultRules};
use crate::job::{
    JobKind, JobSpec, JobState, JobStatus, SubmitError, SubtaskDescriptor, SubtaskError,
    SubtaskOutcome, SubtaskRole, SubtaskState, SubtaskStatus, MAX_COMPETITORS,
};
use crate::notify::{LogSink, NotificationSink};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bounded worker pool size.
    pub workers: usize,
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
    /// How long finished jobs stay visible through `status`.
    pub job_retention: Duration,
    /// Metric fetches inside the same window share one cache entry.
    pub refresh_window: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            job_timeout: Duration::from_secs(30 * 60),
            retry: RetryPolicy::default(),
            job_retention: Duration::from_secs(60 * 60),
            refresh_window: Duration::from_secs(60 * 60),
        }
    }
}

struct JobRecord {
    status: JobStatus,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

struct Inner {
    config: OrchestratorConfig,
    limiter: Arc<RateLimiter>,
    cache: CacheLayer<SubtaskError>,
    metrics: Arc<dyn MetricsProvider>,
    insights: Option<Arc<dyn InsightProvider>>,
    repository: Arc<dyn SnapshotRepository>,
    detector: ChangeDetector,
    notifier: Arc<dyn NotificationSink>,
    catalog: Arc<dyn TargetCatalog>,
    clock: Arc<dyn Clock>,
    workers: Semaphore,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    /// Serializes load-latest, save and alert evaluation per entity.
    entity_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Arc<dyn SharedStore>,
    rules: RuleTable,
    metrics: Arc<dyn MetricsProvider>,
    insights: Option<Arc<dyn InsightProvider>>,
    repository: Arc<dyn SnapshotRepository>,
    detector: Option<ChangeDetector>,
    notifier: Arc<dyn NotificationSink>,
    catalog: Arc<dyn TargetCatalog>,
    clock: Arc<dyn Clock>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rules(mut self, rules: RuleTable) -> Self {
        self.rules = rules;
        self
    }

    pub fn insights(mut self, insights: Arc<dyn InsightProvider>) -> Self {
        self.insights = Some(insights);
        self
    }

    pub fn detector(mut self, detector: ChangeDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn TargetCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Orchestrator {
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&self.store),
            self.rules,
            Arc::clone(&self.clock),
        ));
        let detector = self
            .detector
            .unwrap_or_else(|| ChangeDetector::new(DefaultRules::default(), Arc::clone(&self.clock)));
        Orchestrator {
            inner: Arc::new(Inner {
                workers: Semaphore::new(self.config.workers.max(1)),
                config: self.config,
                limiter,
                cache: CacheLayer::new(self.store),
                metrics: self.metrics,
                insights: self.insights,
                repository: self.repository,
                detector,
                notifier: self.notifier,
                catalog: self.catalog,
                clock: self.clock,
                jobs: Mutex::new(HashMap::new()),
                entity_locks: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Work already completed by earlier attempts of the same sub-task.
#[derive(Default)]
struct SubtaskProgress {
    raw: Option<RawMetrics>,
    persisted: Option<Persisted>,
    alerts_emitted: Option<usize>,
    insight: Option<StructuredInsight>,
}

struct Persisted {
    inserted: bool,
    previous: Option<MetricSnapshot>,
}

fn from_cache_error(err: CacheError<SubtaskError>) -> SubtaskError {
    match err {
        CacheError::Compute(err) => err,
        other => SubtaskError::Cache(other.to_string()),
    }
}

fn persistence_error(err: impl std::fmt::Display) -> SubtaskError {
    SubtaskError::Persistence(err.to_string())
}

/// Admission for one provider call. A failing limiter store admits the call.
async fn admit(limiter: &RateLimiter, subject: &str, class: RuleClass) -> Result<(), SubtaskError> {
    match limiter.admit(subject, class).await {
        Ok(Decision::Allowed { .. }) => Ok(()),
        Ok(Decision::Denied { retry_after, tier }) => {
            Err(SubtaskError::RateLimited { retry_after, tier })
        }
        Err(err) => {
            warn!(subject, rule = %class, error = %err, "rate limiter unavailable; failing open");
            Ok(())
        }
    }
}

impl Orchestrator {
    pub fn builder(
        store: Arc<dyn SharedStore>,
        metrics: Arc<dyn MetricsProvider>,
        repository: Arc<dyn SnapshotRepository>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: OrchestratorConfig::default(),
            store,
            rules: RuleTable::default(),
            metrics,
            insights: None,
            repository,
            detector: None,
            notifier: Arc::new(LogSink),
            catalog: Arc::new(MemoryCatalog::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn catalog(&self) -> Arc<dyn TargetCatalog> {
        Arc::clone(&self.inner.catalog)
    }

    /// Validates and enqueues a job. Must be called from within a Tokio runtime.
    pub fn submit(&self, spec: JobSpec) -> Result<JobId, SubmitError> {
        let subtasks = spec.subtasks()?;
        let job_id = JobId::new();
        let now = self.inner.clock.now();
        self.prune_finished(now);

        let cancel = CancellationToken::new();
        let (done, _) = watch::channel(false);
        let status = JobStatus {
            job_id,
            kind: spec.kind,
            target_id: subtasks[0].target_id.clone(),
            state: JobState::Queued,
            subtasks: subtasks.iter().cloned().map(SubtaskStatus::pending).collect(),
            submitted_at: now,
            started_at: None,
            finished_at: None,
        };
        self.jobs().insert(
            job_id,
            JobRecord {
                status,
                cancel: cancel.clone(),
                done,
            },
        );
        info!(%job_id, kind = %spec.kind, target_id = %spec.target_id, subtasks = subtasks.len(), "job submitted");

        let this = self.clone();
        tokio::spawn(async move { this.run_job(job_id, spec, subtasks, cancel).await });
        Ok(job_id)
    }

    pub fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.prune_finished(self.inner.clock.now());
        self.jobs().get(&job_id).map(|record| record.status.clone())
    }

    /// Resolves once the job is terminal. `None` for unknown or pruned jobs.
    pub async fn wait(&self, job_id: JobId) -> Option<JobStatus> {
        let mut done = self.jobs().get(&job_id)?.done.subscribe();
        // The sender lives in the record; pruning drops it and ends the wait.
        let _ = done.wait_for(|finished| *finished).await;
        self.status(job_id)
    }

    /// Requests cancellation. Returns false when the job is unknown or
    /// already terminal.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let jobs = self.jobs();
        match jobs.get(&job_id) {
            Some(record) if !record.status.state.is_terminal() => {
                info!(%job_id, "job cancellation requested");
                record.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, StoreError> {
        self.inner.cache.stats().await
    }

    /// Drops cached entries whose fingerprint starts with `fingerprint_prefix`,
    /// compared case-insensitively.
    pub async fn evict_cache(&self, fingerprint_prefix: &str) -> Result<usize, StoreError> {
        let prefix = Fingerprint::normalize_prefix(fingerprint_prefix);
        self.inner.cache.evict(&prefix).await
    }

    /// Drops every cached entry for `target_id`.
    pub async fn evict_target(&self, target_id: &str) -> Result<usize, StoreError> {
        self.evict_cache(&Fingerprint::target_prefix(target_id)).await
    }

    /// Current allowance of `subject` under every rule class.
    pub async fn rate_limit_status(&self, subject: &str) -> Result<Vec<RateLimitStatus>, StoreError> {
        let mut statuses = Vec::with_capacity(RuleClass::ALL.len());
        for class in RuleClass::ALL {
            statuses.push(self.inner.limiter.status(subject, class).await?);
        }
        Ok(statuses)
    }

    pub async fn reset_rate_limit(&self, subject: &str, class: RuleClass) -> Result<bool, StoreError> {
        self.inner.limiter.reset(subject, class).await
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune_finished(&self, now: DateTime<Utc>) {
        let retention =
            ChronoDuration::from_std(self.inner.config.job_retention).unwrap_or(ChronoDuration::MAX);
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|_, record| {
            record
                .status
                .finished_at
                .map_or(true, |finished| now - finished < retention)
        });
        if jobs.len() < before {
            debug!(pruned = before - jobs.len(), "finished jobs pruned");
        }
    }

    fn update_job(&self, job_id: JobId, update: impl FnOnce(&mut JobStatus)) {
        if let Some(record) = self.jobs().get_mut(&job_id) {
            if !record.status.state.is_terminal() {
                update(&mut record.status);
            }
        }
    }

    fn update_subtask(&self, job_id: JobId, index: usize, update: impl FnOnce(&mut SubtaskStatus)) {
        self.update_job(job_id, |status| {
            if let Some(subtask) = status.subtasks.get_mut(index) {
                update(subtask);
            }
            status.state = status.in_flight_state();
        });
    }

    async fn run_job(
        self,
        job_id: JobId,
        spec: JobSpec,
        subtasks: Vec<SubtaskDescriptor>,
        cancel: CancellationToken,
    ) {
        let span = info_span!("job", %job_id, kind = %spec.kind, target_id = %spec.target_id);
        async {
            let started_at = self.inner.clock.now();
            self.update_job(job_id, |status| {
                status.state = JobState::Running;
                status.started_at = Some(started_at);
            });

            let fan_out = join_all(
                subtasks
                    .into_iter()
                    .map(|descriptor| self.run_subtask(job_id, &spec, descriptor)),
            );
            let cutoff = tokio::select! {
                _ = fan_out => None,
                _ = tokio::time::sleep(self.inner.config.job_timeout) => {
                    warn!(timeout_secs = self.inner.config.job_timeout.as_secs(), "job timed out");
                    Some(SubtaskError::Timeout)
                }
                _ = cancel.cancelled() => Some(SubtaskError::Cancelled),
            };
            self.finalize(job_id, cutoff);
        }
        .instrument(span)
        .await
    }

    fn finalize(&self, job_id: JobId, cutoff: Option<SubtaskError>) {
        let now = self.inner.clock.now();
        let mut jobs = self.jobs();
        let Some(record) = jobs.get_mut(&job_id) else {
            return;
        };
        let status = &mut record.status;
        if let Some(reason) = &cutoff {
            for subtask in status.subtasks.iter_mut().filter(|s| !s.state.is_terminal()) {
                subtask.state = SubtaskState::Failed;
                subtask.last_error = Some(reason.to_string());
            }
        }
        status.state = match cutoff {
            Some(SubtaskError::Cancelled) => JobState::Cancelled,
            _ => status.settled_state(),
        };
        status.finished_at = Some(now);
        info!(
            state = ?status.state,
            succeeded = status.succeeded().count(),
            failed = status.failed().count(),
            "job finished"
        );
        record.done.send_replace(true);
    }

    async fn run_subtask(&self, job_id: JobId, spec: &JobSpec, descriptor: SubtaskDescriptor) {
        let index = descriptor.index;
        let span = info_span!("subtask", index, target_id = %descriptor.target_id, role = ?descriptor.role);
        async {
            let mut progress = SubtaskProgress::default();
            let mut attempts = 0u32;
            let mut charged = 0u32;
            loop {
                let Ok(permit) = self.inner.workers.acquire().await else {
                    self.update_subtask(job_id, index, |s| {
                        s.state = SubtaskState::Failed;
                        s.last_error = Some(SubtaskError::Cancelled.to_string());
                    });
                    return;
                };
                attempts += 1;
                self.update_subtask(job_id, index, |s| {
                    s.state = SubtaskState::Running;
                    s.attempts = attempts;
                });

                let result = self.attempt(spec, &descriptor, &mut progress).await;
                drop(permit);

                let err = match result {
                    Ok(outcome) => {
                        debug!(attempts, alerts = outcome.alerts_emitted, "sub-task succeeded");
                        self.update_subtask(job_id, index, |s| {
                            s.state = SubtaskState::Succeeded;
                            s.last_error = None;
                            s.outcome = Some(outcome);
                        });
                        return;
                    }
                    Err(err) => err,
                };

                if !matches!(err, SubtaskError::RateLimited { .. }) {
                    charged += 1;
                }
                match self.inner.config.retry.next_delay(charged, &err) {
                    Some(delay) => {
                        warn!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %err, "sub-task retry scheduled");
                        self.update_subtask(job_id, index, |s| {
                            s.state = SubtaskState::Retrying;
                            s.last_error = Some(err.to_string());
                        });
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(attempt = attempts, error = %err, "sub-task failed");
                        self.update_subtask(job_id, index, |s| {
                            s.state = SubtaskState::Failed;
                            s.last_error = Some(err.to_string());
                        });
                        return;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// One attempt: fetch (cached), persist, evaluate alerts, then the
    /// kind-specific step. Steps finished by an earlier attempt are skipped.
    async fn attempt(
        &self,
        spec: &JobSpec,
        descriptor: &SubtaskDescriptor,
        progress: &mut SubtaskProgress,
    ) -> Result<SubtaskOutcome, SubtaskError> {
        let entity_id = descriptor.target_id.as_str();
        let raw = match &progress.raw {
            Some(raw) => raw.clone(),
            None => {
                let raw = self.fetch_metrics(&spec.subject, entity_id).await?;
                progress.raw = Some(raw.clone());
                raw
            }
        };
        let snapshot = MetricSnapshot::from_raw(&raw);

        if progress.persisted.is_none() || progress.alerts_emitted.is_none() {
            let lock = self.entity_lock(entity_id);
            let guard = lock.lock().await;
            let result = self.persist_and_evaluate(entity_id, &snapshot, progress).await;
            drop(guard);
            self.release_entity_lock(entity_id, lock);
            result?;
        }
        let (inserted, previous) = match &progress.persisted {
            Some(persisted) => (persisted.inserted, persisted.previous.clone()),
            None => (false, None),
        };
        let alerts_emitted = progress.alerts_emitted.unwrap_or(0);

        let is_primary = descriptor.role == SubtaskRole::Primary;
        let insight = if is_primary && spec.kind == JobKind::Analysis {
            match &progress.insight {
                Some(insight) => Some(insight.clone()),
                None => {
                    let insight = self.analyze(spec, &raw, &snapshot, previous).await?;
                    progress.insight = Some(insight.clone());
                    Some(insight)
                }
            }
        } else {
            None
        };

        let discovered_competitors = if is_primary && spec.kind == JobKind::Discovery {
            let mut discovered: Vec<String> = Vec::new();
            for candidate in &raw.related_targets {
                if candidate != entity_id && !discovered.contains(candidate) {
                    discovered.push(candidate.clone());
                }
            }
            discovered.truncate(MAX_COMPETITORS);
            self.inner
                .catalog
                .record_competitors(entity_id, discovered.clone())
                .await;
            discovered
        } else {
            Vec::new()
        };

        Ok(SubtaskOutcome {
            snapshot,
            snapshot_persisted: inserted,
            alerts_emitted,
            insight,
            discovered_competitors,
        })
    }

    fn entity_lock(&self, entity_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .inner
            .entity_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(entity_id.to_string()).or_default())
    }

    /// Drops the map entry once no other task holds or waits on the lock.
    fn release_entity_lock(&self, entity_id: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self
            .inner
            .entity_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(entity_id);
        }
    }

    /// Persists the snapshot and evaluates it against the snapshot persisted
    /// just before it. Must run under the entity lock.
    async fn persist_and_evaluate(
        &self,
        entity_id: &str,
        snapshot: &MetricSnapshot,
        progress: &mut SubtaskProgress,
    ) -> Result<(), SubtaskError> {
        if progress.persisted.is_none() {
            let repository = &self.inner.repository;
            let previous = repository
                .load_latest_snapshot(entity_id)
                .await
                .map_err(persistence_error)?;
            let inserted = repository
                .save_snapshot(snapshot)
                .await
                .map_err(persistence_error)?;
            progress.persisted = Some(Persisted {
                inserted,
                previous: previous.filter(|p| p.captured_at != snapshot.captured_at),
            });
        }
        let Some(persisted) = &progress.persisted else {
            return Ok(());
        };

        if progress.alerts_emitted.is_none() {
            // Whoever inserted the snapshot owns its alert evaluation.
            let emitted = if persisted.inserted {
                let previous = persisted.previous.as_ref();
                self.evaluate_alerts(entity_id, previous, snapshot).await?
            } else {
                0
            };
            progress.alerts_emitted = Some(emitted);
        }
        Ok(())
    }

    fn window_index(&self) -> i64 {
        let window = i64::try_from(self.inner.config.refresh_window.as_secs().max(1)).unwrap_or(i64::MAX);
        self.inner.clock.now().timestamp().div_euclid(window)
    }

    async fn fetch_metrics(&self, subject: &str, target_id: &str) -> Result<RawMetrics, SubtaskError> {
        let provider = Arc::clone(&self.inner.metrics);
        let limiter = Arc::clone(&self.inner.limiter);
        let fingerprint = Fingerprint::builder(provider.provider_id(), target_id, "metrics")
            .param("window", self.window_index())
            .build();
        let subject = subject.to_string();
        let target_id = target_id.to_string();
        self.inner
            .cache
            .get_or_compute_json(&fingerprint, TtlClass::Long, move || async move {
                admit(&limiter, &subject, RuleClass::HeavyRead).await?;
                provider.fetch(&target_id).await.map_err(SubtaskError::from)
            })
            .await
            .map_err(from_cache_error)
    }

    async fn analyze(
        &self,
        spec: &JobSpec,
        raw: &RawMetrics,
        snapshot: &MetricSnapshot,
        previous: Option<MetricSnapshot>,
    ) -> Result<StructuredInsight, SubtaskError> {
        let Some(provider) = self.inner.insights.clone() else {
            return Err(ProviderError::Permanent("no insight provider configured".to_string()).into());
        };
        let limiter = Arc::clone(&self.inner.limiter);
        let fingerprint = Fingerprint::builder(provider.provider_id(), &snapshot.entity_id, "insight")
            .param("captured_at", snapshot.captured_at.timestamp_millis())
            .build();
        let context = PromptContext {
            target_id: snapshot.entity_id.clone(),
            title: raw.title.clone(),
            current: snapshot.clone(),
            previous,
        };
        let subject = spec.subject.clone();
        self.inner
            .cache
            .get_or_compute_json(&fingerprint, TtlClass::Medium, move || async move {
                admit(&limiter, &subject, RuleClass::AiAnalysis).await?;
                provider.analyze(&context).await.map_err(SubtaskError::from)
            })
            .await
            .map_err(from_cache_error)
    }

    /// Stores and publishes every triggered event. A rule's cooldown starts
    /// only once its event is stored.
    async fn evaluate_alerts(
        &self,
        entity_id: &str,
        previous: Option<&MetricSnapshot>,
        current: &MetricSnapshot,
    ) -> Result<usize, SubtaskError> {
        let detector = &self.inner.detector;
        let events = detector.evaluate(entity_id, previous, current);
        for event in &events {
            self.inner
                .repository
                .save_alert_event(event)
                .await
                .map_err(persistence_error)?;
            detector.commit(event);
            if let Err(err) = self.inner.notifier.publish(event).await {
                warn!(rule_id = %event.rule_id, error = %err, "alert notification failed");
            }
        }
        Ok(events.len())
    }
}

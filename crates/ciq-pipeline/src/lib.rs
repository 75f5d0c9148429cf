//! Job orchestration, change detection and scheduling for CIQ.

pub mod catalog;
pub mod change;
pub mod config;
pub mod job;
pub mod notify;
pub mod orchestrator;
pub mod retry;
pub mod runtime;
pub mod schedule;

pub use catalog::{MemoryCatalog, TargetCatalog, TargetsFile, TrackedTarget};
pub use change::{ChangeDetector, DefaultRules};
pub use config::{load_alert_rules, PipelineConfig};
pub use job::{
    JobKind, JobSpec, JobState, JobStatus, SubmitError, SubtaskDescriptor, SubtaskError,
    SubtaskOutcome, SubtaskRole, SubtaskState, SubtaskStatus, MAX_COMPETITORS,
};
pub use notify::{ChannelSink, LogSink, NotificationSink, NotifyError};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig};
pub use retry::RetryPolicy;
pub use runtime::{migrate_from_env, Pipeline};
pub use schedule::{
    default_schedule, load_schedules, ScheduleEntry, ScheduleRunner, SchedulesFile, Trigger,
};

pub const CRATE_NAME: &str = "ciq-pipeline";

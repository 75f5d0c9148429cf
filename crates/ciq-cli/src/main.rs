use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ciq_pipeline::{JobKind, JobSpec, Pipeline, PipelineConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ciq-cli")]
#[command(about = "Competitive intelligence job runner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the schedule table until ctrl-c.
    Run,
    /// Submit one job, wait for it and print its status as JSON.
    Submit {
        #[arg(value_enum)]
        kind: KindArg,
        target: String,
        #[arg(long = "competitor", short = 'c')]
        competitors: Vec<String>,
        /// Rate-limit subject charged for the job's provider calls.
        #[arg(long, default_value = "cli")]
        subject: String,
    },
    /// Print the effective schedule table.
    Schedules,
    Migrate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Refresh,
    Discovery,
    Analysis,
}

impl From<KindArg> for JobKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Refresh => JobKind::PeriodicRefresh,
            KindArg::Discovery => JobKind::Discovery,
            KindArg::Analysis => JobKind::Analysis,
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CIQ_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().with_target(false).try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let mut config = PipelineConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Pipeline::new(config).await?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                warn!("scheduler disabled; nothing to run");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(schedules = pipeline.schedule.len(), "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Commands::Submit {
            kind,
            target,
            competitors,
            subject,
        } => {
            let pipeline = Pipeline::from_env().await?;
            let spec = JobSpec::new(kind.into(), target, subject).with_competitors(competitors);
            let job_id = pipeline.orchestrator.submit(spec)?;
            let status = pipeline
                .orchestrator
                .wait(job_id)
                .await
                .with_context(|| format!("job {job_id} vanished before finishing"))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Schedules => {
            let config = PipelineConfig::from_env();
            let schedule = ciq_pipeline::load_schedules(config.schedules_path())?;
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }
        Commands::Migrate => {
            ciq_pipeline::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

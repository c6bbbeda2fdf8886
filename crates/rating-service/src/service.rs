use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use analysis_pipeline::{AnalysisPipeline, AnalysisStore, MacroCache, Reconciler};
use analysis_queue::{EnqueueRequest, JobQueue, QueueWorker, WorkerConfig};
use anyhow::{Context, Result};
use rating_core::{
    AnalysisError, AnalysisJob, Clock, DataProvider, EnqueueOutcome, JobPriority, MacroAnalysis,
    MacroScorer, MicroScorer, TickerAnalysis,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::mpsc;
use trigger_scheduler::{
    cadence_of, SchedulerStatus, TickOutcome, TriggerConfig, TriggerScheduler,
};

use crate::config::ServiceConfig;
use crate::triggers::{
    BriefSink, CandidateRefreshTask, CandidateSource, DailyBriefTask, ReconciliationTask,
    StaleAnalysisRefreshTask,
};

/// External capabilities the service is wired with. All of them are opaque:
/// the orchestration core never sees transports or wire formats.
pub struct Capabilities {
    pub provider: Arc<dyn DataProvider>,
    pub micro_scorer: Arc<dyn MicroScorer>,
    pub macro_scorer: Arc<dyn MacroScorer>,
    pub candidate_source: Arc<dyn CandidateSource>,
    pub brief_sink: Arc<dyn BriefSink>,
}

/// Wiring facade for the analysis orchestration core: owns the queue, the
/// worker, the pipeline, and the recurring triggers, and exposes the small
/// read/enqueue surface consumed by API layers and operator tooling.
pub struct RatingService {
    queue: JobQueue,
    store: AnalysisStore,
    worker: Arc<QueueWorker>,
    scheduler: TriggerScheduler,
    worker_shutdown: Option<mpsc::Sender<()>>,
}

impl RatingService {
    pub async fn new(
        config: ServiceConfig,
        capabilities: Capabilities,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .with_context(|| format!("invalid database url {}", config.database_url))?
            .create_if_missing(true);
        // In-memory SQLite gives every pooled connection its own database;
        // cap the pool at one connection there.
        let max_connections = if config.database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let queue = JobQueue::new(pool.clone(), Arc::clone(&clock));
        queue.init_tables().await?;
        let store = AnalysisStore::new(pool, Arc::clone(&clock));
        store.init_tables().await?;

        let macro_cache = MacroCache::new(
            store.clone(),
            capabilities.macro_scorer,
            config.macro_ttl_hours,
        );
        let pipeline = Arc::new(AnalysisPipeline::new(
            capabilities.provider,
            capabilities.micro_scorer,
            macro_cache,
            store.clone(),
            queue.clone(),
            Duration::from_secs(config.provider_timeout_seconds),
            Arc::clone(&clock),
        ));
        let worker = Arc::new(QueueWorker::new(
            queue.clone(),
            pipeline,
            WorkerConfig {
                poll_interval: Duration::from_secs(config.worker_poll_seconds),
                backoff_base_seconds: config.backoff_base_seconds,
                backoff_cap_seconds: config.backoff_cap_seconds,
            },
        ));

        let scheduler = TriggerScheduler::new(Arc::clone(&clock))
            .with_health_check_interval(Duration::from_secs(config.health_check_seconds));

        let trigger_config = |name: &str, expression: &str, guard_overlap: bool| TriggerConfig {
            name: name.to_string(),
            expression: expression.to_string(),
            // Unhealthy once the last run is older than twice the cadence.
            max_staleness: cadence_of(expression, clock.now())
                .map(|cadence| cadence * 2)
                .unwrap_or_else(|| chrono::Duration::hours(24)),
            guard_overlap,
        };

        scheduler.register(
            trigger_config("hourly-candidate-refresh", &config.hourly_refresh_cron, true),
            Arc::new(CandidateRefreshTask::new(
                Arc::clone(&capabilities.candidate_source),
                queue.clone(),
                config.hourly_candidate_limit,
                JobPriority::Normal,
            )),
        )?;
        scheduler.register(
            trigger_config("daily-candidate-refresh", &config.daily_refresh_cron, true),
            Arc::new(CandidateRefreshTask::new(
                capabilities.candidate_source,
                queue.clone(),
                config.daily_candidate_limit,
                JobPriority::Low,
            )),
        )?;
        scheduler.register(
            trigger_config("stale-analysis-refresh", &config.stale_refresh_cron, true),
            Arc::new(StaleAnalysisRefreshTask::new(
                store.clone(),
                queue.clone(),
                chrono::Duration::hours(config.stale_analysis_hours),
            )),
        )?;
        scheduler.register(
            trigger_config("reconciliation", &config.reconciliation_cron, true),
            Arc::new(ReconciliationTask::new(Reconciler::new(
                store.clone(),
                queue.clone(),
            ))),
        )?;
        scheduler.register(
            trigger_config("daily-brief", &config.daily_brief_cron, false),
            Arc::new(DailyBriefTask::new(
                store.clone(),
                capabilities.brief_sink,
                config.brief_size,
            )),
        )?;

        Ok(Self {
            queue,
            store,
            worker,
            scheduler,
            worker_shutdown: None,
        })
    }

    /// Start the worker loop, the trigger scheduler, and the health monitor.
    pub fn start(&mut self) {
        if self.worker_shutdown.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(1);
        self.worker_shutdown = Some(tx);
        tokio::spawn(Arc::clone(&self.worker).run(rx));
        self.scheduler.start();
        tracing::info!("Rating service started");
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.worker_shutdown.take() {
            tx.try_send(()).ok();
        }
        self.scheduler.stop();
        tracing::info!("Rating service stopped");
    }

    /// Queue an analysis for a ticker. `force` supersedes any in-flight job.
    pub async fn request_analysis(
        &self,
        ticker: &str,
        source: &str,
        priority: JobPriority,
        force: bool,
    ) -> Result<EnqueueOutcome, AnalysisError> {
        let mut req = EnqueueRequest::new(ticker, source, priority);
        if force {
            req = req.forced();
        }
        self.queue.enqueue(req).await
    }

    /// Most recent job for a ticker, including terminal ones.
    pub async fn job_status(&self, ticker: &str) -> Result<Option<AnalysisJob>, AnalysisError> {
        self.queue.latest_job(ticker).await
    }

    /// Latest combined snapshot (micro fields, macro reference, integrated
    /// score) for a ticker.
    pub async fn latest_analysis(
        &self,
        ticker: &str,
    ) -> Result<Option<TickerAnalysis>, AnalysisError> {
        self.store.get_latest_analysis(ticker).await
    }

    /// Resolve the macro assessment a snapshot's `macro_analysis_id` points
    /// at.
    pub async fn macro_analysis(
        &self,
        id: i64,
    ) -> Result<Option<MacroAnalysis>, AnalysisError> {
        self.store.get_macro(id).await
    }

    /// Per-trigger run state and health, for the operational health page.
    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Job counts by status.
    pub async fn queue_depth(
        &self,
    ) -> Result<std::collections::HashMap<String, i64>, AnalysisError> {
        self.queue.counts_by_status().await
    }

    /// Claim and process one job, if any is due. Operator tooling and tests
    /// use this to drive the queue without the polling loop.
    pub async fn process_next_job(&self) -> Result<Option<i64>, AnalysisError> {
        self.worker.run_once().await
    }

    /// Fire a named trigger immediately (honoring its overlap guard).
    pub async fn run_trigger_now(&self, name: &str) -> Option<TickOutcome> {
        self.scheduler.run_trigger_now(name).await
    }
}

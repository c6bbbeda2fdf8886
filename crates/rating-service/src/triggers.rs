use std::sync::Arc;

use analysis_pipeline::{AnalysisStore, Reconciler};
use analysis_queue::{EnqueueRequest, JobQueue};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rating_core::{EnqueueOutcome, JobPriority};
use serde::Serialize;
use trigger_scheduler::TriggerTask;

/// Opaque source of candidate tickers to analyze (screener, watchlist sync,
/// exchange listing feed, ...).
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn fetch_candidates(&self, limit: usize) -> anyhow::Result<Vec<String>>;
}

/// Opaque delivery target for the daily brief. Formatting and transport
/// (mail, chat, dashboard) live outside this crate.
#[async_trait]
pub trait BriefSink: Send + Sync {
    async fn deliver(&self, brief: &DailyBrief) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyBrief {
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<BriefEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BriefEntry {
    pub ticker: String,
    pub rating: String,
    pub integrated_score: i64,
    pub recommendation: String,
}

/// Pull a batch of candidates and enqueue an analysis for each. Single-flight
/// in the queue keeps repeated batches from piling up duplicate jobs.
pub struct CandidateRefreshTask {
    source: Arc<dyn CandidateSource>,
    queue: JobQueue,
    limit: usize,
    priority: JobPriority,
}

impl CandidateRefreshTask {
    pub fn new(
        source: Arc<dyn CandidateSource>,
        queue: JobQueue,
        limit: usize,
        priority: JobPriority,
    ) -> Self {
        Self {
            source,
            queue,
            limit,
            priority,
        }
    }
}

#[async_trait]
impl TriggerTask for CandidateRefreshTask {
    async fn run(&self) -> anyhow::Result<()> {
        let candidates = self.source.fetch_candidates(self.limit).await?;
        let mut enqueued = 0usize;
        let mut skipped = 0usize;
        for ticker in &candidates {
            match self
                .queue
                .enqueue(EnqueueRequest::new(ticker, "background", self.priority))
                .await?
            {
                EnqueueOutcome::Enqueued(_) => enqueued += 1,
                EnqueueOutcome::Skipped => skipped += 1,
            }
        }
        tracing::info!(
            "Candidate refresh: {} fetched, {} enqueued, {} already in flight",
            candidates.len(),
            enqueued,
            skipped
        );
        Ok(())
    }
}

/// Re-enqueue tickers whose snapshot has aged past the configured window, so
/// scores stay current without an external nudge.
pub struct StaleAnalysisRefreshTask {
    store: AnalysisStore,
    queue: JobQueue,
    max_age: Duration,
}

impl StaleAnalysisRefreshTask {
    pub fn new(store: AnalysisStore, queue: JobQueue, max_age: Duration) -> Self {
        Self {
            store,
            queue,
            max_age,
        }
    }
}

#[async_trait]
impl TriggerTask for StaleAnalysisRefreshTask {
    async fn run(&self) -> anyhow::Result<()> {
        let cutoff = self.store.now() - self.max_age;
        let stale = self.store.stale_tickers(cutoff).await?;
        let mut enqueued = 0usize;
        for ticker in &stale {
            if self
                .queue
                .enqueue(EnqueueRequest::new(ticker, "background", JobPriority::Low))
                .await?
                .job_id()
                .is_some()
            {
                enqueued += 1;
            }
        }
        if !stale.is_empty() {
            tracing::info!(
                "Stale-analysis refresh: {} stale, {} re-enqueued",
                stale.len(),
                enqueued
            );
        }
        Ok(())
    }
}

/// Flag/queue consistency sweep on its own trigger.
pub struct ReconciliationTask {
    reconciler: Reconciler,
}

impl ReconciliationTask {
    pub fn new(reconciler: Reconciler) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl TriggerTask for ReconciliationTask {
    async fn run(&self) -> anyhow::Result<()> {
        self.reconciler.run().await?;
        Ok(())
    }
}

/// Collect the top-rated snapshots and hand them to the brief sink.
pub struct DailyBriefTask {
    store: AnalysisStore,
    sink: Arc<dyn BriefSink>,
    size: i64,
}

impl DailyBriefTask {
    pub fn new(store: AnalysisStore, sink: Arc<dyn BriefSink>, size: i64) -> Self {
        Self { store, sink, size }
    }
}

#[async_trait]
impl TriggerTask for DailyBriefTask {
    async fn run(&self) -> anyhow::Result<()> {
        let top = self.store.top_rated(self.size).await?;
        if top.is_empty() {
            tracing::info!("Daily brief skipped: no analyses yet");
            return Ok(());
        }

        let brief = DailyBrief {
            generated_at: self.store.now(),
            entries: top
                .iter()
                .map(|analysis| BriefEntry {
                    ticker: analysis.ticker.clone(),
                    rating: analysis.micro.overall_rating.as_str().to_string(),
                    integrated_score: analysis.integrated_score,
                    recommendation: analysis.micro.recommendation.clone(),
                })
                .collect(),
        };
        self.sink.deliver(&brief).await?;
        tracing::info!("Daily brief delivered ({} entries)", brief.entries.len());
        Ok(())
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rating_core::{AnalysisError, AnalysisJob, PipelineOutcome};
use tokio::sync::mpsc;

use crate::queue::JobQueue;

/// Anything that can execute one analysis job. The pipeline crate provides
/// the production implementation; tests substitute fakes.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &AnalysisJob) -> Result<PipelineOutcome, AnalysisError>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep when the queue is empty.
    pub poll_interval: Duration,
    pub backoff_base_seconds: i64,
    pub backoff_cap_seconds: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            backoff_base_seconds: 60,
            backoff_cap_seconds: 3600,
        }
    }
}

impl WorkerConfig {
    /// Exponential backoff: base * 2^retry_count, capped. Monotonically
    /// non-decreasing in retry_count.
    pub fn backoff_seconds(&self, retry_count: i64) -> i64 {
        let exp = retry_count.clamp(0, 16) as u32;
        self.backoff_base_seconds
            .saturating_mul(1i64 << exp)
            .min(self.backoff_cap_seconds)
    }
}

/// Queue consumer: claims jobs, runs them through the processor, and applies
/// retry/backoff or terminal failure. Single consumer is the documented
/// minimum; extra workers are safe because the claim in `dequeue_next` is
/// atomic.
pub struct QueueWorker {
    queue: JobQueue,
    processor: Arc<dyn JobProcessor>,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(queue: JobQueue, processor: Arc<dyn JobProcessor>, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    /// Claim and process at most one job. Returns the processed job id, or
    /// None when the queue had nothing eligible. Exposed so tests (and
    /// drain-style callers) can drive the loop deterministically.
    pub async fn run_once(&self) -> Result<Option<i64>, AnalysisError> {
        let Some(job) = self.queue.dequeue_next().await? else {
            return Ok(None);
        };

        tracing::info!(
            "Processing job {} for {} (attempt {}, source: {})",
            job.id,
            job.ticker,
            job.retry_count + 1,
            job.source
        );

        match self.processor.process(&job).await {
            Ok(PipelineOutcome::Completed) => {
                self.queue.mark_completed(job.id).await?;
                tracing::info!("Job {} for {} completed", job.id, job.ticker);
            }
            Ok(PipelineOutcome::Superseded) => {
                // The superseding enqueue already terminal-marked this row.
                tracing::info!(
                    "Job {} for {} was superseded mid-run; result discarded",
                    job.id,
                    job.ticker
                );
            }
            Err(e) if e.is_retryable() => {
                let backoff = self.config.backoff_seconds(job.retry_count);
                let status = self
                    .queue
                    .mark_retry(job.id, &e.to_string(), backoff)
                    .await?;
                if status.is_terminal() {
                    tracing::warn!(
                        "Job {} for {} failed permanently after exhausting retries: {}",
                        job.id,
                        job.ticker,
                        e
                    );
                } else {
                    tracing::warn!(
                        "Job {} for {} failed, retrying in {}s: {}",
                        job.id,
                        job.ticker,
                        backoff,
                        e
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    "Job {} for {} hit a non-retryable error: {}",
                    job.id,
                    job.ticker,
                    e
                );
                self.queue.mark_failed(job.id, &e.to_string()).await?;
            }
        }

        Ok(Some(job.id))
    }

    /// Worker loop: drain the queue, then sleep for the poll interval.
    /// Stops when the shutdown channel fires.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::info!(
            "Queue worker started (poll interval: {:?})",
            self.config.poll_interval
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Queue worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    loop {
                        match self.run_once().await {
                            Ok(Some(_)) => continue,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!("Worker cycle error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

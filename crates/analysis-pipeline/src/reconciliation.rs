use analysis_queue::{EnqueueRequest, JobQueue};
use rating_core::{AnalysisError, EnqueueOutcome, JobPriority};
use serde::Serialize;

use crate::store::AnalysisStore;

/// Periodic sweep reconciling per-ticker phase flags with the snapshots that
/// actually exist. Stale flags over a finished analysis are repaired in
/// place; genuinely unfinished tickers are re-enqueued at low priority,
/// relying on the queue's single-flight guarantee to avoid duplicate work.
pub struct Reconciler {
    store: AnalysisStore,
    queue: JobQueue,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconciliationReport {
    pub scanned: usize,
    pub repaired: usize,
    pub enqueued: usize,
    pub skipped: usize,
}

impl Reconciler {
    pub fn new(store: AnalysisStore, queue: JobQueue) -> Self {
        Self { store, queue }
    }

    pub async fn run(&self) -> Result<ReconciliationReport, AnalysisError> {
        let incomplete = self.store.incomplete_flags().await?;
        let mut report = ReconciliationReport {
            scanned: incomplete.len(),
            ..Default::default()
        };

        for flags in incomplete {
            if self
                .store
                .get_latest_analysis(&flags.ticker)
                .await?
                .is_some()
            {
                // A finished snapshot exists; the flags are stale bookkeeping.
                self.store.mark_all_done(&flags.ticker).await?;
                report.repaired += 1;
                tracing::info!("Repaired completion flags for {}", flags.ticker);
                continue;
            }

            let outcome = self
                .queue
                .enqueue(EnqueueRequest::new(
                    &flags.ticker,
                    "reconciliation",
                    JobPriority::Low,
                ))
                .await?;
            match outcome {
                EnqueueOutcome::Enqueued(job_id) => {
                    report.enqueued += 1;
                    tracing::info!(
                        "Re-enqueued {} as job {} (incomplete analysis)",
                        flags.ticker,
                        job_id
                    );
                }
                EnqueueOutcome::Skipped => {
                    report.skipped += 1;
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                "Reconciliation: {} scanned, {} repaired, {} enqueued, {} already in flight",
                report.scanned,
                report.repaired,
                report.enqueued,
                report.skipped
            );
        }
        Ok(report)
    }
}

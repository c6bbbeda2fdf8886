use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use analysis_queue::{JobProcessor, JobQueue};
use async_trait::async_trait;
use rating_core::{
    AnalysisBundle, AnalysisError, AnalysisJob, Clock, DataProvider, MicroScorer, PipelineOutcome,
    TickerAnalysis,
};

use crate::macro_cache::{sector_label, MacroCache};
use crate::score::integrate_score;
use crate::store::AnalysisStore;

/// Which provider sources may fail without aborting a run. Policy is data so
/// the fetch path stays uniform.
#[derive(Debug, Clone, Copy)]
pub struct SourcePolicy {
    pub name: &'static str,
    pub required: bool,
}

pub const SOURCE_POLICY: &[SourcePolicy] = &[
    SourcePolicy { name: "fundamentals", required: true },
    SourcePolicy { name: "technicals", required: true },
    SourcePolicy { name: "news_sentiment", required: true },
    SourcePolicy { name: "filings", required: false },
    SourcePolicy { name: "extended_fundamentals", required: false },
];

fn source_required(name: &str) -> bool {
    SOURCE_POLICY
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.required)
        .unwrap_or(true)
}

/// Two-stage analysis pipeline: gather provider payloads, score the ticker
/// (micro), resolve the shared sector assessment (macro), integrate, persist.
pub struct AnalysisPipeline {
    provider: Arc<dyn DataProvider>,
    micro_scorer: Arc<dyn MicroScorer>,
    macro_cache: MacroCache,
    store: AnalysisStore,
    queue: JobQueue,
    /// Wall-clock bound on every provider call. A hung provider must not
    /// stall the queue.
    provider_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl AnalysisPipeline {
    pub fn new(
        provider: Arc<dyn DataProvider>,
        micro_scorer: Arc<dyn MicroScorer>,
        macro_cache: MacroCache,
        store: AnalysisStore,
        queue: JobQueue,
        provider_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            micro_scorer,
            macro_cache,
            store,
            queue,
            provider_timeout,
            clock,
        }
    }

    /// Run one provider call under the wall-clock timeout and the source
    /// policy: required-source errors propagate, optional-source errors are
    /// logged and become `None`.
    async fn fetch_source<T, F>(
        &self,
        source: &'static str,
        ticker: &str,
        fut: F,
    ) -> Result<Option<T>, AnalysisError>
    where
        F: Future<Output = Result<T, AnalysisError>>,
    {
        let result = match tokio::time::timeout(self.provider_timeout, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(AnalysisError::ProviderTimeout(format!(
                "{source} fetch for {ticker} exceeded {:?}",
                self.provider_timeout
            ))),
        };

        match result {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if source_required(source) => Err(e),
            Err(e) => {
                tracing::warn!("Optional source {} unavailable for {}: {}", source, ticker, e);
                Ok(None)
            }
        }
    }
}

fn require<T>(
    source: &str,
    ticker: &str,
    fetched: Result<Option<T>, AnalysisError>,
) -> Result<T, AnalysisError> {
    fetched?.ok_or_else(|| {
        AnalysisError::RequiredSourceMissing(format!("{source} for {ticker}"))
    })
}

#[async_trait]
impl JobProcessor for AnalysisPipeline {
    async fn process(&self, job: &AnalysisJob) -> Result<PipelineOutcome, AnalysisError> {
        let ticker = job.ticker.as_str();

        self.store.reset_flags(ticker).await?;
        self.queue
            .update_step(job.id, "fetch_sources", "gathering provider data")
            .await?;

        let (fundamentals, technicals, sentiment, filings, extended) = tokio::join!(
            self.fetch_source("fundamentals", ticker, self.provider.fetch_fundamentals(ticker)),
            self.fetch_source(
                "technicals",
                ticker,
                self.provider.fetch_technical_indicators(ticker)
            ),
            self.fetch_source(
                "news_sentiment",
                ticker,
                self.provider.fetch_news_sentiment(ticker)
            ),
            self.fetch_source("filings", ticker, self.provider.fetch_filing_excerpts(ticker)),
            self.fetch_source(
                "extended_fundamentals",
                ticker,
                self.provider.fetch_extended_fundamentals(ticker)
            ),
        );

        let bundle = AnalysisBundle {
            fundamentals: require("fundamentals", ticker, fundamentals)?,
            technicals: require("technicals", ticker, technicals)?,
            sentiment: require("news_sentiment", ticker, sentiment)?,
            filings: filings?,
            extended: extended?,
        };

        self.queue
            .update_step(job.id, "micro_scoring", "scoring ticker signals")
            .await?;
        let micro = self.micro_scorer.score_micro(ticker, &bundle).await?;
        self.store.mark_micro_done(ticker).await?;

        let sector = bundle.fundamentals.sector.clone();
        self.queue
            .update_step(
                job.id,
                "macro_analysis",
                &format!("resolving {} assessment", sector_label(sector.as_deref())),
            )
            .await?;
        let macro_analysis = self.macro_cache.resolve(sector.as_deref()).await?;
        self.store.mark_macro_done(ticker).await?;

        self.queue
            .update_step(job.id, "integration", "combining micro and macro scores")
            .await?;
        let integrated = integrate_score(micro.confidence_score, Some(macro_analysis.macro_factor));

        // Stale-write guard: a forced re-enqueue may have superseded this job
        // while providers were in flight. An old run must not overwrite a
        // newer snapshot with older data.
        if !self.queue.is_current_job(job.id).await? {
            tracing::warn!(
                "Job {} for {} is no longer current; discarding result",
                job.id,
                ticker
            );
            return Ok(PipelineOutcome::Superseded);
        }

        self.queue
            .update_step(job.id, "persist", "writing combined snapshot")
            .await?;
        let rating = micro.overall_rating;
        let analysis = TickerAnalysis {
            ticker: ticker.to_string(),
            micro,
            macro_analysis_id: Some(macro_analysis.id),
            integrated_score: integrated,
            analyzed_at: self.clock.now(),
        };
        self.store.upsert_analysis(&analysis).await?;
        self.store.mark_combined_done(ticker).await?;

        tracing::info!(
            "Analysis for {} complete: {} (integrated score {})",
            ticker,
            rating.to_label(),
            integrated
        );
        Ok(PipelineOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_queue::EnqueueRequest;
    use chrono::{TimeZone, Utc};
    use rating_core::{
        ExtendedFundamentals, FilingData, Fundamentals, JobPriority, MacroAnalysis, MacroScorer,
        ManualClock, MicroAnalysisResult, NewsSentiment, OverallRating, SentimentSummary,
        TechnicalIndicators, TechnicalSummary,
    };
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeProvider {
        fail_fundamentals: bool,
        fail_filings: bool,
        hang_sentiment: bool,
        sector: Option<String>,
    }

    #[async_trait]
    impl DataProvider for FakeProvider {
        async fn fetch_fundamentals(&self, ticker: &str) -> Result<Fundamentals, AnalysisError> {
            if self.fail_fundamentals {
                return Err(AnalysisError::ProviderUnavailable(
                    "fundamentals feed down".to_string(),
                ));
            }
            Ok(Fundamentals {
                ticker: ticker.to_string(),
                sector: self.sector.clone(),
                last_price: 187.44,
                market_cap: Some(2.9e12),
                pe_ratio: Some(31.2),
                eps: Some(6.01),
                revenue_growth: Some(0.08),
                debt_to_equity: Some(1.4),
                free_cash_flow: Some(9.9e10),
            })
        }

        async fn fetch_technical_indicators(
            &self,
            ticker: &str,
        ) -> Result<TechnicalIndicators, AnalysisError> {
            Ok(TechnicalIndicators {
                ticker: ticker.to_string(),
                rsi: Some(58.0),
                sma_20: Some(182.0),
                sma_50: Some(176.0),
                macd: Some(1.2),
                macd_signal: Some(0.9),
                average_volume: Some(5.1e7),
                price_change_30d: Some(0.04),
            })
        }

        async fn fetch_news_sentiment(
            &self,
            ticker: &str,
        ) -> Result<NewsSentiment, AnalysisError> {
            if self.hang_sentiment {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(NewsSentiment {
                ticker: ticker.to_string(),
                average_score: 0.3,
                article_count: 24,
                trend: "improving".to_string(),
                top_themes: vec!["ai demand".to_string()],
            })
        }

        async fn fetch_filing_excerpts(&self, ticker: &str) -> Result<FilingData, AnalysisError> {
            if self.fail_filings {
                return Err(AnalysisError::ProviderUnavailable(
                    "edgar mirror down".to_string(),
                ));
            }
            Ok(FilingData {
                ticker: ticker.to_string(),
                excerpts: vec![],
            })
        }

        async fn fetch_extended_fundamentals(
            &self,
            ticker: &str,
        ) -> Result<ExtendedFundamentals, AnalysisError> {
            Ok(ExtendedFundamentals {
                ticker: ticker.to_string(),
                quarterly_revenue: vec![1.0, 1.1, 1.2, 1.3],
                quarterly_net_income: vec![0.2, 0.22, 0.25, 0.27],
                insider_net_shares: None,
                institutional_ownership: Some(0.61),
            })
        }
    }

    struct FixedMicroScorer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MicroScorer for FixedMicroScorer {
        async fn score_micro(
            &self,
            ticker: &str,
            bundle: &AnalysisBundle,
        ) -> Result<MicroAnalysisResult, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MicroAnalysisResult {
                ticker: ticker.to_string(),
                overall_rating: OverallRating::Buy,
                confidence_score: 78.0,
                financial_health_score: 70.0,
                technical: TechnicalSummary {
                    score: 65.0,
                    trend: "uptrend".to_string(),
                    momentum: 0.4,
                    signals: vec!["golden_cross".to_string()],
                },
                sentiment: SentimentSummary {
                    score: 58.0,
                    trend: bundle.sentiment.trend.clone(),
                    news_volume: bundle.sentiment.article_count,
                    themes: bundle.sentiment.top_themes.clone(),
                },
                risks: vec!["valuation stretch".to_string()],
                opportunities: vec!["margin expansion".to_string()],
                recommendation: "Buy on weakness".to_string(),
                filing_highlights: bundle.filings.as_ref().map(|_| vec![]),
                fundamentals: Some(bundle.fundamentals.clone()),
                analyzed_at: Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap(),
            })
        }
    }

    struct FixedMacroScorer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MacroScorer for FixedMacroScorer {
        async fn score_macro(&self, sector: Option<&str>) -> Result<MacroAnalysis, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MacroAnalysis {
                id: 0,
                sector: sector.map(str::to_string),
                macro_score: 60.0,
                macro_factor: 0.95,
                market_condition: "expansion".to_string(),
                recommendation: "neutral weight".to_string(),
                themes: vec![],
                opportunities: vec![],
                risks: vec![],
                created_at: Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap(),
            })
        }
    }

    struct Harness {
        pipeline: AnalysisPipeline,
        queue: JobQueue,
        store: AnalysisStore,
        micro: Arc<FixedMicroScorer>,
        macro_scorer: Arc<FixedMacroScorer>,
        clock: Arc<ManualClock>,
    }

    async fn harness(provider: FakeProvider) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap(),
        ));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory SQLite");
        let queue = JobQueue::new(pool.clone(), clock.clone());
        queue.init_tables().await.unwrap();
        let store = AnalysisStore::new(pool, clock.clone());
        store.init_tables().await.unwrap();

        let micro = Arc::new(FixedMicroScorer {
            calls: AtomicUsize::new(0),
        });
        let macro_scorer = Arc::new(FixedMacroScorer {
            calls: AtomicUsize::new(0),
        });
        let macro_cache = MacroCache::new(store.clone(), macro_scorer.clone(), 12);

        let pipeline = AnalysisPipeline::new(
            Arc::new(provider),
            micro.clone(),
            macro_cache,
            store.clone(),
            queue.clone(),
            Duration::from_millis(100),
            clock.clone(),
        );

        Harness {
            pipeline,
            queue,
            store,
            micro,
            macro_scorer,
            clock,
        }
    }

    async fn claim(h: &Harness, ticker: &str) -> AnalysisJob {
        h.queue
            .enqueue(EnqueueRequest::new(ticker, "manual", JobPriority::Normal))
            .await
            .unwrap();
        h.queue.dequeue_next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn completes_and_persists_integrated_score() {
        let h = harness(FakeProvider {
            sector: Some("Technology".to_string()),
            ..Default::default()
        })
        .await;
        let job = claim(&h, "AAPL").await;

        let outcome = h.pipeline.process(&job).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);

        let analysis = h.store.get_latest_analysis("AAPL").await.unwrap().unwrap();
        // 78 * 0.95 = 74.1, rounds to 74
        assert_eq!(analysis.integrated_score, 74);
        assert!(analysis.macro_analysis_id.is_some());

        let flags = h.store.get_flags("AAPL").await.unwrap().unwrap();
        assert!(flags.is_complete());
    }

    #[tokio::test]
    async fn optional_source_failure_still_completes() {
        let h = harness(FakeProvider {
            fail_filings: true,
            sector: Some("Technology".to_string()),
            ..Default::default()
        })
        .await;
        let job = claim(&h, "AAPL").await;

        let outcome = h.pipeline.process(&job).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
        assert_eq!(h.micro.calls.load(Ordering::SeqCst), 1);

        let analysis = h.store.get_latest_analysis("AAPL").await.unwrap().unwrap();
        assert!(analysis.micro.filing_highlights.is_none());
    }

    #[tokio::test]
    async fn required_source_failure_propagates() {
        let h = harness(FakeProvider {
            fail_fundamentals: true,
            ..Default::default()
        })
        .await;
        let job = claim(&h, "AAPL").await;

        let err = h.pipeline.process(&job).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.micro.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.get_latest_analysis("AAPL").await.unwrap().is_none());

        let flags = h.store.get_flags("AAPL").await.unwrap().unwrap();
        assert!(!flags.is_complete());
    }

    #[tokio::test]
    async fn hung_provider_times_out() {
        let h = harness(FakeProvider {
            hang_sentiment: true,
            ..Default::default()
        })
        .await;
        let job = claim(&h, "AAPL").await;

        let err = h.pipeline.process(&job).await.unwrap_err();
        assert!(matches!(err, AnalysisError::ProviderTimeout(_)));
    }

    #[tokio::test]
    async fn persistence_is_idempotent() {
        let h = harness(FakeProvider {
            sector: Some("Technology".to_string()),
            ..Default::default()
        })
        .await;

        let job = claim(&h, "AAPL").await;
        h.pipeline.process(&job).await.unwrap();
        h.queue.mark_completed(job.id).await.unwrap();
        let first = h.store.get_latest_analysis("AAPL").await.unwrap().unwrap();

        h.clock.advance(chrono::Duration::minutes(10));
        let job = claim(&h, "AAPL").await;
        h.pipeline.process(&job).await.unwrap();
        let second = h.store.get_latest_analysis("AAPL").await.unwrap().unwrap();

        assert_ne!(first.analyzed_at, second.analyzed_at);
        assert_eq!(first.integrated_score, second.integrated_score);
        assert_eq!(
            serde_json::to_value(&first.micro.technical).unwrap(),
            serde_json::to_value(&second.micro.technical).unwrap()
        );
        assert_eq!(first.micro.risks, second.micro.risks);
        assert_eq!(first.micro.recommendation, second.micro.recommendation);
    }

    #[tokio::test]
    async fn macro_assessment_is_shared_across_tickers_in_sector() {
        let h = harness(FakeProvider {
            sector: Some("Technology".to_string()),
            ..Default::default()
        })
        .await;

        let job = claim(&h, "AAPL").await;
        h.pipeline.process(&job).await.unwrap();
        h.queue.mark_completed(job.id).await.unwrap();

        let job = claim(&h, "MSFT").await;
        h.pipeline.process(&job).await.unwrap();

        assert_eq!(h.macro_scorer.calls.load(Ordering::SeqCst), 1);
        let aapl = h.store.get_latest_analysis("AAPL").await.unwrap().unwrap();
        let msft = h.store.get_latest_analysis("MSFT").await.unwrap().unwrap();
        assert_eq!(aapl.macro_analysis_id, msft.macro_analysis_id);
    }

    #[tokio::test]
    async fn superseded_job_does_not_persist() {
        let h = harness(FakeProvider {
            sector: Some("Technology".to_string()),
            ..Default::default()
        })
        .await;

        let job = claim(&h, "AAPL").await;
        // A forced re-enqueue lands while the claimed job would be fetching.
        h.queue
            .enqueue(EnqueueRequest::new("AAPL", "manual", JobPriority::High).forced())
            .await
            .unwrap();

        let outcome = h.pipeline.process(&job).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Superseded);
        assert!(h.store.get_latest_analysis("AAPL").await.unwrap().is_none());
    }
}

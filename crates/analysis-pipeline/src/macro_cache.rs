use std::sync::Arc;

use chrono::Duration;
use rating_core::{AnalysisError, MacroAnalysis, MacroScorer};

use crate::store::AnalysisStore;

/// Cache-aside lookup for sector assessments. A sector's row is created the
/// first time a ticker in that sector needs it and reused by subsequent
/// tickers until it is older than the TTL. Two concurrent pipelines may both
/// create a row for the same sector; reads take the newest, so the race only
/// costs a redundant scoring call.
pub struct MacroCache {
    store: AnalysisStore,
    scorer: Arc<dyn MacroScorer>,
    ttl: Duration,
}

impl MacroCache {
    pub fn new(store: AnalysisStore, scorer: Arc<dyn MacroScorer>, ttl_hours: i64) -> Self {
        Self {
            store,
            scorer,
            ttl: Duration::hours(ttl_hours),
        }
    }

    /// Return a fresh assessment for the sector (None = general market),
    /// scoring and persisting a new one if nothing fresh exists.
    pub async fn resolve(&self, sector: Option<&str>) -> Result<MacroAnalysis, AnalysisError> {
        let cutoff = self.store.now() - self.ttl;
        if let Some(existing) = self.store.latest_macro(sector, cutoff).await? {
            tracing::debug!(
                "Reusing macro analysis {} for {}",
                existing.id,
                sector_label(sector)
            );
            return Ok(existing);
        }

        tracing::info!("No fresh macro analysis for {}; scoring", sector_label(sector));
        let scored = self.scorer.score_macro(sector).await?;
        let id = self.store.insert_macro(&scored).await?;
        Ok(MacroAnalysis { id, ..scored })
    }
}

pub(crate) fn sector_label(sector: Option<&str>) -> &str {
    sector.unwrap_or("general market")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rating_core::ManualClock;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingScorer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MacroScorer for CountingScorer {
        async fn score_macro(&self, sector: Option<&str>) -> Result<MacroAnalysis, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MacroAnalysis {
                id: 0,
                sector: sector.map(str::to_string),
                macro_score: 60.0,
                macro_factor: 1.1,
                market_condition: "expansion".to_string(),
                recommendation: "overweight".to_string(),
                themes: vec![],
                opportunities: vec![],
                risks: vec![],
                created_at: Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap(),
            })
        }
    }

    async fn test_cache(ttl_hours: i64) -> (MacroCache, Arc<ManualClock>, Arc<CountingScorer>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap(),
        ));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory SQLite");
        let store = AnalysisStore::new(pool, clock.clone());
        store.init_tables().await.unwrap();
        let scorer = Arc::new(CountingScorer {
            calls: AtomicUsize::new(0),
        });
        let cache = MacroCache::new(store, scorer.clone(), ttl_hours);
        (cache, clock, scorer)
    }

    #[tokio::test]
    async fn second_lookup_reuses_cached_row() {
        let (cache, _clock, scorer) = test_cache(12).await;

        let first = cache.resolve(Some("Technology")).await.unwrap();
        let second = cache.resolve(Some("Technology")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_row_triggers_rescore() {
        let (cache, clock, scorer) = test_cache(12).await;

        cache.resolve(Some("Energy")).await.unwrap();
        clock.advance(Duration::hours(13));
        cache.resolve(Some("Energy")).await.unwrap();
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sectors_are_cached_independently() {
        let (cache, _clock, scorer) = test_cache(12).await;

        cache.resolve(Some("Technology")).await.unwrap();
        cache.resolve(None).await.unwrap();
        cache.resolve(None).await.unwrap();
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
    }
}

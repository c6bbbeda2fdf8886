use std::sync::Arc;

use chrono::{DateTime, Utc};
use rating_core::{
    AnalysisError, Clock, CompletionFlags, MacroAnalysis, MicroAnalysisResult, OverallRating,
    TickerAnalysis,
};
use sqlx::SqlitePool;

/// Persistence for analysis snapshots, macro assessments, and per-ticker
/// completion flags.
#[derive(Clone)]
pub struct AnalysisStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

#[derive(sqlx::FromRow)]
struct AnalysisRow {
    ticker: String,
    overall_rating: String,
    confidence_score: f64,
    financial_health_score: f64,
    technical_json: String,
    sentiment_json: String,
    risks_json: String,
    opportunities_json: String,
    recommendation: String,
    filing_highlights_json: Option<String>,
    fundamentals_json: Option<String>,
    macro_analysis_id: Option<i64>,
    integrated_score: i64,
    analyzed_at: String,
}

const ANALYSIS_COLUMNS: &str = "ticker, overall_rating, confidence_score, financial_health_score, \
     technical_json, sentiment_json, risks_json, opportunities_json, recommendation, \
     filing_highlights_json, fundamentals_json, macro_analysis_id, integrated_score, analyzed_at";

impl AnalysisRow {
    fn into_analysis(self) -> Result<TickerAnalysis, AnalysisError> {
        let overall_rating = OverallRating::parse(&self.overall_rating).ok_or_else(|| {
            AnalysisError::InvariantViolation(format!(
                "unknown rating '{}' for {}",
                self.overall_rating, self.ticker
            ))
        })?;
        let analyzed_at = parse_ts(&self.analyzed_at)?;

        let micro = MicroAnalysisResult {
            ticker: self.ticker.clone(),
            overall_rating,
            confidence_score: self.confidence_score,
            financial_health_score: self.financial_health_score,
            technical: serde_json::from_str(&self.technical_json)?,
            sentiment: serde_json::from_str(&self.sentiment_json)?,
            risks: serde_json::from_str(&self.risks_json)?,
            opportunities: serde_json::from_str(&self.opportunities_json)?,
            recommendation: self.recommendation,
            filing_highlights: self
                .filing_highlights_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            fundamentals: self
                .fundamentals_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            analyzed_at,
        };

        Ok(TickerAnalysis {
            ticker: self.ticker,
            micro,
            macro_analysis_id: self.macro_analysis_id,
            integrated_score: self.integrated_score,
            analyzed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MacroRow {
    id: i64,
    sector: Option<String>,
    macro_score: f64,
    macro_factor: f64,
    market_condition: String,
    recommendation: String,
    themes_json: String,
    opportunities_json: String,
    risks_json: String,
    created_at: String,
}

const MACRO_COLUMNS: &str = "id, sector, macro_score, macro_factor, market_condition, \
     recommendation, themes_json, opportunities_json, risks_json, created_at";

impl MacroRow {
    fn into_macro(self) -> Result<MacroAnalysis, AnalysisError> {
        Ok(MacroAnalysis {
            id: self.id,
            sector: self.sector,
            macro_score: self.macro_score,
            macro_factor: self.macro_factor,
            market_condition: self.market_condition,
            recommendation: self.recommendation,
            themes: serde_json::from_str(&self.themes_json)?,
            opportunities: serde_json::from_str(&self.opportunities_json)?,
            risks: serde_json::from_str(&self.risks_json)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, AnalysisError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

impl AnalysisStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn init_tables(&self) -> Result<(), AnalysisError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ticker_analyses (
                ticker TEXT PRIMARY KEY,
                overall_rating TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                financial_health_score REAL NOT NULL,
                technical_json TEXT NOT NULL,
                sentiment_json TEXT NOT NULL,
                risks_json TEXT NOT NULL,
                opportunities_json TEXT NOT NULL,
                recommendation TEXT NOT NULL,
                filing_highlights_json TEXT,
                fundamentals_json TEXT,
                macro_analysis_id INTEGER,
                integrated_score INTEGER NOT NULL,
                analyzed_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS macro_analyses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sector TEXT,
                macro_score REAL NOT NULL,
                macro_factor REAL NOT NULL,
                market_condition TEXT NOT NULL,
                recommendation TEXT NOT NULL,
                themes_json TEXT NOT NULL,
                opportunities_json TEXT NOT NULL,
                risks_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS analysis_flags (
                ticker TEXT PRIMARY KEY,
                micro_done INTEGER NOT NULL DEFAULT 0,
                macro_done INTEGER NOT NULL DEFAULT 0,
                combined_done INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_macro_sector ON macro_analyses(sector, created_at)",
        )
        .execute(&self.pool)
        .await
        .ok();

        Ok(())
    }

    /// Upsert the combined snapshot for a ticker. Re-running analysis simply
    /// overwrites the prior row.
    pub async fn upsert_analysis(&self, analysis: &TickerAnalysis) -> Result<(), AnalysisError> {
        let micro = &analysis.micro;
        let technical_json = serde_json::to_string(&micro.technical)?;
        let sentiment_json = serde_json::to_string(&micro.sentiment)?;
        let risks_json = serde_json::to_string(&micro.risks)?;
        let opportunities_json = serde_json::to_string(&micro.opportunities)?;
        let filing_highlights_json = micro
            .filing_highlights
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let fundamentals_json = micro
            .fundamentals
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO ticker_analyses
             (ticker, overall_rating, confidence_score, financial_health_score,
              technical_json, sentiment_json, risks_json, opportunities_json,
              recommendation, filing_highlights_json, fundamentals_json,
              macro_analysis_id, integrated_score, analyzed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(ticker) DO UPDATE SET
              overall_rating = excluded.overall_rating,
              confidence_score = excluded.confidence_score,
              financial_health_score = excluded.financial_health_score,
              technical_json = excluded.technical_json,
              sentiment_json = excluded.sentiment_json,
              risks_json = excluded.risks_json,
              opportunities_json = excluded.opportunities_json,
              recommendation = excluded.recommendation,
              filing_highlights_json = excluded.filing_highlights_json,
              fundamentals_json = excluded.fundamentals_json,
              macro_analysis_id = excluded.macro_analysis_id,
              integrated_score = excluded.integrated_score,
              analyzed_at = excluded.analyzed_at",
        )
        .bind(&analysis.ticker)
        .bind(micro.overall_rating.as_str())
        .bind(micro.confidence_score)
        .bind(micro.financial_health_score)
        .bind(&technical_json)
        .bind(&sentiment_json)
        .bind(&risks_json)
        .bind(&opportunities_json)
        .bind(&micro.recommendation)
        .bind(filing_highlights_json.as_deref())
        .bind(fundamentals_json.as_deref())
        .bind(analysis.macro_analysis_id)
        .bind(analysis.integrated_score)
        .bind(analysis.analyzed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Latest combined snapshot for a ticker.
    pub async fn get_latest_analysis(
        &self,
        ticker: &str,
    ) -> Result<Option<TickerAnalysis>, AnalysisError> {
        let row: Option<AnalysisRow> = sqlx::query_as(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM ticker_analyses WHERE ticker = ?1"
        ))
        .bind(&ticker.trim().to_uppercase())
        .fetch_optional(&self.pool)
        .await?;
        row.map(AnalysisRow::into_analysis).transpose()
    }

    /// Tickers whose snapshot is older than the cutoff.
    pub async fn stale_tickers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, AnalysisError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT ticker FROM ticker_analyses WHERE analyzed_at < ?1")
                .bind(cutoff.to_rfc3339())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    /// Highest integrated scores first, for the daily brief.
    pub async fn top_rated(&self, limit: i64) -> Result<Vec<TickerAnalysis>, AnalysisError> {
        let rows: Vec<AnalysisRow> = sqlx::query_as(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM ticker_analyses
             ORDER BY integrated_score DESC, ticker ASC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AnalysisRow::into_analysis).collect()
    }

    /// Persist a macro assessment and return its row id.
    pub async fn insert_macro(&self, analysis: &MacroAnalysis) -> Result<i64, AnalysisError> {
        let themes_json = serde_json::to_string(&analysis.themes)?;
        let opportunities_json = serde_json::to_string(&analysis.opportunities)?;
        let risks_json = serde_json::to_string(&analysis.risks)?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO macro_analyses
             (sector, macro_score, macro_factor, market_condition, recommendation,
              themes_json, opportunities_json, risks_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(analysis.sector.as_deref())
        .bind(analysis.macro_score)
        .bind(analysis.macro_factor)
        .bind(&analysis.market_condition)
        .bind(&analysis.recommendation)
        .bind(&themes_json)
        .bind(&opportunities_json)
        .bind(&risks_json)
        .bind(analysis.created_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Newest macro row for a sector (NULL = general market) created at or
    /// after the cutoff. Duplicate rows from concurrent creators resolve here:
    /// the newest wins.
    pub async fn latest_macro(
        &self,
        sector: Option<&str>,
        created_after: DateTime<Utc>,
    ) -> Result<Option<MacroAnalysis>, AnalysisError> {
        let row: Option<MacroRow> = sqlx::query_as(&format!(
            "SELECT {MACRO_COLUMNS} FROM macro_analyses
             WHERE sector IS ?1 AND created_at >= ?2
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(sector)
        .bind(created_after.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;
        row.map(MacroRow::into_macro).transpose()
    }

    /// Fetch a macro row by id.
    pub async fn get_macro(&self, id: i64) -> Result<Option<MacroAnalysis>, AnalysisError> {
        let row: Option<MacroRow> = sqlx::query_as(&format!(
            "SELECT {MACRO_COLUMNS} FROM macro_analyses WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(MacroRow::into_macro).transpose()
    }

    /// Reset all three phase flags to false at the start of a pipeline run.
    pub async fn reset_flags(&self, ticker: &str) -> Result<(), AnalysisError> {
        let now = self.clock.now().to_rfc3339();
        sqlx::query(
            "INSERT INTO analysis_flags (ticker, micro_done, macro_done, combined_done, updated_at)
             VALUES (?1, 0, 0, 0, ?2)
             ON CONFLICT(ticker) DO UPDATE SET
              micro_done = 0, macro_done = 0, combined_done = 0, updated_at = excluded.updated_at",
        )
        .bind(&ticker.trim().to_uppercase())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_micro_done(&self, ticker: &str) -> Result<(), AnalysisError> {
        self.raise_flag(ticker, "micro_done").await
    }

    pub async fn mark_macro_done(&self, ticker: &str) -> Result<(), AnalysisError> {
        self.raise_flag(ticker, "macro_done").await
    }

    pub async fn mark_combined_done(&self, ticker: &str) -> Result<(), AnalysisError> {
        self.raise_flag(ticker, "combined_done").await
    }

    /// Set all three flags true (reconciliation repair path).
    pub async fn mark_all_done(&self, ticker: &str) -> Result<(), AnalysisError> {
        let now = self.clock.now().to_rfc3339();
        sqlx::query(
            "INSERT INTO analysis_flags (ticker, micro_done, macro_done, combined_done, updated_at)
             VALUES (?1, 1, 1, 1, ?2)
             ON CONFLICT(ticker) DO UPDATE SET
              micro_done = 1, macro_done = 1, combined_done = 1, updated_at = excluded.updated_at",
        )
        .bind(&ticker.trim().to_uppercase())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn raise_flag(&self, ticker: &str, column: &'static str) -> Result<(), AnalysisError> {
        let now = self.clock.now().to_rfc3339();
        sqlx::query(&format!(
            "INSERT INTO analysis_flags (ticker, {column}, updated_at)
             VALUES (?1, 1, ?2)
             ON CONFLICT(ticker) DO UPDATE SET {column} = 1, updated_at = excluded.updated_at"
        ))
        .bind(&ticker.trim().to_uppercase())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_flags(&self, ticker: &str) -> Result<Option<CompletionFlags>, AnalysisError> {
        let row: Option<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT ticker, micro_done, macro_done, combined_done
             FROM analysis_flags WHERE ticker = ?1",
        )
        .bind(&ticker.trim().to_uppercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(flags_from_row))
    }

    /// All tickers with at least one phase flag still false.
    pub async fn incomplete_flags(&self) -> Result<Vec<CompletionFlags>, AnalysisError> {
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT ticker, micro_done, macro_done, combined_done
             FROM analysis_flags
             WHERE micro_done = 0 OR macro_done = 0 OR combined_done = 0
             ORDER BY ticker ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(flags_from_row).collect())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn flags_from_row(row: (String, i64, i64, i64)) -> CompletionFlags {
    let (ticker, micro_done, macro_done, combined_done) = row;
    CompletionFlags {
        ticker,
        micro_done: micro_done != 0,
        macro_done: macro_done != 0,
        combined_done: combined_done != 0,
    }
}

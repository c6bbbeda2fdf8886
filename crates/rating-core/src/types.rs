use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue priority. Lower rank dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

impl JobPriority {
    /// Numeric rank used for ordering in the queue (0 = highest).
    pub fn rank(&self) -> i64 {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => JobPriority::High,
            1 => JobPriority::Normal,
            _ => JobPriority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

/// Job state machine: pending -> processing -> {completed | pending(retry) | failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One unit of analysis work, persisted in the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: i64,
    pub ticker: String,
    /// Provenance tag: "manual", "background", "reconciliation", ...
    pub source: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    /// Not eligible for dequeue before this time.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub step_details: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of an enqueue call. `Skipped` means a non-terminal job already
/// exists for the ticker (single-flight), not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(i64),
    Skipped,
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Option<i64> {
        match self {
            EnqueueOutcome::Enqueued(id) => Some(*id),
            EnqueueOutcome::Skipped => None,
        }
    }

    pub fn was_skipped(&self) -> bool {
        matches!(self, EnqueueOutcome::Skipped)
    }
}

/// What the pipeline reports back to the worker for a processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    /// The job was superseded by a forced re-enqueue while it ran; nothing
    /// was persisted.
    Superseded,
}

/// Overall recommendation bucket for a ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallRating {
    StrongBuy,
    Buy,
    Hold,
    Avoid,
    StrongAvoid,
}

impl OverallRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallRating::StrongBuy => "strong_buy",
            OverallRating::Buy => "buy",
            OverallRating::Hold => "hold",
            OverallRating::Avoid => "avoid",
            OverallRating::StrongAvoid => "strong_avoid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "strong_buy" => Some(OverallRating::StrongBuy),
            "buy" => Some(OverallRating::Buy),
            "hold" => Some(OverallRating::Hold),
            "avoid" => Some(OverallRating::Avoid),
            "strong_avoid" => Some(OverallRating::StrongAvoid),
            _ => None,
        }
    }

    /// Human-readable label for the rating
    pub fn to_label(&self) -> &'static str {
        match self {
            OverallRating::StrongBuy => "Strong Buy",
            OverallRating::Buy => "Buy",
            OverallRating::Hold => "Hold",
            OverallRating::Avoid => "Avoid",
            OverallRating::StrongAvoid => "Strong Avoid",
        }
    }
}

/// Company fundamentals as returned by the data provider. Doubles as the
/// structured snapshot embedded in the micro result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fundamentals {
    pub ticker: String,
    pub sector: Option<String>,
    pub last_price: f64,
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub eps: Option<f64>,
    pub revenue_growth: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub free_cash_flow: Option<f64>,
}

/// Technical indicators as returned by the data provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalIndicators {
    pub ticker: String,
    pub rsi: Option<f64>,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub average_volume: Option<f64>,
    pub price_change_30d: Option<f64>,
}

/// Aggregated news sentiment as returned by the data provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsSentiment {
    pub ticker: String,
    /// -1.0 (bearish) to 1.0 (bullish)
    pub average_score: f64,
    pub article_count: i64,
    pub trend: String,
    pub top_themes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilingExcerpt {
    pub form_type: String,
    pub filed_at: DateTime<Utc>,
    pub excerpt: String,
}

/// Regulatory filing excerpts (optional source).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilingData {
    pub ticker: String,
    pub excerpts: Vec<FilingExcerpt>,
}

/// Extended fundamentals (optional source).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedFundamentals {
    pub ticker: String,
    pub quarterly_revenue: Vec<f64>,
    pub quarterly_net_income: Vec<f64>,
    pub insider_net_shares: Option<f64>,
    pub institutional_ownership: Option<f64>,
}

/// Everything gathered for one micro-scoring call. Optional sources that
/// failed to fetch are simply absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisBundle {
    pub fundamentals: Fundamentals,
    pub technicals: TechnicalIndicators,
    pub sentiment: NewsSentiment,
    #[serde(default)]
    pub filings: Option<FilingData>,
    #[serde(default)]
    pub extended: Option<ExtendedFundamentals>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSummary {
    pub score: f64,
    pub trend: String,
    pub momentum: f64,
    pub signals: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSummary {
    pub score: f64,
    pub trend: String,
    pub news_volume: i64,
    pub themes: Vec<String>,
}

/// Per-ticker snapshot produced by the micro scorer. One row per ticker,
/// overwritten on each successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroAnalysisResult {
    pub ticker: String,
    pub overall_rating: OverallRating,
    /// 0 to 100
    pub confidence_score: f64,
    pub financial_health_score: f64,
    pub technical: TechnicalSummary,
    pub sentiment: SentimentSummary,
    pub risks: Vec<String>,
    pub opportunities: Vec<String>,
    pub recommendation: String,
    #[serde(default)]
    pub filing_highlights: Option<Vec<String>>,
    #[serde(default)]
    pub fundamentals: Option<Fundamentals>,
    pub analyzed_at: DateTime<Utc>,
}

/// Sector-wide (or market-wide when `sector` is None) assessment, shared by
/// every ticker in the sector until it ages out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroAnalysis {
    pub id: i64,
    pub sector: Option<String>,
    /// 0 to 100
    pub macro_score: f64,
    /// Multiplier applied to micro confidence, nominally in [0.5, 1.5].
    pub macro_factor: f64,
    pub market_condition: String,
    pub recommendation: String,
    pub themes: Vec<String>,
    pub opportunities: Vec<String>,
    pub risks: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Combined persisted snapshot: micro fields + macro reference + integrated
/// score, keyed by ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerAnalysis {
    pub ticker: String,
    pub micro: MicroAnalysisResult,
    pub macro_analysis_id: Option<i64>,
    /// clamp(round(confidence_score * macro_factor), 0, 100)
    pub integrated_score: i64,
    pub analyzed_at: DateTime<Utc>,
}

/// Per-ticker phase bookkeeping audited by the reconciliation sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionFlags {
    pub ticker: String,
    pub micro_done: bool,
    pub macro_done: bool,
    pub combined_done: bool,
}

impl CompletionFlags {
    pub fn is_complete(&self) -> bool {
        self.micro_done && self.macro_done && self.combined_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(JobPriority::High.rank() < JobPriority::Normal.rank());
        assert!(JobPriority::Normal.rank() < JobPriority::Low.rank());
    }

    #[test]
    fn priority_rank_roundtrip() {
        for p in [JobPriority::High, JobPriority::Normal, JobPriority::Low] {
            assert_eq!(JobPriority::from_rank(p.rank()), p);
        }
    }

    #[test]
    fn status_roundtrip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn rating_roundtrip() {
        for r in [
            OverallRating::StrongBuy,
            OverallRating::Buy,
            OverallRating::Hold,
            OverallRating::Avoid,
            OverallRating::StrongAvoid,
        ] {
            assert_eq!(OverallRating::parse(r.as_str()), Some(r));
        }
    }

    #[test]
    fn flags_complete_only_when_all_set() {
        let mut flags = CompletionFlags {
            ticker: "AAPL".to_string(),
            micro_done: true,
            macro_done: true,
            combined_done: false,
        };
        assert!(!flags.is_complete());
        flags.combined_done = true;
        assert!(flags.is_complete());
    }
}

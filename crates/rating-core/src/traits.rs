use crate::{
    AnalysisBundle, AnalysisError, ExtendedFundamentals, FilingData, Fundamentals, MacroAnalysis,
    MicroAnalysisResult, NewsSentiment, TechnicalIndicators,
};
use async_trait::async_trait;

/// External data sources, consumed as opaque capabilities. Fundamentals,
/// technicals, and sentiment are required by the pipeline; filings and
/// extended fundamentals are optional and may fail without aborting a run.
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn fetch_fundamentals(&self, ticker: &str) -> Result<Fundamentals, AnalysisError>;

    async fn fetch_technical_indicators(
        &self,
        ticker: &str,
    ) -> Result<TechnicalIndicators, AnalysisError>;

    async fn fetch_news_sentiment(&self, ticker: &str) -> Result<NewsSentiment, AnalysisError>;

    async fn fetch_filing_excerpts(&self, ticker: &str) -> Result<FilingData, AnalysisError>;

    async fn fetch_extended_fundamentals(
        &self,
        ticker: &str,
    ) -> Result<ExtendedFundamentals, AnalysisError>;
}

/// Ticker-specific scoring capability: given the gathered bundle, return a
/// structured rating.
#[async_trait]
pub trait MicroScorer: Send + Sync {
    async fn score_micro(
        &self,
        ticker: &str,
        bundle: &AnalysisBundle,
    ) -> Result<MicroAnalysisResult, AnalysisError>;
}

/// Sector-wide scoring capability. `None` means general market.
#[async_trait]
pub trait MacroScorer: Send + Sync {
    async fn score_macro(&self, sector: Option<&str>) -> Result<MacroAnalysis, AnalysisError>;
}

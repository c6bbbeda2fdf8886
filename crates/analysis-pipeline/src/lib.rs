pub mod macro_cache;
pub mod pipeline;
pub mod reconciliation;
pub mod score;
pub mod store;

pub use macro_cache::MacroCache;
pub use pipeline::AnalysisPipeline;
pub use reconciliation::{ReconciliationReport, Reconciler};
pub use score::integrate_score;
pub use store::AnalysisStore;

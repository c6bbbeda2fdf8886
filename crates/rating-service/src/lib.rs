pub mod config;
pub mod service;
pub mod telemetry;
pub mod triggers;

pub use config::ServiceConfig;
pub use service::{Capabilities, RatingService};
pub use triggers::{BriefEntry, BriefSink, CandidateSource, DailyBrief};

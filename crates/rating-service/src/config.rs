use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    // Storage
    pub database_url: String,

    // Worker
    pub worker_poll_seconds: u64,
    pub backoff_base_seconds: i64,
    pub backoff_cap_seconds: i64,

    // Pipeline
    pub provider_timeout_seconds: u64,
    pub macro_ttl_hours: i64,

    // Recurring triggers
    pub hourly_refresh_cron: String,
    pub daily_refresh_cron: String,
    pub stale_refresh_cron: String,
    pub reconciliation_cron: String,
    pub daily_brief_cron: String,
    pub health_check_seconds: u64,

    // Population sizes
    pub hourly_candidate_limit: usize,
    pub daily_candidate_limit: usize,
    pub stale_analysis_hours: i64,
    pub brief_size: i64,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:ratings.db".to_string()),

            worker_poll_seconds: env::var("WORKER_POLL_SECONDS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            backoff_base_seconds: env::var("BACKOFF_BASE_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
            backoff_cap_seconds: env::var("BACKOFF_CAP_SECONDS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()?,

            provider_timeout_seconds: env::var("PROVIDER_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            macro_ttl_hours: env::var("MACRO_TTL_HOURS")
                .unwrap_or_else(|_| "12".to_string())
                .parse()?,

            // Top of every hour
            hourly_refresh_cron: env::var("HOURLY_REFRESH_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            // 13:30 UTC, pre-open sweep
            daily_refresh_cron: env::var("DAILY_REFRESH_CRON")
                .unwrap_or_else(|_| "0 30 13 * * *".to_string()),
            // Every six hours
            stale_refresh_cron: env::var("STALE_REFRESH_CRON")
                .unwrap_or_else(|_| "0 15 */6 * * *".to_string()),
            // Every ten minutes
            reconciliation_cron: env::var("RECONCILIATION_CRON")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            // 21:15 UTC, after US close
            daily_brief_cron: env::var("DAILY_BRIEF_CRON")
                .unwrap_or_else(|_| "0 15 21 * * *".to_string()),
            health_check_seconds: env::var("HEALTH_CHECK_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,

            hourly_candidate_limit: env::var("HOURLY_CANDIDATE_LIMIT")
                .unwrap_or_else(|_| "25".to_string())
                .parse()?,
            daily_candidate_limit: env::var("DAILY_CANDIDATE_LIMIT")
                .unwrap_or_else(|_| "200".to_string())
                .parse()?,
            stale_analysis_hours: env::var("STALE_ANALYSIS_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()?,
            brief_size: env::var("BRIEF_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.backoff_base_seconds, 60);
        assert!(config.backoff_cap_seconds >= config.backoff_base_seconds);
        assert_eq!(config.macro_ttl_hours, 12);
        assert!(config.brief_size > 0);
    }
}

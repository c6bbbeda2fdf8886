//! Recurring trigger scheduler: cron-like timers with per-trigger overlap
//! guards and a background health monitor. Run counters are process-scoped
//! and reset on restart; `status()` is the only externally observable
//! contract.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use dashmap::DashMap;
use rating_core::Clock;
use serde::Serialize;
use tokio::sync::watch;

/// Work fired by a trigger tick. Errors are caught per tick and recorded;
/// they never stop future ticks.
#[async_trait]
pub trait TriggerTask: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub name: String,
    /// Cron expression, 5 (crontab), 6, or 7 fields.
    pub expression: String,
    /// Flag unhealthy when the last run is older than this. Callers usually
    /// set 2x the trigger's cadence.
    pub max_staleness: Duration,
    /// Skip (never queue) a tick that fires while the previous invocation of
    /// this same trigger is still running.
    pub guard_overlap: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TriggerStats {
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_success: Option<bool>,
    pub run_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerStatus {
    pub name: String,
    pub scheduled: bool,
    pub expression: String,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_success: Option<bool>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
    pub health: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub generated_at: DateTime<Utc>,
    pub triggers: Vec<TriggerStatus>,
}

/// What happened when a trigger was asked to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ran { success: bool },
    SkippedOverlap,
}

struct Trigger {
    config: TriggerConfig,
    schedule: Schedule,
    task: Arc<dyn TriggerTask>,
    stats: Mutex<TriggerStats>,
    /// Overlap guard: held for the duration of one invocation.
    running: tokio::sync::Mutex<()>,
    next_run: Mutex<DateTime<Utc>>,
}

pub struct TriggerScheduler {
    clock: Arc<dyn Clock>,
    triggers: Arc<DashMap<String, Arc<Trigger>>>,
    health_check_interval: std::time::Duration,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl TriggerScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            triggers: Arc::new(DashMap::new()),
            health_check_interval: std::time::Duration::from_secs(60),
            shutdown_tx: None,
        }
    }

    pub fn with_health_check_interval(mut self, interval: std::time::Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Register a named trigger. Validates the cron expression up front.
    pub fn register(&self, config: TriggerConfig, task: Arc<dyn TriggerTask>) -> anyhow::Result<()> {
        if self.triggers.contains_key(&config.name) {
            anyhow::bail!("trigger '{}' is already registered", config.name);
        }
        let schedule = parse_schedule(&config.expression)?;
        let next = schedule
            .after(&self.clock.now())
            .next()
            .with_context(|| format!("no future occurrence for '{}'", config.expression))?;

        tracing::info!(
            "Registered trigger '{}' ({}), next run {}",
            config.name,
            config.expression,
            next.to_rfc3339()
        );
        let name = config.name.clone();
        self.triggers.insert(
            name,
            Arc::new(Trigger {
                config,
                schedule,
                task,
                stats: Mutex::new(TriggerStats::default()),
                running: tokio::sync::Mutex::new(()),
                next_run: Mutex::new(next),
            }),
        );
        Ok(())
    }

    /// Fire a trigger immediately, honoring the overlap guard. Returns None
    /// for an unregistered name. This is also the execution path the tick
    /// loop uses, so guard and stats behavior is testable without timers.
    pub async fn run_trigger_now(&self, name: &str) -> Option<TickOutcome> {
        let trigger = self.triggers.get(name).map(|e| Arc::clone(e.value()))?;
        Some(execute(trigger, Arc::clone(&self.clock)).await)
    }

    /// Start the tick loop and the independent health-check loop.
    pub fn start(&mut self) {
        if self.shutdown_tx.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        self.shutdown_tx = Some(tx);

        let triggers = Arc::clone(&self.triggers);
        let clock = Arc::clone(&self.clock);
        let mut tick_rx = rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick_rx.changed() => {
                        tracing::info!("Trigger scheduler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                        let now = clock.now();
                        for entry in triggers.iter() {
                            let trigger = Arc::clone(entry.value());
                            let due = {
                                let mut next =
                                    trigger.next_run.lock().expect("next_run mutex poisoned");
                                if *next <= now {
                                    *next = trigger
                                        .schedule
                                        .after(&now)
                                        .next()
                                        .unwrap_or(now + Duration::days(36500));
                                    true
                                } else {
                                    false
                                }
                            };
                            if due {
                                let clock = Arc::clone(&clock);
                                tokio::spawn(async move {
                                    execute(trigger, clock).await;
                                });
                            }
                        }
                    }
                }
            }
        });

        let triggers = Arc::clone(&self.triggers);
        let clock = Arc::clone(&self.clock);
        let interval = self.health_check_interval;
        let mut health_rx = rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = health_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        let now = clock.now();
                        for entry in triggers.iter() {
                            let trigger = entry.value();
                            let stats =
                                trigger.stats.lock().expect("stats mutex poisoned").clone();
                            if health_for(&stats, trigger.config.max_staleness, now)
                                == HealthStatus::Unhealthy
                            {
                                tracing::warn!(
                                    "Trigger '{}' is unhealthy (last run: {:?}, last success: {:?})",
                                    trigger.config.name,
                                    stats.last_run_time.map(|t| t.to_rfc3339()),
                                    stats.last_run_success
                                );
                            }
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            tx.send(true).ok();
        }
    }

    /// Per-trigger state for the operational health page.
    pub fn status(&self) -> SchedulerStatus {
        let now = self.clock.now();
        let mut triggers: Vec<TriggerStatus> = self
            .triggers
            .iter()
            .map(|entry| {
                let trigger = entry.value();
                let stats = trigger.stats.lock().expect("stats mutex poisoned").clone();
                TriggerStatus {
                    name: trigger.config.name.clone(),
                    scheduled: true,
                    expression: trigger.config.expression.clone(),
                    last_run_time: stats.last_run_time,
                    last_run_success: stats.last_run_success,
                    next_run_time: trigger.schedule.after(&now).next(),
                    run_count: stats.run_count,
                    error_count: stats.error_count,
                    health: health_for(&stats, trigger.config.max_staleness, now),
                }
            })
            .collect();
        triggers.sort_by(|a, b| a.name.cmp(&b.name));
        SchedulerStatus {
            generated_at: now,
            triggers,
        }
    }
}

async fn execute(trigger: Arc<Trigger>, clock: Arc<dyn Clock>) -> TickOutcome {
    let _guard = if trigger.config.guard_overlap {
        match trigger.running.try_lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!(
                    "Trigger '{}' is still running; skipping this tick",
                    trigger.config.name
                );
                return TickOutcome::SkippedOverlap;
            }
        }
    } else {
        None
    };

    let started = clock.now();
    tracing::debug!("Trigger '{}' firing", trigger.config.name);
    let result = trigger.task.run().await;
    let success = result.is_ok();
    if let Err(e) = &result {
        tracing::error!("Trigger '{}' failed: {:#}", trigger.config.name, e);
    }

    let mut stats = trigger.stats.lock().expect("stats mutex poisoned");
    stats.last_run_time = Some(started);
    stats.last_run_success = Some(success);
    stats.run_count += 1;
    if !success {
        stats.error_count += 1;
    }
    TickOutcome::Ran { success }
}

/// Health derivation: unknown until the first run, unhealthy when the last
/// run failed or is staler than the trigger's threshold.
pub fn health_for(stats: &TriggerStats, max_staleness: Duration, now: DateTime<Utc>) -> HealthStatus {
    let Some(last_run) = stats.last_run_time else {
        return HealthStatus::Unknown;
    };
    if stats.last_run_success == Some(false) {
        return HealthStatus::Unhealthy;
    }
    if now - last_run > max_staleness {
        return HealthStatus::Unhealthy;
    }
    HealthStatus::Healthy
}

/// Gap between the next two occurrences of an expression: the trigger's
/// cadence, used by callers to derive staleness thresholds (typically 2x).
pub fn cadence_of(expression: &str, from: DateTime<Utc>) -> Option<Duration> {
    let schedule = parse_schedule(expression).ok()?;
    let mut upcoming = schedule.after(&from);
    match (upcoming.next(), upcoming.next()) {
        (Some(first), Some(second)) => Some(second - first),
        _ => None,
    }
}

fn parse_schedule(expression: &str) -> anyhow::Result<Schedule> {
    let normalized = normalize_expression(expression)?;
    Schedule::from_str(&normalized)
        .with_context(|| format!("invalid cron expression: {expression}"))
}

/// Accept standard 5-field crontab syntax by prefixing a seconds field; the
/// cron crate natively expects 6 or 7 fields.
fn normalize_expression(expression: &str) -> anyhow::Result<String> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();
    match field_count {
        5 => Ok(format!("0 {expression}")),
        6 | 7 => Ok(expression.to_string()),
        _ => anyhow::bail!(
            "invalid cron expression: {expression} (expected 5, 6, or 7 fields, got {field_count})"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rating_core::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopTask;

    #[async_trait]
    impl TriggerTask for NoopTask {
        async fn run(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailingTask;

    #[async_trait]
    impl TriggerTask for FailingTask {
        async fn run(&self) -> anyhow::Result<()> {
            anyhow::bail!("candidate feed returned 503")
        }
    }

    struct SlowTask {
        started: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TriggerTask for SlowTask {
        async fn run(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap(),
        ))
    }

    fn hourly_config(name: &str) -> TriggerConfig {
        TriggerConfig {
            name: name.to_string(),
            expression: "0 0 * * * *".to_string(),
            max_staleness: Duration::hours(2),
            guard_overlap: true,
        }
    }

    #[test]
    fn normalizes_five_field_expressions() {
        assert_eq!(normalize_expression("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(
            normalize_expression("0 */5 * * * *").unwrap(),
            "0 */5 * * * *"
        );
        assert!(normalize_expression("* * *").is_err());
    }

    #[test]
    fn register_rejects_bad_expression_and_duplicates() {
        let scheduler = TriggerScheduler::new(test_clock());
        assert!(scheduler
            .register(
                TriggerConfig {
                    name: "bad".to_string(),
                    expression: "not a cron".to_string(),
                    max_staleness: Duration::hours(1),
                    guard_overlap: false,
                },
                Arc::new(NoopTask),
            )
            .is_err());

        scheduler
            .register(hourly_config("refresh"), Arc::new(NoopTask))
            .unwrap();
        assert!(scheduler
            .register(hourly_config("refresh"), Arc::new(NoopTask))
            .is_err());
    }

    #[test]
    fn unrun_trigger_reports_unknown_with_next_run() {
        let scheduler = TriggerScheduler::new(test_clock());
        scheduler
            .register(hourly_config("refresh"), Arc::new(NoopTask))
            .unwrap();

        let status = scheduler.status();
        assert_eq!(status.triggers.len(), 1);
        let trigger = &status.triggers[0];
        assert!(trigger.scheduled);
        assert_eq!(trigger.health, HealthStatus::Unknown);
        assert!(trigger.last_run_time.is_none());
        assert!(trigger.next_run_time.is_some());
    }

    #[tokio::test]
    async fn successful_run_is_healthy_and_counted() {
        let scheduler = TriggerScheduler::new(test_clock());
        scheduler
            .register(hourly_config("refresh"), Arc::new(NoopTask))
            .unwrap();

        let outcome = scheduler.run_trigger_now("refresh").await.unwrap();
        assert_eq!(outcome, TickOutcome::Ran { success: true });

        let status = scheduler.status();
        let trigger = &status.triggers[0];
        assert_eq!(trigger.health, HealthStatus::Healthy);
        assert_eq!(trigger.run_count, 1);
        assert_eq!(trigger.error_count, 0);
        assert_eq!(trigger.last_run_success, Some(true));
    }

    #[tokio::test]
    async fn failed_run_is_unhealthy_and_does_not_stop_future_ticks() {
        let scheduler = TriggerScheduler::new(test_clock());
        scheduler
            .register(hourly_config("refresh"), Arc::new(FailingTask))
            .unwrap();

        let outcome = scheduler.run_trigger_now("refresh").await.unwrap();
        assert_eq!(outcome, TickOutcome::Ran { success: false });
        assert_eq!(scheduler.status().triggers[0].health, HealthStatus::Unhealthy);
        assert_eq!(scheduler.status().triggers[0].error_count, 1);

        // The scheduler still fires the trigger on the next tick.
        let outcome = scheduler.run_trigger_now("refresh").await.unwrap();
        assert_eq!(outcome, TickOutcome::Ran { success: false });
        assert_eq!(scheduler.status().triggers[0].run_count, 2);
    }

    #[tokio::test]
    async fn stale_hourly_trigger_goes_unhealthy() {
        let clock = test_clock();
        let scheduler = TriggerScheduler::new(clock.clone());
        scheduler
            .register(hourly_config("refresh"), Arc::new(NoopTask))
            .unwrap();

        scheduler.run_trigger_now("refresh").await.unwrap();
        assert_eq!(scheduler.status().triggers[0].health, HealthStatus::Healthy);

        // Hourly cadence, 2x threshold, last run 3 hours ago.
        clock.advance(Duration::hours(3));
        assert_eq!(
            scheduler.status().triggers[0].health,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped_not_queued() {
        let scheduler = Arc::new(TriggerScheduler::new(test_clock()));
        let task = Arc::new(SlowTask {
            started: Arc::new(tokio::sync::Notify::new()),
            release: Arc::new(tokio::sync::Notify::new()),
            runs: AtomicUsize::new(0),
        });
        scheduler
            .register(hourly_config("slow-sweep"), task.clone())
            .unwrap();

        let first = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_trigger_now("slow-sweep").await })
        };
        task.started.notified().await;

        // Second tick while the first invocation is still inside the task.
        let second = scheduler.run_trigger_now("slow-sweep").await.unwrap();
        assert_eq!(second, TickOutcome::SkippedOverlap);

        task.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first, TickOutcome::Ran { success: true });

        // Skipped tick never reached the task and was not counted as a run.
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.status().triggers[0].run_count, 1);
    }

    #[test]
    fn cadence_matches_expression_interval() {
        let from = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 30).unwrap();
        assert_eq!(
            cadence_of("0 0 * * * *", from),
            Some(Duration::hours(1))
        );
        assert_eq!(
            cadence_of("0 */10 * * * *", from),
            Some(Duration::minutes(10))
        );
        assert_eq!(cadence_of("garbage", from), None);
    }

    #[tokio::test]
    async fn unknown_trigger_returns_none() {
        let scheduler = TriggerScheduler::new(test_clock());
        assert!(scheduler.run_trigger_now("missing").await.is_none());
    }
}

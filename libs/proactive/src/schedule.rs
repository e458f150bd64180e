//! Cron plumbing for the two proactive schedules.
//!
//! Jobs only emit ticks into a channel; the gateway's own task performs the
//! sweep so shutdown ordering stays in one place.

use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

/// Which schedule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Morning,
    Evening,
}

impl Tick {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tick::Morning => "morning",
            Tick::Evening => "evening",
        }
    }
}

/// Cron expressions plus the timezone they are evaluated in.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub morning_cron: String,
    pub evening_cron: String,
    pub timezone: Tz,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            morning_cron: "0 9 * * 1-5".into(),
            evening_cron: "0 18 * * 1-5".into(),
            timezone: Tz::UTC,
        }
    }
}

impl ScheduleConfig {
    /// Builds the config from optional environment values, falling back to
    /// weekday 09:00/18:00 UTC.
    pub fn from_parts(
        morning: Option<String>,
        evening: Option<String>,
        timezone: Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();
        let timezone = match timezone {
            Some(raw) => raw
                .parse::<Tz>()
                .map_err(|_| anyhow!("invalid TZ value: {raw}"))?,
            None => defaults.timezone,
        };
        Ok(Self {
            morning_cron: morning.unwrap_or(defaults.morning_cron),
            evening_cron: evening.unwrap_or(defaults.evening_cron),
            timezone,
        })
    }
}

/// The scheduler library wants a seconds field; operators configure the
/// conventional five-field form.
fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Starts both cron jobs. Each firing pushes a [`Tick`] into `tx`; a full
/// channel means the previous sweep is still running and the tick is dropped.
/// The returned scheduler must be shut down during graceful exit.
pub async fn start_schedules(
    config: &ScheduleConfig,
    tx: mpsc::Sender<Tick>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .context("create proactive scheduler")?;

    for (tick, expr) in [
        (Tick::Morning, &config.morning_cron),
        (Tick::Evening, &config.evening_cron),
    ] {
        let normalized = normalize_cron(expr);
        let tx = tx.clone();
        let job = Job::new_async_tz(normalized.as_str(), config.timezone, move |_id, _sched| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Err(err) = tx.try_send(tick) {
                    warn!(
                        schedule = tick.as_str(),
                        error = %err,
                        "proactive tick dropped; previous sweep still running"
                    );
                }
            })
        })
        .with_context(|| format!("invalid cron expression for {}: {expr}", tick.as_str()))?;
        scheduler.add(job).await.context("register cron job")?;
    }

    scheduler.start().await.context("start proactive scheduler")?;
    info!(
        morning = %config.morning_cron,
        evening = %config.evening_cron,
        timezone = %config.timezone,
        "proactive schedules armed"
    );
    Ok(scheduler)
}

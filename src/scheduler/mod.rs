//! # Scheduler
//!
//! Drives long-lived tasks on a schedule and provides the only cross-task ordering
//! guarantee of the pipeline: a dependent task never processes height `H` before
//! every parent reports `last_processed_height() >= H`.
//!
//! ## Policies
//!
//! - [`IntervalScheduler`]: ticks on wall-clock multiples of the interval and calls
//!   `execute(None, now)`. Missed ticks are dropped, never queued.
//! - [`TimeWindowScheduler`]: backfills aligned `[start, end)` windows from the
//!   task's start timestamp up to now, then executes one window per tick.
//!
//! ## Failure model
//!
//! Every scheduler loop reports its error to one shared channel owned by the
//! [`TaskRunner`]. The first error cancels the shared token; all loops observe the
//! cancellation at their next wait boundary. An in-flight `execute` is never
//! interrupted.

mod height_gate;
mod runner;

pub use height_gate::{wait_until_reaching_height, HeightGate};
pub use runner::{IntervalScheduler, Schedule, TaskRunner, TimeWindowScheduler};

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::Height;

/// A unit of scheduled work.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Processes everything in `[start, end)`; `start` is `None` for interval
    /// scheduling, where the task decides its own starting point.
    async fn execute(&self, start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> anyhow::Result<()>;

    /// Highest height whose output is complete and visible to other tasks.
    fn last_processed_height(&self) -> Height;

    /// First window start for time-window scheduling. Defaults to `hint`.
    async fn start_timestamp(&self, hint: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
        Ok(hint)
    }
}

/// Monotonic progress counter shared between a task and its dependents.
#[derive(Debug, Default)]
pub struct TaskProgress {
    height: AtomicU64,
}

impl TaskProgress {
    pub fn new(height: Height) -> Self {
        Self {
            height: AtomicU64::new(height),
        }
    }

    pub fn get(&self) -> Height {
        self.height.load(Ordering::Acquire)
    }

    /// Moves the counter to `height` unless it is already further. Returns the
    /// resulting value.
    pub fn advance(&self, height: Height) -> Height {
        self.height.fetch_max(height, Ordering::AcqRel).max(height)
    }
}

/// Errors surfaced by the scheduling layer.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("cancelled")]
    Cancelled,
    #[error("task {task} waited {waited:?} for its parents to reach height {target}")]
    HeightGateTimeout {
        task: String,
        target: Height,
        waited: Duration,
    },
    #[error("invalid schedule interval: {0}")]
    InvalidInterval(String),
    #[error("task {task} failed: {error:#}")]
    Task { task: String, error: anyhow::Error },
    #[error("task {task} panicked: {reason}")]
    Panicked { task: String, reason: String },
}

impl SchedulerError {
    /// True if `error` (or anything in its chain) is a cancellation.
    pub fn is_cancellation(error: &anyhow::Error) -> bool {
        error
            .chain()
            .any(|e| matches!(e.downcast_ref::<SchedulerError>(), Some(SchedulerError::Cancelled)))
    }
}

/// Source of "now" for the scheduling policies.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock anchored at `base` that advances with tokio's (possibly paused) time.
#[derive(Debug, Clone)]
pub struct TokioClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.base + elapsed
    }
}

pub(crate) fn to_step(interval: Duration) -> Result<chrono::Duration, SchedulerError> {
    if interval.is_zero() {
        return Err(SchedulerError::InvalidInterval("interval must be positive".to_string()));
    }
    chrono::Duration::from_std(interval).map_err(|e| SchedulerError::InvalidInterval(e.to_string()))
}

/// Rounds `ts` down to a multiple of `step` since the Unix epoch.
pub(crate) fn truncate(ts: DateTime<Utc>, step: chrono::Duration) -> Result<DateTime<Utc>, SchedulerError> {
    ts.duration_trunc(step)
        .map_err(|e| SchedulerError::InvalidInterval(e.to_string()))
}

/// Sleeps until `clock` reads `deadline`; returns immediately if it already passed.
pub(crate) async fn sleep_until(clock: &dyn Clock, deadline: DateTime<Utc>) {
    if let Ok(remaining) = (deadline - clock.now()).to_std() {
        tokio::time::sleep(remaining).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_progress_only_moves_forward() {
        let progress = TaskProgress::new(3);
        assert_eq!(progress.advance(10), 10);
        assert_eq!(progress.advance(7), 10);
        assert_eq!(progress.get(), 10);
        assert_eq!(progress.advance(11), 11);
    }

    #[test]
    fn test_truncate_aligns_to_interval() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 10, 17, 42).unwrap();
        let step = to_step(Duration::from_secs(30 * 60)).unwrap();
        assert_eq!(truncate(ts, step).unwrap(), Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
        assert!(to_step(Duration::ZERO).is_err());
    }

    #[test]
    fn test_cancellation_detected_through_context() {
        let err = anyhow::Error::new(SchedulerError::Cancelled).context("price task: wait for parents");
        assert!(SchedulerError::is_cancellation(&err));
        assert!(!SchedulerError::is_cancellation(&anyhow::anyhow!("db down")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TokioClock::new(base);
        sleep_until(&clock, base + chrono::Duration::seconds(5)).await;
        assert_eq!(clock.now(), base + chrono::Duration::seconds(5));
    }
}

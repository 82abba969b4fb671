use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{error, info, warn};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{sleep_until, to_step, truncate, Clock, SchedulerError, SystemClock, Task};
use crate::metrics;

/// How a task is driven by the [`TaskRunner`].
#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(Duration),
    /// Aligned windows starting at the task's `start_timestamp(start)`.
    TimeWindow { interval: Duration, start: DateTime<Utc> },
}

async fn report(errors: &mpsc::Sender<SchedulerError>, task: &str, err: SchedulerError) {
    metrics::increment_task_errors(task);
    error!("[{}] scheduler loop stopped: {}", task, err);
    // The runner may already be gone after an earlier error.
    let _ = errors.send(err).await;
}

/// Converts a failed `execute` into a loop outcome: cancellation during shutdown
/// ends the loop quietly, anything else is a task error.
fn task_failure(task: &str, cancel: &CancellationToken, error: anyhow::Error) -> Option<SchedulerError> {
    if cancel.is_cancelled() && SchedulerError::is_cancellation(&error) {
        info!("[{}] interrupted by shutdown", task);
        return None;
    }
    Some(SchedulerError::Task {
        task: task.to_string(),
        error,
    })
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        reason.to_string()
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs a scheduler loop, turning a panic into [`SchedulerError::Panicked`] for `task`.
async fn guarded(task: String, scheduler_loop: impl Future<Output = ()>) -> Result<(), SchedulerError> {
    AssertUnwindSafe(scheduler_loop)
        .catch_unwind()
        .await
        .map_err(|payload| SchedulerError::Panicked {
            reason: panic_reason(&*payload),
            task,
        })
}

/// Runs `execute(None, now)` at every wall-clock multiple of the interval.
pub struct IntervalScheduler {
    task: Arc<dyn Task>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    errors: mpsc::Sender<SchedulerError>,
}

impl IntervalScheduler {
    pub fn new(
        task: Arc<dyn Task>,
        interval: Duration,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        errors: mpsc::Sender<SchedulerError>,
    ) -> Self {
        Self {
            task,
            interval,
            clock,
            cancel,
            errors,
        }
    }

    pub async fn run(self) {
        if let Err(err) = self.run_loop().await {
            report(&self.errors, self.task.name(), err).await;
        }
    }

    async fn run_loop(&self) -> Result<(), SchedulerError> {
        let name = self.task.name();
        let step = to_step(self.interval)?;
        let mut next = truncate(self.clock.now(), step)? + step;
        info!("[{}] interval scheduler started, every {:?}", name, self.interval);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("[{}] interval scheduler stopped", name);
                    return Ok(());
                }
                _ = sleep_until(self.clock.as_ref(), next) => {}
            }

            let now = self.clock.now();
            if let Err(e) = self.task.execute(None, now).await {
                return match task_failure(name, &self.cancel, e) {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }

            next = truncate(now, step)? + step;
            let after = self.clock.now();
            if next <= after {
                // Missed ticks are dropped.
                let skipped_to = truncate(after, step)? + step;
                warn!("[{}] execution overran its interval, next tick at {}", name, skipped_to);
                next = skipped_to;
            }
        }
    }
}

/// Backfills aligned `[start, end)` windows up to now, then runs one window per tick.
pub struct TimeWindowScheduler {
    task: Arc<dyn Task>,
    interval: Duration,
    start_hint: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    errors: mpsc::Sender<SchedulerError>,
}

impl TimeWindowScheduler {
    pub fn new(
        task: Arc<dyn Task>,
        interval: Duration,
        start_hint: DateTime<Utc>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        errors: mpsc::Sender<SchedulerError>,
    ) -> Self {
        Self {
            task,
            interval,
            start_hint,
            clock,
            cancel,
            errors,
        }
    }

    pub async fn run(self) {
        if let Err(err) = self.run_loop().await {
            report(&self.errors, self.task.name(), err).await;
        }
    }

    async fn execute_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<bool, SchedulerError> {
        match self.task.execute(Some(start), end).await {
            Ok(()) => Ok(true),
            Err(e) => match task_failure(self.task.name(), &self.cancel, e) {
                Some(err) => Err(err),
                None => Ok(false),
            },
        }
    }

    async fn run_loop(&self) -> Result<(), SchedulerError> {
        let name = self.task.name();
        let step = to_step(self.interval)?;
        let first = self
            .task
            .start_timestamp(self.start_hint)
            .await
            .map_err(|error| SchedulerError::Task {
                task: name.to_string(),
                error,
            })?;

        let mut start = truncate(first, step)?;
        let mut end = start + step;

        let mut backfilled = 0usize;
        while end <= self.clock.now() {
            if self.cancel.is_cancelled() {
                info!("[{}] cancelled during backfill after {} windows", name, backfilled);
                return Ok(());
            }
            if !self.execute_window(start, end).await? {
                return Ok(());
            }
            backfilled += 1;
            start = end;
            end = start + step;
        }
        info!("[{}] caught up after {} backfill windows, live from {}", name, backfilled, start);

        loop {
            // Unlike the interval scheduler, missed ticks are not dropped here: a window
            // whose end already passed runs immediately, so windows stay contiguous.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("[{}] time-window scheduler stopped", name);
                    return Ok(());
                }
                _ = sleep_until(self.clock.as_ref(), end) => {}
            }
            if !self.execute_window(start, end).await? {
                return Ok(());
            }
            start = end;
            end = start + step;
        }
    }
}

/// Owns the shared cancellation token and error channel for a set of scheduled tasks.
pub struct TaskRunner {
    entries: Vec<(Arc<dyn Task>, Schedule)>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl TaskRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            entries: Vec::new(),
            clock: Arc::new(SystemClock),
            cancel,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn add(&mut self, task: Arc<dyn Task>, schedule: Schedule) -> &mut Self {
        self.entries.push((task, schedule));
        self
    }

    /// Runs every task until cancellation or the first error. The first error
    /// cancels the remaining loops and is returned once they have all stopped.
    pub async fn run(self) -> Result<(), SchedulerError> {
        let (err_tx, mut err_rx) = mpsc::channel::<SchedulerError>(self.entries.len().max(1));
        let mut loops = JoinSet::new();

        for (task, schedule) in self.entries {
            let name = task.name().to_string();
            info!("Scheduling task {} with {:?}", task.name(), schedule);
            let clock = self.clock.clone();
            let cancel = self.cancel.clone();
            let errors = err_tx.clone();
            match schedule {
                Schedule::Interval(interval) => {
                    loops.spawn(guarded(name, IntervalScheduler::new(task, interval, clock, cancel, errors).run()));
                }
                Schedule::TimeWindow { interval, start } => {
                    loops.spawn(guarded(
                        name,
                        TimeWindowScheduler::new(task, interval, start, clock, cancel, errors).run(),
                    ));
                }
            }
        }
        drop(err_tx);

        let mut first_error: Option<SchedulerError> = None;
        loop {
            tokio::select! {
                Some(err) = err_rx.recv(), if first_error.is_none() => {
                    warn!("Cancelling all tasks after error: {}", err);
                    first_error = Some(err);
                    self.cancel.cancel();
                }
                joined = loops.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(panicked))) => {
                        error!("Scheduler loop stopped: {}", panicked);
                        if first_error.is_none() {
                            first_error = Some(panicked);
                            self.cancel.cancel();
                        }
                    }
                    Some(Err(join_err)) => {
                        // Loops are never aborted, so this is the runtime shutting down.
                        error!("Scheduler loop did not complete: {}", join_err);
                        self.cancel.cancel();
                    }
                },
            }
        }

        if first_error.is_none() {
            first_error = err_rx.try_recv().ok();
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!("All scheduled tasks stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{TaskProgress, TokioClock};
    use crate::types::Height;
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    type Call = (Option<DateTime<Utc>>, DateTime<Utc>);

    struct RecordingTask {
        name: String,
        calls: Mutex<Vec<Call>>,
        progress: TaskProgress,
        work: Duration,
        fail_on_call: Option<usize>,
    }

    impl RecordingTask {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                calls: Mutex::new(Vec::new()),
                progress: TaskProgress::default(),
                work: Duration::ZERO,
                fail_on_call: None,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Task for RecordingTask {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> anyhow::Result<()> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((start, end));
                calls.len()
            };
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            if self.fail_on_call == Some(call) {
                bail!("boom on call {}", call);
            }
            self.progress.advance(call as Height);
            Ok(())
        }

        fn last_processed_height(&self) -> Height {
            self.progress.get()
        }
    }

    /// 2024-01-01T00:00:00.5Z
    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(500)
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticks_on_aligned_boundaries() {
        let task = Arc::new(RecordingTask::new("router"));
        let cancel = CancellationToken::new();
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let scheduler = IntervalScheduler::new(
            task.clone(),
            Duration::from_secs(1),
            Arc::new(TokioClock::new(base())),
            cancel.clone(),
            err_tx,
        );
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(3200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(task.calls(), vec![(None, at(1)), (None, at(2)), (None, at(3))]);
        assert!(err_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_drops_missed_ticks() {
        let mut slow = RecordingTask::new("slow");
        slow.work = Duration::from_millis(2500);
        let task = Arc::new(slow);
        let cancel = CancellationToken::new();
        let (err_tx, _err_rx) = mpsc::channel(1);
        let handle = tokio::spawn(
            IntervalScheduler::new(
                task.clone(),
                Duration::from_secs(1),
                Arc::new(TokioClock::new(base())),
                cancel.clone(),
                err_tx,
            )
            .run(),
        );

        // Runs at 1s until 3.5s; ticks 2 and 3 are dropped, next run at 4s until 6.5s.
        tokio::time::sleep(Duration::from_millis(6200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(task.calls(), vec![(None, at(1)), (None, at(4))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_window_backfills_then_goes_live() {
        let task = Arc::new(RecordingTask::new("prices"));
        let cancel = CancellationToken::new();
        let (err_tx, _err_rx) = mpsc::channel(1);
        let handle = tokio::spawn(
            TimeWindowScheduler::new(
                task.clone(),
                Duration::from_secs(1),
                base() - chrono::Duration::seconds(3),
                Arc::new(TokioClock::new(base())),
                cancel.clone(),
                err_tx,
            )
            .run(),
        );

        tokio::time::sleep(Duration::from_millis(3200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = task.calls();
        let expected: Vec<Call> = (-3..3).map(|s| (Some(at(s)), at(s + 1))).collect();
        assert_eq!(calls.len(), 6, "3 backfill windows plus 3 live windows");
        assert_eq!(calls, expected);
        assert_eq!(task.last_processed_height(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_window_overrun_runs_overdue_windows_back_to_back() {
        let mut slow = RecordingTask::new("slow-window");
        slow.work = Duration::from_millis(2500);
        let task = Arc::new(slow);
        let cancel = CancellationToken::new();
        let (err_tx, _err_rx) = mpsc::channel(1);
        let handle = tokio::spawn(
            TimeWindowScheduler::new(
                task.clone(),
                Duration::from_secs(1),
                base(),
                Arc::new(TokioClock::new(base())),
                cancel.clone(),
                err_tx,
            )
            .run(),
        );

        // [0,1) runs 1s..3.5s, [1,2) 3.5s..6s, [2,3) from 6s. No window is skipped.
        tokio::time::sleep(Duration::from_millis(6200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let expected: Vec<Call> = (0..3).map(|s| (Some(at(s)), at(s + 1))).collect();
        assert_eq!(task.calls(), expected);
    }

    struct ExplodingTask;

    #[async_trait]
    impl Task for ExplodingTask {
        fn name(&self) -> &str {
            "exploding"
        }

        async fn execute(&self, _start: Option<DateTime<Utc>>, _end: DateTime<Utc>) -> anyhow::Result<()> {
            panic!("reserve table corrupted");
        }

        fn last_processed_height(&self) -> Height {
            0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_reported_with_its_task_name() {
        let healthy = Arc::new(RecordingTask::new("healthy"));
        let cancel = CancellationToken::new();
        let mut runner = TaskRunner::new(cancel.clone()).with_clock(Arc::new(TokioClock::new(base())));
        runner
            .add(healthy.clone(), Schedule::Interval(Duration::from_secs(10)))
            .add(Arc::new(ExplodingTask), Schedule::Interval(Duration::from_secs(1)));

        match runner.run().await {
            Err(SchedulerError::Panicked { task, reason }) => {
                assert_eq!(task, "exploding");
                assert!(reason.contains("reserve table corrupted"));
            }
            other => panic!("expected panic error, got {:?}", other),
        }
        assert!(cancel.is_cancelled());
        assert!(healthy.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_error_cancels_every_task() {
        let mut failing = RecordingTask::new("failing");
        failing.fail_on_call = Some(2);
        let failing = Arc::new(failing);
        let healthy = Arc::new(RecordingTask::new("healthy"));

        let cancel = CancellationToken::new();
        let mut runner = TaskRunner::new(cancel.clone()).with_clock(Arc::new(TokioClock::new(base())));
        runner
            .add(failing.clone(), Schedule::Interval(Duration::from_secs(1)))
            .add(healthy.clone(), Schedule::Interval(Duration::from_secs(10)));

        let result = runner.run().await;
        match result {
            Err(SchedulerError::Task { task, error }) => {
                assert_eq!(task, "failing");
                assert!(error.to_string().contains("boom on call 2"));
            }
            other => panic!("expected task error, got {:?}", other),
        }
        assert!(cancel.is_cancelled());
        assert_eq!(failing.calls().len(), 2);
        // The healthy task's first tick (10s) never arrives before cancellation.
        assert!(healthy.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation_is_clean_shutdown() {
        let task = Arc::new(RecordingTask::new("router"));
        let cancel = CancellationToken::new();
        let mut runner = TaskRunner::new(cancel.clone()).with_clock(Arc::new(TokioClock::new(base())));
        runner.add(task.clone(), Schedule::Interval(Duration::from_secs(1)));

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            cancel.cancel();
        });

        runner.run().await.unwrap();
        stopper.await.unwrap();
        assert_eq!(task.calls().len(), 1);
    }
}

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{SchedulerError, Task};
use crate::metrics;
use crate::types::Height;

/// Blocks until every parent reports `last_processed_height() >= target`.
///
/// Parents are polled every `poll_interval`. The wait ends with
/// [`SchedulerError::Cancelled`] when `cancel` fires, and with
/// [`SchedulerError::HeightGateTimeout`] once `timeout` (if any) has elapsed.
pub async fn wait_until_reaching_height(
    task: &str,
    parents: &[Arc<dyn Task>],
    target: Height,
    poll_interval: Duration,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(), SchedulerError> {
    let started = Instant::now();
    loop {
        let lagging: Vec<(&str, Height)> = parents
            .iter()
            .map(|p| (p.name(), p.last_processed_height()))
            .filter(|(_, height)| *height < target)
            .collect();
        if lagging.is_empty() {
            debug!("[{}] parents reached height {}", task, target);
            return Ok(());
        }

        let waited = started.elapsed();
        if let Some(limit) = timeout {
            if waited >= limit {
                return Err(SchedulerError::HeightGateTimeout {
                    task: task.to_string(),
                    target,
                    waited,
                });
            }
        }

        info!("[{}] waiting for height {}: lagging parents {:?}", task, target, lagging);
        metrics::increment_height_gate_waits(task);

        tokio::select! {
            _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// The declared parents of a dependent task plus the polling policy.
#[derive(Clone)]
pub struct HeightGate {
    parents: Vec<Arc<dyn Task>>,
    poll_interval: Duration,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl HeightGate {
    pub fn new(parents: Vec<Arc<dyn Task>>, poll_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            parents,
            poll_interval,
            timeout: None,
            cancel,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_parents(&self) -> bool {
        !self.parents.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn wait(&self, task: &str, target: Height) -> Result<(), SchedulerError> {
        wait_until_reaching_height(task, &self.parents, target, self.poll_interval, self.timeout, &self.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskProgress;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct Parent {
        name: String,
        progress: TaskProgress,
    }

    #[async_trait]
    impl Task for Parent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, _start: Option<DateTime<Utc>>, _end: DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }

        fn last_processed_height(&self) -> Height {
            self.progress.get()
        }
    }

    fn parent(name: &str, height: Height) -> Arc<Parent> {
        Arc::new(Parent {
            name: name.to_string(),
            progress: TaskProgress::new(height),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_immediately_when_parents_are_ahead() {
        let parents: Vec<Arc<dyn Task>> = vec![parent("lp", 12), parent("prices", 10)];
        let started = Instant::now();
        wait_until_reaching_height("stats", &parents, 10, Duration::from_secs(10), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_until_every_parent_reaches_target() {
        let fast = parent("lp", 100);
        let slow = parent("prices", 5);
        let parents: Vec<Arc<dyn Task>> = vec![fast, slow.clone()];

        let catch_up = {
            let slow = slow.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(25)).await;
                slow.progress.advance(42);
            })
        };

        let started = Instant::now();
        wait_until_reaching_height("stats", &parents, 42, Duration::from_secs(10), None, &CancellationToken::new())
            .await
            .unwrap();

        // Polls at 0s, 10s, 20s see the parent behind; the 30s poll sees it at 42.
        assert!(started.elapsed() >= Duration::from_secs(25));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert!(slow.last_processed_height() >= 42);
        catch_up.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let parents: Vec<Arc<dyn Task>> = vec![parent("prices", 1)];
        let cancel = CancellationToken::new();
        let gate = HeightGate::new(parents, Duration::from_secs(10), cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let result = gate.wait("stats", 50).await;
        assert!(matches!(result, Err(SchedulerError::Cancelled)));
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        canceller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_turns_wedged_parent_into_error() {
        let parents: Vec<Arc<dyn Task>> = vec![parent("prices", 1)];
        let gate = HeightGate::new(parents, Duration::from_secs(10), CancellationToken::new())
            .with_timeout(Some(Duration::from_secs(35)));

        match gate.wait("stats", 50).await {
            Err(SchedulerError::HeightGateTimeout { task, target, waited }) => {
                assert_eq!(task, "stats");
                assert_eq!(target, 50);
                assert_eq!(waited, Duration::from_secs(40));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}

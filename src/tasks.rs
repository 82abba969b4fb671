// Scheduled tasks of the price aggregator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::metrics;
use crate::price_engine::PriceEngine;
use crate::repository::LiquidityHistory;
use crate::router::Router;
use crate::scheduler::{HeightGate, Task, TaskProgress};
use crate::types::Height;

pub const ROUTER_TASK: &str = "router";
pub const PRICE_TASK: &str = "prices";
pub const LIQUIDITY_TASK: &str = "lp-history";

/// Refreshes the route graph on every tick. Produces no height.
pub struct RouterTask {
    router: Arc<Router>,
}

impl RouterTask {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Task for RouterTask {
    fn name(&self) -> &str {
        ROUTER_TASK
    }

    async fn execute(&self, _start: Option<DateTime<Utc>>, _end: DateTime<Utc>) -> Result<()> {
        if self.router.update().await? {
            debug!("[{}] published a new route graph", ROUTER_TASK);
        }
        Ok(())
    }

    fn last_processed_height(&self) -> Height {
        0
    }
}

/// Mirrors the progress of the external reserve-snapshot writer so that the
/// price task can gate on it.
pub struct LiquidityProgressTask {
    source: Arc<dyn LiquidityHistory>,
    progress: TaskProgress,
}

impl LiquidityProgressTask {
    pub fn new(source: Arc<dyn LiquidityHistory>) -> Self {
        Self {
            source,
            progress: TaskProgress::default(),
        }
    }
}

#[async_trait]
impl Task for LiquidityProgressTask {
    fn name(&self) -> &str {
        LIQUIDITY_TASK
    }

    async fn execute(&self, _start: Option<DateTime<Utc>>, _end: DateTime<Utc>) -> Result<()> {
        let latest = self
            .source
            .latest_snapshot_height()
            .await
            .context("lp-history: latest snapshot height")?;
        if let Some(height) = latest {
            let reached = self.progress.advance(height);
            metrics::set_task_processed_height(LIQUIDITY_TASK, reached);
        }
        Ok(())
    }

    fn last_processed_height(&self) -> Height {
        self.progress.get()
    }
}

/// Prices every pending height in order until caught up.
pub struct PriceTask {
    engine: Arc<PriceEngine>,
    progress: TaskProgress,
    gate: Option<HeightGate>,
    cancel: CancellationToken,
}

impl PriceTask {
    pub fn new(engine: Arc<PriceEngine>, cancel: CancellationToken) -> Self {
        Self {
            engine,
            progress: TaskProgress::default(),
            gate: None,
            cancel,
        }
    }

    /// Waits for the gate's parents (e.g. the task supplying reserves) before
    /// pricing each height.
    pub fn with_gate(mut self, gate: HeightGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Height to continue after: the in-memory progress, the highest stored price,
    /// or just before the reference token first traded.
    async fn resume_after(&self) -> Result<Option<Height>> {
        if let Some(stored) = self.engine.curr_height().await? {
            return Ok(Some(self.progress.advance(stored)));
        }
        if self.progress.get() > 0 {
            return Ok(Some(self.progress.get()));
        }
        Ok(self
            .engine
            .first_height()
            .await?
            .map(|first| first.saturating_sub(1)))
    }
}

#[async_trait]
impl Task for PriceTask {
    fn name(&self) -> &str {
        PRICE_TASK
    }

    async fn execute(&self, _start: Option<DateTime<Utc>>, _end: DateTime<Utc>) -> Result<()> {
        let Some(mut after) = self.resume_after().await? else {
            debug!("[{}] reference token {} not traded yet", PRICE_TASK, self.engine.reference_token());
            return Ok(());
        };

        let mut priced = 0usize;
        while !self.cancel.is_cancelled() {
            let Some(height) = self.engine.next_height(after).await? else {
                break;
            };
            if let Some(gate) = &self.gate {
                gate.wait(PRICE_TASK, height)
                    .await
                    .with_context(|| format!("{}: wait for parents at height {}", PRICE_TASK, height))?;
            }
            self.engine.run(height).await?;

            let reached = self.progress.advance(height);
            metrics::set_task_processed_height(PRICE_TASK, reached);
            priced += 1;
            after = height;
        }

        if priced > 0 {
            info!("[{}] priced {} heights, now at {}", PRICE_TASK, priced, self.progress.get());
        }
        Ok(())
    }

    fn last_processed_height(&self) -> Height {
        self.progress.get()
    }
}

/// A downstream task that can tell which height a window needs from its parents.
#[async_trait]
pub trait HeightTarget: Task {
    /// Height the parents must reach before the window ending at `end` runs.
    async fn target_height(&self, end: DateTime<Utc>) -> Result<Height>;
}

/// Gates every `execute` of `T` on its parents reaching the window's target height.
pub struct HeightGated<T> {
    inner: T,
    gate: HeightGate,
}

impl<T: HeightTarget> HeightGated<T> {
    pub fn new(inner: T, gate: HeightGate) -> Self {
        Self { inner, gate }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: HeightTarget> Task for HeightGated<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Result<()> {
        let name = self.inner.name();
        let target = self
            .inner
            .target_height(end)
            .await
            .with_context(|| format!("{}: target height for window ending {}", name, end))?;
        self.gate
            .wait(name, target)
            .await
            .with_context(|| format!("{}: wait for parents at height {}", name, target))?;
        self.inner.execute(start, end).await
    }

    fn last_processed_height(&self) -> Height {
        self.inner.last_processed_height()
    }

    async fn start_timestamp(&self, hint: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.inner.start_timestamp(hint).await
    }
}

//! # Repository Interfaces
//!
//! Narrow storage contracts consumed by the router and the price engine. The
//! PostgreSQL implementation lives in [`crate::database`], the in-process one in
//! [`crate::memory_store`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::types::{Height, Pair, PriceRecord, Route, Token, TxRecord};

/// Routes expressed as token-index sequences, keyed by start index then end index.
pub type RoutesByStartThenEnd = BTreeMap<usize, BTreeMap<usize, Vec<Vec<usize>>>>;

/// Data source of the router.
#[async_trait]
pub trait PairSource: Send + Sync {
    /// Every known pair, in a stable storage order.
    async fn pairs(&self) -> Result<Vec<Pair>>;

    /// Persists a freshly built route table. `tokens[i]` is the token with index `i`.
    async fn persist_routes(&self, tokens: &[Token], routes: &RoutesByStartThenEnd) -> Result<()>;
}

/// Route table provider of the price engine.
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// When the routes ending at `reference` last changed; `None` if never built.
    async fn routes_updated_at(&self, reference: &Token) -> Result<Option<DateTime<Utc>>>;

    /// Every route ending at `reference`, grouped by source token.
    async fn routes_to(&self, reference: &Token) -> Result<HashMap<Token, Vec<Route>>>;
}

/// Data source and sink of the price engine.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Lowest height of any transaction touching `token`.
    async fn first_height_involving(&self, token: &Token) -> Result<Option<Height>>;

    /// Highest height with a recorded price in `reference` units.
    async fn current_max_priced_height(&self, reference: &Token) -> Result<Option<Height>>;

    /// Lowest height `> min_height` holding a swap, or a first provide of a pair
    /// that has no price yet.
    async fn next_unpriced_height(&self, reference: &Token, min_height: Height) -> Result<Option<Height>>;

    /// Swaps and first-provide transactions at `height`, in execution order.
    async fn swap_and_first_provide_txs_at(&self, height: Height) -> Result<Vec<TxRecord>>;

    async fn decimals_of(&self, token: &Token) -> Result<u32>;

    /// Pool reserves of the `(token_a, token_b)` pair at `height`, ordered as asked.
    /// `None` when no liquidity snapshot exists.
    async fn reserves_at(&self, height: Height, token_a: &Token, token_b: &Token) -> Result<Option<(String, String)>>;

    /// Writes every record of one height atomically. Records whose
    /// `(height, token, tx_id)` already exists are left untouched.
    async fn record_prices(&self, records: &[PriceRecord]) -> Result<()>;
}

/// Progress of the external task that snapshots pool reserves.
#[async_trait]
pub trait LiquidityHistory: Send + Sync {
    /// Highest height with a reserve snapshot.
    async fn latest_snapshot_height(&self) -> Result<Option<Height>>;
}

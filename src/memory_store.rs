//! In-process implementation of the repository traits, used for dry runs and tests.
//!
//! Reserves are point-in-time: `reserves_at(h)` answers with the latest snapshot
//! recorded at or before `h`.
//!
//! Provides are stored as [`TxKind::FirstProvide`] whether or not they were the
//! first of their pair; only the earliest provide of each token pair (by height,
//! then insertion order) is handed to the price engine.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::repository::{LiquidityHistory, PairSource, PriceStore, RouteSource, RoutesByStartThenEnd};
use crate::types::{Height, Pair, PriceRecord, Route, Token, TxKind, TxRecord};

#[derive(Default)]
struct State {
    pairs: Vec<Pair>,
    unavailable: bool,
    route_tokens: Vec<Token>,
    routes: RoutesByStartThenEnd,
    routes_updated_at: Option<DateTime<Utc>>,
    decimals: HashMap<Token, u32>,
    txs: BTreeMap<Height, Vec<TxRecord>>,
    reserves: HashMap<(Token, Token), BTreeMap<Height, (String, String)>>,
    prices: BTreeMap<(Height, Token, String), PriceRecord>,
}

fn pair_key(tx: &TxRecord) -> (Token, Token) {
    let [a, b] = &tx.legs;
    if a.token <= b.token {
        (a.token.clone(), b.token.clone())
    } else {
        (b.token.clone(), a.token.clone())
    }
}

impl State {
    /// Swaps at `height` plus provides that are the first of their pair.
    fn priceable_at(&self, height: Height) -> Vec<TxRecord> {
        let Some(txs) = self.txs.get(&height) else {
            return Vec::new();
        };
        let mut provided: HashSet<(Token, Token)> = self
            .txs
            .range(..height)
            .flat_map(|(_, txs)| txs)
            .filter(|tx| tx.kind == TxKind::FirstProvide)
            .map(pair_key)
            .collect();
        txs.iter()
            .filter(|tx| match tx.kind {
                TxKind::Swap => true,
                TxKind::FirstProvide => provided.insert(pair_key(tx)),
            })
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn available(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state();
        if state.unavailable {
            bail!("memory store unavailable");
        }
        Ok(state)
    }

    pub fn add_pair(&self, pair: Pair) {
        self.state().pairs.push(pair);
    }

    /// Makes every subsequent call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn set_decimals(&self, token: impl Into<Token>, decimals: u32) {
        self.state().decimals.insert(token.into(), decimals);
    }

    pub fn add_tx(&self, tx: TxRecord) {
        self.state().txs.entry(tx.height).or_default().push(tx);
    }

    pub fn set_reserves(
        &self,
        height: Height,
        token_a: impl Into<Token>,
        token_b: impl Into<Token>,
        reserve_a: &str,
        reserve_b: &str,
    ) {
        let (token_a, token_b) = (token_a.into(), token_b.into());
        let (key, value) = if token_a <= token_b {
            ((token_a, token_b), (reserve_a.to_string(), reserve_b.to_string()))
        } else {
            ((token_b, token_a), (reserve_b.to_string(), reserve_a.to_string()))
        };
        self.state().reserves.entry(key).or_default().insert(height, value);
    }

    /// Every recorded price, ordered by `(height, token, tx_id)`.
    pub fn prices(&self) -> Vec<PriceRecord> {
        self.state().prices.values().cloned().collect()
    }

    pub fn price_of(&self, token: &Token, height: Height) -> Option<PriceRecord> {
        self.state()
            .prices
            .values()
            .find(|r| &r.token == token && r.height == height)
            .cloned()
    }
}

#[async_trait]
impl PairSource for MemoryStore {
    async fn pairs(&self) -> Result<Vec<Pair>> {
        Ok(self.available()?.pairs.clone())
    }

    async fn persist_routes(&self, tokens: &[Token], routes: &RoutesByStartThenEnd) -> Result<()> {
        let mut state = self.available()?;
        state.route_tokens = tokens.to_vec();
        state.routes = routes.clone();
        state.routes_updated_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl RouteSource for MemoryStore {
    async fn routes_updated_at(&self, _reference: &Token) -> Result<Option<DateTime<Utc>>> {
        Ok(self.available()?.routes_updated_at)
    }

    async fn routes_to(&self, reference: &Token) -> Result<HashMap<Token, Vec<Route>>> {
        let state = self.available()?;
        let Some(end) = state.route_tokens.iter().position(|t| t == reference) else {
            return Ok(HashMap::new());
        };
        let token_at = |i: usize| {
            state
                .route_tokens
                .get(i)
                .cloned()
                .ok_or_else(|| anyhow!("route references unknown token index {}", i))
        };

        let mut out = HashMap::new();
        for (&start, by_end) in &state.routes {
            let Some(bucket) = by_end.get(&end) else {
                continue;
            };
            let routes = bucket
                .iter()
                .map(|path| path.iter().map(|&i| token_at(i)).collect::<Result<Vec<_>>>().map(Route::new))
                .collect::<Result<Vec<_>>>()?;
            out.insert(token_at(start)?, routes);
        }
        Ok(out)
    }
}

#[async_trait]
impl PriceStore for MemoryStore {
    async fn first_height_involving(&self, token: &Token) -> Result<Option<Height>> {
        let state = self.available()?;
        Ok(state
            .txs
            .iter()
            .find(|(_, txs)| txs.iter().any(|tx| tx.legs.iter().any(|leg| &leg.token == token)))
            .map(|(&height, _)| height))
    }

    async fn current_max_priced_height(&self, reference: &Token) -> Result<Option<Height>> {
        let state = self.available()?;
        Ok(state
            .prices
            .values()
            .filter(|r| &r.reference_token == reference)
            .map(|r| r.height)
            .max())
    }

    async fn next_unpriced_height(&self, _reference: &Token, min_height: Height) -> Result<Option<Height>> {
        let state = self.available()?;
        Ok(state
            .txs
            .range(min_height.saturating_add(1)..)
            .map(|(&height, _)| height)
            .find(|&height| !state.priceable_at(height).is_empty()))
    }

    async fn swap_and_first_provide_txs_at(&self, height: Height) -> Result<Vec<TxRecord>> {
        Ok(self.available()?.priceable_at(height))
    }

    async fn decimals_of(&self, token: &Token) -> Result<u32> {
        self.available()?
            .decimals
            .get(token)
            .copied()
            .ok_or_else(|| anyhow!("unknown decimals for token {}", token))
    }

    async fn reserves_at(&self, height: Height, token_a: &Token, token_b: &Token) -> Result<Option<(String, String)>> {
        let state = self.available()?;
        let flipped = token_a > token_b;
        let key = if flipped {
            (token_b.clone(), token_a.clone())
        } else {
            (token_a.clone(), token_b.clone())
        };
        Ok(state
            .reserves
            .get(&key)
            .and_then(|history| history.range(..=height).next_back())
            .map(|(_, (a, b))| if flipped { (b.clone(), a.clone()) } else { (a.clone(), b.clone()) }))
    }

    async fn record_prices(&self, records: &[PriceRecord]) -> Result<()> {
        let mut state = self.available()?;
        for record in records {
            state.prices.entry(record.key()).or_insert_with(|| record.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl LiquidityHistory for MemoryStore {
    async fn latest_snapshot_height(&self) -> Result<Option<Height>> {
        let state = self.available()?;
        Ok(state
            .reserves
            .values()
            .filter_map(|history| history.keys().next_back().copied())
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetLeg;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_reserves_are_point_in_time_and_ordered() {
        let store = MemoryStore::new();
        store.set_reserves(10, "B", "A", "200", "100");
        store.set_reserves(20, "A", "B", "150", "300");

        let a = Token::from("A");
        let b = Token::from("B");
        assert_eq!(store.reserves_at(5, &a, &b).await.unwrap(), None);
        assert_eq!(store.reserves_at(15, &a, &b).await.unwrap(), Some(("100".into(), "200".into())));
        assert_eq!(store.reserves_at(15, &b, &a).await.unwrap(), Some(("200".into(), "100".into())));
        assert_eq!(store.reserves_at(25, &a, &b).await.unwrap(), Some(("150".into(), "300".into())));
        assert_eq!(store.latest_snapshot_height().await.unwrap(), Some(20));
    }

    fn tx(tx_id: &str, height: Height, kind: TxKind, a: &str, b: &str) -> TxRecord {
        TxRecord {
            tx_id: tx_id.to_string(),
            height,
            kind,
            legs: [AssetLeg::new(a, "100", 0), AssetLeg::new(b, "-100", 0)],
        }
    }

    #[tokio::test]
    async fn test_only_first_provide_of_a_pair_is_priceable() {
        let store = MemoryStore::new();
        store.add_tx(tx("p1", 3, TxKind::FirstProvide, "A", "B"));
        store.add_tx(tx("p2", 3, TxKind::FirstProvide, "B", "A"));
        store.add_tx(tx("p3", 3, TxKind::FirstProvide, "A", "C"));
        store.add_tx(tx("p4", 5, TxKind::FirstProvide, "A", "B"));
        store.add_tx(tx("s1", 7, TxKind::Swap, "A", "B"));

        let ids = |txs: Vec<TxRecord>| txs.into_iter().map(|tx| tx.tx_id).collect::<Vec<_>>();
        assert_eq!(ids(store.swap_and_first_provide_txs_at(3).await.unwrap()), vec!["p1", "p3"]);
        assert!(store.swap_and_first_provide_txs_at(5).await.unwrap().is_empty());
        assert_eq!(ids(store.swap_and_first_provide_txs_at(7).await.unwrap()), vec!["s1"]);

        let reference = Token::from("REF");
        assert_eq!(store.next_unpriced_height(&reference, 0).await.unwrap(), Some(3));
        assert_eq!(store.next_unpriced_height(&reference, 3).await.unwrap(), Some(7));
        assert_eq!(store.next_unpriced_height(&reference, 7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_record_prices_is_at_most_once() {
        let store = MemoryStore::new();
        let record = PriceRecord::direct(7, "tx1", Token::from("A"), Decimal::ONE, Token::from("REF"));
        let mut changed = record.clone();
        changed.price = Decimal::TWO;

        store.record_prices(&[record.clone()]).await.unwrap();
        store.record_prices(&[changed]).await.unwrap();
        assert_eq!(store.prices(), vec![record]);
    }
}

//! # Price Engine
//!
//! Derives a price in reference-token units for every economically meaningful
//! swap leg at a height.
//!
//! - **Direct pricing**: one leg is the reference token; the other leg's price is
//!   the executed ratio `|reference_amount / other_amount|`.
//! - **Route pricing**: neither leg is the reference token. Each leg is priced
//!   through the candidate route with the deepest liquidity, using pool reserves
//!   at the height being priced. Routes with a hop below the reserve threshold are
//!   rejected outright.
//! - **Cross-leg correction**: when both legs got a route, the weaker leg is
//!   repriced from the swap's own executed ratio against the stronger leg.
//!
//! All records of one height are committed with a single
//! [`PriceStore::record_prices`] call.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::repository::{PriceStore, RouteSource};
use crate::types::conversions::{abs_ratio, normalize_amount, ConversionError};
use crate::types::{Height, PriceRecord, Route, Token, TxRecord};

type RouteMap = HashMap<Token, Vec<Route>>;

#[derive(Default)]
struct RouteCache {
    updated_at: Option<DateTime<Utc>>,
    routes: Arc<RouteMap>,
}

/// Price of a token through one route.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePrice {
    pub route: Route,
    pub price: Decimal,
    /// Per-hop pool depth in reference units, index 0 is the hop nearest the source.
    pub liquidity: Vec<Decimal>,
}

impl RoutePrice {
    /// Liquidity of the hop nearest the source token.
    pub fn picked_liquidity(&self) -> Decimal {
        self.liquidity.first().copied().unwrap_or(Decimal::ZERO)
    }

    /// Lexicographically greater liquidity wins; equal liquidity on the shared
    /// length falls back to the lower price.
    fn outranks(&self, other: &RoutePrice) -> bool {
        for (mine, theirs) in self.liquidity.iter().zip(&other.liquidity) {
            if mine != theirs {
                return mine > theirs;
            }
        }
        self.price < other.price
    }
}

/// A non-zero leg of an indirect swap.
struct Leg<'a> {
    token: &'a Token,
    amount: Decimal,
}

pub struct PriceEngine {
    store: Arc<dyn PriceStore>,
    route_source: Arc<dyn RouteSource>,
    reference: Token,
    min_pool_reserve: Decimal,
    decimals: DashMap<Token, u32>,
    route_cache: Mutex<RouteCache>,
    run_lock: Mutex<()>,
}

impl PriceEngine {
    /// `min_pool_reserve` is compared against decimal-normalized reserves.
    pub fn new(
        store: Arc<dyn PriceStore>,
        route_source: Arc<dyn RouteSource>,
        reference: Token,
        min_pool_reserve: Decimal,
    ) -> Self {
        Self {
            store,
            route_source,
            reference,
            min_pool_reserve,
            decimals: DashMap::new(),
            route_cache: Mutex::new(RouteCache::default()),
            run_lock: Mutex::new(()),
        }
    }

    pub fn reference_token(&self) -> &Token {
        &self.reference
    }

    /// Highest height with a recorded price.
    pub async fn curr_height(&self) -> Result<Option<Height>> {
        self.store
            .current_max_priced_height(&self.reference)
            .await
            .context("price engine: current height")
    }

    /// Next height after `min_height` that needs pricing.
    pub async fn next_height(&self, min_height: Height) -> Result<Option<Height>> {
        self.store
            .next_unpriced_height(&self.reference, min_height)
            .await
            .with_context(|| format!("price engine: next height after {}", min_height))
    }

    /// First height at which the reference token was traded.
    pub async fn first_height(&self) -> Result<Option<Height>> {
        self.store
            .first_height_involving(&self.reference)
            .await
            .context("price engine: first height")
    }

    /// Prices every swap and first provide at `height`. Returns the number of
    /// records handed to the store.
    pub async fn run(&self, height: Height) -> Result<usize> {
        let _guard = self.run_lock.lock().await;
        let started = Instant::now();

        let (txs, routes) = futures::try_join!(
            async {
                self.store
                    .swap_and_first_provide_txs_at(height)
                    .await
                    .with_context(|| format!("price engine: load txs at height {}", height))
            },
            self.routes_to_reference(),
        )?;

        let mut records = Vec::new();
        for tx in &txs {
            self.price_tx(height, tx, &routes, &mut records)
                .await
                .with_context(|| format!("price engine: tx {} at height {}", tx.tx_id, height))?;
        }

        if !records.is_empty() {
            self.store
                .record_prices(&records)
                .await
                .with_context(|| format!("price engine: record prices at height {}", height))?;
        }

        let direct = records.iter().filter(|r| r.route.is_none()).count();
        let routed = records.len() - direct;
        metrics::increment_prices_recorded("direct", direct as u64);
        metrics::increment_prices_recorded("routed", routed as u64);
        let elapsed = started.elapsed();
        metrics::record_price_height_duration(elapsed);
        info!(
            "Priced height {}: {} txs, {} direct, {} routed in {:?}",
            height,
            txs.len(),
            direct,
            routed,
            elapsed
        );
        Ok(records.len())
    }

    /// Routes ending at the reference token, reloaded only when the source reports
    /// a newer table.
    async fn routes_to_reference(&self) -> Result<Arc<RouteMap>> {
        let updated_at = self
            .route_source
            .routes_updated_at(&self.reference)
            .await
            .context("price engine: routes updated at")?;

        let mut cache = self.route_cache.lock().await;
        if updated_at > cache.updated_at {
            let routes = self
                .route_source
                .routes_to(&self.reference)
                .await
                .context("price engine: load routes")?;
            debug!("Price engine: loaded routes for {} tokens", routes.len());
            cache.routes = Arc::new(routes);
            cache.updated_at = updated_at;
        }
        Ok(cache.routes.clone())
    }

    async fn decimals_of(&self, token: &Token) -> Result<u32> {
        let cached = self.decimals.get(token).map(|d| *d);
        if let Some(decimals) = cached {
            return Ok(decimals);
        }
        let decimals = self
            .store
            .decimals_of(token)
            .await
            .with_context(|| format!("price engine: decimals of {}", token))?;
        self.decimals.insert(token.clone(), decimals);
        Ok(decimals)
    }

    async fn price_tx(
        &self,
        height: Height,
        tx: &TxRecord,
        routes: &RouteMap,
        records: &mut Vec<PriceRecord>,
    ) -> Result<()> {
        let [first, second] = &tx.legs;
        if first.token == second.token {
            debug!("tx {}: both legs are {}, skipping", tx.tx_id, first.token);
            return Ok(());
        }
        let first_amount = normalize_amount(&first.amount, first.decimals)?;
        let second_amount = normalize_amount(&second.amount, second.decimals)?;

        let reference_leg = if first.token == self.reference {
            Some((second, second_amount, first_amount))
        } else if second.token == self.reference {
            Some((first, first_amount, second_amount))
        } else {
            None
        };

        if let Some((other, other_amount, reference_amount)) = reference_leg {
            if other_amount.is_zero() || reference_amount.is_zero() {
                debug!("tx {}: zero leg, no direct price", tx.tx_id);
                return Ok(());
            }
            let price = match abs_ratio(reference_amount, other_amount) {
                Ok(price) => price,
                Err(ConversionError::Overflow) => {
                    warn!(
                        "tx {}: direct price of {} overflows ({} / {}), skipping",
                        tx.tx_id, other.token, reference_amount, other_amount
                    );
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            records.push(PriceRecord::direct(
                height,
                &tx.tx_id,
                other.token.clone(),
                price,
                self.reference.clone(),
            ));
            return Ok(());
        }

        let legs: Vec<Leg> = [(&first.token, first_amount), (&second.token, second_amount)]
            .into_iter()
            .filter(|(_, amount)| !amount.is_zero())
            .map(|(token, amount)| Leg { token, amount })
            .collect();

        let mut quotes = Vec::with_capacity(legs.len());
        for leg in &legs {
            let candidates = routes.get(leg.token).map(Vec::as_slice).unwrap_or(&[]);
            quotes.push(self.optimal_route_price(height, leg.token, candidates).await?);
        }

        if quotes.iter().all(Option::is_none) {
            info!(
                "tx {} at height {}: no usable route for {} / {}, skipping",
                tx.tx_id, height, first.token, second.token
            );
            metrics::increment_swaps_without_route();
            return Ok(());
        }

        if let ([x_leg, y_leg], [Some(x), Some(y)]) = (legs.as_slice(), quotes.as_mut_slice()) {
            reconcile(x_leg, x, y_leg, y);
        }

        for (leg, quote) in legs.iter().zip(quotes) {
            if let Some(quote) = quote {
                records.push(PriceRecord::routed(
                    height,
                    &tx.tx_id,
                    leg.token.clone(),
                    quote.price,
                    self.reference.clone(),
                    quote.route,
                ));
            }
        }
        Ok(())
    }

    /// Best-priced route of `token` among `candidates`, or `None` if every
    /// candidate is rejected.
    async fn optimal_route_price(
        &self,
        height: Height,
        token: &Token,
        candidates: &[Route],
    ) -> Result<Option<RoutePrice>> {
        let mut best: Option<RoutePrice> = None;
        for route in candidates {
            check_route_shape(route, token, &self.reference)
                .with_context(|| format!("price engine: malformed route for {}", token))?;
            let Some(candidate) = self.route_price(height, route).await? else {
                continue;
            };
            if best.as_ref().map_or(true, |b| candidate.outranks(b)) {
                best = Some(candidate);
            }
        }
        if let Some(best) = &best {
            debug!("{} priced via {} at {}", token, best.route, best.price);
        }
        Ok(best)
    }

    /// Walks `route` backward from the reference token, accumulating the price of
    /// each hop's near token and the depth of each pool in reference units.
    async fn route_price(&self, height: Height, route: &Route) -> Result<Option<RoutePrice>> {
        let tokens = &route.tokens;
        let mut price = Decimal::ONE;
        let mut liquidity = Vec::with_capacity(route.hops());

        for i in (0..route.hops()).rev() {
            let (near, far) = (&tokens[i], &tokens[i + 1]);
            let reserves = self
                .store
                .reserves_at(height, near, far)
                .await
                .with_context(|| format!("price engine: reserves of {}/{} at {}", near, far, height))?;
            let Some((raw_near, raw_far)) = reserves else {
                debug!("route {} rejected: no reserves for {}/{} at {}", route, near, far, height);
                return Ok(None);
            };
            let near_reserve = normalize_amount(&raw_near, self.decimals_of(near).await?)?;
            let far_reserve = normalize_amount(&raw_far, self.decimals_of(far).await?)?;

            if near_reserve < self.min_pool_reserve || far_reserve < self.min_pool_reserve {
                debug!(
                    "route {} rejected: {}/{} reserves {} / {} below {}",
                    route, near, far, near_reserve, far_reserve, self.min_pool_reserve
                );
                return Ok(None);
            }

            let depth = Decimal::TWO
                .checked_mul(far_reserve)
                .and_then(|v| v.checked_mul(price));
            let next_price = abs_ratio(far_reserve, near_reserve)
                .ok()
                .and_then(|ratio| price.checked_mul(ratio));
            match (depth, next_price) {
                (Some(depth), Some(next_price)) => {
                    liquidity.push(depth);
                    price = next_price;
                }
                _ => {
                    warn!("route {} rejected: arithmetic overflow at {}/{}", route, near, far);
                    return Ok(None);
                }
            }
        }

        liquidity.reverse();
        Ok(Some(RoutePrice {
            route: route.clone(),
            price,
            liquidity,
        }))
    }
}

/// A priceable route has at least one hop, runs from `token` to `reference`
/// and never revisits a token.
fn check_route_shape(route: &Route, token: &Token, reference: &Token) -> Result<()> {
    if route.hops() == 0 {
        bail!("route [{}] has no hop", route);
    }
    if route.source() != Some(token) {
        bail!("route [{}] does not start at {}", route, token);
    }
    if route.target() != Some(reference) {
        bail!("route [{}] does not end at {}", route, reference);
    }
    let mut seen = HashSet::with_capacity(route.tokens.len());
    if let Some(repeated) = route.tokens.iter().find(|t| !seen.insert(*t)) {
        bail!("route [{}] visits {} twice", route, repeated);
    }
    Ok(())
}

/// `|counter_amount / amount| * counter_price`: the leg's price implied by the
/// swap's executed ratio.
fn swap_implied_price(amount: Decimal, counter_amount: Decimal, counter_price: Decimal) -> Option<Decimal> {
    abs_ratio(counter_amount, amount)
        .ok()
        .and_then(|ratio| ratio.checked_mul(counter_price))
}

/// Makes both legs of one swap consistent with each other.
///
/// Branch order: a leg whose route is the other leg's route plus one hop is
/// repriced first; otherwise a strictly deeper leg extends the weaker leg's route.
/// Equal depth leaves both legs untouched.
fn reconcile(x_leg: &Leg, x: &mut RoutePrice, y_leg: &Leg, y: &mut RoutePrice) {
    if x.route.is_extension_of(x_leg.token, &y.route) {
        reprice(x_leg, x, y_leg, y);
        return;
    }
    if y.route.is_extension_of(y_leg.token, &x.route) {
        reprice(y_leg, y, x_leg, x);
        return;
    }

    let (x_depth, y_depth) = (x.picked_liquidity(), y.picked_liquidity());
    if x_depth > y_depth {
        extend_and_reprice(y_leg, y, x_leg, x);
    } else if y_depth > x_depth {
        extend_and_reprice(x_leg, x, y_leg, y);
    }
}

fn reprice(weak_leg: &Leg, weak: &mut RoutePrice, strong_leg: &Leg, strong: &RoutePrice) {
    match swap_implied_price(weak_leg.amount, strong_leg.amount, strong.price) {
        Some(price) => weak.price = price,
        None => warn!("{}: swap-implied price overflowed, keeping route price", weak_leg.token),
    }
}

fn extend_and_reprice(weak_leg: &Leg, weak: &mut RoutePrice, strong_leg: &Leg, strong: &RoutePrice) {
    if strong.route.contains(weak_leg.token) {
        debug!(
            "{}: {} already passes through it, keeping {}",
            weak_leg.token, strong.route, weak.route
        );
        return;
    }
    let Some(price) = swap_implied_price(weak_leg.amount, strong_leg.amount, strong.price) else {
        warn!("{}: swap-implied price overflowed, keeping route price", weak_leg.token);
        return;
    };
    weak.route = strong.route.prepended(weak_leg.token);
    weak.price = price;
}

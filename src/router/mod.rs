//! # Router Module
//!
//! Maintains the token graph whose edges are AMM pairs and caches every simple
//! path between any two tokens up to a hop limit.
//!
//! ## Snapshots
//!
//! A rebuild produces a complete, immutable [`RouteGraph`] which is published with
//! a single atomic pointer swap. Readers load the current snapshot without taking
//! any lock and keep using the snapshot they obtained, so they never observe a
//! half-built graph. Rebuilds are serialized by an async mutex.
//!
//! ## Ordering
//!
//! Tokens are indexed in order of first appearance in the pair list. Every route
//! bucket is sorted by hop count, then by the token-index sequence, which makes
//! "the first route" between two tokens stable across process restarts.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::metrics;
use crate::repository::{PairSource, RouteSource, RoutesByStartThenEnd};
use crate::types::{Pair, Route, Token};

/// Upper bound on the configurable hop limit. Path count grows exponentially with it.
pub const MAX_HOP_HARD_CAP: usize = 4;

/// Immutable route table built from one snapshot of the pair set.
#[derive(Debug, Default)]
pub struct RouteGraph {
    pairs: Vec<Pair>,
    tokens: Vec<Token>,
    index: HashMap<Token, usize>,
    routes: RoutesByStartThenEnd,
    built_at: Option<DateTime<Utc>>,
}

impl RouteGraph {
    /// Runs an exhaustive depth-first search from every token, recording each simple
    /// path of at most `max_hops` hops.
    pub fn build(pairs: Vec<Pair>, max_hops: usize) -> Self {
        let mut tokens: Vec<Token> = Vec::new();
        let mut index: HashMap<Token, usize> = HashMap::new();
        let mut adjacency: Vec<Vec<usize>> = Vec::new();

        let mut intern = |token: &Token, tokens: &mut Vec<Token>, adjacency: &mut Vec<Vec<usize>>| -> usize {
            *index.entry(token.clone()).or_insert_with(|| {
                tokens.push(token.clone());
                adjacency.push(Vec::new());
                tokens.len() - 1
            })
        };

        for pair in &pairs {
            let a = intern(&pair.token_a, &mut tokens, &mut adjacency);
            let b = intern(&pair.token_b, &mut tokens, &mut adjacency);
            if a == b {
                continue;
            }
            adjacency[a].push(b);
            adjacency[b].push(a);
        }
        for neighbours in adjacency.iter_mut() {
            neighbours.sort_unstable();
            neighbours.dedup();
        }

        let found: Vec<Vec<Vec<usize>>> = (0..tokens.len())
            .into_par_iter()
            .map(|start| {
                let mut paths = Vec::new();
                let mut path = vec![start];
                let mut visited = vec![false; adjacency.len()];
                visited[start] = true;
                collect_paths(&adjacency, &mut path, &mut visited, max_hops, &mut paths);
                paths
            })
            .collect();

        let mut routes = RoutesByStartThenEnd::new();
        for (start, paths) in found.into_iter().enumerate() {
            for path in paths {
                let end = path[path.len() - 1];
                routes.entry(start).or_default().entry(end).or_default().push(path);
            }
        }
        for by_end in routes.values_mut() {
            for bucket in by_end.values_mut() {
                bucket.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
            }
        }

        Self {
            pairs,
            tokens,
            index,
            routes,
            built_at: Some(Utc::now()),
        }
    }

    /// True if `pairs` matches the pair list this graph was built from
    /// (same length, same contracts in the same order).
    pub fn same_pairs(&self, pairs: &[Pair]) -> bool {
        self.pairs.len() == pairs.len()
            && self
                .pairs
                .iter()
                .zip(pairs)
                .all(|(cached, fresh)| cached.contract == fresh.contract)
    }

    pub fn routes(&self, from: &Token, to: &Token) -> Vec<Route> {
        let (Some(&start), Some(&end)) = (self.index.get(from), self.index.get(to)) else {
            return Vec::new();
        };
        self.routes
            .get(&start)
            .and_then(|by_end| by_end.get(&end))
            .map(|bucket| bucket.iter().map(|path| self.to_route(path)).collect())
            .unwrap_or_default()
    }

    /// Every token reachable from `from` within `hop_count` hops, sorted.
    pub fn tokens_from(&self, from: &Token, hop_count: usize) -> Vec<Token> {
        let Some(&start) = self.index.get(from) else {
            return Vec::new();
        };
        let Some(by_end) = self.routes.get(&start) else {
            return Vec::new();
        };
        let reachable: BTreeSet<&Token> = by_end
            .iter()
            .filter(|(_, bucket)| bucket.iter().any(|path| path.len() - 1 <= hop_count))
            .map(|(&end, _)| &self.tokens[end])
            .collect();
        reachable.into_iter().cloned().collect()
    }

    /// Every route ending at `to`, grouped by source token.
    pub fn routes_to(&self, to: &Token) -> HashMap<Token, Vec<Route>> {
        let Some(&end) = self.index.get(to) else {
            return HashMap::new();
        };
        self.routes
            .iter()
            .filter_map(|(&start, by_end)| {
                by_end
                    .get(&end)
                    .map(|bucket| (self.tokens[start].clone(), bucket.iter().map(|p| self.to_route(p)).collect()))
            })
            .collect()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn indexed_routes(&self) -> &RoutesByStartThenEnd {
        &self.routes
    }

    pub fn route_count(&self) -> usize {
        self.routes
            .values()
            .flat_map(|by_end| by_end.values())
            .map(|bucket| bucket.len())
            .sum()
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    fn to_route(&self, path: &[usize]) -> Route {
        Route::new(path.iter().map(|&i| self.tokens[i].clone()).collect())
    }
}

fn collect_paths(
    adjacency: &[Vec<usize>],
    path: &mut Vec<usize>,
    visited: &mut [bool],
    max_hops: usize,
    out: &mut Vec<Vec<usize>>,
) {
    if path.len() > 1 {
        out.push(path.clone());
    }
    if path.len() - 1 >= max_hops {
        return;
    }
    let current = path[path.len() - 1];
    for &next in &adjacency[current] {
        if visited[next] {
            continue;
        }
        visited[next] = true;
        path.push(next);
        collect_paths(adjacency, path, visited, max_hops, out);
        path.pop();
        visited[next] = false;
    }
}

/// Route discovery service backed by a [`PairSource`].
pub struct Router {
    source: Arc<dyn PairSource>,
    max_hop_count: usize,
    persist_routes: bool,
    snapshot: ArcSwap<RouteGraph>,
    update_lock: Mutex<()>,
}

impl Router {
    /// `max_hop_count` is clamped to `1..=MAX_HOP_HARD_CAP`.
    pub fn new(source: Arc<dyn PairSource>, max_hop_count: usize) -> Self {
        Self {
            source,
            max_hop_count: max_hop_count.clamp(1, MAX_HOP_HARD_CAP),
            persist_routes: false,
            snapshot: ArcSwap::from_pointee(RouteGraph::default()),
            update_lock: Mutex::new(()),
        }
    }

    /// Persist every rebuilt route table through [`PairSource::persist_routes`].
    pub fn with_route_persistence(mut self, enabled: bool) -> Self {
        self.persist_routes = enabled;
        self
    }

    pub fn max_hop_count(&self) -> usize {
        self.max_hop_count
    }

    /// Re-reads the pair list and rebuilds the route graph if it changed.
    ///
    /// Returns `true` when a new snapshot was published. On error the previous
    /// snapshot stays in place.
    pub async fn update(&self) -> Result<bool> {
        let _guard = self.update_lock.lock().await;

        let pairs = self.source.pairs().await.context("router: load pairs")?;
        let unchanged = {
            let current = self.snapshot.load();
            current.built_at.is_some() && current.same_pairs(&pairs)
        };
        if unchanged {
            debug!("Router: pair set unchanged ({} pairs), keeping cached routes", pairs.len());
            return Ok(false);
        }

        let pair_count = pairs.len();
        let max_hops = self.max_hop_count;
        let start = Instant::now();
        let graph = tokio::task::spawn_blocking(move || RouteGraph::build(pairs, max_hops))
            .await
            .context("router: route discovery")?;
        let elapsed = start.elapsed();

        if self.persist_routes {
            self.source
                .persist_routes(graph.tokens(), graph.indexed_routes())
                .await
                .context("router: persist routes")?;
        }

        let route_count = graph.route_count();
        info!(
            "Router rebuilt: {} pairs, {} tokens, {} routes (max {} hops) in {:?}",
            pair_count,
            graph.tokens.len(),
            route_count,
            max_hops,
            elapsed
        );
        metrics::record_router_rebuild(elapsed, route_count);

        self.snapshot.store(Arc::new(graph));
        Ok(true)
    }

    /// Latest complete route graph.
    pub fn snapshot(&self) -> Arc<RouteGraph> {
        self.snapshot.load_full()
    }

    pub fn routes(&self, from: &Token, to: &Token) -> Vec<Route> {
        self.snapshot.load().routes(from, to)
    }

    pub fn tokens_from(&self, from: &Token, hop_count: usize) -> Vec<Token> {
        self.snapshot.load().tokens_from(from, hop_count)
    }
}

#[async_trait]
impl RouteSource for Router {
    async fn routes_updated_at(&self, _reference: &Token) -> Result<Option<DateTime<Utc>>> {
        Ok(self.snapshot.load().built_at())
    }

    async fn routes_to(&self, reference: &Token) -> Result<HashMap<Token, Vec<Route>>> {
        Ok(self.snapshot.load().routes_to(reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    fn t(id: &str) -> Token {
        Token::from(id)
    }

    fn route(ids: &[&str]) -> Route {
        Route::new(ids.iter().map(|s| t(s)).collect())
    }

    fn diamond() -> Vec<Pair> {
        // A - B - D
        //  \     /
        //   C --
        vec![
            Pair::new("p1", "A", "B"),
            Pair::new("p2", "A", "C"),
            Pair::new("p3", "B", "D"),
            Pair::new("p4", "C", "D"),
        ]
    }

    #[test]
    fn test_routes_sorted_by_hops_then_index() {
        let graph = RouteGraph::build(diamond(), 3);

        let routes = graph.routes(&t("A"), &t("D"));
        assert_eq!(routes, vec![route(&["A", "B", "D"]), route(&["A", "C", "D"])]);

        let routes = graph.routes(&t("A"), &t("B"));
        assert_eq!(routes, vec![route(&["A", "B"]), route(&["A", "C", "D", "B"])]);
    }

    #[test]
    fn test_hop_limit_and_no_cycles() {
        let mut pairs = diamond();
        pairs.push(Pair::new("p5", "B", "C"));
        pairs.push(Pair::new("p6", "D", "E"));

        for max_hops in 1..=MAX_HOP_HARD_CAP {
            let graph = RouteGraph::build(pairs.clone(), max_hops);
            for from in graph.tokens() {
                for to in graph.tokens() {
                    for r in graph.routes(from, to) {
                        assert!(r.hops() <= max_hops, "{} exceeds {} hops", r, max_hops);
                        let unique: BTreeSet<&Token> = r.tokens.iter().collect();
                        assert_eq!(unique.len(), r.tokens.len(), "{} repeats a token", r);
                    }
                }
            }
        }
    }

    #[test]
    fn test_unknown_tokens_yield_nothing() {
        let graph = RouteGraph::build(diamond(), 3);
        assert!(graph.routes(&t("A"), &t("Z")).is_empty());
        assert!(graph.routes(&t("Z"), &t("A")).is_empty());
        assert!(graph.tokens_from(&t("Z"), 3).is_empty());
        assert!(graph.routes(&t("A"), &t("A")).is_empty());
    }

    #[test]
    fn test_tokens_from_respects_hop_count() {
        let mut pairs = diamond();
        pairs.push(Pair::new("p5", "D", "E"));
        let graph = RouteGraph::build(pairs, 4);

        assert_eq!(graph.tokens_from(&t("A"), 1), vec![t("B"), t("C")]);
        assert_eq!(graph.tokens_from(&t("A"), 2), vec![t("B"), t("C"), t("D")]);
        assert_eq!(graph.tokens_from(&t("A"), 3), vec![t("B"), t("C"), t("D"), t("E")]);
    }

    #[test]
    fn test_parallel_pools_collapse_to_one_edge() {
        let pairs = vec![Pair::new("p1", "A", "B"), Pair::new("p2", "B", "A")];
        let graph = RouteGraph::build(pairs, 2);
        assert_eq!(graph.routes(&t("A"), &t("B")), vec![route(&["A", "B"])]);
    }

    #[tokio::test]
    async fn test_update_is_noop_for_unchanged_pairs() {
        let store = Arc::new(MemoryStore::new());
        for pair in diamond() {
            store.add_pair(pair);
        }
        let router = Router::new(store.clone(), 3);

        assert!(router.update().await.unwrap());
        let first = router.routes(&t("A"), &t("D"));
        let snapshot = router.snapshot();

        assert!(!router.update().await.unwrap());
        assert_eq!(router.routes(&t("A"), &t("D")), first);
        assert!(Arc::ptr_eq(&snapshot, &router.snapshot()));

        store.add_pair(Pair::new("p5", "D", "E"));
        assert!(router.update().await.unwrap());
        assert_eq!(router.routes(&t("A"), &t("D")), first);
        assert_eq!(router.routes(&t("A"), &t("E"))[0], route(&["A", "B", "D", "E"]));
    }

    #[tokio::test]
    async fn test_failed_update_keeps_previous_snapshot() {
        let store = Arc::new(MemoryStore::new());
        for pair in diamond() {
            store.add_pair(pair);
        }
        let router = Router::new(store.clone(), 3);
        router.update().await.unwrap();

        store.add_pair(Pair::new("p5", "D", "E"));
        store.set_unavailable(true);
        assert!(router.update().await.is_err());
        assert!(router.routes(&t("A"), &t("E")).is_empty());
        assert_eq!(router.routes(&t("A"), &t("D")).len(), 2);

        store.set_unavailable(false);
        assert!(router.update().await.unwrap());
        assert!(!router.routes(&t("A"), &t("E")).is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_persists_routes_when_enabled() {
        let store = Arc::new(MemoryStore::new());
        for pair in diamond() {
            store.add_pair(pair);
        }
        let router = Router::new(store.clone(), 9).with_route_persistence(true);
        assert_eq!(router.max_hop_count(), MAX_HOP_HARD_CAP);
        router.update().await.unwrap();

        let routes = store.routes_to(&t("D")).await.unwrap();
        assert_eq!(routes.get(&t("A")), Some(&router.routes(&t("A"), &t("D"))));
        assert!(store.routes_updated_at(&t("D")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_router_as_route_source() {
        let store = Arc::new(MemoryStore::new());
        for pair in diamond() {
            store.add_pair(pair);
        }
        let router = Router::new(store, 2);
        assert!(router.routes_updated_at(&t("D")).await.unwrap().is_none());
        router.update().await.unwrap();

        let to_d = router.routes_to(&t("D")).await.unwrap();
        assert_eq!(to_d.len(), 3);
        assert_eq!(to_d[&t("B")], vec![route(&["B", "D"])]);
        assert!(router.routes_updated_at(&t("D")).await.unwrap().is_some());
    }
}

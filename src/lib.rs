//! # AMM Price Feed
//!
//! Synthetic on-chain price feed for tokens traded on constant-product AMMs. Every
//! token that ever traded is priced in a single reference token, one block height at
//! a time, from indexed swaps and liquidity provisions.
//!
//! ## Architecture
//!
//! ### Route Layer
//! [`router::Router`] builds a token graph from the known pairs and caches every
//! simple path up to a hop limit. Snapshots are swapped atomically so readers never
//! see a half-built graph.
//!
//! ### Pricing Layer
//! [`price_engine::PriceEngine`] prices each swap leg directly when the reference
//! token is on the other side, or through the deepest liquid route otherwise, and
//! reconciles the two legs of an indirect swap against each other.
//!
//! ### Scheduling Layer
//! [`scheduler::TaskRunner`] drives periodic tasks. Dependent tasks wait on their
//! parents through a [`scheduler::HeightGate`] before processing a height.
//!
//! ### Storage Layer
//! Storage is reached through the traits in [`repository`]. [`database::PgStore`]
//! is the PostgreSQL implementation, [`memory_store::MemoryStore`] the in-memory one.

/// Common types and amount conversions
pub mod types;

/// Storage traits consumed by the router, engine and tasks
pub mod repository;
/// PostgreSQL storage (schema bootstrap, queries, batched writes)
pub mod database;
/// In-memory storage for tests and local runs
pub mod memory_store;

/// Route discovery and cached route snapshots
pub mod router;
/// Per-height price derivation
pub mod price_engine;

/// Periodic task execution and height gating
pub mod scheduler;
/// Router, liquidity and price tasks
pub mod tasks;

/// Configuration management
pub mod settings;
/// Metrics (feature-gated behind `observability`)
pub mod metrics;

pub use price_engine::PriceEngine;
pub use router::Router;
pub use settings::Settings;
pub use types::{Height, PriceRecord, Route, Token};

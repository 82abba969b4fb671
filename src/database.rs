//! PostgreSQL implementation of the repository traits.
//!
//! Pairs, transactions, token decimals and liquidity history are written by the
//! indexing side of the pipeline; this module only reads them. Prices and
//! persisted routes are written here.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, Row};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::repository::{LiquidityHistory, PairSource, PriceStore, RouteSource, RoutesByStartThenEnd};
use crate::settings::Database;
use crate::types::{AssetLeg, Height, Pair, PriceRecord, Route, Token, TxKind, TxRecord};

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

pub const SCHEMA: &str = "price_feed";

const MIGRATION_LOCK_ID: i64 = 0x5052494345464545; // "PRICEFEE"

/// A provide counts only if no earlier provide exists for the same pair.
const PRICEABLE_TX: &str = "(t.kind = 'swap' OR (t.kind = 'provide' AND NOT EXISTS (
        SELECT 1 FROM price_feed.transactions e
        WHERE e.pair_contract = t.pair_contract AND e.kind = 'provide'
          AND (e.height, e.tx_index) < (t.height, t.tx_index))))";

pub async fn connect(settings: &Database) -> Result<DbPool> {
    // Force UTF-8 client encoding to avoid sqlx issues with non-ASCII server messages
    env::set_var("PGCLIENTENCODING", "UTF8");

    let database_url = settings
        .url
        .clone()
        .ok_or_else(|| anyhow!("database.url or DATABASE_URL must be set"))?;

    let max_attempts = settings.connect_attempts.max(1);
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&database_url)
            .await
        {
            Ok(pool) => {
                log::info!("Connected to database (attempt {}/{}).", attempt, max_attempts);
                match initialize_database(&pool).await {
                    Ok(()) => return Ok(pool),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }
        // Backoff with cap: 400ms, 800ms, ... ~12.8s
        let delay_ms = (1u64 << attempt.min(6)) * 200;
        log::warn!(
            "DB connect/init attempt {}/{} failed. Retrying in {} ms...",
            attempt,
            max_attempts,
            delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow!("Unknown DB connection error")))
}

/// Creates the schema and tables if missing, under an advisory lock.
pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&mut *tx)
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
        .execute(&mut *tx)
        .await?;
    create_tables(&mut tx).await?;

    tx.commit().await?;
    log::info!("Database schema {} ready.", SCHEMA);
    Ok(())
}

async fn create_tables(tx: &mut sqlx::Transaction<'_, Postgres>) -> Result<()> {
    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {}.pairs (
                id SERIAL PRIMARY KEY,
                contract TEXT UNIQUE NOT NULL,
                token_a TEXT NOT NULL,
                token_b TEXT NOT NULL
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.tokens (
                address TEXT PRIMARY KEY,
                decimals INTEGER NOT NULL
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.transactions (
                tx_id TEXT NOT NULL,
                height BIGINT NOT NULL,
                tx_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                pair_contract TEXT NOT NULL,
                token_a TEXT NOT NULL,
                amount_a TEXT NOT NULL,
                decimals_a INTEGER NOT NULL,
                token_b TEXT NOT NULL,
                amount_b TEXT NOT NULL,
                decimals_b INTEGER NOT NULL,
                PRIMARY KEY (height, tx_index)
            )",
            SCHEMA
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_transactions_pair ON {}.transactions (pair_contract, kind, height)",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.lp_history (
                pair_contract TEXT NOT NULL,
                height BIGINT NOT NULL,
                token_a TEXT NOT NULL,
                token_b TEXT NOT NULL,
                reserve_a TEXT NOT NULL,
                reserve_b TEXT NOT NULL,
                PRIMARY KEY (pair_contract, height)
            )",
            SCHEMA
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_lp_history_tokens ON {}.lp_history (token_a, token_b, height DESC)",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.prices (
                height BIGINT NOT NULL,
                tx_id TEXT NOT NULL,
                token TEXT NOT NULL,
                reference_token TEXT NOT NULL,
                price NUMERIC NOT NULL,
                route JSONB,
                PRIMARY KEY (height, token, tx_id)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.routes (
                start_token TEXT NOT NULL,
                end_token TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                path JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (start_token, end_token, ordinal)
            )",
            SCHEMA
        ),
    ];
    for statement in statements {
        sqlx::query(&statement).execute(&mut **tx).await?;
    }
    Ok(())
}

fn db_height(height: Height) -> Result<i64> {
    i64::try_from(height).with_context(|| format!("height {} out of range", height))
}

fn from_db_height(height: Option<i64>) -> Result<Option<Height>> {
    height
        .map(|h| Height::try_from(h).with_context(|| format!("negative height {} in storage", h)))
        .transpose()
}

/// Repository backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl PairSource for PgStore {
    async fn pairs(&self) -> Result<Vec<Pair>> {
        let rows = sqlx::query(&format!(
            "SELECT contract, token_a, token_b FROM {}.pairs ORDER BY id",
            SCHEMA
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Pair::new(
                    row.try_get::<String, _>("contract")?,
                    row.try_get::<String, _>("token_a")?,
                    row.try_get::<String, _>("token_b")?,
                ))
            })
            .collect()
    }

    async fn persist_routes(&self, tokens: &[Token], routes: &RoutesByStartThenEnd) -> Result<()> {
        let token_at = |i: usize| {
            tokens
                .get(i)
                .ok_or_else(|| anyhow!("route references unknown token index {}", i))
        };
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DELETE FROM {}.routes", SCHEMA))
            .execute(&mut *tx)
            .await?;

        let mut written = 0usize;
        for (&start, by_end) in routes {
            for (&end, bucket) in by_end {
                for (ordinal, path) in bucket.iter().enumerate() {
                    let route = Route::new(path.iter().map(|&i| token_at(i).cloned()).collect::<Result<_>>()?);
                    sqlx::query(&format!(
                        "INSERT INTO {}.routes (start_token, end_token, ordinal, path, updated_at)
                         VALUES ($1, $2, $3, $4::jsonb, $5)",
                        SCHEMA
                    ))
                    .bind(token_at(start)?.as_str())
                    .bind(token_at(end)?.as_str())
                    .bind(ordinal as i32)
                    .bind(serde_json::to_string(&route)?)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    written += 1;
                }
            }
        }

        tx.commit().await?;
        log::info!("Persisted {} routes over {} tokens.", written, tokens.len());
        Ok(())
    }
}

#[async_trait]
impl RouteSource for PgStore {
    async fn routes_updated_at(&self, reference: &Token) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(&format!(
            "SELECT MAX(updated_at) AS updated_at FROM {}.routes WHERE end_token = $1",
            SCHEMA
        ))
        .bind(reference.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("updated_at")?)
    }

    async fn routes_to(&self, reference: &Token) -> Result<HashMap<Token, Vec<Route>>> {
        let rows = sqlx::query(&format!(
            "SELECT start_token, path::text AS path FROM {}.routes
             WHERE end_token = $1 ORDER BY start_token, ordinal",
            SCHEMA
        ))
        .bind(reference.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut routes: HashMap<Token, Vec<Route>> = HashMap::new();
        for row in rows {
            let start = Token::new(row.try_get::<String, _>("start_token")?);
            let path: String = row.try_get("path")?;
            let route: Route = serde_json::from_str(&path).with_context(|| format!("malformed route {}", path))?;
            routes.entry(start).or_default().push(route);
        }
        Ok(routes)
    }
}

#[async_trait]
impl PriceStore for PgStore {
    async fn first_height_involving(&self, token: &Token) -> Result<Option<Height>> {
        let row = sqlx::query(&format!(
            "SELECT MIN(height) AS height FROM {}.transactions WHERE token_a = $1 OR token_b = $1",
            SCHEMA
        ))
        .bind(token.as_str())
        .fetch_one(&self.pool)
        .await?;
        from_db_height(row.try_get("height")?)
    }

    async fn current_max_priced_height(&self, reference: &Token) -> Result<Option<Height>> {
        let row = sqlx::query(&format!(
            "SELECT MAX(height) AS height FROM {}.prices WHERE reference_token = $1",
            SCHEMA
        ))
        .bind(reference.as_str())
        .fetch_one(&self.pool)
        .await?;
        from_db_height(row.try_get("height")?)
    }

    async fn next_unpriced_height(&self, _reference: &Token, min_height: Height) -> Result<Option<Height>> {
        let row = sqlx::query(&format!(
            "SELECT MIN(t.height) AS height FROM {}.transactions t WHERE t.height > $1 AND {}",
            SCHEMA, PRICEABLE_TX
        ))
        .bind(db_height(min_height)?)
        .fetch_one(&self.pool)
        .await?;
        from_db_height(row.try_get("height")?)
    }

    async fn swap_and_first_provide_txs_at(&self, height: Height) -> Result<Vec<TxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT t.tx_id, t.kind, t.token_a, t.amount_a, t.decimals_a, t.token_b, t.amount_b, t.decimals_b
             FROM {}.transactions t
             WHERE t.height = $1 AND {}
             ORDER BY t.tx_index",
            SCHEMA, PRICEABLE_TX
        ))
        .bind(db_height(height)?)
        .fetch_all(&self.pool)
        .await?;

        let mut txs = Vec::with_capacity(rows.len());
        for row in rows {
            let kind = match row.try_get::<String, _>("kind")?.as_str() {
                "swap" => TxKind::Swap,
                _ => TxKind::FirstProvide,
            };
            let decimals_a: i32 = row.try_get("decimals_a")?;
            let decimals_b: i32 = row.try_get("decimals_b")?;
            txs.push(TxRecord {
                tx_id: row.try_get("tx_id")?,
                height,
                kind,
                legs: [
                    AssetLeg::new(
                        row.try_get::<String, _>("token_a")?,
                        row.try_get::<String, _>("amount_a")?,
                        u32::try_from(decimals_a)?,
                    ),
                    AssetLeg::new(
                        row.try_get::<String, _>("token_b")?,
                        row.try_get::<String, _>("amount_b")?,
                        u32::try_from(decimals_b)?,
                    ),
                ],
            });
        }
        Ok(txs)
    }

    async fn decimals_of(&self, token: &Token) -> Result<u32> {
        let row = sqlx::query(&format!("SELECT decimals FROM {}.tokens WHERE address = $1", SCHEMA))
            .bind(token.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("unknown decimals for token {}", token))?;
        let decimals: i32 = row.try_get("decimals")?;
        Ok(u32::try_from(decimals)?)
    }

    async fn reserves_at(&self, height: Height, token_a: &Token, token_b: &Token) -> Result<Option<(String, String)>> {
        let row = sqlx::query(&format!(
            "SELECT token_a, reserve_a, reserve_b FROM {}.lp_history
             WHERE ((token_a = $2 AND token_b = $3) OR (token_a = $3 AND token_b = $2)) AND height <= $1
             ORDER BY height DESC, pair_contract
             LIMIT 1",
            SCHEMA
        ))
        .bind(db_height(height)?)
        .bind(token_a.as_str())
        .bind(token_b.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stored_a: String = row.try_get("token_a")?;
        let reserve_a: String = row.try_get("reserve_a")?;
        let reserve_b: String = row.try_get("reserve_b")?;
        Ok(Some(if stored_a == token_a.as_str() {
            (reserve_a, reserve_b)
        } else {
            (reserve_b, reserve_a)
        }))
    }

    async fn record_prices(&self, records: &[PriceRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            let route = record.route.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(&format!(
                "INSERT INTO {}.prices (height, tx_id, token, reference_token, price, route)
                 VALUES ($1, $2, $3, $4, $5::numeric, $6::jsonb)
                 ON CONFLICT (height, token, tx_id) DO NOTHING",
                SCHEMA
            ))
            .bind(db_height(record.height)?)
            .bind(&record.tx_id)
            .bind(record.token.as_str())
            .bind(record.reference_token.as_str())
            .bind(record.price.to_string())
            .bind(route)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LiquidityHistory for PgStore {
    async fn latest_snapshot_height(&self) -> Result<Option<Height>> {
        let row = sqlx::query(&format!("SELECT MAX(height) AS height FROM {}.lp_history", SCHEMA))
            .fetch_one(&self.pool)
            .await?;
        from_db_height(row.try_get("height")?)
    }
}

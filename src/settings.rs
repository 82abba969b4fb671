use config::{Config, ConfigError, File, FileFormat};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::router::MAX_HOP_HARD_CAP;
use crate::types::Token;

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    /// Falls back to `DATABASE_URL`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

fn default_max_connections() -> u32 {
    5
}
fn default_connect_attempts() -> u32 {
    10
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterSettings {
    #[serde(default = "default_max_hop_count")]
    pub max_hop_count: usize,
    #[serde(default = "default_false")]
    pub persist_routes: bool,
    #[serde(default = "default_router_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
}

fn default_false() -> bool {
    false
}
fn default_max_hop_count() -> usize {
    3
}
fn default_router_refresh_interval_seconds() -> u64 {
    60
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_hop_count: default_max_hop_count(),
            persist_routes: default_false(),
            refresh_interval_seconds: default_router_refresh_interval_seconds(),
        }
    }
}

impl RouterSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Price {
    /// Required, either here or through `PRICE_FEED_REFERENCE_TOKEN`.
    #[serde(default)]
    pub reference_token: String,
    /// Compared against decimal-normalized reserves.
    #[serde(default = "default_min_pool_reserve")]
    pub min_pool_reserve: Decimal,
    #[serde(default = "default_price_interval_seconds")]
    pub interval_seconds: u64,
}

fn default_min_pool_reserve() -> Decimal {
    Decimal::from(1000)
}
fn default_price_interval_seconds() -> u64 {
    10
}

impl Default for Price {
    fn default() -> Self {
        Self {
            reference_token: String::new(),
            min_pool_reserve: default_min_pool_reserve(),
            interval_seconds: default_price_interval_seconds(),
        }
    }
}

impl Price {
    pub fn reference_token(&self) -> Token {
        Token::new(self.reference_token.trim())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeightGateSettings {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// `None` waits indefinitely.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Gate pricing on the reserve-snapshot writer's progress.
    #[serde(default = "default_true")]
    pub wait_for_liquidity: bool,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_seconds() -> u64 {
    10
}

impl Default for HeightGateSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            timeout_seconds: None,
            wait_for_liquidity: default_true(),
        }
    }
}

impl HeightGateSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9000
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[default]
    #[serde(rename = "pretty")]
    Pretty,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub price: Price,
    #[serde(default)]
    pub height_gate: HeightGateSettings,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_path("Config.toml")
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder().add_source(File::with_name(path)).build()?;
        Self::finish(s.try_deserialize()?, |key| env::var(key).ok())
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::finish(s.try_deserialize()?, |_| None)
    }

    /// Applies environment overrides, clamps and validates.
    fn finish(mut settings: Self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(token) = non_empty("PRICE_FEED_REFERENCE_TOKEN") {
            settings.price.reference_token = token;
        }
        if let Some(raw) = non_empty("PRICE_FEED_MAX_HOP_COUNT") {
            settings.router.max_hop_count = raw
                .parse()
                .map_err(|e| ConfigError::Message(format!("PRICE_FEED_MAX_HOP_COUNT={}: {}", raw, e)))?;
        }
        if settings.database.url.is_none() {
            settings.database.url = non_empty("DATABASE_URL");
        }

        settings.router.max_hop_count = settings.router.max_hop_count.clamp(1, MAX_HOP_HARD_CAP);

        if settings.price.reference_token.trim().is_empty() {
            return Err(ConfigError::Message(
                "price.reference_token is required (or PRICE_FEED_REFERENCE_TOKEN)".to_string(),
            ));
        }
        if settings.price.min_pool_reserve.is_sign_negative() {
            return Err(ConfigError::Message("price.min_pool_reserve must not be negative".to_string()));
        }
        if settings.price.interval_seconds == 0
            || settings.router.refresh_interval_seconds == 0
            || settings.height_gate.poll_interval_seconds == 0
        {
            return Err(ConfigError::Message("intervals must be at least one second".to_string()));
        }
        Ok(settings)
    }
}

//! Common types shared by the router, the price engine and the storage layer.

pub mod conversions;

use serde::{Deserialize, Serialize};
use std::fmt;

use rust_decimal::Decimal;

/// Block height.
pub type Height = u64;

/// Opaque token identity (contract address or denom string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An AMM trading pair: an unordered edge between two tokens plus the pool contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub contract: String,
    pub token_a: Token,
    pub token_b: Token,
}

impl Pair {
    pub fn new(contract: impl Into<String>, token_a: impl Into<Token>, token_b: impl Into<Token>) -> Self {
        Self {
            contract: contract.into(),
            token_a: token_a.into(),
            token_b: token_b.into(),
        }
    }
}

/// An ordered token path `[t0, t1, ..., tn]`; every consecutive couple is a traded pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Route {
    pub tokens: Vec<Token>,
}

impl Route {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    /// Number of pools traversed.
    pub fn hops(&self) -> usize {
        self.tokens.len().saturating_sub(1)
    }

    pub fn source(&self) -> Option<&Token> {
        self.tokens.first()
    }

    pub fn target(&self) -> Option<&Token> {
        self.tokens.last()
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    /// Returns `[head] ++ self`, i.e. this route extended by one hop on the source side.
    pub fn prepended(&self, head: &Token) -> Route {
        let mut tokens = Vec::with_capacity(self.tokens.len() + 1);
        tokens.push(head.clone());
        tokens.extend(self.tokens.iter().cloned());
        Route { tokens }
    }

    /// True if `self == [head] ++ other`.
    pub fn is_extension_of(&self, head: &Token, other: &Route) -> bool {
        self.tokens.len() == other.tokens.len() + 1
            && self.tokens.first() == Some(head)
            && self.tokens[1..] == other.tokens[..]
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.tokens.iter().map(|t| t.as_str()).collect();
        write!(f, "{}", parts.join(" -> "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Swap,
    /// First liquidity provision of a pair that has never been priced.
    FirstProvide,
}

/// One asset delta of a transaction. `amount` is a signed integer string in base
/// units; outflows from the pool are negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLeg {
    pub token: Token,
    pub amount: String,
    pub decimals: u32,
}

impl AssetLeg {
    pub fn new(token: impl Into<Token>, amount: impl Into<String>, decimals: u32) -> Self {
        Self {
            token: token.into(),
            amount: amount.into(),
            decimals,
        }
    }
}

/// A swap or first-provide transaction with its two legs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_id: String,
    pub height: Height,
    pub kind: TxKind,
    pub legs: [AssetLeg; 2],
}

/// A derived price: `token` is worth `price` units of `reference_token` at `height`,
/// as observed in transaction `tx_id`. `route` is `None` for direct prices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub height: Height,
    pub tx_id: String,
    pub token: Token,
    pub reference_token: Token,
    pub price: Decimal,
    pub route: Option<Route>,
}

impl PriceRecord {
    pub fn direct(height: Height, tx_id: &str, token: Token, price: Decimal, reference_token: Token) -> Self {
        Self {
            height,
            tx_id: tx_id.to_string(),
            token,
            reference_token,
            price,
            route: None,
        }
    }

    pub fn routed(
        height: Height,
        tx_id: &str,
        token: Token,
        price: Decimal,
        reference_token: Token,
        route: Route,
    ) -> Self {
        Self {
            height,
            tx_id: tx_id.to_string(),
            token,
            reference_token,
            price,
            route: Some(route),
        }
    }

    /// Uniqueness key of a price record.
    pub fn key(&self) -> (Height, Token, String) {
        (self.height, self.token.clone(), self.tx_id.clone())
    }
}

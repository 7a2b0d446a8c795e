//! Shared types for the BALANCER agent.
//!
//! Assets and products form a closed set. Every cross-asset lookup goes
//! through the `PRODUCT_TABLE` below, so adding a tradable pair is a table
//! edit rather than new branching in the caches or the controller.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point scale of every native amount and price (1 coin = 1e8 units).
pub const COIN: i64 = 100_000_000;

// ---------------------------------------------------------------------------
// Assets & products
// ---------------------------------------------------------------------------

/// A currency held on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
    Ltc,
    Usd,
}

impl Asset {
    pub const ALL: &'static [Asset] = &[Asset::Btc, Asset::Eth, Asset::Ltc, Asset::Usd];

    pub fn ticker(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Ltc => "LTC",
            Asset::Usd => "USD",
        }
    }

    /// The product this asset is traded on against `base`, if any.
    pub fn trading_product(&self, base: Asset) -> Option<Product> {
        PRODUCT_TABLE
            .iter()
            .find(|p| p.base == *self && p.quote == base)
            .map(|p| p.product)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ticker())
    }
}

impl std::str::FromStr for Asset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            "LTC" => Ok(Asset::Ltc),
            "USD" => Ok(Asset::Usd),
            _ => Err(anyhow::anyhow!("Unknown asset: {s}")),
        }
    }
}

/// A traded pair on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Product {
    #[serde(rename = "ETH-BTC")]
    EthBtc,
    #[serde(rename = "LTC-BTC")]
    LtcBtc,
    #[serde(rename = "BTC-USD")]
    BtcUsd,
}

/// Quote convention of a product: its price is `quote` units per one `base`.
#[derive(Debug, Clone, Copy)]
pub struct PairSpec {
    pub product: Product,
    pub base: Asset,
    pub quote: Asset,
}

pub const PRODUCT_TABLE: &[PairSpec] = &[
    PairSpec { product: Product::EthBtc, base: Asset::Eth, quote: Asset::Btc },
    PairSpec { product: Product::LtcBtc, base: Asset::Ltc, quote: Asset::Btc },
    PairSpec { product: Product::BtcUsd, base: Asset::Btc, quote: Asset::Usd },
];

/// How a product's quoted price maps onto a requested conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `from` is the product's base asset; use the price as-is.
    Direct,
    /// `from` is the product's quote asset; use the reciprocal.
    Inverse,
}

impl Product {
    pub const ALL: &'static [Product] = &[Product::EthBtc, Product::LtcBtc, Product::BtcUsd];

    pub fn id(&self) -> &'static str {
        match self {
            Product::EthBtc => "ETH-BTC",
            Product::LtcBtc => "LTC-BTC",
            Product::BtcUsd => "BTC-USD",
        }
    }

    fn spec(&self) -> &'static PairSpec {
        // Table rows are declared in variant order.
        &PRODUCT_TABLE[*self as usize]
    }

    pub fn base(&self) -> Asset {
        self.spec().base
    }

    pub fn quote(&self) -> Asset {
        self.spec().quote
    }

    /// Find the product quoting `from` against `to`, and which way to read it.
    pub fn resolve(from: Asset, to: Asset) -> Option<(Product, Direction)> {
        PRODUCT_TABLE.iter().find_map(|p| {
            if p.base == from && p.quote == to {
                Some((p.product, Direction::Direct))
            } else if p.base == to && p.quote == from {
                Some((p.product, Direction::Inverse))
            } else {
                None
            }
        })
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A request to move `amount` native units of `asset` against the base asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderIntent {
    pub asset: Asset,
    pub side: Side,
    pub amount: i64,
}

impl fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.side, fmt_native(self.amount), self.asset)
    }
}

/// A priced limit order ready for submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedOrder {
    pub product: Product,
    pub side: Side,
    /// Native units of the product's base asset.
    pub size: i64,
    /// Native units of the product's quote asset, a multiple of the tick size.
    pub price: i64,
}

impl fmt::Display for PlacedOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @ {}",
            self.side,
            fmt_native(self.size),
            self.product,
            fmt_native(self.price),
        )
    }
}

/// Outcome of a submission the exchange actually answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderOutcome {
    Accepted { id: String, status: String },
    Rejected { reason: String },
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A funded account on the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: uuid::Uuid,
    pub currency: String,
    /// Native balance.
    pub balance: i64,
}

/// Last trade and inside quote for a product.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: Option<f64>,
    pub time: Option<String>,
}

/// Best bid/ask in native units. Either side may be missing on a thin book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Spread {
    pub bid: Option<i64>,
    pub ask: Option<i64>,
}

// ---------------------------------------------------------------------------
// Fixed-point helpers
// ---------------------------------------------------------------------------

/// Format a native amount as an 8-decimal coin string, e.g. `0.01000000`.
pub fn fmt_native(amount: i64) -> String {
    Decimal::new(amount, 8).to_string()
}

/// Parse a decimal coin string into native units, truncating toward zero.
pub fn parse_native(s: &str) -> Result<i64, BalancerError> {
    let value = Decimal::from_str(s.trim())
        .map_err(|e| BalancerError::Decode(format!("bad decimal {s:?}: {e}")))?;
    value
        .checked_mul(Decimal::from(COIN))
        .ok_or_else(|| BalancerError::Decode(format!("amount out of range: {s}")))?
        .trunc()
        .to_i64()
        .ok_or_else(|| BalancerError::Decode(format!("amount out of range: {s}")))
}

/// Convert a coin-denominated config value (e.g. `0.01`) into native units.
pub fn native_from_coins(coins: f64) -> i64 {
    (coins * COIN as f64).round() as i64
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for BALANCER.
#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate unavailable: {from} -> {to}")]
    RateUnavailable { from: Asset, to: Asset },

    #[error("Balance unavailable: {0}")]
    BalanceUnavailable(Asset),

    #[error("Exchange API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Order queue closed")]
    QueueClosed,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

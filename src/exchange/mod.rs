//! Exchange integration.
//!
//! Defines the `Exchange` trait consumed by the caches, the order worker
//! and the controller, and provides the signed REST implementation.

pub mod auth;
pub mod cache;
pub mod client;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Account, OrderOutcome, PlacedOrder, Product, Spread, Ticker};

/// Abstraction over the exchange REST API.
///
/// Reads are safe to repeat. `place_order` is not: implementors must
/// attempt it at most once per call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// All funded accounts with their native balances.
    async fn accounts(&self) -> Result<Vec<Account>>;

    /// Latest ticker for a product.
    async fn ticker(&self, product: Product) -> Result<Ticker>;

    /// Best bid and ask for a product.
    async fn book(&self, product: Product) -> Result<Spread>;

    /// Submit a post-only limit order.
    async fn place_order(&self, order: PlacedOrder) -> Result<OrderOutcome>;

    /// Cancel every open order. Returns the number cancelled.
    async fn cancel_all_orders(&self) -> Result<usize>;
}

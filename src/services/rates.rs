//! Cross rates between assets, refreshed from product tickers.
//!
//! One price is stored per product. Conversions in the other direction
//! read the reciprocal, so `rate(a, b) * rate(b, a) == 1` for any snapshot.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::Refresh;
use crate::exchange::Exchange;
use crate::types::{Asset, BalancerError, Direction, Product};

type Snapshot = Option<Arc<HashMap<Product, f64>>>;

/// Read handle over the latest rate snapshot.
#[derive(Clone)]
pub struct RateCache {
    rx: watch::Receiver<Snapshot>,
}

/// Writer half; polls every product in the table.
pub struct RateRefresher {
    exchange: Arc<dyn Exchange>,
    tx: watch::Sender<Snapshot>,
}

impl RateCache {
    pub fn new(exchange: Arc<dyn Exchange>) -> (Self, RateRefresher) {
        let (tx, rx) = watch::channel(None);
        (Self { rx }, RateRefresher { exchange, tx })
    }

    /// Build a cache pre-loaded with fixed prices.
    pub fn fixed(prices: HashMap<Product, f64>) -> Self {
        let (_tx, rx) = watch::channel(Some(Arc::new(prices)));
        Self { rx }
    }

    /// Last price of `product`, as quoted.
    pub fn product_rate(&self, product: Product) -> Option<f64> {
        self.rx.borrow().as_ref().and_then(|m| m.get(&product).copied())
    }

    /// Units of `to` per one unit of `from`.
    ///
    /// `None` for identical assets, pairs with no product, and products
    /// the last snapshot lacks.
    pub fn current_rate(&self, from: Asset, to: Asset) -> Option<f64> {
        let (product, direction) = Product::resolve(from, to)?;
        let price = self.product_rate(product)?;
        match direction {
            Direction::Direct => Some(price),
            Direction::Inverse => Some(1.0 / price),
        }
    }

    /// Convert a native amount of `from` into native units of `to`,
    /// truncating toward zero.
    pub fn convert(&self, from: Asset, to: Asset, amount: i64) -> Result<i64, BalancerError> {
        let rate = self
            .current_rate(from, to)
            .ok_or(BalancerError::RateUnavailable { from, to })?;
        Ok((amount as f64 * rate) as i64)
    }

    /// All stored product prices.
    pub fn snapshot(&self) -> Option<Arc<HashMap<Product, f64>>> {
        self.rx.borrow().clone()
    }
}

#[async_trait]
impl Refresh for RateRefresher {
    fn name(&self) -> &'static str {
        "rates"
    }

    async fn refresh(&mut self) -> Result<()> {
        let fetches = Product::ALL.iter().map(|&product| {
            let exchange = self.exchange.clone();
            async move { (product, exchange.ticker(product).await) }
        });
        let results = join_all(fetches).await;

        let mut next = self
            .tx
            .borrow()
            .as_ref()
            .map(|prev| (**prev).clone())
            .unwrap_or_default();
        let mut updated = 0usize;

        for (product, result) in results {
            match result {
                Ok(ticker) if ticker.price > 0.0 => {
                    next.insert(product, ticker.price);
                    updated += 1;
                }
                Ok(ticker) => {
                    warn!(product = %product, price = ticker.price, "Ignoring non-positive price");
                }
                Err(e) => {
                    warn!(product = %product, error = %e, "Ticker refresh failed");
                }
            }
        }

        if updated == 0 {
            anyhow::bail!("no product rate could be refreshed");
        }

        debug!(updated, total = Product::ALL.len(), "Rates refreshed");
        self.tx.send_replace(Some(Arc::new(next)));
        Ok(())
    }
}

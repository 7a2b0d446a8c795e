//! Top-of-book spreads for the products the agent trades.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::Refresh;
use crate::exchange::Exchange;
use crate::types::{Asset, Product, Spread};

type Snapshot = Option<Arc<HashMap<Product, Spread>>>;

/// Read handle over the latest spread snapshot.
#[derive(Clone)]
pub struct SpreadCache {
    rx: watch::Receiver<Snapshot>,
}

pub struct SpreadRefresher {
    exchange: Arc<dyn Exchange>,
    products: Vec<Product>,
    tx: watch::Sender<Snapshot>,
}

impl SpreadCache {
    /// Track the product each non-base managed asset trades on.
    pub fn new(
        exchange: Arc<dyn Exchange>,
        base: Asset,
        managed: &[Asset],
    ) -> (Self, SpreadRefresher) {
        let mut products: Vec<Product> = managed
            .iter()
            .filter_map(|asset| asset.trading_product(base))
            .collect();
        products.dedup();

        let (tx, rx) = watch::channel(None);
        (Self { rx }, SpreadRefresher { exchange, products, tx })
    }

    /// Build a cache pre-loaded with fixed spreads.
    pub fn fixed(spreads: HashMap<Product, Spread>) -> Self {
        let (_tx, rx) = watch::channel(Some(Arc::new(spreads)));
        Self { rx }
    }

    pub fn current_spread(&self, product: Product) -> Option<Spread> {
        self.rx.borrow().as_ref().and_then(|m| m.get(&product).copied())
    }

    pub fn current_bid(&self, product: Product) -> Option<i64> {
        self.current_spread(product).and_then(|s| s.bid)
    }

    pub fn current_ask(&self, product: Product) -> Option<i64> {
        self.current_spread(product).and_then(|s| s.ask)
    }
}

impl SpreadRefresher {
    pub fn products(&self) -> &[Product] {
        &self.products
    }
}

#[async_trait]
impl Refresh for SpreadRefresher {
    fn name(&self) -> &'static str {
        "spreads"
    }

    async fn refresh(&mut self) -> Result<()> {
        if self.products.is_empty() {
            return Ok(());
        }

        let fetches = self.products.iter().map(|&product| {
            let exchange = self.exchange.clone();
            async move { (product, exchange.book(product).await) }
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
                Ok(Spread { bid: Some(bid), ask: Some(ask) }) if bid > ask => {
                    // Crossed: keep whatever was cached before.
                    warn!(product = %product, bid, ask, "Crossed book, keeping previous spread");
                }
                Ok(spread) => {
                    next.insert(product, spread);
                    updated += 1;
                }
                Err(e) => warn!(product = %product, error = %e, "Book refresh failed"),
            }
        }

        if updated == 0 {
            anyhow::bail!("no product spread could be refreshed");
        }

        debug!(updated, total = self.products.len(), "Spreads refreshed");
        self.tx.send_replace(Some(Arc::new(next)));
        Ok(())
    }
}

//! Mock exchange for integration testing.
//!
//! Provides a deterministic `Exchange` implementation that serves known
//! balances, prices and books, records every order and cancel call, and
//! can be forced to fail. All state is in-memory and shared between
//! clones, so a test can keep a handle while the pipeline owns another.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use balancer::exchange::Exchange;
use balancer::types::*;

#[derive(Clone, Default)]
pub struct MockExchange {
    balances: Arc<Mutex<HashMap<String, i64>>>,
    prices: Arc<Mutex<HashMap<Product, f64>>>,
    books: Arc<Mutex<HashMap<Product, Spread>>>,
    orders: Arc<Mutex<Vec<PlacedOrder>>>,
    cancels: Arc<Mutex<usize>>,
    /// If set, every market-data call returns this error.
    force_error: Arc<Mutex<Option<String>>>,
    /// If set, every order is answered with a rejection carrying this reason.
    reject_with: Arc<Mutex<Option<String>>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// BTC=3, ETH=3, LTC=0 at unit ETH-BTC and LTC-BTC prices, with a
    /// one-tick-wide book around 1.0 on both products.
    pub fn unit_scenario() -> Self {
        let mock = Self::new();
        mock.set_balance("BTC", 3 * COIN);
        mock.set_balance("ETH", 3 * COIN);
        mock.set_balance("LTC", 0);
        mock.set_price(Product::EthBtc, 1.0);
        mock.set_price(Product::LtcBtc, 1.0);
        mock.set_price(Product::BtcUsd, 4000.0);
        for product in [Product::EthBtc, Product::LtcBtc] {
            mock.set_book(product, Spread { bid: Some(COIN - 1_000), ask: Some(COIN + 1_000) });
        }
        mock
    }

    pub fn set_balance(&self, currency: &str, native: i64) {
        self.balances.lock().unwrap().insert(currency.to_string(), native);
    }

    pub fn set_price(&self, product: Product, price: f64) {
        self.prices.lock().unwrap().insert(product, price);
    }

    pub fn set_book(&self, product: Product, spread: Spread) {
        self.books.lock().unwrap().insert(product, spread);
    }

    /// Force all subsequent market-data calls to return an error.
    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn reject_orders(&self, reason: &str) {
        *self.reject_with.lock().unwrap() = Some(reason.to_string());
    }

    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.orders.lock().unwrap().clone()
    }

    pub fn cancel_calls(&self) -> usize {
        *self.cancels.lock().unwrap()
    }

    fn check_error(&self) -> Result<()> {
        match self.force_error.lock().unwrap().as_ref() {
            Some(err) => Err(anyhow!("{}", err)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn accounts(&self) -> Result<Vec<Account>> {
        self.check_error()?;
        Ok(self
            .balances
            .lock()
            .unwrap()
            .iter()
            .map(|(currency, balance)| Account {
                id: Uuid::new_v4(),
                currency: currency.clone(),
                balance: *balance,
            })
            .collect())
    }

    async fn ticker(&self, product: Product) -> Result<Ticker> {
        self.check_error()?;
        let price = *self
            .prices
            .lock()
            .unwrap()
            .get(&product)
            .ok_or_else(|| anyhow!("Product not found: {product}"))?;
        Ok(Ticker { price, bid: None, ask: None, volume: None, time: None })
    }

    async fn book(&self, product: Product) -> Result<Spread> {
        self.check_error()?;
        self.books
            .lock()
            .unwrap()
            .get(&product)
            .copied()
            .ok_or_else(|| anyhow!("Product not found: {product}"))
    }

    async fn place_order(&self, order: PlacedOrder) -> Result<OrderOutcome> {
        self.orders.lock().unwrap().push(order);
        if let Some(reason) = self.reject_with.lock().unwrap().clone() {
            return Ok(OrderOutcome::Rejected { reason });
        }
        Ok(OrderOutcome::Accepted {
            id: format!("MOCK-{}", Uuid::new_v4()),
            status: "pending".to_string(),
        })
    }

    async fn cancel_all_orders(&self) -> Result<usize> {
        *self.cancels.lock().unwrap() += 1;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_serves_configured_data() {
        let mock = MockExchange::unit_scenario();
        assert_eq!(mock.accounts().await.unwrap().len(), 3);
        assert_eq!(mock.ticker(Product::EthBtc).await.unwrap().price, 1.0);
        assert!(mock.book(Product::BtcUsd).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_forced_error() {
        let mock = MockExchange::unit_scenario();
        mock.set_error("Simulated outage");
        let err = mock.accounts().await.unwrap_err();
        assert!(err.to_string().contains("Simulated outage"));

        mock.clear_error();
        assert!(mock.accounts().await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_records_orders() {
        let mock = MockExchange::new();
        let order = PlacedOrder { product: Product::EthBtc, side: Side::Buy, size: COIN, price: COIN };
        mock.place_order(order).await.unwrap();

        mock.reject_orders("post only");
        let outcome = mock.place_order(order).await.unwrap();
        assert_eq!(outcome, OrderOutcome::Rejected { reason: "post only".into() });
        assert_eq!(mock.placed_orders().len(), 2);
    }
}

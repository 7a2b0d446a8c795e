//! Account balances, refreshed from `GET /accounts`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::Refresh;
use crate::exchange::Exchange;
use crate::types::Asset;

type Snapshot = Option<Arc<HashMap<Asset, i64>>>;

/// Read handle over the latest balance snapshot.
#[derive(Clone)]
pub struct BalanceCache {
    rx: watch::Receiver<Snapshot>,
}

/// Writer half; drive it with `run_poller`.
pub struct BalanceRefresher {
    exchange: Arc<dyn Exchange>,
    tx: watch::Sender<Snapshot>,
}

impl BalanceCache {
    pub fn new(exchange: Arc<dyn Exchange>) -> (Self, BalanceRefresher) {
        let (tx, rx) = watch::channel(None);
        (Self { rx }, BalanceRefresher { exchange, tx })
    }

    /// Native balance of `asset`, or `None` if it has not been seen yet.
    pub fn native_balance(&self, asset: Asset) -> Option<i64> {
        self.rx.borrow().as_ref().and_then(|m| m.get(&asset).copied())
    }

    /// The whole last snapshot.
    pub fn snapshot(&self) -> Option<Arc<HashMap<Asset, i64>>> {
        self.rx.borrow().clone()
    }
}

#[async_trait]
impl Refresh for BalanceRefresher {
    fn name(&self) -> &'static str {
        "balances"
    }

    async fn refresh(&mut self) -> Result<()> {
        let accounts = self
            .exchange
            .accounts()
            .await
            .context("Failed to fetch accounts")?;

        let mut balances = HashMap::new();
        for account in accounts {
            match account.currency.parse::<Asset>() {
                Ok(asset) => {
                    *balances.entry(asset).or_insert(0) += account.balance;
                }
                Err(_) => debug!(currency = %account.currency, "Ignoring unmanaged currency"),
            }
        }

        self.tx.send_replace(Some(Arc::new(balances)));
        Ok(())
    }
}

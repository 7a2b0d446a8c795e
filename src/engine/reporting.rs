//! Periodic metrics snapshots.
//!
//! Posts total assets, balances and rates as JSON to a sink. Each post runs
//! detached; a slow or failing sink never holds up the next snapshot or the
//! control loop.

use anyhow::{Context, Result};
use reqwest::Client;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::controller::{compute_distribution, Distribution};
use crate::services::balances::BalanceCache;
use crate::services::rates::RateCache;
use crate::types::{Asset, Product, COIN};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    /// Total holdings valued in the base asset, in coins.
    pub total_assets: f64,
    /// `total_assets` in USD, floored to cents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_value_usd: Option<f64>,
    pub balances: BTreeMap<Asset, f64>,
    pub rates: BTreeMap<Product, f64>,
}

fn coins(native: i64) -> f64 {
    native as f64 / COIN as f64
}

/// Floor a USD amount to whole cents.
fn floor_cents(total_native: i64, usd_rate: f64) -> Option<f64> {
    let rate = Decimal::from_f64(usd_rate)?;
    let usd = Decimal::new(total_native, 8) * rate;
    ((usd * dec!(100)).floor() / dec!(100)).to_f64()
}

pub fn build_report(dist: &Distribution, base: Asset, rates: &RateCache) -> MetricsReport {
    let balances: BTreeMap<Asset, f64> = dist
        .holdings
        .iter()
        .map(|h| (h.asset, coins(h.native)))
        .collect();

    let rates_out: BTreeMap<Product, f64> = rates
        .snapshot()
        .map(|m| m.iter().map(|(p, r)| (*p, *r)).collect())
        .unwrap_or_default();

    MetricsReport {
        total_assets: coins(dist.total),
        asset_value_usd: rates
            .current_rate(base, Asset::Usd)
            .and_then(|r| floor_cents(dist.total, r)),
        balances,
        rates: rates_out,
    }
}

/// POST one report to `endpoint`.
pub async fn post_report(http: &Client, endpoint: &str, report: &MetricsReport) -> Result<()> {
    let resp = http
        .post(endpoint)
        .json(report)
        .send()
        .await
        .context("Metrics POST failed")?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Metrics sink returned {status}: {body}");
    }
    Ok(())
}

pub struct MetricsReporter {
    http: Client,
    endpoint: String,
    balances: BalanceCache,
    rates: RateCache,
    managed: Vec<Asset>,
    base: Asset,
}

impl MetricsReporter {
    pub fn new(
        endpoint: String,
        balances: BalanceCache,
        rates: RateCache,
        managed: Vec<Asset>,
        base: Asset,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build metrics HTTP client")?;
        Ok(Self { http, endpoint, balances, rates, managed, base })
    }

    pub async fn run(self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(endpoint = %self.endpoint, interval_secs = every.as_secs(), "Metrics reporter started");

        loop {
            tokio::select! {
                _ = interval.tick() => self.report_once(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Metrics reporter stopped");
    }

    fn report_once(&self) {
        let dist = match compute_distribution(&self.managed, self.base, &self.balances, &self.rates) {
            Ok(d) => d,
            Err(e) => {
                debug!(reason = %e, "Skipping metrics report");
                return;
            }
        };
        let report = build_report(&dist, self.base, &self.rates);

        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = post_report(&http, &endpoint, &report).await {
                warn!(error = %e, "Metrics report not delivered");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::controller::Holding;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn dist() -> Distribution {
        Distribution {
            holdings: vec![
                Holding { asset: Asset::Btc, native: COIN / 2, valuation: COIN / 2 },
                Holding { asset: Asset::Eth, native: 10 * COIN, valuation: COIN / 2 },
                Holding { asset: Asset::Ltc, native: 50 * COIN, valuation: COIN / 2 },
            ],
            total: 3 * COIN / 2,
            target: COIN / 2,
        }
    }

    fn rates(usd: Option<f64>) -> RateCache {
        let mut m: HashMap<Product, f64> =
            [(Product::EthBtc, 0.05), (Product::LtcBtc, 0.01)].into_iter().collect();
        if let Some(r) = usd {
            m.insert(Product::BtcUsd, r);
        }
        RateCache::fixed(m)
    }

    #[test]
    fn test_report_values() {
        let report = build_report(&dist(), Asset::Btc, &rates(Some(4321.567)));
        assert_eq!(report.total_assets, 1.5);
        // 1.5 * 4321.567 = 6482.3505 -> floored to cents
        assert_eq!(report.asset_value_usd, Some(6482.35));
        assert_eq!(report.balances[&Asset::Eth], 10.0);
        assert_eq!(report.rates[&Product::LtcBtc], 0.01);
    }

    #[test]
    fn test_usd_omitted_without_rate() {
        let report = build_report(&dist(), Asset::Btc, &rates(None));
        assert_eq!(report.asset_value_usd, None);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("assetValueUsd").is_none());
        assert_eq!(json["totalAssets"], 1.5);
        assert_eq!(json["balances"]["LTC"], 50.0);
        assert_eq!(json["rates"]["ETH-BTC"], 0.05);
    }

    #[tokio::test]
    async fn test_post_report_sends_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            while !String::from_utf8_lossy(&buf).contains("\"totalAssets\"") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            // Wait for the closing brace of the body.
            while !buf.ends_with(b"}") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });

        let report = build_report(&dist(), Asset::Btc, &rates(Some(4000.0)));
        let url = format!("http://{addr}/dweet/quietly/for/balancer");
        post_report(&Client::new(), &url, &report).await.unwrap();

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /dweet/quietly/for/balancer "));
        assert!(raw.contains("\"assetValueUsd\":6000.0"));
    }

    #[tokio::test]
    async fn test_post_report_surfaces_sink_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 4096];
            let _ = socket.read(&mut chunk).await;
            let _ = socket
                .write_all(b"HTTP/1.1 500 Oops\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy")
                .await;
        });

        let report = build_report(&dist(), Asset::Btc, &rates(None));
        let err = post_report(&Client::new(), &format!("http://{addr}/"), &report)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}

//! End-to-end pipeline tests: caches → controller → order worker → exchange.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use balancer::engine::controller::Controller;
use balancer::engine::orders::{OrderSettings, OrderWorker};
use balancer::exchange::Exchange;
use balancer::services::balances::BalanceCache;
use balancer::services::rates::RateCache;
use balancer::services::spreads::SpreadCache;
use balancer::services::{run_poller, Refresh};
use balancer::types::*;

use crate::mock_exchange::MockExchange;

const MANAGED: &[Asset] = &[Asset::Btc, Asset::Eth, Asset::Ltc];

struct Pipeline {
    controller: Controller,
    shutdown: watch::Sender<bool>,
    worker: tokio::task::JoinHandle<()>,
}

/// Wire the pipeline against `mock`, prime every cache once and start
/// the order worker.
async fn pipeline(mock: &MockExchange, dry_run: bool) -> Pipeline {
    let exchange: Arc<dyn Exchange> = Arc::new(mock.clone());

    let (balances, mut balance_refresher) = BalanceCache::new(exchange.clone());
    let (rates, mut rate_refresher) = RateCache::new(exchange.clone());
    let (spreads, mut spread_refresher) = SpreadCache::new(exchange.clone(), Asset::Btc, MANAGED);
    balance_refresher.refresh().await.unwrap();
    rate_refresher.refresh().await.unwrap();
    spread_refresher.refresh().await.unwrap();

    let settings = OrderSettings { base: Asset::Btc, min_trade: 1_000_000, tick: 1_000, dry_run };
    let (queue, worker) = OrderWorker::new(exchange.clone(), spreads, settings, 2);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(worker.run(shutdown_rx));

    let controller = Controller::new(
        exchange,
        balances,
        rates,
        queue,
        MANAGED.to_vec(),
        Asset::Btc,
        dry_run,
    );
    Pipeline { controller, shutdown, worker }
}

/// Wait until the mock has seen `n` orders.
async fn wait_for_orders(mock: &MockExchange, n: usize) -> Vec<PlacedOrder> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let orders = mock.placed_orders();
            if orders.len() >= n {
                return orders;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("orders never reached the exchange")
}

#[tokio::test]
async fn test_cycle_places_sell_before_buy() {
    let mock = MockExchange::unit_scenario();
    let mut p = pipeline(&mock, false).await;

    let report = p.controller.run_cycle().await.unwrap();
    assert_eq!(report.distribution.total, 6 * COIN);
    assert_eq!(report.distribution.target, 2 * COIN);

    let orders = wait_for_orders(&mock, 2).await;
    assert_eq!(
        orders,
        vec![
            PlacedOrder { product: Product::EthBtc, side: Side::Sell, size: COIN, price: COIN },
            PlacedOrder { product: Product::LtcBtc, side: Side::Buy, size: 2 * COIN, price: COIN },
        ]
    );
    assert_eq!(mock.cancel_calls(), 1);

    p.shutdown.send(true).unwrap();
    p.worker.await.unwrap();
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let mock = MockExchange::unit_scenario();
    let mut p = pipeline(&mock, true).await;

    let report = p.controller.run_cycle().await.unwrap();
    assert_eq!(report.intents.len(), 2);

    // Drop the controller's queue handle so the worker drains and exits.
    drop(p.controller);
    p.worker.await.unwrap();

    assert!(mock.placed_orders().is_empty());
    assert_eq!(mock.cancel_calls(), 0);
}

#[tokio::test]
async fn test_rejections_are_not_retried() {
    let mock = MockExchange::unit_scenario();
    mock.reject_orders("Post only mode");
    let mut p = pipeline(&mock, false).await;

    p.controller.run_cycle().await.unwrap();
    drop(p.controller);
    p.worker.await.unwrap();

    assert_eq!(mock.placed_orders().len(), 2);
}

#[tokio::test]
async fn test_outage_keeps_serving_last_snapshot() {
    let mock = MockExchange::unit_scenario();
    let exchange: Arc<dyn Exchange> = Arc::new(mock.clone());
    let (rates, mut refresher) = RateCache::new(exchange);
    refresher.refresh().await.unwrap();

    mock.set_error("Simulated outage");
    mock.set_price(Product::EthBtc, 2.0);
    assert!(refresher.refresh().await.is_err());
    assert_eq!(rates.current_rate(Asset::Eth, Asset::Btc), Some(1.0));

    mock.clear_error();
    refresher.refresh().await.unwrap();
    assert_eq!(rates.current_rate(Asset::Eth, Asset::Btc), Some(2.0));
}

#[tokio::test]
async fn test_cycle_aborts_before_first_poll() {
    let mock = MockExchange::unit_scenario();
    let exchange: Arc<dyn Exchange> = Arc::new(mock.clone());
    let (balances, _b) = BalanceCache::new(exchange.clone());
    let (rates, _r) = RateCache::new(exchange.clone());
    let (spreads, _s) = SpreadCache::new(exchange.clone(), Asset::Btc, MANAGED);
    let settings = OrderSettings { base: Asset::Btc, min_trade: 1_000_000, tick: 1_000, dry_run: false };
    let (queue, _worker) = OrderWorker::new(exchange.clone(), spreads, settings, 2);

    let mut controller =
        Controller::new(exchange, balances, rates, queue, MANAGED.to_vec(), Asset::Btc, false);
    let err = controller.run_cycle().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BalancerError>(),
        Some(BalancerError::BalanceUnavailable(_))
    ));
    assert!(mock.placed_orders().is_empty());
}

#[tokio::test]
async fn test_pollers_and_loop_run_until_shutdown() {
    let mock = MockExchange::unit_scenario();
    let exchange: Arc<dyn Exchange> = Arc::new(mock.clone());
    let (shutdown, shutdown_rx) = watch::channel(false);

    let (balances, balance_refresher) = BalanceCache::new(exchange.clone());
    let (rates, rate_refresher) = RateCache::new(exchange.clone());
    let (spreads, spread_refresher) = SpreadCache::new(exchange.clone(), Asset::Btc, MANAGED);

    let every = Duration::from_millis(20);
    let mut tasks = vec![
        tokio::spawn(run_poller(balance_refresher, every, shutdown_rx.clone())),
        tokio::spawn(run_poller(rate_refresher, every, shutdown_rx.clone())),
        tokio::spawn(run_poller(spread_refresher, every, shutdown_rx.clone())),
    ];

    let settings = OrderSettings { base: Asset::Btc, min_trade: 1_000_000, tick: 1_000, dry_run: false };
    let (queue, worker) = OrderWorker::new(exchange.clone(), spreads, settings, 2);
    tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));

    let mut controller =
        Controller::new(exchange, balances, rates, queue, MANAGED.to_vec(), Asset::Btc, false);
    let loop_rx = shutdown_rx.clone();
    let control = tokio::spawn(async move {
        controller.run(Duration::from_millis(50), loop_rx).await;
    });

    // The mock never fills, so every cycle re-plans the same two orders.
    wait_for_orders(&mock, 2).await;

    shutdown.send(true).unwrap();
    control.await.unwrap();
    for task in tasks {
        task.await.unwrap();
    }
    assert!(mock.cancel_calls() >= 1);
}

//! Rebalancing controller.
//!
//! Each tick values every managed holding in the base asset, computes an
//! equal-weight target and queues the trades that move each non-base
//! holding toward it. Sells are queued before buys so the base asset they
//! free up is in flight first.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::orders::OrderQueue;
use crate::exchange::Exchange;
use crate::services::balances::BalanceCache;
use crate::services::rates::RateCache;
use crate::types::{fmt_native, Asset, BalancerError, OrderIntent, Side};

// ---------------------------------------------------------------------------
// Distribution
// ---------------------------------------------------------------------------

/// One managed asset's position at cycle start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holding {
    pub asset: Asset,
    /// Native balance of `asset`.
    pub native: i64,
    /// The same balance valued in the base asset.
    pub valuation: i64,
}

/// Holdings plus the equal-weight target they are measured against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub holdings: Vec<Holding>,
    /// Sum of valuations, in base-asset native units.
    pub total: i64,
    /// `total / holdings.len()`.
    pub target: i64,
}

/// Value every managed balance in `base`.
///
/// Fails if any balance or any needed rate is missing; a partial picture
/// would skew the target.
pub fn compute_distribution(
    managed: &[Asset],
    base: Asset,
    balances: &BalanceCache,
    rates: &RateCache,
) -> Result<Distribution, BalancerError> {
    if managed.is_empty() {
        return Err(BalancerError::Config("no managed assets".into()));
    }

    let mut holdings = Vec::with_capacity(managed.len());
    for &asset in managed {
        let native = balances
            .native_balance(asset)
            .ok_or(BalancerError::BalanceUnavailable(asset))?;
        let valuation = if asset == base {
            native
        } else {
            rates.convert(asset, base, native)?
        };
        holdings.push(Holding { asset, native, valuation });
    }

    let total: i64 = holdings.iter().map(|h| h.valuation).sum();
    let target = total / holdings.len() as i64;

    Ok(Distribution { holdings, total, target })
}

/// Turn a distribution into trade intents: every sell, then every buy.
pub fn plan_intents(
    dist: &Distribution,
    base: Asset,
    rates: &RateCache,
) -> Result<Vec<OrderIntent>, BalancerError> {
    let mut sells = Vec::new();
    let mut buys = Vec::new();

    for holding in dist.holdings.iter().filter(|h| h.asset != base) {
        let diff = dist.target - holding.valuation;
        let native = rates.convert(base, holding.asset, diff)?;
        debug!(
            asset = %holding.asset,
            valuation = %fmt_native(holding.valuation),
            diff = %fmt_native(diff),
            native_diff = %fmt_native(native),
            "Rebalance diff"
        );

        if native < 0 {
            sells.push(OrderIntent { asset: holding.asset, side: Side::Sell, amount: -native });
        } else if native > 0 {
            buys.push(OrderIntent { asset: holding.asset, side: Side::Buy, amount: native });
        }
    }

    sells.extend(buys);
    Ok(sells)
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Summary of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub cancelled: usize,
    pub distribution: Distribution,
    pub intents: Vec<OrderIntent>,
}

pub struct Controller {
    exchange: Arc<dyn Exchange>,
    balances: BalanceCache,
    rates: RateCache,
    queue: OrderQueue,
    managed: Vec<Asset>,
    base: Asset,
    dry_run: bool,
    cycles: u64,
}

impl Controller {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        balances: BalanceCache,
        rates: RateCache,
        queue: OrderQueue,
        managed: Vec<Asset>,
        base: Asset,
        dry_run: bool,
    ) -> Self {
        Self { exchange, balances, rates, queue, managed, base, dry_run, cycles: 0 }
    }

    /// Run one cancel → value → plan → enqueue pass.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycles += 1;
        let cycle = self.cycles;
        debug!(cycle, "Starting cycle");

        let cancelled = if self.dry_run {
            info!("[DRY RUN] Skipping order cancel");
            0
        } else {
            self.exchange
                .cancel_all_orders()
                .await
                .context("Failed to cancel open orders")?
        };

        let distribution =
            compute_distribution(&self.managed, self.base, &self.balances, &self.rates)?;
        let intents = plan_intents(&distribution, self.base, &self.rates)?;

        for intent in &intents {
            self.queue.submit(*intent).await?;
        }

        Ok(CycleReport { cycle, cancelled, distribution, intents })
    }

    /// Run a cycle every `every` until shutdown. Cycles run inline, so a
    /// slow one delays the next tick instead of overlapping it.
    pub async fn run(&mut self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = every.as_secs(),
            base = %self.base,
            managed = ?self.managed,
            dry_run = self.dry_run,
            "Entering control loop"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_cycle().await {
                        Ok(report) => log_cycle_report(&report),
                        Err(e) => error!(cycle = self.cycles, error = %e, "Cycle aborted"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(cycles = self.cycles, "Control loop stopped");
    }
}

fn log_cycle_report(report: &CycleReport) {
    for h in &report.distribution.holdings {
        info!(
            cycle = report.cycle,
            asset = %h.asset,
            balance = %fmt_native(h.native),
            valuation = %fmt_native(h.valuation),
            "Holding"
        );
    }
    info!(
        cycle = report.cycle,
        cancelled = report.cancelled,
        total = %fmt_native(report.distribution.total),
        target = %fmt_native(report.distribution.target),
        intents = report.intents.len(),
        "Cycle complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

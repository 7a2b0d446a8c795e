//! Order execution.
//!
//! Intents flow through a bounded queue to a single worker, which prices
//! each one off the cached top of book, rounds the price onto the tick
//! grid and submits a post-only limit order. One consumer means orders
//! reach the exchange in the order they were queued.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::exchange::Exchange;
use crate::services::spreads::SpreadCache;
use crate::types::{fmt_native, Asset, BalancerError, OrderIntent, OrderOutcome, PlacedOrder, Side};

// ---------------------------------------------------------------------------
// Settings & outcomes
// ---------------------------------------------------------------------------

/// Worker parameters, all amounts in native units.
#[derive(Debug, Clone, Copy)]
pub struct OrderSettings {
    pub base: Asset,
    pub min_trade: i64,
    pub tick: i64,
    pub dry_run: bool,
}

/// Why an intent never became an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BelowMinimum,
    NotTradable,
    SpreadUnavailable,
    NonPositivePrice,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::BelowMinimum => "below minimum trade size",
            DropReason::NotTradable => "no product against base asset",
            DropReason::SpreadUnavailable => "book side unavailable",
            DropReason::NonPositivePrice => "non-positive limit price",
        };
        f.write_str(s)
    }
}

/// Terminal state of one processed intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Dropped(DropReason),
    Simulated(PlacedOrder),
    Submitted { order: PlacedOrder, id: String },
    Rejected { order: PlacedOrder, reason: String },
    Failed { order: PlacedOrder, error: String },
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Dropped(reason) => write!(f, "dropped ({reason})"),
            Disposition::Simulated(order) => write!(f, "simulated {order}"),
            Disposition::Submitted { order, id } => write!(f, "submitted {order} [{id}]"),
            Disposition::Rejected { order, reason } => write!(f, "rejected {order}: {reason}"),
            Disposition::Failed { order, error } => write!(f, "failed {order}: {error}"),
        }
    }
}

/// Round `price` to the nearest multiple of `tick`. Remainders of half a
/// tick or more round away from zero.
pub fn round_to_tick(price: i64, tick: i64) -> i64 {
    if tick <= 0 {
        return price;
    }
    let rem = price % tick;
    if rem.abs() * 2 >= tick {
        price - rem + tick * price.signum()
    } else {
        price - rem
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Producer handle for the order worker.
#[derive(Clone)]
pub struct OrderQueue {
    tx: mpsc::Sender<OrderIntent>,
}

impl OrderQueue {
    /// Enqueue an intent, waiting while the queue is full.
    pub async fn submit(&self, intent: OrderIntent) -> Result<(), BalancerError> {
        self.tx.send(intent).await.map_err(|_| BalancerError::QueueClosed)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct OrderWorker {
    exchange: Arc<dyn Exchange>,
    spreads: SpreadCache,
    settings: OrderSettings,
    rx: mpsc::Receiver<OrderIntent>,
}

impl OrderWorker {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        spreads: SpreadCache,
        settings: OrderSettings,
        capacity: usize,
    ) -> (OrderQueue, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Self { exchange, spreads, settings, rx };
        (OrderQueue { tx }, worker)
    }

    /// Consume intents until shutdown or until every queue handle is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(dry_run = self.settings.dry_run, "Order worker started");
        loop {
            tokio::select! {
                intent = self.rx.recv() => {
                    let Some(intent) = intent else { break };
                    self.process(intent).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Order worker stopped");
    }

    /// Price an intent against the current spread.
    pub fn price(&self, intent: &OrderIntent) -> Result<PlacedOrder, DropReason> {
        if intent.amount < self.settings.min_trade {
            return Err(DropReason::BelowMinimum);
        }

        let product = intent
            .asset
            .trading_product(self.settings.base)
            .ok_or(DropReason::NotTradable)?;

        let tick = self.settings.tick;
        let raw = match intent.side {
            Side::Buy => self.spreads.current_ask(product).map(|ask| ask - tick),
            Side::Sell => self.spreads.current_bid(product).map(|bid| bid + tick),
        }
        .ok_or(DropReason::SpreadUnavailable)?;

        let price = round_to_tick(raw, tick);
        if price <= 0 {
            return Err(DropReason::NonPositivePrice);
        }

        Ok(PlacedOrder { product, side: intent.side, size: intent.amount, price })
    }

    /// Take one intent to its terminal disposition.
    pub async fn process(&self, intent: OrderIntent) -> Disposition {
        let disposition = match self.price(&intent) {
            Err(reason) => {
                warn!(intent = %intent, reason = %reason, "Dropping order intent");
                Disposition::Dropped(reason)
            }
            Ok(order) if self.settings.dry_run => {
                info!(
                    product = %order.product,
                    side = %order.side,
                    size = %fmt_native(order.size),
                    price = %fmt_native(order.price),
                    "[DRY RUN] Would place order"
                );
                Disposition::Simulated(order)
            }
            Ok(order) => match self.exchange.place_order(order).await {
                Ok(OrderOutcome::Accepted { id, status }) => {
                    info!(order = %order, id = %id, status = %status, "Order accepted");
                    Disposition::Submitted { order, id }
                }
                Ok(OrderOutcome::Rejected { reason }) => {
                    warn!(order = %order, reason = %reason, "Order rejected");
                    Disposition::Rejected { order, reason }
                }
                Err(e) => {
                    warn!(order = %order, error = %e, "Order submission failed");
                    Disposition::Failed { order, error: e.to_string() }
                }
            },
        };

        info!(intent = %intent, disposition = %disposition, "Intent processed");
        disposition
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

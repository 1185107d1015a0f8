//! Rebuilding in-memory state from the exchange after a restart.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use super::Engine;
use crate::error::Result;
use crate::exchange::ExchangeOrder;
use crate::market::{CatalogAdapter, MarketDescriptor, MarketId, Side};
use crate::trading::{Leg, OrderPair, Position};

/// What a restore recovered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Positions rebuilt from holdings.
    pub positions: usize,
    /// Resting orders re-registered.
    pub orders: usize,
    /// Order pairs re-linked.
    pub pairs: usize,
    /// Holdings or orders that could not be described.
    pub skipped: usize,
}

impl Engine {
    /// Reload open positions and resting orders from the exchange's
    /// authoritative state.
    pub async fn restore(&self) -> Result<RestoreReport> {
        self.restore_at(OffsetDateTime::now_utc()).await
    }

    /// Restore as of `now`.
    #[instrument(skip(self), fields(now = now.unix_timestamp()))]
    pub async fn restore_at(&self, now: OffsetDateTime) -> Result<RestoreReport> {
        let (orders, holdings) = tokio::join!(self.account.open_orders(), self.account.positions());
        let (orders, holdings) = (orders?, holdings?);
        let mut report = RestoreReport::default();
        let mut described: HashMap<MarketId, MarketDescriptor> = HashMap::new();

        for holding in holdings {
            let market = match CatalogAdapter::describe(&holding.market) {
                Ok(market) => market,
                Err(e) => {
                    report.skipped += 1;
                    error!(
                        alert = "unrestorable_holding",
                        error = %e,
                        yes = %holding.yes_size,
                        no = %holding.no_size,
                        "Holding could not be described, manual review required"
                    );
                    continue;
                }
            };

            let yes = Leg {
                filled: holding.yes_size,
                cost: holding.yes_size * holding.yes_avg_price,
            };
            let no = Leg {
                filled: holding.no_size,
                cost: holding.no_size * holding.no_avg_price,
            };
            if yes.filled <= Decimal::ZERO && no.filled <= Decimal::ZERO {
                continue;
            }
            if self.tracker.restore(Position::restored(&market, yes, no, now)) {
                report.positions += 1;
            }
            described.insert(market.id.clone(), market);
        }

        let mut by_market: BTreeMap<MarketId, Vec<ExchangeOrder>> = BTreeMap::new();
        for order in orders {
            by_market.entry(order.market_id.clone()).or_default().push(order);
        }

        for (market_id, orders) in by_market {
            let market = match described.get(&market_id) {
                Some(market) => market.clone(),
                None => match self.catalog.get_market(&market_id).await {
                    Ok(market) => market,
                    Err(e) => {
                        report.skipped += orders.len();
                        warn!(market = %market_id, error = %e, "Resting orders for unknown market left alone");
                        continue;
                    }
                },
            };

            let mut legs: HashMap<Side, _> = HashMap::new();
            for reported in &orders {
                let order = self.ledger.restore_order(reported, market.window_end, now);
                report.orders += 1;
                legs.insert(order.side, order.id);
            }

            if let (Some(yes), Some(no)) = (legs.remove(&Side::Yes), legs.remove(&Side::No)) {
                let pair = OrderPair {
                    market: market.clone(),
                    yes,
                    no,
                };
                match self.ledger.link_pair(pair) {
                    Ok(()) => report.pairs += 1,
                    Err(e) => warn!(market = %market_id, error = %e, "Pair not re-linked"),
                }
            }
        }

        // Restored complete sets whose window already closed go straight to
        // awaiting resolution.
        self.tracker.advance_window_end(now);
        info!(
            positions = report.positions,
            orders = report.orders,
            pairs = report.pairs,
            skipped = report.skipped,
            "State restored from exchange"
        );
        Ok(report)
    }
}

//! Order ledger: every order placed for a leg, its fill state, and the pairing
//! of YES/NO orders into a candidate set.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};

use super::order::{Order, OrderId, OrderParams, OrderStatus};
use crate::error::{BotError, LedgerError, TradingError};
use crate::exchange::{ExchangeOrder, FillEvent, OrderGateway};
use crate::market::{MarketDescriptor, MarketId, Side};
use crate::metrics;
use crate::utils::{retry_with_backoff, RetryPolicy};

/// YES and NO orders placed together for one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderPair {
    /// Market the pair was placed on.
    pub market: MarketDescriptor,
    /// YES leg order.
    pub yes: OrderId,
    /// NO leg order.
    pub no: OrderId,
}

impl OrderPair {
    /// Order id for a leg.
    pub fn leg(&self, side: Side) -> &OrderId {
        match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        }
    }

    fn leg_mut(&mut self, side: Side) -> &mut OrderId {
        match side {
            Side::Yes => &mut self.yes,
            Side::No => &mut self.no,
        }
    }
}

/// A fill that advanced an order, ready for the position tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFill {
    /// Order that filled.
    pub order_id: OrderId,
    /// Market identifier.
    pub market_id: MarketId,
    /// Leg.
    pub side: Side,
    /// Newly filled size.
    pub delta: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Market window close, unix seconds.
    pub window_end: i64,
}

impl AppliedFill {
    /// Cost of this fill.
    pub fn cost(&self) -> Decimal {
        self.delta * self.price
    }
}

/// Records orders and reacts to externally delivered fills.
///
/// Never infers fills itself. Entries are locked per order; pairs per market.
pub struct OrderLedger {
    gateway: Arc<dyn OrderGateway>,
    orders: DashMap<OrderId, Order>,
    pairs: DashMap<MarketId, OrderPair>,
    retry: RetryPolicy,
}

impl OrderLedger {
    /// Create a ledger on top of an order transport.
    pub fn new(gateway: Arc<dyn OrderGateway>, retry: RetryPolicy) -> Self {
        Self {
            gateway,
            orders: DashMap::new(),
            pairs: DashMap::new(),
            retry,
        }
    }

    /// Submit one leg and record it as Pending.
    #[instrument(skip(self, market), fields(market = %market.id))]
    pub async fn submit(
        &self,
        market: &MarketDescriptor,
        side: Side,
        price: Decimal,
        size: Decimal,
        now: OffsetDateTime,
    ) -> Result<Order, TradingError> {
        let params = OrderParams::buy(market, side, price, size);
        params.validate().map_err(TradingError::InvalidParams)?;

        debug!(%side, %price, %size, "Submitting order");

        let order_id = {
            let _timer = metrics::timer_order_submit();
            retry_with_backoff(self.retry, "submit_order", || {
                self.gateway.submit_order(&params)
            })
            .await
        }
        .inspect_err(|e| {
            metrics::inc_orders_failed();
            warn!(%side, error = %e, "Order submission failed");
        })?;

        metrics::inc_orders_submitted();
        let order = Order::submitted(order_id, &params, market.window_end, now);
        self.orders.insert(order.id.clone(), order.clone());
        info!(order_id = %order.id, %side, %price, %size, "Order recorded");
        Ok(order)
    }

    /// Submit both legs and link them into a pair.
    ///
    /// If either leg fails, the other is cancelled and no pair is linked.
    #[instrument(skip(self, market), fields(market = %market.id))]
    pub async fn submit_pair(
        &self,
        market: &MarketDescriptor,
        price: Decimal,
        size: Decimal,
        now: OffsetDateTime,
    ) -> Result<OrderPair, BotError> {
        if self.is_tracked(&market.id) {
            return Err(LedgerError::DuplicatePair(market.id.clone()).into());
        }

        let (yes, no) = tokio::join!(
            self.submit(market, Side::Yes, price, size, now),
            self.submit(market, Side::No, price, size, now),
        );

        match (yes, no) {
            (Ok(yes), Ok(no)) => {
                let pair = OrderPair {
                    market: market.clone(),
                    yes: yes.id,
                    no: no.id,
                };
                self.pairs.insert(market.id.clone(), pair.clone());
                info!(yes = %pair.yes, no = %pair.no, "Order pair placed");
                Ok(pair)
            }
            (Ok(placed), Err(e)) | (Err(e), Ok(placed)) => {
                warn!(
                    order_id = %placed.id,
                    error = %e,
                    "One leg failed to submit, cancelling the other"
                );
                if let Err(cancel_err) = self.cancel(&placed.id, now).await {
                    error!(
                        alert = "orphan_leg",
                        order_id = %placed.id,
                        error = %cancel_err,
                        "Failed to cancel orphaned leg"
                    );
                }
                Err(e.into())
            }
            (Err(e), Err(_)) => Err(e.into()),
        }
    }

    /// Apply a fill notification carrying the order's cumulative filled size.
    ///
    /// Returns `None` for duplicates and stale reports.
    pub fn on_fill(
        &self,
        event: &FillEvent,
        now: OffsetDateTime,
    ) -> Result<Option<AppliedFill>, LedgerError> {
        let mut order = self
            .orders
            .get_mut(&event.order_id)
            .ok_or_else(|| LedgerError::UnknownOrder(event.order_id.clone()))?;

        let delta = order
            .apply_cumulative(event.filled_size, now)
            .inspect_err(|_| metrics::inc_fills_rejected())?;
        Ok(Self::applied(&order, delta, event.price))
    }

    /// Apply an incremental fill, for delta-only sources.
    pub fn apply_fill_delta(
        &self,
        order_id: &OrderId,
        delta: Decimal,
        price: Option<Decimal>,
        now: OffsetDateTime,
    ) -> Result<Option<AppliedFill>, LedgerError> {
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| LedgerError::UnknownOrder(order_id.clone()))?;

        let delta = order
            .apply_delta(delta, now)
            .inspect_err(|_| metrics::inc_fills_rejected())?;
        Ok(Self::applied(&order, delta, price))
    }

    fn applied(order: &Order, delta: Decimal, price: Option<Decimal>) -> Option<AppliedFill> {
        if delta.is_zero() {
            metrics::inc_fills_duplicate();
            debug!(order_id = %order.id, filled = %order.filled, "Duplicate fill ignored");
            return None;
        }
        metrics::inc_fills_applied();
        debug!(order_id = %order.id, %delta, filled = %order.filled, status = %order.status, "Fill applied");
        Some(AppliedFill {
            order_id: order.id.clone(),
            market_id: order.market_id.clone(),
            side: order.side,
            delta,
            price: price.unwrap_or(order.price),
            window_end: order.window_end,
        })
    }

    /// Cancel an order. Returns false (no-op) if it was already terminal.
    pub async fn cancel(&self, order_id: &OrderId, now: OffsetDateTime) -> Result<bool, BotError> {
        let status = self
            .orders
            .get(order_id)
            .map(|o| o.status)
            .ok_or_else(|| LedgerError::UnknownOrder(order_id.clone()))?;
        if status.is_terminal() {
            return Ok(false);
        }

        retry_with_backoff(self.retry, "cancel_order", || {
            self.gateway.cancel_order(order_id)
        })
        .await?;

        // A fill may have completed the order while the cancel was in flight.
        let cancelled = self
            .orders
            .get_mut(order_id)
            .map(|mut o| o.cancel(now))
            .unwrap_or(false);
        if cancelled {
            metrics::inc_orders_cancelled();
            info!(%order_id, "Order cancelled");
        }
        Ok(cancelled)
    }

    /// Cancel a resting leg and resubmit its unfilled size at `price`, linking
    /// the new order into the pair.
    ///
    /// Returns `None` when the old order turned terminal first and nothing
    /// was replaced.
    #[instrument(skip(self))]
    pub async fn replace_leg(
        &self,
        market_id: &MarketId,
        side: Side,
        price: Decimal,
        now: OffsetDateTime,
    ) -> Result<Option<Order>, BotError> {
        let pair = self
            .pair(market_id)
            .ok_or_else(|| LedgerError::UnknownPair(market_id.clone()))?;
        let old_id = pair.leg(side).clone();
        if !self.cancel(&old_id, now).await? {
            return Ok(None);
        }
        let remaining = self
            .get(&old_id)
            .map(|o| o.remaining())
            .ok_or_else(|| LedgerError::UnknownOrder(old_id.clone()))?;

        let order = self
            .submit(&pair.market, side, price, remaining, now)
            .await
            .inspect_err(|e| {
                error!(
                    alert = "requote_failed",
                    order_id = %old_id,
                    %side,
                    error = %e,
                    "Leg cancelled for re-quote but resubmission failed"
                );
            })?;

        if let Some(mut pair) = self.pairs.get_mut(market_id) {
            *pair.leg_mut(side) = order.id.clone();
        }
        info!(old = %old_id, new = %order.id, %side, %price, "Leg re-quoted");
        Ok(Some(order))
    }

    /// Cancel every open order of a market. Returns how many were cancelled.
    pub async fn cancel_market(&self, market_id: &MarketId, now: OffsetDateTime) -> Result<usize, BotError> {
        let mut cancelled = 0;
        for order_id in self.open_orders_for(market_id) {
            if self.cancel(&order_id, now).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Snapshot of an order.
    pub fn get(&self, order_id: &OrderId) -> Option<Order> {
        self.orders.get(order_id).map(|o| o.clone())
    }

    /// Pair placed on a market.
    pub fn pair(&self, market_id: &MarketId) -> Option<OrderPair> {
        self.pairs.get(market_id).map(|p| p.clone())
    }

    /// Every linked pair, ordered by market.
    pub fn pairs(&self) -> Vec<OrderPair> {
        let mut pairs: Vec<OrderPair> = self.pairs.iter().map(|p| p.clone()).collect();
        pairs.sort_by(|a, b| a.market.id.cmp(&b.market.id));
        pairs
    }

    /// Whether the ledger has placed or restored anything on this market.
    pub fn is_tracked(&self, market_id: &MarketId) -> bool {
        self.pairs.contains_key(market_id)
            || self.orders.iter().any(|o| &o.market_id == market_id)
    }

    /// Orders of a market.
    pub fn orders_for(&self, market_id: &MarketId) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| &o.market_id == market_id)
            .map(|o| o.clone())
            .collect();
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        orders
    }

    fn open_orders_for(&self, market_id: &MarketId) -> Vec<OrderId> {
        self.orders
            .iter()
            .filter(|o| &o.market_id == market_id && o.status.is_open())
            .map(|o| o.id.clone())
            .collect()
    }

    /// Ids of every non-terminal order.
    pub fn open_order_ids(&self) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self
            .orders
            .iter()
            .filter(|o| o.status.is_open())
            .map(|o| o.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Open orders whose market window has closed at `now`.
    pub fn expired_open_orders(&self, now: OffsetDateTime) -> Vec<OrderId> {
        let now = now.unix_timestamp();
        self.orders
            .iter()
            .filter(|o| o.status.is_open() && o.window_end <= now)
            .map(|o| o.id.clone())
            .collect()
    }

    /// Unfilled notional of resting orders.
    pub fn reserved_notional(&self) -> Decimal {
        self.orders.iter().map(|o| o.reserved_notional()).sum()
    }

    /// Markets with at least one resting order.
    pub fn markets_with_open_orders(&self) -> Vec<MarketId> {
        let mut markets: Vec<MarketId> = self
            .orders
            .iter()
            .filter(|o| o.status.is_open())
            .map(|o| o.market_id.clone())
            .collect();
        markets.sort();
        markets.dedup();
        markets
    }

    /// Record an order reported by the exchange after a restart.
    pub fn restore_order(&self, reported: &ExchangeOrder, window_end: i64, now: OffsetDateTime) -> Order {
        let status = if reported.filled >= reported.size {
            OrderStatus::Filled
        } else if reported.filled > Decimal::ZERO {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Pending
        };
        let order = Order {
            id: reported.order_id.clone(),
            market_id: reported.market_id.clone(),
            side: reported.side,
            price: reported.price,
            size: reported.size,
            filled: reported.filled.min(reported.size),
            status,
            window_end,
            created_at: now,
            updated_at: now,
        };
        self.orders.insert(order.id.clone(), order.clone());
        order
    }

    /// Link a restored pair.
    pub fn link_pair(&self, pair: OrderPair) -> Result<(), LedgerError> {
        if self.pairs.contains_key(&pair.market.id) {
            return Err(LedgerError::DuplicatePair(pair.market.id.clone()));
        }
        self.pairs.insert(pair.market.id.clone(), pair);
        Ok(())
    }
}

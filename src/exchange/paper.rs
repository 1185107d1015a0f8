//! In-memory paper exchange.
//!
//! Implements every exchange interface without network access. Tests script
//! markets, fills, resolutions and failures; the `run` command uses it with
//! synthetic rolling windows, auto-fill and auto-resolution.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::OffsetDateTime;
use tracing::debug;

use super::{
    AccountSource, ExchangeOrder, ExchangePosition, FillEvent, FillSource, MarketSource,
    OrderGateway, RawMarket, RawResolution, Redeemer, ResolutionSource,
};
use crate::error::{CatalogError, TradingError};
use crate::market::{MarketId, Side};
use crate::trading::{OrderId, OrderParams};

/// Rolling synthetic markets for dry runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticMarkets {
    /// Asset tag.
    pub asset: String,
    /// Window length in seconds.
    pub window_seconds: i64,
    /// YES best bid.
    pub yes_bid: Decimal,
    /// YES best ask.
    pub yes_ask: Decimal,
    /// NO best bid.
    pub no_bid: Decimal,
    /// NO best ask.
    pub no_ask: Decimal,
    /// Shares at each best bid.
    pub bid_size: Decimal,
}

impl Default for SyntheticMarkets {
    fn default() -> Self {
        Self {
            asset: "btc".to_string(),
            window_seconds: 900,
            yes_bid: dec!(0.44),
            yes_ask: dec!(0.47),
            no_bid: dec!(0.45),
            no_ask: dec!(0.49),
            bid_size: dec!(100),
        }
    }
}

/// Paper exchange behavior.
#[derive(Debug, Clone, Default)]
pub struct PaperConfig {
    /// Report every polled order as fully filled.
    pub auto_fill: bool,
    /// Resolve markets this many seconds after window end.
    pub auto_resolve_after_seconds: Option<i64>,
    /// Generate the current window's market on every listing.
    pub synthetic: Option<SyntheticMarkets>,
    /// Simulated latency per call in milliseconds.
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    params: OrderParams,
    filled: Decimal,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct PaperState {
    markets: BTreeMap<String, RawMarket>,
    resolutions: HashMap<MarketId, VecDeque<Option<Side>>>,
    orders: BTreeMap<OrderId, PaperOrder>,
    next_order: u64,
    fail_submits: u32,
    rejected_sides: HashSet<Side>,
    fail_redemptions: u32,
    fail_listing: bool,
    submit_calls: u32,
    redeem_calls: u32,
    cancelled: Vec<OrderId>,
    redemptions: Vec<(MarketId, Decimal)>,
    redeemed: HashSet<MarketId>,
}

/// Paper exchange. Cloning shares state.
#[derive(Debug, Clone, Default)]
pub struct PaperExchange {
    config: PaperConfig,
    state: Arc<Mutex<PaperState>>,
}

impl PaperExchange {
    /// Create a paper exchange.
    pub fn new(config: PaperConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(PaperState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    /// Add or replace a listed market.
    pub fn add_market(&self, market: RawMarket) {
        let key = market.id.clone().unwrap_or_default();
        self.lock().markets.insert(key, market);
    }

    /// Remove a market from the listing.
    pub fn remove_market(&self, market_id: &MarketId) {
        self.lock().markets.remove(market_id.as_str());
    }

    /// Script successive resolution reports. `None` means pending; the last
    /// entry repeats forever.
    pub fn script_resolutions(&self, market_id: &MarketId, reports: Vec<Option<Side>>) {
        self.lock()
            .resolutions
            .insert(market_id.clone(), reports.into_iter().collect());
    }

    /// Resolve a market from now on.
    pub fn resolve(&self, market_id: &MarketId, winner: Side) {
        self.script_resolutions(market_id, vec![Some(winner)]);
    }

    /// Set an order's cumulative filled size.
    pub fn fill(&self, order_id: &OrderId, cumulative: Decimal) {
        if let Some(order) = self.lock().orders.get_mut(order_id) {
            order.filled = cumulative.min(order.params.size);
        }
    }

    /// Most recent order for one leg of a market.
    pub fn order_for(&self, market_id: &MarketId, side: Side) -> Option<OrderId> {
        self.lock()
            .orders
            .iter()
            .filter(|(_, o)| &o.params.market_id == market_id && o.params.side == side)
            .map(|(id, _)| id.clone())
            .last()
    }

    /// Fail the next `n` submissions with a retryable transport error.
    pub fn fail_next_submits(&self, n: u32) {
        self.lock().fail_submits = n;
    }

    /// Reject every submission for one leg.
    pub fn reject_side(&self, side: Side) {
        self.lock().rejected_sides.insert(side);
    }

    /// Fail the next `n` redemption calls.
    pub fn fail_next_redemptions(&self, n: u32) {
        self.lock().fail_redemptions = n;
    }

    /// Make the listing source unavailable.
    pub fn set_listing_down(&self, down: bool) {
        self.lock().fail_listing = down;
    }

    /// Number of submit calls, failed ones included.
    pub fn submit_calls(&self) -> u32 {
        self.lock().submit_calls
    }

    /// Number of redeem calls, failed ones included.
    pub fn redeem_calls(&self) -> u32 {
        self.lock().redeem_calls
    }

    /// Orders cancelled so far, in call order.
    pub fn cancelled_orders(&self) -> Vec<OrderId> {
        self.lock().cancelled.clone()
    }

    /// Successful redemptions, in call order.
    pub fn redemptions(&self) -> Vec<(MarketId, Decimal)> {
        self.lock().redemptions.clone()
    }

    fn synthetic_market(&self, synthetic: &SyntheticMarkets, now: i64) -> RawMarket {
        let window = synthetic.window_seconds.max(1);
        let start = now - now.rem_euclid(window);
        let id = format!("{}-updown-{}", synthetic.asset, start);
        RawMarket {
            id: Some(id.clone()),
            asset: Some(synthetic.asset.clone()),
            window_start: Some(start),
            window_end: Some(start + window),
            yes_token_id: Some(format!("{}-yes", id)),
            no_token_id: Some(format!("{}-no", id)),
            yes_bid: Some(synthetic.yes_bid.to_string()),
            yes_ask: Some(synthetic.yes_ask.to_string()),
            no_bid: Some(synthetic.no_bid.to_string()),
            no_ask: Some(synthetic.no_ask.to_string()),
            yes_bid_size: Some(synthetic.bid_size.to_string()),
            no_bid_size: Some(synthetic.bid_size.to_string()),
            fetched_at: Some(now),
        }
    }

    fn auto_resolution(&self, state: &PaperState, market_id: &MarketId) -> Option<Side> {
        let delay = self.config.auto_resolve_after_seconds?;
        let market = state.markets.get(market_id.as_str())?;
        let end = market.window_end?;
        if OffsetDateTime::now_utc().unix_timestamp() < end + delay {
            return None;
        }
        // Deterministic coin flip on the window.
        Some(if (end / 60) % 2 == 0 { Side::Yes } else { Side::No })
    }
}

#[async_trait]
impl MarketSource for PaperExchange {
    async fn list_markets(&self) -> Result<Vec<RawMarket>, CatalogError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        if state.fail_listing {
            return Err(CatalogError::Unavailable("paper listing down".to_string()));
        }

        if let Some(synthetic) = &self.config.synthetic {
            let market = self.synthetic_market(synthetic, OffsetDateTime::now_utc().unix_timestamp());
            state
                .markets
                .insert(market.id.clone().unwrap_or_default(), market.clone());
            return Ok(vec![market]);
        }

        Ok(state.markets.values().cloned().collect())
    }

    async fn get_market(&self, market_id: &MarketId) -> Result<RawMarket, CatalogError> {
        self.simulate_latency().await;
        self.lock()
            .markets
            .get(market_id.as_str())
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(market_id.to_string()))
    }
}

#[async_trait]
impl ResolutionSource for PaperExchange {
    async fn resolution(&self, market_id: &MarketId) -> Result<RawResolution, CatalogError> {
        self.simulate_latency().await;
        let mut state = self.lock();

        let scripted = state.resolutions.get_mut(market_id).and_then(|reports| {
            if reports.len() > 1 {
                reports.pop_front()
            } else {
                reports.front().copied()
            }
        });
        let report = match scripted {
            Some(report) => report,
            None => self.auto_resolution(&state, market_id),
        };

        Ok(match report {
            Some(winner) => RawResolution::resolved(market_id, winner),
            None => RawResolution::pending(market_id),
        })
    }
}

#[async_trait]
impl OrderGateway for PaperExchange {
    async fn submit_order(&self, params: &OrderParams) -> Result<OrderId, TradingError> {
        self.simulate_latency().await;
        params.validate().map_err(TradingError::InvalidParams)?;

        let mut state = self.lock();
        state.submit_calls += 1;
        if state.fail_submits > 0 {
            state.fail_submits -= 1;
            return Err(TradingError::SubmissionFailed("paper submit failure".to_string()));
        }
        if state.rejected_sides.contains(&params.side) {
            return Err(TradingError::OrderRejected {
                reason: format!("paper rejects {} orders", params.side),
            });
        }

        state.next_order += 1;
        let order_id = OrderId::new(format!("paper-{:06}", state.next_order));
        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                params: params.clone(),
                filled: Decimal::ZERO,
                cancelled: false,
            },
        );
        debug!(order_id = %order_id, market = %params.market_id, side = %params.side, "Paper order accepted");
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), TradingError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        match state.orders.get_mut(order_id) {
            Some(order) => {
                order.cancelled = true;
                state.cancelled.push(order_id.clone());
                Ok(())
            }
            None => Err(TradingError::CancelFailed {
                order_id: order_id.to_string(),
                reason: "unknown order".to_string(),
            }),
        }
    }
}

#[async_trait]
impl FillSource for PaperExchange {
    async fn poll_fills(&self, order_ids: &[OrderId]) -> Result<Vec<FillEvent>, TradingError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        let auto_fill = self.config.auto_fill;

        let mut events = Vec::new();
        for order_id in order_ids {
            let Some(order) = state.orders.get_mut(order_id) else {
                continue;
            };
            if auto_fill && !order.cancelled {
                order.filled = order.params.size;
            }
            if order.filled > Decimal::ZERO {
                events.push(FillEvent {
                    order_id: order_id.clone(),
                    filled_size: order.filled,
                    price: Some(order.params.price),
                });
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl Redeemer for PaperExchange {
    async fn redeem(&self, market_id: &MarketId, quantity: Decimal) -> Result<(), TradingError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.redeem_calls += 1;
        if state.fail_redemptions > 0 {
            state.fail_redemptions -= 1;
            return Err(TradingError::RedemptionFailed {
                market_id: market_id.to_string(),
                reason: "paper redemption failure".to_string(),
            });
        }
        state.redemptions.push((market_id.clone(), quantity));
        state.redeemed.insert(market_id.clone());
        Ok(())
    }
}

#[async_trait]
impl AccountSource for PaperExchange {
    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>, TradingError> {
        self.simulate_latency().await;
        let state = self.lock();
        Ok(state
            .orders
            .iter()
            .filter(|(_, o)| !o.cancelled && o.filled < o.params.size)
            .map(|(id, o)| ExchangeOrder {
                order_id: id.clone(),
                market_id: o.params.market_id.clone(),
                side: o.params.side,
                price: o.params.price,
                size: o.params.size,
                filled: o.filled,
            })
            .collect())
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>, TradingError> {
        self.simulate_latency().await;
        let state = self.lock();

        // (size, cost) per market and leg
        let mut holdings: BTreeMap<MarketId, [(Decimal, Decimal); 2]> = BTreeMap::new();
        for order in state.orders.values() {
            if order.filled <= Decimal::ZERO || state.redeemed.contains(&order.params.market_id) {
                continue;
            }
            let legs = holdings.entry(order.params.market_id.clone()).or_default();
            let leg = &mut legs[match order.params.side {
                Side::Yes => 0,
                Side::No => 1,
            }];
            leg.0 += order.filled;
            leg.1 += order.filled * order.params.price;
        }

        let avg = |(size, cost): (Decimal, Decimal)| {
            if size.is_zero() {
                Decimal::ZERO
            } else {
                cost / size
            }
        };

        Ok(holdings
            .into_iter()
            .map(|(market_id, [yes, no])| ExchangePosition {
                market: state
                    .markets
                    .get(market_id.as_str())
                    .cloned()
                    .unwrap_or_else(|| RawMarket {
                        id: Some(market_id.to_string()),
                        ..Default::default()
                    }),
                yes_size: yes.0,
                yes_avg_price: avg(yes),
                no_size: no.0,
                no_avg_price: avg(no),
            })
            .collect())
    }
}

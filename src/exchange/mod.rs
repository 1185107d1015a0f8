//! Narrow interfaces to the exchange collaborators.
//!
//! Market listing, resolution, order transport, fill delivery, settlement and
//! account state live outside the core. Everything they return is loosely typed
//! and gets validated by the catalog adapter or the ledger before use.

pub mod paper;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, TradingError};
use crate::market::{MarketId, Side};
use crate::trading::{OrderId, OrderParams};

pub use paper::{PaperConfig, PaperExchange};

/// Market payload as delivered by the listing source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMarket {
    /// Market identifier.
    #[serde(alias = "condition_id", alias = "conditionId")]
    pub id: Option<String>,
    /// Asset tag.
    pub asset: Option<String>,
    /// Window open, unix seconds.
    #[serde(alias = "start_ts")]
    pub window_start: Option<i64>,
    /// Window close, unix seconds.
    #[serde(alias = "end_ts")]
    pub window_end: Option<i64>,
    /// YES token ID.
    #[serde(alias = "up_token_id")]
    pub yes_token_id: Option<String>,
    /// NO token ID.
    #[serde(alias = "down_token_id")]
    pub no_token_id: Option<String>,
    /// YES best bid.
    pub yes_bid: Option<String>,
    /// YES best ask.
    pub yes_ask: Option<String>,
    /// NO best bid.
    pub no_bid: Option<String>,
    /// NO best ask.
    pub no_ask: Option<String>,
    /// Shares resting at the YES best bid.
    pub yes_bid_size: Option<String>,
    /// Shares resting at the NO best bid.
    pub no_bid_size: Option<String>,
    /// When the quote was taken, unix seconds.
    pub fetched_at: Option<i64>,
}

/// Resolution payload as delivered by the oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResolution {
    /// Market the payload is about.
    pub market_id: Option<String>,
    /// Whether the oracle reports the market resolved.
    #[serde(default)]
    pub resolved: bool,
    /// Winning outcome label (`yes`, `no`, `up`, `down`).
    pub winning_outcome: Option<String>,
}

impl RawResolution {
    /// Unresolved payload for a market.
    pub fn pending(market_id: &MarketId) -> Self {
        Self {
            market_id: Some(market_id.to_string()),
            resolved: false,
            winning_outcome: None,
        }
    }

    /// Resolved payload for a market.
    pub fn resolved(market_id: &MarketId, winner: Side) -> Self {
        Self {
            market_id: Some(market_id.to_string()),
            resolved: true,
            winning_outcome: Some(winner.to_string()),
        }
    }
}

/// Fill notification for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillEvent {
    /// Order that filled.
    pub order_id: OrderId,
    /// Cumulative filled size of the order.
    pub filled_size: Decimal,
    /// Execution price, when the source reports one.
    #[serde(default)]
    pub price: Option<Decimal>,
}

impl FillEvent {
    /// Fill at the order's limit price.
    pub fn new(order_id: OrderId, filled_size: Decimal) -> Self {
        Self {
            order_id,
            filled_size,
            price: None,
        }
    }
}

/// A resting order as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    /// Order identifier.
    pub order_id: OrderId,
    /// Market identifier.
    pub market_id: MarketId,
    /// Leg.
    pub side: Side,
    /// Limit price.
    pub price: Decimal,
    /// Requested size.
    pub size: Decimal,
    /// Cumulative filled size.
    pub filled: Decimal,
}

/// Token holdings in one market as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangePosition {
    /// Market payload (identity and window).
    pub market: RawMarket,
    /// YES tokens held.
    pub yes_size: Decimal,
    /// Average YES entry price.
    pub yes_avg_price: Decimal,
    /// NO tokens held.
    pub no_size: Decimal,
    /// Average NO entry price.
    pub no_avg_price: Decimal,
}

/// Market discovery.
#[async_trait]
pub trait MarketSource: Send + Sync {
    /// List candidate markets.
    async fn list_markets(&self) -> Result<Vec<RawMarket>, CatalogError>;

    /// Fetch a single market by id.
    async fn get_market(&self, market_id: &MarketId) -> Result<RawMarket, CatalogError>;
}

/// Resolution oracle.
#[async_trait]
pub trait ResolutionSource: Send + Sync {
    /// Current resolution payload for a market.
    async fn resolution(&self, market_id: &MarketId) -> Result<RawResolution, CatalogError>;
}

/// Order transport.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Submit a limit buy, returning the exchange-assigned id.
    async fn submit_order(&self, params: &OrderParams) -> Result<OrderId, TradingError>;

    /// Cancel a resting order.
    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), TradingError>;
}

/// Pull-based fill delivery.
#[async_trait]
pub trait FillSource: Send + Sync {
    /// Fill state for the given orders. Events carry cumulative sizes.
    async fn poll_fills(&self, order_ids: &[OrderId]) -> Result<Vec<FillEvent>, TradingError>;
}

/// Settlement.
#[async_trait]
pub trait Redeemer: Send + Sync {
    /// Redeem winning tokens of a resolved market.
    async fn redeem(&self, market_id: &MarketId, quantity: Decimal) -> Result<(), TradingError>;
}

/// Authoritative account state, used after a restart.
#[async_trait]
pub trait AccountSource: Send + Sync {
    /// Orders still resting on the book.
    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>, TradingError>;

    /// Token holdings per market.
    async fn positions(&self) -> Result<Vec<ExchangePosition>, TradingError>;
}

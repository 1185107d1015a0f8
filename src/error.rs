//! Unified error types for the complete-set maker.
//!
//! Errors follow the operational taxonomy of the bot:
//! - [`CatalogError`]: malformed, stale, or unavailable market/resolution data.
//!   The candidate is skipped; no order or position state is touched.
//! - [`TradingError`]: transport failures talking to the exchange. Retried with
//!   bounded backoff; exhaustion is surfaced, never silently dropped.
//! - [`LedgerError`] / [`PositionError`]: contract violations inside the core.
//!   The offending operation is aborted without touching other markets.
//!
//! Risk-limit rejections are not errors, see [`crate::risk::RiskDecision`].

use rust_decimal::Decimal;
use thiserror::Error;

use crate::market::{MarketId, Side};
use crate::trading::{OrderId, OrderStatus, PositionState};

/// Unified error type for the bot.
#[derive(Error, Debug)]
pub enum BotError {
    /// Configuration loading error.
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Market catalog / resolution data error.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Exchange transport error.
    #[error("trading error: {0}")]
    Trading(#[from] TradingError),

    /// Order ledger contract violation.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Position state machine contract violation.
    #[error("position error: {0}")]
    Position(#[from] PositionError),

    /// JSON encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Market listing and resolution data errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The listing or resolution source could not be reached.
    #[error("market source unavailable: {0}")]
    Unavailable(String),

    /// A payload failed validation at the adapter boundary.
    #[error("malformed market {market_id}: {reason}")]
    Malformed {
        /// Market identifier (or `<unknown>` when missing).
        market_id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Quote data is older than the configured maximum age.
    #[error("stale quote for {market_id}: {age_seconds}s old")]
    Stale {
        /// Market identifier.
        market_id: String,
        /// Age of the data in seconds.
        age_seconds: i64,
    },

    /// The source has no record of the market.
    #[error("market {0} not found")]
    NotFound(String),
}

/// Exchange transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TradingError {
    /// Order submission failed.
    #[error("order submission failed: {0}")]
    SubmissionFailed(String),

    /// Failed to cancel order.
    #[error("failed to cancel order {order_id}: {reason}")]
    CancelFailed {
        /// Order ID that failed to cancel.
        order_id: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to fetch fills or account state.
    #[error("failed to fetch {what}: {reason}")]
    FetchFailed {
        /// What was being fetched.
        what: &'static str,
        /// Reason for failure.
        reason: String,
    },

    /// Redemption call failed.
    #[error("redemption of {market_id} failed: {reason}")]
    RedemptionFailed {
        /// Market being redeemed.
        market_id: String,
        /// Reason for failure.
        reason: String,
    },

    /// Rate limited by the API.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_seconds: u64,
    },

    /// Order rejected by the exchange.
    #[error("order rejected: {reason}")]
    OrderRejected {
        /// Rejection reason from the exchange.
        reason: String,
    },

    /// Invalid order parameters.
    #[error("invalid order parameters: {0}")]
    InvalidParams(String),
}

impl TradingError {
    /// Whether retrying the same call could succeed.
    ///
    /// Rejections and bad parameters are final; everything else is transport.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TradingError::OrderRejected { .. } | TradingError::InvalidParams(_)
        )
    }
}

/// Order ledger contract violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A fill would push the order past its requested size.
    #[error("invalid fill for {order_id}: filled {attempted} exceeds requested {requested}")]
    InvalidFill {
        /// Order that received the fill.
        order_id: OrderId,
        /// Requested order size.
        requested: Decimal,
        /// Cumulative filled size the event asked for.
        attempted: Decimal,
    },

    /// A fill arrived for an order that can never fill.
    #[error("fill for {order_id} in status {status}")]
    FillOnDeadOrder {
        /// Order that received the fill.
        order_id: OrderId,
        /// Its current status.
        status: OrderStatus,
    },

    /// Fill delta was zero or negative.
    #[error("non-positive fill delta {delta} for {order_id}")]
    NonPositiveDelta {
        /// Order that received the fill.
        order_id: OrderId,
        /// The offending delta.
        delta: Decimal,
    },

    /// The ledger has no record of this order.
    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    /// A pair already exists for this market.
    #[error("order pair already exists for market {0}")]
    DuplicatePair(MarketId),

    /// No pair has been placed on this market.
    #[error("no order pair for market {0}")]
    UnknownPair(MarketId),
}

/// Position state machine contract violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    /// No position is tracked for the market.
    #[error("no position for market {0}")]
    UnknownPosition(MarketId),

    /// The requested transition is not allowed from the current state.
    #[error("invalid transition for {market_id}: {from} -> {to}")]
    InvalidTransition {
        /// Market identifier.
        market_id: MarketId,
        /// Current state.
        from: PositionState,
        /// Requested state.
        to: PositionState,
    },

    /// Redemption requested for an already redeemed position.
    #[error("position {0} already redeemed")]
    AlreadyRedeemed(MarketId),

    /// A redemption call is already in flight for this position.
    #[error("redemption already in flight for {0}")]
    RedemptionInFlight(MarketId),

    /// Redemption retries are exhausted and need operator attention.
    #[error("redemption attempts exhausted for {0}")]
    RedemptionExhausted(MarketId),

    /// Abandoning would drop filled tokens.
    #[error("position {market_id} holds fills ({side} leg), cannot abandon")]
    FundsBearing {
        /// Market identifier.
        market_id: MarketId,
        /// A leg that has fills.
        side: Side,
    },
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, BotError>;

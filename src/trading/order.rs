//! Order types and per-order fill accounting.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

use crate::error::LedgerError;
use crate::market::{MarketDescriptor, MarketId, Side};

/// Exchange-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Create a new order identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted by the exchange, nothing filled yet.
    #[strum(to_string = "pending", serialize = "PENDING", serialize = "live", serialize = "LIVE")]
    Pending,
    /// Some but not all of the requested size has filled.
    #[strum(to_string = "partially_filled", serialize = "PARTIALLY_FILLED")]
    PartiallyFilled,
    /// Fully filled.
    #[strum(to_string = "filled", serialize = "FILLED")]
    Filled,
    /// Cancelled before filling completely.
    #[strum(
        to_string = "cancelled",
        serialize = "canceled",
        serialize = "CANCELLED",
        serialize = "CANCELED"
    )]
    Cancelled,
    /// Rejected by the exchange.
    #[strum(to_string = "rejected", serialize = "REJECTED")]
    Rejected,
}

impl OrderStatus {
    /// Check if status is terminal (won't change on its own).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Whether the order still rests on the book.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

/// Order parameters for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderParams {
    /// Market the order belongs to.
    pub market_id: MarketId,
    /// Token ID to buy.
    pub token_id: String,
    /// Leg being bought.
    pub side: Side,
    /// Limit price.
    pub price: Decimal,
    /// Order size.
    pub size: Decimal,
}

impl OrderParams {
    /// Create a buy order for one leg of a market.
    pub fn buy(market: &MarketDescriptor, side: Side, price: Decimal, size: Decimal) -> Self {
        Self {
            market_id: market.id.clone(),
            token_id: market.token_id(side).to_string(),
            side,
            price,
            size,
        }
    }

    /// Notional cost if fully filled.
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }

    /// Validate order parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.token_id.is_empty() {
            return Err("token_id is required".to_string());
        }
        if self.price <= Decimal::ZERO || self.price >= Decimal::ONE {
            return Err(format!("price {} must be in (0, 1)", self.price));
        }
        if self.size <= Decimal::ZERO {
            return Err("size must be positive".to_string());
        }
        Ok(())
    }
}

/// An order for one leg, as recorded by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Exchange-assigned identifier.
    pub id: OrderId,
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
    /// Current status.
    pub status: OrderStatus,
    /// Unix timestamp when the market window closes.
    pub window_end: i64,
    /// When the order was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last mutation.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Order {
    /// Record a freshly submitted order.
    pub fn submitted(id: OrderId, params: &OrderParams, window_end: i64, now: OffsetDateTime) -> Self {
        Self {
            id,
            market_id: params.market_id.clone(),
            side: params.side,
            price: params.price,
            size: params.size,
            filled: Decimal::ZERO,
            status: OrderStatus::Pending,
            window_end,
            created_at: now,
            updated_at: now,
        }
    }

    /// Unfilled size.
    pub fn remaining(&self) -> Decimal {
        (self.size - self.filled).max(Decimal::ZERO)
    }

    /// Unfilled notional still reserved on the book (zero once terminal).
    pub fn reserved_notional(&self) -> Decimal {
        if self.status.is_terminal() {
            Decimal::ZERO
        } else {
            self.remaining() * self.price
        }
    }

    /// Apply a cumulative filled size and return the newly filled delta.
    ///
    /// Reports at or below the current filled size are duplicates and return
    /// zero. Late fills on cancelled orders are still recorded; the order
    /// stays Cancelled even when the late fill completes it.
    pub fn apply_cumulative(
        &mut self,
        cumulative: Decimal,
        now: OffsetDateTime,
    ) -> Result<Decimal, LedgerError> {
        if self.status == OrderStatus::Rejected {
            return Err(LedgerError::FillOnDeadOrder {
                order_id: self.id.clone(),
                status: self.status,
            });
        }
        if cumulative > self.size {
            return Err(LedgerError::InvalidFill {
                order_id: self.id.clone(),
                requested: self.size,
                attempted: cumulative,
            });
        }
        if cumulative <= self.filled {
            return Ok(Decimal::ZERO);
        }

        let delta = cumulative - self.filled;
        self.filled = cumulative;
        self.updated_at = now;

        if self.status != OrderStatus::Cancelled {
            self.status = if self.filled == self.size {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
        }

        Ok(delta)
    }

    /// Apply an incremental fill.
    pub fn apply_delta(&mut self, delta: Decimal, now: OffsetDateTime) -> Result<Decimal, LedgerError> {
        if delta <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveDelta {
                order_id: self.id.clone(),
                delta,
            });
        }
        self.apply_cumulative(self.filled + delta, now)
    }

    /// Mark cancelled. Returns false if the order was already terminal.
    pub fn cancel(&mut self, now: OffsetDateTime) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OrderStatus::Cancelled;
        self.updated_at = now;
        true
    }
}

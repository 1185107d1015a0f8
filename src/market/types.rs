//! Market-related types for binary prediction markets.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

/// Exchange market identifier (condition id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketId(String);

impl MarketId {
    /// Create a new market identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One leg of a binary market.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// YES outcome token.
    #[strum(
        to_string = "yes",
        serialize = "YES",
        serialize = "Yes",
        serialize = "up",
        serialize = "UP",
        serialize = "Up"
    )]
    Yes,
    /// NO outcome token.
    #[strum(
        to_string = "no",
        serialize = "NO",
        serialize = "No",
        serialize = "down",
        serialize = "DOWN",
        serialize = "Down"
    )]
    No,
}

impl Side {
    /// Both legs, YES first.
    pub const BOTH: [Side; 2] = [Side::Yes, Side::No];

    /// Get the opposite leg.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

/// Best bid/ask for one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopOfBook {
    /// Best bid price.
    pub best_bid: Decimal,
    /// Best ask price.
    pub best_ask: Decimal,
    /// Shares resting at the best bid.
    #[serde(default)]
    pub bid_size: Decimal,
}

impl TopOfBook {
    /// Create a top of book with no depth recorded.
    pub fn new(best_bid: Decimal, best_ask: Decimal) -> Self {
        Self {
            best_bid,
            best_ask,
            bid_size: Decimal::ZERO,
        }
    }

    /// Set the size resting at the best bid.
    pub fn with_bid_size(mut self, bid_size: Decimal) -> Self {
        self.bid_size = bid_size;
        self
    }

    /// Bid-ask spread.
    pub fn spread(&self) -> Decimal {
        self.best_ask - self.best_bid
    }

    /// Two ticks above the bid, capped one tick under the ask, rounded down
    /// to the tick. None for a one-sided book or a non-positive result.
    pub fn improved_bid(&self, tick: Decimal) -> Option<Decimal> {
        if tick <= Decimal::ZERO || self.best_bid <= Decimal::ZERO || self.best_ask <= Decimal::ZERO {
            return None;
        }
        let target = (self.best_bid + tick * Decimal::TWO).min(self.best_ask - tick);
        let price = (target / tick).floor() * tick;
        (price > Decimal::ZERO).then_some(price)
    }
}

/// Immutable snapshot of a candidate market, validated by the catalog adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDescriptor {
    /// Market identifier.
    pub id: MarketId,
    /// Underlying asset tag (e.g. "btc").
    pub asset: String,
    /// Unix timestamp when the window opened.
    pub window_start: i64,
    /// Unix timestamp when the window closes.
    pub window_end: i64,
    /// YES token ID.
    pub yes_token_id: String,
    /// NO token ID.
    pub no_token_id: String,
    /// YES book at snapshot time.
    pub yes_book: TopOfBook,
    /// NO book at snapshot time.
    pub no_book: TopOfBook,
}

impl MarketDescriptor {
    /// Get the token ID for a given leg.
    pub fn token_id(&self, side: Side) -> &str {
        match side {
            Side::Yes => &self.yes_token_id,
            Side::No => &self.no_token_id,
        }
    }

    /// Get the book for a given leg.
    pub fn book(&self, side: Side) -> &TopOfBook {
        match side {
            Side::Yes => &self.yes_book,
            Side::No => &self.no_book,
        }
    }

    /// Sum of both legs' best bids.
    pub fn combined_bid(&self) -> Decimal {
        self.yes_book.best_bid + self.no_book.best_bid
    }

    /// Whether the window has closed at `now`.
    pub fn has_ended(&self, now: OffsetDateTime) -> bool {
        now.unix_timestamp() >= self.window_end
    }

    /// Window end as a datetime.
    pub fn window_end_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.window_end)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Seconds elapsed since the window closed (zero while open).
    pub fn seconds_since_end(&self, now: OffsetDateTime) -> i64 {
        (now.unix_timestamp() - self.window_end).max(0)
    }
}

/// Normalized resolution state of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ResolutionStatus {
    /// Not resolved yet.
    Pending,
    /// YES won.
    ResolvedYes,
    /// NO won.
    ResolvedNo,
}

impl ResolutionStatus {
    /// The winning leg, if resolved.
    pub fn winner(&self) -> Option<Side> {
        match self {
            ResolutionStatus::Pending => None,
            ResolutionStatus::ResolvedYes => Some(Side::Yes),
            ResolutionStatus::ResolvedNo => Some(Side::No),
        }
    }

    /// Resolution status for a winning leg.
    pub fn resolved(winner: Side) -> Self {
        match winner {
            Side::Yes => ResolutionStatus::ResolvedYes,
            Side::No => ResolutionStatus::ResolvedNo,
        }
    }
}

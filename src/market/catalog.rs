//! Market catalog adapter.
//!
//! Wraps the listing and resolution sources and turns their loosely typed
//! payloads into [`MarketDescriptor`] / [`ResolutionStatus`]. Anything that
//! fails validation is a data error: logged, skipped, never passed inward.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use super::types::{MarketDescriptor, MarketId, ResolutionStatus, Side, TopOfBook};
use crate::error::CatalogError;
use crate::exchange::{MarketSource, RawMarket, RawResolution, ResolutionSource};

/// Book-quality gate for new candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateFilter {
    /// Minimum `yes_bid + no_bid`.
    pub min_combined_bid: Decimal,
    /// Maximum per-leg spread.
    pub max_spread: Decimal,
    /// Maximum quote age in seconds.
    pub max_quote_age_seconds: i64,
    /// Minimum shares at the best bid on each leg.
    pub min_bid_size: Decimal,
}

impl CandidateFilter {
    /// Why a descriptor fails the filter at `now`, if it does.
    pub fn rejection(&self, market: &MarketDescriptor, now: OffsetDateTime) -> Option<String> {
        if market.has_ended(now) {
            return Some("window already ended".to_string());
        }
        let combined = market.combined_bid();
        if combined < self.min_combined_bid {
            return Some(format!(
                "combined bid {} below {}",
                combined, self.min_combined_bid
            ));
        }
        for side in Side::BOTH {
            let spread = market.book(side).spread();
            if spread > self.max_spread {
                return Some(format!("{} spread {} above {}", side, spread, self.max_spread));
            }
            let depth = market.book(side).bid_size;
            if depth < self.min_bid_size {
                return Some(format!("{} bid depth {} below {}", side, depth, self.min_bid_size));
            }
        }
        None
    }
}

/// Adapter over the external market and resolution sources.
pub struct CatalogAdapter {
    markets: Arc<dyn MarketSource>,
    resolutions: Arc<dyn ResolutionSource>,
    filter: CandidateFilter,
}

impl CatalogAdapter {
    /// Create an adapter.
    pub fn new(
        markets: Arc<dyn MarketSource>,
        resolutions: Arc<dyn ResolutionSource>,
        filter: CandidateFilter,
    ) -> Self {
        Self {
            markets,
            resolutions,
            filter,
        }
    }

    /// The active candidate filter.
    pub fn filter(&self) -> &CandidateFilter {
        &self.filter
    }

    /// List validated candidates that pass the book-quality filter.
    ///
    /// Malformed or stale entries are skipped individually; only a source
    /// outage fails the call.
    #[instrument(skip(self))]
    pub async fn list_candidates(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<MarketDescriptor>, CatalogError> {
        let raw = self.markets.list_markets().await?;
        let total = raw.len();

        let mut candidates = Vec::with_capacity(total);
        for payload in raw {
            let market = match self.normalize(&payload, now) {
                Ok(market) => market,
                Err(e) => {
                    warn!(error = %e, "Skipping market payload");
                    continue;
                }
            };
            match self.filter.rejection(&market, now) {
                None => candidates.push(market),
                Some(reason) => debug!(market = %market.id, reason, "Candidate filtered"),
            }
        }

        debug!(total, candidates = candidates.len(), "Listed candidates");
        Ok(candidates)
    }

    /// Full validation of a listing payload, including quote freshness.
    pub fn normalize(
        &self,
        raw: &RawMarket,
        now: OffsetDateTime,
    ) -> Result<MarketDescriptor, CatalogError> {
        let market = parse_market(raw, true)?;

        let fetched_at = raw.fetched_at.ok_or_else(|| malformed(raw, "missing fetched_at"))?;
        let age_seconds = now.unix_timestamp() - fetched_at;
        if age_seconds > self.filter.max_quote_age_seconds {
            return Err(CatalogError::Stale {
                market_id: market.id.to_string(),
                age_seconds,
            });
        }

        Ok(market)
    }

    /// Identity and window only; books default to zero when absent.
    pub fn describe(raw: &RawMarket) -> Result<MarketDescriptor, CatalogError> {
        parse_market(raw, false)
    }

    /// Fetch and describe a single market.
    pub async fn get_market(&self, market_id: &MarketId) -> Result<MarketDescriptor, CatalogError> {
        let raw = self.markets.get_market(market_id).await?;
        let market = Self::describe(&raw)?;
        if &market.id != market_id {
            return Err(malformed(&raw, "source returned a different market"));
        }
        Ok(market)
    }

    /// Current resolution status of a market.
    pub async fn resolution(&self, market_id: &MarketId) -> Result<ResolutionStatus, CatalogError> {
        let raw = self.resolutions.resolution(market_id).await?;
        normalize_resolution(market_id, &raw)
    }
}

/// Validate a resolution payload against the market it was requested for.
pub fn normalize_resolution(
    market_id: &MarketId,
    raw: &RawResolution,
) -> Result<ResolutionStatus, CatalogError> {
    let bad = |reason: &str| CatalogError::Malformed {
        market_id: market_id.to_string(),
        reason: reason.to_string(),
    };

    match raw.market_id.as_deref() {
        Some(id) if id == market_id.as_str() => {}
        Some(_) => return Err(bad("resolution payload is for another market")),
        None => return Err(bad("resolution payload missing market id")),
    }

    if !raw.resolved {
        return Ok(ResolutionStatus::Pending);
    }

    let outcome = raw
        .winning_outcome
        .as_deref()
        .ok_or_else(|| bad("resolved without a winning outcome"))?;
    let winner = Side::from_str(outcome.trim())
        .or_else(|_| Side::from_str(&outcome.trim().to_lowercase()))
        .map_err(|_| bad("unrecognized winning outcome"))?;

    Ok(ResolutionStatus::resolved(winner))
}

fn malformed(raw: &RawMarket, reason: &str) -> CatalogError {
    CatalogError::Malformed {
        market_id: raw.id.clone().unwrap_or_else(|| "<unknown>".to_string()),
        reason: reason.to_string(),
    }
}

fn required<'a>(raw: &RawMarket, value: &'a Option<String>, field: &str) -> Result<&'a str, CatalogError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(malformed(raw, &format!("missing {}", field))),
    }
}

fn parse_price(raw: &RawMarket, value: &Option<String>, field: &str) -> Result<Decimal, CatalogError> {
    let text = required(raw, value, field)?;
    let price = Decimal::from_str(text)
        .map_err(|_| malformed(raw, &format!("unparseable {}: {}", field, text)))?;
    if price < Decimal::ZERO || price > Decimal::ONE {
        return Err(malformed(raw, &format!("{} {} out of range", field, price)));
    }
    Ok(price)
}

fn parse_size(
    raw: &RawMarket,
    value: &Option<String>,
    field: &str,
    require: bool,
) -> Result<Decimal, CatalogError> {
    if !require && value.is_none() {
        return Ok(Decimal::ZERO);
    }
    let text = required(raw, value, field)?;
    let size = Decimal::from_str(text)
        .map_err(|_| malformed(raw, &format!("unparseable {}: {}", field, text)))?;
    if size < Decimal::ZERO {
        return Err(malformed(raw, &format!("negative {} {}", field, size)));
    }
    Ok(size)
}

fn parse_book(
    raw: &RawMarket,
    quotes: [&Option<String>; 3],
    side: Side,
    require_depth: bool,
) -> Result<TopOfBook, CatalogError> {
    let [bid, ask, bid_size] = quotes;
    let best_bid = parse_price(raw, bid, &format!("{} bid", side))?;
    let best_ask = parse_price(raw, ask, &format!("{} ask", side))?;
    if best_bid > best_ask {
        return Err(malformed(raw, &format!("inverted {} book", side)));
    }
    let bid_size = parse_size(raw, bid_size, &format!("{} bid size", side), require_depth)?;
    Ok(TopOfBook::new(best_bid, best_ask).with_bid_size(bid_size))
}

fn parse_market(raw: &RawMarket, require_books: bool) -> Result<MarketDescriptor, CatalogError> {
    let id = required(raw, &raw.id, "id")?;
    let yes_token_id = required(raw, &raw.yes_token_id, "yes token")?;
    let no_token_id = required(raw, &raw.no_token_id, "no token")?;
    if yes_token_id == no_token_id {
        return Err(malformed(raw, "yes and no tokens are identical"));
    }

    let window_start = raw.window_start.ok_or_else(|| malformed(raw, "missing window start"))?;
    let window_end = raw.window_end.ok_or_else(|| malformed(raw, "missing window end"))?;
    if window_end <= window_start {
        return Err(malformed(raw, "window end not after start"));
    }

    let has_books = raw.yes_bid.is_some() || raw.yes_ask.is_some();
    let (yes_book, no_book) = if require_books || has_books {
        (
            parse_book(raw, [&raw.yes_bid, &raw.yes_ask, &raw.yes_bid_size], Side::Yes, require_books)?,
            parse_book(raw, [&raw.no_bid, &raw.no_ask, &raw.no_bid_size], Side::No, require_books)?,
        )
    } else {
        (TopOfBook::default(), TopOfBook::default())
    };

    Ok(MarketDescriptor {
        id: MarketId::new(id),
        asset: raw
            .asset
            .as_deref()
            .map(|a| a.trim().to_lowercase())
            .unwrap_or_default(),
        window_start,
        window_end,
        yes_token_id: yes_token_id.to_string(),
        no_token_id: no_token_id.to_string(),
        yes_book,
        no_book,
    })
}

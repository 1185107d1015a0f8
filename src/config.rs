//! Application configuration loaded from environment variables.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use time::UtcOffset;

use crate::market::CandidateFilter;
use crate::redemption::SchedulerSettings;
use crate::risk::RiskLimits;
use crate::utils::RetryPolicy;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // === Order Placement ===
    /// Limit price for each leg.
    #[serde(default = "default_bid_price")]
    pub bid_price: Decimal,

    /// Shares per leg before the risk multiplier.
    #[serde(default = "default_position_size")]
    pub position_size: Decimal,

    /// Exchange minimum order size.
    #[serde(default = "default_min_order_size")]
    pub min_order_size: Decimal,

    /// Exchange price increment.
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,

    // === One-Leg Handling ===
    /// A resting leg older than this is re-quoted once its partner has filled.
    #[serde(default = "default_requote_after_seconds")]
    pub requote_after_seconds: i64,

    /// Stop re-quoting this long after the first fill.
    #[serde(default = "default_one_leg_timeout_seconds")]
    pub one_leg_timeout_seconds: i64,

    // === Candidate Filter ===
    /// Minimum YES bid + NO bid for a market to be considered.
    #[serde(default = "default_min_combined_bid")]
    pub min_combined_bid: Decimal,

    /// Maximum bid/ask spread on either leg.
    #[serde(default = "default_max_spread")]
    pub max_spread: Decimal,

    /// Quotes older than this are stale.
    #[serde(default = "default_max_quote_age")]
    pub max_quote_age_seconds: i64,

    /// Minimum size resting at the best bid on each leg.
    #[serde(default = "default_min_bid_size")]
    pub min_bid_size: Decimal,

    // === Risk Limits ===
    /// Maximum concurrently open sets.
    #[serde(default = "default_max_open_sets")]
    pub max_open_sets: usize,

    /// Exposure cap in USD.
    #[serde(default = "default_max_exposure")]
    pub max_exposure: Decimal,

    /// Daily realized loss cap in USD.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,

    /// Consecutive losses before sizing down.
    #[serde(default = "default_loss_streak_threshold")]
    pub loss_streak_threshold: u32,

    /// Size multiplier after a loss streak.
    #[serde(default = "default_size_reduction_factor")]
    pub size_reduction_factor: Decimal,

    /// Consecutive redemption failures that trip the kill switch.
    #[serde(default = "default_max_redemption_failures")]
    pub max_redemption_failures: u32,

    /// Reference timezone for daily resets, hours from UTC.
    #[serde(default)]
    pub risk_utc_offset_hours: i8,

    // === Redemption ===
    /// Resolution poll cadence.
    #[serde(default = "default_resolution_poll_interval_ms")]
    pub resolution_poll_interval_ms: u64,

    /// Seconds after window end before the first poll.
    #[serde(default)]
    pub redemption_grace_seconds: i64,

    /// Redemption calls per position before alerting.
    #[serde(default = "default_max_redemption_attempts")]
    pub max_redemption_attempts: u32,

    /// First redemption retry delay.
    #[serde(default = "default_redemption_backoff_ms")]
    pub redemption_backoff_ms: u64,

    /// Maximum redemption retry delay.
    #[serde(default = "default_redemption_backoff_max_ms")]
    pub redemption_backoff_max_ms: u64,

    /// Warn when unresolved this long after window end.
    #[serde(default = "default_redemption_deadline_seconds")]
    pub redemption_deadline_seconds: i64,

    // === Engine ===
    /// Main loop cadence.
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,

    /// Attempts per submit/cancel call.
    #[serde(default = "default_transport_retry_attempts")]
    pub transport_retry_attempts: u32,

    /// First transport retry delay.
    #[serde(default = "default_transport_backoff_ms")]
    pub transport_backoff_ms: u64,

    /// JSON-lines journal of finalized positions.
    #[serde(default)]
    pub trade_log_file: Option<String>,

    // === Operation Modes ===
    /// Paper trading only; live transport is not wired.
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Paper exchange fills every order immediately.
    #[serde(default = "default_true")]
    pub paper_auto_fill: bool,

    /// Paper exchange resolves markets this long after window end.
    #[serde(default = "default_paper_resolve_after_seconds")]
    pub paper_resolve_after_seconds: i64,

    /// Paper exchange window length.
    #[serde(default = "default_paper_window_seconds")]
    pub paper_window_seconds: i64,

    // === Server Configuration ===
    /// HTTP server port for health/metrics endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

fn default_bid_price() -> Decimal {
    Decimal::new(45, 2) // 0.45
}

fn default_position_size() -> Decimal {
    Decimal::new(10, 0)
}

fn default_min_order_size() -> Decimal {
    Decimal::new(5, 0)
}

fn default_tick_size() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_requote_after_seconds() -> i64 {
    10
}

fn default_one_leg_timeout_seconds() -> i64 {
    180
}

fn default_min_bid_size() -> Decimal {
    Decimal::new(10, 0)
}

fn default_min_combined_bid() -> Decimal {
    Decimal::new(80, 2) // 0.80
}

fn default_max_spread() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_max_quote_age() -> i64 {
    30
}

fn default_max_open_sets() -> usize {
    10
}

fn default_max_exposure() -> Decimal {
    Decimal::new(200, 0)
}

fn default_max_daily_loss() -> Decimal {
    Decimal::new(50, 0)
}

fn default_loss_streak_threshold() -> u32 {
    3
}

fn default_size_reduction_factor() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_max_redemption_failures() -> u32 {
    3
}

fn default_resolution_poll_interval_ms() -> u64 {
    1000
}

fn default_max_redemption_attempts() -> u32 {
    3
}

fn default_redemption_backoff_ms() -> u64 {
    500
}

fn default_redemption_backoff_max_ms() -> u64 {
    8000
}

fn default_redemption_deadline_seconds() -> i64 {
    600
}

fn default_loop_interval_ms() -> u64 {
    2000
}

fn default_transport_retry_attempts() -> u32 {
    3
}

fn default_transport_backoff_ms() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

fn default_paper_resolve_after_seconds() -> i64 {
    5
}

fn default_paper_window_seconds() -> i64 {
    900
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bid_price: default_bid_price(),
            position_size: default_position_size(),
            min_order_size: default_min_order_size(),
            tick_size: default_tick_size(),
            requote_after_seconds: default_requote_after_seconds(),
            one_leg_timeout_seconds: default_one_leg_timeout_seconds(),
            min_combined_bid: default_min_combined_bid(),
            max_spread: default_max_spread(),
            max_quote_age_seconds: default_max_quote_age(),
            min_bid_size: default_min_bid_size(),
            max_open_sets: default_max_open_sets(),
            max_exposure: default_max_exposure(),
            max_daily_loss: default_max_daily_loss(),
            loss_streak_threshold: default_loss_streak_threshold(),
            size_reduction_factor: default_size_reduction_factor(),
            max_redemption_failures: default_max_redemption_failures(),
            risk_utc_offset_hours: 0,
            resolution_poll_interval_ms: default_resolution_poll_interval_ms(),
            redemption_grace_seconds: 0,
            max_redemption_attempts: default_max_redemption_attempts(),
            redemption_backoff_ms: default_redemption_backoff_ms(),
            redemption_backoff_max_ms: default_redemption_backoff_max_ms(),
            redemption_deadline_seconds: default_redemption_deadline_seconds(),
            loop_interval_ms: default_loop_interval_ms(),
            transport_retry_attempts: default_transport_retry_attempts(),
            transport_backoff_ms: default_transport_backoff_ms(),
            trade_log_file: None,
            dry_run: true,
            paper_auto_fill: true,
            paper_resolve_after_seconds: default_paper_resolve_after_seconds(),
            paper_window_seconds: default_paper_window_seconds(),
            port: default_port(),
            rust_log: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.bid_price <= Decimal::ZERO || self.bid_price >= Decimal::ONE {
            return Err("BID_PRICE must be between 0 and 1".to_string());
        }

        if self.bid_price * Decimal::TWO >= Decimal::ONE {
            return Err("BID_PRICE leaves no edge: both legs cost $1.00 or more".to_string());
        }

        if self.position_size <= Decimal::ZERO || self.min_order_size <= Decimal::ZERO {
            return Err("POSITION_SIZE and MIN_ORDER_SIZE must be positive".to_string());
        }

        if self.min_order_size > self.position_size {
            return Err("MIN_ORDER_SIZE must not exceed POSITION_SIZE".to_string());
        }

        if self.tick_size <= Decimal::ZERO || self.tick_size >= Decimal::ONE {
            return Err("TICK_SIZE must be between 0 and 1".to_string());
        }

        if self.min_bid_size < Decimal::ZERO {
            return Err("MIN_BID_SIZE must not be negative".to_string());
        }

        if self.requote_after_seconds < 0 || self.one_leg_timeout_seconds < 0 {
            return Err("REQUOTE_AFTER_SECONDS and ONE_LEG_TIMEOUT_SECONDS must not be negative".to_string());
        }

        if self.max_exposure <= Decimal::ZERO || self.max_daily_loss <= Decimal::ZERO {
            return Err("MAX_EXPOSURE and MAX_DAILY_LOSS must be positive".to_string());
        }

        if self.size_reduction_factor <= Decimal::ZERO || self.size_reduction_factor > Decimal::ONE {
            return Err("SIZE_REDUCTION_FACTOR must be in (0, 1]".to_string());
        }

        if self.loss_streak_threshold == 0 {
            return Err("LOSS_STREAK_THRESHOLD must be at least 1".to_string());
        }

        if self.max_redemption_attempts == 0 || self.max_redemption_failures == 0 {
            return Err("MAX_REDEMPTION_ATTEMPTS and MAX_REDEMPTION_FAILURES must be at least 1".to_string());
        }

        if self.resolution_poll_interval_ms == 0 || self.loop_interval_ms == 0 {
            return Err("poll and loop intervals must be non-zero".to_string());
        }

        if self.redemption_grace_seconds < 0 {
            return Err("REDEMPTION_GRACE_SECONDS must not be negative".to_string());
        }

        if !(-23..=23).contains(&self.risk_utc_offset_hours) {
            return Err("RISK_UTC_OFFSET_HOURS must be within ±23".to_string());
        }

        Ok(())
    }

    /// Offset of the risk day's reference timezone.
    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_hms(self.risk_utc_offset_hours, 0, 0).unwrap_or(UtcOffset::UTC)
    }

    /// Risk controller limits.
    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_exposure: self.max_exposure,
            max_daily_loss: self.max_daily_loss,
            max_open_sets: self.max_open_sets,
            loss_streak_threshold: self.loss_streak_threshold,
            size_reduction_factor: self.size_reduction_factor,
            max_redemption_failures: self.max_redemption_failures,
            utc_offset: self.utc_offset(),
        }
    }

    /// Redemption scheduler settings.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: Duration::from_millis(self.resolution_poll_interval_ms),
            grace_seconds: self.redemption_grace_seconds,
            max_attempts: self.max_redemption_attempts,
            backoff_base: Duration::from_millis(self.redemption_backoff_ms),
            backoff_max: Duration::from_millis(self.redemption_backoff_max_ms),
            deadline_seconds: self.redemption_deadline_seconds,
        }
    }

    /// Catalog candidate filter.
    pub fn candidate_filter(&self) -> CandidateFilter {
        CandidateFilter {
            min_combined_bid: self.min_combined_bid,
            max_spread: self.max_spread,
            max_quote_age_seconds: self.max_quote_age_seconds,
            min_bid_size: self.min_bid_size,
        }
    }

    /// Retry policy for submit/cancel calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.transport_retry_attempts,
            Duration::from_millis(self.transport_backoff_ms),
            Duration::from_millis(self.transport_backoff_ms.saturating_mul(8)),
        )
    }

    /// Main loop cadence.
    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    /// Cost of one full pair at the configured size and price.
    pub fn pair_cost(&self, size: Decimal) -> Decimal {
        self.bid_price * size * Decimal::TWO
    }
}

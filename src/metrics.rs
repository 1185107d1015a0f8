//! Prometheus metrics for the order/position lifecycle.
//!
//! Names are declared once here; call sites use the helper functions so the
//! engine, ledger and scheduler never spell metric names themselves.

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

// === Metric Name Constants ===

/// Order submission latency metric name.
pub const METRIC_ORDER_SUBMIT_LATENCY: &str = "order_submit_latency_ms";
/// Engine iteration latency metric name.
pub const METRIC_ITERATION_LATENCY: &str = "engine_iteration_latency_ms";
/// Window end to redemption latency metric name.
pub const METRIC_REDEMPTION_LATENCY: &str = "redemption_latency_seconds";
/// Orders submitted counter metric name.
pub const METRIC_ORDERS_SUBMITTED: &str = "orders_submitted_total";
/// Orders failed counter metric name.
pub const METRIC_ORDERS_FAILED: &str = "orders_failed_total";
/// Orders cancelled counter metric name.
pub const METRIC_ORDERS_CANCELLED: &str = "orders_cancelled_total";
/// Fills applied counter metric name.
pub const METRIC_FILLS_APPLIED: &str = "fills_applied_total";
/// Duplicate fills counter metric name.
pub const METRIC_FILLS_DUPLICATE: &str = "fills_duplicate_total";
/// Rejected fills counter metric name.
pub const METRIC_FILLS_REJECTED: &str = "fills_rejected_total";
/// Positions completed counter metric name.
pub const METRIC_POSITIONS_COMPLETED: &str = "positions_completed_total";
/// Positions flagged for manual handling counter metric name.
pub const METRIC_POSITIONS_FLAGGED: &str = "positions_flagged_total";
/// Lagging legs re-quoted counter metric name.
pub const METRIC_LEGS_REQUOTED: &str = "legs_requoted_total";
/// Resolution polls counter metric name.
pub const METRIC_RESOLUTION_POLLS: &str = "resolution_polls_total";
/// Redemptions succeeded counter metric name.
pub const METRIC_REDEMPTIONS_SUCCEEDED: &str = "redemptions_succeeded_total";
/// Redemptions failed counter metric name.
pub const METRIC_REDEMPTIONS_FAILED: &str = "redemptions_failed_total";
/// Redemptions exhausted counter metric name.
pub const METRIC_REDEMPTIONS_EXHAUSTED: &str = "redemptions_exhausted_total";
/// Risk rejections counter metric name.
pub const METRIC_RISK_REJECTIONS: &str = "risk_rejections_total";
/// Exposure gauge metric name.
pub const METRIC_EXPOSURE: &str = "exposure_usd";
/// Open sets gauge metric name.
pub const METRIC_OPEN_SETS: &str = "open_sets";
/// Daily P&L gauge metric name.
pub const METRIC_DAILY_PNL: &str = "daily_pnl_usd";
/// Size multiplier gauge metric name.
pub const METRIC_SIZE_MULTIPLIER: &str = "size_multiplier";

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    // Latency histograms
    describe_histogram!(
        METRIC_ORDER_SUBMIT_LATENCY,
        "Order submission latency in milliseconds"
    );
    describe_histogram!(
        METRIC_ITERATION_LATENCY,
        "Engine control loop iteration latency in milliseconds"
    );
    describe_histogram!(
        METRIC_REDEMPTION_LATENCY,
        "Seconds from market window end to successful redemption"
    );

    // Counters
    describe_counter!(METRIC_ORDERS_SUBMITTED, "Total number of orders submitted");
    describe_counter!(METRIC_ORDERS_FAILED, "Total number of order submissions that failed");
    describe_counter!(METRIC_ORDERS_CANCELLED, "Total number of orders cancelled");
    describe_counter!(METRIC_FILLS_APPLIED, "Fill notifications that advanced an order");
    describe_counter!(METRIC_FILLS_DUPLICATE, "Fill notifications ignored as duplicates");
    describe_counter!(METRIC_FILLS_REJECTED, "Fill notifications rejected as invalid");
    describe_counter!(METRIC_POSITIONS_COMPLETED, "Positions that became complete sets");
    describe_counter!(
        METRIC_POSITIONS_FLAGGED,
        "Positions flagged for manual single-leg handling"
    );
    describe_counter!(METRIC_LEGS_REQUOTED, "Resting legs re-quoted after the other leg filled");
    describe_counter!(METRIC_RESOLUTION_POLLS, "Resolution status polls");
    describe_counter!(METRIC_REDEMPTIONS_SUCCEEDED, "Successful redemptions");
    describe_counter!(METRIC_REDEMPTIONS_FAILED, "Failed redemption attempts");
    describe_counter!(
        METRIC_REDEMPTIONS_EXHAUSTED,
        "Positions whose redemption retries are exhausted"
    );
    describe_counter!(METRIC_RISK_REJECTIONS, "Order pairs blocked by risk limits");

    // Gauges
    describe_gauge!(METRIC_EXPOSURE, "Cost basis plus reserved notional of open sets");
    describe_gauge!(METRIC_OPEN_SETS, "Non-terminal positions and resting pairs");
    describe_gauge!(METRIC_DAILY_PNL, "Realized P&L for the current risk day");
    describe_gauge!(METRIC_SIZE_MULTIPLIER, "Current position size multiplier");

    debug!("Metrics initialized");
}

/// Record iteration latency.
pub fn record_iteration_latency(start: Instant) {
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_ITERATION_LATENCY).record(latency_ms);
}

/// Record window end to redemption latency.
pub fn record_redemption_latency(seconds: i64) {
    histogram!(METRIC_REDEMPTION_LATENCY).record(seconds.max(0) as f64);
}

/// Increment order submitted counter.
pub fn inc_orders_submitted() {
    counter!(METRIC_ORDERS_SUBMITTED).increment(1);
}

/// Increment orders failed counter.
pub fn inc_orders_failed() {
    counter!(METRIC_ORDERS_FAILED).increment(1);
}

/// Increment orders cancelled counter.
pub fn inc_orders_cancelled() {
    counter!(METRIC_ORDERS_CANCELLED).increment(1);
}

/// Increment fills applied counter.
pub fn inc_fills_applied() {
    counter!(METRIC_FILLS_APPLIED).increment(1);
}

/// Increment duplicate fills counter.
pub fn inc_fills_duplicate() {
    counter!(METRIC_FILLS_DUPLICATE).increment(1);
}

/// Increment rejected fills counter.
pub fn inc_fills_rejected() {
    counter!(METRIC_FILLS_REJECTED).increment(1);
}

/// Increment positions completed counter.
pub fn inc_positions_completed() {
    counter!(METRIC_POSITIONS_COMPLETED).increment(1);
}

/// Increment positions flagged counter.
pub fn inc_positions_flagged() {
    counter!(METRIC_POSITIONS_FLAGGED).increment(1);
}

/// Increment re-quoted legs counter.
pub fn inc_legs_requoted() {
    counter!(METRIC_LEGS_REQUOTED).increment(1);
}

/// Increment resolution polls counter.
pub fn inc_resolution_polls() {
    counter!(METRIC_RESOLUTION_POLLS).increment(1);
}

/// Increment redemptions succeeded counter.
pub fn inc_redemptions_succeeded() {
    counter!(METRIC_REDEMPTIONS_SUCCEEDED).increment(1);
}

/// Increment redemptions failed counter.
pub fn inc_redemptions_failed() {
    counter!(METRIC_REDEMPTIONS_FAILED).increment(1);
}

/// Increment redemptions exhausted counter.
pub fn inc_redemptions_exhausted() {
    counter!(METRIC_REDEMPTIONS_EXHAUSTED).increment(1);
}

/// Increment risk rejections counter.
pub fn inc_risk_rejections(reason: &'static str) {
    counter!(METRIC_RISK_REJECTIONS, "reason" => reason).increment(1);
}

/// Publish risk gauges.
pub fn set_risk_gauges(exposure: Decimal, open_sets: usize, daily_pnl: Decimal, multiplier: Decimal) {
    gauge!(METRIC_EXPOSURE).set(exposure.to_f64().unwrap_or_default());
    gauge!(METRIC_OPEN_SETS).set(open_sets as f64);
    gauge!(METRIC_DAILY_PNL).set(daily_pnl.to_f64().unwrap_or_default());
    gauge!(METRIC_SIZE_MULTIPLIER).set(multiplier.to_f64().unwrap_or_default());
}

/// RAII guard for timing operations.
/// Automatically records latency when dropped.
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
}

impl LatencyTimer {
    /// Create a new latency timer for the given metric.
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    /// Get elapsed time in milliseconds (without recording).
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(self.metric_name).record(self.elapsed_ms());
    }
}

/// Create a latency timer for order submission.
pub fn timer_order_submit() -> LatencyTimer {
    LatencyTimer::new(METRIC_ORDER_SUBMIT_LATENCY)
}

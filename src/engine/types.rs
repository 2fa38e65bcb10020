use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Target,
    StopLoss,
    TimeExit,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::Target => "target",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TimeExit => "time_exit",
        }
    }
}

/// Opening-range statistics for one (day, OR duration).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrStats {
    pub high: f64,
    pub low: f64,
    pub avg_volume: f64,
    /// (high - low) as a percentage of the range midpoint.
    pub range_pct: f64,
}

/// One simulated intraday trade. Created by the kernel, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: String,
    pub date: NaiveDate,
    pub direction: Direction,
    pub entry_time: NaiveDateTime,
    pub entry_price: f64,
    pub exit_time: NaiveDateTime,
    pub exit_price: f64,
    pub quantity: i64,
    pub stop_loss_initial: f64,
    /// Differs from the initial stop only on the trailing path.
    pub stop_loss_final: f64,
    /// 0 when no target was set.
    pub target_price: f64,
    pub or_high: f64,
    pub or_low: f64,
    pub exit_reason: ExitReason,
    pub gross_pnl: f64,
    /// Brokerage + STT.
    pub costs: f64,
    pub net_pnl: f64,
    /// risk_per_share * quantity.
    pub risk_amount: f64,
    /// net_pnl / risk_amount.
    pub r_multiple: f64,
}

impl Trade {
    pub fn holding_minutes(&self) -> f64 {
        (self.exit_time - self.entry_time).num_seconds() as f64 / 60.0
    }
}

/// All computed metrics for one (instrument, params) combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceResult {
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub win_rate: f64,
    /// Gross P&L before costs.
    pub total_pnl: f64,
    pub net_pnl: f64,
    pub avg_pnl_per_trade: f64,
    pub avg_winner: f64,
    pub avg_loser: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub max_consecutive_losses: i64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub expectancy: f64,
    pub avg_r_multiple: f64,
    pub calmar_ratio: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub avg_holding_minutes: f64,
    /// Weighted ranking score; the empty-trade sentinel is a large
    /// negative constant so no-trade combos sort last.
    pub composite_score: f64,
}

/// Round to two decimals (monetary values).
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Round to four decimals (rates and ratios).
pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

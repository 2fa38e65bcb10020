//! Performance metrics over a trade list.
//!
//! Pure reduction: a trade list and the starting capital in, a
//! `PerformanceResult` out. Degenerate inputs never raise — an empty list
//! produces the zeroed result with the sentinel composite score.

use rustc_hash::FxHashMap;

use crate::engine::types::{round2, round4, PerformanceResult, Trade};

/// Maximum finite value for profit factor and Sortino when there are no
/// losses. Avoids infinities in stored rows.
const MAX_PROFIT_FACTOR: f64 = 999.99;

/// Composite score assigned to empty trade lists so no-trade combos rank
/// below every combo that actually traded.
pub const EMPTY_SCORE: f64 = -999_999.0;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

pub const EMPTY_RESULT: PerformanceResult = PerformanceResult {
    total_trades: 0,
    winning_trades: 0,
    losing_trades: 0,
    win_rate: 0.0,
    total_pnl: 0.0,
    net_pnl: 0.0,
    avg_pnl_per_trade: 0.0,
    avg_winner: 0.0,
    avg_loser: 0.0,
    profit_factor: 0.0,
    max_drawdown: 0.0,
    max_drawdown_pct: 0.0,
    max_consecutive_losses: 0,
    sharpe_ratio: 0.0,
    sortino_ratio: 0.0,
    expectancy: 0.0,
    avg_r_multiple: 0.0,
    calmar_ratio: 0.0,
    best_trade: 0.0,
    worst_trade: 0.0,
    avg_holding_minutes: 0.0,
    composite_score: EMPTY_SCORE,
};

#[derive(Debug, Clone, Copy)]
pub struct MetricsCalculator {
    pub capital: f64,
}

impl Default for MetricsCalculator {
    fn default() -> Self {
        Self { capital: 100_000.0 }
    }
}

impl MetricsCalculator {
    pub fn new(capital: f64) -> Self {
        Self { capital }
    }

    /// Compute all metrics from a chronologically ordered trade list.
    ///
    /// Winners are trades with net P&L > 0; a zero-P&L trade counts as a
    /// loser. Profit factor caps at 999.99 when there are no losses.
    pub fn compute(&self, trades: &[Trade]) -> PerformanceResult {
        if trades.is_empty() {
            return EMPTY_RESULT;
        }

        let total = trades.len() as f64;
        let net_pnls: Vec<f64> = trades.iter().map(|t| t.net_pnl).collect();

        let gross_total: f64 = trades.iter().map(|t| t.gross_pnl).sum();
        let net_total: f64 = net_pnls.iter().sum();

        let mut winner_count = 0i64;
        let mut loser_count = 0i64;
        let mut winner_sum = 0.0;
        let mut loser_sum = 0.0;
        for &pnl in &net_pnls {
            if pnl > 0.0 {
                winner_count += 1;
                winner_sum += pnl;
            } else {
                loser_count += 1;
                loser_sum += pnl;
            }
        }
        let win_rate = winner_count as f64 / total;
        let loss_rate = loser_count as f64 / total;
        let avg_winner = if winner_count > 0 {
            winner_sum / winner_count as f64
        } else {
            0.0
        };
        let avg_loser = if loser_count > 0 {
            loser_sum / loser_count as f64
        } else {
            0.0
        };

        let gross_losses = loser_sum.abs();
        let profit_factor = if gross_losses > 0.0 {
            winner_sum / gross_losses
        } else if winner_sum > 0.0 {
            MAX_PROFIT_FACTOR
        } else {
            0.0
        };

        let (max_dd, max_dd_pct) = self.drawdown(&net_pnls);
        let max_consecutive_losses = max_consecutive_losses(&net_pnls);

        let daily_returns = self.daily_returns(trades);
        let sharpe = sharpe_ratio(&daily_returns);
        let sortino = sortino_ratio(&daily_returns);

        let expectancy = avg_winner * win_rate - avg_loser.abs() * loss_rate;
        let avg_r = trades.iter().map(|t| t.r_multiple).sum::<f64>() / total;
        let calmar = calmar_ratio(trades, net_total, max_dd);

        let best = net_pnls.iter().copied().fold(f64::MIN, f64::max);
        let worst = net_pnls.iter().copied().fold(f64::MAX, f64::min);
        let avg_holding =
            trades.iter().map(Trade::holding_minutes).sum::<f64>() / total;

        let composite = self.composite_score(
            net_total,
            sharpe,
            profit_factor,
            win_rate,
            max_dd_pct,
            expectancy,
        );

        PerformanceResult {
            total_trades: trades.len() as i64,
            winning_trades: winner_count,
            losing_trades: loser_count,
            win_rate: round4(win_rate),
            total_pnl: round2(gross_total),
            net_pnl: round2(net_total),
            avg_pnl_per_trade: round2(net_total / total),
            avg_winner: round2(avg_winner),
            avg_loser: round2(avg_loser),
            profit_factor: round2(profit_factor.min(MAX_PROFIT_FACTOR)),
            max_drawdown: round2(max_dd),
            max_drawdown_pct: round4(max_dd_pct),
            max_consecutive_losses,
            sharpe_ratio: round4(sharpe),
            sortino_ratio: round4(sortino),
            expectancy: round2(expectancy),
            avg_r_multiple: round4(avg_r),
            calmar_ratio: round4(calmar),
            best_trade: round2(best),
            worst_trade: round2(worst),
            avg_holding_minutes: (avg_holding * 10.0).round() / 10.0,
            composite_score: round4(composite),
        }
    }

    /// Max drawdown of the running equity curve (capital + cumulative net),
    /// absolute and as a fraction of capital.
    fn drawdown(&self, net_pnls: &[f64]) -> (f64, f64) {
        let mut equity = self.capital;
        let mut peak = equity;
        let mut max_dd = 0.0f64;
        for &pnl in net_pnls {
            equity += pnl;
            peak = peak.max(equity);
            max_dd = max_dd.max(peak - equity);
        }
        let pct = if self.capital > 0.0 {
            max_dd / self.capital
        } else {
            0.0
        };
        (max_dd, pct)
    }

    /// Net P&Ls aggregated by trade date, as fractions of capital.
    fn daily_returns(&self, trades: &[Trade]) -> Vec<f64> {
        let mut daily: Vec<f64> = Vec::new();
        let mut index = FxHashMap::default();
        for t in trades {
            match index.get(&t.date) {
                Some(&i) => daily[i] += t.net_pnl,
                None => {
                    index.insert(t.date, daily.len());
                    daily.push(t.net_pnl);
                }
            }
        }
        if self.capital > 0.0 {
            for r in &mut daily {
                *r /= self.capital;
            }
        }
        daily
    }

    fn composite_score(
        &self,
        net_pnl: f64,
        sharpe: f64,
        profit_factor: f64,
        win_rate: f64,
        max_dd_pct: f64,
        expectancy: f64,
    ) -> f64 {
        let pnl_score = if self.capital > 0.0 {
            net_pnl / self.capital
        } else {
            0.0
        };
        // Cap profit factor at 10 to prevent outlier dominance; invert
        // drawdown so lower is better.
        let pf_score = profit_factor.min(10.0) / 10.0;
        let dd_score = (1.0 - max_dd_pct.min(1.0)).max(0.0);
        let exp_score = if self.capital > 0.0 {
            expectancy / (self.capital * 0.01)
        } else {
            0.0
        };

        0.25 * pnl_score
            + 0.20 * sharpe
            + 0.15 * pf_score
            + 0.15 * win_rate
            + 0.15 * dd_score
            + 0.10 * exp_score
    }
}

fn max_consecutive_losses(net_pnls: &[f64]) -> i64 {
    let mut max_run = 0i64;
    let mut run = 0i64;
    for &pnl in net_pnls {
        if pnl <= 0.0 {
            run += 1;
            max_run = max_run.max(run);
        } else {
            run = 0;
        }
    }
    max_run
}

/// Annualized Sharpe over daily returns: sample standard deviation (n-1),
/// risk-free rate zero. Zero when fewer than two distinct days or zero
/// variance.
fn sharpe_ratio(daily_returns: &[f64]) -> f64 {
    if daily_returns.len() < 2 {
        return 0.0;
    }
    let n = daily_returns.len() as f64;
    let mean = daily_returns.iter().sum::<f64>() / n;
    let variance = daily_returns
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    if variance <= 0.0 {
        return 0.0;
    }
    mean / variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Annualized Sortino. The downside deviation divides the sum of squared
/// negative returns by n (all returns), preserved as the original contract.
/// Caps at 999.99 when the mean is positive and there is no downside.
fn sortino_ratio(daily_returns: &[f64]) -> f64 {
    if daily_returns.len() < 2 {
        return 0.0;
    }
    let n = daily_returns.len() as f64;
    let mean = daily_returns.iter().sum::<f64>() / n;
    let downside_sq: f64 = daily_returns
        .iter()
        .filter(|r| **r < 0.0)
        .map(|r| r.powi(2))
        .sum();
    if downside_sq <= 0.0 {
        return if mean > 0.0 { MAX_PROFIT_FACTOR } else { 0.0 };
    }
    let downside_dev = (downside_sq / n).sqrt();
    mean / downside_dev * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Annualized net P&L over max drawdown, with years clamped to at least
/// one when all trades share a date.
fn calmar_ratio(trades: &[Trade], net_total: f64, max_dd: f64) -> f64 {
    if max_dd <= 0.0 || trades.is_empty() {
        return 0.0;
    }
    let first = trades.first().expect("non-empty").date;
    let last = trades.last().expect("non-empty").date;
    let days = (last - first).num_days();
    let years = if days > 0 { days as f64 / 365.25 } else { 1.0 };
    net_total / years / max_dd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{Direction, ExitReason, Trade};
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn trade(date: NaiveDate, net_pnl: f64) -> Trade {
        let gross = net_pnl + 20.0;
        Trade {
            instrument: "RELIND".to_string(),
            date,
            direction: Direction::Long,
            entry_time: date.and_hms_opt(9, 30, 0).unwrap(),
            entry_price: 100.0,
            exit_time: date.and_hms_opt(10, 30, 0).unwrap(),
            exit_price: 100.0 + gross / 500.0,
            quantity: 500,
            stop_loss_initial: 98.0,
            stop_loss_final: 98.0,
            target_price: 0.0,
            or_high: 100.0,
            or_low: 98.0,
            exit_reason: ExitReason::TimeExit,
            gross_pnl: gross,
            costs: 20.0,
            net_pnl,
            risk_amount: 1000.0,
            r_multiple: net_pnl / 1000.0,
        }
    }

    #[test]
    fn empty_trades_produce_sentinel() {
        let m = MetricsCalculator::default().compute(&[]);
        assert_eq!(m, EMPTY_RESULT);
        assert_eq!(m.total_trades, 0);
        assert!((m.composite_score - EMPTY_SCORE).abs() < f64::EPSILON);
    }

    #[test]
    fn win_rate_counts_zero_pnl_as_loss() {
        let trades = vec![
            trade(day(4), 500.0),
            trade(day(5), 0.0),
            trade(day(6), -300.0),
        ];
        let m = MetricsCalculator::default().compute(&trades);
        // 1 winner out of 3; the scratch trade is a loser.
        assert_eq!(m.winning_trades, 1);
        assert_eq!(m.losing_trades, 2);
        assert!((m.win_rate - round4(1.0 / 3.0)).abs() < 1e-9);
        // Zero-PnL extends the losing streak: scratch + loss = 2.
        assert_eq!(m.max_consecutive_losses, 2);
    }

    #[test]
    fn profit_factor_capped_without_losses() {
        let trades = vec![trade(day(4), 100.0), trade(day(5), 200.0)];
        let m = MetricsCalculator::default().compute(&trades);
        assert!((m.profit_factor - 999.99).abs() < 1e-9);
        // All winners and positive mean with no downside: Sortino caps too.
        assert!((m.sortino_ratio - 999.99).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_ratio() {
        let trades = vec![
            trade(day(4), 300.0),
            trade(day(5), -100.0),
            trade(day(6), 100.0),
        ];
        let m = MetricsCalculator::default().compute(&trades);
        // 400 gained / 100 lost = 4.
        assert!((m.profit_factor - 4.0).abs() < 1e-9);
        assert!((m.avg_winner - 200.0).abs() < 1e-9);
        assert!((m.avg_loser + 100.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_from_equity_curve() {
        // Equity: 100500, 100200, 99700, 100100. Peak 100500, trough
        // 99700 -> dd 800, pct 0.008.
        let trades = vec![
            trade(day(4), 500.0),
            trade(day(5), -300.0),
            trade(day(6), -500.0),
            trade(day(7), 400.0),
        ];
        let m = MetricsCalculator::default().compute(&trades);
        assert!((m.max_drawdown - 800.0).abs() < 1e-9);
        assert!((m.max_drawdown_pct - 0.008).abs() < 1e-9);
        assert_eq!(m.max_consecutive_losses, 2);
    }

    #[test]
    fn sharpe_zero_for_single_day() {
        // Two trades on the same date aggregate into one daily return.
        let trades = vec![trade(day(4), 500.0), trade(day(4), -200.0)];
        let m = MetricsCalculator::default().compute(&trades);
        assert!((m.sharpe_ratio - 0.0).abs() < f64::EPSILON);
        assert!((m.sortino_ratio - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sharpe_known_value() {
        // Daily returns 0.01 and -0.005 (capital 100k): mean 0.0025,
        // sample std = 0.0106066..., sharpe = mean/std*sqrt(252) = 3.7417.
        let trades = vec![trade(day(4), 1000.0), trade(day(5), -500.0)];
        let m = MetricsCalculator::default().compute(&trades);
        let mean = 0.0025f64;
        let std = ((0.01f64 - mean).powi(2) + (-0.005f64 - mean).powi(2)).sqrt();
        let expected = mean / std * 252f64.sqrt();
        assert!((m.sharpe_ratio - round4(expected)).abs() < 1e-9);
    }

    #[test]
    fn sortino_uses_all_returns_in_denominator() {
        // Returns: 0.01, -0.005, 0.002. Downside squared sum = 0.000025,
        // divided by n=3 (not by the single negative).
        let trades = vec![
            trade(day(4), 1000.0),
            trade(day(5), -500.0),
            trade(day(6), 200.0),
        ];
        let m = MetricsCalculator::default().compute(&trades);
        let mean = (0.01 - 0.005 + 0.002) / 3.0;
        let downside_dev = (0.005f64.powi(2) / 3.0).sqrt();
        let expected = mean / downside_dev * 252f64.sqrt();
        assert!((m.sortino_ratio - round4(expected)).abs() < 1e-9);
    }

    #[test]
    fn expectancy_formula() {
        // win_rate 0.5, avg_winner 175, avg_loser -75:
        // expectancy = 175*0.5 - 75*0.5 = 50.
        let trades = vec![
            trade(day(4), 200.0),
            trade(day(5), -100.0),
            trade(day(6), 150.0),
            trade(day(7), -50.0),
        ];
        let m = MetricsCalculator::default().compute(&trades);
        assert!((m.expectancy - 50.0).abs() < 1e-9);
        assert!((m.best_trade - 200.0).abs() < 1e-9);
        assert!((m.worst_trade + 100.0).abs() < 1e-9);
    }

    #[test]
    fn calmar_clamps_to_one_year_minimum() {
        // Same-day trades: years = 1, calmar = net / max_dd.
        let trades = vec![trade(day(4), -400.0), trade(day(4), 900.0)];
        let m = MetricsCalculator::default().compute(&trades);
        // Equity dips 400 then recovers: dd 400; net 500.
        assert!((m.calmar_ratio - round4(500.0 / 400.0)).abs() < 1e-9);
    }

    #[test]
    fn composite_score_weighted_sum() {
        let trades = vec![trade(day(4), 1000.0), trade(day(5), -500.0)];
        let calc = MetricsCalculator::default();
        let m = calc.compute(&trades);

        let pnl_score = 500.0 / 100_000.0;
        let pf_score = 2.0f64.min(10.0) / 10.0;
        let dd_score = 1.0 - 0.005;
        let exp_score = (1000.0 * 0.5 - 500.0 * 0.5) / 1000.0;
        let expected = 0.25 * pnl_score
            + 0.20 * m.sharpe_ratio
            + 0.15 * pf_score
            + 0.15 * 0.5
            + 0.15 * dd_score
            + 0.10 * exp_score;
        assert!((m.composite_score - round4(expected)).abs() < 2e-4);
    }

    #[test]
    fn average_holding_minutes() {
        let trades = vec![trade(day(4), 100.0), trade(day(5), 100.0)];
        let m = MetricsCalculator::default().compute(&trades);
        // Fixture trades hold 09:30 -> 10:30.
        assert!((m.avg_holding_minutes - 60.0).abs() < 1e-9);
    }
}

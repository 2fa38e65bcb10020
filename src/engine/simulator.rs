//! Opening-range-breakout simulation kernel.
//!
//! For each trading day the entry is looked up from the day cache's
//! precomputed first-breakout indices, and the exit is found either by a
//! bulk first-hit scan (fixed and ATR stops) or by a sequential walk
//! (trailing stops, whose ratchet needs per-bar state). The per-day path
//! has no error channel: a day yields a `Trade` or nothing.
//!
//! Documented fill assumption: a stop exit fills at the stop price itself,
//! not the bar's adverse extreme. Changing this is a behavioral change and
//! must be versioned into the run's config snapshot.

use chrono::NaiveDate;
use rustc_hash::FxHashMap;

use crate::data::loader::InstrumentView;
use crate::engine::cache::DayCache;
use crate::engine::types::{round2, round4, Direction, ExitReason, OrStats, Trade};
use crate::grid::{EntryConfirmation, StopLossType, StrategyParams};

/// Kernel configuration: capital, per-trade risk budget and cost rates.
/// Explicit parameters, no global state.
#[derive(Debug, Clone, Copy)]
pub struct Simulator {
    pub capital: f64,
    pub max_risk_per_trade: f64,
    pub brokerage_rate: f64,
    pub stt_rate: f64,
}

impl Default for Simulator {
    fn default() -> Self {
        Self {
            capital: 100_000.0,
            max_risk_per_trade: 1_000.0,
            brokerage_rate: 0.0001,
            stt_rate: 0.000_25,
        }
    }
}

struct Entry {
    direction: Direction,
    price: f64,
    idx: usize,
}

struct Exit {
    price: f64,
    idx: usize,
    reason: ExitReason,
    stop_final: f64,
}

impl Simulator {
    /// Run one parameter set over every cached day of an instrument,
    /// reusing day caches shared across the (or_minutes, exit_time) group.
    pub fn run(
        &self,
        view: &InstrumentView,
        params: &StrategyParams,
        or_data: &FxHashMap<NaiveDate, OrStats>,
        day_caches: &[DayCache],
    ) -> Vec<Trade> {
        let mut trades = Vec::new();

        let allow_long = params.trade_direction.allows_long();
        let allow_short = params.trade_direction.allows_short();
        let is_trailing = params.stop_loss_type == StopLossType::Trailing;

        for dc in day_caches {
            let Some(or_stats) = or_data.get(&dc.date) else {
                continue;
            };

            if params.max_or_filter_pct > 0.0 && or_stats.range_pct > params.max_or_filter_pct
            {
                continue;
            }

            let Some(entry) = find_entry(dc, or_stats, params.entry_confirmation, allow_long, allow_short)
            else {
                continue;
            };

            let atr = view.atr_for(dc.date).unwrap_or(0.0);
            let stop_loss = initial_stop_loss(entry.direction, entry.price, or_stats, atr, params);

            let risk_per_share = (entry.price - stop_loss).abs();
            if risk_per_share <= 0.0 {
                continue;
            }
            let affordable = if entry.price > 0.0 {
                (self.capital / entry.price) as i64
            } else {
                0
            };
            let quantity = ((self.max_risk_per_trade / risk_per_share) as i64).min(affordable);
            if quantity <= 0 {
                continue;
            }

            let target_price = if params.target_multiplier > 0.0 {
                entry.price + entry.direction.sign() * risk_per_share * params.target_multiplier
            } else {
                0.0
            };

            let exit = if is_trailing {
                find_exit_trailing(
                    dc,
                    entry.direction,
                    entry.idx,
                    stop_loss,
                    target_price,
                    params.trailing_stop_pct,
                )
            } else {
                find_exit_vectorized(dc, entry.direction, entry.idx, stop_loss, target_price)
            };

            trades.push(self.build_trade(
                &view.instrument,
                dc,
                or_stats,
                &entry,
                &exit,
                quantity,
                stop_loss,
                target_price,
                risk_per_share,
            ));
        }

        trades
    }

    #[allow(clippy::too_many_arguments)]
    fn build_trade(
        &self,
        instrument: &str,
        dc: &DayCache,
        or_stats: &OrStats,
        entry: &Entry,
        exit: &Exit,
        quantity: i64,
        stop_loss: f64,
        target_price: f64,
        risk_per_share: f64,
    ) -> Trade {
        let qty = quantity as f64;
        let gross_pnl = (exit.price - entry.price) * entry.direction.sign() * qty;
        let brokerage = entry.price * qty * self.brokerage_rate * 2.0;
        let stt = exit.price * qty * self.stt_rate;
        let costs = brokerage + stt;
        let net_pnl = gross_pnl - costs;
        let risk_amount = risk_per_share * qty;
        let r_multiple = if risk_amount > 0.0 {
            net_pnl / risk_amount
        } else {
            0.0
        };

        Trade {
            instrument: instrument.to_string(),
            date: dc.date,
            direction: entry.direction,
            entry_time: dc.timestamps[entry.idx],
            entry_price: round2(entry.price),
            exit_time: dc.timestamps[exit.idx],
            exit_price: round2(exit.price),
            quantity,
            stop_loss_initial: round2(stop_loss),
            stop_loss_final: round2(exit.stop_final),
            target_price: round2(target_price),
            or_high: round2(or_stats.high),
            or_low: round2(or_stats.low),
            exit_reason: exit.reason,
            gross_pnl: round2(gross_pnl),
            costs: round2(costs),
            net_pnl: round2(net_pnl),
            risk_amount: round2(risk_amount),
            r_multiple: round4(r_multiple),
        }
    }
}

/// Pick the entry side and bar from the precomputed indices. When both
/// sides fire, the earlier bar wins; an exact tie resolves to LONG
/// (documented contract).
fn find_entry(
    dc: &DayCache,
    or_stats: &OrStats,
    confirmation: EntryConfirmation,
    allow_long: bool,
    allow_short: bool,
) -> Option<Entry> {
    let long_idx = if allow_long {
        match confirmation {
            EntryConfirmation::Immediate => dc.first_long_immediate,
            EntryConfirmation::CandleClose => dc.first_long_close,
            EntryConfirmation::VolumeConfirm => dc.first_long_volume,
        }
    } else {
        None
    };
    let short_idx = if allow_short {
        match confirmation {
            EntryConfirmation::Immediate => dc.first_short_immediate,
            EntryConfirmation::CandleClose => dc.first_short_close,
            EntryConfirmation::VolumeConfirm => dc.first_short_volume,
        }
    } else {
        None
    };

    let (direction, idx) = match (long_idx, short_idx) {
        (Some(l), Some(s)) => {
            if l <= s {
                (Direction::Long, l)
            } else {
                (Direction::Short, s)
            }
        }
        (Some(l), None) => (Direction::Long, l),
        (None, Some(s)) => (Direction::Short, s),
        (None, None) => return None,
    };

    // Immediate entries fill at the OR boundary; confirmed entries fill at
    // the confirming bar's close.
    let price = match (confirmation, direction) {
        (EntryConfirmation::Immediate, Direction::Long) => or_stats.high,
        (EntryConfirmation::Immediate, Direction::Short) => or_stats.low,
        (_, _) => dc.closes[idx],
    };

    Some(Entry {
        direction,
        price,
        idx,
    })
}

fn initial_stop_loss(
    direction: Direction,
    entry_price: f64,
    or_stats: &OrStats,
    atr: f64,
    params: &StrategyParams,
) -> f64 {
    let fixed = match direction {
        Direction::Long => or_stats.low,
        Direction::Short => or_stats.high,
    };
    match params.stop_loss_type {
        StopLossType::Fixed => fixed,
        StopLossType::Trailing => {
            entry_price * (1.0 - direction.sign() * params.trailing_stop_pct / 100.0)
        }
        StopLossType::AtrBased => {
            if atr > 0.0 {
                entry_price - direction.sign() * atr * params.atr_multiplier
            } else {
                // No ATR available yet this early in the history.
                fixed
            }
        }
    }
}

/// First-hit scan for fixed and ATR stops: no per-bar state, so stop and
/// target hits reduce to two array searches starting one bar after entry.
/// A same-bar stop+target tie resolves to the stop (conservative).
fn find_exit_vectorized(
    dc: &DayCache,
    direction: Direction,
    entry_idx: usize,
    stop_loss: f64,
    target_price: f64,
) -> Exit {
    let start = entry_idx + 1;
    let n = dc.len();
    if start >= n {
        // Entered on the final cached bar: flatten on its close.
        return Exit {
            price: dc.closes[entry_idx],
            idx: entry_idx,
            reason: ExitReason::TimeExit,
            stop_final: stop_loss,
        };
    }

    let sl_idx = match direction {
        Direction::Long => dc.lows[start..].iter().position(|&l| l <= stop_loss),
        Direction::Short => dc.highs[start..].iter().position(|&h| h >= stop_loss),
    }
    .map(|i| i + start);

    let tgt_idx = if target_price > 0.0 {
        match direction {
            Direction::Long => dc.highs[start..].iter().position(|&h| h >= target_price),
            Direction::Short => dc.lows[start..].iter().position(|&l| l <= target_price),
        }
        .map(|i| i + start)
    } else {
        None
    };

    match (sl_idx, tgt_idx) {
        (Some(s), Some(t)) if s <= t => Exit {
            price: stop_loss,
            idx: s,
            reason: ExitReason::StopLoss,
            stop_final: stop_loss,
        },
        (_, Some(t)) => Exit {
            price: target_price,
            idx: t,
            reason: ExitReason::Target,
            stop_final: stop_loss,
        },
        (Some(s), None) => Exit {
            price: stop_loss,
            idx: s,
            reason: ExitReason::StopLoss,
            stop_final: stop_loss,
        },
        (None, None) => Exit {
            price: dc.closes[n - 1],
            idx: n - 1,
            reason: ExitReason::TimeExit,
            stop_final: stop_loss,
        },
    }
}

/// Sequential walk for trailing stops. The stop ratchets from the running
/// peak (long) or trough (short) and never loosens; a same-bar stop+target
/// hit resolves to the stop.
fn find_exit_trailing(
    dc: &DayCache,
    direction: Direction,
    entry_idx: usize,
    stop_loss: f64,
    target_price: f64,
    trailing_pct: f64,
) -> Exit {
    let start = entry_idx + 1;
    let n = dc.len();
    if start >= n {
        return Exit {
            price: dc.closes[entry_idx],
            idx: entry_idx,
            reason: ExitReason::TimeExit,
            stop_final: stop_loss,
        };
    }

    let trailing_mult = trailing_pct / 100.0;
    let mut peak = match direction {
        Direction::Long => dc.highs[entry_idx],
        Direction::Short => dc.lows[entry_idx],
    };
    let mut stop = stop_loss;

    for i in start..n {
        let high = dc.highs[i];
        let low = dc.lows[i];

        let (stop_hit, target_hit) = match direction {
            Direction::Long => {
                if high > peak {
                    peak = high;
                    let candidate = peak * (1.0 - trailing_mult);
                    if candidate > stop {
                        stop = candidate;
                    }
                }
                (low <= stop, target_price > 0.0 && high >= target_price)
            }
            Direction::Short => {
                if low < peak {
                    peak = low;
                    let candidate = peak * (1.0 + trailing_mult);
                    if candidate < stop {
                        stop = candidate;
                    }
                }
                (high >= stop, target_price > 0.0 && low <= target_price)
            }
        };

        if stop_hit {
            return Exit {
                price: stop,
                idx: i,
                reason: ExitReason::StopLoss,
                stop_final: stop,
            };
        }
        if target_hit {
            return Exit {
                price: target_price,
                idx: i,
                reason: ExitReason::Target,
                stop_final: stop,
            };
        }
    }

    Exit {
        price: dc.closes[n - 1],
        idx: n - 1,
        reason: ExitReason::TimeExit,
        stop_final: stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bars::{Bar, BarStore};
    use crate::data::loader::load_instrument;
    use crate::grid::TradeDirection;
    use chrono::{NaiveDate, NaiveTime};
    use tempfile::TempDir;

    fn d4() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn bar(h: u32, m: u32, high: f64, low: f64, close: f64, vol: i64) -> Bar {
        Bar {
            ts: d4().and_hms_opt(h, m, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: vol,
        }
    }

    fn params(overrides: impl FnOnce(&mut StrategyParams)) -> StrategyParams {
        let mut p = StrategyParams {
            or_minutes: 15,
            target_multiplier: 2.0,
            stop_loss_type: StopLossType::Fixed,
            trade_direction: TradeDirection::Both,
            exit_time: NaiveTime::from_hms_opt(15, 14, 0).unwrap(),
            max_or_filter_pct: 0.0,
            entry_confirmation: EntryConfirmation::Immediate,
            trailing_stop_pct: 0.5,
            atr_multiplier: 1.5,
            atr_period: 14,
        };
        overrides(&mut p);
        p
    }

    fn view_from(bars: &[Bar]) -> (TempDir, InstrumentView) {
        let dir = TempDir::new().unwrap();
        let mut store = BarStore::open(&dir.path().join("bars.db")).unwrap();
        store.insert_bars("RELIND", bars).unwrap();
        let view = load_instrument(&store, "RELIND", None, None, &[15]).unwrap();
        (dir, view)
    }

    fn run_one(bars: &[Bar], p: &StrategyParams) -> Vec<Trade> {
        let (_dir, view) = view_from(bars);
        let or_data = view.or_stats(15).unwrap().clone();
        let caches =
            crate::engine::cache::build_day_caches(&view, &or_data, 15, p.exit_time);
        Simulator::default().run(&view, p, &or_data, &caches)
    }

    /// OR window bars establishing or_high=100, or_low=98.
    fn or_window() -> Vec<Bar> {
        vec![
            bar(9, 15, 100.0, 98.0, 99.0, 100),
            bar(9, 20, 99.8, 98.2, 99.5, 100),
        ]
    }

    #[test]
    fn single_long_winner_hits_target() {
        // Breakout at 09:30 (high 101 > 100), target = 100 + 2*2 = 104,
        // hit by the 10:00 bar (high 104).
        let mut bars = or_window();
        bars.push(bar(9, 30, 101.0, 99.5, 100.5, 150));
        bars.push(bar(9, 45, 102.0, 100.0, 101.5, 150));
        bars.push(bar(10, 0, 104.0, 101.0, 103.5, 150));
        bars.push(bar(10, 15, 103.0, 102.0, 102.5, 150));

        let trades = run_one(&bars, &params(|_| {}));
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.direction, Direction::Long);
        assert_eq!(t.exit_reason, ExitReason::Target);
        assert!((t.entry_price - 100.0).abs() < 1e-9);
        assert!((t.exit_price - 104.0).abs() < 1e-9);
        // risk/share = 2, qty = min(1000/2, 100000/100) = 500.
        assert_eq!(t.quantity, 500);
        assert!((t.gross_pnl - 2000.0).abs() < 1e-9);
        assert_eq!(t.entry_time, d4().and_hms_opt(9, 30, 0).unwrap());
        assert_eq!(t.exit_time, d4().and_hms_opt(10, 0, 0).unwrap());
    }

    #[test]
    fn or_filter_suppresses_wide_days() {
        // OR range 2 on midpoint 99 -> ~2.02%; a 1% filter skips the day.
        let mut bars = or_window();
        bars.push(bar(9, 30, 101.0, 99.5, 100.5, 150));
        let trades = run_one(&bars, &params(|p| p.max_or_filter_pct = 1.0));
        assert!(trades.is_empty());
        // A permissive filter lets the same day trade.
        let trades = run_one(&bars, &params(|p| p.max_or_filter_pct = 5.0));
        assert_eq!(trades.len(), 1);
    }

    #[test]
    fn stop_and_target_same_bar_resolves_to_stop() {
        // Entry long at 100 (09:30). The 09:45 bar spans 97..105, touching
        // both the stop (98) and the target (104): stop wins.
        let mut bars = or_window();
        bars.push(bar(9, 30, 101.0, 100.0, 100.5, 150));
        bars.push(bar(9, 45, 105.0, 97.0, 101.0, 150));

        let trades = run_one(&bars, &params(|_| {}));
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.exit_reason, ExitReason::StopLoss);
        // Idealized fill at the stop, not the bar low.
        assert!((t.exit_price - 98.0).abs() < 1e-9);
        assert!((t.exit_price - t.stop_loss_initial).abs() < 1e-9);
        // r_multiple sign follows the loss.
        assert!(t.r_multiple < 0.0);
    }

    #[test]
    fn time_exit_at_last_cached_close() {
        // Nothing after entry touches 98 or 104; flatten at the last close.
        let mut bars = or_window();
        bars.push(bar(9, 30, 101.0, 100.0, 100.5, 150));
        bars.push(bar(9, 45, 101.5, 100.2, 101.0, 150));
        bars.push(bar(10, 0, 101.8, 100.5, 101.2, 150));

        let trades = run_one(&bars, &params(|_| {}));
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.exit_reason, ExitReason::TimeExit);
        assert!((t.exit_price - 101.2).abs() < 1e-9);
        assert_eq!(t.exit_time, d4().and_hms_opt(10, 0, 0).unwrap());
    }

    #[test]
    fn entry_tie_resolves_long() {
        // One bar breaks both edges at the same index with direction=BOTH.
        let mut bars = or_window();
        bars.push(bar(9, 30, 101.0, 97.0, 99.0, 150));
        bars.push(bar(9, 45, 99.5, 98.5, 99.0, 150));

        let trades = run_one(&bars, &params(|_| {}));
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].direction, Direction::Long);
        assert!((trades[0].entry_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn short_entry_uses_or_low_and_symmetric_exits() {
        // Short-only: breakdown at 09:30 (low 97.5 < 98), stop at or_high
        // (100), target = 98 - 2*2 = 94, hit at 10:00.
        let mut bars = or_window();
        bars.push(bar(9, 30, 99.0, 97.5, 98.2, 150));
        bars.push(bar(9, 45, 98.5, 96.0, 96.5, 150));
        bars.push(bar(10, 0, 96.8, 93.5, 94.2, 150));

        let trades = run_one(
            &bars,
            &params(|p| p.trade_direction = TradeDirection::ShortOnly),
        );
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.direction, Direction::Short);
        assert!((t.entry_price - 98.0).abs() < 1e-9);
        assert!((t.stop_loss_initial - 100.0).abs() < 1e-9);
        assert_eq!(t.exit_reason, ExitReason::Target);
        assert!((t.exit_price - 94.0).abs() < 1e-9);
        // Short winner: positive gross despite exit < entry.
        assert!(t.gross_pnl > 0.0);
    }

    #[test]
    fn candle_close_entry_fills_at_close() {
        // 09:30 pierces 100 intrabar but closes inside; 09:45 closes at
        // 100.8. Candle-close confirmation enters there, at the close.
        let mut bars = or_window();
        bars.push(bar(9, 30, 100.5, 99.5, 99.8, 150));
        bars.push(bar(9, 45, 101.0, 100.0, 100.8, 150));
        bars.push(bar(10, 0, 101.5, 100.5, 101.0, 150));

        let trades = run_one(
            &bars,
            &params(|p| {
                p.entry_confirmation = EntryConfirmation::CandleClose;
                p.target_multiplier = 0.0;
            }),
        );
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert!((t.entry_price - 100.8).abs() < 1e-9);
        assert_eq!(t.entry_time, d4().and_hms_opt(9, 45, 0).unwrap());
        // No target set: disabled target persists as 0 on the trade.
        assert!((t.target_price - 0.0).abs() < f64::EPSILON);
        assert_eq!(t.exit_reason, ExitReason::TimeExit);
    }

    #[test]
    fn zero_trailing_pct_matches_fixed_exit() {
        // With trailing_stop_pct = 0 and no new high after the entry bar,
        // the trailing stop never ratchets, so the trailing kernel must
        // agree with the fixed kernel on exit bar and exit reason.
        let mut bars = or_window();
        bars.push(bar(9, 30, 101.0, 100.0, 100.5, 150)); // entry bar, peak 101
        bars.push(bar(9, 45, 100.8, 100.1, 100.4, 150));
        bars.push(bar(10, 0, 100.6, 97.9, 98.0, 150)); // breaches both stops

        let fixed = run_one(
            &bars,
            &params(|p| p.target_multiplier = 0.0),
        );
        let trailing = run_one(
            &bars,
            &params(|p| {
                p.stop_loss_type = StopLossType::Trailing;
                p.trailing_stop_pct = 0.0;
            }),
        );
        assert_eq!(fixed.len(), 1);
        assert_eq!(trailing.len(), 1);
        assert_eq!(fixed[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(trailing[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(fixed[0].exit_time, trailing[0].exit_time);
    }

    #[test]
    fn trailing_stop_ratchets_and_never_loosens() {
        // Long entry at 100, trailing 1%. The ratchet updates before the
        // hit check on each bar, so the lows are kept above each freshly
        // ratcheted stop (102 -> 100.98, 110 -> 108.9) until the pullback
        // bar finally trades through 108.9.
        let mut bars = or_window();
        bars.push(bar(9, 30, 101.0, 100.0, 100.5, 150));
        bars.push(bar(9, 45, 102.0, 101.2, 101.8, 150));
        bars.push(bar(10, 0, 110.0, 109.0, 109.5, 150));
        bars.push(bar(10, 15, 109.5, 108.0, 108.2, 150));

        let trades = run_one(
            &bars,
            &params(|p| {
                p.stop_loss_type = StopLossType::Trailing;
                p.trailing_stop_pct = 1.0;
                p.target_multiplier = 0.0;
            }),
        );
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.exit_reason, ExitReason::StopLoss);
        // Stop after the 110 peak: 110 * 0.99 = 108.9.
        assert!((t.stop_loss_final - 108.9).abs() < 1e-9);
        assert!(t.stop_loss_final > t.stop_loss_initial);
        assert!((t.exit_price - 108.9).abs() < 1e-9);
        // Winner despite the stop exit.
        assert!(t.net_pnl > 0.0);
    }

    #[test]
    fn atr_stop_falls_back_to_fixed_without_history() {
        // Single-day view: no ATR, so the ATR stop degrades to the OR edge.
        let mut bars = or_window();
        bars.push(bar(9, 30, 101.0, 100.0, 100.5, 150));
        bars.push(bar(9, 45, 101.5, 100.2, 101.0, 150));

        let trades = run_one(
            &bars,
            &params(|p| {
                p.stop_loss_type = StopLossType::AtrBased;
                p.target_multiplier = 0.0;
            }),
        );
        assert_eq!(trades.len(), 1);
        assert!((trades[0].stop_loss_initial - 98.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_sign_matches_direction() {
        // Long loser and short loser both must carry negative gross P&L.
        let mut long_bars = or_window();
        long_bars.push(bar(9, 30, 101.0, 100.0, 100.5, 150));
        long_bars.push(bar(9, 45, 100.0, 97.5, 97.8, 150));
        let long = run_one(&long_bars, &params(|p| p.trade_direction = TradeDirection::LongOnly));
        assert_eq!(long.len(), 1);
        let t = &long[0];
        let expected_sign = (t.exit_price - t.entry_price) * t.direction.sign();
        assert!(t.gross_pnl * expected_sign >= 0.0);
        assert!(t.gross_pnl < 0.0);

        let mut short_bars = or_window();
        short_bars.push(bar(9, 30, 99.0, 97.5, 98.2, 150));
        short_bars.push(bar(9, 45, 100.5, 98.0, 100.2, 150));
        let short = run_one(
            &short_bars,
            &params(|p| p.trade_direction = TradeDirection::ShortOnly),
        );
        assert_eq!(short.len(), 1);
        assert!(short[0].gross_pnl < 0.0);
    }

    #[test]
    fn entry_on_final_bar_time_exits_in_place() {
        // Breakout happens on the last cached bar: exit_idx == entry_idx
        // and the reason is a time exit at that bar's close.
        let mut bars = or_window();
        bars.push(bar(9, 30, 99.5, 99.0, 99.2, 150));
        bars.push(bar(9, 45, 101.0, 99.5, 100.6, 150));

        let trades = run_one(&bars, &params(|p| p.target_multiplier = 0.0));
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.exit_reason, ExitReason::TimeExit);
        assert_eq!(t.entry_time, t.exit_time);
        assert!((t.exit_price - 100.6).abs() < 1e-9);
    }

    #[test]
    fn costs_and_risk_are_positive() {
        let mut bars = or_window();
        bars.push(bar(9, 30, 101.0, 100.0, 100.5, 150));
        bars.push(bar(10, 0, 104.0, 101.0, 103.5, 150));
        let trades = run_one(&bars, &params(|_| {}));
        for t in &trades {
            assert!(t.costs >= 0.0);
            assert!(t.risk_amount > 0.0);
            assert!(t.quantity > 0);
            // brokerage = 100 * 500 * 0.0001 * 2 = 10
            // stt = 104 * 500 * 0.00025 = 13 -> costs = 23
            assert!((t.costs - 23.0).abs() < 1e-9);
        }
    }
}

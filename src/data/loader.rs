//! Per-instrument precomputation layer.
//!
//! Loads session bars once and derives everything the simulation kernel
//! reuses across thousands of parameter combinations: per-day bar slices,
//! opening-range statistics for every swept OR duration, a daily ATR series,
//! and prior-day closes. The view is built once and read-only afterwards;
//! day slices are index ranges into the single bar vector, not copies.

use std::ops::Range;

use chrono::{Duration, NaiveDate, NaiveTime};
use rustc_hash::FxHashMap;

use crate::data::bars::{Bar, BarStore};
use crate::engine::types::OrStats;
use crate::error::Result;

pub const DEFAULT_ATR_PERIOD: usize = 14;

pub fn session_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 15, 0).expect("valid session open")
}

/// First minute after the opening range: 09:15 + or_minutes.
pub fn or_end_time(or_minutes: u32) -> NaiveTime {
    session_open() + Duration::minutes(i64::from(or_minutes))
}

/// Everything precomputed for one instrument, shared read-only by every
/// simulation of that instrument.
#[derive(Debug, Clone)]
pub struct InstrumentView {
    pub instrument: String,
    pub bars: Vec<Bar>,
    /// Sorted unique trading days.
    pub trading_days: Vec<NaiveDate>,
    day_ranges: FxHashMap<NaiveDate, Range<usize>>,
    /// or_minutes -> day -> OR stats. Days failing the two-bar minimum are
    /// absent from the inner map but still present in `trading_days`.
    pub opening_ranges: FxHashMap<u32, FxHashMap<NaiveDate, OrStats>>,
    /// Wilder-smoothed daily ATR; empty when the history is shorter than
    /// the smoothing window.
    pub daily_atr: FxHashMap<NaiveDate, f64>,
    /// Prior trading day's close, for every day except the first.
    pub prev_close: FxHashMap<NaiveDate, f64>,
}

impl InstrumentView {
    pub fn is_empty(&self) -> bool {
        self.trading_days.is_empty()
    }

    /// All session bars of one trading day, in timestamp order.
    pub fn day_bars(&self, date: NaiveDate) -> &[Bar] {
        self.day_ranges
            .get(&date)
            .map_or(&[], |r| &self.bars[r.clone()])
    }

    pub fn or_stats(&self, or_minutes: u32) -> Option<&FxHashMap<NaiveDate, OrStats>> {
        self.opening_ranges.get(&or_minutes)
    }

    pub fn atr_for(&self, date: NaiveDate) -> Option<f64> {
        self.daily_atr.get(&date).copied()
    }
}

/// Load and precompute all per-instrument data in one pass over the bars.
///
/// An instrument with no bars in range yields an empty view; downstream
/// components treat that as "zero trades", not an error.
pub fn load_instrument(
    store: &BarStore,
    instrument: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    or_minutes_list: &[u32],
) -> Result<InstrumentView> {
    let bars = store.load_session_bars(instrument, start, end)?;

    let (trading_days, day_ranges) = partition_days(&bars);
    if trading_days.is_empty() {
        tracing::warn!(instrument, "no bars loaded");
        return Ok(InstrumentView {
            instrument: instrument.to_string(),
            bars,
            trading_days,
            day_ranges,
            opening_ranges: FxHashMap::default(),
            daily_atr: FxHashMap::default(),
            prev_close: FxHashMap::default(),
        });
    }

    tracing::info!(
        instrument,
        bars = bars.len(),
        days = trading_days.len(),
        "loaded instrument"
    );

    let mut opening_ranges = FxHashMap::default();
    for &om in or_minutes_list {
        opening_ranges.insert(om, compute_opening_ranges(&bars, &trading_days, &day_ranges, om));
    }

    let daily_atr =
        compute_daily_atr(&bars, &trading_days, &day_ranges, DEFAULT_ATR_PERIOD);
    let prev_close = compute_prev_close(&bars, &trading_days, &day_ranges);

    Ok(InstrumentView {
        instrument: instrument.to_string(),
        bars,
        trading_days,
        day_ranges,
        opening_ranges,
        daily_atr,
        prev_close,
    })
}

/// Split the timestamp-sorted bar vector into contiguous per-day ranges.
fn partition_days(bars: &[Bar]) -> (Vec<NaiveDate>, FxHashMap<NaiveDate, Range<usize>>) {
    let mut days = Vec::new();
    let mut ranges = FxHashMap::default();

    let mut idx = 0;
    while idx < bars.len() {
        let date = bars[idx].ts.date();
        let start = idx;
        while idx < bars.len() && bars[idx].ts.date() == date {
            idx += 1;
        }
        days.push(date);
        ranges.insert(date, start..idx);
    }
    (days, ranges)
}

/// OR high/low/avg-volume/range-pct per day for one OR duration. Days with
/// fewer than two bars inside the window are omitted.
fn compute_opening_ranges(
    bars: &[Bar],
    trading_days: &[NaiveDate],
    day_ranges: &FxHashMap<NaiveDate, Range<usize>>,
    or_minutes: u32,
) -> FxHashMap<NaiveDate, OrStats> {
    let window_end = or_end_time(or_minutes);
    let mut result = FxHashMap::default();

    for &date in trading_days {
        let Some(range) = day_ranges.get(&date) else {
            continue;
        };
        let day = &bars[range.clone()];
        // OR bars: 09:15 through 09:15 + m - 1 inclusive.
        let or_bars: Vec<&Bar> = day.iter().filter(|b| b.ts.time() < window_end).collect();
        if or_bars.len() < 2 {
            continue;
        }

        let high = or_bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = or_bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let avg_volume =
            or_bars.iter().map(|b| b.volume as f64).sum::<f64>() / or_bars.len() as f64;
        let midpoint = (high + low) / 2.0;
        let range_pct = if midpoint > 0.0 {
            (high - low) / midpoint * 100.0
        } else {
            0.0
        };

        result.insert(
            date,
            OrStats {
                high,
                low,
                avg_volume,
                range_pct,
            },
        );
    }
    result
}

/// Daily ATR from minute-derived daily aggregates, Wilder smoothing.
///
/// Days inside the first smoothing window carry the running simple average
/// of true ranges seen so far; histories shorter than `period + 1` days get
/// no ATR at all (ATR-based stops then fall back to fixed).
fn compute_daily_atr(
    bars: &[Bar],
    trading_days: &[NaiveDate],
    day_ranges: &FxHashMap<NaiveDate, Range<usize>>,
    period: usize,
) -> FxHashMap<NaiveDate, f64> {
    let mut result = FxHashMap::default();
    if trading_days.len() < period + 1 {
        return result;
    }

    let mut daily_highs = Vec::with_capacity(trading_days.len());
    let mut daily_lows = Vec::with_capacity(trading_days.len());
    let mut daily_closes = Vec::with_capacity(trading_days.len());
    for &date in trading_days {
        let day = &bars[day_ranges[&date].clone()];
        daily_highs.push(day.iter().map(|b| b.high).fold(f64::MIN, f64::max));
        daily_lows.push(day.iter().map(|b| b.low).fold(f64::MAX, f64::min));
        daily_closes.push(day.last().expect("non-empty day").close);
    }

    let mut true_ranges = Vec::with_capacity(trading_days.len());
    for i in 0..trading_days.len() {
        let tr = if i == 0 {
            daily_highs[0] - daily_lows[0]
        } else {
            let prev_close = daily_closes[i - 1];
            (daily_highs[i] - daily_lows[i])
                .max((daily_highs[i] - prev_close).abs())
                .max((daily_lows[i] - prev_close).abs())
        };
        true_ranges.push(tr);
    }

    // Warm-up days: running simple average of true ranges so far.
    let mut running_sum = 0.0;
    for i in 0..period.min(trading_days.len()) {
        running_sum += true_ranges[i];
        result.insert(trading_days[i], running_sum / (i + 1) as f64);
    }

    // Wilder smoothing from the first full window onwards.
    let mut atr = true_ranges[..period].iter().sum::<f64>() / period as f64;
    for i in period..trading_days.len() {
        atr = (atr * (period - 1) as f64 + true_ranges[i]) / period as f64;
        result.insert(trading_days[i], atr);
    }

    result
}

fn compute_prev_close(
    bars: &[Bar],
    trading_days: &[NaiveDate],
    day_ranges: &FxHashMap<NaiveDate, Range<usize>>,
) -> FxHashMap<NaiveDate, f64> {
    let mut result = FxHashMap::default();
    for pair in trading_days.windows(2) {
        let prev_day = &bars[day_ranges[&pair[0]].clone()];
        result.insert(pair[1], prev_day.last().expect("non-empty day").close);
    }
    result
}

//! Per-day precomputation shared across parameter combinations.
//!
//! For one (OR duration, exit time) pair, each trading day's post-OR bars
//! are copied into dense parallel arrays and the first bar satisfying each
//! of the six entry predicates is located up front. A simulation with a
//! non-trailing stop then needs only these indices plus two more bulk scans.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rustc_hash::FxHashMap;

use crate::data::loader::{or_end_time, InstrumentView};
use crate::engine::types::OrStats;

/// Volume-confirmed entries require volume above this multiple of the OR
/// average.
pub const VOLUME_CONFIRM_FACTOR: f64 = 1.5;

/// Dense per-day arrays over bars in [or_end, exit_time], with precomputed
/// first-breakout indices. Indices are `None` when the predicate never
/// fires that day.
#[derive(Debug, Clone)]
pub struct DayCache {
    pub date: NaiveDate,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
    pub timestamps: Vec<NaiveDateTime>,

    pub first_long_immediate: Option<usize>,
    pub first_short_immediate: Option<usize>,
    pub first_long_close: Option<usize>,
    pub first_short_close: Option<usize>,
    pub first_long_volume: Option<usize>,
    pub first_short_volume: Option<usize>,
}

impl DayCache {
    pub fn len(&self) -> usize {
        self.highs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.highs.is_empty()
    }
}

/// Build day caches for every trading day that has OR statistics for this
/// duration. Days with no bars between the OR end and the exit time are
/// skipped.
pub fn build_day_caches(
    view: &InstrumentView,
    or_data: &FxHashMap<NaiveDate, OrStats>,
    or_minutes: u32,
    exit_time: NaiveTime,
) -> Vec<DayCache> {
    let window_start = or_end_time(or_minutes);
    let mut caches = Vec::new();

    for &date in &view.trading_days {
        let Some(or_stats) = or_data.get(&date) else {
            continue;
        };

        let day = view.day_bars(date);
        let post_or: Vec<_> = day
            .iter()
            .filter(|b| {
                let t = b.ts.time();
                t >= window_start && t <= exit_time
            })
            .collect();
        if post_or.is_empty() {
            continue;
        }

        let highs: Vec<f64> = post_or.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = post_or.iter().map(|b| b.low).collect();
        let closes: Vec<f64> = post_or.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = post_or.iter().map(|b| b.volume as f64).collect();
        let timestamps: Vec<NaiveDateTime> = post_or.iter().map(|b| b.ts).collect();

        let first_long_immediate = first_index(&highs, |h| h > or_stats.high);
        let first_short_immediate = first_index(&lows, |l| l < or_stats.low);
        let first_long_close = first_index(&closes, |c| c > or_stats.high);
        let first_short_close = first_index(&closes, |c| c < or_stats.low);

        let (first_long_volume, first_short_volume) = if or_stats.avg_volume > 0.0 {
            let threshold = VOLUME_CONFIRM_FACTOR * or_stats.avg_volume;
            (
                closes
                    .iter()
                    .zip(&volumes)
                    .position(|(&c, &v)| c > or_stats.high && v > threshold),
                closes
                    .iter()
                    .zip(&volumes)
                    .position(|(&c, &v)| c < or_stats.low && v > threshold),
            )
        } else {
            (None, None)
        };

        caches.push(DayCache {
            date,
            highs,
            lows,
            closes,
            volumes,
            timestamps,
            first_long_immediate,
            first_short_immediate,
            first_long_close,
            first_short_close,
            first_long_volume,
            first_short_volume,
        });
    }

    caches
}

fn first_index(values: &[f64], pred: impl Fn(f64) -> bool) -> Option<usize> {
    values.iter().position(|&v| pred(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bars::{Bar, BarStore};
    use crate::data::loader::load_instrument;
    use chrono::NaiveDate;
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

    /// OR(15m) = high 100, low 98, avg_vol 100. Post-OR bars chosen so each
    /// entry predicate first fires at a known index.
    fn make_view() -> (TempDir, InstrumentView) {
        let mut bars = vec![
            bar(9, 15, 100.0, 98.0, 99.0, 100),
            bar(9, 20, 99.5, 98.5, 99.2, 100),
        ];
        // Post-OR (indices relative to the cache arrays):
        // 0: inside the range, nothing fires
        bars.push(bar(9, 30, 99.8, 98.2, 99.0, 100));
        // 1: high pierces 100 but closes back inside -> long immediate only
        bars.push(bar(9, 31, 100.4, 99.0, 99.6, 120));
        // 2: closes above 100 on light volume -> long close (not volume)
        bars.push(bar(9, 32, 100.8, 99.8, 100.5, 110));
        // 3: closes above 100 on 2x volume -> long volume confirm
        bars.push(bar(9, 33, 101.2, 100.0, 101.0, 200));
        // 4: low pierces 98 but closes inside -> short immediate only
        bars.push(bar(9, 34, 99.0, 97.8, 98.4, 100));
        // 5: closes below 98 on heavy volume -> short close + short volume
        bars.push(bar(9, 35, 98.5, 97.2, 97.5, 400));

        let dir = TempDir::new().unwrap();
        let mut store = BarStore::open(&dir.path().join("bars.db")).unwrap();
        store.insert_bars("RELIND", &bars).unwrap();
        let view = load_instrument(&store, "RELIND", None, None, &[15]).unwrap();
        (dir, view)
    }

    #[test]
    fn first_breakout_indices() {
        let (_dir, view) = make_view();
        let or_data = view.or_stats(15).unwrap();
        let exit = NaiveTime::from_hms_opt(15, 14, 0).unwrap();
        let caches = build_day_caches(&view, or_data, 15, exit);

        assert_eq!(caches.len(), 1);
        let dc = &caches[0];
        assert_eq!(dc.len(), 6);
        assert_eq!(dc.first_long_immediate, Some(1));
        assert_eq!(dc.first_long_close, Some(2));
        assert_eq!(dc.first_long_volume, Some(3));
        assert_eq!(dc.first_short_immediate, Some(4));
        assert_eq!(dc.first_short_close, Some(5));
        assert_eq!(dc.first_short_volume, Some(5));
    }

    #[test]
    fn indices_satisfy_predicates_and_no_earlier_bar_does() {
        let (_dir, view) = make_view();
        let or_data = view.or_stats(15).unwrap();
        let or = &or_data[&d4()];
        let exit = NaiveTime::from_hms_opt(15, 14, 0).unwrap();
        let dc = &build_day_caches(&view, or_data, 15, exit)[0];

        let idx = dc.first_long_immediate.unwrap();
        assert!(dc.highs[idx] > or.high);
        assert!(dc.highs[..idx].iter().all(|&h| h <= or.high));

        let idx = dc.first_short_close.unwrap();
        assert!(dc.closes[idx] < or.low);
        assert!(dc.closes[..idx].iter().all(|&c| c >= or.low));

        let idx = dc.first_long_volume.unwrap();
        assert!(dc.closes[idx] > or.high);
        assert!(dc.volumes[idx] > VOLUME_CONFIRM_FACTOR * or.avg_volume);
    }

    #[test]
    fn exit_time_truncates_the_window() {
        let (_dir, view) = make_view();
        let or_data = view.or_stats(15).unwrap();
        // Exit at 09:32 keeps only the first three post-OR bars.
        let exit = NaiveTime::from_hms_opt(9, 32, 0).unwrap();
        let dc = &build_day_caches(&view, or_data, 15, exit)[0];
        assert_eq!(dc.len(), 3);
        assert_eq!(dc.first_short_immediate, None);
    }

    #[test]
    fn zero_avg_volume_disables_volume_confirm() {
        // Degenerate stats with avg_volume 0: the volume indices must be
        // None no matter what the bars show.
        let (_dir, view) = make_view();
        let mut or_data = view.or_stats(15).unwrap().clone();
        or_data.get_mut(&d4()).unwrap().avg_volume = 0.0;
        let exit = NaiveTime::from_hms_opt(15, 14, 0).unwrap();
        let dc = &build_day_caches(&view, &or_data, 15, exit)[0];
        assert_eq!(dc.first_long_volume, None);
        assert_eq!(dc.first_short_volume, None);
    }
}

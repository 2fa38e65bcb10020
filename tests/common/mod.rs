#![allow(dead_code)]

use std::path::PathBuf;

use chrono::NaiveDate;
use tempfile::TempDir;

use orb_sweep::config::AppConfig;
use orb_sweep::data::bars::{Bar, BarStore};

/// Deterministic synthetic minute bars for one instrument.
///
/// Every day opens with a 15-minute range around a base price, then trends
/// for the rest of the morning. The trend direction alternates per day and
/// the amplitude cycles with `seed`, so a sweep over the full quick grid
/// produces a mix of long/short entries and target/stop/time exits.
pub fn synth_bars(instrument_seed: u64, days: u32) -> Vec<Bar> {
    let mut bars = Vec::new();
    let base = 100.0 + instrument_seed as f64 * 25.0;

    for d in 0..days {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() + chrono::Duration::days(i64::from(d));
        let wob = ((u64::from(d) * 7 + instrument_seed * 3) % 5) as f64 * 0.1;

        // Opening range: oscillate inside [base - 0.6, base + 0.6].
        for i in 0..15u32 {
            let wiggle = f64::from(i % 3) * 0.2 - 0.2 + wob * 0.3;
            let px = base + wiggle;
            bars.push(Bar {
                ts: date.and_hms_opt(9, 15 + i, 0).unwrap(),
                open: px,
                high: px + 0.4,
                low: px - 0.4,
                close: px,
                volume: 90 + ((u64::from(d * 31 + i) * instrument_seed) % 60) as i64,
            });
        }

        // Post-OR drift: up on even days, down on odd, with the slope
        // cycling so some days hit targets, some reverse into stops, and
        // flat days run out the clock.
        let up = d % 2 == 0;
        let slope = 0.02 + f64::from(d % 4) * 0.04;
        for i in 0..150u32 {
            let step = f64::from(i) * slope;
            let drift = if up { step } else { -step };
            // Late-day pullback every third day forces stop exits.
            let pullback = if d % 3 == 2 && i > 90 {
                let back = f64::from(i - 90) * slope * 2.0;
                if up { -back } else { back }
            } else {
                0.0
            };
            let px = base + drift + pullback;
            let (h, m) = (9 + (30 + i) / 60, (30 + i) % 60);
            bars.push(Bar {
                ts: date.and_hms_opt(h, m, 0).unwrap(),
                open: px,
                high: px + 0.5,
                low: px - 0.5,
                close: px,
                volume: 150 + ((u64::from(d * 17 + i) * (instrument_seed + 1)) % 120) as i64,
            });
        }
    }
    bars
}

/// A temp workspace with a seeded bar store and a config pointing at it.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub config: AppConfig,
}

impl TestWorkspace {
    pub fn new(instruments: &[&str], days: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let bars_db = dir.path().join("bars.db");
        let mut store = BarStore::open(&bars_db).unwrap();
        for (seed, code) in instruments.iter().enumerate() {
            store
                .insert_bars(code, &synth_bars(seed as u64, days))
                .unwrap();
        }

        let mut config = AppConfig::default();
        config.paths.bars_db = bars_db;
        config.paths.results_db = dir.path().join("results.db");
        config.instruments = instruments.iter().map(|s| (*s).to_string()).collect();
        Self { dir, config }
    }

    /// Same bars, separate results database (for comparing runs).
    pub fn with_fresh_results_db(&self, name: &str) -> AppConfig {
        let mut config = self.config.clone();
        config.paths.results_db = self.dir.path().join(format!("{name}.db"));
        config
    }

    pub fn results_db(&self) -> PathBuf {
        self.config.paths.results_db.clone()
    }
}

//! Strategy parameter space and grid generation.
//!
//! Defines the swept axes (OR duration, target, stop type, direction, exit
//! time, OR-size filter, entry confirmation) and produces the Cartesian
//! product for grid search. Axis iteration order is fixed, so two runs with
//! the same configuration enumerate identical parameter lists.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::config::SweepSettings;
use crate::error::SweepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossType {
    /// Stop at the opposite OR edge.
    Fixed,
    /// Trailing percentage from the running peak/trough.
    Trailing,
    /// ATR multiple from the entry price.
    AtrBased,
}

impl StopLossType {
    pub fn as_str(self) -> &'static str {
        match self {
            StopLossType::Fixed => "fixed",
            StopLossType::Trailing => "trailing",
            StopLossType::AtrBased => "atr_based",
        }
    }
}

impl FromStr for StopLossType {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(StopLossType::Fixed),
            "trailing" => Ok(StopLossType::Trailing),
            "atr_based" => Ok(StopLossType::AtrBased),
            other => Err(SweepError::config(format!(
                "unknown stop-loss type '{other}' (expected fixed, trailing or atr_based)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    LongOnly,
    ShortOnly,
    Both,
}

impl TradeDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeDirection::LongOnly => "long_only",
            TradeDirection::ShortOnly => "short_only",
            TradeDirection::Both => "both",
        }
    }

    pub fn allows_long(self) -> bool {
        matches!(self, TradeDirection::LongOnly | TradeDirection::Both)
    }

    pub fn allows_short(self) -> bool {
        matches!(self, TradeDirection::ShortOnly | TradeDirection::Both)
    }
}

impl FromStr for TradeDirection {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long_only" => Ok(TradeDirection::LongOnly),
            "short_only" => Ok(TradeDirection::ShortOnly),
            "both" => Ok(TradeDirection::Both),
            other => Err(SweepError::config(format!(
                "unknown trade direction '{other}' (expected long_only, short_only or both)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryConfirmation {
    /// Enter as soon as a bar's extreme pierces the OR edge.
    #[serde(rename = "immediate")]
    Immediate,
    /// Enter only once a bar closes outside the OR.
    #[serde(rename = "candle_close")]
    CandleClose,
    /// Candle close plus volume above 1.5x the OR average.
    #[serde(rename = "volume")]
    VolumeConfirm,
}

impl EntryConfirmation {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryConfirmation::Immediate => "immediate",
            EntryConfirmation::CandleClose => "candle_close",
            EntryConfirmation::VolumeConfirm => "volume",
        }
    }
}

impl FromStr for EntryConfirmation {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(EntryConfirmation::Immediate),
            "candle_close" => Ok(EntryConfirmation::CandleClose),
            "volume" => Ok(EntryConfirmation::VolumeConfirm),
            other => Err(SweepError::config(format!(
                "unknown entry confirmation '{other}' (expected immediate, candle_close or volume)"
            ))),
        }
    }
}

// Default axis values for the full grid.
pub const DEFAULT_OR_MINUTES: &[u32] = &[5, 10, 15, 20, 30, 45, 60];
pub const DEFAULT_TARGET_MULTIPLIERS: &[f64] = &[0.0, 1.0, 1.5, 2.0, 2.5, 3.0];
pub const DEFAULT_SL_TYPES: &[StopLossType] = &[
    StopLossType::Fixed,
    StopLossType::Trailing,
    StopLossType::AtrBased,
];
pub const DEFAULT_DIRECTIONS: &[TradeDirection] = &[
    TradeDirection::LongOnly,
    TradeDirection::ShortOnly,
    TradeDirection::Both,
];
pub const DEFAULT_EXIT_TIMES: &[(u32, u32)] =
    &[(12, 30), (14, 0), (14, 30), (15, 0), (15, 14)];
// 0 = no filter.
pub const DEFAULT_OR_FILTERS: &[f64] = &[0.5, 1.0, 1.5, 2.0, 0.0];
pub const DEFAULT_ENTRY_CONFIRMATIONS: &[EntryConfirmation] = &[
    EntryConfirmation::Immediate,
    EntryConfirmation::CandleClose,
    EntryConfirmation::VolumeConfirm,
];

// Quick mode: reduced grid for fast validation (4 combos).
const QUICK_OR_MINUTES: &[u32] = &[15, 30];
const QUICK_TARGET_MULTIPLIERS: &[f64] = &[0.0, 2.0];
const QUICK_SL_TYPES: &[StopLossType] = &[StopLossType::Fixed];
const QUICK_DIRECTIONS: &[TradeDirection] = &[TradeDirection::Both];
const QUICK_EXIT_TIMES: &[(u32, u32)] = &[(15, 14)];
const QUICK_OR_FILTERS: &[f64] = &[0.0];
const QUICK_ENTRY_CONFIRMATIONS: &[EntryConfirmation] = &[EntryConfirmation::Immediate];

fn exit_time(hm: (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(hm.0, hm.1, 0).expect("valid exit time")
}

/// One immutable parameter combination of the sweep.
///
/// Identity is `param_id()`; the struct itself is not `Eq`/`Hash` because of
/// the float axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    pub or_minutes: u32,
    /// 0 disables the target (time/stop exits only).
    pub target_multiplier: f64,
    pub stop_loss_type: StopLossType,
    pub trade_direction: TradeDirection,
    pub exit_time: NaiveTime,
    /// 0 disables the OR-size filter.
    pub max_or_filter_pct: f64,
    pub entry_confirmation: EntryConfirmation,

    // Strategy constants, configurable but not swept.
    pub trailing_stop_pct: f64,
    pub atr_multiplier: f64,
    pub atr_period: u32,
}

impl StrategyParams {
    /// Deterministic 12-hex-char id for this combination, used as the
    /// primary key in the results store. Same fields, same id.
    pub fn param_id(&self) -> String {
        let key = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.or_minutes,
            self.target_multiplier,
            self.stop_loss_type.as_str(),
            self.trade_direction.as_str(),
            self.exit_time.format("%H:%M"),
            self.max_or_filter_pct,
            self.entry_confirmation.as_str(),
            self.trailing_stop_pct,
            self.atr_multiplier,
            self.atr_period,
        );
        let digest = format!("{:x}", md5::compute(key.as_bytes()));
        digest[..12].to_string()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Display for StrategyParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = if self.target_multiplier > 0.0 {
            format!("{}R", self.target_multiplier)
        } else {
            "NoTarget".to_string()
        };
        let filter = if self.max_or_filter_pct > 0.0 {
            format!("OR<{}%", self.max_or_filter_pct)
        } else {
            "NoFilter".to_string()
        };
        write!(
            f,
            "OR{}m | {} SL | {} | {} | Exit@{} | {} | {}",
            self.or_minutes,
            self.stop_loss_type.as_str(),
            target,
            self.trade_direction.as_str(),
            self.exit_time.format("%H:%M"),
            filter,
            self.entry_confirmation.as_str(),
        )
    }
}

/// Axis pins for a filtered grid. `None` means the full default range.
#[derive(Debug, Clone, Default)]
pub struct GridFilter {
    pub or_minutes: Option<Vec<u32>>,
    pub targets: Option<Vec<f64>>,
    pub sl_types: Option<Vec<StopLossType>>,
    pub directions: Option<Vec<TradeDirection>>,
    pub exit_times: Option<Vec<NaiveTime>>,
    pub or_filters: Option<Vec<f64>>,
    pub entry_confirmations: Option<Vec<EntryConfirmation>>,
}

impl GridFilter {
    pub fn is_empty(&self) -> bool {
        self.or_minutes.is_none()
            && self.targets.is_none()
            && self.sl_types.is_none()
            && self.directions.is_none()
            && self.exit_times.is_none()
            && self.or_filters.is_none()
            && self.entry_confirmations.is_none()
    }
}

/// Generates strategy parameter combinations for grid search.
#[derive(Debug, Clone)]
pub struct ParameterGrid {
    trailing_stop_pct: f64,
    atr_multiplier: f64,
    atr_period: u32,
}

impl Default for ParameterGrid {
    fn default() -> Self {
        Self {
            trailing_stop_pct: 0.5,
            atr_multiplier: 1.5,
            atr_period: 14,
        }
    }
}

impl ParameterGrid {
    pub fn new(sweep: &SweepSettings) -> Self {
        Self {
            trailing_stop_pct: sweep.trailing_stop_pct,
            atr_multiplier: sweep.atr_multiplier,
            atr_period: sweep.atr_period,
        }
    }

    /// All combinations of the default axes.
    pub fn generate_all(&self) -> Vec<StrategyParams> {
        self.generate(
            DEFAULT_OR_MINUTES,
            DEFAULT_TARGET_MULTIPLIERS,
            DEFAULT_SL_TYPES,
            DEFAULT_DIRECTIONS,
            &DEFAULT_EXIT_TIMES.iter().map(|&hm| exit_time(hm)).collect::<Vec<_>>(),
            DEFAULT_OR_FILTERS,
            DEFAULT_ENTRY_CONFIRMATIONS,
        )
    }

    /// Reduced smoke grid: 2 OR durations x 2 targets, everything else pinned.
    pub fn generate_quick(&self) -> Vec<StrategyParams> {
        self.generate(
            QUICK_OR_MINUTES,
            QUICK_TARGET_MULTIPLIERS,
            QUICK_SL_TYPES,
            QUICK_DIRECTIONS,
            &QUICK_EXIT_TIMES.iter().map(|&hm| exit_time(hm)).collect::<Vec<_>>(),
            QUICK_OR_FILTERS,
            QUICK_ENTRY_CONFIRMATIONS,
        )
    }

    /// Grid with some axes pinned; unpinned axes take their full defaults.
    pub fn generate_filtered(&self, filter: &GridFilter) -> Vec<StrategyParams> {
        let default_exits: Vec<NaiveTime> =
            DEFAULT_EXIT_TIMES.iter().map(|&hm| exit_time(hm)).collect();
        self.generate(
            filter.or_minutes.as_deref().unwrap_or(DEFAULT_OR_MINUTES),
            filter.targets.as_deref().unwrap_or(DEFAULT_TARGET_MULTIPLIERS),
            filter.sl_types.as_deref().unwrap_or(DEFAULT_SL_TYPES),
            filter.directions.as_deref().unwrap_or(DEFAULT_DIRECTIONS),
            filter.exit_times.as_deref().unwrap_or(&default_exits),
            filter.or_filters.as_deref().unwrap_or(DEFAULT_OR_FILTERS),
            filter
                .entry_confirmations
                .as_deref()
                .unwrap_or(DEFAULT_ENTRY_CONFIRMATIONS),
        )
    }

    /// Size of the full grid without materializing it.
    pub fn count(&self) -> usize {
        DEFAULT_OR_MINUTES.len()
            * DEFAULT_TARGET_MULTIPLIERS.len()
            * DEFAULT_SL_TYPES.len()
            * DEFAULT_DIRECTIONS.len()
            * DEFAULT_EXIT_TIMES.len()
            * DEFAULT_OR_FILTERS.len()
            * DEFAULT_ENTRY_CONFIRMATIONS.len()
    }

    #[allow(clippy::too_many_arguments)]
    fn generate(
        &self,
        or_minutes: &[u32],
        targets: &[f64],
        sl_types: &[StopLossType],
        directions: &[TradeDirection],
        exit_times: &[NaiveTime],
        or_filters: &[f64],
        entry_confirmations: &[EntryConfirmation],
    ) -> Vec<StrategyParams> {
        let mut out = Vec::with_capacity(
            or_minutes.len()
                * targets.len()
                * sl_types.len()
                * directions.len()
                * exit_times.len()
                * or_filters.len()
                * entry_confirmations.len(),
        );
        for &om in or_minutes {
            for &tgt in targets {
                for &sl in sl_types {
                    for &dir in directions {
                        for &et in exit_times {
                            for &orf in or_filters {
                                for &ec in entry_confirmations {
                                    out.push(StrategyParams {
                                        or_minutes: om,
                                        target_multiplier: tgt,
                                        stop_loss_type: sl,
                                        trade_direction: dir,
                                        exit_time: et,
                                        max_or_filter_pct: orf,
                                        entry_confirmation: ec,
                                        trailing_stop_pct: self.trailing_stop_pct,
                                        atr_multiplier: self.atr_multiplier,
                                        atr_period: self.atr_period,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// Group combos by OR duration; combos sharing a duration reuse the same
    /// precomputed OR data.
    pub fn group_by_or_minutes(
        params: &[StrategyParams],
    ) -> BTreeMap<u32, Vec<&StrategyParams>> {
        let mut groups: BTreeMap<u32, Vec<&StrategyParams>> = BTreeMap::new();
        for p in params {
            groups.entry(p.or_minutes).or_default().push(p);
        }
        groups
    }

    /// Sorted unique OR durations present in a params list.
    pub fn unique_or_minutes(params: &[StrategyParams]) -> Vec<u32> {
        let mut minutes: Vec<u32> = params.iter().map(|p| p.or_minutes).collect();
        minutes.sort_unstable();
        minutes.dedup();
        minutes
    }
}

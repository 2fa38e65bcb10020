//! Runtime configuration.
//!
//! Loaded from a TOML file; every field has a default so a bare
//! `AppConfig::default()` is a working smoke-test setup. The effective
//! config is snapshotted as JSON into each run row so results stay
//! interpretable after the config file changes.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SweepError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite file holding 1-minute OHLCV bars.
    #[garde(skip)]
    pub bars_db: PathBuf,
    /// SQLite file holding runs, params, metrics and trades.
    #[garde(skip)]
    pub results_db: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            bars_db: PathBuf::from("data/bars.db"),
            results_db: PathBuf::from("data/backtest_results.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BacktestSettings {
    #[garde(range(min = 0.01))]
    pub capital: f64,
    #[garde(range(min = 0.01))]
    pub max_risk_per_trade: f64,
    #[garde(range(min = 0.0))]
    pub brokerage_rate: f64,
    #[garde(range(min = 0.0))]
    pub stt_rate: f64,
    #[garde(skip)]
    pub start_date: Option<NaiveDate>,
    #[garde(skip)]
    pub end_date: Option<NaiveDate>,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            capital: 100_000.0,
            max_risk_per_trade: 1_000.0,
            brokerage_rate: 0.0001,
            stt_rate: 0.000_25,
            start_date: None,
            end_date: None,
        }
    }
}

/// Strategy constants that apply to every combination but are not swept.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SweepSettings {
    #[garde(range(min = 0.0))]
    pub trailing_stop_pct: f64,
    #[garde(range(min = 0.0))]
    pub atr_multiplier: f64,
    #[garde(range(min = 1))]
    pub atr_period: u32,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            trailing_stop_pct: 0.5,
            atr_multiplier: 1.5,
            atr_period: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    #[garde(dive)]
    pub paths: PathsConfig,
    #[garde(dive)]
    pub backtest: BacktestSettings,
    #[garde(dive)]
    pub sweep: SweepSettings,
    /// Universe to sweep when the CLI doesn't pin specific instruments.
    #[garde(length(min = 1))]
    pub instruments: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            backtest: BacktestSettings::default(),
            sweep: SweepSettings::default(),
            instruments: vec!["RELIND".to_string()],
        }
    }
}

impl AppConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SweepError::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: AppConfig = toml::from_str(&raw).map_err(|e| {
            SweepError::config(format!("malformed config {}: {e}", path.display()))
        })?;
        config.validated()
    }

    /// Load `path` if it exists; otherwise fall back to built-in defaults
    /// when the caller did not name the file explicitly.
    pub fn load_or_default(path: &Path, explicit: bool) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else if explicit {
            Err(SweepError::config(format!(
                "config file not found: {}",
                path.display()
            )))
        } else {
            tracing::warn!(
                path = %path.display(),
                "config file not found, using built-in defaults"
            );
            AppConfig::default().validated()
        }
    }

    fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|e| SweepError::config(format!("invalid config: {e}")))?;
        Ok(self)
    }

    /// JSON snapshot persisted with each run.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "instruments = [\"RELIND\", \"INFTEC\"]\n\n\
             [backtest]\ncapital = 250000.0\n"
        )
        .unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.instruments.len(), 2);
        assert!((config.backtest.capital - 250_000.0).abs() < f64::EPSILON);
        // Unspecified sections keep their defaults.
        assert!((config.sweep.trailing_stop_pct - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.paths.results_db, PathBuf::from("data/backtest_results.db"));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[backtest]\ncapital = -5.0\n").unwrap();
        let err = AppConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, SweepError::Config(_)));
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let missing = Path::new("/nonexistent/orb-sweep.toml");
        assert!(AppConfig::load_or_default(missing, true).is_err());
        assert!(AppConfig::load_or_default(missing, false).is_ok());
    }

    #[test]
    fn snapshot_round_trips() {
        let snap = AppConfig::default().snapshot();
        assert!(snap.get("backtest").is_some());
        let back: AppConfig = serde_json::from_value(snap).unwrap();
        assert!((back.backtest.capital - 100_000.0).abs() < f64::EPSILON);
    }
}

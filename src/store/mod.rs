//! Durable, resumable result store.
//!
//! Five tables: runs, params, per-(param, instrument) metrics, optional
//! per-trade rows, and per-instrument progress. All inserts are idempotent
//! on their natural keys, and one instrument's result set commits in a
//! single transaction so a crashed worker can never leave a half-persisted
//! instrument visible as completed.
//!
//! Single-writer discipline: workers never touch this store; the
//! orchestrator serializes every write.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{Local, NaiveDate};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::engine::types::{PerformanceResult, Trade};
use crate::error::{Result, SweepError};
use crate::grid::StrategyParams;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS backtest_runs (
        run_id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        status TEXT NOT NULL DEFAULT 'running',
        config_snapshot TEXT NOT NULL,
        total_stocks INTEGER NOT NULL,
        total_param_combos INTEGER NOT NULL,
        total_simulations INTEGER NOT NULL,
        combos_completed INTEGER DEFAULT 0,
        stocks_completed INTEGER DEFAULT 0,
        elapsed_seconds REAL DEFAULT 0,
        workers INTEGER DEFAULT 1,
        store_trades INTEGER DEFAULT 0,
        start_date TEXT,
        end_date TEXT,
        notes TEXT
    );

    CREATE TABLE IF NOT EXISTS backtest_params (
        param_id TEXT PRIMARY KEY,
        param_json TEXT NOT NULL,
        or_minutes INTEGER NOT NULL,
        target_multiplier REAL NOT NULL,
        stop_loss_type TEXT NOT NULL,
        trade_direction TEXT NOT NULL,
        exit_time TEXT NOT NULL,
        max_or_filter_pct REAL NOT NULL,
        entry_confirmation TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS backtest_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL,
        param_id TEXT NOT NULL,
        stock_code TEXT NOT NULL,
        or_minutes INTEGER NOT NULL,
        target_multiplier REAL NOT NULL,
        stop_loss_type TEXT NOT NULL,
        trade_direction TEXT NOT NULL,
        exit_time TEXT NOT NULL,
        max_or_filter_pct REAL NOT NULL,
        entry_confirmation TEXT NOT NULL,
        total_trades INTEGER NOT NULL,
        winning_trades INTEGER NOT NULL,
        losing_trades INTEGER NOT NULL,
        win_rate REAL NOT NULL,
        total_pnl REAL NOT NULL,
        net_pnl REAL NOT NULL,
        avg_pnl_per_trade REAL NOT NULL,
        avg_winner REAL NOT NULL,
        avg_loser REAL NOT NULL,
        profit_factor REAL NOT NULL,
        max_drawdown REAL NOT NULL,
        max_drawdown_pct REAL NOT NULL,
        max_consecutive_losses INTEGER NOT NULL,
        sharpe_ratio REAL NOT NULL,
        sortino_ratio REAL NOT NULL,
        expectancy REAL NOT NULL,
        avg_r_multiple REAL NOT NULL,
        calmar_ratio REAL NOT NULL,
        best_trade REAL NOT NULL,
        worst_trade REAL NOT NULL,
        avg_holding_minutes REAL NOT NULL,
        composite_score REAL NOT NULL,
        UNIQUE(run_id, param_id, stock_code)
    );

    CREATE TABLE IF NOT EXISTS backtest_trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL,
        param_id TEXT NOT NULL,
        stock_code TEXT NOT NULL,
        date TEXT NOT NULL,
        direction TEXT NOT NULL,
        entry_time TEXT NOT NULL,
        entry_price REAL NOT NULL,
        exit_time TEXT NOT NULL,
        exit_price REAL NOT NULL,
        quantity INTEGER NOT NULL,
        stop_loss_initial REAL NOT NULL,
        stop_loss_final REAL NOT NULL,
        target_price REAL NOT NULL,
        or_high REAL NOT NULL,
        or_low REAL NOT NULL,
        exit_reason TEXT NOT NULL,
        gross_pnl REAL NOT NULL,
        costs REAL NOT NULL,
        net_pnl REAL NOT NULL,
        risk_amount REAL NOT NULL,
        r_multiple REAL NOT NULL
    );

    CREATE TABLE IF NOT EXISTS backtest_progress (
        run_id INTEGER NOT NULL,
        stock_code TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        combos_tested INTEGER DEFAULT 0,
        total_trades_found INTEGER DEFAULT 0,
        elapsed_seconds REAL DEFAULT 0,
        completed_at TEXT,
        PRIMARY KEY (run_id, stock_code)
    );

    CREATE INDEX IF NOT EXISTS idx_metrics_run ON backtest_metrics(run_id);
    CREATE INDEX IF NOT EXISTS idx_metrics_run_param ON backtest_metrics(run_id, param_id);
    CREATE INDEX IF NOT EXISTS idx_trades_run ON backtest_trades(run_id);
";

/// Metric columns rankings may sort or aggregate by. Names are validated
/// against this list before ever reaching a SQL string.
pub const METRIC_COLUMNS: &[&str] = &[
    "total_trades",
    "winning_trades",
    "losing_trades",
    "win_rate",
    "total_pnl",
    "net_pnl",
    "avg_pnl_per_trade",
    "avg_winner",
    "avg_loser",
    "profit_factor",
    "max_drawdown",
    "max_drawdown_pct",
    "max_consecutive_losses",
    "sharpe_ratio",
    "sortino_ratio",
    "expectancy",
    "avg_r_multiple",
    "calmar_ratio",
    "best_trade",
    "worst_trade",
    "avg_holding_minutes",
    "composite_score",
];

/// Resolve a user-supplied metric name to its canonical static column name.
pub fn validate_metric(name: &str) -> Result<&'static str> {
    METRIC_COLUMNS
        .iter()
        .find(|&&col| col == name)
        .copied()
        .ok_or_else(|| SweepError::config(format!("unknown ranking metric '{name}'")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

impl FromStr for RunStatus {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "interrupted" => Ok(RunStatus::Interrupted),
            other => Err(SweepError::config(format!("unknown run status '{other}'"))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockStatus {
    Pending,
    InProgress,
    Completed,
}

impl StockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StockStatus::Pending => "pending",
            StockStatus::InProgress => "in_progress",
            StockStatus::Completed => "completed",
        }
    }
}

impl FromStr for StockStatus {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(StockStatus::Pending),
            "in_progress" => Ok(StockStatus::InProgress),
            "completed" => Ok(StockStatus::Completed),
            other => Err(SweepError::config(format!(
                "unknown progress status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: i64,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub status: RunStatus,
    pub config_snapshot: String,
    pub total_stocks: i64,
    pub total_param_combos: i64,
    pub total_simulations: i64,
    pub combos_completed: i64,
    pub stocks_completed: i64,
    pub elapsed_seconds: f64,
    pub workers: i64,
    pub store_trades: bool,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub stock_code: String,
    pub status: StockStatus,
    pub combos_tested: i64,
    pub total_trades_found: i64,
    pub elapsed_seconds: f64,
    pub completed_at: Option<String>,
}

/// One metrics row as produced by a worker: the parameter set plus its
/// computed result for a single instrument.
#[derive(Debug, Clone)]
pub struct MetricsRow {
    pub params: StrategyParams,
    pub result: PerformanceResult,
}

#[derive(Debug, Clone)]
pub struct StrategyRanking {
    pub param_id: String,
    pub or_minutes: i64,
    pub target_multiplier: f64,
    pub stop_loss_type: String,
    pub trade_direction: String,
    pub exit_time: String,
    pub max_or_filter_pct: f64,
    pub entry_confirmation: String,
    pub avg_metric: f64,
    pub avg_net_pnl: f64,
    pub avg_win_rate: f64,
    pub avg_profit_factor: f64,
    pub avg_sharpe: f64,
    pub num_stocks: i64,
}

#[derive(Debug, Clone)]
pub struct StockRanking {
    pub stock_code: String,
    pub avg_metric: f64,
    pub avg_net_pnl: f64,
    pub avg_win_rate: f64,
    pub num_strategies: i64,
}

#[derive(Debug, Clone)]
pub struct PairRanking {
    pub stock_code: String,
    pub param_id: String,
    pub or_minutes: i64,
    pub stop_loss_type: String,
    pub trade_direction: String,
    pub exit_time: String,
    pub entry_confirmation: String,
    pub target_multiplier: f64,
    pub max_or_filter_pct: f64,
    pub total_trades: i64,
    pub net_pnl: f64,
    pub win_rate: f64,
    pub composite_score: f64,
    pub metric_value: f64,
}

/// Full metrics row, for post-run reduction by reporting collaborators.
#[derive(Debug, Clone)]
pub struct MetricsRecord {
    pub param_id: String,
    pub stock_code: String,
    pub result: PerformanceResult,
}

/// Persisted trade row, as read back for reporting.
#[derive(Debug, Clone)]
pub struct TradeRow {
    pub param_id: String,
    pub stock_code: String,
    pub date: String,
    pub direction: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: i64,
    pub exit_reason: String,
    pub gross_pnl: f64,
    pub costs: f64,
    pub net_pnl: f64,
    pub risk_amount: f64,
    pub r_multiple: f64,
}

pub struct ResultsStore {
    conn: Connection,
}

impl ResultsStore {
    /// Open read-write, creating the schema (and parent directory) if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SweepError::config(format!(
                        "cannot create results directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    // -- run lifecycle ------------------------------------------------------

    /// Create a run row plus one pending progress row per instrument, all in
    /// one transaction. Returns the new monotonic run id.
    #[allow(clippy::too_many_arguments)]
    pub fn create_run(
        &mut self,
        config_snapshot: &serde_json::Value,
        total_combos: usize,
        instruments: &[String],
        workers: usize,
        store_trades: bool,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<i64> {
        let now = timestamp();
        let total_simulations = (total_combos * instruments.len()) as i64;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO backtest_runs
             (created_at, status, config_snapshot, total_stocks,
              total_param_combos, total_simulations, workers, store_trades,
              start_date, end_date)
             VALUES (?1, 'running', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                now,
                config_snapshot.to_string(),
                instruments.len() as i64,
                total_combos as i64,
                total_simulations,
                workers as i64,
                i64::from(store_trades),
                start_date.map(|d| d.to_string()),
                end_date.map(|d| d.to_string()),
            ],
        )?;
        let run_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO backtest_progress (run_id, stock_code, status)
                 VALUES (?1, ?2, 'pending')",
            )?;
            for stock in instruments {
                stmt.execute(params![run_id, stock])?;
            }
        }
        tx.commit()?;
        Ok(run_id)
    }

    pub fn update_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        combos_completed: Option<i64>,
        stocks_completed: Option<i64>,
        elapsed_seconds: Option<f64>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE backtest_runs
             SET status = ?2,
                 combos_completed = COALESCE(?3, combos_completed),
                 stocks_completed = COALESCE(?4, stocks_completed),
                 elapsed_seconds = COALESCE(?5, elapsed_seconds),
                 completed_at = CASE WHEN ?2 = 'completed' THEN ?6 ELSE completed_at END
             WHERE run_id = ?1",
            params![
                run_id,
                status.as_str(),
                combos_completed,
                stocks_completed,
                elapsed_seconds,
                timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("{RUN_SELECT} WHERE run_id = ?1"),
                params![run_id],
                read_run_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn latest_run(&self) -> Result<Option<RunRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("{RUN_SELECT} ORDER BY run_id DESC LIMIT 1"),
                [],
                read_run_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Most recent run that did not complete, if any; resume targets this.
    pub fn latest_resumable_run(&self) -> Result<Option<RunRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("{RUN_SELECT} WHERE status != 'completed' ORDER BY run_id DESC LIMIT 1"),
                [],
                read_run_row,
            )
            .optional()?;
        Ok(record)
    }

    // -- parameter storage --------------------------------------------------

    /// Bulk upsert of parameter definitions, keyed by param id. Idempotent.
    pub fn insert_params_batch(&mut self, params_list: &[StrategyParams]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO backtest_params
                 (param_id, param_json, or_minutes, target_multiplier,
                  stop_loss_type, trade_direction, exit_time,
                  max_or_filter_pct, entry_confirmation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for p in params_list {
                stmt.execute(params![
                    p.param_id(),
                    p.to_json(),
                    p.or_minutes,
                    p.target_multiplier,
                    p.stop_loss_type.as_str(),
                    p.trade_direction.as_str(),
                    p.exit_time.format("%H:%M").to_string(),
                    p.max_or_filter_pct,
                    p.entry_confirmation.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // -- per-instrument commit ----------------------------------------------

    /// Persist one instrument's complete result set atomically: metrics
    /// rows (insert-or-ignore on the natural key), optional trade rows, and
    /// the completed progress row. Either everything lands or nothing does.
    pub fn commit_instrument(
        &mut self,
        run_id: i64,
        stock_code: &str,
        metrics_rows: &[MetricsRow],
        trade_rows: &[(String, Trade)],
        combos_tested: usize,
        total_trades: usize,
        elapsed_seconds: f64,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO backtest_metrics
                 (run_id, param_id, stock_code,
                  or_minutes, target_multiplier, stop_loss_type,
                  trade_direction, exit_time, max_or_filter_pct,
                  entry_confirmation,
                  total_trades, winning_trades, losing_trades, win_rate,
                  total_pnl, net_pnl, avg_pnl_per_trade, avg_winner,
                  avg_loser, profit_factor, max_drawdown, max_drawdown_pct,
                  max_consecutive_losses, sharpe_ratio, sortino_ratio,
                  expectancy, avg_r_multiple, calmar_ratio, best_trade,
                  worst_trade, avg_holding_minutes, composite_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                         ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22,
                         ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32)",
            )?;
            for row in metrics_rows {
                let p = &row.params;
                let r = &row.result;
                stmt.execute(params![
                    run_id,
                    p.param_id(),
                    stock_code,
                    p.or_minutes,
                    p.target_multiplier,
                    p.stop_loss_type.as_str(),
                    p.trade_direction.as_str(),
                    p.exit_time.format("%H:%M").to_string(),
                    p.max_or_filter_pct,
                    p.entry_confirmation.as_str(),
                    r.total_trades,
                    r.winning_trades,
                    r.losing_trades,
                    r.win_rate,
                    r.total_pnl,
                    r.net_pnl,
                    r.avg_pnl_per_trade,
                    r.avg_winner,
                    r.avg_loser,
                    r.profit_factor,
                    r.max_drawdown,
                    r.max_drawdown_pct,
                    r.max_consecutive_losses,
                    r.sharpe_ratio,
                    r.sortino_ratio,
                    r.expectancy,
                    r.avg_r_multiple,
                    r.calmar_ratio,
                    r.best_trade,
                    r.worst_trade,
                    r.avg_holding_minutes,
                    r.composite_score,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO backtest_trades
                 (run_id, param_id, stock_code, date, direction, entry_time,
                  entry_price, exit_time, exit_price, quantity,
                  stop_loss_initial, stop_loss_final, target_price, or_high,
                  or_low, exit_reason, gross_pnl, costs, net_pnl,
                  risk_amount, r_multiple)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                         ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            )?;
            for (param_id, t) in trade_rows {
                stmt.execute(params![
                    run_id,
                    param_id,
                    stock_code,
                    t.date.to_string(),
                    t.direction.as_str(),
                    t.entry_time.format("%Y-%m-%d %H:%M:%S").to_string(),
                    t.entry_price,
                    t.exit_time.format("%Y-%m-%d %H:%M:%S").to_string(),
                    t.exit_price,
                    t.quantity,
                    t.stop_loss_initial,
                    t.stop_loss_final,
                    t.target_price,
                    t.or_high,
                    t.or_low,
                    t.exit_reason.as_str(),
                    t.gross_pnl,
                    t.costs,
                    t.net_pnl,
                    t.risk_amount,
                    t.r_multiple,
                ])?;
            }
        }
        tx.execute(
            "UPDATE backtest_progress
             SET status = 'completed', combos_tested = ?3,
                 total_trades_found = ?4, elapsed_seconds = ?5,
                 completed_at = ?6
             WHERE run_id = ?1 AND stock_code = ?2",
            params![
                run_id,
                stock_code,
                combos_tested as i64,
                total_trades as i64,
                elapsed_seconds,
                timestamp(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -- progress tracking --------------------------------------------------

    pub fn mark_stock_in_progress(&self, run_id: i64, stock_code: &str) -> Result<()> {
        self.set_stock_status(run_id, stock_code, StockStatus::InProgress)
    }

    /// Roll an instrument back to pending (worker failure or interrupt) so
    /// a resume retries it.
    pub fn mark_stock_pending(&self, run_id: i64, stock_code: &str) -> Result<()> {
        self.set_stock_status(run_id, stock_code, StockStatus::Pending)
    }

    fn set_stock_status(&self, run_id: i64, stock_code: &str, status: StockStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE backtest_progress SET status = ?3
             WHERE run_id = ?1 AND stock_code = ?2",
            params![run_id, stock_code, status.as_str()],
        )?;
        Ok(())
    }

    /// Any instruments left in_progress go back to pending; used when an
    /// interrupt drains the queue.
    pub fn reset_in_progress(&self, run_id: i64) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE backtest_progress SET status = 'pending'
             WHERE run_id = ?1 AND status = 'in_progress'",
            params![run_id],
        )?;
        Ok(changed)
    }

    pub fn get_completed_stocks(&self, run_id: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT stock_code FROM backtest_progress
             WHERE run_id = ?1 AND status = 'completed'",
        )?;
        let rows = stmt.query_map(params![run_id], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_progress(&self, run_id: i64) -> Result<Vec<ProgressRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT stock_code, status, combos_tested, total_trades_found,
                    elapsed_seconds, completed_at
             FROM backtest_progress
             WHERE run_id = ?1 ORDER BY status, stock_code",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let status: String = row.get(1)?;
            Ok(ProgressRecord {
                stock_code: row.get(0)?,
                status: status.parse().unwrap_or(StockStatus::Pending),
                combos_tested: row.get(2)?,
                total_trades_found: row.get(3)?,
                elapsed_seconds: row.get(4)?,
                completed_at: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn metrics_count(&self, run_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM backtest_metrics WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- ranking queries ----------------------------------------------------

    /// Top strategies by a metric averaged across all instruments.
    pub fn get_top_strategies(
        &self,
        run_id: i64,
        metric: &str,
        limit: usize,
    ) -> Result<Vec<StrategyRanking>> {
        let metric = validate_metric(metric)?;
        let sql = format!(
            "SELECT param_id, or_minutes, target_multiplier, stop_loss_type,
                    trade_direction, exit_time, max_or_filter_pct,
                    entry_confirmation,
                    AVG({metric}) AS avg_metric,
                    AVG(net_pnl) AS avg_net_pnl,
                    AVG(win_rate) AS avg_win_rate,
                    AVG(profit_factor) AS avg_profit_factor,
                    AVG(sharpe_ratio) AS avg_sharpe,
                    COUNT(*) AS num_stocks
             FROM backtest_metrics
             WHERE run_id = ?1
             GROUP BY param_id
             ORDER BY avg_metric DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id, limit as i64], |row| {
            Ok(StrategyRanking {
                param_id: row.get(0)?,
                or_minutes: row.get(1)?,
                target_multiplier: row.get(2)?,
                stop_loss_type: row.get(3)?,
                trade_direction: row.get(4)?,
                exit_time: row.get(5)?,
                max_or_filter_pct: row.get(6)?,
                entry_confirmation: row.get(7)?,
                avg_metric: row.get(8)?,
                avg_net_pnl: row.get(9)?,
                avg_win_rate: row.get(10)?,
                avg_profit_factor: row.get(11)?,
                avg_sharpe: row.get(12)?,
                num_stocks: row.get(13)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Top instruments by a metric, optionally restricted to one strategy.
    pub fn get_top_stocks(
        &self,
        run_id: i64,
        metric: &str,
        limit: usize,
        param_id: Option<&str>,
    ) -> Result<Vec<StockRanking>> {
        let metric = validate_metric(metric)?;
        let filter = if param_id.is_some() {
            " AND param_id = ?3"
        } else {
            ""
        };
        let sql = format!(
            "SELECT stock_code,
                    AVG({metric}) AS avg_metric,
                    AVG(net_pnl) AS avg_net_pnl,
                    AVG(win_rate) AS avg_win_rate,
                    COUNT(*) AS num_strategies
             FROM backtest_metrics
             WHERE run_id = ?1{filter}
             GROUP BY stock_code
             ORDER BY avg_metric DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let map_row = |row: &Row<'_>| {
            Ok(StockRanking {
                stock_code: row.get(0)?,
                avg_metric: row.get(1)?,
                avg_net_pnl: row.get(2)?,
                avg_win_rate: row.get(3)?,
                num_strategies: row.get(4)?,
            })
        };
        let mut out = Vec::new();
        if let Some(pid) = param_id {
            let rows = stmt.query_map(params![run_id, limit as i64, pid], map_row)?;
            for row in rows {
                out.push(row?);
            }
        } else {
            let rows = stmt.query_map(params![run_id, limit as i64], map_row)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    /// Best (instrument, strategy) pairs ordered by a metric.
    pub fn get_best_pairs(
        &self,
        run_id: i64,
        metric: &str,
        limit: usize,
    ) -> Result<Vec<PairRanking>> {
        let metric = validate_metric(metric)?;
        let sql = format!(
            "SELECT stock_code, param_id, or_minutes, stop_loss_type,
                    trade_direction, exit_time, entry_confirmation,
                    target_multiplier, max_or_filter_pct, total_trades,
                    net_pnl, win_rate, composite_score, {metric} AS metric_value
             FROM backtest_metrics
             WHERE run_id = ?1
             ORDER BY metric_value DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id, limit as i64], |row| {
            Ok(PairRanking {
                stock_code: row.get(0)?,
                param_id: row.get(1)?,
                or_minutes: row.get(2)?,
                stop_loss_type: row.get(3)?,
                trade_direction: row.get(4)?,
                exit_time: row.get(5)?,
                entry_confirmation: row.get(6)?,
                target_multiplier: row.get(7)?,
                max_or_filter_pct: row.get(8)?,
                total_trades: row.get(9)?,
                net_pnl: row.get(10)?,
                win_rate: row.get(11)?,
                composite_score: row.get(12)?,
                metric_value: row.get(13)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Every metrics row of a run, best composite first. Reporting
    /// collaborators reduce over this.
    pub fn get_all_metrics(&self, run_id: i64) -> Result<Vec<MetricsRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT param_id, stock_code,
                    total_trades, winning_trades, losing_trades, win_rate,
                    total_pnl, net_pnl, avg_pnl_per_trade, avg_winner,
                    avg_loser, profit_factor, max_drawdown, max_drawdown_pct,
                    max_consecutive_losses, sharpe_ratio, sortino_ratio,
                    expectancy, avg_r_multiple, calmar_ratio, best_trade,
                    worst_trade, avg_holding_minutes, composite_score
             FROM backtest_metrics
             WHERE run_id = ?1
             ORDER BY composite_score DESC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(MetricsRecord {
                param_id: row.get(0)?,
                stock_code: row.get(1)?,
                result: PerformanceResult {
                    total_trades: row.get(2)?,
                    winning_trades: row.get(3)?,
                    losing_trades: row.get(4)?,
                    win_rate: row.get(5)?,
                    total_pnl: row.get(6)?,
                    net_pnl: row.get(7)?,
                    avg_pnl_per_trade: row.get(8)?,
                    avg_winner: row.get(9)?,
                    avg_loser: row.get(10)?,
                    profit_factor: row.get(11)?,
                    max_drawdown: row.get(12)?,
                    max_drawdown_pct: row.get(13)?,
                    max_consecutive_losses: row.get(14)?,
                    sharpe_ratio: row.get(15)?,
                    sortino_ratio: row.get(16)?,
                    expectancy: row.get(17)?,
                    avg_r_multiple: row.get(18)?,
                    calmar_ratio: row.get(19)?,
                    best_trade: row.get(20)?,
                    worst_trade: row.get(21)?,
                    avg_holding_minutes: row.get(22)?,
                    composite_score: row.get(23)?,
                },
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Persisted trades for a run, chronological per instrument, optionally
    /// restricted to one parameter set.
    pub fn get_trades(&self, run_id: i64, param_id: Option<&str>) -> Result<Vec<TradeRow>> {
        let filter = if param_id.is_some() {
            " AND param_id = ?2"
        } else {
            ""
        };
        let sql = format!(
            "SELECT param_id, stock_code, date, direction, entry_price,
                    exit_price, quantity, exit_reason, gross_pnl, costs,
                    net_pnl, risk_amount, r_multiple
             FROM backtest_trades
             WHERE run_id = ?1{filter}
             ORDER BY stock_code, param_id, date"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let map_row = |row: &Row<'_>| {
            Ok(TradeRow {
                param_id: row.get(0)?,
                stock_code: row.get(1)?,
                date: row.get(2)?,
                direction: row.get(3)?,
                entry_price: row.get(4)?,
                exit_price: row.get(5)?,
                quantity: row.get(6)?,
                exit_reason: row.get(7)?,
                gross_pnl: row.get(8)?,
                costs: row.get(9)?,
                net_pnl: row.get(10)?,
                risk_amount: row.get(11)?,
                r_multiple: row.get(12)?,
            })
        };
        let mut out = Vec::new();
        if let Some(pid) = param_id {
            let rows = stmt.query_map(params![run_id, pid], map_row)?;
            for row in rows {
                out.push(row?);
            }
        } else {
            let rows = stmt.query_map(params![run_id], map_row)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }
}

const RUN_SELECT: &str = "SELECT run_id, created_at, completed_at, status,
    config_snapshot, total_stocks, total_param_combos, total_simulations,
    combos_completed, stocks_completed, elapsed_seconds, workers,
    store_trades, start_date, end_date FROM backtest_runs";

fn read_run_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(3)?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        created_at: row.get(1)?,
        completed_at: row.get(2)?,
        status: status.parse().unwrap_or(RunStatus::Interrupted),
        config_snapshot: row.get(4)?,
        total_stocks: row.get(5)?,
        total_param_combos: row.get(6)?,
        total_simulations: row.get(7)?,
        combos_completed: row.get(8)?,
        stocks_completed: row.get(9)?,
        elapsed_seconds: row.get(10)?,
        workers: row.get(11)?,
        store_trades: row.get::<_, i64>(12)? != 0,
        start_date: row.get(13)?,
        end_date: row.get(14)?,
    })
}

fn timestamp() -> String {
    Local::now().naive_local().format("%Y-%m-%d %H:%M:%S").to_string()
}

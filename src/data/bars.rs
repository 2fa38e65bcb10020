//! Durable store for 1-minute OHLCV bars, plus download bookkeeping.
//!
//! Bars are keyed by (instrument, ts); duplicate inserts are ignored so
//! re-downloads are idempotent. The read side only ever surfaces bars inside
//! the regular session (09:15-15:29) with positive volume, sorted by
//! timestamp, which is the contract the loader depends on.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{Local, NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::{Result, SweepError};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS bars (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        instrument TEXT NOT NULL,
        ts TEXT NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume INTEGER NOT NULL,
        UNIQUE(instrument, ts)
    );

    CREATE TABLE IF NOT EXISTS download_progress (
        instrument TEXT PRIMARY KEY,
        last_downloaded_date TEXT,
        first_target_date TEXT NOT NULL,
        last_target_date TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        total_records INTEGER DEFAULT 0,
        total_api_calls INTEGER DEFAULT 0,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS daily_api_budget (
        date TEXT PRIMARY KEY,
        calls_made INTEGER DEFAULT 0,
        last_call_time TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_bars_instrument_ts ON bars(instrument, ts);
    CREATE INDEX IF NOT EXISTS idx_bars_ts ON bars(ts);
    CREATE INDEX IF NOT EXISTS idx_bars_instrument ON bars(instrument);
    CREATE INDEX IF NOT EXISTS idx_download_status ON download_progress(status);
";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub ts: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::InProgress => "in_progress",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
        }
    }
}

impl FromStr for DownloadStatus {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "in_progress" => Ok(DownloadStatus::InProgress),
            "completed" => Ok(DownloadStatus::Completed),
            "error" => Ok(DownloadStatus::Error),
            other => Err(SweepError::config(format!(
                "unknown download status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub instrument: String,
    pub last_downloaded_date: Option<NaiveDate>,
    pub first_target_date: NaiveDate,
    pub last_target_date: NaiveDate,
    pub status: DownloadStatus,
    pub total_records: i64,
    pub total_api_calls: i64,
    pub last_error: Option<String>,
}

/// SQLite-backed bar store. WAL journal mode so backtest workers can read
/// while a downloader appends.
pub struct BarStore {
    conn: Connection,
}

impl BarStore {
    /// Open read-write, creating the schema (and parent directory) if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SweepError::config(format!(
                        "cannot create data directory {}: {e}",
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

    /// Open read-only; used by backtest workers.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Bulk insert bars for one instrument. Duplicate (instrument, ts) rows
    /// are ignored; returns the number of rows actually added.
    pub fn insert_bars(&mut self, instrument: &str, bars: &[Bar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO bars
                 (instrument, ts, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for bar in bars {
                inserted += stmt.execute(params![
                    instrument,
                    bar.ts.format(TS_FORMAT).to_string(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Session bars for one instrument, timestamp-ascending. Filters to
    /// market hours and strictly positive volume; the optional date bounds
    /// are inclusive calendar days.
    pub fn load_session_bars(
        &self,
        instrument: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<Bar>> {
        let mut sql = String::from(
            "SELECT ts, open, high, low, close, volume FROM bars
             WHERE instrument = ?1
               AND time(ts) >= '09:15:00'
               AND time(ts) <= '15:29:00'
               AND volume > 0",
        );
        let mut bound: Vec<String> = vec![instrument.to_string()];
        if let Some(start) = start {
            bound.push(format!("{start} 00:00:00"));
            sql.push_str(&format!(" AND ts >= ?{}", bound.len()));
        }
        if let Some(end) = end {
            bound.push(format!("{end} 23:59:59"));
            sql.push_str(&format!(" AND ts <= ?{}", bound.len()));
        }
        sql.push_str(" ORDER BY ts");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bound.iter()), |row| {
            let ts: String = row.get(0)?;
            Ok((
                ts,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut bars = Vec::new();
        for row in rows {
            let (ts, open, high, low, close, volume) = row?;
            let ts = NaiveDateTime::parse_from_str(&ts, TS_FORMAT).map_err(|e| {
                SweepError::Data {
                    instrument: instrument.to_string(),
                    reason: format!("unparseable bar timestamp '{ts}': {e}"),
                }
            })?;
            bars.push(Bar {
                ts,
                open,
                high,
                low,
                close,
                volume,
            });
        }
        Ok(bars)
    }

    pub fn record_count(&self, instrument: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM bars WHERE instrument = ?1",
            params![instrument],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- download progress --------------------------------------------------

    /// Initialize progress tracking for an instrument. Idempotent; an
    /// existing row is left untouched.
    pub fn init_download_progress(
        &self,
        instrument: &str,
        first_target: NaiveDate,
        last_target: NaiveDate,
    ) -> Result<()> {
        let now = Local::now().naive_local().format(TS_FORMAT).to_string();
        self.conn.execute(
            "INSERT OR IGNORE INTO download_progress
             (instrument, first_target_date, last_target_date, status,
              total_records, total_api_calls, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, 0, ?4, ?4)",
            params![
                instrument,
                first_target.to_string(),
                last_target.to_string(),
                now
            ],
        )?;
        Ok(())
    }

    pub fn update_download_progress(
        &self,
        instrument: &str,
        last_downloaded: Option<NaiveDate>,
        status: DownloadStatus,
        records_added: i64,
        calls_made: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Local::now().naive_local().format(TS_FORMAT).to_string();
        self.conn.execute(
            "UPDATE download_progress
             SET last_downloaded_date = ?2,
                 status = ?3,
                 total_records = total_records + ?4,
                 total_api_calls = total_api_calls + ?5,
                 last_error = ?6,
                 updated_at = ?7
             WHERE instrument = ?1",
            params![
                instrument,
                last_downloaded.map(|d| d.to_string()),
                status.as_str(),
                records_added,
                calls_made,
                error,
                now
            ],
        )?;
        Ok(())
    }

    /// Put every errored instrument back to pending so the next download
    /// pass retries it.
    pub fn reset_errored_downloads(&self) -> Result<usize> {
        let now = Local::now().naive_local().format(TS_FORMAT).to_string();
        let changed = self.conn.execute(
            "UPDATE download_progress
             SET status = 'pending', last_error = NULL, updated_at = ?1
             WHERE status = 'error'",
            params![now],
        )?;
        Ok(changed)
    }

    pub fn download_progress(&self, instrument: &str) -> Result<Option<DownloadProgress>> {
        let mut stmt = self.conn.prepare(
            "SELECT instrument, last_downloaded_date, first_target_date,
                    last_target_date, status, total_records, total_api_calls,
                    last_error
             FROM download_progress WHERE instrument = ?1",
        )?;
        let mut rows = stmt.query_map(params![instrument], read_progress_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn all_download_progress(&self) -> Result<Vec<DownloadProgress>> {
        let mut stmt = self.conn.prepare(
            "SELECT instrument, last_downloaded_date, first_target_date,
                    last_target_date, status, total_records, total_api_calls,
                    last_error
             FROM download_progress ORDER BY status, instrument",
        )?;
        let rows = stmt.query_map([], read_progress_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -- daily API budget ---------------------------------------------------

    pub fn daily_api_calls(&self, date: NaiveDate) -> Result<i64> {
        let calls = self
            .conn
            .query_row(
                "SELECT calls_made FROM daily_api_budget WHERE date = ?1",
                params![date.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(calls.unwrap_or(0))
    }

    /// Atomically record one API call against today's budget.
    pub fn record_api_call(&self, date: NaiveDate) -> Result<()> {
        let now = Local::now().naive_local().format(TS_FORMAT).to_string();
        self.conn.execute(
            "INSERT INTO daily_api_budget (date, calls_made, last_call_time)
             VALUES (?1, 1, ?2)
             ON CONFLICT(date) DO UPDATE
             SET calls_made = calls_made + 1, last_call_time = ?2",
            params![date.to_string(), now],
        )?;
        Ok(())
    }
}

fn read_progress_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadProgress> {
    let parse_date = |idx: usize| -> rusqlite::Result<NaiveDate> {
        let s: String = row.get(idx)?;
        s.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    };
    let status: String = row.get(4)?;
    Ok(DownloadProgress {
        instrument: row.get(0)?,
        last_downloaded_date: row
            .get::<_, Option<String>>(1)?
            .and_then(|s| s.parse().ok()),
        first_target_date: parse_date(2)?,
        last_target_date: parse_date(3)?,
        status: status.parse().unwrap_or(DownloadStatus::Pending),
        total_records: row.get(5)?,
        total_api_calls: row.get(6)?,
        last_error: row.get(7)?,
    })
}

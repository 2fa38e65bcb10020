// float_cmp: only in tests where assert_eq! on f64 is intentional.
#![cfg_attr(test, allow(clippy::float_cmp))]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use chrono::{NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use orb_sweep::config::AppConfig;
use orb_sweep::error::SweepError;
use orb_sweep::grid::{EntryConfirmation, GridFilter, StopLossType, TradeDirection};
use orb_sweep::runner::{find_resumable_run, show_status, BacktestRunner, RunOptions};

const DEFAULT_CONFIG: &str = "config/orb-sweep.toml";

#[derive(Parser)]
#[command(
    name = "orb-sweep",
    version,
    about = "Opening-range-breakout grid-search backtester"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a new grid search.
    Run(RunArgs),
    /// Continue the most recent non-completed run.
    Resume {
        /// Specific run to resume instead of the latest one.
        #[arg(long = "run-id")]
        run_id: Option<i64>,
        /// Number of parallel workers.
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Persist per-trade rows.
        #[arg(long)]
        trades: bool,
    },
    /// Print run and per-instrument progress.
    Status {
        /// Specific run to inspect instead of the latest one.
        #[arg(long = "run-id")]
        run_id: Option<i64>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Reduced 4-combo smoke grid.
    #[arg(long)]
    quick: bool,

    /// Number of parallel workers.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Persist per-trade rows (uses more disk).
    #[arg(long)]
    trades: bool,

    /// Specific instruments to backtest (default: configured universe).
    #[arg(long, num_args = 1..)]
    stocks: Option<Vec<String>>,

    /// Pin OR durations in minutes (e.g. 15 30).
    #[arg(long = "or-minutes", num_args = 1..)]
    or_minutes: Option<Vec<u32>>,

    /// Pin target multipliers (e.g. 0 2.0).
    #[arg(long, num_args = 1..)]
    targets: Option<Vec<f64>>,

    /// Pin stop-loss types: fixed, trailing, atr_based.
    #[arg(long = "sl-types", num_args = 1..)]
    sl_types: Option<Vec<String>>,

    /// Pin directions: long_only, short_only, both.
    #[arg(long, num_args = 1..)]
    directions: Option<Vec<String>>,

    /// Pin exit times (HH:MM, e.g. 14:30 15:14).
    #[arg(long = "exit-times", num_args = 1..)]
    exit_times: Option<Vec<String>>,

    /// Pin OR-size filters in percent (0 = no filter).
    #[arg(long = "or-filters", num_args = 1..)]
    or_filters: Option<Vec<f64>>,

    /// Pin entry confirmations: immediate, candle_close, volume.
    #[arg(long = "entry-confirmations", num_args = 1..)]
    entry_confirmations: Option<Vec<String>>,

    /// Date range to backtest (YYYY-MM-DD YYYY-MM-DD).
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    dates: Option<Vec<String>>,
}

impl RunArgs {
    fn grid_filter(&self) -> Result<GridFilter, SweepError> {
        Ok(GridFilter {
            or_minutes: self.or_minutes.clone(),
            targets: self.targets.clone(),
            sl_types: parse_each::<StopLossType>(self.sl_types.as_deref())?,
            directions: parse_each::<TradeDirection>(self.directions.as_deref())?,
            exit_times: self
                .exit_times
                .as_deref()
                .map(|times| times.iter().map(|t| parse_exit_time(t)).collect())
                .transpose()?,
            or_filters: self.or_filters.clone(),
            entry_confirmations: parse_each::<EntryConfirmation>(
                self.entry_confirmations.as_deref(),
            )?,
        })
    }

    fn date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>), SweepError> {
        let Some(dates) = &self.dates else {
            return Ok((None, None));
        };
        let start = parse_date(&dates[0])?;
        let end = parse_date(&dates[1])?;
        if end < start {
            return Err(SweepError::config(format!(
                "end date {end} precedes start date {start}"
            )));
        }
        Ok((Some(start), Some(end)))
    }
}

fn parse_each<T: std::str::FromStr<Err = SweepError>>(
    values: Option<&[String]>,
) -> Result<Option<Vec<T>>, SweepError> {
    values
        .map(|vs| vs.iter().map(|v| v.parse()).collect())
        .transpose()
}

fn parse_exit_time(s: &str) -> Result<NaiveTime, SweepError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| SweepError::config(format!("malformed exit time '{s}' (expected HH:MM)")))
}

fn parse_date(s: &str) -> Result<NaiveDate, SweepError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| SweepError::config(format!("malformed date '{s}' (expected YYYY-MM-DD)")))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(&Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode, SweepError> {
    let (config_path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };
    let config = AppConfig::load_or_default(&config_path, explicit)?;

    match &cli.command {
        Command::Status { run_id } => {
            show_status(&config, *run_id)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Resume {
            run_id,
            workers,
            trades,
        } => {
            let Some(run_id) = find_resumable_run(&config, *run_id)? else {
                println!("No interrupted run found. Start one with: orb-sweep run");
                return Ok(ExitCode::SUCCESS);
            };
            let options = RunOptions {
                workers: *workers,
                store_trades: *trades,
                resume_run_id: Some(run_id),
                ..RunOptions::default()
            };
            execute(config, options)
        }
        Command::Run(args) => {
            let (start_date, end_date) = args.date_range()?;
            let options = RunOptions {
                workers: args.workers,
                store_trades: args.trades,
                quick: args.quick,
                filter: args.grid_filter()?,
                stocks: args.stocks.clone(),
                start_date,
                end_date,
                resume_run_id: None,
            };
            execute(config, options)
        }
    }
}

fn execute(config: AppConfig, options: RunOptions) -> Result<ExitCode, SweepError> {
    let runner = BacktestRunner::new(config, options)?;
    println!(
        "Grid: {} combos x {} instruments = {} simulations",
        runner.param_count(),
        runner.stock_count(),
        runner.param_count() * runner.stock_count()
    );

    let interrupt = runner.interrupt_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, draining in-flight work...");
        interrupt.store(true, Ordering::Relaxed);
    })
    .map_err(|e| SweepError::config(format!("cannot install signal handler: {e}")))?;

    // Interrupted-by-user still exits cleanly; only hard failures are
    // non-zero.
    runner.run()?;
    Ok(ExitCode::SUCCESS)
}

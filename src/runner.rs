//! Grid-search orchestrator.
//!
//! Dispatches one task per instrument onto a worker pool. Each task builds
//! its own instrument view from a read-only bar store, partitions the
//! parameter list by (or_minutes, exit_time) so day caches are built once
//! per partition, and streams a single result payload back over a bounded
//! channel. The orchestrator is the only writer to the result store: it
//! commits each payload atomically, checkpoints run progress, and handles
//! interrupts and worker failures so runs stay resumable.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::AppConfig;
use crate::data::bars::BarStore;
use crate::data::loader::load_instrument;
use crate::engine::cache::build_day_caches;
use crate::engine::metrics::MetricsCalculator;
use crate::engine::simulator::Simulator;
use crate::engine::types::Trade;
use crate::error::{Result, SweepError};
use crate::grid::{GridFilter, ParameterGrid, StrategyParams};
use crate::store::{MetricsRow, ResultsStore, RunRecord, RunStatus, StockStatus};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub workers: usize,
    pub store_trades: bool,
    pub quick: bool,
    pub filter: GridFilter,
    /// Instrument override; defaults to the configured universe.
    pub stocks: Option<Vec<String>>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub resume_run_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub elapsed_seconds: f64,
    pub total_simulations: i64,
}

/// Read-only state shared by every worker task.
pub struct WorkerContext {
    pub bars_db: PathBuf,
    pub params: Vec<StrategyParams>,
    pub simulator: Simulator,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub store_trades: bool,
}

/// Everything one instrument task produces, handed to the orchestrator for
/// a single atomic commit.
pub struct InstrumentPayload {
    pub stock_code: String,
    pub metrics_rows: Vec<MetricsRow>,
    pub trade_rows: Vec<(String, Trade)>,
    pub total_trades: usize,
    pub combos_tested: usize,
    pub elapsed_seconds: f64,
}

enum TaskOutcome {
    Done(InstrumentPayload),
    /// Worker saw the interrupt flag before starting.
    Skipped,
    Failed(anyhow::Error),
}

pub struct BacktestRunner {
    config: AppConfig,
    options: RunOptions,
    params: Vec<StrategyParams>,
    stocks: Vec<String>,
    interrupt: Arc<AtomicBool>,
}

impl BacktestRunner {
    pub fn new(config: AppConfig, options: RunOptions) -> Result<Self> {
        let grid = ParameterGrid::new(&config.sweep);
        let params = if options.quick {
            grid.generate_quick()
        } else if options.filter.is_empty() {
            grid.generate_all()
        } else {
            grid.generate_filtered(&options.filter)
        };
        if params.is_empty() {
            return Err(SweepError::config("parameter grid is empty"));
        }

        let stocks = options
            .stocks
            .clone()
            .unwrap_or_else(|| config.instruments.clone());
        if stocks.is_empty() {
            return Err(SweepError::config("no instruments to backtest"));
        }

        Ok(Self {
            config,
            options,
            params,
            stocks,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag observed by dispatch and by every worker; wire it to SIGINT.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn stock_count(&self) -> usize {
        self.stocks.len()
    }

    /// Execute the grid search, creating or resuming a run.
    pub fn run(&self) -> Result<RunSummary> {
        if !self.config.paths.bars_db.exists() {
            return Err(SweepError::config(format!(
                "bar store not found: {}",
                self.config.paths.bars_db.display()
            )));
        }
        let mut results = ResultsStore::open(&self.config.paths.results_db)?;

        let total_combos = self.params.len();
        let total_stocks = self.stocks.len();
        let total_simulations = (total_combos * total_stocks) as i64;
        let workers = self.options.workers.max(1);
        let start_date = self.options.start_date.or(self.config.backtest.start_date);
        let end_date = self.options.end_date.or(self.config.backtest.end_date);

        let run_id = self.init_run(&mut results, total_combos, start_date, end_date)?;

        print_banner(
            run_id,
            total_stocks,
            total_combos,
            workers,
            start_date,
            end_date,
            self.options.store_trades,
        );

        let completed: Vec<String> = results.get_completed_stocks(run_id)?;
        let todo: Vec<String> = self
            .stocks
            .iter()
            .filter(|s| !completed.contains(*s))
            .cloned()
            .collect();
        if todo.is_empty() {
            println!("All instruments already completed for run {run_id}.");
            results.update_run_status(run_id, RunStatus::Completed, None, None, None)?;
            return Ok(RunSummary {
                run_id,
                status: RunStatus::Completed,
                elapsed_seconds: 0.0,
                total_simulations,
            });
        }
        println!("Instruments to process: {}/{total_stocks}\n", todo.len());

        results.insert_params_batch(&self.params)?;

        let ctx = Arc::new(WorkerContext {
            bars_db: self.config.paths.bars_db.clone(),
            params: self.params.clone(),
            simulator: Simulator {
                capital: self.config.backtest.capital,
                max_risk_per_trade: self.config.backtest.max_risk_per_trade,
                brokerage_rate: self.config.backtest.brokerage_rate,
                stt_rate: self.config.backtest.stt_rate,
            },
            start_date,
            end_date,
            store_trades: self.options.store_trades,
        });

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| SweepError::config(format!("cannot build worker pool: {e}")))?;
        let (tx, rx) = crossbeam_channel::bounded::<(String, TaskOutcome)>(workers * 2);

        for stock in &todo {
            results.mark_stock_in_progress(run_id, stock)?;
        }
        for stock in todo.clone() {
            let tx = tx.clone();
            let ctx = Arc::clone(&ctx);
            let interrupt = Arc::clone(&self.interrupt);
            pool.spawn(move || {
                let outcome = if interrupt.load(Ordering::Relaxed) {
                    TaskOutcome::Skipped
                } else {
                    match process_instrument(&ctx, &stock) {
                        Ok(payload) => TaskOutcome::Done(payload),
                        Err(e) => TaskOutcome::Failed(e),
                    }
                };
                // Receiver may be gone if the orchestrator aborted.
                let _ = tx.send((stock, outcome));
            });
        }
        drop(tx);

        let bar = ProgressBar::new(todo.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  [{bar:30.cyan/dim}] {pos}/{len} instruments  {msg}")
                .expect("valid template")
                .progress_chars("=> "),
        );

        let t0 = Instant::now();
        let mut stocks_done = completed.len() as i64;
        let mut session_done = 0usize;
        let mut total_trades_all = 0usize;

        for (stock, outcome) in rx {
            match outcome {
                TaskOutcome::Done(payload) => {
                    total_trades_all += payload.total_trades;
                    results.commit_instrument(
                        run_id,
                        &stock,
                        &payload.metrics_rows,
                        &payload.trade_rows,
                        payload.combos_tested,
                        payload.total_trades,
                        payload.elapsed_seconds,
                    )?;
                    stocks_done += 1;
                    session_done += 1;

                    let elapsed = t0.elapsed().as_secs_f64();
                    results.update_run_status(
                        run_id,
                        RunStatus::Running,
                        Some(stocks_done * total_combos as i64),
                        Some(stocks_done),
                        Some(elapsed),
                    )?;

                    let per_stock = elapsed / session_done as f64;
                    let remaining = (todo.len() - session_done) as f64 * per_stock;
                    bar.inc(1);
                    bar.set_message(format!(
                        "{stock} in {:.1}s ({} trades) | ETA {:.1} min",
                        payload.elapsed_seconds,
                        payload.total_trades,
                        remaining / 60.0,
                    ));
                }
                TaskOutcome::Skipped => {
                    results.mark_stock_pending(run_id, &stock)?;
                    bar.inc(1);
                }
                TaskOutcome::Failed(source) => {
                    // Roll back so a resume retries this instrument, then
                    // keep going with the rest.
                    let err = SweepError::Worker {
                        instrument: stock.clone(),
                        source,
                    };
                    tracing::error!(error = %err, cause = ?err, "rolling instrument back to pending");
                    results.mark_stock_pending(run_id, &stock)?;
                    bar.inc(1);
                }
            }
        }
        bar.finish_and_clear();

        let elapsed = t0.elapsed().as_secs_f64();
        if self.interrupt.load(Ordering::Relaxed) {
            results.reset_in_progress(run_id)?;
            results.update_run_status(run_id, RunStatus::Interrupted, None, None, Some(elapsed))?;
            println!("\nInterrupted after {elapsed:.1}s. Resume with: orb-sweep resume");
            return Ok(RunSummary {
                run_id,
                status: RunStatus::Interrupted,
                elapsed_seconds: elapsed,
                total_simulations,
            });
        }

        let all_completed = results.get_completed_stocks(run_id)?.len() as i64;
        let final_status = if all_completed == total_stocks as i64 {
            RunStatus::Completed
        } else {
            // Some instruments failed and were rolled back to pending.
            RunStatus::Interrupted
        };
        results.update_run_status(
            run_id,
            final_status,
            Some(all_completed * total_combos as i64),
            Some(all_completed),
            Some(elapsed),
        )?;

        println!(
            "\n{} in {elapsed:.1}s ({:.1} min): {total_simulations} simulations, {total_trades_all} trades",
            if final_status == RunStatus::Completed {
                "COMPLETED"
            } else {
                "FINISHED WITH FAILURES"
            },
            elapsed / 60.0,
        );

        Ok(RunSummary {
            run_id,
            status: final_status,
            elapsed_seconds: elapsed,
            total_simulations,
        })
    }

    fn init_run(
        &self,
        results: &mut ResultsStore,
        total_combos: usize,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<i64> {
        if let Some(run_id) = self.options.resume_run_id {
            if let Some(run) = results.get_run(run_id)? {
                println!(
                    "Resuming run {run_id} ({}/{} instruments done)",
                    run.stocks_completed, run.total_stocks
                );
                return Ok(run_id);
            }
            tracing::warn!(run_id, "run not found, starting a new one");
        }
        results.create_run(
            &self.config.snapshot(),
            total_combos,
            &self.stocks,
            self.options.workers.max(1),
            self.options.store_trades,
            start_date,
            end_date,
        )
    }
}

/// Process every parameter combination for one instrument.
///
/// Loads the instrument view once, then builds day caches once per
/// (or_minutes, exit_time) partition and reuses them for every combination
/// in the partition. Runs on a worker thread; does not touch the result
/// store.
pub fn process_instrument(
    ctx: &WorkerContext,
    stock_code: &str,
) -> anyhow::Result<InstrumentPayload> {
    let t0 = Instant::now();

    let bars = BarStore::open_read_only(&ctx.bars_db)
        .with_context(|| format!("opening bar store for {stock_code}"))?;
    let or_minutes_list = ParameterGrid::unique_or_minutes(&ctx.params);
    let view = load_instrument(
        &bars,
        stock_code,
        ctx.start_date,
        ctx.end_date,
        &or_minutes_list,
    )
    .with_context(|| format!("loading bars for {stock_code}"))?;

    if view.is_empty() {
        // No data in range: complete with zero trades, not an error.
        return Ok(InstrumentPayload {
            stock_code: stock_code.to_string(),
            metrics_rows: Vec::new(),
            trade_rows: Vec::new(),
            total_trades: 0,
            combos_tested: 0,
            elapsed_seconds: t0.elapsed().as_secs_f64(),
        });
    }

    let calculator = MetricsCalculator::new(ctx.simulator.capital);

    // Partition by (or_minutes, exit_time) so each partition shares one set
    // of day caches.
    let mut partitions: BTreeMap<(u32, chrono::NaiveTime), Vec<&StrategyParams>> =
        BTreeMap::new();
    for p in &ctx.params {
        partitions
            .entry((p.or_minutes, p.exit_time))
            .or_default()
            .push(p);
    }

    let mut metrics_rows = Vec::with_capacity(ctx.params.len());
    let mut trade_rows = Vec::new();
    let mut total_trades = 0usize;

    for ((or_minutes, exit_time), group) in &partitions {
        let Some(or_data) = view.or_stats(*or_minutes) else {
            continue;
        };
        let day_caches = build_day_caches(&view, or_data, *or_minutes, *exit_time);

        for &params in group {
            let trades = ctx.simulator.run(&view, params, or_data, &day_caches);
            total_trades += trades.len();

            let result = calculator.compute(&trades);
            if ctx.store_trades && !trades.is_empty() {
                let param_id = params.param_id();
                trade_rows.extend(trades.into_iter().map(|t| (param_id.clone(), t)));
            }
            metrics_rows.push(MetricsRow {
                params: params.clone(),
                result,
            });
        }
    }

    Ok(InstrumentPayload {
        stock_code: stock_code.to_string(),
        metrics_rows,
        trade_rows,
        total_trades,
        combos_tested: ctx.params.len(),
        elapsed_seconds: t0.elapsed().as_secs_f64(),
    })
}

fn print_banner(
    run_id: i64,
    stocks: usize,
    combos: usize,
    workers: usize,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    store_trades: bool,
) {
    let fmt_date =
        |d: Option<NaiveDate>| d.map_or_else(|| "all".to_string(), |d| d.to_string());
    println!("{}", "=".repeat(60));
    println!("ORB Backtest Grid Search (run {run_id})");
    println!("{}", "=".repeat(60));
    println!("Instruments:       {stocks}");
    println!("Parameter combos:  {combos}");
    println!("Total simulations: {}", stocks * combos);
    println!("Workers:           {workers}");
    println!("Date range:        {} to {}", fmt_date(start), fmt_date(end));
    println!("Store trades:      {store_trades}");
    println!("{}", "=".repeat(60));
}

/// Print run and per-instrument progress for `status`.
pub fn show_status(config: &AppConfig, run_id: Option<i64>) -> Result<()> {
    let store = ResultsStore::open(&config.paths.results_db)?;
    let run: Option<RunRecord> = match run_id {
        Some(id) => store.get_run(id)?,
        None => store.latest_run()?,
    };
    let Some(run) = run else {
        println!("No backtest runs found.");
        return Ok(());
    };

    println!("{}", "=".repeat(60));
    println!("Backtest Run #{}", run.run_id);
    println!("{}", "=".repeat(60));
    println!("Status:     {}", run.status);
    println!("Created:    {}", run.created_at);
    if let Some(completed_at) = &run.completed_at {
        println!("Completed:  {completed_at}");
    }
    println!("Instruments: {}/{}", run.stocks_completed, run.total_stocks);
    println!(
        "Simulations: {}/{}",
        run.combos_completed, run.total_simulations
    );
    println!("Workers:    {}", run.workers);
    println!(
        "Elapsed:    {:.1}s ({:.1} min)",
        run.elapsed_seconds,
        run.elapsed_seconds / 60.0
    );
    if let (Some(start), Some(end)) = (&run.start_date, &run.end_date) {
        println!("Date range: {start} to {end}");
    }

    let progress = store.get_progress(run.run_id)?;
    if !progress.is_empty() {
        println!("\nPer-instrument progress:");
        for p in &progress {
            let icon = match p.status {
                StockStatus::Completed => "+",
                StockStatus::InProgress => "~",
                StockStatus::Pending => "-",
            };
            let timing = if p.elapsed_seconds > 0.0 {
                format!(" ({:.1}s)", p.elapsed_seconds)
            } else {
                String::new()
            };
            let trades = if p.total_trades_found > 0 {
                format!(" {} trades", p.total_trades_found)
            } else {
                String::new()
            };
            println!("  {icon} {}{timing}{trades}", p.stock_code);
        }
    }
    println!("{}", "=".repeat(60));
    Ok(())
}

/// Resolve the run id `resume` should continue: the given id, or the most
/// recent non-completed run.
pub fn find_resumable_run(config: &AppConfig, run_id: Option<i64>) -> Result<Option<i64>> {
    if run_id.is_some() {
        return Ok(run_id);
    }
    if !config.paths.results_db.exists() {
        return Ok(None);
    }
    let store = ResultsStore::open_read_only(&config.paths.results_db)?;
    Ok(store.latest_resumable_run()?.map(|r| r.run_id))
}

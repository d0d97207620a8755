//! emuval - validate infrastructure definitions against isolated emulators
//!
//! ## Commands
//!
//! - `validate`: run a batch over the artifacts catalog and seal a run
//! - `compare`: regressions, fixes and capability trends between two runs
//! - `trends`: per-capability pass-rate history
//! - `flaky`: tests that both passed and failed across recent runs
//! - `diagnose`: root-cause clusters for a run's failures
//! - `runs`: list sealed runs
//! - `clean`: remove emulator instances left by interrupted batches

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use emuval_core::{
    capability_history, clean_stale_environments, compare_stored_runs, diagnose_run, flaky_tests,
    recent_sealed_runs, resolve_comparison_pair, Catalog, CapabilityHistory, DockerEmulator,
    EngineConfig, PytestRunner, Scheduler, TerraformDeployer, TestStability,
};
use emuval_state::{FsRunStore, RunId, RunSnapshot, RunStatus, RunStore};
use tracing::{info, warn, Level};

/// Exit status when `compare` finds regressions.
const EXIT_REGRESSIONS: u8 = 1;
/// Exit status when a batch was interrupted.
const EXIT_ABORTED: u8 = 130;

#[derive(Parser)]
#[command(name = "emuval")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Validate infrastructure definitions against isolated cloud emulators", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "EMUVAL_CONFIG")]
    config: Option<PathBuf>,

    /// Root holding candidates/, harnesses/ and runs/
    #[arg(long, global = true, env = "EMUVAL_ARTIFACTS_DIR", default_value = "artifacts")]
    artifacts_dir: PathBuf,

    /// Trend dead-band in percentage points
    #[arg(long, global = true, env = "EMUVAL_DEAD_BAND")]
    dead_band: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate every candidate that has a test harness
    Validate {
        /// Only validate the candidate with this hash (or hash prefix)
        #[arg(long)]
        candidate: Option<String>,

        /// Maximum candidates validated at once
        #[arg(long, env = "EMUVAL_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Per-candidate deadline in seconds
        #[arg(long, env = "EMUVAL_TIMEOUT")]
        timeout: Option<u64>,

        /// Per-test ceiling in seconds
        #[arg(long, env = "EMUVAL_TEST_TIMEOUT")]
        test_timeout: Option<u64>,

        /// Emulator version pinned for the run
        #[arg(long, env = "EMUVAL_EMULATOR_VERSION")]
        emulator_version: Option<String>,
    },

    /// Compare two sealed runs (default: the two most recent)
    Compare {
        /// Previous run id
        previous: Option<String>,

        /// Current run id (default: newest sealed run)
        #[arg(long)]
        current: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Per-capability pass-rate history
    Trends {
        /// Number of recent sealed runs (default: trend_history_len)
        #[arg(long)]
        last: Option<usize>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Tests that flip between passing and failing
    Flaky {
        #[arg(long, default_value = "10")]
        last: usize,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Cluster a run's failures by root cause
    Diagnose {
        /// Run id (default: newest sealed run)
        run: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List sealed runs, newest first
    Runs {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Remove emulator instances left behind by interrupted batches
    Clean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Values given on the command line or through `EMUVAL_*` variables.
#[derive(Debug, Default)]
struct Overrides {
    concurrency: Option<usize>,
    candidate_timeout_secs: Option<u64>,
    test_timeout_secs: Option<u64>,
    emulator_version: Option<String>,
    dead_band: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    emuval_core::init_tracing(cli.json, level);

    let mut overrides = Overrides {
        dead_band: cli.dead_band,
        ..Default::default()
    };
    if let Commands::Validate {
        concurrency,
        timeout,
        test_timeout,
        emulator_version,
        ..
    } = &cli.command
    {
        overrides.concurrency = *concurrency;
        overrides.candidate_timeout_secs = *timeout;
        overrides.test_timeout_secs = *test_timeout;
        overrides.emulator_version = emulator_version.clone();
    }
    let config = resolve_config(cli.config.as_deref(), &overrides)?;

    let code = match cli.command {
        Commands::Validate { candidate, .. } => {
            cmd_validate(config, &cli.artifacts_dir, candidate.as_deref()).await?
        }
        Commands::Clean => cmd_clean().await?,
        command => {
            let store = FsRunStore::new(&cli.artifacts_dir).with_context(|| {
                format!("failed to open run store at {}", cli.artifacts_dir.display())
            })?;
            match command {
                Commands::Compare {
                    previous,
                    current,
                    format,
                } => {
                    cmd_compare(
                        &store,
                        previous.as_deref(),
                        current.as_deref(),
                        config.trend_dead_band_pct,
                        format,
                    )
                    .await?
                }
                Commands::Trends { last, format } => {
                    let last = last.unwrap_or(config.trend_history_len);
                    cmd_trends(&store, last, config.trend_dead_band_pct, format).await?
                }
                Commands::Flaky { last, format } => cmd_flaky(&store, last, format).await?,
                Commands::Diagnose { run, format } => {
                    cmd_diagnose(&store, run.as_deref(), format).await?
                }
                Commands::Runs { limit } => cmd_runs(&store, limit).await?,
                Commands::Validate { .. } | Commands::Clean => 0,
            }
        }
    };
    Ok(ExitCode::from(code))
}

/// Defaults, then the config file, then overrides. The result is validated.
fn resolve_config(path: Option<&Path>, overrides: &Overrides) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_toml_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(v) = overrides.concurrency {
        config.concurrency = v;
    }
    if let Some(v) = overrides.candidate_timeout_secs {
        config.candidate_timeout_secs = v;
    }
    if let Some(v) = overrides.test_timeout_secs {
        config.test_timeout_secs = v;
    }
    if let Some(v) = &overrides.emulator_version {
        config.emulator_version = v.clone();
    }
    if let Some(v) = overrides.dead_band {
        config.trend_dead_band_pct = v;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Run one batch over the catalog.
async fn cmd_validate(config: EngineConfig, artifacts_dir: &Path, candidate: Option<&str>) -> Result<u8> {
    let jobs = Catalog::new(artifacts_dir)
        .jobs(candidate)
        .context("failed to load candidates")?;
    if jobs.is_empty() {
        println!("No candidates with test harnesses under {}", artifacts_dir.display());
        return Ok(0);
    }

    let store = Arc::new(FsRunStore::new(artifacts_dir).with_context(|| {
        format!("failed to open run store at {}", artifacts_dir.display())
    })?);
    let scheduler = Scheduler::new(
        config,
        Arc::new(DockerEmulator::new()),
        Arc::new(TerraformDeployer::new()),
        Arc::new(PytestRunner::new()),
        store,
    )?;

    let abort = scheduler.abort_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting batch");
            abort.abort();
        }
    });

    info!(candidates = jobs.len(), "starting validation batch");
    let result = scheduler.run_batch(jobs).await;
    interrupt.abort();
    let snapshot = result.context("validation batch failed")?;

    print!("{}", render_batch(&snapshot));
    if snapshot.record.status == RunStatus::Aborted {
        return Ok(EXIT_ABORTED);
    }
    Ok(0)
}

fn render_batch(snapshot: &RunSnapshot) -> String {
    let mut out = String::new();
    for outcome in &snapshot.outcomes {
        let mut line = format!(
            "{:<8} {}  [{}]  {:.1}s",
            outcome.state.as_str(),
            outcome.candidate_hash,
            outcome.capabilities.join(","),
            outcome.duration_ms as f64 / 1000.0
        );
        if let Some(tests) = &outcome.tests {
            line.push_str(&format!("  tests {}/{}", tests.passed, tests.executed()));
        }
        if let Some(error) = &outcome.error {
            line.push_str(&format!("  {error}"));
        }
        out.push_str(&line);
        out.push('\n');
    }
    if let Some(summary) = &snapshot.record.summary {
        out.push_str(&format!(
            "\nRun {} ({}): {} candidates, {} passed, {} partial, {} failed, {} timeout, {} error ({:.1}% pass rate)\n",
            snapshot.run_id(),
            status_label(snapshot.record.status),
            summary.total,
            summary.passed,
            summary.partial,
            summary.failed,
            summary.timeout,
            summary.error,
            summary.pass_rate()
        ));
    }
    out
}

/// Compare two runs. Returns [`EXIT_REGRESSIONS`] when any were found.
async fn cmd_compare(
    store: &dyn RunStore,
    previous: Option<&str>,
    current: Option<&str>,
    dead_band: f64,
    format: OutputFormat,
) -> Result<u8> {
    let (current, previous) = resolve_comparison_pair(
        store,
        current.map(RunId::from),
        previous.map(RunId::from),
    )
    .await
    .context("failed to select runs to compare")?;
    let report = compare_stored_runs(store, &current, &previous, dead_band).await?;

    match format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(if report.has_regressions() {
        EXIT_REGRESSIONS
    } else {
        0
    })
}

async fn cmd_trends(store: &dyn RunStore, last: usize, dead_band: f64, format: OutputFormat) -> Result<u8> {
    let runs = recent_sealed_runs(store, last).await?;
    let history = capability_history(&runs, dead_band);
    match format {
        OutputFormat::Text => print!("{}", render_trends(&history, runs.len())),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&history)?),
    }
    Ok(0)
}

fn render_trends(history: &[CapabilityHistory], runs: usize) -> String {
    if history.is_empty() {
        return "No capability data in sealed runs\n".to_string();
    }
    let mut out = format!("Capability trends over {runs} run(s):\n");
    for entry in history {
        let latest = entry
            .entries
            .first()
            .map(|e| format!("{:.1}%", e.pass_rate))
            .unwrap_or_else(|| "-".to_string());
        let delta = entry
            .delta
            .map(|d| format!("{d:+.1}"))
            .unwrap_or_else(|| "-".to_string());
        let series = entry
            .entries
            .iter()
            .map(|e| format!("{:.0}", e.pass_rate))
            .collect::<Vec<_>>()
            .join(" ");
        out.push_str(&format!(
            "  {:<20} {:>7} {:>7}  {:<9}  [{}]\n",
            entry.capability,
            latest,
            delta,
            entry.direction.to_string(),
            series
        ));
    }
    out
}

async fn cmd_flaky(store: &dyn RunStore, last: usize, format: OutputFormat) -> Result<u8> {
    let runs = recent_sealed_runs(store, last).await?;
    let flaky = flaky_tests(&runs);
    match format {
        OutputFormat::Text => print!("{}", render_flaky(&flaky)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&flaky)?),
    }
    Ok(0)
}

fn render_flaky(flaky: &[TestStability]) -> String {
    if flaky.is_empty() {
        return "No flaky tests found\n".to_string();
    }
    let mut out = String::new();
    for test in flaky {
        out.push_str(&format!(
            "{}  {}  passed {} / failed {}  flips {}\n",
            test.candidate_hash, test.test_name, test.passes, test.failures, test.flips
        ));
    }
    out
}

async fn cmd_diagnose(store: &dyn RunStore, run: Option<&str>, format: OutputFormat) -> Result<u8> {
    let snapshot = match run {
        Some(id) => emuval_state::load_snapshot(store, &RunId::from(id))
            .await
            .with_context(|| format!("failed to load run {id}"))?,
        None => match recent_sealed_runs(store, 1).await?.into_iter().next() {
            Some(snapshot) => snapshot,
            None => bail!("no sealed runs to diagnose"),
        },
    };
    let report = diagnose_run(&snapshot);
    match format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(0)
}

async fn cmd_runs(store: &dyn RunStore, limit: usize) -> Result<u8> {
    let runs = store.list_runs().await?;
    let sealed: Vec<_> = runs
        .into_iter()
        .rev()
        .filter(|r| r.status.is_sealed())
        .take(limit)
        .collect();
    if sealed.is_empty() {
        println!("No sealed runs");
        return Ok(0);
    }
    for run in sealed {
        let summary = run.summary.unwrap_or_default();
        println!(
            "{}  {:<9}  {}  v{}  {}/{} passed",
            run.run_id,
            status_label(run.status),
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.settings.emulator_version,
            summary.passed,
            summary.total
        );
    }
    Ok(0)
}

async fn cmd_clean() -> Result<u8> {
    let report = clean_stale_environments(&DockerEmulator::new())
        .await
        .context("failed to list stale environments")?;
    println!("Removed {} stale environment(s)", report.removed.len());
    for (name, reason) in &report.failed {
        println!("  could not remove {name}: {reason}");
    }
    Ok(if report.failed.is_empty() { 0 } else { 1 })
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Aborted => "aborted",
    }
}

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sweep_runner::{
    ColumnSchema, HarnessSettings, ProcessLauncher, RunResult, SettingsOverrides, SweepConfig,
    SweepSummary, WorkloadRegistry,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Supervised batch runner for job matrices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug, Default)]
struct HarnessArgs {
    /// Wall-clock budget per job, in seconds
    #[arg(long, env = "SWEEP_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,
    /// Grace period between the termination request and the forced kill
    #[arg(long, env = "SWEEP_GRACE_SECS")]
    grace_secs: Option<f64>,
    /// Share of available cores used as the concurrency bound
    #[arg(long, env = "SWEEP_PARALLELISM_FRACTION")]
    parallelism_fraction: Option<f64>,
    /// Absolute concurrency bound; wins over the fraction
    #[arg(long, env = "SWEEP_MAX_PARALLEL")]
    max_parallel: Option<usize>,
    #[arg(long, env = "SWEEP_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
    /// Write the historical bot_strategy,opponent_race,difficulty,map,result header
    #[arg(long, env = "SWEEP_LEGACY_HEADER")]
    legacy_header: bool,
}

impl HarnessArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            timeout_secs: self.timeout_secs,
            grace_secs: self.grace_secs,
            parallelism_fraction: self.parallelism_fraction,
            max_parallel: self.max_parallel,
            output_dir: self.output_dir.clone(),
            column_schema: self.legacy_header.then_some(ColumnSchema::Legacy),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job of a sweep and write the result table
    Run {
        sweep: PathBuf,
        #[command(flatten)]
        harness: HarnessArgs,
        #[arg(long)]
        json: bool,
    },
    /// Print the job matrix and effective settings without running anything
    Describe {
        sweep: PathBuf,
        #[command(flatten)]
        harness: HarnessArgs,
        #[arg(long)]
        json: bool,
    },
    /// Write a template sweep file
    Init {
        #[arg(default_value = "sweep.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Execute one job read from stdin (started by `run`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            sweep,
            harness,
            json,
        } => {
            let config = SweepConfig::load(&sweep)?;
            let settings = HarnessSettings::resolve(&harness.overrides(), &config)?;
            let interrupt = install_interrupt_handler()?;
            let launcher = worker_launcher(&sweep)?;
            let result = sweep_runner::run_sweep(&config, &settings, launcher, &interrupt)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": run_result_to_json(&result),
                })));
            }
            print_run_result(&result);
        }
        Commands::Describe {
            sweep,
            harness,
            json,
        } => {
            let config = SweepConfig::load(&sweep)?;
            let settings = HarnessSettings::resolve(&harness.overrides(), &config)?;
            let summary = sweep_runner::describe_sweep(&config, &settings)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "sweep file already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, SWEEP_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: sweep describe {}", path.display());
        }
        Commands::Worker { config } => {
            let registry = match SweepConfig::load(&config) {
                Ok(config) => config.registry(),
                Err(err) => {
                    // An empty registry still answers with a well-formed ERROR record.
                    warn!(error = %format!("{:#}", err), "worker could not load sweep file");
                    WorkloadRegistry::new()
                }
            };
            let stdin = io::stdin();
            let stdout = io::stdout();
            sweep_runner::serve_one(&mut stdin.lock(), &mut stdout.lock(), &registry)?;
        }
    }
    Ok(None)
}

fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || {
        if !flag.swap(true, Ordering::SeqCst) {
            warn!("interrupt received; no new jobs will start, waiting for running jobs");
        } else {
            info!("still waiting for running jobs to reach their budget");
        }
    })?;
    Ok(interrupt)
}

fn worker_launcher(sweep: &Path) -> Result<ProcessLauncher> {
    let exe = std::env::current_exe()?;
    let config = sweep.canonicalize().unwrap_or_else(|_| sweep.to_path_buf());
    Ok(ProcessLauncher::new(exe)
        .arg("worker")
        .arg("--config")
        .arg(config))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        _ => false,
    }
}

fn run_result_to_json(result: &RunResult) -> Value {
    json!({
        "run_id": result.run_id,
        "run_dir": result.run_dir.display().to_string(),
        "results": result.results_path.display().to_string(),
        "manifest": result.manifest_path.display().to_string(),
        "total_jobs": result.total_jobs,
        "dispatched": result.dispatched,
        "completed": result.completed,
        "interrupted": result.interrupted,
        "outcomes": result.outcome_counts,
    })
}

fn print_run_result(result: &RunResult) {
    println!("run_id: {}", result.run_id);
    println!("results: {}", result.results_path.display());
    println!("completed: {}/{}", result.completed, result.total_jobs);
    if result.interrupted {
        println!(
            "interrupted: {} jobs not started",
            result.total_jobs - result.dispatched
        );
    }
    for (outcome, count) in &result.outcome_counts {
        println!("  {}: {}", outcome, count);
    }
}

fn summary_to_json(summary: &SweepSummary) -> Value {
    json!({
        "sweep": summary.sweep_id,
        "config_digest": summary.config_digest,
        "work_variants": summary.axes.work_variants,
        "own_sides": summary.axes.own_sides,
        "opposing_sides": summary.axes.opposing_sides,
        "difficulties": summary.axes.difficulties,
        "environments": summary.axes.environments,
        "total_jobs": summary.total_jobs,
        "instrumented": summary.instrumented,
        "parallelism": summary.parallelism,
        "timeout_secs": summary.timeout_secs,
        "grace_secs": summary.grace_secs,
        "output_dir": summary.output_dir.display().to_string(),
        "column_schema": summary.column_schema,
    })
}

fn print_summary(summary: &SweepSummary) {
    println!("sweep: {}", summary.sweep_id);
    println!("config_digest: {}", summary.config_digest);
    println!("work_variants: {:?}", summary.axes.work_variants);
    println!("own_sides: {:?}", summary.axes.own_sides);
    println!("opposing_sides: {:?}", summary.axes.opposing_sides);
    println!("difficulties: {:?}", summary.axes.difficulties);
    println!("environments: {:?}", summary.axes.environments);
    println!("total_jobs: {}", summary.total_jobs);
    println!("instrumented: {}", summary.instrumented);
    println!("parallelism: {}", summary.parallelism);
    println!("timeout_secs: {}", summary.timeout_secs);
    println!("grace_secs: {}", summary.grace_secs);
    println!("output_dir: {}", summary.output_dir.display());
    println!("column_schema: {}", summary.column_schema);
}

const SWEEP_TEMPLATE: &str = "\
version: '1'
sweep:
  id: ladder                          # used in run directory names
variants:                             # registry keys; resolved inside each worker
  - id: baseline
    workload:
      kind: command                   # command | fixed | sleep | fail | panic | hang
      command: [./run_engine.sh]      # outcome = last non-empty stdout line
own_sides: [protoss]
opposing_sides: [protoss, terran, zerg]
difficulties: [medium]
environments: []                      # explicit names, and/or:
environments_from:
  dir: maps
  extension: SC2Map
instrumented: false
harness:
  timeout_secs: 300
  grace_secs: 1
  parallelism_fraction: 0.5
  output_dir: results
  column_schema: standard             # standard | legacy
";

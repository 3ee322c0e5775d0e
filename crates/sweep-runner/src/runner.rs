use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

use crate::aggregator::{atomic_write_json_pretty, PersistGuard, ResultAggregator};
use crate::config::{HarnessSettings, SweepConfig};
use crate::matrix::{build_matrix, MatrixAxes};
use crate::pool::{available_cores, SupervisorPool};
use crate::supervisor::{TimeoutSupervisor, WorkerLauncher};

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub results_path: PathBuf,
    pub manifest_path: PathBuf,
    pub total_jobs: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub interrupted: bool,
    pub outcome_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct SweepSummary {
    pub sweep_id: String,
    pub config_digest: String,
    pub axes: MatrixAxes,
    pub total_jobs: usize,
    pub instrumented: bool,
    pub parallelism: usize,
    pub timeout_secs: f64,
    pub grace_secs: f64,
    pub output_dir: PathBuf,
    pub column_schema: String,
}

pub fn describe_sweep(config: &SweepConfig, settings: &HarnessSettings) -> Result<SweepSummary> {
    let axes = config.matrix_axes()?;
    Ok(SweepSummary {
        sweep_id: config.sweep.id.clone(),
        config_digest: config.digest()?,
        total_jobs: axes.job_count(),
        axes,
        instrumented: config.instrumented,
        parallelism: settings.parallelism(available_cores()),
        timeout_secs: settings.timeout.as_secs_f64(),
        grace_secs: settings.grace.as_secs_f64(),
        output_dir: settings.output_dir.clone(),
        column_schema: settings.column_schema.as_str().to_string(),
    })
}

/// Runs the full job matrix of `config`, one isolated worker per job started
/// through `launcher`, and persists the result table under the output
/// directory.
///
/// Setting `interrupt` stops new jobs from starting; whatever has completed
/// is still persisted and the call returns normally. The only error after
/// dispatch begins is a failure to write the result table.
pub fn run_sweep<L: WorkerLauncher>(
    config: &SweepConfig,
    settings: &HarnessSettings,
    launcher: L,
    interrupt: &AtomicBool,
) -> Result<RunResult> {
    let axes = config.matrix_axes()?;
    let jobs = build_matrix(&axes, config.instrumented);
    let total_jobs = jobs.len();
    if total_jobs == 0 {
        warn!(sweep = %config.sweep.id, "job matrix is empty; nothing to run");
    }

    let run_id = format!("{}_{}", config.sweep.id, Utc::now().format("%Y%m%d_%H%M%S"));
    let run_dir = settings.output_dir.join(&run_id);
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating output directory {}", run_dir.display()))?;
    let results_path = run_dir.join("results.csv");
    let manifest_path = run_dir.join("manifest.json");
    let config_digest = config.digest()?;
    let parallelism = settings.parallelism(available_cores());
    let started_at = Utc::now().to_rfc3339();

    let manifest = RunManifest {
        run_id: &run_id,
        sweep_id: &config.sweep.id,
        config_digest: &config_digest,
        settings,
        parallelism,
        total_jobs,
        started_at: &started_at,
    };
    manifest.write(&manifest_path, "running", None)?;

    info!(
        run_id = %run_id,
        jobs = total_jobs,
        parallelism,
        timeout_secs = settings.timeout.as_secs_f64(),
        "starting sweep"
    );

    let aggregator = ResultAggregator::new(settings.column_schema);
    let guard = PersistGuard::new(&aggregator, &results_path);
    let pool = SupervisorPool::new(TimeoutSupervisor::new(launcher, settings.timings()), parallelism);
    let stats = pool.dispatch(jobs, interrupt, |record| {
        let done = aggregator.len() + 1;
        info!(
            work_variant = %record.work_variant,
            opposing_side = %record.opposing_side,
            difficulty = %record.difficulty,
            environment = %record.environment,
            outcome = %record.outcome,
            progress = %format!("{}/{}", done, total_jobs),
            "job finished"
        );
        aggregator.push(record);
    });
    let completed = guard
        .finish()
        .with_context(|| format!("writing results for run {}", run_id))?;

    let outcome_counts = aggregator.snapshot().outcome_counts();
    let status = if stats.interrupted { "interrupted" } else { "completed" };
    if let Err(err) = manifest.write(&manifest_path, status, Some((completed, &outcome_counts))) {
        warn!(error = %format!("{:#}", err), "failed to update run manifest");
    }

    Ok(RunResult {
        run_id,
        run_dir,
        results_path,
        manifest_path,
        total_jobs,
        dispatched: stats.dispatched,
        completed,
        interrupted: stats.interrupted,
        outcome_counts,
    })
}

struct RunManifest<'a> {
    run_id: &'a str,
    sweep_id: &'a str,
    config_digest: &'a str,
    settings: &'a HarnessSettings,
    parallelism: usize,
    total_jobs: usize,
    started_at: &'a str,
}

impl RunManifest<'_> {
    fn write(
        &self,
        path: &Path,
        status: &str,
        finished: Option<(usize, &BTreeMap<String, usize>)>,
    ) -> Result<()> {
        let payload = json!({
            "schema_version": "sweep_manifest_v1",
            "run_id": self.run_id,
            "sweep_id": self.sweep_id,
            "config_digest": self.config_digest,
            "status": status,
            "interrupted": status == "interrupted",
            "runner_version": env!("CARGO_PKG_VERSION"),
            "settings": {
                "timeout_secs": self.settings.timeout.as_secs_f64(),
                "grace_secs": self.settings.grace.as_secs_f64(),
                "parallelism": self.parallelism,
                "column_schema": self.settings.column_schema.as_str(),
            },
            "total_jobs": self.total_jobs,
            "completed_jobs": finished.map(|(n, _)| n),
            "outcomes": finished.map(|(_, counts)| counts),
            "started_at": self.started_at,
            "updated_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(path, &payload)
    }
}

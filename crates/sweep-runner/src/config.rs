use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::SweepError;
use crate::matrix::{discover_environments, MatrixAxes};
use crate::pool::parallelism_for;
use crate::record::ColumnSchema;
use crate::supervisor::SupervisorTimings;
use crate::workload::{WorkloadRegistry, WorkloadSpec};

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_GRACE_SECS: f64 = 1.0;
pub const DEFAULT_PARALLELISM_FRACTION: f64 = 0.5;
pub const DEFAULT_OUTPUT_DIR: &str = "results";
/// Longest accepted budget or grace period (30 days).
pub const MAX_WAIT_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepMeta {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantSpec {
    pub id: String,
    pub workload: WorkloadSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSource {
    pub dir: PathBuf,
    pub extension: String,
}

/// Harness knobs. Used both for the `harness:` block of a sweep file and for
/// command-line/environment overrides; unset fields fall through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsOverrides {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub grace_secs: Option<f64>,
    #[serde(default)]
    pub parallelism_fraction: Option<f64>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub column_schema: Option<ColumnSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    #[serde(default = "default_version")]
    pub version: String,
    pub sweep: SweepMeta,
    pub variants: Vec<VariantSpec>,
    pub own_sides: Vec<String>,
    pub opposing_sides: Vec<String>,
    pub difficulties: Vec<String>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub environments_from: Option<EnvironmentSource>,
    #[serde(default)]
    pub instrumented: bool,
    #[serde(default)]
    pub harness: SettingsOverrides,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_version() -> String {
    "1".to_string()
}

impl SweepConfig {
    /// Loads, validates and path-resolves a sweep file. Relative paths in the
    /// file are taken relative to the file's own directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading sweep file {}", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let base_dir = base_dir.canonicalize().unwrap_or(base_dir);
        Self::from_yaml(&raw, &base_dir)
    }

    pub fn from_yaml(raw: &str, base_dir: &Path) -> Result<Self> {
        let mut config: SweepConfig = serde_yaml::from_str(raw)
            .map_err(|e| SweepError::InvalidConfig(e.to_string()))?;
        config.base_dir = base_dir.to_path_buf();
        config.validate()?;
        config.resolve_paths();
        Ok(config)
    }

    /// Reports every problem at once rather than the first one found.
    pub fn validate(&self) -> Result<(), SweepError> {
        let mut problems = Vec::new();
        if self.sweep.id.trim().is_empty() {
            problems.push("/sweep/id must not be empty".to_string());
        } else if !self
            .sweep
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
        {
            problems.push("/sweep/id may only contain [A-Za-z0-9._-]".to_string());
        }
        if self.variants.is_empty() {
            problems.push("/variants must list at least one variant".to_string());
        }
        let mut seen = BTreeSet::new();
        for (idx, variant) in self.variants.iter().enumerate() {
            if variant.id.trim().is_empty() {
                problems.push(format!("/variants/{}/id must not be empty", idx));
            } else if !seen.insert(variant.id.as_str()) {
                problems.push(format!("/variants/{}/id duplicates '{}'", idx, variant.id));
            }
            match &variant.workload {
                WorkloadSpec::Command { command, .. } if command.is_empty() => {
                    problems.push(format!("/variants/{}/workload/command must not be empty", idx))
                }
                WorkloadSpec::Sleep { seconds, .. } if !seconds.is_finite() || *seconds < 0.0 => {
                    problems.push(format!(
                        "/variants/{}/workload/seconds must be a non-negative number",
                        idx
                    ))
                }
                _ => {}
            }
        }
        for (pointer, axis) in [
            ("/own_sides", &self.own_sides),
            ("/opposing_sides", &self.opposing_sides),
            ("/difficulties", &self.difficulties),
        ] {
            if axis.is_empty() {
                problems.push(format!("{} must list at least one value", pointer));
            }
        }
        if self.environments.is_empty() && self.environments_from.is_none() {
            problems.push("/environments or /environments_from is required".to_string());
        }
        problems.extend(self.harness.problems("/harness"));
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SweepError::InvalidConfig(problems.join("; ")))
        }
    }

    fn resolve_paths(&mut self) {
        let base = self.base_dir.clone();
        if let Some(source) = self.environments_from.as_mut() {
            source.dir = resolve_relative(&base, &source.dir);
        }
        if let Some(dir) = self.harness.output_dir.as_mut() {
            *dir = resolve_relative(&base, dir);
        }
        for variant in &mut self.variants {
            if let WorkloadSpec::Command { command, cwd, .. } = &mut variant.workload {
                if let Some(first) = command.first_mut() {
                    if first.starts_with("./") || first.starts_with("../") {
                        *first = normalize_path(&base.join(first.as_str()))
                            .to_string_lossy()
                            .to_string();
                    }
                }
                let dir = cwd.get_or_insert_with(|| base.clone());
                *dir = resolve_relative(&base, dir);
            }
        }
    }

    pub fn variant_ids(&self) -> Vec<String> {
        self.variants.iter().map(|v| v.id.clone()).collect()
    }

    pub fn matrix_axes(&self) -> Result<MatrixAxes> {
        let mut environments = self.environments.clone();
        if let Some(source) = &self.environments_from {
            environments.extend(discover_environments(&source.dir, &source.extension)?);
        }
        Ok(MatrixAxes {
            work_variants: self.variant_ids(),
            own_sides: self.own_sides.clone(),
            opposing_sides: self.opposing_sides.clone(),
            difficulties: self.difficulties.clone(),
            environments,
        })
    }

    /// Registry of every declared variant. Built independently by the
    /// orchestrator and by each worker process.
    pub fn registry(&self) -> WorkloadRegistry {
        let mut registry = WorkloadRegistry::new();
        for variant in &self.variants {
            registry.register_spec(variant.id.clone(), variant.workload.clone());
        }
        registry
    }

    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
    }
}

impl SettingsOverrides {
    fn problems(&self, prefix: &str) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(timeout) = self.timeout_secs {
            if timeout == 0 || timeout > MAX_WAIT_SECS {
                problems.push(format!(
                    "{}/timeout_secs must be in 1..={}",
                    prefix, MAX_WAIT_SECS
                ));
            }
        }
        if let Some(grace) = self.grace_secs {
            if !(0.0..=MAX_WAIT_SECS as f64).contains(&grace) {
                problems.push(format!(
                    "{}/grace_secs must be a number in 0..={}",
                    prefix, MAX_WAIT_SECS
                ));
            }
        }
        if let Some(fraction) = self.parallelism_fraction {
            if !(fraction > 0.0 && fraction <= 1.0) {
                problems.push(format!(
                    "{}/parallelism_fraction must be in (0, 1]",
                    prefix
                ));
            }
        }
        if self.max_parallel == Some(0) {
            problems.push(format!("{}/max_parallel must be positive", prefix));
        }
        problems
    }

    /// Layers `self` over `fallback`: any field set here wins.
    pub fn or(&self, fallback: &SettingsOverrides) -> SettingsOverrides {
        SettingsOverrides {
            timeout_secs: self.timeout_secs.or(fallback.timeout_secs),
            grace_secs: self.grace_secs.or(fallback.grace_secs),
            parallelism_fraction: self.parallelism_fraction.or(fallback.parallelism_fraction),
            max_parallel: self.max_parallel.or(fallback.max_parallel),
            output_dir: self.output_dir.clone().or_else(|| fallback.output_dir.clone()),
            column_schema: self.column_schema.or(fallback.column_schema),
        }
    }
}

/// Fully-resolved harness settings for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarnessSettings {
    pub timeout: Duration,
    pub grace: Duration,
    pub parallelism_fraction: f64,
    pub max_parallel: Option<usize>,
    pub output_dir: PathBuf,
    pub column_schema: ColumnSchema,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            grace: Duration::from_secs_f64(DEFAULT_GRACE_SECS),
            parallelism_fraction: DEFAULT_PARALLELISM_FRACTION,
            max_parallel: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            column_schema: ColumnSchema::Standard,
        }
    }
}

impl HarnessSettings {
    /// Command-line/environment overrides win over the sweep file, which wins
    /// over built-in defaults.
    pub fn resolve(
        overrides: &SettingsOverrides,
        config: &SweepConfig,
    ) -> Result<Self, SweepError> {
        let merged = overrides.or(&config.harness);
        let problems = merged.problems("harness");
        if !problems.is_empty() {
            return Err(SweepError::InvalidConfig(problems.join("; ")));
        }
        let defaults = HarnessSettings::default();
        let grace = match merged.grace_secs {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|e| SweepError::InvalidConfig(format!("harness/grace_secs: {}", e)))?,
            None => defaults.grace,
        };
        Ok(Self {
            timeout: merged
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            grace,
            parallelism_fraction: merged
                .parallelism_fraction
                .unwrap_or(defaults.parallelism_fraction),
            max_parallel: merged.max_parallel,
            output_dir: merged.output_dir.unwrap_or(defaults.output_dir),
            column_schema: merged.column_schema.unwrap_or(defaults.column_schema),
        })
    }

    pub fn parallelism(&self, available: usize) -> usize {
        self.max_parallel
            .unwrap_or_else(|| parallelism_for(self.parallelism_fraction, available))
            .max(1)
    }

    pub fn timings(&self) -> SupervisorTimings {
        SupervisorTimings {
            budget: self.timeout,
            grace: self.grace,
            kill_wait: self.grace,
            ..SupervisorTimings::default()
        }
    }
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        normalize_path(&base.join(path))
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

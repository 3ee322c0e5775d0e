use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use walkdir::WalkDir;

/// One fully-specified unit of work.
///
/// `instrumented` is the run-mode flag. It is threaded through to the workload
/// so instrumentation is decided per job rather than by process-wide state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDescriptor {
    pub work_variant: String,
    pub own_side: String,
    pub opposing_side: String,
    pub difficulty: String,
    pub environment: String,
    #[serde(default)]
    pub instrumented: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixAxes {
    pub work_variants: Vec<String>,
    pub own_sides: Vec<String>,
    pub opposing_sides: Vec<String>,
    pub difficulties: Vec<String>,
    pub environments: Vec<String>,
}

impl MatrixAxes {
    pub fn job_count(&self) -> usize {
        self.work_variants.len()
            * self.own_sides.len()
            * self.opposing_sides.len()
            * self.difficulties.len()
            * self.environments.len()
    }
}

/// Expands the axes into their full cartesian product.
///
/// Nesting is work variant outermost, then own side, opposing side,
/// difficulty, and environment innermost. Any empty axis yields no jobs.
pub fn build_matrix(axes: &MatrixAxes, instrumented: bool) -> Vec<JobDescriptor> {
    let mut jobs = Vec::with_capacity(axes.job_count());
    for variant in &axes.work_variants {
        for own in &axes.own_sides {
            for opposing in &axes.opposing_sides {
                for difficulty in &axes.difficulties {
                    for environment in &axes.environments {
                        jobs.push(JobDescriptor {
                            work_variant: variant.clone(),
                            own_side: own.clone(),
                            opposing_side: opposing.clone(),
                            difficulty: difficulty.clone(),
                            environment: environment.clone(),
                            instrumented,
                        });
                    }
                }
            }
        }
    }
    jobs
}

/// Lists environment names (file stems) for every file in `dir` whose
/// extension matches `extension`, sorted by name.
pub fn discover_environments(dir: &Path, extension: &str) -> Result<Vec<String>> {
    let wanted = extension.trim_start_matches('.');
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(wanted))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::error::SweepError;
use crate::matrix::JobDescriptor;

/// The blocking unit of work behind a work variant. Returns the domain
/// outcome label, or an error that the worker turns into `ERROR`.
pub trait Workload {
    fn run(&mut self, job: &JobDescriptor) -> Result<String>;
}

/// Declarative definition of a workload, as written in the sweep file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadSpec {
    /// Runs an external engine. Job fields are exported as `SWEEP_*`
    /// variables; the last non-empty stdout line is the outcome.
    Command {
        command: Vec<String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Fixed {
        outcome: String,
    },
    Sleep {
        seconds: f64,
        outcome: String,
    },
    Fail {
        #[serde(default = "default_fail_message")]
        message: String,
    },
    Panic {
        #[serde(default = "default_fail_message")]
        message: String,
    },
    Hang,
}

fn default_fail_message() -> String {
    "workload failed".to_string()
}

impl WorkloadSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkloadSpec::Command { .. } => "command",
            WorkloadSpec::Fixed { .. } => "fixed",
            WorkloadSpec::Sleep { .. } => "sleep",
            WorkloadSpec::Fail { .. } => "fail",
            WorkloadSpec::Panic { .. } => "panic",
            WorkloadSpec::Hang => "hang",
        }
    }

    pub fn instantiate(&self) -> Box<dyn Workload> {
        match self.clone() {
            WorkloadSpec::Command { command, cwd, env } => {
                Box::new(CommandWorkload { command, cwd, env })
            }
            WorkloadSpec::Fixed { outcome } => Box::new(FixedWorkload {
                outcome,
                delay: Duration::ZERO,
            }),
            WorkloadSpec::Sleep { seconds, outcome } => Box::new(FixedWorkload {
                outcome,
                delay: Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX),
            }),
            WorkloadSpec::Fail { message } => Box::new(FailingWorkload { message }),
            WorkloadSpec::Panic { message } => Box::new(PanickingWorkload { message }),
            WorkloadSpec::Hang => Box::new(HangingWorkload),
        }
    }
}

type Constructor = Box<dyn Fn() -> Box<dyn Workload> + Send + Sync>;

/// Maps stable variant keys to workload constructors.
///
/// Only keys cross the process boundary; each worker process builds its own
/// registry and resolves the key locally.
#[derive(Default)]
pub struct WorkloadRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn Workload> + Send + Sync + 'static,
    {
        self.constructors.insert(key.into(), Box::new(constructor));
    }

    pub fn register_spec(&mut self, key: impl Into<String>, spec: WorkloadSpec) {
        self.register(key, move || spec.instantiate());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(|k| k.as_str())
    }

    pub fn resolve(&self, key: &str) -> Result<Box<dyn Workload>, SweepError> {
        self.constructors
            .get(key)
            .map(|ctor| ctor())
            .ok_or_else(|| SweepError::UnknownVariant(key.to_string()))
    }
}

struct CommandWorkload {
    command: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl Workload for CommandWorkload {
    fn run(&mut self, job: &JobDescriptor) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("command workload has an empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.env);
        cmd.env("SWEEP_WORK_VARIANT", &job.work_variant);
        cmd.env("SWEEP_OWN_SIDE", &job.own_side);
        cmd.env("SWEEP_OPPOSING_SIDE", &job.opposing_side);
        cmd.env("SWEEP_DIFFICULTY", &job.difficulty);
        cmd.env("SWEEP_ENVIRONMENT", &job.environment);
        cmd.env("SWEEP_INSTRUMENTED", if job.instrumented { "1" } else { "0" });
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let output = cmd
            .output()
            .with_context(|| format!("spawning engine `{}`", program))?;
        if !output.status.success() {
            return Err(anyhow!(
                "engine `{}` exited with {}",
                program,
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| l.to_string())
            .ok_or_else(|| anyhow!("engine `{}` printed no outcome", program))
    }
}

struct FixedWorkload {
    outcome: String,
    delay: Duration,
}

impl Workload for FixedWorkload {
    fn run(&mut self, _job: &JobDescriptor) -> Result<String> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(self.outcome.clone())
    }
}

struct FailingWorkload {
    message: String,
}

impl Workload for FailingWorkload {
    fn run(&mut self, _job: &JobDescriptor) -> Result<String> {
        Err(anyhow!("{}", self.message))
    }
}

struct PanickingWorkload {
    message: String,
}

impl Workload for PanickingWorkload {
    fn run(&mut self, _job: &JobDescriptor) -> Result<String> {
        panic!("{}", self.message);
    }
}

struct HangingWorkload;

impl Workload for HangingWorkload {
    fn run(&mut self, _job: &JobDescriptor) -> Result<String> {
        loop {
            thread::sleep(Duration::from_secs(3600));
        }
    }
}

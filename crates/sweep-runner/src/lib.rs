//! Supervised batch execution of a job matrix.
//!
//! Every job runs in its own worker process under a [`TimeoutSupervisor`],
//! a [`SupervisorPool`] bounds how many run at once, and a
//! [`ResultAggregator`] persists one CSV row per attempted job however the
//! run ends.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod matrix;
pub mod pool;
pub mod record;
pub mod runner;
pub mod supervisor;
pub mod worker;
pub mod workload;

pub use aggregator::{PersistGuard, ResultAggregator, ResultTable};
pub use config::{HarnessSettings, SettingsOverrides, SweepConfig};
pub use error::SweepError;
pub use matrix::{build_matrix, discover_environments, JobDescriptor, MatrixAxes};
pub use pool::{available_cores, parallelism_for, DispatchStats, SupervisorPool};
pub use record::{ColumnSchema, Outcome, ResultRecord};
pub use runner::{describe_sweep, run_sweep, RunResult, SweepSummary};
pub use supervisor::{
    ProcessLauncher, Supervision, SupervisorState, SupervisorTimings, TimeoutSupervisor,
    WorkerLauncher,
};
pub use worker::{emit_result, execute_job, serve_one};
pub use workload::{Workload, WorkloadRegistry, WorkloadSpec};

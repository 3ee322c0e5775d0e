use anyhow::Result;
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

use crate::error::SweepError;
use crate::matrix::JobDescriptor;
use crate::record::{Outcome, ResultRecord};
use crate::workload::WorkloadRegistry;

/// Runs one job to completion inside the current (worker) process.
///
/// Never fails: resolution errors, returned errors and panics all become an
/// `ERROR` record whose descriptor fields come from `job`.
pub fn execute_job(job: &JobDescriptor, registry: &WorkloadRegistry) -> ResultRecord {
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| -> Result<String> {
        let mut workload = registry.resolve(&job.work_variant)?;
        workload.run(job)
    }));
    let outcome = match attempt {
        Ok(Ok(label)) => Outcome::from(label),
        Ok(Err(err)) => {
            warn!(work_variant = %job.work_variant, error = %format!("{:#}", err), "job failed");
            Outcome::Error
        }
        Err(payload) => {
            warn!(
                work_variant = %job.work_variant,
                panic = %panic_message(payload.as_ref()),
                "job panicked"
            );
            Outcome::Error
        }
    };
    ResultRecord::for_job(job, outcome)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Writes the record as a single JSON line and flushes. Best effort: the
/// caller is about to exit either way.
pub fn emit_result<W: Write>(record: &ResultRecord, out: &mut W) -> Result<()> {
    let line = serde_json::to_string(record)?;
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

/// Reads one job from `input`, executes it, and writes its record to `output`.
///
/// A job that cannot be decoded has no descriptor to report against, so no
/// record is written and the supervisor classifies the run as `NO_RESULT`.
pub fn serve_one<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    registry: &WorkloadRegistry,
) -> Result<ResultRecord> {
    let mut raw = String::new();
    input.read_to_string(&mut raw)?;
    let job: JobDescriptor = serde_json::from_str(raw.trim())
        .map_err(|e| SweepError::Protocol(format!("undecodable job: {}", e)))?;
    debug!(?job, "worker received job");
    let record = execute_job(&job, registry);
    if let Err(err) = emit_result(&record, output) {
        warn!(error = %err, "failed to deliver result");
    }
    Ok(record)
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

use crate::matrix::JobDescriptor;
use crate::record::ResultRecord;
use crate::supervisor::{TimeoutSupervisor, WorkerLauncher};

/// `fraction` of `available` processing units, never less than one.
pub fn parallelism_for(fraction: f64, available: usize) -> usize {
    let available = available.max(1);
    let scaled = (available as f64 * fraction).floor();
    if scaled.is_nan() || scaled < 1.0 {
        1
    } else {
        (scaled as usize).min(available)
    }
}

pub fn available_cores() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub interrupted: bool,
}

/// Runs one supervisor per job with at most `parallelism` jobs live at once.
pub struct SupervisorPool<L> {
    supervisor: TimeoutSupervisor<L>,
    parallelism: usize,
}

impl<L: WorkerLauncher> SupervisorPool<L> {
    pub fn new(supervisor: TimeoutSupervisor<L>, parallelism: usize) -> Self {
        Self {
            supervisor,
            parallelism: parallelism.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn supervisor(&self) -> &TimeoutSupervisor<L> {
        &self.supervisor
    }

    /// Attempts every job once and hands each record to `on_result` on the
    /// calling thread, in completion order.
    ///
    /// Once `interrupt` is set no further job is started; jobs already
    /// running still finish (bounded by their own budget) and are reported.
    pub fn dispatch<F>(
        &self,
        jobs: Vec<JobDescriptor>,
        interrupt: &AtomicBool,
        mut on_result: F,
    ) -> DispatchStats
    where
        F: FnMut(ResultRecord),
    {
        let submitted = jobs.len();
        let queue = Mutex::new(jobs.into_iter().collect::<VecDeque<_>>());
        let dispatched = AtomicUsize::new(0);
        let mut completed = 0usize;
        let lanes = self.parallelism.min(submitted);

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<ResultRecord>();
            let mut started_lanes = 0usize;
            for lane in 0..lanes {
                let tx = tx.clone();
                let queue = &queue;
                let dispatched = &dispatched;
                let spawned = thread::Builder::new()
                    .name(format!("sweep-supervisor-{}", lane))
                    .spawn_scoped(scope, move || {
                        while let Some(job) = self.next_job(queue, interrupt, dispatched) {
                            debug!(lane, work_variant = %job.work_variant, environment = %job.environment, "dispatching job");
                            if tx.send(self.supervisor.run(&job)).is_err() {
                                break;
                            }
                        }
                    });
                match spawned {
                    Ok(_) => started_lanes += 1,
                    Err(err) => warn!(lane, error = %err, "failed to start supervisor lane"),
                }
            }
            drop(tx);
            if lanes > 0 && started_lanes == 0 {
                warn!("no supervisor lane could be started; running jobs on the calling thread");
                completed += self.run_inline(&queue, interrupt, &dispatched, &mut on_result);
            }
            for record in rx {
                completed += 1;
                on_result(record);
            }
        });

        let interrupted = interrupt.load(Ordering::SeqCst);
        let dispatched = dispatched.load(Ordering::SeqCst);
        if interrupted {
            info!(
                dispatched,
                skipped = submitted - dispatched,
                "dispatch interrupted; remaining jobs were not started"
            );
        }
        DispatchStats {
            submitted,
            dispatched,
            completed,
            interrupted,
        }
    }

    fn run_inline<F>(
        &self,
        queue: &Mutex<VecDeque<JobDescriptor>>,
        interrupt: &AtomicBool,
        dispatched: &AtomicUsize,
        on_result: &mut F,
    ) -> usize
    where
        F: FnMut(ResultRecord),
    {
        let mut completed = 0;
        while let Some(job) = self.next_job(queue, interrupt, dispatched) {
            on_result(self.supervisor.run(&job));
            completed += 1;
        }
        completed
    }

    /// Pops the next job unless an interrupt has been requested.
    fn next_job(
        &self,
        queue: &Mutex<VecDeque<JobDescriptor>>,
        interrupt: &AtomicBool,
        dispatched: &AtomicUsize,
    ) -> Option<JobDescriptor> {
        if interrupt.load(Ordering::SeqCst) {
            return None;
        }
        let job = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()?;
        dispatched.fetch_add(1, Ordering::SeqCst);
        Some(job)
    }
}

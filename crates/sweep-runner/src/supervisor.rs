use anyhow::{anyhow, Context, Result};
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::matrix::JobDescriptor;
use crate::record::{Outcome, ResultRecord};

/// Builds the command that starts one isolated worker process.
///
/// The supervisor owns stdio: the job is written to the worker's stdin as
/// JSON and the last non-empty stdout line is read back as its result.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, job: &JobDescriptor) -> Command;
}

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn command(&self, _job: &JobDescriptor) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTimings {
    /// Wall-clock budget for the job.
    pub budget: Duration,
    /// Time allowed between the termination request and the forced kill.
    pub grace: Duration,
    /// Time allowed for the forced kill to be observed.
    pub kill_wait: Duration,
    /// Secondary timeout for reading the result after the worker exits.
    pub result_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(300),
            grace: Duration::from_secs(1),
            kill_wait: Duration::from_secs(1),
            result_wait: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl SupervisorTimings {
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    /// Upper bound on how long one supervised job can block its caller:
    /// the budget, then either the escalation waits or the result wait.
    pub fn worst_case(&self) -> Duration {
        let escalation = self.grace.saturating_add(self.kill_wait);
        self.budget
            .saturating_add(escalation.max(self.result_wait))
            .saturating_add(self.poll_interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    Completed,
    TermSent,
    GraceWait,
    Dead,
    Killed,
}

#[derive(Debug, Clone)]
pub struct Supervision {
    pub record: ResultRecord,
    /// Every state visited, in order. Empty when the supervisor itself failed
    /// before the worker was started.
    pub trail: Vec<SupervisorState>,
    pub elapsed: Duration,
    pub exit_status: Option<ExitStatus>,
    pub diagnostic: Option<String>,
}

impl Supervision {
    pub fn terminal_state(&self) -> Option<SupervisorState> {
        self.trail.last().copied()
    }
}

/// Owns the lifecycle of one job's worker process.
///
/// Holds no per-job state, so one instance can supervise many jobs from
/// many threads at once.
pub struct TimeoutSupervisor<L> {
    launcher: L,
    timings: SupervisorTimings,
}

impl<L: WorkerLauncher> TimeoutSupervisor<L> {
    pub fn new(launcher: L, timings: SupervisorTimings) -> Self {
        Self { launcher, timings }
    }

    pub fn timings(&self) -> &SupervisorTimings {
        &self.timings
    }

    pub fn run(&self, job: &JobDescriptor) -> ResultRecord {
        self.run_traced(job).record
    }

    pub fn run_traced(&self, job: &JobDescriptor) -> Supervision {
        let started = Instant::now();
        match self.supervise(job, started) {
            Ok(supervision) => supervision,
            Err(err) => {
                let detail = format!("{:#}", err).replace(['\n', '\r'], " ");
                warn!(work_variant = %job.work_variant, environment = %job.environment, error = %detail, "supervisor failed");
                Supervision {
                    record: ResultRecord::for_job(job, Outcome::Exception(detail.clone())),
                    trail: Vec::new(),
                    elapsed: started.elapsed(),
                    exit_status: None,
                    diagnostic: Some(detail),
                }
            }
        }
    }

    fn supervise(&self, job: &JobDescriptor, started: Instant) -> Result<Supervision> {
        let payload = serde_json::to_vec(job)?;
        let mut ctx = ExecutionContext::spawn(self.launcher.command(job), payload)?;
        // None: the budget is too large to represent and never expires.
        let deadline = started.checked_add(self.timings.budget);

        let mut state = SupervisorState::Running;
        let mut trail = vec![state];
        let mut diagnostic = None;

        let outcome = loop {
            let next = match state {
                SupervisorState::Running => {
                    if ctx.wait_until(deadline, self.timings.poll_interval)? {
                        SupervisorState::Completed
                    } else {
                        ctx.terminate();
                        SupervisorState::TermSent
                    }
                }
                SupervisorState::Completed => {
                    // Leftover group members may still hold stdout open.
                    ctx.kill();
                    break self.collect(&ctx, job, &mut diagnostic);
                }
                SupervisorState::TermSent => SupervisorState::GraceWait,
                SupervisorState::GraceWait => {
                    let until = Instant::now().checked_add(self.timings.grace);
                    if ctx.wait_until(until, self.timings.poll_interval)? {
                        SupervisorState::Dead
                    } else {
                        ctx.kill();
                        SupervisorState::Killed
                    }
                }
                SupervisorState::Dead => break Outcome::Timeout,
                SupervisorState::Killed => {
                    let until = Instant::now().checked_add(self.timings.kill_wait);
                    if !matches!(ctx.wait_until(until, self.timings.poll_interval), Ok(true)) {
                        diagnostic = Some("worker did not confirm exit after kill".to_string());
                    }
                    break Outcome::Timeout;
                }
            };
            debug!(from = ?state, to = ?next, work_variant = %job.work_variant, "supervisor transition");
            state = next;
            trail.push(state);
        };
        let exit_status = ctx.finish();

        if outcome == Outcome::Timeout {
            warn!(
                work_variant = %job.work_variant,
                opposing_side = %job.opposing_side,
                environment = %job.environment,
                budget_secs = self.timings.budget.as_secs_f64(),
                terminal = ?state,
                "job exceeded its budget"
            );
        }

        Ok(Supervision {
            record: ResultRecord::for_job(job, outcome),
            trail,
            elapsed: started.elapsed(),
            exit_status,
            diagnostic,
        })
    }

    fn collect(
        &self,
        ctx: &ExecutionContext,
        job: &JobDescriptor,
        diagnostic: &mut Option<String>,
    ) -> Outcome {
        let payload = match ctx.results.recv_timeout(self.timings.result_wait) {
            Ok(payload) => payload,
            Err(_) => return Outcome::NoResult,
        };
        match serde_json::from_str::<ResultRecord>(&payload) {
            Ok(record) if record.describes(job) => record.outcome,
            Ok(_) | Err(_) => {
                warn!(work_variant = %job.work_variant, payload = %payload, "worker delivered a malformed result");
                *diagnostic = Some(payload);
                Outcome::BadResult
            }
        }
    }
}

/// One worker process, its process group, and its one-shot result channel.
///
/// On unix the worker's exit is observed without reaping it, so its pid (and
/// with it the group id) stays reserved until [`ExecutionContext::finish`]
/// has killed whatever is left of the group. Dropping an unfinished context
/// kills the group as well.
struct ExecutionContext {
    child: Child,
    results: Receiver<String>,
    status: Option<ExitStatus>,
    reaped: bool,
}

impl ExecutionContext {
    fn spawn(mut cmd: Command, payload: Vec<u8>) -> Result<Self> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let child = cmd.spawn().context("spawning worker process")?;
        let mut ctx = Self {
            child,
            results: rx,
            status: None,
            reaped: false,
        };

        if let Some(mut stdin) = ctx.child.stdin.take() {
            thread::Builder::new()
                .name("sweep-job-writer".to_string())
                .spawn(move || {
                    let _ = stdin.write_all(&payload);
                })
                .context("spawning job writer")?;
        }
        let stdout = ctx
            .child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout was not captured"))?;
        thread::Builder::new()
            .name("sweep-result-reader".to_string())
            .spawn(move || forward_last_line(stdout, tx))
            .context("spawning result reader")?;
        Ok(ctx)
    }

    /// Polls until the worker has exited (`true`) or `until` passes
    /// (`false`). `None` never passes.
    fn wait_until(&mut self, until: Option<Instant>, poll: Duration) -> Result<bool> {
        loop {
            if self.has_exited()? {
                return Ok(true);
            }
            let now = Instant::now();
            let nap = match until {
                Some(until) if now >= until => return Ok(false),
                Some(until) => poll.min(until - now),
                None => poll,
            };
            thread::sleep(nap);
        }
    }

    #[cfg(unix)]
    fn has_exited(&mut self) -> Result<bool> {
        if self.reaped {
            return Ok(true);
        }
        // SAFETY: an all-zero siginfo_t is a valid out-parameter for waitid(2).
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` outlives the call; WNOWAIT leaves the child unreaped.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                self.child.id() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err).context("polling worker");
        }
        // si_signo stays zero when no state change was pending.
        Ok(info.si_signo != 0)
    }

    #[cfg(not(unix))]
    fn has_exited(&mut self) -> Result<bool> {
        if !self.reaped {
            if let Some(status) = self.child.try_wait().context("polling worker")? {
                self.status = Some(status);
                self.reaped = true;
            }
        }
        Ok(self.reaped)
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGTERM);
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        if self.reaped {
            return;
        }
        // The worker leads its own group, so the group id is its pid. ESRCH
        // only means every member is already gone.
        let pgid = self.child.id() as libc::pid_t;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let _ = unsafe { libc::kill(-pgid, signal) };
    }

    /// Kills every remaining group member, then reaps the worker if it has
    /// exited. Never blocks.
    fn finish(&mut self) -> Option<ExitStatus> {
        self.kill();
        if !self.reaped {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.status = Some(status);
                self.reaped = true;
            }
        }
        self.status
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if !self.reaped {
            self.finish();
        }
    }
}

fn forward_last_line(stdout: ChildStdout, tx: SyncSender<String>) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    let mut last = None;
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    last = Some(trimmed.to_string());
                }
            }
        }
    }
    if let Some(payload) = last {
        let _ = tx.try_send(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    fn job() -> JobDescriptor {
        JobDescriptor {
            work_variant: "warpgate_push".to_string(),
            own_side: "protoss".to_string(),
            opposing_side: "terran".to_string(),
            difficulty: "medium".to_string(),
            environment: "Abyssal".to_string(),
            instrumented: false,
        }
    }

    fn sh(script: &str) -> ProcessLauncher {
        ProcessLauncher::new("sh").arg("-c").arg(script)
    }

    fn record_line(job: &JobDescriptor, outcome: &str) -> String {
        serde_json::to_string(&ResultRecord::for_job(job, Outcome::from(outcome.to_string())))
            .expect("encode")
    }

    fn fast_timings(budget_ms: u64) -> SupervisorTimings {
        SupervisorTimings {
            budget: Duration::from_millis(budget_ms),
            grace: Duration::from_millis(300),
            kill_wait: Duration::from_millis(300),
            result_wait: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sweep_supervisor_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[cfg(unix)]
    fn process_alive(pid: i32) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    /// Gone means no such process, or a zombie waiting for its new parent.
    #[cfg(unix)]
    fn process_gone(pid: i32) -> bool {
        if cfg!(target_os = "linux") {
            match fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Err(_) => true,
                Ok(stat) => stat
                    .rsplit(')')
                    .next()
                    .and_then(|rest| rest.trim_start().chars().next())
                    .map(|state| state == 'Z' || state == 'X')
                    .unwrap_or(false),
            }
        } else {
            !process_alive(pid)
        }
    }

    #[cfg(unix)]
    fn wait_gone(pid: i32, within: Duration) -> bool {
        let until = Instant::now() + within;
        while Instant::now() < until {
            if process_gone(pid) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        process_gone(pid)
    }

    fn read_pid(path: &std::path::Path) -> i32 {
        let until = Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(text) = fs::read_to_string(path) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            assert!(Instant::now() < until, "no pid written to {}", path.display());
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn completed_worker_outcome_passes_through() {
        let script = format!("cat >/dev/null; echo progress; echo '{}'", record_line(&job(), "Victory"));
        let supervisor = TimeoutSupervisor::new(sh(&script), fast_timings(5_000));
        let supervision = supervisor.run_traced(&job());
        assert_eq!(supervision.record.outcome, Outcome::Domain("Victory".to_string()));
        assert_eq!(
            supervision.trail,
            vec![SupervisorState::Running, SupervisorState::Completed]
        );
        assert!(supervision.record.describes(&job()));
    }

    #[test]
    fn worker_receives_job_on_stdin() {
        let dir = temp_dir("stdin");
        let seen = dir.join("job.json");
        let script = format!("cat > '{}'; echo '{}'", seen.display(), record_line(&job(), "Tie"));
        let supervisor = TimeoutSupervisor::new(sh(&script), fast_timings(5_000));
        assert_eq!(supervisor.run(&job()).outcome, Outcome::Domain("Tie".to_string()));
        let received: JobDescriptor =
            serde_json::from_slice(&fs::read(&seen).expect("read")).expect("decode");
        assert_eq!(received, job());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn exit_without_result_is_no_result() {
        let supervisor = TimeoutSupervisor::new(sh("exit 0"), fast_timings(5_000));
        let supervision = supervisor.run_traced(&job());
        assert_eq!(supervision.record.outcome, Outcome::NoResult);
        assert_eq!(supervision.terminal_state(), Some(SupervisorState::Completed));
    }

    #[test]
    fn crashing_worker_is_no_result() {
        let supervisor = TimeoutSupervisor::new(sh("kill -9 $$"), fast_timings(5_000));
        assert_eq!(supervisor.run(&job()).outcome, Outcome::NoResult);
    }

    #[test]
    fn malformed_payload_is_bad_result_with_diagnostic() {
        let supervisor = TimeoutSupervisor::new(sh("echo '{\"outcome\":1}'"), fast_timings(5_000));
        let supervision = supervisor.run_traced(&job());
        assert_eq!(supervision.record.outcome, Outcome::BadResult);
        assert_eq!(supervision.diagnostic.as_deref(), Some("{\"outcome\":1}"));
        assert!(supervision.record.describes(&job()));
    }

    #[test]
    fn record_for_another_job_is_bad_result() {
        let mut other = job();
        other.environment = "Persephone".to_string();
        let script = format!("echo '{}'", record_line(&other, "Victory"));
        let supervisor = TimeoutSupervisor::new(sh(&script), fast_timings(5_000));
        let record = supervisor.run(&job());
        assert_eq!(record.outcome, Outcome::BadResult);
        assert_eq!(record.environment, "Abyssal");
    }

    #[test]
    fn hung_worker_that_honors_term_times_out_as_dead() {
        let timings = fast_timings(200);
        let supervisor = TimeoutSupervisor::new(sh("exec sleep 30"), timings);
        let started = Instant::now();
        let supervision = supervisor.run_traced(&job());
        let elapsed = started.elapsed();
        assert_eq!(supervision.record.outcome, Outcome::Timeout);
        assert_eq!(
            supervision.trail,
            vec![
                SupervisorState::Running,
                SupervisorState::TermSent,
                SupervisorState::GraceWait,
                SupervisorState::Dead,
            ]
        );
        assert!(
            elapsed < timings.budget + timings.grace * 2 + Duration::from_millis(500),
            "took {:?}",
            elapsed
        );
    }

    #[cfg(unix)]
    #[test]
    fn worker_ignoring_term_is_killed_and_gone() {
        let dir = temp_dir("stubborn");
        let pid_file = dir.join("pid");
        let script = format!(
            "trap '' TERM; echo $$ > '{}'; while :; do sleep 0.05; done",
            pid_file.display()
        );
        let timings = fast_timings(300);
        let supervisor = TimeoutSupervisor::new(sh(&script), timings);
        let started = Instant::now();
        let supervision = supervisor.run_traced(&job());
        let elapsed = started.elapsed();

        assert_eq!(supervision.record.outcome, Outcome::Timeout);
        assert_eq!(supervision.terminal_state(), Some(SupervisorState::Killed));
        assert!(
            elapsed < timings.budget + timings.grace * 2 + Duration::from_millis(500),
            "took {:?}",
            elapsed
        );
        let pid: i32 = fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        assert!(!process_alive(pid), "worker {} still running", pid);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn late_exit_during_grace_is_still_timeout() {
        let dir = temp_dir("late");
        let record = dir.join("record.json");
        fs::write(&record, record_line(&job(), "Victory")).expect("write record");
        let script = format!(
            "trap 'cat \"{}\"; exit 0' TERM; while :; do sleep 0.02; done",
            record.display()
        );
        let supervisor = TimeoutSupervisor::new(sh(&script), fast_timings(200));
        let supervision = supervisor.run_traced(&job());
        assert_eq!(supervision.record.outcome, Outcome::Timeout);
        assert_eq!(supervision.terminal_state(), Some(SupervisorState::Dead));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn group_members_ignoring_term_are_killed_after_worker_dies() {
        let dir = temp_dir("group");
        let pid_file = dir.join("straggler");
        let script = format!(
            "(trap '' TERM; exec sleep 30) & echo $! > '{}'; wait",
            pid_file.display()
        );
        let supervisor = TimeoutSupervisor::new(sh(&script), fast_timings(300));
        let supervision = supervisor.run_traced(&job());

        assert_eq!(supervision.record.outcome, Outcome::Timeout);
        assert_eq!(supervision.terminal_state(), Some(SupervisorState::Dead));
        let straggler = read_pid(&pid_file);
        assert!(
            wait_gone(straggler, Duration::from_secs(2)),
            "group member {} outlived its worker",
            straggler
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn result_is_read_even_when_a_background_child_holds_stdout() {
        let dir = temp_dir("background");
        let pid_file = dir.join("background");
        let script = format!(
            "echo '{}'; sleep 3 & echo $! > '{}'; exit 0",
            record_line(&job(), "Victory"),
            pid_file.display()
        );
        let supervisor = TimeoutSupervisor::new(sh(&script), fast_timings(5_000));
        let started = Instant::now();
        let supervision = supervisor.run_traced(&job());

        assert_eq!(supervision.record.outcome, Outcome::Domain("Victory".to_string()));
        assert_eq!(
            supervision.trail,
            vec![SupervisorState::Running, SupervisorState::Completed]
        );
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        let background = read_pid(&pid_file);
        assert!(wait_gone(background, Duration::from_secs(2)));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn worker_that_never_reads_stdin_cannot_stall_supervision() {
        let mut big = job();
        big.environment = "x".repeat(4 * 1024 * 1024);
        let timings = fast_timings(200);
        let supervisor = TimeoutSupervisor::new(sh("exec sleep 30"), timings);
        let started = Instant::now();
        let record = supervisor.run(&big);
        assert_eq!(record.outcome, Outcome::Timeout);
        assert!(started.elapsed() < timings.worst_case() + Duration::from_millis(500));
    }

    #[test]
    fn unrepresentable_budget_means_no_deadline() {
        let script = format!("echo '{}'", record_line(&job(), "Victory"));
        let timings = SupervisorTimings {
            budget: Duration::from_secs(u64::MAX),
            ..fast_timings(0)
        };
        let supervisor = TimeoutSupervisor::new(sh(&script), timings);
        assert_eq!(supervisor.run(&job()).outcome, Outcome::Domain("Victory".to_string()));
        assert_eq!(timings.worst_case(), Duration::MAX);
    }

    #[test]
    fn spawn_failure_is_exception() {
        let launcher = ProcessLauncher::new("/nonexistent/sweep-worker");
        let supervisor = TimeoutSupervisor::new(launcher, fast_timings(1_000));
        let supervision = supervisor.run_traced(&job());
        match &supervision.record.outcome {
            Outcome::Exception(detail) => {
                assert!(detail.contains("spawning worker process"), "{}", detail)
            }
            other => panic!("expected exception, got {:?}", other),
        }
        assert!(supervision.trail.is_empty());
        assert!(supervision.record.describes(&job()));
    }

    #[test]
    fn worst_case_covers_every_wait() {
        let timings = SupervisorTimings::with_budget(Duration::from_secs(2));
        assert_eq!(timings.grace, Duration::from_secs(1));
        assert!(timings.worst_case() >= timings.budget + timings.grace + timings.kill_wait);
    }
}

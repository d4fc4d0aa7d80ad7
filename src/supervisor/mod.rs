//! Runs the external agent process under a hard wall-clock deadline.
//!
//! [`ExecutionSupervisor::run`] always returns an [`ExecutionResult`]: a
//! missing binary, a crash and a deadline kill all end up as
//! `success: false` with whatever output was produced before the end.

mod stream;

pub use stream::{ExecutionEvent, OutputAccumulator};

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::state_machine::ExecutionResult;

/// How long to wait for the stderr reader once the process is gone.
const STDERR_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: String,
    /// `{prompt}` and `{tools}` are substituted in every argument.
    pub args: Vec<String>,
    pub allowed_tools: Vec<String>,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
}

impl From<&WorkerConfig> for SupervisorConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            allowed_tools: config.allowed_tools.clone(),
            grace_period: Duration::from_secs(config.grace_period_secs),
        }
    }
}

pub struct ExecutionSupervisor {
    config: SupervisorConfig,
}

/// The prompt handed to the agent: the budget, where to put artifacts, then
/// the task itself.
pub fn build_prompt(task: &str, budget_minutes: f64) -> String {
    format!(
        "You have a maximum of {budget} minutes to complete this task. If you cannot finish, \
         provide what you have accomplished so far.\n\n\
         IMPORTANT: Save all generated files and artifacts in the current working directory.\n\n\
         TASK:\n{task}\n\nPlease proceed with the task now.",
        budget = format_minutes(budget_minutes),
    )
}

fn format_minutes(minutes: f64) -> String {
    if minutes.fract() == 0.0 {
        format!("{minutes:.0}")
    } else {
        format!("{minutes:.2}")
    }
}

/// The budget and the instant it runs out, or `None` for a negative,
/// non-finite or unrepresentable budget.
fn deadline_after(budget_minutes: f64) -> Option<(Duration, Instant)> {
    if budget_minutes.is_nan() || budget_minutes < 0.0 {
        return None;
    }
    let budget = Duration::try_from_secs_f64(budget_minutes * 60.0).ok()?;
    Some((budget, Instant::now().checked_add(budget)?))
}

impl ExecutionSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    fn command_args(&self, prompt: &str) -> Vec<String> {
        let tools = self.config.allowed_tools.join(",");
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{prompt}", prompt).replace("{tools}", &tools))
            .collect()
    }

    pub async fn run(&self, task: &str, budget_minutes: f64, work_dir: &Path) -> ExecutionResult {
        self.run_with_events(task, budget_minutes, work_dir, |_| {}).await
    }

    /// Like [`run`](Self::run), calling `on_event` for every record the
    /// agent emits.
    pub async fn run_with_events<F>(
        &self,
        task: &str,
        budget_minutes: f64,
        work_dir: &Path,
        mut on_event: F,
    ) -> ExecutionResult
    where
        F: FnMut(&ExecutionEvent) + Send,
    {
        let Some((budget, deadline)) = deadline_after(budget_minutes) else {
            warn!(budget_minutes, "unusable time budget");
            return ExecutionResult::not_started(format!(
                "invalid time budget: {budget_minutes} minutes"
            ));
        };
        let prompt = build_prompt(task, budget_minutes);

        let mut command = Command::new(&self.config.program);
        command
            .args(self.command_args(&prompt))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.config.program, error = %e, "agent failed to start");
                return ExecutionResult::not_started(format!(
                    "failed to start {}: {e}",
                    self.config.program
                ));
            }
        };
        let pgid = child.id();
        info!(pid = pgid, budget_secs = budget.as_secs_f64(), dir = %work_dir.display(), "agent started");

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Err(e) = stderr.read_to_end(&mut buf).await {
                    debug!(error = %e, "stderr read ended early");
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let mut acc = OutputAccumulator::default();
        let mut timed_out = false;

        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                tokio::select! {
                    read = reader.read_until(b'\n', &mut line) => match read {
                        Ok(0) => break,
                        Ok(_) => {
                            for event in acc.ingest(&String::from_utf8_lossy(&line)) {
                                log_event(&event);
                                on_event(&event);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "reading agent output failed");
                            break;
                        }
                    },
                    _ = sleep_until(deadline) => {
                        timed_out = true;
                        break;
                    }
                }
            }
        }

        let status = if timed_out {
            None
        } else {
            match timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    warn!(error = %e, "waiting for agent failed");
                    None
                }
                Err(_) => {
                    timed_out = true;
                    None
                }
            }
        };

        let status = match status {
            Some(status) => Some(status),
            None => {
                if timed_out {
                    info!(budget_secs = budget.as_secs_f64(), "time budget exhausted, terminating agent");
                }
                terminate(&mut child, pgid, self.config.grace_period).await
            }
        };
        // Sweep up helpers the agent left running in its group.
        signal_group(pgid, Signal::Kill);

        let stderr = match stderr_task {
            Some(task) => match timeout(STDERR_DRAIN, task).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            },
            None => String::new(),
        };

        let success = !timed_out && status.is_some_and(|s| s.success());
        info!(success, timed_out, code = status.and_then(|s| s.code()), "agent finished");

        ExecutionResult {
            success,
            output: acc.into_output(),
            error: (!stderr.trim().is_empty()).then_some(stderr),
        }
    }
}

fn log_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::Started { session_id, model } => {
            info!(session = session_id.as_deref().unwrap_or("-"), model = model.as_deref().unwrap_or("-"), "agent session started");
        }
        ExecutionEvent::ToolUse(tool) => debug!(tool = %tool, "tool invoked"),
        ExecutionEvent::Text(text) => debug!(chars = text.len(), "text received"),
        ExecutionEvent::Thinking(_) => debug!("thinking"),
        ExecutionEvent::Finished {
            cost_usd,
            duration_ms,
        } => info!(cost_usd, duration_ms, "agent reported result"),
        ExecutionEvent::Log(line) => debug!(line = %line, "agent output"),
    }
}

/// SIGTERM to the process group, then SIGKILL after `grace` if the leader
/// is still alive. Returns the exit status once reaped.
async fn terminate(child: &mut Child, pgid: Option<u32>, grace: Duration) -> Option<ExitStatus> {
    signal_group(pgid, Signal::Term);
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return Some(status),
        Ok(Err(e)) => warn!(error = %e, "waiting for agent after SIGTERM failed"),
        Err(_) => warn!(grace_secs = grace.as_secs(), "agent ignored SIGTERM, killing"),
    }
    signal_group(pgid, Signal::Kill);
    if let Err(e) = child.kill().await {
        debug!(error = %e, "killing agent");
    }
    child.wait().await.ok()
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// The child leads its own group, so the group id is its pid. A group with
/// no members left is reported and ignored.
#[cfg(unix)]
fn signal_group(pgid: Option<u32>, signal: Signal) {
    use nix::sys::signal::{self, Signal as NixSignal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid else {
        return;
    };
    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    if let Err(e) = signal::killpg(Pid::from_raw(pgid as i32), sig) {
        debug!(error = %e, pgid, "signalling process group");
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>, _signal: Signal) {}

//! Runs shell commands inside the sandbox root and decides when they are done.
//!
//! Each execution runs on a blocking worker thread because ptrace binds the
//! tracee to the thread that spawned it. The [`ExecutionHandle`] returned by
//! [`Supervisor::spawn`] carries a cancellation token; dropping an unfinished
//! handle cancels the command.

mod observer;
mod poll;
#[cfg(target_os = "linux")]
mod syscall;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ObserverKind, TerminalConfig, TimeoutPolicy};
use crate::sandbox::SandboxGuard;

pub use observer::{
    log_output_callback, resolve_observer_kind, syscall_tracing_supported, OutputCallback,
    OutputStream,
};
use observer::{build_observer, ObserveContext, Observer, StopReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Created,
    Running,
    Exited(i32),
    Signalled(i32),
    TimedOut,
    Cancelled,
    Error(String),
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Exited(code) => write!(f, "exited({code})"),
            Self::Signalled(signal) => write!(f, "signalled({signal})"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}

/// Lifecycle bookkeeping for one command.
#[derive(Debug)]
pub struct CommandExecution {
    pub id: u64,
    pub pid: Option<u32>,
    pub sandbox_root: PathBuf,
    pub started_at: Instant,
    status: ExecutionStatus,
}

impl CommandExecution {
    pub fn new(id: u64, sandbox_root: &Path) -> Self {
        Self {
            id,
            pid: None,
            sandbox_root: sandbox_root.to_path_buf(),
            started_at: Instant::now(),
            status: ExecutionStatus::Created,
        }
    }

    pub fn status(&self) -> &ExecutionStatus {
        &self.status
    }

    /// Applies `next` if the move is legal. Terminal states never change again.
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        let allowed = match (&self.status, &next) {
            (ExecutionStatus::Created, ExecutionStatus::Running) => true,
            (ExecutionStatus::Created, ExecutionStatus::Error(_)) => true,
            (ExecutionStatus::Running, next) => next.is_terminal(),
            _ => false,
        };
        if allowed {
            self.status = next;
        } else {
            warn!(
                "exec #{} rejected transition {} -> {}",
                self.id, self.status, next
            );
        }
        allowed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Exited,
    Signalled,
    TimedOut,
    Cancelled,
    Error,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exited => "exited",
            Self::Signalled => "signalled",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub id: u64,
    pub command: String,
    pub exit_code: Option<i32>,
    pub reason: ExitReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub output: String,
    pub truncated: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observer: Option<ObserverKind>,
}

impl ExecutionResult {
    fn failed(id: u64, command: &str, detail: String, started: Instant) -> Self {
        Self {
            id,
            command: command.to_owned(),
            exit_code: None,
            reason: ExitReason::Error,
            detail: Some(detail),
            output: String::new(),
            truncated: false,
            duration_ms: elapsed_ms(started),
            observer: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.reason == ExitReason::Exited && self.exit_code == Some(0)
    }

    /// Text handed back to the caller of the terminal tool.
    pub fn render(&self) -> String {
        if self.reason == ExitReason::Error {
            return format!(
                "error[process_error]: {}",
                self.detail.as_deref().unwrap_or("command failed")
            );
        }
        let mut text = self.output.clone();
        let trailer = match self.reason {
            ExitReason::Exited => match self.exit_code {
                Some(0) | None => None,
                Some(code) => Some(format!("[exit code {code}]")),
            },
            other => Some(format!(
                "[{}] {}",
                other.as_str(),
                self.detail.as_deref().unwrap_or_default()
            )),
        };
        if let Some(trailer) = trailer {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(trailer.trim_end());
        }
        text
    }
}

/// Handle to an execution running in the background.
pub struct ExecutionHandle {
    id: u64,
    command: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<ExecutionResult>>,
}

impl ExecutionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(mut self) -> ExecutionResult {
        let started = Instant::now();
        let Some(task) = self.task.take() else {
            return ExecutionResult::failed(
                self.id,
                &self.command,
                "execution already awaited".to_owned(),
                started,
            );
        };
        match task.await {
            Ok(result) => result,
            Err(err) => ExecutionResult::failed(
                self.id,
                &self.command,
                format!("execution task failed: {err}"),
                started,
            ),
        }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

pub struct Supervisor {
    root: PathBuf,
    shell: String,
    shell_args: Vec<String>,
    observer: ObserverKind,
    policy: TimeoutPolicy,
    max_output_bytes: usize,
    on_output: OutputCallback,
    next_id: AtomicU64,
}

impl Supervisor {
    pub fn new(guard: &SandboxGuard, cfg: &TerminalConfig) -> Self {
        Self {
            root: guard.root().to_path_buf(),
            shell: cfg.shell.clone(),
            shell_args: cfg.shell_args.clone(),
            observer: cfg.observer,
            policy: cfg.timeout_policy(),
            max_output_bytes: cfg.max_output_bytes,
            on_output: log_output_callback(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_output_callback(mut self, on_output: OutputCallback) -> Self {
        self.on_output = on_output;
        self
    }

    pub fn observer(&self) -> ObserverKind {
        self.observer
    }

    /// Starts `command` on a blocking worker under the configured deadlines.
    /// Must be called inside a tokio runtime.
    pub fn spawn(&self, command: impl Into<String>) -> ExecutionHandle {
        self.spawn_with_policy(command, self.policy)
    }

    /// Like [`Supervisor::spawn`], with deadlines for this one command.
    pub fn spawn_with_policy(
        &self,
        command: impl Into<String>,
        policy: TimeoutPolicy,
    ) -> ExecutionHandle {
        let command = command.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let request = ExecutionRequest {
            id,
            command: command.clone(),
            root: self.root.clone(),
            shell: self.shell.clone(),
            shell_args: self.shell_args.clone(),
            observer: self.observer,
            policy,
            max_output_bytes: self.max_output_bytes,
            on_output: self.on_output.clone(),
            cancel: cancel.clone(),
        };
        info!(
            "exec #{id} ({}) in {}: {}",
            self.observer.as_str(),
            self.root.display(),
            command
        );
        let task = tokio::task::spawn_blocking(move || run_execution(request));
        ExecutionHandle {
            id,
            command,
            cancel,
            task: Some(task),
        }
    }

    pub async fn execute(&self, command: impl Into<String>) -> ExecutionResult {
        self.execute_with(command, self.policy).await
    }

    pub async fn execute_with(
        &self,
        command: impl Into<String>,
        policy: TimeoutPolicy,
    ) -> ExecutionResult {
        self.spawn_with_policy(command, policy).wait().await
    }

    /// Runs several commands in one shell, in order.
    pub async fn execute_all(&self, commands: &[String]) -> ExecutionResult {
        self.execute(join_commands(commands)).await
    }
}

pub fn join_commands(commands: &[String]) -> String {
    commands
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

struct ExecutionRequest {
    id: u64,
    command: String,
    root: PathBuf,
    shell: String,
    shell_args: Vec<String>,
    observer: ObserverKind,
    policy: TimeoutPolicy,
    max_output_bytes: usize,
    on_output: OutputCallback,
    cancel: CancellationToken,
}

impl ExecutionRequest {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.shell);
        command
            .args(&self.shell_args)
            .arg(&self.command)
            .current_dir(&self.root);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
    }

    fn spawn_with(&self, kind: ObserverKind) -> Result<(Box<dyn Observer>, Child), SpawnFailure> {
        let mut observer = build_observer(kind).map_err(SpawnFailure::Setup)?;
        let mut command = self.command();
        observer.prepare(&mut command).map_err(|err| {
            SpawnFailure::Setup(format!(
                "failed preparing {} observer: {err}",
                kind.as_str()
            ))
        })?;
        let child = command.spawn().map_err(SpawnFailure::Spawn)?;
        Ok((observer, child))
    }
}

enum SpawnFailure {
    Setup(String),
    Spawn(std::io::Error),
}

fn run_execution(request: ExecutionRequest) -> ExecutionResult {
    let mut execution = CommandExecution::new(request.id, &request.root);
    let kind = resolve_observer_kind(request.observer);

    let spawned = match request.spawn_with(kind) {
        Err(SpawnFailure::Spawn(err))
            if request.observer == ObserverKind::Auto
                && kind == ObserverKind::Syscall
                && err.kind() == std::io::ErrorKind::PermissionDenied =>
        {
            warn!(
                "exec #{}: tracing refused ({err}), falling back to poll observer",
                request.id
            );
            request.spawn_with(ObserverKind::Poll)
        }
        other => other,
    };
    let (mut observer, mut child) = match spawned {
        Ok(spawned) => spawned,
        Err(failure) => {
            let detail = match failure {
                SpawnFailure::Setup(detail) => detail,
                SpawnFailure::Spawn(err) => format!("failed spawning `{}`: {err}", request.shell),
            };
            execution.transition(ExecutionStatus::Error(detail.clone()));
            warn!("exec #{} failed: {detail}", request.id);
            return ExecutionResult::failed(
                request.id,
                &request.command,
                detail,
                execution.started_at,
            );
        }
    };

    execution.pid = Some(child.id());
    execution.transition(ExecutionStatus::Running);
    debug!(
        "exec #{} running as pid {} under {} observer",
        request.id,
        child.id(),
        observer.kind().as_str()
    );

    let ctx = ObserveContext {
        policy: &request.policy,
        cancel: &request.cancel,
        on_output: &request.on_output,
        max_output_bytes: request.max_output_bytes,
        started: execution.started_at,
    };
    let observation = observer.observe(&mut child, &ctx);
    let (output, truncated) = observation.output.into_text();

    let (status, reason, exit_code, detail) = match observation.reason {
        StopReason::Exited(code) => (
            ExecutionStatus::Exited(code),
            ExitReason::Exited,
            Some(code),
            None,
        ),
        StopReason::Signalled(signal) => (
            ExecutionStatus::Signalled(signal),
            ExitReason::Signalled,
            None,
            Some(format!("killed by signal {signal}")),
        ),
        StopReason::TimedOut(detail) => (
            ExecutionStatus::TimedOut,
            ExitReason::TimedOut,
            None,
            Some(detail),
        ),
        StopReason::Cancelled => (
            ExecutionStatus::Cancelled,
            ExitReason::Cancelled,
            None,
            Some("cancelled by caller".to_owned()),
        ),
        StopReason::Failed(detail) => (
            ExecutionStatus::Error(detail.clone()),
            ExitReason::Error,
            None,
            Some(detail),
        ),
    };
    execution.transition(status);
    debug!(
        "exec #{} (pid {:?}) in {} settled as {}",
        execution.id,
        execution.pid,
        execution.sandbox_root.display(),
        execution.status()
    );

    let result = ExecutionResult {
        id: request.id,
        command: request.command.clone(),
        exit_code,
        reason,
        detail,
        output,
        truncated,
        duration_ms: elapsed_ms(execution.started_at),
        observer: Some(observer.kind()),
    };
    info!(
        "exec #{} finished: {} (exit code {:?}) in {}ms",
        result.id,
        result.reason.as_str(),
        result.exit_code,
        result.duration_ms
    );
    result
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

use std::io;
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ObserverKind, TimeoutPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// stdout and stderr written to one side channel.
    Combined,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Combined => "output",
        }
    }
}

pub type OutputCallback = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

pub fn log_output_callback() -> OutputCallback {
    Arc::new(|stream, chunk| {
        for line in chunk.lines() {
            debug!("{} {}", stream.as_str(), line);
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Exited(i32),
    Signalled(i32),
    TimedOut(String),
    Cancelled,
    Failed(String),
}

pub struct Observation {
    pub reason: StopReason,
    pub output: CapturedOutput,
}

pub struct ObserveContext<'a> {
    pub policy: &'a TimeoutPolicy,
    pub cancel: &'a CancellationToken,
    pub on_output: &'a OutputCallback,
    pub max_output_bytes: usize,
    pub started: Instant,
}

impl ObserveContext<'_> {
    pub fn absolute_deadline_passed(&self) -> bool {
        self.policy
            .absolute
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }

    pub fn absolute_timeout_detail(&self) -> String {
        format!(
            "exceeded absolute timeout of {}ms",
            self.policy.absolute.unwrap_or_default().as_millis()
        )
    }
}

/// Watches one spawned child and decides when and why it stops.
///
/// `observe` must not return before the child has been reaped.
pub trait Observer: Send {
    fn kind(&self) -> ObserverKind;

    /// Wires stdio and pre-exec hooks into the command before it is spawned.
    fn prepare(&mut self, command: &mut Command) -> io::Result<()>;

    fn observe(&mut self, child: &mut Child, ctx: &ObserveContext<'_>) -> Observation;
}

/// Keeps the head of the output up to `limit` bytes and counts the rest.
#[derive(Debug)]
pub struct CapturedOutput {
    bytes: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl CapturedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        let kept = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..kept]);
        self.dropped += chunk.len() - kept;
    }

    pub fn into_text(self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        let truncated = self.dropped > 0;
        if truncated {
            text.push_str(&format!("\n... [{} bytes truncated]", self.dropped));
        }
        (text, truncated)
    }
}

pub fn build_observer(kind: ObserverKind) -> Result<Box<dyn Observer>, String> {
    match kind {
        ObserverKind::Poll => Ok(Box::new(super::poll::PollObserver::new())),
        #[cfg(target_os = "linux")]
        ObserverKind::Syscall => Ok(Box::new(super::syscall::SyscallObserver::new())),
        #[cfg(not(target_os = "linux"))]
        ObserverKind::Syscall => Err("syscall observer requires Linux ptrace support".to_owned()),
        ObserverKind::Auto => build_observer(resolve_observer_kind(kind)),
    }
}

/// Maps `auto` to a concrete strategy for this host.
pub fn resolve_observer_kind(requested: ObserverKind) -> ObserverKind {
    match requested {
        ObserverKind::Auto if syscall_tracing_supported() => ObserverKind::Syscall,
        ObserverKind::Auto => ObserverKind::Poll,
        other => other,
    }
}

#[cfg(target_os = "linux")]
pub fn syscall_tracing_supported() -> bool {
    // Yama mode 3 disables ptrace entirely; a missing file means Yama is off.
    match std::fs::read_to_string("/proc/sys/kernel/yama/ptrace_scope") {
        Ok(scope) => scope.trim() != "3",
        Err(_) => true,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn syscall_tracing_supported() -> bool {
    false
}

pub fn exit_reason(status: ExitStatus) -> StopReason {
    if let Some(code) = status.code() {
        return StopReason::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return StopReason::Signalled(signal);
        }
    }
    StopReason::Failed(format!("child ended with unrecognised status {status}"))
}

/// Kills the child's whole process group, then reaps the child itself.
pub fn terminate(child: &mut Child) {
    kill_process_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: the child was spawned as leader of its own process group, so
    // -pid only addresses processes started by this execution.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::{resolve_observer_kind, CapturedOutput};
    use crate::config::ObserverKind;

    #[test]
    fn captured_output_keeps_head_and_reports_dropped_bytes() {
        let mut output = CapturedOutput::new(8);
        output.push(b"hello ");
        output.push(b"world");

        let (text, truncated) = output.into_text();
        assert!(truncated);
        assert_eq!(text, "hello wo\n... [3 bytes truncated]");
    }

    #[test]
    fn captured_output_below_limit_is_verbatim() {
        let mut output = CapturedOutput::new(64);
        output.push(b"line 1\n");
        output.push(b"line 2\n");
        assert_eq!(output.into_text(), ("line 1\nline 2\n".to_owned(), false));
    }

    #[test]
    fn explicit_observer_kinds_are_kept() {
        assert_eq!(resolve_observer_kind(ObserverKind::Poll), ObserverKind::Poll);
        assert_eq!(
            resolve_observer_kind(ObserverKind::Syscall),
            ObserverKind::Syscall
        );
        assert_ne!(resolve_observer_kind(ObserverKind::Auto), ObserverKind::Auto);
    }
}

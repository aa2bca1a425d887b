//! ptrace-driven observer.
//!
//! The child asks to be traced before `exec`, so it stops at every syscall
//! entry and exit. Each wait for the next stop is bounded by the syscall
//! deadline: a command that sits inside one syscall (a blocking `read`, a
//! `wait4` on a hung grandchild, a long `nanosleep`) is killed once the
//! deadline passes. Output goes to an anonymous temporary file instead of
//! pipes so a traced child can never block on a full pipe buffer.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::ptr;
use std::time::{Duration, Instant};

use libc::{c_int, c_long, c_void, pid_t};
use tracing::{debug, warn};

use super::observer::{CapturedOutput, ObserveContext, Observation, Observer, OutputStream, StopReason};
use crate::config::ObserverKind;

const SYSCALL_STOP: c_int = libc::SIGTRAP | 0x80;

#[derive(Debug, Default)]
pub struct SyscallObserver {
    side_channel: Option<File>,
}

impl SyscallObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_output(&mut self, ctx: &ObserveContext<'_>) -> CapturedOutput {
        let mut output = CapturedOutput::new(ctx.max_output_bytes);
        let Some(mut file) = self.side_channel.take() else {
            return output;
        };
        if let Err(err) = file.seek(SeekFrom::Start(0)) {
            warn!("failed rewinding traced output file: {err}");
            return output;
        }
        let mut buf = [0u8; 8 * 1024];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    output.push(&buf[..n]);
                    (ctx.on_output)(OutputStream::Combined, &String::from_utf8_lossy(&buf[..n]));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("failed reading traced output file: {err}");
                    break;
                }
            }
        }
        output
    }
}

impl Observer for SyscallObserver {
    fn kind(&self) -> ObserverKind {
        ObserverKind::Syscall
    }

    fn prepare(&mut self, command: &mut Command) -> io::Result<()> {
        let file = tempfile::tempfile()?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(file.try_clone()?))
            .stderr(Stdio::from(file.try_clone()?));
        // SAFETY: the hook only calls ptrace(2), which is async-signal-safe, and
        // touches no memory shared with the parent.
        unsafe {
            command.pre_exec(|| {
                let rc = libc::ptrace(
                    libc::PTRACE_TRACEME,
                    0,
                    ptr::null_mut::<c_void>(),
                    ptr::null_mut::<c_void>(),
                );
                if rc == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self.side_channel = Some(file);
        Ok(())
    }

    fn observe(&mut self, child: &mut Child, ctx: &ObserveContext<'_>) -> Observation {
        let reason = match pid_t::try_from(child.id()) {
            Ok(pid) => {
                let mut tracee = Tracee::new(pid);
                let reason = trace(&mut tracee, ctx);
                drop(tracee);
                reason
            }
            Err(_) => StopReason::Failed(format!("pid {} out of range", child.id())),
        };
        let output = self.collect_output(ctx);
        Observation { reason, output }
    }
}

fn trace(tracee: &mut Tracee, ctx: &ObserveContext<'_>) -> StopReason {
    let deadline = ctx.policy.syscall_deadline;

    // First stop is the SIGTRAP delivered by exec.
    match tracee.wait_event(deadline, ctx) {
        Ok(TraceEvent::Stopped(_)) => {}
        Ok(event) => return event.into_stop_reason(),
        Err(abort) => return abort.into_stop_reason(tracee, deadline, None),
    }
    if let Err(err) = tracee.set_options() {
        return StopReason::Failed(format!(
            "failed configuring tracer for pid {}: {err}",
            tracee.pid
        ));
    }

    let mut inject: c_int = 0;
    let mut in_syscall = false;
    let mut current: Option<c_long> = None;
    let mut checkpoints = 0u64;
    loop {
        if let Err(err) = tracee.resume(inject) {
            return StopReason::Failed(format!("failed resuming pid {}: {err}", tracee.pid));
        }
        inject = 0;

        match tracee.wait_event(deadline, ctx) {
            Ok(TraceEvent::Stopped(SYSCALL_STOP)) => {
                in_syscall = !in_syscall;
                if in_syscall {
                    current = syscall_number(tracee.pid);
                    if current.is_some_and(is_wait_checkpoint) {
                        checkpoints += 1;
                        debug!("pid {} waiting on children (checkpoint {checkpoints})", tracee.pid);
                    }
                } else {
                    current = None;
                }
            }
            // exec and other ptrace traps are not forwarded to the child
            Ok(TraceEvent::Stopped(libc::SIGTRAP)) => {}
            Ok(TraceEvent::Stopped(signal)) => inject = signal,
            Ok(event) => return event.into_stop_reason(),
            Err(abort) => return abort.into_stop_reason(tracee, deadline, current),
        }
    }
}

enum TraceEvent {
    Stopped(c_int),
    Exited(c_int),
    Signalled(c_int),
}

impl TraceEvent {
    fn into_stop_reason(self) -> StopReason {
        match self {
            Self::Stopped(signal) => {
                StopReason::Failed(format!("unexpected stop with signal {signal}"))
            }
            Self::Exited(code) => StopReason::Exited(code),
            Self::Signalled(signal) => StopReason::Signalled(signal),
        }
    }
}

enum WaitAbort {
    Deadline,
    Absolute,
    Cancelled,
    Os(io::Error),
}

impl WaitAbort {
    fn into_stop_reason(
        self,
        tracee: &Tracee,
        deadline: Duration,
        current: Option<c_long>,
    ) -> StopReason {
        match self {
            Self::Deadline => {
                let inside = current
                    .map(|nr| format!(" inside {}", describe_syscall(nr)))
                    .unwrap_or_default();
                StopReason::TimedOut(format!(
                    "pid {} made no progress{inside} within the {}ms syscall deadline",
                    tracee.pid,
                    deadline.as_millis()
                ))
            }
            Self::Absolute => StopReason::TimedOut(format!(
                "pid {} exceeded the absolute timeout",
                tracee.pid
            )),
            Self::Cancelled => StopReason::Cancelled,
            Self::Os(err) => {
                StopReason::Failed(format!("failed waiting on pid {}: {err}", tracee.pid))
            }
        }
    }
}

/// Traced child; killed, detached and reaped on drop unless it already exited.
struct Tracee {
    pid: pid_t,
    reaped: bool,
}

impl Tracee {
    fn new(pid: pid_t) -> Self {
        Self { pid, reaped: false }
    }

    fn wait_event(
        &mut self,
        deadline: Duration,
        ctx: &ObserveContext<'_>,
    ) -> Result<TraceEvent, WaitAbort> {
        let started = Instant::now();
        let mut backoff = Backoff::default();
        loop {
            let mut status: c_int = 0;
            // SAFETY: status is a valid out pointer for the duration of the call.
            let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG | libc::__WALL) };
            if rc == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(WaitAbort::Os(err));
            }
            if rc == self.pid {
                if libc::WIFEXITED(status) {
                    self.reaped = true;
                    return Ok(TraceEvent::Exited(libc::WEXITSTATUS(status)));
                }
                if libc::WIFSIGNALED(status) {
                    self.reaped = true;
                    return Ok(TraceEvent::Signalled(libc::WTERMSIG(status)));
                }
                if libc::WIFSTOPPED(status) {
                    return Ok(TraceEvent::Stopped(libc::WSTOPSIG(status)));
                }
                continue;
            }

            if ctx.cancel.is_cancelled() {
                return Err(WaitAbort::Cancelled);
            }
            if ctx.absolute_deadline_passed() {
                return Err(WaitAbort::Absolute);
            }
            if started.elapsed() >= deadline {
                return Err(WaitAbort::Deadline);
            }
            backoff.snooze();
        }
    }

    fn resume(&self, signal: c_int) -> io::Result<()> {
        // SAFETY: the tracee is in a ptrace stop; data carries the signal to inject.
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_SYSCALL,
                self.pid,
                ptr::null_mut::<c_void>(),
                signal as usize as *mut c_void,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_options(&self) -> io::Result<()> {
        let options = libc::PTRACE_O_TRACESYSGOOD | libc::PTRACE_O_EXITKILL;
        // SAFETY: the tracee is stopped after exec; data carries the option bits.
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_SETOPTIONS,
                self.pid,
                ptr::null_mut::<c_void>(),
                options as usize as *mut c_void,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        // SAFETY: plain syscalls on a pid this process spawned and has not reaped.
        unsafe {
            libc::ptrace(
                libc::PTRACE_DETACH,
                self.pid,
                ptr::null_mut::<c_void>(),
                ptr::null_mut::<c_void>(),
            );
            libc::kill(-self.pid, libc::SIGKILL);
            libc::kill(self.pid, libc::SIGKILL);
        }
        loop {
            let mut status: c_int = 0;
            // SAFETY: blocking wait on our own child.
            let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::__WALL) };
            if rc == self.pid && (libc::WIFEXITED(status) || libc::WIFSIGNALED(status)) {
                break;
            }
            if rc == -1 && io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                break;
            }
        }
        self.reaped = true;
    }
}

/// Yields for a few rounds, then sleeps in short steps.
#[derive(Default)]
struct Backoff {
    step: u32,
}

impl Backoff {
    fn snooze(&mut self) {
        if self.step < 32 {
            std::thread::yield_now();
        } else {
            let micros = 100 * u64::from((self.step - 31).min(20));
            std::thread::sleep(Duration::from_micros(micros));
        }
        self.step = self.step.saturating_add(1);
    }
}

#[cfg(target_arch = "x86_64")]
fn syscall_number(pid: pid_t) -> Option<c_long> {
    const ORIG_RAX: usize = 15 * 8;
    // PEEKUSER can legitimately return -1, so errno decides.
    // SAFETY: errno is thread-local; the tracee is in a syscall stop.
    let value = unsafe {
        *libc::__errno_location() = 0;
        libc::ptrace(
            libc::PTRACE_PEEKUSER,
            pid,
            ORIG_RAX as *mut c_void,
            ptr::null_mut::<c_void>(),
        )
    };
    if value == -1 && io::Error::last_os_error().raw_os_error() != Some(0) {
        return None;
    }
    Some(value)
}

#[cfg(not(target_arch = "x86_64"))]
fn syscall_number(_pid: pid_t) -> Option<c_long> {
    None
}

fn is_wait_checkpoint(nr: c_long) -> bool {
    nr == libc::SYS_wait4 || nr == libc::SYS_waitid
}

fn describe_syscall(nr: c_long) -> String {
    let name = match nr {
        n if n == libc::SYS_wait4 => "wait4",
        n if n == libc::SYS_waitid => "waitid",
        n if n == libc::SYS_read => "read",
        n if n == libc::SYS_write => "write",
        n if n == libc::SYS_nanosleep => "nanosleep",
        n if n == libc::SYS_clock_nanosleep => "clock_nanosleep",
        n if n == libc::SYS_ppoll => "ppoll",
        n if n == libc::SYS_pselect6 => "pselect6",
        n if n == libc::SYS_futex => "futex",
        _ => return format!("syscall {nr}"),
    };
    name.to_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::config::{ObserverKind, TerminalConfig};
    use crate::sandbox::tests::temp_path;
    use crate::sandbox::SandboxGuard;
    use crate::terminal::{ExitReason, Supervisor};

    use super::{describe_syscall, is_wait_checkpoint};

    fn traced_supervisor(tag: &str, deadline_ms: u64) -> Supervisor {
        let guard = SandboxGuard::new(temp_path(tag)).expect("guard");
        let cfg = TerminalConfig {
            observer: ObserverKind::Syscall,
            syscall_deadline_ms: deadline_ms,
            ..TerminalConfig::default()
        };
        Supervisor::new(&guard, &cfg).with_output_callback(Arc::new(|_, _| {}))
    }

    #[test]
    fn wait_family_is_a_checkpoint() {
        assert!(is_wait_checkpoint(libc::SYS_wait4));
        assert!(is_wait_checkpoint(libc::SYS_waitid));
        assert!(!is_wait_checkpoint(libc::SYS_read));
        assert_eq!(describe_syscall(libc::SYS_wait4), "wait4");
        assert_eq!(describe_syscall(-7), "syscall -7");
    }

    #[tokio::test]
    async fn traced_command_reports_exit_and_output() {
        let supervisor = traced_supervisor("trace-echo", 5_000);
        let result = supervisor.execute("echo traced; echo oops 1>&2; exit 4").await;
        if result.reason == ExitReason::Error {
            eprintln!("skipping: ptrace unavailable ({:?})", result.detail);
            return;
        }
        assert_eq!(result.reason, ExitReason::Exited);
        assert_eq!(result.exit_code, Some(4));
        assert!(result.output.contains("traced"));
        assert!(result.output.contains("oops"));
    }

    #[tokio::test]
    async fn blocked_syscall_hits_the_deadline() {
        let supervisor = traced_supervisor("trace-deadline", 300);
        let started = Instant::now();
        let result = supervisor.execute("sleep 10").await;
        if result.reason == ExitReason::Error {
            eprintln!("skipping: ptrace unavailable ({:?})", result.detail);
            return;
        }
        assert_eq!(result.reason, ExitReason::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::observer::{
    exit_reason, terminate, CapturedOutput, ObserveContext, Observation, Observer, OutputCallback,
    OutputStream, StopReason,
};
use crate::config::ObserverKind;

/// Upper bound on reads per pipe per tick so a chatty child cannot starve the
/// deadline checks.
const MAX_READS_PER_TICK: usize = 64;
const READ_CHUNK: usize = 8 * 1024;

/// Reads the child's pipes without blocking and kills it after a stretch of
/// silence longer than the idle timeout.
#[derive(Debug, Default)]
pub struct PollObserver;

impl PollObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Observer for PollObserver {
    fn kind(&self) -> ObserverKind {
        ObserverKind::Poll
    }

    fn prepare(&mut self, command: &mut Command) -> io::Result<()> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(())
    }

    fn observe(&mut self, child: &mut Child, ctx: &ObserveContext<'_>) -> Observation {
        let mut output = CapturedOutput::new(ctx.max_output_bytes);
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        if let Err(err) = set_pipes_nonblocking(stdout.as_ref(), stderr.as_ref()) {
            terminate(child);
            return Observation {
                reason: StopReason::Failed(format!(
                    "failed switching child pipes to non-blocking mode: {err}"
                )),
                output,
            };
        }

        let mut last_output = Instant::now();
        let reason = loop {
            let got_stdout = drain(&mut stdout, OutputStream::Stdout, &mut output, ctx.on_output);
            let got_stderr = drain(&mut stderr, OutputStream::Stderr, &mut output, ctx.on_output);
            if got_stdout || got_stderr {
                last_output = Instant::now();
            }

            match child.try_wait() {
                Ok(Some(status)) => break exit_reason(status),
                Ok(None) => {}
                Err(err) => {
                    terminate(child);
                    break StopReason::Failed(format!("failed polling child status: {err}"));
                }
            }

            if ctx.cancel.is_cancelled() {
                debug!("cancelling pid {}", child.id());
                terminate(child);
                break StopReason::Cancelled;
            }
            if ctx.absolute_deadline_passed() {
                terminate(child);
                break StopReason::TimedOut(ctx.absolute_timeout_detail());
            }
            let silent_for = last_output.elapsed();
            if silent_for > ctx.policy.idle {
                terminate(child);
                break StopReason::TimedOut(format!(
                    "no output for {}ms (idle timeout {}ms)",
                    silent_for.as_millis(),
                    ctx.policy.idle.as_millis()
                ));
            }

            std::thread::sleep(tick(
                ctx.policy.poll_interval,
                ctx.policy.idle.saturating_sub(silent_for),
            ));
        };

        // Whatever was buffered between the last tick and exit.
        drain(&mut stdout, OutputStream::Stdout, &mut output, ctx.on_output);
        drain(&mut stderr, OutputStream::Stderr, &mut output, ctx.on_output);

        Observation { reason, output }
    }
}

fn tick(poll_interval: Duration, idle_left: Duration) -> Duration {
    poll_interval.min(idle_left + Duration::from_millis(1))
}

/// Returns true when at least one byte was read.
fn drain<R: Read>(
    pipe: &mut Option<R>,
    stream: OutputStream,
    output: &mut CapturedOutput,
    on_output: &OutputCallback,
) -> bool {
    let Some(reader) = pipe.as_mut() else {
        return false;
    };
    let mut buf = [0u8; READ_CHUNK];
    let mut received = false;
    let mut closed = false;
    for _ in 0..MAX_READS_PER_TICK {
        match reader.read(&mut buf) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => {
                received = true;
                output.push(&buf[..n]);
                on_output(stream, &String::from_utf8_lossy(&buf[..n]));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("failed reading child {}: {err}", stream.as_str());
                closed = true;
                break;
            }
        }
    }
    if closed {
        *pipe = None;
    }
    received
}

#[cfg(unix)]
fn set_pipes_nonblocking(
    stdout: Option<&std::process::ChildStdout>,
    stderr: Option<&std::process::ChildStderr>,
) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    if let Some(pipe) = stdout {
        set_nonblocking(pipe.as_raw_fd())?;
    }
    if let Some(pipe) = stderr {
        set_nonblocking(pipe.as_raw_fd())?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_nonblocking(fd: std::os::fd::RawFd) -> io::Result<()> {
    // SAFETY: fd belongs to a pipe owned by this process; only O_NONBLOCK is toggled.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_pipes_nonblocking(
    _stdout: Option<&std::process::ChildStdout>,
    _stderr: Option<&std::process::ChildStderr>,
) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "non-blocking pipes require a unix host",
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::tick;

    #[test]
    fn tick_never_sleeps_past_the_idle_deadline() {
        assert_eq!(
            tick(Duration::from_millis(100), Duration::from_secs(10)),
            Duration::from_millis(100)
        );
        assert_eq!(
            tick(Duration::from_millis(100), Duration::from_millis(20)),
            Duration::from_millis(21)
        );
    }
}

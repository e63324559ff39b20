//! Helpers for running child processes with timeouts, bounded output, and live echo.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// How long readers get to drain after a timeout kill before they are abandoned.
const READER_GRACE: Duration = Duration::from_millis(500);

type LimitedOutput = (Vec<u8>, usize);

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
///
/// On unix the child leads its own process group and a timeout kills the whole group, so
/// background descendants cannot hold the call open. Readers still blocked past the deadline
/// are abandoned and their output reported as empty.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_rx = spawn_limited_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_limited_reader(stderr, output_limit_bytes);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Written off-thread: a child that never reads must not block the timeout.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    let reader_wait = if timed_out {
        READER_GRACE
    } else {
        timeout.saturating_sub(started.elapsed()).max(READER_GRACE)
    };
    let deadline = Instant::now() + reader_wait;
    let stdout = collect_limited(&stdout_rx, deadline).context("collect stdout")?;
    let stderr = collect_limited(&stderr_rx, deadline).context("collect stderr")?;
    if stdout.is_none() || stderr.is_none() {
        warn!("output pipes still held by descendant processes, abandoning readers");
        kill_process_group(&mut child);
    }
    let (stdout, stdout_truncated) = stdout.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr.unwrap_or_default();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn spawn_limited_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
) -> Receiver<Result<LimitedOutput>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        if tx.send(read_stream_limited(reader, limit)).is_err() {
            debug!("output reader finished after the caller stopped waiting");
        }
    });
    rx
}

/// `None` when the reader is still blocked at `deadline`.
fn collect_limited(
    rx: &Receiver<Result<LimitedOutput>>,
    deadline: Instant,
) -> Result<Option<LimitedOutput>> {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(result) => result.map(Some),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Kill the child and, on unix, every process in its group.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    let group = format!("-{}", child.id());
    match Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if !status.success() => {
            debug!(exit_code = ?status.code(), "kill of process group did not succeed");
        }
        Ok(_) => {}
        Err(e) => warn!(err = %e, "failed to signal process group"),
    }
    if let Err(e) = child.kill() {
        debug!(err = %e, "child already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(err = %e, "child already gone");
    }
}

fn join_output<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Output of a script run with live echo.
#[derive(Debug)]
pub struct StreamedOutput {
    pub status: ExitStatus,
    /// Stdout lines without trailing newlines, in order.
    pub stdout_lines: Vec<String>,
    /// Stderr lines without trailing newlines, in order.
    pub stderr_lines: Vec<String>,
}

/// Where a drained stream is echoed while it is captured.
#[derive(Debug, Clone, Copy)]
enum Echo {
    Stdout,
    Stderr,
}

/// Run a command to completion, echoing stdout/stderr live while capturing their lines.
///
/// Each pipe is drained by its own reader thread with blocking line reads so a
/// full pipe can never stall the other. Both readers finish (their streams
/// close) before the child is reaped. No timeout is applied.
#[instrument(skip_all)]
pub fn run_command_streaming(mut cmd: Command) -> Result<StreamedOutput> {
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning script process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn script");
            return Err(e).context("spawn script");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_lines_with_echo(stdout, Echo::Stdout));
    let stderr_handle = thread::spawn(move || read_lines_with_echo(stderr, Echo::Stderr));

    let stdout_lines = join_output(stdout_handle).context("join stdout")?;
    let stderr_lines = join_output(stderr_handle).context("join stderr")?;
    let status = child.wait().context("wait for script")?;

    debug!(exit_code = ?status.code(), "script finished");
    Ok(StreamedOutput {
        status,
        stdout_lines,
        stderr_lines,
    })
}

/// Read a stream line by line, echoing each line immediately.
fn read_lines_with_echo<R: Read>(reader: R, echo: Echo) -> Result<Vec<String>> {
    let mut buf_reader = BufReader::new(reader);
    let mut lines = Vec::new();

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        let written = match echo {
            Echo::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(&line).and_then(|()| out.flush())
            }
            Echo::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(&line).and_then(|()| err.flush())
            }
        };
        if let Err(e) = written {
            warn!(err = %e, "failed to echo script output");
        }

        let text = String::from_utf8_lossy(&line);
        lines.push(text.trim_end_matches(['\n', '\r']).to_string());
    }

    Ok(lines)
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

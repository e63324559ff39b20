//! Single-slot supervisor for one detached background script.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

/// Refusals from [`ProcessSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    MissingArtifact(PathBuf),
    AlreadyRunning { pid: u32, path: PathBuf },
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::MissingArtifact(path) => {
                write!(f, "script {} does not exist", path.display())
            }
            SupervisorError::AlreadyRunning { pid, path } => write!(
                f,
                "a background process is already running (pid {pid}, {}); stop it first",
                path.display()
            ),
        }
    }
}

impl std::error::Error for SupervisorError {}

/// State of the tracked slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running { pid: u32, path: PathBuf },
    /// Exited on its own; `code` is `None` when killed by a signal.
    Exited { code: Option<i32>, path: PathBuf },
    NotTracked,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running { pid, path } => {
                write!(f, "running (pid {pid}): {}", path.display())
            }
            ProcessStatus::Exited { code, path } => match code {
                Some(code) => write!(f, "stopped (exit code {code}): {}", path.display()),
                None => write!(f, "stopped (terminated by signal): {}", path.display()),
            },
            ProcessStatus::NotTracked => write!(f, "no background process tracked"),
        }
    }
}

/// What [`ProcessSupervisor::stop`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NothingTracked,
    /// The process had already exited; the slot was cleared.
    AlreadyExited(Option<i32>),
    Terminated,
    /// It ignored the graceful request and was killed.
    Killed,
}

struct Tracked {
    child: Child,
    path: PathBuf,
}

/// Starts, stops, and reports on at most one background process.
pub struct ProcessSupervisor {
    interpreter: Vec<String>,
    env: Vec<(String, String)>,
    grace: Duration,
    slot: Option<Tracked>,
}

impl ProcessSupervisor {
    pub fn new(
        interpreter: Vec<String>,
        env: impl IntoIterator<Item = (String, String)>,
        grace: Duration,
    ) -> Self {
        Self {
            interpreter,
            env: env.into_iter().collect(),
            grace,
            slot: None,
        }
    }

    /// Spawn the interpreter on `path` with inherited I/O.
    ///
    /// Fails with [`SupervisorError`] if the file is missing or a tracked
    /// process is still running; nothing is spawned in either case.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn start(&mut self, path: &Path) -> Result<u32> {
        if !path.is_file() {
            return Err(SupervisorError::MissingArtifact(path.to_path_buf()).into());
        }
        if let ProcessStatus::Running { pid, path: running } = self.status()? {
            return Err(SupervisorError::AlreadyRunning { pid, path: running }.into());
        }

        let (program, args) = self
            .interpreter
            .split_first()
            .context("interpreter command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(path)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn background script {}", path.display()))?;
        let pid = child.id();
        info!(pid, "background process started");
        self.slot = Some(Tracked {
            child,
            path: path.to_path_buf(),
        });
        Ok(pid)
    }

    /// Terminate the tracked process, escalating to kill after the grace period.
    ///
    /// The slot is always cleared.
    #[instrument(skip_all)]
    pub fn stop(&mut self) -> Result<StopOutcome> {
        let Some(mut tracked) = self.slot.take() else {
            return Ok(StopOutcome::NothingTracked);
        };
        if let Some(status) = tracked.child.try_wait().context("poll background process")? {
            debug!(exit_code = ?status.code(), "background process had already exited");
            return Ok(StopOutcome::AlreadyExited(status.code()));
        }

        let pid = tracked.child.id();
        request_termination(&mut tracked.child)?;
        if let Some(status) = tracked
            .child
            .wait_timeout(self.grace)
            .context("wait for background process")?
        {
            info!(pid, exit_code = ?status.code(), "background process terminated");
            return Ok(StopOutcome::Terminated);
        }

        warn!(pid, grace_secs = self.grace.as_secs(), "process ignored termination, killing");
        tracked.child.kill().context("kill background process")?;
        tracked.child.wait().context("reap background process")?;
        Ok(StopOutcome::Killed)
    }

    pub fn status(&mut self) -> Result<ProcessStatus> {
        let Some(tracked) = self.slot.as_mut() else {
            return Ok(ProcessStatus::NotTracked);
        };
        let status = match tracked
            .child
            .try_wait()
            .context("poll background process")?
        {
            Some(exit) => ProcessStatus::Exited {
                code: exit.code(),
                path: tracked.path.clone(),
            },
            None => ProcessStatus::Running {
                pid: tracked.child.id(),
                path: tracked.path.clone(),
            },
        };
        Ok(status)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.slot.is_none() {
            return;
        }
        if let Err(e) = self.stop() {
            warn!(err = %e, "failed to stop background process on shutdown");
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) -> Result<()> {
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("send SIGTERM")?;
    if !status.success() {
        // The process may have exited between the poll and the signal.
        debug!(exit_code = ?status.code(), "kill -TERM did not succeed");
    }
    Ok(())
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) -> Result<()> {
    child.kill().context("terminate background process")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(vec!["sh".to_string()], Vec::new(), Duration::from_secs(5))
    }

    #[test]
    fn missing_artifact_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = supervisor()
            .start(&temp.path().join("absent.sh"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::MissingArtifact(_))
        ));
    }

    #[test]
    fn second_start_is_refused_while_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("loop.sh");
        fs::write(&script, "sleep 30\n").expect("write");
        let mut sup = supervisor();

        let pid = sup.start(&script).expect("start");
        let err = sup.start(&script).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SupervisorError>(),
            Some(&SupervisorError::AlreadyRunning {
                pid,
                path: script.clone()
            })
        );
        assert!(matches!(sup.status().expect("status"), ProcessStatus::Running { .. }));

        assert_eq!(sup.stop().expect("stop"), StopOutcome::Terminated);
        assert_eq!(sup.status().expect("status"), ProcessStatus::NotTracked);
        assert_eq!(sup.stop().expect("stop"), StopOutcome::NothingTracked);
    }

    #[test]
    fn stubborn_process_is_killed_after_grace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("stubborn.sh");
        fs::write(&script, "trap '' TERM\nwhile :; do sleep 0.05; done\n").expect("write");
        let mut sup = ProcessSupervisor::new(
            vec!["sh".to_string()],
            Vec::new(),
            Duration::from_millis(300),
        );
        sup.start(&script).expect("start");
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(sup.stop().expect("stop"), StopOutcome::Killed);
    }

    #[test]
    fn exited_process_reports_code_and_can_be_replaced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("quick.sh");
        fs::write(&script, "exit 7\n").expect("write");
        let mut sup = supervisor();
        sup.start(&script).expect("start");
        let mut status = sup.status().expect("status");
        for _ in 0..100 {
            if !matches!(status, ProcessStatus::Running { .. }) {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
            status = sup.status().expect("status");
        }
        assert_eq!(
            status,
            ProcessStatus::Exited {
                code: Some(7),
                path: script.clone()
            }
        );
        sup.start(&script).expect("restart after exit");
    }
}

//! External process supervision.
//!
//! The child runs in its own process group so the whole tree can be signalled
//! on timeout. Standard output and standard error are drained by two tasks
//! into per-stream log files while the child runs; both are joined before a
//! result is reported. The timeout covers the readers too, so a background
//! helper holding the pipes open is terminated along with the rest of the
//! group.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::error::{DispatchError, Result};

/// Reported when the process group had to be killed outright.
pub const TIMEOUT_RETURN_CODE: i32 = -100;
pub const TERMINATION_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
  pub stdout: PathBuf,
  pub stderr: PathBuf,
  pub return_code: i32,
  pub elapsed: Duration,
  pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
  stdout_file: String,
  stderr_file: String,
  grace: Duration,
}

impl ProcessSupervisor {
  pub fn new(stdout_file: &str, stderr_file: &str) -> Self {
    Self {
      stdout_file: stdout_file.to_string(),
      stderr_file: stderr_file.to_string(),
      grace: TERMINATION_GRACE,
    }
  }

  pub fn with_grace_period(mut self, grace: Duration) -> Self {
    self.grace = grace;
    self
  }

  pub async fn run(&self, command: &[String], output_directory: &Path, timeout: Duration) -> Result<ProcessOutcome> {
    let (program, args) = command
      .split_first()
      .ok_or_else(|| DispatchError::Spawn(std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line")))?;
    info!(command = ?command, timeout_secs = timeout.as_secs(), "Running command");

    let stdout_path = output_directory.join(&self.stdout_file);
    let stderr_path = output_directory.join(&self.stderr_file);
    let stdout_log = File::create(&stdout_path).await?;
    let stderr_log = File::create(&stderr_path).await?;

    let started = Instant::now();
    let mut child = Command::new(program)
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .process_group(0)
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DispatchError::SolverNotFound(PathBuf::from(program)),
        _ => DispatchError::Spawn(e),
      })?;
    let mut guard = GroupGuard { group: child.id().map(|pid| Pid::from_raw(pid as i32)) };

    let stdout_task = spawn_drain(child.stdout.take(), stdout_log, "STDOUT");
    let stderr_task = spawn_drain(child.stderr.take(), stderr_log, "STDERR");
    let mut drains = tokio::spawn(join_drains(stdout_task, stderr_task));

    let completed = tokio::time::timeout_at(started + timeout, finish(&mut child, &mut drains)).await;
    let (return_code, timed_out) = match completed {
      Ok(status) => (exit_code(status?), false),
      Err(_) => (self.terminate_group(&mut child, &mut drains, guard.group).await?, true),
    };
    guard.disarm();
    let elapsed = started.elapsed();

    info!(return_code, timed_out, elapsed_ms = elapsed.as_millis() as u64, "Command finished");
    Ok(ProcessOutcome { stdout: stdout_path, stderr: stderr_path, return_code, elapsed, timed_out })
  }

  /// SIGTERM to the group, then SIGKILL once the grace period runs out. The
  /// group is only done once the child has exited and every holder of its
  /// output pipes is gone.
  async fn terminate_group(&self, child: &mut Child, drains: &mut JoinHandle<()>, group: Option<Pid>) -> Result<i32> {
    let Some(group) = group else {
      return Ok(exit_code(finish(child, drains).await?));
    };

    info!(pgid = group.as_raw(), "Timeout expired for process, terminating process group with SIGTERM");
    signal_group(group, Signal::SIGTERM);
    let graceful = tokio::time::timeout(self.grace, finish(child, drains)).await;
    // Stragglers that detached from the output pipes still go.
    signal_group(group, Signal::SIGKILL);
    match graceful {
      Ok(status) => Ok(exit_code(status?)),
      Err(_) => {
        info!(pgid = group.as_raw(), "Process group unresponsive, killed with SIGKILL");
        child.wait().await?;
        if tokio::time::timeout(self.grace, &mut *drains).await.is_err() {
          warn!(pgid = group.as_raw(), "Output still open after SIGKILL, abandoning readers");
          drains.abort();
        }
        Ok(TIMEOUT_RETURN_CODE)
      }
    }
  }
}

/// SIGKILLs the process group when a run is abandoned before it finished.
struct GroupGuard {
  group: Option<Pid>,
}

impl GroupGuard {
  fn disarm(&mut self) {
    self.group = None;
  }
}

impl Drop for GroupGuard {
  fn drop(&mut self) {
    if let Some(group) = self.group.take() {
      warn!(pgid = group.as_raw(), "Run abandoned, killing process group");
      signal_group(group, Signal::SIGKILL);
    }
  }
}

/// Child exit plus both output streams closed.
async fn finish(child: &mut Child, drains: &mut JoinHandle<()>) -> std::io::Result<ExitStatus> {
  let status = child.wait().await?;
  if let Err(e) = drains.await {
    warn!(error = %e, "Output readers did not finish");
  }
  Ok(status)
}

async fn join_drains(stdout: JoinHandle<std::io::Result<()>>, stderr: JoinHandle<std::io::Result<()>>) {
  let (stdout_done, stderr_done) = futures::future::join(stdout, stderr).await;
  for (stream, done) in [("STDOUT", stdout_done), ("STDERR", stderr_done)] {
    match done {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(stream, error = %e, "Failed to capture output"),
      Err(e) => warn!(stream, error = %e, "Output reader panicked"),
    }
  }
}

fn signal_group(group: Pid, signal: Signal) {
  match killpg(group, signal) {
    Ok(()) | Err(Errno::ESRCH) => {}
    Err(e) => warn!(pgid = group.as_raw(), %signal, error = %e, "Failed to signal process group"),
  }
}

/// Exit code, or the negated signal number when the child was killed.
fn exit_code(status: ExitStatus) -> i32 {
  status.code()
    .or_else(|| status.signal().map(|signal| -signal))
    .unwrap_or(TIMEOUT_RETURN_CODE)
}

fn spawn_drain<R>(stream: Option<R>, log: File, name: &'static str) -> JoinHandle<std::io::Result<()>>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(async move {
    match stream {
      Some(stream) => drain(stream, log, name).await,
      None => Ok(()),
    }
  })
}

async fn drain<R: AsyncRead + Unpin>(stream: R, mut log: File, name: &'static str) -> std::io::Result<()> {
  let mut reader = BufReader::new(stream);
  let mut buf = Vec::new();
  loop {
    buf.clear();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
      break;
    }
    let line = String::from_utf8_lossy(&buf);
    debug!(stream = name, line = %line.trim_end(), "Captured output");
    log.write_all(line.as_bytes()).await?;
  }
  log.flush().await
}

/// Starts a long-lived helper script with its output redirected to files and
/// leaves it running.
pub fn spawn_detached(program: &Path, stdout: &Path, stderr: &Path) -> Result<Child> {
  let out = std::fs::File::create(stdout)?;
  let err = std::fs::File::create(stderr)?;
  info!(program = %program.display(), "Starting participant script");
  Command::new(program)
    .stdin(Stdio::null())
    .stdout(out)
    .stderr(err)
    .spawn()
    .map_err(|e| match e.kind() {
      std::io::ErrorKind::NotFound => DispatchError::SolverNotFound(program.to_path_buf()),
      _ => DispatchError::Spawn(e),
    })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sh(script: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into()]
  }

  #[tokio::test]
  async fn captures_both_streams_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new("stdout.log", "stderr.log");
    let outcome = supervisor
      .run(&sh("echo one; echo err-one 1>&2; echo two; echo err-two 1>&2; exit 3"), dir.path(), Duration::from_secs(10))
      .await
      .unwrap();

    assert!(!outcome.timed_out);
    assert_eq!(outcome.return_code, 3);
    assert_eq!(std::fs::read_to_string(&outcome.stdout).unwrap(), "one\ntwo\n");
    assert_eq!(std::fs::read_to_string(&outcome.stderr).unwrap(), "err-one\nerr-two\n");
  }

  #[tokio::test]
  async fn large_output_does_not_block_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new("stdout.log", "stderr.log");
    let outcome = supervisor
      .run(&sh("i=0; while [ $i -lt 20000 ]; do echo line-$i; echo err-$i 1>&2; i=$((i+1)); done"), dir.path(), Duration::from_secs(30))
      .await
      .unwrap();

    assert!(!outcome.timed_out);
    assert_eq!(outcome.return_code, 0);
    let stdout = std::fs::read_to_string(&outcome.stdout).unwrap();
    assert_eq!(stdout.lines().count(), 20000);
    assert_eq!(stdout.lines().last(), Some("line-19999"));
  }

  #[tokio::test]
  async fn graceful_termination_on_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new("stdout.log", "stderr.log");
    let outcome = supervisor
      .run(&vec!["sleep".to_string(), "30".to_string()], dir.path(), Duration::from_millis(500))
      .await
      .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(outcome.return_code, -(Signal::SIGTERM as i32));
    assert!(outcome.elapsed < Duration::from_secs(10));
  }

  #[tokio::test]
  async fn force_kill_reports_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new("stdout.log", "stderr.log").with_grace_period(Duration::from_millis(500));
    let outcome = supervisor
      .run(&sh("trap '' TERM; echo started; sleep 30"), dir.path(), Duration::from_millis(500))
      .await
      .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(outcome.return_code, TIMEOUT_RETURN_CODE);
    assert_eq!(std::fs::read_to_string(&outcome.stdout).unwrap(), "started\n");
  }

  #[tokio::test]
  async fn group_member_ignoring_term_is_killed_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new("stdout.log", "stderr.log").with_grace_period(Duration::from_millis(500));
    let outcome = supervisor
      .run(&sh("sh -c 'trap \"\" TERM; sleep 8'; echo after"), dir.path(), Duration::from_millis(500))
      .await
      .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(outcome.return_code, TIMEOUT_RETURN_CODE);
    assert!(outcome.elapsed < Duration::from_secs(4), "took {:?}", outcome.elapsed);
  }

  #[tokio::test]
  async fn background_helper_holding_output_counts_against_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new("stdout.log", "stderr.log").with_grace_period(Duration::from_millis(500));
    let outcome = supervisor
      .run(&sh("sleep 8 & echo done"), dir.path(), Duration::from_millis(500))
      .await
      .unwrap();

    assert!(outcome.timed_out);
    assert!(outcome.elapsed < Duration::from_secs(4), "took {:?}", outcome.elapsed);
    assert_eq!(std::fs::read_to_string(&outcome.stdout).unwrap(), "done\n");
  }

  fn is_running(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
      Ok(stat) => stat.rsplit(')').next().map(|rest| !rest.trim_start().starts_with('Z')).unwrap_or(false),
      Err(_) => false,
    }
  }

  #[tokio::test]
  async fn abandoned_run_kills_the_whole_group() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("helper.pid");
    let supervisor = ProcessSupervisor::new("stdout.log", "stderr.log");
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

    let abandoned = tokio::time::timeout(Duration::from_secs(1), supervisor.run(&sh(&script), dir.path(), Duration::from_secs(60))).await;
    assert!(abandoned.is_err());

    let helper: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    let mut waited = Duration::ZERO;
    while is_running(helper) && waited < Duration::from_secs(5) {
      tokio::time::sleep(Duration::from_millis(50)).await;
      waited += Duration::from_millis(50);
    }
    assert!(!is_running(helper));
  }

  #[tokio::test]
  async fn missing_executable_is_distinct_error() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new("stdout.log", "stderr.log");
    let err = supervisor
      .run(&vec!["/definitely/not/here/solver".to_string()], dir.path(), Duration::from_secs(1))
      .await
      .unwrap_err();
    assert!(matches!(err, DispatchError::SolverNotFound(_)));
  }

  #[tokio::test]
  async fn empty_command_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new("stdout.log", "stderr.log");
    assert!(supervisor.run(&[], dir.path(), Duration::from_secs(1)).await.is_err());
  }
}

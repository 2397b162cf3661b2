//! Leader-side task loop.
//!
//! One task at a time: receive, delete, validate, wait for workers, stage,
//! solve, publish, clean up, notify. The inbound message is deleted as soon as
//! it is read, so a leader that dies mid-task loses that task rather than
//! running it twice.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::clock::{Clock, sleep_or_shutdown};
use crate::error::{DispatchError, Result};
use crate::messaging::{MessageQueue, QueueMessage};
use crate::models::{ExecutionResult, NodeRole, TaskDescriptor};
use crate::notification::CompletionNotifier;
use crate::registry::NodeRegistry;
use crate::solver::{SolveRequest, Solver};
use crate::storage::{ObjectStore, object_uri};

pub const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const WORKER_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
  AwaitingMessage,
  Validating,
  AwaitingWorkers,
  Staging,
  Executing,
  Publishing,
  Cleanup,
}

impl fmt::Display for DispatchState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      DispatchState::AwaitingMessage => "AWAITING_MESSAGE",
      DispatchState::Validating => "VALIDATING",
      DispatchState::AwaitingWorkers => "AWAITING_WORKERS",
      DispatchState::Staging => "STAGING",
      DispatchState::Executing => "EXECUTING",
      DispatchState::Publishing => "PUBLISHING",
      DispatchState::Cleanup => "CLEANUP",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
  pub leader_address: String,
  pub work_root: PathBuf,
  pub artifact_bucket: String,
  pub node_expiration_secs: i64,
  pub worker_poll_interval: Duration,
  pub worker_wait_timeout: Duration,
}

impl DispatcherSettings {
  pub fn new(leader_address: &str, work_root: impl Into<PathBuf>, artifact_bucket: &str, node_expiration_secs: i64) -> Self {
    Self {
      leader_address: leader_address.to_string(),
      work_root: work_root.into(),
      artifact_bucket: artifact_bucket.to_string(),
      node_expiration_secs,
      worker_poll_interval: WORKER_POLL_INTERVAL,
      worker_wait_timeout: WORKER_WAIT_TIMEOUT,
    }
  }
}

/// Everything the dispatcher talks to.
#[derive(Clone)]
pub struct Collaborators {
  pub inbound: Arc<dyn MessageQueue>,
  pub outbound: Arc<dyn MessageQueue>,
  pub registry: Arc<dyn NodeRegistry>,
  pub store: Arc<dyn ObjectStore>,
  pub solver: Arc<dyn Solver>,
  pub notifier: CompletionNotifier,
  pub clock: Arc<dyn Clock>,
}

pub struct TaskDispatcher {
  deps: Collaborators,
  settings: DispatcherSettings,
}

fn enter(state: DispatchState) {
  debug!(state = %state, "Dispatcher state");
}

impl TaskDispatcher {
  pub fn new(deps: Collaborators, settings: DispatcherSettings) -> Self {
    Self { deps, settings }
  }

  /// Loops until shutdown. A failing task is logged and the loop carries on.
  /// Shutdown only interrupts the wait for a message; a task that has been
  /// received always runs to the end.
  pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
    info!(queue = %self.deps.inbound.name(), leader = %self.settings.leader_address, "Starting task dispatcher");
    loop {
      if *shutdown.borrow() {
        break;
      }
      let received = tokio::select! {
        received = self.receive() => received,
        changed = shutdown.changed() => {
          if changed.is_err() {
            break;
          }
          continue;
        }
      };
      let outcome = match received {
        Ok(Some(message)) => self.handle(&message).await,
        Ok(None) => Ok(None),
        Err(e) => Err(e),
      };
      if let Err(e) = outcome {
        error!(queue = %self.deps.inbound.name(), error = %e, "Task failed");
      }
    }
    info!("Task dispatcher shutting down");
  }

  /// One pass through the state machine. `Ok(None)` means no task ran.
  pub async fn poll_once(&self) -> Result<Option<ExecutionResult>> {
    match self.receive().await? {
      Some(message) => self.handle(&message).await,
      None => Ok(None),
    }
  }

  async fn receive(&self) -> Result<Option<QueueMessage>> {
    enter(DispatchState::AwaitingMessage);
    debug!(queue = %self.deps.inbound.name(), "Trying to get messages from queue");
    let Some(message) = self.deps.inbound.receive_one().await? else {
      return Ok(None);
    };
    info!(receipt = message.receipt, "Got problem to solve");
    Ok(Some(message))
  }

  async fn handle(&self, message: &QueueMessage) -> Result<Option<ExecutionResult>> {
    self.deps.inbound.acknowledge(message).await?;
    info!(receipt = message.receipt, "Deleted message from queue");

    enter(DispatchState::Validating);
    let descriptor = match TaskDescriptor::parse(message.body()) {
      Ok(descriptor) => descriptor,
      Err(e) => {
        error!(receipt = message.receipt, body = %message.body(), error = %e, "Message is invalid, skipping processing");
        return Ok(None);
      }
    };

    self.process(message, &descriptor)
      .await
      .map(Some)
      .inspect_err(|e| {
        error!(receipt = message.receipt, problem = %descriptor.formula.value, error = %e, "Failed to run solver on message");
      })
  }

  async fn process(&self, message: &QueueMessage, descriptor: &TaskDescriptor) -> Result<ExecutionResult> {
    enter(DispatchState::AwaitingWorkers);
    info!(requested = descriptor.num_workers, "Waiting for worker nodes");
    let mut workers = self.wait_for_workers(descriptor.num_workers).await?;
    workers.push(self.settings.leader_address.clone());

    enter(DispatchState::Staging);
    let task_id = Uuid::new_v4().to_string();
    let task_directory = self.settings.work_root.join(&task_id);
    tokio::fs::create_dir_all(&task_directory).await?;
    info!(task_id = %task_id, directory = %task_directory.display(), "Created task directory");

    let result = self.execute_and_publish(message, descriptor, &task_id, &task_directory, workers).await;

    enter(DispatchState::Cleanup);
    if let Ok(result) = &result {
      remove_directory(Path::new(&result.solver.request_directory_path)).await;
    }
    remove_directory(&task_directory).await;
    let result = result?;

    self.deps.notifier.notify_task_end(&self.settings.leader_address).await?;
    Ok(result)
  }

  async fn execute_and_publish(
    &self,
    message: &QueueMessage,
    descriptor: &TaskDescriptor,
    task_id: &str,
    task_directory: &Path,
    workers: Vec<String>,
  ) -> Result<ExecutionResult> {
    let problem_uri = descriptor.formula.value.as_str();
    let formula_file = self.deps.store.download(problem_uri, task_directory).await?;
    info!(task_id, location = %formula_file.display(), "Downloaded problem");

    enter(DispatchState::Executing);
    let request = SolveRequest {
      task_id: task_id.to_string(),
      formula_file,
      formula_language: descriptor.formula.language.clone(),
      request_directory: task_directory.to_path_buf(),
      worker_addresses: workers,
      solver_options: descriptor.solver_config.solver_options.clone(),
      timeout: Duration::from_secs(descriptor.timeout_secs()),
    };
    let mut result = self.deps.solver.solve(&request).await?;
    result.driver.s3_uri = Some(problem_uri.to_string());
    info!(
      task_id,
      receipt = message.receipt,
      return_code = result.driver.return_code,
      timed_out = result.driver.timed_out,
      "Solver response received"
    );

    enter(DispatchState::Publishing);
    self.deps.outbound.send(&serde_json::to_string(&result)?).await?;
    info!(task_id, queue = %self.deps.outbound.name(), "Wrote response to output queue");

    let directory_name = task_directory
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| task_id.to_string());
    let destination = object_uri(&self.settings.artifact_bucket, &directory_name);
    self.deps.store.upload_tree(task_directory, &destination).await?;
    info!(task_id, destination = %destination, "Uploaded task directory");

    Ok(result)
  }

  /// Addresses of at least `requested` live, ready workers.
  pub async fn wait_for_workers(&self, requested: usize) -> Result<Vec<String>> {
    if requested == 0 {
      return Ok(Vec::new());
    }
    let mut waited = Duration::ZERO;
    loop {
      let ready: Vec<String> = self.deps.registry
        .list_live(NodeRole::Worker, self.settings.node_expiration_secs)
        .await?
        .into_iter()
        .filter(|record| record.is_ready())
        .map(|record| record.ip_address)
        .collect();
      if ready.len() >= requested {
        info!(workers = ?ready, "Workers reported");
        return Ok(ready);
      }
      if waited >= self.settings.worker_wait_timeout {
        warn!(requested, available = ready.len(), "Gave up waiting for workers");
        return Err(DispatchError::WorkerQuorumTimeout { requested, available: ready.len() });
      }
      self.deps.clock.sleep(self.settings.worker_poll_interval).await;
      waited += self.settings.worker_poll_interval;
    }
  }
}

async fn remove_directory(path: &Path) {
  match tokio::fs::remove_dir_all(path).await {
    Ok(()) => info!(directory = %path.display(), "Cleaned up directory"),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => warn!(directory = %path.display(), error = %e, "Failed to clean up directory"),
  }
}

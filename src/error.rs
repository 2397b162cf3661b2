use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
  #[error("queue {queue} unavailable: {reason}")]
  QueueUnavailable { queue: String, reason: String },

  #[error("node registry unavailable: {0}")]
  RegistryUnavailable(String),

  #[error("object store unavailable: {0}")]
  StorageUnavailable(String),

  #[error("invalid task message: {0}")]
  InvalidTask(String),

  #[error("solver executable does not exist: {}", .0.display())]
  SolverNotFound(PathBuf),

  #[error("failed to spawn process: {0}")]
  Spawn(#[source] std::io::Error),

  #[error("timed out waiting for {requested} worker nodes, only {available} reported")]
  WorkerQuorumTimeout { requested: usize, available: usize },

  #[error("no live leader registered within {seconds}s")]
  LeaderWaitTimeout { seconds: u64 },

  #[error("no result for {problem} after {seconds}s, did the leader crash?")]
  ResultWaitTimeout { problem: String, seconds: u64 },

  #[error("worker status last updated {age_secs}s ago, node is considered wedged")]
  StaleWorkerStatus { age_secs: i64 },

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Json(#[from] serde_json::Error),
}

impl DispatchError {
  pub fn queue(queue: &str, reason: impl ToString) -> Self {
    DispatchError::QueueUnavailable { queue: queue.to_string(), reason: reason.to_string() }
  }

  /// Only a wedged worker ends the process; everything else abandons the
  /// current iteration.
  pub fn is_fatal(&self) -> bool {
    matches!(self, DispatchError::StaleWorkerStatus { .. })
  }

  pub fn is_timeout(&self) -> bool {
    matches!(
      self,
      DispatchError::WorkerQuorumTimeout { .. }
        | DispatchError::LeaderWaitTimeout { .. }
        | DispatchError::ResultWaitTimeout { .. }
    )
  }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

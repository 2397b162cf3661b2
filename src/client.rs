//! Submitting side: one task per problem, bounded wait for its result, a
//! capped retry on inconclusive answers, and a resumable results ledger.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::clock::Clock;
use crate::error::{DispatchError, Result};
use crate::messaging::MessageQueue;
use crate::models::{ExecutionResult, Formula, SolverConfig, TaskDescriptor};
use crate::storage::ObjectStore;

pub const RETRIES_MAX: u32 = 2;
pub const RESULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1030);
const EMPTY_POLL_BACKOFF: Duration = Duration::from_secs(1);

/// Problem key to the last result received for it, persisted as JSON.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResultsLedger {
  path: PathBuf,
  results: BTreeMap<String, ExecutionResult>,
}

impl ResultsLedger {
  /// Loads an existing ledger unless `clean` asks for a fresh start.
  pub async fn load(path: &Path, clean: bool) -> Result<Self> {
    let mut ledger = Self { path: path.to_path_buf(), results: BTreeMap::new() };
    if clean {
      return Ok(ledger);
    }
    match tokio::fs::read(path).await {
      Ok(raw) => ledger.results = serde_json::from_slice(&raw)?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(e.into()),
    }
    Ok(ledger)
  }

  pub fn get(&self, problem: &str) -> Option<&ExecutionResult> {
    self.results.get(problem)
  }

  pub fn len(&self) -> usize {
    self.results.len()
  }

  pub fn is_empty(&self) -> bool {
    self.results.is_empty()
  }

  pub fn record(&mut self, problem: &str, result: ExecutionResult) {
    self.results.insert(problem.to_string(), result);
  }

  /// Overwrites the ledger file with the current contents.
  pub async fn persist(&self) -> Result<()> {
    let body = serde_json::to_vec_pretty(&self.results)?;
    let staging = self.path.with_extension("tmp");
    tokio::fs::write(&staging, body).await?;
    tokio::fs::rename(&staging, &self.path).await?;
    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct TaskTemplate {
  pub language: String,
  pub solver_name: String,
  pub solver_options: Vec<String>,
  pub timeout_secs: u64,
  pub num_workers: usize,
}

impl TaskTemplate {
  pub fn descriptor_for(&self, problem_uri: &str) -> TaskDescriptor {
    TaskDescriptor {
      formula: Formula { value: problem_uri.to_string(), language: self.language.clone() },
      solver_config: SolverConfig {
        solver_name: self.solver_name.clone(),
        solver_options: self.solver_options.clone(),
        task_timeout_seconds: self.timeout_secs,
      },
      num_workers: self.num_workers,
    }
  }
}

pub struct ClientDriver {
  problems: Arc<dyn MessageQueue>,
  results: Arc<dyn MessageQueue>,
  clock: Arc<dyn Clock>,
  template: TaskTemplate,
  retries_max: u32,
  wait_timeout: Duration,
}

impl ClientDriver {
  pub fn new(problems: Arc<dyn MessageQueue>, results: Arc<dyn MessageQueue>, clock: Arc<dyn Clock>, template: TaskTemplate) -> Self {
    Self {
      problems,
      results,
      clock,
      template,
      retries_max: RETRIES_MAX,
      wait_timeout: RESULT_WAIT_TIMEOUT,
    }
  }

  pub fn with_retries(mut self, retries_max: u32) -> Self {
    self.retries_max = retries_max;
    self
  }

  pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
    self.wait_timeout = wait_timeout;
    self
  }

  pub async fn purge_queues(&self) -> Result<()> {
    self.problems.purge().await?;
    self.results.purge().await
  }

  /// Blocks until a result for `problem_uri` arrives. Results for other
  /// problems are leftovers from earlier runs and are discarded.
  async fn await_result(&self, problem_uri: &str) -> Result<ExecutionResult> {
    let started = self.clock.now();
    loop {
      let waited = self.clock.now() - started;
      if waited >= self.wait_timeout.as_secs() as i64 {
        return Err(DispatchError::ResultWaitTimeout {
          problem: problem_uri.to_string(),
          seconds: self.wait_timeout.as_secs(),
        });
      }
      match self.results.receive_one().await? {
        Some(message) => {
          self.results.acknowledge(&message).await?;
          let result: ExecutionResult = match serde_json::from_str(message.body()) {
            Ok(result) => result,
            Err(e) => {
              warn!(error = %e, body = %message.body(), "Discarding unreadable result");
              continue;
            }
          };
          if result.driver.s3_uri.as_deref() == Some(problem_uri) {
            return Ok(result);
          }
          warn!(expected = problem_uri, received = ?result.driver.s3_uri, "Discarding stale result");
        }
        None => {
          info!(problem = problem_uri, "Awaiting completion");
          self.clock.sleep(EMPTY_POLL_BACKOFF).await;
        }
      }
    }
  }

  /// Submits until the answer is conclusive, the driver timed out, or the
  /// retry budget is spent. The last result received is returned.
  pub async fn run_one_problem(&self, problem_uri: &str) -> Result<ExecutionResult> {
    let body = serde_json::to_string(&self.template.descriptor_for(problem_uri))?;
    let mut retries = 0;
    loop {
      self.problems.send(&body).await?;
      debug!(problem = problem_uri, attempt = retries + 1, "Submitted task");
      let result = self.await_result(problem_uri).await?;
      info!(problem = problem_uri, result = %pretty(&result), "Problem completed");

      if result.driver.timed_out {
        return Ok(result);
      }
      let verdict = result.verdict();
      if verdict.is_conclusive() || retries >= self.retries_max {
        return Ok(result);
      }
      retries += 1;
      info!(problem = problem_uri, retries, verdict = ?verdict, "Inconclusive answer, resubmitting");
    }
  }

  /// Solves every listed problem missing from the ledger, persisting after
  /// each one. A problem whose result never arrives is skipped and left out
  /// of the ledger, so a later run retries it. Returns how many problems
  /// were submitted.
  pub async fn run_problems(&self, problems: &[(String, String)], ledger: &mut ResultsLedger) -> Result<usize> {
    let mut submitted = 0;
    for (key, uri) in problems {
      if let Some(cached) = ledger.get(key) {
        info!(problem = %uri, result = %pretty(cached), "Problem is cached from earlier run");
        continue;
      }
      info!(problem = %uri, "Attempting to solve problem");
      submitted += 1;
      let result = match self.run_one_problem(uri).await {
        Ok(result) => result,
        Err(e) if e.is_timeout() => {
          warn!(problem = %uri, error = %e, "No result for problem, moving on");
          continue;
        }
        Err(e) => return Err(e),
      };
      ledger.record(key, result);
      ledger.persist().await?;
    }
    Ok(submitted)
  }

  pub async fn run_bucket(&self, store: &dyn ObjectStore, bucket: &str, ledger: &mut ResultsLedger) -> Result<usize> {
    let problems = store.list_keys(bucket).await?;
    debug!(bucket, count = problems.len(), "Problems to run");
    self.run_problems(&problems, ledger).await
  }
}

fn pretty(result: &ExecutionResult) -> String {
  serde_json::to_string_pretty(result).unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{DriverOutcome, SolverOutcome, TaskState, TaskStatus};
  use serde_json::json;

  fn result_for(uri: &str, answer: &str) -> ExecutionResult {
    ExecutionResult {
      task_id: "t".into(),
      driver: DriverOutcome {
        stdout: "o".into(),
        stderr: "e".into(),
        return_code: 0,
        solver_runtime_millis: 1,
        timed_out: false,
        s3_uri: Some(uri.into()),
      },
      solver: SolverOutcome { output: Some(json!({"result": answer})), request_directory_path: "/tmp/t".into() },
      task_state: TaskState { status: TaskStatus::Success, message: None },
    }
  }

  #[tokio::test]
  async fn ledger_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.json");

    let mut ledger = ResultsLedger::load(&path, false).await.unwrap();
    assert!(ledger.is_empty());
    ledger.record("a.cnf", result_for("s3://p/a.cnf", "SATISFIABLE"));
    ledger.persist().await.unwrap();

    let reloaded = ResultsLedger::load(&path, false).await.unwrap();
    assert_eq!(reloaded, ledger);
    assert!(ResultsLedger::load(&path, true).await.unwrap().is_empty());
  }

  #[test]
  fn template_builds_full_descriptor() {
    let template = TaskTemplate {
      language: "DIMACS".into(),
      solver_name: "kissat".into(),
      solver_options: vec!["-q".into()],
      timeout_secs: 1000,
      num_workers: 3,
    };
    let body = serde_json::to_string(&template.descriptor_for("s3://p/a.cnf")).unwrap();
    let parsed = TaskDescriptor::parse(&body).unwrap();
    assert_eq!(parsed.formula.value, "s3://p/a.cnf");
    assert_eq!(parsed.num_workers, 3);
    assert_eq!(parsed.solver_config.task_timeout_seconds, 1000);
  }
}

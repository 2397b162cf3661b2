//! Solver capability and its process-shelling implementation.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};
use crate::error::Result;
use crate::models::{DriverOutcome, ExecutionResult, SolverOutcome, TaskState, TaskStatus};
use crate::process::ProcessSupervisor;

pub const STDOUT_LOG: &str = "base_container_stdout.log";
pub const STDERR_LOG: &str = "base_container_stderr.log";
pub const INPUT_FILE: &str = "input.json";
pub const OUTPUT_FILE: &str = "solver_out.json";
pub const MISSING_RESULT_MESSAGE: &str = "Error retrieving solver result";

#[derive(Debug, Clone, PartialEq)]
pub struct SolveRequest {
  pub task_id: String,
  pub formula_file: PathBuf,
  pub formula_language: String,
  pub request_directory: PathBuf,
  pub worker_addresses: Vec<String>,
  pub solver_options: Vec<String>,
  pub timeout: Duration,
}

#[async_trait]
pub trait Solver: Send + Sync {
  async fn solve(&self, request: &SolveRequest) -> Result<ExecutionResult>;
}

#[derive(Serialize)]
struct SolverInput<'a> {
  formula_file: String,
  worker_node_ips: &'a [String],
  formula_language: &'a str,
  solver_argument_list: &'a [String],
  timeout_seconds: u64,
}

/// Runs `<command...> <request directory>` and collects `solver_out.json`.
pub struct CommandLineSolver {
  command: Vec<String>,
  supervisor: ProcessSupervisor,
}

impl CommandLineSolver {
  pub fn new(command: Vec<String>) -> Self {
    Self { command, supervisor: ProcessSupervisor::new(STDOUT_LOG, STDERR_LOG) }
  }

  pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
    self.supervisor = supervisor;
    self
  }

  async fn save_input(&self, request: &SolveRequest) -> Result<()> {
    let input = SolverInput {
      formula_file: request.formula_file.display().to_string(),
      worker_node_ips: &request.worker_addresses,
      formula_language: &request.formula_language,
      solver_argument_list: &request.solver_options,
      timeout_seconds: request.timeout.as_secs(),
    };
    tokio::fs::write(request.request_directory.join(INPUT_FILE), serde_json::to_vec(&input)?).await?;
    Ok(())
  }
}

/// The solver's own answer; absent or malformed output is not an error.
pub async fn read_solver_output(request_directory: &Path) -> Option<Value> {
  let path = request_directory.join(OUTPUT_FILE);
  let raw = match tokio::fs::read(&path).await {
    Ok(raw) => raw,
    Err(e) => {
      error!(path = %path.display(), error = %e, "Solver did not generate output JSON");
      return None;
    }
  };
  match serde_json::from_slice(&raw) {
    Ok(value) => Some(value),
    Err(e) => {
      error!(path = %path.display(), error = %e, "Solver output not valid json");
      None
    }
  }
}

pub fn task_state_for(output: &Option<Value>) -> TaskState {
  match output {
    Some(_) => TaskState { status: TaskStatus::Success, message: None },
    None => TaskState { status: TaskStatus::Failed, message: Some(MISSING_RESULT_MESSAGE.into()) },
  }
}

#[async_trait]
impl Solver for CommandLineSolver {
  async fn solve(&self, request: &SolveRequest) -> Result<ExecutionResult> {
    self.save_input(request).await?;

    let mut command = self.command.clone();
    command.push(request.request_directory.display().to_string());
    let outcome = self.supervisor.run(&command, &request.request_directory, request.timeout).await?;

    let output = read_solver_output(&request.request_directory).await;
    info!(task_id = %request.task_id, output = ?output, "Solver finished");
    let task_state = task_state_for(&output);

    Ok(ExecutionResult {
      task_id: request.task_id.clone(),
      driver: DriverOutcome {
        stdout: outcome.stdout.display().to_string(),
        stderr: outcome.stderr.display().to_string(),
        return_code: outcome.return_code,
        solver_runtime_millis: outcome.elapsed.as_millis() as u64,
        timed_out: outcome.timed_out,
        s3_uri: None,
      },
      solver: SolverOutcome {
        output,
        request_directory_path: request.request_directory.display().to_string(),
      },
      task_state,
    })
  }
}

/// Solver that answers every request with the next scripted output and
/// remembers what it was asked.
pub struct ScriptedSolver {
  outputs: Mutex<Vec<Option<Value>>>,
  requests: Mutex<Vec<SolveRequest>>,
}

impl ScriptedSolver {
  pub fn new(outputs: Vec<Option<Value>>) -> Arc<Self> {
    Arc::new(Self { outputs: Mutex::new(outputs), requests: Mutex::new(Vec::new()) })
  }

  pub async fn requests(&self) -> Vec<SolveRequest> {
    self.requests.lock().await.clone()
  }
}

#[async_trait]
impl Solver for ScriptedSolver {
  async fn solve(&self, request: &SolveRequest) -> Result<ExecutionResult> {
    self.requests.lock().await.push(request.clone());
    let output = {
      let mut outputs = self.outputs.lock().await;
      if outputs.is_empty() { None } else { outputs.remove(0) }
    };
    let task_state = task_state_for(&output);
    let directory = request.request_directory.display().to_string();
    Ok(ExecutionResult {
      task_id: request.task_id.clone(),
      driver: DriverOutcome {
        stdout: format!("{}/{}", directory, STDOUT_LOG),
        stderr: format!("{}/{}", directory, STDERR_LOG),
        return_code: 0,
        solver_runtime_millis: 0,
        timed_out: false,
        s3_uri: None,
      },
      solver: SolverOutcome { output, request_directory_path: directory },
      task_state,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn request(dir: &Path) -> SolveRequest {
    SolveRequest {
      task_id: "task-1".into(),
      formula_file: dir.join("test.cnf"),
      formula_language: "DIMACS".into(),
      request_directory: dir.to_path_buf(),
      worker_addresses: vec!["10.0.0.2".into(), "10.0.0.1".into()],
      solver_options: vec!["--fast".into()],
      timeout: Duration::from_secs(10),
    }
  }

  fn script(dir: &Path, body: &str) -> Vec<String> {
    let path = dir.join("solver.sh");
    std::fs::write(&path, body).unwrap();
    vec!["sh".into(), path.display().to_string()]
  }

  #[tokio::test]
  async fn writes_input_and_reads_output() {
    let scripts = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let solver = CommandLineSolver::new(script(
      scripts.path(),
      "cat \"$1/input.json\"\necho '{\"result\": \"SATISFIABLE\"}' > \"$1/solver_out.json\"\n",
    ));

    let result = solver.solve(&request(work.path())).await.unwrap();
    assert_eq!(result.task_id, "task-1");
    assert_eq!(result.driver.return_code, 0);
    assert!(!result.driver.timed_out);
    assert_eq!(result.solver.output, Some(json!({"result": "SATISFIABLE"})));
    assert_eq!(result.task_state.status, TaskStatus::Success);

    let stdout = std::fs::read_to_string(&result.driver.stdout).unwrap();
    let input: Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(input["worker_node_ips"], json!(["10.0.0.2", "10.0.0.1"]));
    assert_eq!(input["solver_argument_list"], json!(["--fast"]));
    assert_eq!(input["timeout_seconds"], json!(10));
    assert_eq!(input["formula_language"], json!("DIMACS"));
  }

  #[tokio::test]
  async fn missing_output_marks_task_failed() {
    let scripts = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let solver = CommandLineSolver::new(script(scripts.path(), "echo nothing to report\n"));

    let result = solver.solve(&request(work.path())).await.unwrap();
    assert_eq!(result.solver.output, None);
    assert_eq!(result.task_state.status, TaskStatus::Failed);
    assert_eq!(result.task_state.message.as_deref(), Some(MISSING_RESULT_MESSAGE));
  }

  #[tokio::test]
  async fn malformed_output_is_not_fatal() {
    let scripts = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let solver = CommandLineSolver::new(script(scripts.path(), "echo '{not json' > \"$1/solver_out.json\"\n"));

    let result = solver.solve(&request(work.path())).await.unwrap();
    assert_eq!(result.solver.output, None);
    assert_eq!(result.task_state.status, TaskStatus::Failed);
  }

  #[tokio::test]
  async fn scripted_solver_records_requests() {
    let work = tempfile::tempdir().unwrap();
    let solver = ScriptedSolver::new(vec![Some(json!({"result": "UNKNOWN"}))]);
    let first = solver.solve(&request(work.path())).await.unwrap();
    let second = solver.solve(&request(work.path())).await.unwrap();
    assert_eq!(first.solver.output, Some(json!({"result": "UNKNOWN"})));
    assert_eq!(second.solver.output, None);
    assert_eq!(solver.requests().await.len(), 2);
  }
}

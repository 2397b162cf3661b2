use serde::{Serialize, Deserialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use crate::error::DispatchError;

pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeRole {
  Leader,
  Worker,
}

impl NodeRole {
  pub fn as_str(&self) -> &'static str {
    match self {
      NodeRole::Leader => "LEADER",
      NodeRole::Worker => "WORKER",
    }
  }
}

impl fmt::Display for NodeRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for NodeRole {
  type Err = DispatchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "LEADER" => Ok(NodeRole::Leader),
      "WORKER" => Ok(NodeRole::Worker),
      other => Err(DispatchError::InvalidTask(format!("unknown node role '{}'", other))),
    }
  }
}

pub const STATUS_READY: &str = "READY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
  #[serde(rename = "nodeId")]
  pub node_id: String,
  #[serde(rename = "nodeIp")]
  pub ip_address: String,
  #[serde(rename = "nodeType")]
  pub role: NodeRole,
  pub status: String,
  #[serde(rename = "lastModified")]
  pub last_heartbeat: i64,
}

impl NodeRecord {
  pub fn is_live(&self, now: i64, expiration_secs: i64) -> bool {
    now - self.last_heartbeat <= expiration_secs
  }

  pub fn is_ready(&self) -> bool {
    self.status == STATUS_READY
  }
}

/// Contents of the status file a participant worker script keeps fresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalStatusReport {
  pub status: String,
  pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
  pub value: String,
  pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverConfig {
  pub solver_name: String,
  pub solver_options: Vec<String>,
  pub task_timeout_seconds: u64,
}

/// Inbound task message. Every field is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
  pub formula: Formula,
  #[serde(rename = "solverConfig")]
  pub solver_config: SolverConfig,
  pub num_workers: usize,
}

impl TaskDescriptor {
  pub fn parse(body: &str) -> Result<Self, DispatchError> {
    let descriptor: TaskDescriptor = serde_json::from_str(body)
      .map_err(|e| DispatchError::InvalidTask(e.to_string()))?;
    if descriptor.formula.value.trim().is_empty() {
      return Err(DispatchError::InvalidTask("formula.value is empty".into()));
    }
    Ok(descriptor)
  }

  /// A timeout of zero means "use the default".
  pub fn timeout_secs(&self) -> u64 {
    match self.solver_config.task_timeout_seconds {
      0 => DEFAULT_TASK_TIMEOUT_SECS,
      secs => secs,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverOutcome {
  pub stdout: String,
  pub stderr: String,
  pub return_code: i32,
  pub solver_runtime_millis: u64,
  #[serde(default)]
  pub timed_out: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub s3_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOutcome {
  pub output: Option<Value>,
  pub request_directory_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
  Success,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
  pub status: TaskStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

/// Normalised answer extracted from `solver.output.result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  Satisfiable,
  Unsatisfiable,
  Inconclusive,
}

impl Verdict {
  pub fn is_conclusive(&self) -> bool {
    !matches!(self, Verdict::Inconclusive)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
  pub task_id: String,
  pub driver: DriverOutcome,
  pub solver: SolverOutcome,
  pub task_state: TaskState,
}

impl ExecutionResult {
  pub fn verdict(&self) -> Verdict {
    let result = self.solver.output
      .as_ref()
      .and_then(|output| output.get("result"))
      .and_then(|v| v.as_str())
      .map(|s| s.trim().to_lowercase());
    match result.as_deref() {
      Some("satisfiable") => Verdict::Satisfiable,
      Some("unsatisfiable") => Verdict::Unsatisfiable,
      _ => Verdict::Inconclusive,
    }
  }
}

/// Completion marker written by the leader, keyed by its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationToken {
  #[serde(rename = "leaderIp")]
  pub leader: String,
  #[serde(rename = "notificationId")]
  pub token: String,
  #[serde(rename = "lastModified")]
  pub timestamp: i64,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn valid_message() -> Value {
    json!({
      "formula": {"value": "s3://problems/test.cnf", "language": "DIMACS"},
      "solverConfig": {"solverName": "", "solverOptions": ["-v"], "taskTimeoutSeconds": 10},
      "num_workers": 2
    })
  }

  #[test]
  fn accepts_complete_descriptor() {
    let descriptor = TaskDescriptor::parse(&valid_message().to_string()).unwrap();
    assert_eq!(descriptor.formula.value, "s3://problems/test.cnf");
    assert_eq!(descriptor.solver_config.solver_options, vec!["-v".to_string()]);
    assert_eq!(descriptor.num_workers, 2);
    assert_eq!(descriptor.timeout_secs(), 10);
  }

  #[test]
  fn rejects_any_single_missing_field() {
    let paths: [&[&str]; 7] = [
      &["formula"],
      &["formula", "value"],
      &["formula", "language"],
      &["solverConfig", "solverName"],
      &["solverConfig", "solverOptions"],
      &["solverConfig", "taskTimeoutSeconds"],
      &["num_workers"],
    ];
    for path in paths {
      let mut message = valid_message();
      let mut cursor = &mut message;
      for key in &path[..path.len() - 1] {
        cursor = cursor.get_mut(*key).unwrap();
      }
      cursor.as_object_mut().unwrap().remove(path[path.len() - 1]);
      let parsed = TaskDescriptor::parse(&message.to_string());
      assert!(matches!(parsed, Err(DispatchError::InvalidTask(_))), "accepted without {:?}", path);
    }
    let mut message = valid_message();
    message.as_object_mut().unwrap().remove("solverConfig");
    assert!(TaskDescriptor::parse(&message.to_string()).is_err());
  }

  #[test]
  fn rejects_non_json() {
    assert!(TaskDescriptor::parse("not json").is_err());
  }

  #[test]
  fn zero_timeout_uses_default() {
    let mut message = valid_message();
    message["solverConfig"]["taskTimeoutSeconds"] = json!(0);
    let descriptor = TaskDescriptor::parse(&message.to_string()).unwrap();
    assert_eq!(descriptor.timeout_secs(), DEFAULT_TASK_TIMEOUT_SECS);
  }

  #[test]
  fn liveness_window_is_inclusive() {
    let record = NodeRecord {
      node_id: "n1".into(),
      ip_address: "10.0.0.1".into(),
      role: NodeRole::Worker,
      status: STATUS_READY.into(),
      last_heartbeat: 1_000,
    };
    assert!(record.is_live(1_000, 120));
    assert!(record.is_live(1_120, 120));
    assert!(!record.is_live(1_121, 120));
  }

  #[test]
  fn verdict_is_case_insensitive() {
    let mut result = ExecutionResult {
      task_id: "t".into(),
      driver: DriverOutcome {
        stdout: "out".into(),
        stderr: "err".into(),
        return_code: 0,
        solver_runtime_millis: 5,
        timed_out: false,
        s3_uri: None,
      },
      solver: SolverOutcome { output: Some(json!({"result": "UNSATISFIABLE"})), request_directory_path: "/tmp/t".into() },
      task_state: TaskState { status: TaskStatus::Success, message: None },
    };
    assert_eq!(result.verdict(), Verdict::Unsatisfiable);
    result.solver.output = Some(json!({"result": "UNKNOWN"}));
    assert_eq!(result.verdict(), Verdict::Inconclusive);
    result.solver.output = None;
    assert_eq!(result.verdict(), Verdict::Inconclusive);
  }

  #[test]
  fn result_wire_format() {
    let result = ExecutionResult {
      task_id: "abc".into(),
      driver: DriverOutcome {
        stdout: "/tmp/abc/base_container_stdout.log".into(),
        stderr: "/tmp/abc/base_container_stderr.log".into(),
        return_code: -100,
        solver_runtime_millis: 5000,
        timed_out: true,
        s3_uri: Some("s3://problems/x.cnf".into()),
      },
      solver: SolverOutcome { output: None, request_directory_path: "/tmp/abc".into() },
      task_state: TaskState { status: TaskStatus::Failed, message: Some("Error retrieving solver result".into()) },
    };
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["driver"]["return_code"], json!(-100));
    assert_eq!(value["driver"]["s3_uri"], json!("s3://problems/x.cnf"));
    assert_eq!(value["solver"]["output"], Value::Null);
    assert_eq!(value["task_state"]["status"], json!("FAILED"));
  }
}

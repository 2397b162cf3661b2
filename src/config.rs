use anyhow::{Context, Result, anyhow};
use std::env;
use std::net::UdpSocket;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub inbound_queue: String,
  pub outbound_queue: String,
  pub artifact_bucket: String,
  pub object_store_root: PathBuf,
  pub competition_dir: PathBuf,
  pub work_root: PathBuf,
  pub solver_command: Vec<String>,
  pub node_ip: String,
  pub node_expiration_secs: i64,
  pub notification_expiration_secs: i64,
  pub worker_status_staleness_secs: i64,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let required = |key: &str| lookup(key).ok_or_else(|| anyhow!("{} must be set", key));
    let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());
    let number = |key: &str, default: i64| -> Result<i64> {
      match lookup(key) {
        Some(raw) => raw.parse().with_context(|| format!("{} is not a number: {}", key, raw)),
        None => Ok(default),
      }
    };

    let competition_dir = PathBuf::from(or_default("COMPETITION_DIR", "/competition"));
    let solver_command = match lookup("SOLVER_COMMAND") {
      Some(raw) => raw.split_whitespace().map(String::from).collect(),
      None => vec![competition_dir.join("solver").display().to_string()],
    };
    if solver_command.is_empty() {
      return Err(anyhow!("SOLVER_COMMAND must not be empty"));
    }

    Ok(Self {
      database_url: required("DATABASE_URL")?,
      rabbitmq_url: required("RABBITMQ_URL")?,
      server_port: lookup("SERVER_PORT")
        .and_then(|port| port.parse().ok())
        .unwrap_or(8080),
      inbound_queue: or_default("INBOUND_QUEUE", "satcomp_problems"),
      outbound_queue: or_default("OUTBOUND_QUEUE", "satcomp_results"),
      artifact_bucket: required("ARTIFACT_BUCKET")?,
      object_store_root: PathBuf::from(or_default("OBJECT_STORE_ROOT", "/mnt/object-store")),
      work_root: PathBuf::from(or_default("WORK_ROOT", "/tmp")),
      competition_dir,
      solver_command,
      node_ip: lookup("NODE_IP").unwrap_or_else(detect_local_address),
      node_expiration_secs: number("NODE_EXPIRATION_SECS", 120)?,
      notification_expiration_secs: number("NOTIFICATION_EXPIRATION_SECS", 5)?,
      worker_status_staleness_secs: number("WORKER_STATUS_STALENESS_SECS", 5)?,
    })
  }
}

/// Address of the interface that routes outward. Connecting a UDP socket sends
/// no packets.
pub fn detect_local_address() -> String {
  UdpSocket::bind("0.0.0.0:0")
    .and_then(|socket| {
      socket.connect("8.8.8.8:80")?;
      socket.local_addr()
    })
    .map(|addr| addr.ip().to_string())
    .unwrap_or_else(|_| "127.0.0.1".into())
}

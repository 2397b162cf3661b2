//! Periodic liveness writes into the node registry.
//!
//! Leaders report a fixed status. Workers relay the status their participant
//! script writes to a local file; a status file that stops moving means the
//! worker is wedged, and the publisher gives up so the node gets restarted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::clock::{Clock, sleep_or_shutdown};
use crate::error::{DispatchError, Result};
use crate::models::{LocalStatusReport, NodeRole, STATUS_READY};
use crate::registry::NodeRegistry;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const WORKER_STATUS_FILE: &str = "worker_node_status.json";

#[derive(Debug, Clone)]
pub enum StatusSource {
  Fixed(String),
  File(PathBuf),
}

impl StatusSource {
  pub fn ready() -> Self {
    StatusSource::Fixed(STATUS_READY.into())
  }
}

pub struct HeartbeatPublisher {
  registry: Arc<dyn NodeRegistry>,
  clock: Arc<dyn Clock>,
  node_id: String,
  address: String,
  role: NodeRole,
  source: StatusSource,
  staleness_secs: i64,
  interval: Duration,
}

impl HeartbeatPublisher {
  /// A publisher with a node id unique to this process.
  pub fn new(
    registry: Arc<dyn NodeRegistry>,
    clock: Arc<dyn Clock>,
    address: &str,
    role: NodeRole,
    source: StatusSource,
    staleness_secs: i64,
  ) -> Self {
    Self {
      registry,
      clock,
      node_id: Uuid::new_v4().to_string(),
      address: address.to_string(),
      role,
      source,
      staleness_secs,
      interval: HEARTBEAT_INTERVAL,
    }
  }

  pub fn node_id(&self) -> &str {
    &self.node_id
  }

  /// `Ok(None)` when the status file is missing or unreadable this tick.
  async fn current_status(&self) -> Result<Option<String>> {
    let path = match &self.source {
      StatusSource::Fixed(status) => return Ok(Some(status.clone())),
      StatusSource::File(path) => path,
    };
    let raw = match tokio::fs::read(path).await {
      Ok(raw) => raw,
      Err(e) => {
        error!(path = %path.display(), error = %e, "Worker status file is not generated");
        return Ok(None);
      }
    };
    let report: LocalStatusReport = match serde_json::from_slice(&raw) {
      Ok(report) => report,
      Err(e) => {
        error!(path = %path.display(), error = %e, "Worker status file is not valid JSON");
        return Ok(None);
      }
    };
    let age_secs = self.clock.now() - report.timestamp;
    debug!(status = %report.status, age_secs, "Read worker status");
    if age_secs > self.staleness_secs {
      return Err(DispatchError::StaleWorkerStatus { age_secs });
    }
    Ok(Some(report.status))
  }

  /// One heartbeat. Only a stale status report or a registry failure is an
  /// error.
  pub async fn tick(&self) -> Result<()> {
    let Some(status) = self.current_status().await? else {
      return Ok(());
    };
    self.registry.heartbeat(&self.node_id, &self.address, &status, self.role).await?;
    debug!(node_id = %self.node_id, address = %self.address, status = %status, "Heartbeat written");
    Ok(())
  }

  /// Runs until shutdown. Returns an error only for a fatal liveness
  /// violation.
  pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    info!(node_id = %self.node_id, address = %self.address, role = %self.role, "Starting heartbeat loop");
    let mut consecutive_failures = 0u32;
    loop {
      match self.tick().await {
        Ok(()) => consecutive_failures = 0,
        Err(e) if e.is_fatal() => {
          error!(node_id = %self.node_id, error = %e, "Liveness violation, stopping heartbeats");
          return Err(e);
        }
        Err(e) => {
          consecutive_failures += 1;
          if consecutive_failures <= 3 {
            warn!(error = %e, consecutive_failures, "Heartbeat failed");
          } else {
            error!(error = %e, consecutive_failures, "Heartbeat failed repeatedly");
          }
        }
      }
      if sleep_or_shutdown(self.clock.as_ref(), self.interval, &mut shutdown).await {
        info!("Heartbeat loop shutting down");
        return Ok(());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::registry::InMemoryNodeRegistry;

  fn write_status(path: &std::path::Path, status: &str, timestamp: i64) {
    let report = LocalStatusReport { status: status.into(), timestamp };
    std::fs::write(path, serde_json::to_vec(&report).unwrap()).unwrap();
  }

  #[tokio::test]
  async fn leader_reports_ready() {
    let clock = Arc::new(ManualClock::starting_at(5_000));
    let registry = Arc::new(InMemoryNodeRegistry::new(clock.clone()));
    let publisher = HeartbeatPublisher::new(registry.clone(), clock, "10.0.0.1", NodeRole::Leader, StatusSource::ready(), 5);

    publisher.tick().await.unwrap();
    let record = registry.get(publisher.node_id()).await.unwrap();
    assert_eq!(record.role, NodeRole::Leader);
    assert_eq!(record.status, STATUS_READY);
    assert_eq!(record.last_heartbeat, 5_000);
  }

  #[tokio::test]
  async fn worker_relays_status_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(WORKER_STATUS_FILE);
    write_status(&path, "BUSY", 4_998);

    let clock = Arc::new(ManualClock::starting_at(5_000));
    let registry = Arc::new(InMemoryNodeRegistry::new(clock.clone()));
    let publisher = HeartbeatPublisher::new(registry.clone(), clock, "10.0.0.2", NodeRole::Worker, StatusSource::File(path), 5);

    publisher.tick().await.unwrap();
    assert_eq!(registry.get(publisher.node_id()).await.unwrap().status, "BUSY");
  }

  #[tokio::test]
  async fn missing_or_garbled_file_skips_the_tick() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(WORKER_STATUS_FILE);
    let clock = Arc::new(ManualClock::starting_at(5_000));
    let registry = Arc::new(InMemoryNodeRegistry::new(clock.clone()));
    let publisher = HeartbeatPublisher::new(registry.clone(), clock, "10.0.0.2", NodeRole::Worker, StatusSource::File(path.clone()), 5);

    publisher.tick().await.unwrap();
    std::fs::write(&path, "{\"status\":").unwrap();
    publisher.tick().await.unwrap();
    assert!(registry.get(publisher.node_id()).await.is_none());
  }

  #[tokio::test]
  async fn stale_status_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(WORKER_STATUS_FILE);
    write_status(&path, "READY", 4_000);

    let clock = Arc::new(ManualClock::starting_at(5_000));
    let registry = Arc::new(InMemoryNodeRegistry::new(clock.clone()));
    let publisher = HeartbeatPublisher::new(registry.clone(), clock, "10.0.0.2", NodeRole::Worker, StatusSource::File(path), 5);

    let (_tx, rx) = watch::channel(false);
    let err = publisher.run(rx).await.unwrap_err();
    assert!(matches!(err, DispatchError::StaleWorkerStatus { age_secs: 1_000 }));
  }

  #[tokio::test]
  async fn run_stops_on_shutdown() {
    let clock = Arc::new(ManualClock::starting_at(5_000));
    let registry = Arc::new(InMemoryNodeRegistry::new(clock.clone()));
    let publisher = HeartbeatPublisher::new(registry, clock, "10.0.0.1", NodeRole::Leader, StatusSource::ready(), 5);
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    publisher.run(rx).await.unwrap();
  }
}

//! Shared record of which nodes are alive.
//!
//! Each node upserts only its own row, so writers never contend. Liveness is
//! decided at read time from the heartbeat timestamp; rows are never deleted.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use crate::clock::Clock;
use crate::error::{DispatchError, Result};
use crate::models::{NodeRecord, NodeRole};

#[async_trait]
pub trait NodeRegistry: Send + Sync {
  /// Idempotent upsert of this node's record, stamped with the current time.
  async fn heartbeat(&self, node_id: &str, ip_address: &str, status: &str, role: NodeRole) -> Result<()>;

  /// Records of `role` heard from within the last `within_secs` seconds.
  async fn list_live(&self, role: NodeRole, within_secs: i64) -> Result<Vec<NodeRecord>>;
}

pub struct PgNodeRegistry {
  pool: PgPool,
  clock: Arc<dyn Clock>,
}

impl PgNodeRegistry {
  pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
    Self { pool, clock }
  }
}

fn unavailable(e: sqlx::Error) -> DispatchError {
  DispatchError::RegistryUnavailable(e.to_string())
}

#[async_trait]
impl NodeRegistry for PgNodeRegistry {
  async fn heartbeat(&self, node_id: &str, ip_address: &str, status: &str, role: NodeRole) -> Result<()> {
    sqlx::query(
      "INSERT INTO node_registry (node_id, ip_address, role, status, last_heartbeat)
       VALUES ($1, $2, $3, $4, $5)
       ON CONFLICT (node_id) DO UPDATE
       SET ip_address = EXCLUDED.ip_address, role = EXCLUDED.role,
           status = EXCLUDED.status, last_heartbeat = EXCLUDED.last_heartbeat",
    )
      .bind(node_id)
      .bind(ip_address)
      .bind(role.as_str())
      .bind(status)
      .bind(self.clock.now())
      .execute(&self.pool)
      .await
      .map_err(unavailable)?;
    Ok(())
  }

  async fn list_live(&self, role: NodeRole, within_secs: i64) -> Result<Vec<NodeRecord>> {
    let cutoff = self.clock.now() - within_secs;
    let rows = sqlx::query(
      "SELECT node_id, ip_address, role, status, last_heartbeat
       FROM node_registry
       WHERE role = $1 AND last_heartbeat >= $2
       ORDER BY last_heartbeat DESC",
    )
      .bind(role.as_str())
      .bind(cutoff)
      .fetch_all(&self.pool)
      .await
      .map_err(unavailable)?;

    rows.into_iter()
      .map(|row| {
        let role: String = row.try_get("role").map_err(unavailable)?;
        Ok(NodeRecord {
          node_id: row.try_get("node_id").map_err(unavailable)?,
          ip_address: row.try_get("ip_address").map_err(unavailable)?,
          role: role.parse()?,
          status: row.try_get("status").map_err(unavailable)?,
          last_heartbeat: row.try_get("last_heartbeat").map_err(unavailable)?,
        })
      })
      .collect()
  }
}

/// Registry held in process memory.
pub struct InMemoryNodeRegistry {
  records: Mutex<HashMap<String, NodeRecord>>,
  clock: Arc<dyn Clock>,
}

impl InMemoryNodeRegistry {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self { records: Mutex::new(HashMap::new()), clock }
  }

  /// Inserts a record verbatim, bypassing the clock.
  pub async fn insert(&self, record: NodeRecord) {
    self.records.lock().await.insert(record.node_id.clone(), record);
  }

  pub async fn get(&self, node_id: &str) -> Option<NodeRecord> {
    self.records.lock().await.get(node_id).cloned()
  }
}

#[async_trait]
impl NodeRegistry for InMemoryNodeRegistry {
  async fn heartbeat(&self, node_id: &str, ip_address: &str, status: &str, role: NodeRole) -> Result<()> {
    let record = NodeRecord {
      node_id: node_id.to_string(),
      ip_address: ip_address.to_string(),
      role,
      status: status.to_string(),
      last_heartbeat: self.clock.now(),
    };
    self.records.lock().await.insert(node_id.to_string(), record);
    Ok(())
  }

  async fn list_live(&self, role: NodeRole, within_secs: i64) -> Result<Vec<NodeRecord>> {
    let now = self.clock.now();
    let mut live: Vec<NodeRecord> = self.records.lock().await
      .values()
      .filter(|record| record.role == role && record.is_live(now, within_secs))
      .cloned()
      .collect();
    live.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat).then_with(|| a.node_id.cmp(&b.node_id)));
    Ok(live)
  }
}

pub const LEADER_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const LEADER_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Polls until a live leader is registered and returns the most recently
/// heard-from one.
pub async fn wait_for_leader(
  registry: &dyn NodeRegistry,
  clock: &dyn Clock,
  within_secs: i64,
  bound: Duration,
) -> Result<NodeRecord> {
  let started = clock.now();
  loop {
    if let Some(leader) = registry.list_live(NodeRole::Leader, within_secs).await?.into_iter().next() {
      info!(leader = %leader.ip_address, node_id = %leader.node_id, "Found leader node");
      return Ok(leader);
    }
    if clock.now() - started >= bound.as_secs() as i64 {
      return Err(DispatchError::LeaderWaitTimeout { seconds: bound.as_secs() });
    }
    info!("Waiting for leader node to register");
    clock.sleep(LEADER_POLL_INTERVAL).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::models::STATUS_READY;

  #[tokio::test]
  async fn fresh_heartbeat_is_visible_immediately() {
    let clock = Arc::new(ManualClock::starting_at(10_000));
    let registry = InMemoryNodeRegistry::new(clock.clone());
    registry.heartbeat("w1", "10.0.0.2", STATUS_READY, NodeRole::Worker).await.unwrap();

    let live = registry.list_live(NodeRole::Worker, 120).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].ip_address, "10.0.0.2");
    assert_eq!(live[0].last_heartbeat, 10_000);
    assert!(registry.list_live(NodeRole::Leader, 120).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn expired_records_are_excluded_not_deleted() {
    let clock = Arc::new(ManualClock::starting_at(10_000));
    let registry = InMemoryNodeRegistry::new(clock.clone());
    registry.heartbeat("w1", "10.0.0.2", STATUS_READY, NodeRole::Worker).await.unwrap();

    clock.advance(std::time::Duration::from_secs(121));
    assert!(registry.list_live(NodeRole::Worker, 120).await.unwrap().is_empty());
    assert!(registry.get("w1").await.is_some());

    registry.heartbeat("w1", "10.0.0.2", "BUSY", NodeRole::Worker).await.unwrap();
    let live = registry.list_live(NodeRole::Worker, 120).await.unwrap();
    assert_eq!(live[0].status, "BUSY");
  }

  #[tokio::test]
  async fn upsert_keeps_one_record_per_node() {
    let clock = Arc::new(ManualClock::starting_at(50));
    let registry = InMemoryNodeRegistry::new(clock);
    for status in ["READY", "BUSY", "READY"] {
      registry.heartbeat("w1", "10.0.0.2", status, NodeRole::Worker).await.unwrap();
    }
    assert_eq!(registry.list_live(NodeRole::Worker, 5).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn wait_for_leader_picks_most_recent() {
    let clock = Arc::new(ManualClock::starting_at(1_000));
    let registry = InMemoryNodeRegistry::new(clock.clone());
    registry.heartbeat("l-old", "10.0.0.1", STATUS_READY, NodeRole::Leader).await.unwrap();
    clock.advance(Duration::from_secs(3));
    registry.heartbeat("l-new", "10.0.0.9", STATUS_READY, NodeRole::Leader).await.unwrap();

    let leader = wait_for_leader(&registry, clock.as_ref(), 120, LEADER_WAIT_TIMEOUT).await.unwrap();
    assert_eq!(leader.node_id, "l-new");
  }

  #[tokio::test]
  async fn wait_for_leader_gives_up_after_bound() {
    let clock = Arc::new(ManualClock::starting_at(1_000));
    let registry = InMemoryNodeRegistry::new(clock.clone());
    let err = wait_for_leader(&registry, clock.as_ref(), 120, Duration::from_secs(10)).await.unwrap_err();
    assert!(matches!(err, DispatchError::LeaderWaitTimeout { seconds: 10 }));
    assert_eq!(clock.now(), 1_010);
  }
}

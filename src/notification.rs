//! Task-end side channel between a leader and its workers.
//!
//! The leader overwrites a fresh token under its address after each task.
//! Workers poll for a recent token different from the last one they acted
//! on, then fire their cleanup command.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{error, info};
use uuid::Uuid;
use crate::clock::{Clock, sleep_or_shutdown};
use crate::error::{DispatchError, Result};
use crate::models::NotificationToken;
use crate::process::ProcessSupervisor;

pub const WATCH_INTERVAL: Duration = Duration::from_millis(500);
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait NotificationStore: Send + Sync {
  async fn write(&self, key: &str, token: &str, timestamp: i64) -> Result<()>;

  /// Records stamped after `cutoff` whose token is not `excluded`.
  async fn scan(&self, cutoff: i64, excluded: Option<&str>) -> Result<Vec<NotificationToken>>;
}

pub struct PgNotificationStore {
  pool: PgPool,
}

impl PgNotificationStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

fn unavailable(e: sqlx::Error) -> DispatchError {
  DispatchError::RegistryUnavailable(e.to_string())
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
  async fn write(&self, key: &str, token: &str, timestamp: i64) -> Result<()> {
    sqlx::query(
      "INSERT INTO task_end_notifications (leader_ip, notification_id, last_modified)
       VALUES ($1, $2, $3)
       ON CONFLICT (leader_ip) DO UPDATE
       SET notification_id = EXCLUDED.notification_id, last_modified = EXCLUDED.last_modified",
    )
      .bind(key)
      .bind(token)
      .bind(timestamp)
      .execute(&self.pool)
      .await
      .map_err(unavailable)?;
    Ok(())
  }

  async fn scan(&self, cutoff: i64, excluded: Option<&str>) -> Result<Vec<NotificationToken>> {
    let rows = sqlx::query(
      "SELECT leader_ip, notification_id, last_modified
       FROM task_end_notifications
       WHERE last_modified > $1 AND ($2::TEXT IS NULL OR notification_id <> $2)
       ORDER BY last_modified DESC",
    )
      .bind(cutoff)
      .bind(excluded)
      .fetch_all(&self.pool)
      .await
      .map_err(unavailable)?;

    rows.into_iter()
      .map(|row| {
        Ok(NotificationToken {
          leader: row.try_get("leader_ip").map_err(unavailable)?,
          token: row.try_get("notification_id").map_err(unavailable)?,
          timestamp: row.try_get("last_modified").map_err(unavailable)?,
        })
      })
      .collect()
  }
}

#[derive(Default)]
pub struct InMemoryNotificationStore {
  records: Mutex<HashMap<String, NotificationToken>>,
}

impl InMemoryNotificationStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
  async fn write(&self, key: &str, token: &str, timestamp: i64) -> Result<()> {
    self.records.lock().await.insert(key.to_string(), NotificationToken {
      leader: key.to_string(),
      token: token.to_string(),
      timestamp,
    });
    Ok(())
  }

  async fn scan(&self, cutoff: i64, excluded: Option<&str>) -> Result<Vec<NotificationToken>> {
    let mut found: Vec<NotificationToken> = self.records.lock().await
      .values()
      .filter(|record| record.timestamp > cutoff && excluded != Some(record.token.as_str()))
      .cloned()
      .collect();
    found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(found)
  }
}

#[derive(Clone)]
pub struct CompletionNotifier {
  store: Arc<dyn NotificationStore>,
  clock: Arc<dyn Clock>,
}

impl CompletionNotifier {
  pub fn new(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>) -> Self {
    Self { store, clock }
  }

  pub async fn notify_task_end(&self, leader_address: &str) -> Result<String> {
    let token = Uuid::new_v4().to_string();
    self.store.write(leader_address, &token, self.clock.now()).await?;
    info!(leader = leader_address, token = %token, "Sent task end notification");
    Ok(token)
  }
}

pub struct CleanupCommand {
  pub command: Vec<String>,
  pub output_directory: PathBuf,
  pub supervisor: ProcessSupervisor,
}

impl CleanupCommand {
  pub fn new(command: Vec<String>, output_directory: PathBuf) -> Self {
    Self { command, output_directory, supervisor: ProcessSupervisor::new("stdout.log", "stderr.log") }
  }
}

pub struct CompletionWatcher {
  store: Arc<dyn NotificationStore>,
  clock: Arc<dyn Clock>,
  expiration_secs: i64,
  last_seen: Option<String>,
}

impl CompletionWatcher {
  pub fn new(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>, expiration_secs: i64) -> Self {
    Self { store, clock, expiration_secs, last_seen: None }
  }

  pub fn last_seen(&self) -> Option<&str> {
    self.last_seen.as_deref()
  }

  /// Returns the new token when a completion happened since the last one
  /// observed. With nothing observed yet, any fresh token counts.
  pub async fn check(&mut self) -> Result<Option<String>> {
    let cutoff = self.clock.now() - self.expiration_secs;
    let found = self.store.scan(cutoff, self.last_seen.as_deref()).await?;
    match found.into_iter().next() {
      Some(record) => {
        self.last_seen = Some(record.token.clone());
        Ok(Some(record.token))
      }
      None => Ok(None),
    }
  }

  /// Polls until shutdown, handing every new token to `on_completion`.
  pub async fn watch<F>(&mut self, mut shutdown: watch::Receiver<bool>, mut on_completion: F)
  where
    F: FnMut(&str) + Send,
  {
    info!(expiration_secs = self.expiration_secs, "Starting completion watcher");
    loop {
      match self.check().await {
        Ok(Some(token)) => {
          info!(token = %token, "Task end notification received");
          on_completion(&token);
        }
        Ok(None) => {}
        Err(e) => error!(error = %e, "Failed to check for task end notification"),
      }
      if sleep_or_shutdown(self.clock.as_ref(), WATCH_INTERVAL, &mut shutdown).await {
        info!("Completion watcher shutting down");
        break;
      }
    }
  }

  /// Runs the cleanup command, without waiting on it, after each completion.
  pub async fn run(mut self, cleanup: CleanupCommand, shutdown: watch::Receiver<bool>) {
    let cleanup = Arc::new(cleanup);
    self.watch(shutdown, move |_token| {
      let cleanup = cleanup.clone();
      tokio::spawn(async move {
        if let Err(e) = cleanup.supervisor.run(&cleanup.command, &cleanup.output_directory, CLEANUP_TIMEOUT).await {
          error!(error = %e, "Cleanup command failed");
        }
      });
    }).await;
  }
}

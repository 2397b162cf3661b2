use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use satdispatch::{
  clock::{Clock, SystemClock},
  config::Config,
  database::setup_database,
  heartbeat::{HeartbeatPublisher, StatusSource, WORKER_STATUS_FILE},
  models::NodeRole,
  notification::{CleanupCommand, CompletionWatcher, NotificationStore, PgNotificationStore},
  process::spawn_detached,
  registry::{wait_for_leader, NodeRegistry, PgNodeRegistry, LEADER_WAIT_TIMEOUT},
};

const LEADER_STATUS_FILE: &str = "leader_node_status.json";
const STATUS_FILE_SETTLE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let clock: Arc<dyn Clock> = Arc::new(SystemClock);

  let db_pool = setup_database(&config.database_url).await?;
  let registry: Arc<dyn NodeRegistry> = Arc::new(PgNodeRegistry::new(db_pool.clone(), clock.clone()));
  let notifications: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(db_pool));

  let leader = wait_for_leader(registry.as_ref(), clock.as_ref(), config.node_expiration_secs, LEADER_WAIT_TIMEOUT)
    .await
    .context("Leader never came up")?;
  let leader_status = config.competition_dir.join(LEADER_STATUS_FILE);
  tokio::fs::write(&leader_status, serde_json::to_vec(&leader)?)
    .await
    .with_context(|| format!("Failed to write {}", leader_status.display()))?;

  let worker_script = config.competition_dir.join("worker");
  let _worker_health = spawn_detached(
    &worker_script,
    &config.competition_dir.join("worker_stdout.log"),
    &config.competition_dir.join("worker_stderr.log"),
  )
    .with_context(|| format!("Failed to start {}", worker_script.display()))?;
  clock.sleep(STATUS_FILE_SETTLE).await;

  let (shutdown_tx, shutdown_rx) = watch::channel(false);

  let heartbeat = HeartbeatPublisher::new(
    registry,
    clock.clone(),
    &config.node_ip,
    NodeRole::Worker,
    StatusSource::File(config.competition_dir.join(WORKER_STATUS_FILE)),
    config.worker_status_staleness_secs,
  );
  let mut heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx.clone()));

  let watcher = CompletionWatcher::new(notifications, clock, config.notification_expiration_secs);
  let cleanup = CleanupCommand::new(
    vec![config.competition_dir.join("cleanup").display().to_string()],
    PathBuf::from("/tmp"),
  );
  let watcher_task = tokio::spawn(watcher.run(cleanup, shutdown_rx));

  let finished = tokio::select! {
    joined = &mut heartbeat_task => Some(joined.context("Heartbeat task panicked")?),
    signal = tokio::signal::ctrl_c() => {
      signal.context("Failed to listen for shutdown signal")?;
      info!("Shutdown requested");
      None
    }
  };
  let _ = shutdown_tx.send(true);
  let _ = watcher_task.await;
  let outcome = match finished {
    Some(outcome) => outcome,
    None => heartbeat_task.await.context("Heartbeat task panicked")?,
  };

  if let Err(e) = outcome {
    error!(error = %e, "Worker stopping after liveness violation");
    std::process::exit(1);
  }
  Ok(())
}

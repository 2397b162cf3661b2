use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use satdispatch::{
  clock::{Clock, SystemClock},
  config::Config,
  database::setup_database,
  dispatcher::{Collaborators, DispatcherSettings, TaskDispatcher},
  heartbeat::{HeartbeatPublisher, StatusSource},
  messaging::{create_rabbit_channel, RabbitQueue},
  models::NodeRole,
  notification::{CompletionNotifier, NotificationStore, PgNotificationStore},
  process::spawn_detached,
  registry::{NodeRegistry, PgNodeRegistry},
  routes::routes,
  solver::CommandLineSolver,
  storage::LocalObjectStore,
};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let clock: Arc<dyn Clock> = Arc::new(SystemClock);

  let db_pool = setup_database(&config.database_url).await?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url)
    .await
    .context("Failed to create RabbitMQ channel")?;

  info!(queue = %config.inbound_queue, "Getting input queue");
  let inbound = RabbitQueue::declare(rabbit_channel.clone(), &config.inbound_queue).await?;
  info!(queue = %config.outbound_queue, "Getting output queue");
  let outbound = RabbitQueue::declare(rabbit_channel, &config.outbound_queue).await?;

  let registry: Arc<dyn NodeRegistry> = Arc::new(PgNodeRegistry::new(db_pool.clone(), clock.clone()));
  let notifications: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(db_pool));

  let leader_script = config.competition_dir.join("leader");
  let _leader_health = spawn_detached(
    &leader_script,
    &config.competition_dir.join("leader_stdout.log"),
    &config.competition_dir.join("leader_stderr.log"),
  )
    .with_context(|| format!("Failed to start {}", leader_script.display()))?;

  let (shutdown_tx, shutdown_rx) = watch::channel(false);

  let heartbeat = HeartbeatPublisher::new(
    registry.clone(),
    clock.clone(),
    &config.node_ip,
    NodeRole::Leader,
    StatusSource::ready(),
    config.worker_status_staleness_secs,
  );
  let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx.clone()));

  let api = routes(
    registry.clone(),
    notifications.clone(),
    clock.clone(),
    config.node_expiration_secs,
    config.notification_expiration_secs,
  );
  let mut api_shutdown = shutdown_rx.clone();
  let (addr, server) = warp::serve(api)
    .try_bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async move {
      let _ = api_shutdown.changed().await;
    })
    .context("Failed to bind status API")?;
  info!(%addr, "Status API listening");
  let server_task = tokio::spawn(server);

  info!(command = ?config.solver_command, "Building command line solver");
  let deps = Collaborators {
    inbound: Arc::new(inbound),
    outbound: Arc::new(outbound),
    registry,
    store: Arc::new(LocalObjectStore::new(&config.object_store_root)),
    solver: Arc::new(CommandLineSolver::new(config.solver_command.clone())),
    notifier: CompletionNotifier::new(notifications, clock.clone()),
    clock,
  };
  let settings = DispatcherSettings::new(
    &config.node_ip,
    &config.work_root,
    &config.artifact_bucket,
    config.node_expiration_secs,
  );
  let dispatcher = TaskDispatcher::new(deps, settings);
  let dispatcher_task = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

  tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
  info!("Shutdown requested");
  let _ = shutdown_tx.send(true);

  if let Ok(Err(e)) = heartbeat_task.await {
    error!(error = %e, "Heartbeat loop failed");
  }
  let _ = dispatcher_task.await;
  let _ = server_task.await;
  Ok(())
}

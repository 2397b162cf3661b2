use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use satdispatch::{
  client::{ClientDriver, ResultsLedger, TaskTemplate},
  clock::{Clock, SystemClock},
  messaging::{create_rabbit_channel, MessageQueue, RabbitQueue},
  storage::LocalObjectStore,
};

const PURGE_SETTLE: Duration = Duration::from_secs(60);

/// Runs every problem in a bucket through the solving cluster and records the
/// answers in a resumable JSON file.
#[derive(Debug, Parser)]
#[command(name = "satdispatch_client", version)]
struct Args {
  /// Queue the leader reads tasks from.
  #[arg(long)]
  problem_queue: String,

  /// Queue the leader writes results to.
  #[arg(long)]
  result_queue: String,

  /// Bucket holding the problem files.
  #[arg(long)]
  s3_bucket: String,

  /// Number of worker nodes each task should wait for.
  #[arg(long)]
  num_workers: usize,

  /// 0 = errors only, 1 = info, 2 = debug.
  #[arg(long, default_value_t = 0)]
  verbose: u8,

  /// Ignore results recorded by an earlier run.
  #[arg(long)]
  clean_first: bool,

  /// Purge both queues before starting, then wait for in-flight work to settle.
  #[arg(long)]
  purge_queues: bool,

  #[arg(long, default_value_t = 1000)]
  timeout_seconds: u64,

  #[arg(long, default_value = "")]
  language: String,

  /// Extra argument for the solver; may be given more than once.
  #[arg(long = "solver-option")]
  solver_options: Vec<String>,

  #[arg(long, default_value = "")]
  solver_name: String,

  /// JSON file the results are written to.
  json_file: PathBuf,
}

fn log_level(verbose: u8) -> Level {
  match verbose {
    0 => Level::ERROR,
    1 => Level::INFO,
    _ => Level::DEBUG,
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();
  tracing_subscriber::fmt().with_max_level(log_level(args.verbose)).init();

  let rabbitmq_url = std::env::var("RABBITMQ_URL").context("RABBITMQ_URL must be set")?;
  let object_store_root = std::env::var("OBJECT_STORE_ROOT").unwrap_or_else(|_| "/mnt/object-store".to_string());

  let channel = create_rabbit_channel(&rabbitmq_url)
    .await
    .context("Failed to create RabbitMQ channel")?;
  let problems: Arc<dyn MessageQueue> = Arc::new(RabbitQueue::declare(channel.clone(), &args.problem_queue).await?);
  let results: Arc<dyn MessageQueue> = Arc::new(RabbitQueue::declare(channel, &args.result_queue).await?);
  let clock: Arc<dyn Clock> = Arc::new(SystemClock);

  let template = TaskTemplate {
    language: args.language.clone(),
    solver_name: args.solver_name.clone(),
    solver_options: args.solver_options.clone(),
    timeout_secs: args.timeout_seconds,
    num_workers: args.num_workers,
  };
  let driver = ClientDriver::new(problems, results, clock.clone(), template);

  if args.purge_queues {
    info!("Purging problem and result queues");
    driver.purge_queues().await?;
    info!(seconds = PURGE_SETTLE.as_secs(), "Waiting for in-flight work to settle");
    clock.sleep(PURGE_SETTLE).await;
  }

  let mut ledger = ResultsLedger::load(&args.json_file, args.clean_first)
    .await
    .with_context(|| format!("Failed to load {}", args.json_file.display()))?;
  info!(cached = ledger.len(), ledger = %args.json_file.display(), "Loaded results ledger");

  let store = LocalObjectStore::new(object_store_root);
  match driver.run_bucket(&store, &args.s3_bucket, &mut ledger).await {
    Ok(submitted) => {
      info!(submitted, total = ledger.len(), "All problems completed");
      Ok(())
    }
    Err(e) => {
      error!(error = %e, "Stopping run");
      Err(e.into())
    }
  }
}

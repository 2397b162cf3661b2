//! Time source shared by the polling loops, so tests can advance time without
//! waiting on the wall clock.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

#[async_trait]
pub trait Clock: Send + Sync {
  /// Seconds since the unix epoch.
  fn now(&self) -> i64;

  async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
  fn now(&self) -> i64 {
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs() as i64)
      .unwrap_or(0)
  }

  async fn sleep(&self, duration: Duration) {
    tokio::time::sleep(duration).await;
  }
}

/// Clock whose sleeps return immediately after moving time forward.
#[derive(Debug)]
pub struct ManualClock {
  millis: AtomicU64,
}

impl ManualClock {
  pub fn starting_at(epoch_seconds: i64) -> Self {
    Self { millis: AtomicU64::new(epoch_seconds.max(0) as u64 * 1000) }
  }

  pub fn advance(&self, duration: Duration) {
    self.millis.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
  }
}

#[async_trait]
impl Clock for ManualClock {
  fn now(&self) -> i64 {
    (self.millis.load(Ordering::SeqCst) / 1000) as i64
  }

  async fn sleep(&self, duration: Duration) {
    self.advance(duration);
    tokio::task::yield_now().await;
  }
}

/// Sleeps on `clock`, returning `true` if shutdown was requested first.
pub async fn sleep_or_shutdown(clock: &dyn Clock, duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
  if *shutdown.borrow() {
    return true;
  }
  tokio::select! {
    _ = clock.sleep(duration) => *shutdown.borrow(),
    changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
  }
}

use warp::Filter;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use serde_json::json;
use tracing::error;
use crate::clock::Clock;
use crate::notification::{CompletionWatcher, NotificationStore};

const SSE_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn with_store(store: Arc<dyn NotificationStore>) -> impl Filter<Extract = (Arc<dyn NotificationStore>,), Error = Infallible> + Clone {
  warp::any().map(move || store.clone())
}

fn with_clock(clock: Arc<dyn Clock>) -> impl Filter<Extract = (Arc<dyn Clock>,), Error = Infallible> + Clone {
  warp::any().map(move || clock.clone())
}

/// Streams one event per task completion seen after the client connects.
pub fn sse_route(
  store: Arc<dyn NotificationStore>,
  clock: Arc<dyn Clock>,
  expiration_secs: i64,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_store(store))
    .and(with_clock(clock))
    .and(warp::any().map(move || expiration_secs))
    .and_then(handle_sse)
}

async fn handle_sse(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>, expiration_secs: i64) -> Result<impl warp::Reply, warp::Rejection> {
  let watcher = Arc::new(Mutex::new(CompletionWatcher::new(store, clock, expiration_secs)));

  let interval = IntervalStream::new(tokio::time::interval(SSE_POLL_INTERVAL));
  let stream = interval.then(move |_| {
    let watcher = watcher.clone();
    async move {
      match watcher.lock().await.check().await {
        Ok(Some(token)) => {
          let event = warp::sse::Event::default()
            .event("task_end")
            .data(json!({"notificationId": token}).to_string());
          Some(Ok::<_, Infallible>(event))
        }
        Ok(None) => None,
        Err(e) => {
          error!(error = %e, "Error checking for task end notifications");
          None
        }
      }
    }
  })
    .filter_map(|x| { x });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}

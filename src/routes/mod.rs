use std::sync::Arc;
use warp::Filter;
use crate::clock::Clock;
use crate::notification::NotificationStore;
use crate::registry::NodeRegistry;
pub mod nodes;
pub mod sse;

pub fn routes(
  registry: Arc<dyn NodeRegistry>,
  notifications: Arc<dyn NotificationStore>,
  clock: Arc<dyn Clock>,
  default_within_secs: i64,
  notification_expiration_secs: i64,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("health").and(warp::path::end()).and(warp::get()).map(|| "ok")
    .or(nodes::nodes_route(registry, default_within_secs))
    .or(sse::sse_route(notifications, clock, notification_expiration_secs))
}

use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::error;
use warp::{Filter, Reply};
use warp::http::StatusCode;
use crate::models::NodeRole;
use crate::registry::NodeRegistry;

#[derive(Debug, Deserialize)]
pub struct NodesQuery {
  pub role: Option<String>,
  pub within: Option<i64>,
}

#[derive(Debug)]
struct RegistryUnavailable;
impl warp::reject::Reject for RegistryUnavailable {}

fn with_registry(registry: Arc<dyn NodeRegistry>) -> impl Filter<Extract = (Arc<dyn NodeRegistry>,), Error = Infallible> + Clone {
  warp::any().map(move || registry.clone())
}

pub fn nodes_route(
  registry: Arc<dyn NodeRegistry>,
  default_within_secs: i64,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("nodes")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<NodesQuery>())
    .and(with_registry(registry))
    .and(warp::any().map(move || default_within_secs))
    .and_then(handle_nodes)
}

async fn handle_nodes(query: NodesQuery, registry: Arc<dyn NodeRegistry>, default_within_secs: i64) -> Result<warp::reply::Response, warp::Rejection> {
  let role = match query.role.as_deref().unwrap_or("WORKER").parse::<NodeRole>() {
    Ok(role) => role,
    Err(e) => {
      let body = warp::reply::json(&serde_json::json!({"error": e.to_string()}));
      return Ok(warp::reply::with_status(body, StatusCode::BAD_REQUEST).into_response());
    }
  };
  let within = query.within.unwrap_or(default_within_secs);
  let records = registry.list_live(role, within).await.map_err(|e| {
    error!(error = %e, "Failed to read node registry");
    warp::reject::custom(RegistryUnavailable)
  })?;
  Ok(warp::reply::json(&records).into_response())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::models::STATUS_READY;
  use crate::registry::InMemoryNodeRegistry;

  #[tokio::test]
  async fn lists_live_nodes_by_role() {
    let clock = Arc::new(ManualClock::starting_at(1_000));
    let registry = Arc::new(InMemoryNodeRegistry::new(clock));
    registry.heartbeat("w1", "10.0.0.2", STATUS_READY, NodeRole::Worker).await.unwrap();
    registry.heartbeat("l1", "10.0.0.1", STATUS_READY, NodeRole::Leader).await.unwrap();

    let filter = nodes_route(registry, 120);
    let response = warp::test::request().path("/nodes?role=leader").reply(&filter).await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["nodeIp"], "10.0.0.1");
  }

  #[tokio::test]
  async fn unknown_role_is_bad_request() {
    let clock = Arc::new(ManualClock::starting_at(1_000));
    let registry = Arc::new(InMemoryNodeRegistry::new(clock));
    let filter = nodes_route(registry, 120);
    let response = warp::test::request().path("/nodes?role=observer").reply(&filter).await;
    assert_eq!(response.status(), 400);
  }
}

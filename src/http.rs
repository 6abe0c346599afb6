//! HTTP surface for the long-polling fallback and metrics.
//!
//! `GET /ws/poll` drains buffered envelopes for a long-poll session id.
//! `POST /ws/send` enqueues an HTTP-originated envelope and forwards it
//! to WebSocket clients when a forwarder is installed.
//! `GET /metrics` serves the Prometheus text exposition.
//!
//! These handlers are merged into [`Server::router`]; the bridge does the
//! actual buffering and forwarding.

use axum::{
  extract::{Query, State},
  http::{header, StatusCode},
  routing::{get, post},
  Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::longpoll::default_session_id;
use crate::protocol::Envelope;
use crate::server::Server;

const DEFAULT_POLL_MAX: usize = 50;

pub fn api_router() -> Router<Server> {
  Router::new()
    .route("/ws/poll", get(ws_poll))
    .route("/ws/send", post(ws_send))
    .route("/metrics", get(metrics))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PollParams {
  session_id: Option<String>,
  max: Option<String>,
}

pub(crate) async fn ws_poll(
  State(server): State<Server>,
  Query(params): Query<PollParams>,
) -> (StatusCode, Json<serde_json::Value>) {
  let bridge = match server.require_bridge() {
    Ok(bridge) => bridge,
    Err(e) => {
      return (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": e.to_string()})),
      );
    }
  };

  let session_id = match params.session_id.as_deref() {
    Some(sid) if !sid.is_empty() => sid,
    _ => {
      return (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "missing 'session_id' query parameter"})),
      );
    }
  };

  // Unparsable max keeps the default.
  let max = params
    .max
    .as_deref()
    .and_then(|m| m.parse::<usize>().ok())
    .unwrap_or(DEFAULT_POLL_MAX);

  let drained = bridge.poll(session_id, max, true);
  let body: Vec<serde_json::Value> = drained.iter().map(Envelope::to_json).collect();
  (StatusCode::OK, Json(serde_json::Value::Array(body)))
}

pub(crate) async fn ws_send(
  State(server): State<Server>,
  body: String,
) -> (StatusCode, Json<serde_json::Value>) {
  let bridge = match server.require_bridge() {
    Ok(bridge) => bridge,
    Err(e) => {
      return (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": e.to_string()})),
      );
    }
  };

  let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) else {
    return (
      StatusCode::BAD_REQUEST,
      Json(json!({"error": "invalid JSON body"})),
    );
  };

  let Some(env) = Envelope::from_json(&value) else {
    return (
      StatusCode::BAD_REQUEST,
      Json(json!({"error": "missing 'type' field"})),
    );
  };

  let session_id = value
    .get("session_id")
    .and_then(serde_json::Value::as_str)
    .filter(|sid| !sid.is_empty())
    .map(str::to_string)
    .unwrap_or_else(|| default_session_id(&env));

  bridge.send_from_http(&session_id, &env);

  (
    StatusCode::ACCEPTED,
    Json(json!({"status": "queued", "session_id": session_id})),
  )
}

pub(crate) async fn metrics(
  State(server): State<Server>,
) -> ([(header::HeaderName, &'static str); 1], String) {
  (
    [(
      header::CONTENT_TYPE,
      "text/plain; version=0.0.4; charset=utf-8",
    )],
    server.metrics().render_prometheus(),
  )
}

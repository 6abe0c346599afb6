//! Bridge between WebSocket envelope traffic and long-polling buffers.
//!
//! The bridge is HTTP-agnostic: it receives already-parsed envelopes from
//! the server, routes them into [`LongPollManager`] buffers via a pluggable
//! resolver, and exposes `poll`/`send_from_http` for the HTTP layer. It
//! never parses or serializes envelopes itself.

use std::sync::Arc;
use std::time::Duration;

use crate::longpoll::LongPollManager;
use crate::metrics::WsMetrics;
use crate::protocol::Envelope;

/// Decides which long-polling session id receives a WebSocket envelope.
pub type Resolver = Box<dyn Fn(&Envelope) -> String + Send + Sync>;

/// Hook for HTTP → WebSocket propagation, typically dispatching to
/// `Server::broadcast_room_json` / `Server::broadcast_json`.
pub type HttpToWsForward = Box<dyn Fn(&Envelope) + Send + Sync>;

/// Session id an envelope maps to when no resolver is installed:
/// `room:<room>` when a room is known, otherwise `broadcast`.
///
/// The room is taken from the envelope, falling back to a `room` key in
/// the payload so bare `{type, payload:{room,...}}` chat traffic still
/// lands in the per-room buffer.
pub fn default_session_id(env: &Envelope) -> String {
  let room = if env.room.is_empty() {
    env.payload.get_str("room").unwrap_or_default()
  } else {
    env.room.as_str()
  };

  if room.is_empty() {
    "broadcast".to_string()
  } else {
    format!("room:{room}")
  }
}

/// Mirrors WebSocket envelopes into long-polling buffers and forwards
/// HTTP-originated envelopes back out to WebSocket clients.
pub struct LongPollBridge {
  manager: Arc<LongPollManager>,
  resolver: Option<Resolver>,
  forward: Option<HttpToWsForward>,
}

impl LongPollBridge {
  /// Bridge over an externally owned manager.
  pub fn new(manager: Arc<LongPollManager>) -> Self {
    Self {
      manager,
      resolver: None,
      forward: None,
    }
  }

  /// Bridge that owns its manager, wired to the given metrics.
  pub fn with_manager(ttl: Duration, max_buffer: usize, metrics: Arc<WsMetrics>) -> Self {
    Self::new(Arc::new(LongPollManager::new(ttl, max_buffer, metrics)))
  }

  /// Install a custom envelope → session-id resolver.
  pub fn with_resolver<F>(mut self, resolver: F) -> Self
  where
    F: Fn(&Envelope) -> String + Send + Sync + 'static,
  {
    self.resolver = Some(Box::new(resolver));
    self
  }

  /// Install the HTTP → WebSocket forwarder.
  pub fn with_forward<F>(mut self, forward: F) -> Self
  where
    F: Fn(&Envelope) + Send + Sync + 'static,
  {
    self.forward = Some(Box::new(forward));
    self
  }

  fn resolve(&self, env: &Envelope) -> String {
    match &self.resolver {
      Some(resolver) => resolver(env),
      None => default_session_id(env),
    }
  }

  /// Called by the server for every successfully parsed envelope.
  pub fn on_ws_message(&self, env: &Envelope) {
    let sid = self.resolve(env);
    self.manager.push_to(&sid, env.clone());
  }

  /// Drain up to `max` buffered envelopes for `sid`.
  pub fn poll(&self, sid: &str, max: usize, create_if_missing: bool) -> Vec<Envelope> {
    self.manager.poll(sid, max, create_if_missing)
  }

  /// Enqueue an HTTP-originated envelope for `sid`, then forward it to
  /// WebSocket clients when a forwarder is installed.
  pub fn send_from_http(&self, sid: &str, env: &Envelope) {
    self.manager.push_to(sid, env.clone());
    if let Some(forward) = &self.forward {
      forward(env);
    }
  }

  pub fn manager(&self) -> &Arc<LongPollManager> {
    &self.manager
  }

  pub fn session_count(&self) -> usize {
    self.manager.session_count()
  }

  pub fn buffer_size(&self, sid: &str) -> usize {
    self.manager.buffer_size(sid)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::Payload;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn bridge() -> LongPollBridge {
    LongPollBridge::with_manager(Duration::from_secs(60), 16, Arc::new(WsMetrics::new()))
  }

  #[test]
  fn default_resolver_prefers_envelope_room() {
    let env = Envelope::event("chat.message", Payload::new()).with_room("africa");
    assert_eq!(default_session_id(&env), "room:africa");
  }

  #[test]
  fn default_resolver_falls_back_to_payload_room_then_broadcast() {
    let with_payload_room =
      Envelope::event("chat.message", Payload::from([("room", "africa")]));
    assert_eq!(default_session_id(&with_payload_room), "room:africa");

    let bare = Envelope::event("chat.message", Payload::new());
    assert_eq!(default_session_id(&bare), "broadcast");
  }

  #[test]
  fn ws_messages_land_in_the_resolved_buffer() {
    let bridge = bridge();
    let env = Envelope::event("chat.message", Payload::from([("text", "y")]))
      .with_room("africa");
    bridge.on_ws_message(&env);

    assert_eq!(bridge.buffer_size("room:africa"), 1);
    let drained = bridge.poll("room:africa", 10, true);
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].payload.get_str("text"), Some("y"));
  }

  #[test]
  fn custom_resolver_overrides_default() {
    let bridge = bridge().with_resolver(|env| format!("type:{}", env.ty));
    bridge.on_ws_message(&Envelope::event("a.b", Payload::new()).with_room("africa"));
    assert_eq!(bridge.buffer_size("type:a.b"), 1);
    assert_eq!(bridge.buffer_size("room:africa"), 0);
  }

  #[test]
  fn send_from_http_enqueues_and_forwards() {
    let forwarded = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&forwarded);
    let bridge = bridge().with_forward(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    let env = Envelope::event("chat.message", Payload::from([("text", "hi")]));
    bridge.send_from_http("broadcast", &env);

    assert_eq!(bridge.buffer_size("broadcast"), 1);
    assert_eq!(forwarded.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn missing_forwarder_skips_forwarding_silently() {
    let bridge = bridge();
    let env = Envelope::event("chat.message", Payload::new());
    bridge.send_from_http("broadcast", &env);
    assert_eq!(bridge.buffer_size("broadcast"), 1);
  }
}

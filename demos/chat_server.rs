//! Chat server demo: rooms, durable history with replay on join, a
//! long-polling fallback and Prometheus metrics, all on one port.
//!
//! Run with `cargo run --example chat_server`, then connect a WebSocket
//! client to ws://127.0.0.1:9090/ws and send:
//!
//!   {"type":"chat.join","payload":{"room":"africa","user":"bob"}}
//!   {"type":"chat.message","payload":{"room":"africa","user":"bob","text":"hi"}}
//!   {"type":"chat.leave","payload":{"room":"africa","user":"bob"}}
//!
//! HTTP fallback on the same port:
//!
//!   curl 'http://127.0.0.1:9090/ws/poll?session_id=room:africa&max=10'
//!   curl -X POST http://127.0.0.1:9090/ws/send \
//!     -d '{"room":"africa","type":"chat.message","payload":{"user":"http","text":"hi"}}'
//!   curl http://127.0.0.1:9090/metrics

use anyhow::Context as _;
use std::sync::Arc;
use wren::config::StorageSection;
use wren::{Config, Envelope, MessageStore, Payload, Runtime};

const HISTORY_LIMIT: usize = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter("chat_server=debug,wren=info")
    .init();

  let config = Config {
    storage: StorageSection {
      path: Some("chat_messages.db".to_string()),
    },
    ..Config::default()
  };

  let rt = Runtime::new(&config)?;
  let server = rt.server().clone();
  let store: Arc<dyn MessageStore> = rt.store().context("storage path is configured")?;

  // Welcome every new connection, persisted so reconnecting clients can
  // replay it.
  let welcome_store = Arc::clone(&store);
  server.on_open(move |session| {
    let store = Arc::clone(&welcome_store);
    async move {
      let msg = Envelope::event(
        "chat.system",
        Payload::new()
          .with("user", "server")
          .with("text", "Welcome to Softadastra Chat 👋"),
      )
      .with_kind("system");

      if let Err(e) = store.append(&msg).await {
        tracing::error!(error = %e, "failed to persist welcome message");
      }
      session.send_text(msg.serialize());
    }
  });

  let hub = server.clone();
  let chat_store = Arc::clone(&store);
  server.on_typed_message(move |session, env| {
    let hub = hub.clone();
    let store = Arc::clone(&chat_store);
    async move {
      let payload = &env.payload;
      let room = payload.get_str("room").unwrap_or_default().to_string();
      let user = payload.get_str("user").unwrap_or("anonymous").to_string();

      match env.ty.as_str() {
        "chat.join" if !room.is_empty() => {
          hub.join_room(&session, &room);

          // Replay recent history to the newcomer before announcing them.
          match store.list_by_room(&room, HISTORY_LIMIT, None).await {
            Ok(history) => {
              for mut msg in history {
                if msg.kind.is_empty() {
                  msg.kind = "history".to_string();
                }
                session.send_text(msg.serialize());
              }
            }
            Err(e) => tracing::error!(room, error = %e, "history replay failed"),
          }

          let sys = Envelope::event(
            "chat.system",
            Payload::new()
              .with("room", room.as_str())
              .with("text", format!("{user} joined the room")),
          )
          .with_kind("system")
          .with_room(room.as_str());

          if let Err(e) = store.append(&sys).await {
            tracing::error!(room, error = %e, "failed to persist join notice");
          }
          hub.broadcast_room_json(&room, &sys.ty, sys.payload.clone());
        }

        "chat.leave" if !room.is_empty() => {
          hub.leave_room(&session, &room);

          let sys = Envelope::event(
            "chat.system",
            Payload::new()
              .with("room", room.as_str())
              .with("text", format!("{user} left the room")),
          )
          .with_kind("system")
          .with_room(room.as_str());

          if let Err(e) = store.append(&sys).await {
            tracing::error!(room, error = %e, "failed to persist leave notice");
          }
          hub.broadcast_room_json(&room, &sys.ty, sys.payload.clone());
        }

        "chat.message"
          if !room.is_empty() && !payload.get_str("text").unwrap_or_default().is_empty() =>
        {
          let text = payload.get_str("text").unwrap_or_default().to_string();

          let msg = Envelope::event(
            "chat.message",
            Payload::new()
              .with("room", room.as_str())
              .with("user", user.as_str())
              .with("text", text.as_str()),
          )
          .with_room(room.as_str());

          if let Err(e) = store.append(&msg).await {
            tracing::error!(room, error = %e, "failed to persist message");
          }
          hub.broadcast_room_json(&room, &msg.ty, msg.payload.clone());
        }

        // Anything else echoes to everyone, identically to what came in.
        _ => {
          if let Err(e) = store.append(&env).await {
            tracing::error!(ty = %env.ty, error = %e, "failed to persist message");
          }
          hub.broadcast_json(&env.ty, env.payload.clone());
        }
      }
    }
  });

  server.on_close(|session| async move {
    tracing::debug!(session = session.id(), "client disconnected");
  });

  let stopper = rt.server().clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      stopper.stop().await;
    }
  });

  rt.run_blocking().await
}

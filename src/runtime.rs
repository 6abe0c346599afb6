//! Lifecycle coordinator: builds and runs the whole messaging stack in
//! dependency order.
//!
//! Start order: metrics → store → long-poll buffers → bridge → server →
//! accept loop, plus a background task sweeping expired long-poll buffers.
//! Stop unwinds in reverse; every step is idempotent and completes even if
//! earlier steps failed.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, WsConfig};
use crate::longpoll::{LongPollBridge, LongPollManager};
use crate::metrics::WsMetrics;
use crate::protocol::Envelope;
use crate::server::Server;
use crate::store::{MessageStore, SqliteMessageStore};

pub struct Runtime {
  metrics: Arc<WsMetrics>,
  store: Option<Arc<dyn MessageStore>>,
  manager: Arc<LongPollManager>,
  bridge: Arc<LongPollBridge>,
  server: Server,
  sweep_interval: Duration,
  sweep_stop: watch::Sender<bool>,
  sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
  /// Wire the stack from configuration. The bridge's forwarder fans
  /// HTTP-originated envelopes back out to WebSocket clients, per room
  /// when the envelope names one.
  pub fn new(cfg: &Config) -> anyhow::Result<Self> {
    let metrics = Arc::new(WsMetrics::new());

    let store: Option<Arc<dyn MessageStore>> = match &cfg.storage.path {
      Some(path) => Some(Arc::new(SqliteMessageStore::open(path)?)),
      None => None,
    };

    let manager = Arc::new(LongPollManager::new(
      Duration::from_secs(cfg.longpoll.session_ttl),
      cfg.longpoll.max_buffer,
      Arc::clone(&metrics),
    ));

    let server = Server::with_metrics(
      WsConfig::from_section(&cfg.websocket),
      Arc::clone(&metrics),
    );

    let forward_server = server.clone();
    let bridge = Arc::new(LongPollBridge::new(Arc::clone(&manager)).with_forward(
      move |env: &Envelope| {
        if env.room.is_empty() {
          forward_server.broadcast_json(&env.ty, env.payload.clone());
        } else {
          forward_server.broadcast_room_json(&env.room, &env.ty, env.payload.clone());
        }
      },
    ));
    server.attach_long_polling_bridge(Arc::clone(&bridge));

    let (sweep_stop, _) = watch::channel(false);

    Ok(Self {
      metrics,
      store,
      manager,
      bridge,
      server,
      sweep_interval: Duration::from_secs(cfg.longpoll.sweep_interval.max(1)),
      sweep_stop,
      sweep_task: Mutex::new(None),
    })
  }

  pub fn metrics(&self) -> Arc<WsMetrics> {
    Arc::clone(&self.metrics)
  }

  pub fn store(&self) -> Option<Arc<dyn MessageStore>> {
    self.store.clone()
  }

  pub fn manager(&self) -> Arc<LongPollManager> {
    Arc::clone(&self.manager)
  }

  pub fn bridge(&self) -> Arc<LongPollBridge> {
    Arc::clone(&self.bridge)
  }

  pub fn server(&self) -> &Server {
    &self.server
  }

  /// Spawn the buffer sweeper, then bind and start the server.
  pub async fn start(&self) -> anyhow::Result<()> {
    let manager = Arc::clone(&self.manager);
    let period = self.sweep_interval;
    let mut stop_rx = self.sweep_stop.subscribe();
    let handle = tokio::spawn(async move {
      let mut tick = tokio::time::interval(period);
      loop {
        tokio::select! {
          _ = tick.tick() => manager.sweep_expired(),
          _ = stop_rx.changed() => {
            if *stop_rx.borrow() {
              break;
            }
          }
        }
      }
    });
    {
      let mut slot = match self.sweep_task.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
      };
      if let Some(old) = slot.replace(handle) {
        old.abort();
      }
    }

    self.server.start().await
  }

  /// Reverse of start: stop the server, then the sweeper. Idempotent.
  pub async fn stop(&self) {
    self.server.stop().await;

    self.sweep_stop.send_replace(true);
    let handle = {
      let mut slot = match self.sweep_task.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
      };
      slot.take()
    };
    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        tracing::warn!(error = %e, "sweep task join failed during stop");
      }
    }
  }

  /// Start the stack and park until a server stop is requested, then
  /// unwind.
  pub async fn run_blocking(&self) -> anyhow::Result<()> {
    self.start().await?;
    self.server.stopped().await;
    self.stop().await;
    Ok(())
  }
}

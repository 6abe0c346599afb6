//! WebSocket server hub: session registry, rooms, broadcast fan-out and
//! the accept loop.
//!
//! The hub owns only weak references to sessions; a session is kept alive
//! by its own I/O tasks and by whatever user handlers hold. Dead entries
//! are pruned lazily on every room or broadcast operation. All registry
//! state sits behind one mutex taken in short critical sections and never
//! held across user callbacks.

use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
  routing::get,
  Router,
};
use futures::stream::SplitStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::WsConfig;
use crate::error::{PollError, WsError};
use crate::longpoll::LongPollBridge;
use crate::metrics::{gauge_sub, WsMetrics};
use crate::protocol::{Envelope, Payload};
use crate::session::{pump_writes, Session};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type OpenHandler = Arc<dyn Fn(Arc<Session>) -> BoxFuture + Send + Sync>;
type CloseHandler = Arc<dyn Fn(Arc<Session>) -> BoxFuture + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(Arc<Session>, WsError) -> BoxFuture + Send + Sync>;
type MessageHandler = Arc<dyn Fn(Arc<Session>, String) -> BoxFuture + Send + Sync>;
type TypedMessageHandler = Arc<dyn Fn(Arc<Session>, Envelope) -> BoxFuture + Send + Sync>;

#[derive(Default)]
struct Handlers {
  open: Mutex<Option<OpenHandler>>,
  close: Mutex<Option<CloseHandler>>,
  error: Mutex<Option<ErrorHandler>>,
  message: Mutex<Option<MessageHandler>>,
  typed_message: Mutex<Option<TypedMessageHandler>>,
}

#[derive(Default)]
struct Registry {
  sessions: Vec<Weak<Session>>,
  rooms: HashMap<String, Vec<Weak<Session>>>,
}

impl Registry {
  fn prune(&mut self) {
    self.sessions.retain(|w| w.strong_count() > 0);
    self.rooms.retain(|_, members| {
      members.retain(|w| w.strong_count() > 0);
      !members.is_empty()
    });
  }

  fn remove_session(&mut self, session: &Arc<Session>) {
    let is_other = |w: &Weak<Session>| match w.upgrade() {
      Some(s) => !Arc::ptr_eq(&s, session),
      None => false,
    };
    self.sessions.retain(is_other);
    self.rooms.retain(|_, members| {
      members.retain(is_other);
      !members.is_empty()
    });
  }
}

struct Inner {
  cfg: WsConfig,
  metrics: Arc<WsMetrics>,
  registry: Mutex<Registry>,
  bridge: Mutex<Option<Arc<LongPollBridge>>>,
  handlers: Handlers,
  next_session_id: AtomicU64,
  stop_tx: watch::Sender<bool>,
  serve_task: Mutex<Option<JoinHandle<()>>>,
  local_addr: Mutex<Option<SocketAddr>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

/// The messaging hub. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Server {
  inner: Arc<Inner>,
}

impl Server {
  pub fn new(cfg: WsConfig) -> Self {
    Self::with_metrics(cfg, Arc::new(WsMetrics::new()))
  }

  /// Build a server sharing an externally owned metrics registry, so the
  /// long-polling side can report into the same counters.
  pub fn with_metrics(cfg: WsConfig, metrics: Arc<WsMetrics>) -> Self {
    let (stop_tx, _) = watch::channel(false);
    Self {
      inner: Arc::new(Inner {
        cfg,
        metrics,
        registry: Mutex::new(Registry::default()),
        bridge: Mutex::new(None),
        handlers: Handlers::default(),
        next_session_id: AtomicU64::new(0),
        stop_tx,
        serve_task: Mutex::new(None),
        local_addr: Mutex::new(None),
      }),
    }
  }

  pub fn config(&self) -> &WsConfig {
    &self.inner.cfg
  }

  pub fn port(&self) -> u16 {
    self.inner.cfg.port
  }

  pub fn metrics(&self) -> Arc<WsMetrics> {
    Arc::clone(&self.inner.metrics)
  }

  // ----- Handlers (set once or overwrite; not stackable) ------------------

  /// Called after a successful handshake, before the first read.
  pub fn on_open<F, Fut>(&self, f: F)
  where
    F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    *lock(&self.inner.handlers.open) = Some(Arc::new(move |s| Box::pin(f(s))));
  }

  /// Called exactly once when a session ends, after registry cleanup.
  pub fn on_close<F, Fut>(&self, f: F)
  where
    F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    *lock(&self.inner.handlers.close) = Some(Arc::new(move |s| Box::pin(f(s))));
  }

  /// Called when a session fails with an observable error, before
  /// `on_close`.
  pub fn on_error<F, Fut>(&self, f: F)
  where
    F: Fn(Arc<Session>, WsError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    *lock(&self.inner.handlers.error) = Some(Arc::new(move |s, e| Box::pin(f(s, e))));
  }

  /// Raw handler, fired for every successfully read text message.
  pub fn on_message<F, Fut>(&self, f: F)
  where
    F: Fn(Arc<Session>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    *lock(&self.inner.handlers.message) = Some(Arc::new(move |s, t| Box::pin(f(s, t))));
  }

  /// Typed handler, fired only when the message parses as an [`Envelope`].
  pub fn on_typed_message<F, Fut>(&self, f: F)
  where
    F: Fn(Arc<Session>, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    *lock(&self.inner.handlers.typed_message) = Some(Arc::new(move |s, e| Box::pin(f(s, e))));
  }

  // ----- Rooms ------------------------------------------------------------

  /// Add a session to a room. Idempotent: joining twice keeps a single
  /// membership entry.
  pub fn join_room(&self, session: &Arc<Session>, room: &str) {
    let mut reg = lock(&self.inner.registry);
    reg.prune();

    let members = reg.rooms.entry(room.to_string()).or_default();
    let already = members
      .iter()
      .any(|w| w.upgrade().map(|s| Arc::ptr_eq(&s, session)).unwrap_or(false));
    if !already {
      members.push(Arc::downgrade(session));
    }
  }

  /// Remove a session from a room; a no-op when it is not a member.
  pub fn leave_room(&self, session: &Arc<Session>, room: &str) {
    let mut reg = lock(&self.inner.registry);
    if let Some(members) = reg.rooms.get_mut(room) {
      members.retain(|w| match w.upgrade() {
        Some(s) => !Arc::ptr_eq(&s, session),
        None => false,
      });
      if members.is_empty() {
        reg.rooms.remove(room);
      }
    }
  }

  pub fn leave_all_rooms(&self, session: &Arc<Session>) {
    let mut reg = lock(&self.inner.registry);
    reg.rooms.retain(|_, members| {
      members.retain(|w| match w.upgrade() {
        Some(s) => !Arc::ptr_eq(&s, session),
        None => false,
      });
      !members.is_empty()
    });
  }

  /// Live sessions currently registered (prunes dead entries).
  pub fn session_count(&self) -> usize {
    let mut reg = lock(&self.inner.registry);
    reg.prune();
    reg.sessions.len()
  }

  /// Live members of a room (prunes dead entries).
  pub fn room_size(&self, room: &str) -> usize {
    let mut reg = lock(&self.inner.registry);
    reg.prune();
    reg.rooms.get(room).map(Vec::len).unwrap_or(0)
  }

  // ----- Broadcasts -------------------------------------------------------

  /// Send a text frame to every live session. Best effort per session: a
  /// failed enqueue on one session does not affect the others.
  pub fn broadcast_text(&self, text: &str) {
    let targets: Vec<Arc<Session>> = {
      let mut reg = lock(&self.inner.registry);
      reg.prune();
      reg.sessions.iter().filter_map(Weak::upgrade).collect()
    };

    for session in targets {
      session.send_text(text);
    }
  }

  /// Broadcast a `{type, payload}` envelope to every live session.
  pub fn broadcast_json(&self, ty: &str, payload: Payload) {
    self.broadcast_text(&Envelope::event(ty, payload).serialize());
  }

  /// Send a text frame to every live member of a room.
  pub fn broadcast_room_text(&self, room: &str, text: &str) {
    let targets: Vec<Arc<Session>> = {
      let mut reg = lock(&self.inner.registry);
      reg.prune();
      match reg.rooms.get(room) {
        Some(members) => members.iter().filter_map(Weak::upgrade).collect(),
        None => return,
      }
    };

    for session in targets {
      session.send_text(text);
    }
  }

  /// Broadcast a `{type, payload}` envelope to a specific room.
  pub fn broadcast_room_json(&self, room: &str, ty: &str, payload: Payload) {
    self.broadcast_room_text(room, &Envelope::event(ty, payload).serialize());
  }

  // ----- Long-polling bridge ----------------------------------------------

  /// Attach a long-polling bridge. Every successfully parsed envelope is
  /// forwarded to it before the typed handler runs.
  pub fn attach_long_polling_bridge(&self, bridge: Arc<LongPollBridge>) {
    *lock(&self.inner.bridge) = Some(bridge);
  }

  pub fn long_polling_bridge(&self) -> Option<Arc<LongPollBridge>> {
    lock(&self.inner.bridge).clone()
  }

  /// Bridge accessor for the HTTP surface, failing when none is attached.
  pub fn require_bridge(&self) -> Result<Arc<LongPollBridge>, PollError> {
    self.long_polling_bridge().ok_or(PollError::BridgeUnattached)
  }

  // ----- Lifecycle --------------------------------------------------------

  /// Bind the listener and spawn the accept loop. Returns once the socket
  /// is bound; the server keeps running until [`Server::stop`].
  pub async fn start(&self) -> anyhow::Result<()> {
    let router = self.router();
    let addr = SocketAddr::from(([0, 0, 0, 0], self.port()));
    let listener = TcpListener::bind(addr).await?;
    *lock(&self.inner.local_addr) = listener.local_addr().ok();

    if self.inner.cfg.enable_deflate {
      tracing::debug!("permessage-deflate requested; transport negotiates no extensions");
    }
    tracing::info!(port = self.port(), "WebSocket server listening");

    let mut stop_rx = self.inner.stop_tx.subscribe();
    let shutdown = async move {
      while !*stop_rx.borrow() {
        if stop_rx.changed().await.is_err() {
          break;
        }
      }
    };

    let serve = axum::serve(listener, router).with_graceful_shutdown(shutdown);
    let handle = tokio::spawn(async move {
      if let Err(e) = serve.await {
        tracing::error!(error = %e, "serve task failed");
      }
    });
    *lock(&self.inner.serve_task) = Some(handle);
    Ok(())
  }

  /// Cooperative shutdown: signal stop, close every live session, join the
  /// accept loop. Idempotent; errors during shutdown are logged, never
  /// propagated.
  pub async fn stop(&self) {
    // send_replace updates the flag even when no receiver is subscribed
    // yet, so a stop requested before start still sticks.
    self.inner.stop_tx.send_replace(true);

    let sessions: Vec<Arc<Session>> = {
      let mut reg = lock(&self.inner.registry);
      reg.prune();
      reg.sessions.iter().filter_map(Weak::upgrade).collect()
    };
    for session in sessions {
      session.close();
    }

    let handle = lock(&self.inner.serve_task).take();
    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        tracing::warn!(error = %e, "serve task join failed during stop");
      }
    }
    tracing::info!("server stopped");
  }

  pub fn stop_requested(&self) -> bool {
    *self.inner.stop_tx.borrow()
  }

  /// Park until a stop has been requested.
  pub async fn stopped(&self) {
    let mut stop_rx = self.inner.stop_tx.subscribe();
    while !*stop_rx.borrow() {
      if stop_rx.changed().await.is_err() {
        break;
      }
    }
  }

  /// Start, then park until a stop is requested, then finish the stop.
  pub async fn listen_blocking(&self) -> anyhow::Result<()> {
    self.start().await?;
    self.stopped().await;
    self.stop().await;
    Ok(())
  }

  /// Address actually bound, once started.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    *lock(&self.inner.local_addr)
  }

  /// Full HTTP router: the `/ws` upgrade plus the long-polling and metrics
  /// surface.
  pub fn router(&self) -> Router {
    Router::new()
      .route("/ws", get(upgrade_handler))
      .merge(crate::http::api_router())
      .with_state(self.clone())
  }

  // ----- Inbound dispatch -------------------------------------------------

  /// Dispatch one inbound text message: raw handler, parse, bridge, typed
  /// handler. Parse failures only suppress the bridge and typed stages.
  pub(crate) async fn dispatch_incoming(&self, session: &Arc<Session>, text: &str) {
    self.inner.metrics.messages_in_total.fetch_add(1, Ordering::Relaxed);

    let raw = lock(&self.inner.handlers.message).clone();
    if let Some(handler) = raw {
      handler(Arc::clone(session), text.to_string()).await;
    }

    let Some(env) = Envelope::parse(text) else {
      tracing::debug!(session = session.id(), "unparseable message, typed dispatch skipped");
      return;
    };

    if let Some(bridge) = self.long_polling_bridge() {
      bridge.on_ws_message(&env);
    }

    let typed = lock(&self.inner.handlers.typed_message).clone();
    if let Some(handler) = typed {
      handler(Arc::clone(session), env).await;
    }
  }

  async fn fire_open(&self, session: &Arc<Session>) {
    let handler = lock(&self.inner.handlers.open).clone();
    if let Some(handler) = handler {
      handler(Arc::clone(session)).await;
    }
  }

  async fn fire_close(&self, session: &Arc<Session>) {
    let handler = lock(&self.inner.handlers.close).clone();
    if let Some(handler) = handler {
      handler(Arc::clone(session)).await;
    }
  }

  async fn fire_error(&self, session: &Arc<Session>, err: WsError) {
    let handler = lock(&self.inner.handlers.error).clone();
    if let Some(handler) = handler {
      handler(Arc::clone(session), err).await;
    }
  }

  pub(crate) fn unregister_session(&self, session: &Arc<Session>) {
    lock(&self.inner.registry).remove_session(session);
  }

  /// Fabricate a registered session without a socket, for exercising
  /// registry and dispatch logic in tests.
  #[cfg(test)]
  pub(crate) fn test_session(
    &self,
  ) -> (
    Arc<Session>,
    tokio::sync::mpsc::UnboundedReceiver<crate::session::Frame>,
  ) {
    let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (session, rx) = Session::new(id, self.inner.cfg.clone(), self.metrics());
    lock(&self.inner.registry)
      .sessions
      .push(Arc::downgrade(&session));
    (session, rx)
  }

  // ----- Connection handling ----------------------------------------------

  async fn handle_socket(self, socket: WebSocket) {
    let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (session, rx) = Session::new(id, self.inner.cfg.clone(), self.metrics());

    {
      let mut reg = lock(&self.inner.registry);
      reg.prune();
      reg.sessions.push(Arc::downgrade(&session));
    }
    self.inner.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
    self.inner.metrics.connections_active.fetch_add(1, Ordering::Relaxed);
    tracing::info!(session = id, "session open");

    self.fire_open(&session).await;

    let (sink, stream) = socket.split();
    let mut writer_task = tokio::spawn(pump_writes(sink, rx));
    let mut reader_task = tokio::spawn(read_loop(self.clone(), Arc::clone(&session), stream));

    let error = tokio::select! {
      writer = &mut writer_task => {
        reader_task.abort();
        writer.ok().flatten()
      }
      reader = &mut reader_task => {
        // Queue a close frame so the writer flushes and winds down.
        session.close();
        let reader_err = reader.ok().flatten();
        let writer_err = writer_task.await.ok().flatten();
        reader_err.or(writer_err)
      }
    };

    session.mark_closing();
    self.unregister_session(&session);
    gauge_sub(&self.inner.metrics.connections_active, 1);

    if let Some(err) = error {
      self.inner.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
      tracing::warn!(session = id, error = %err, "session error");
      self.fire_error(&session, err).await;
    }

    self.fire_close(&session).await;
    tracing::info!(session = id, "session closed");
  }
}

async fn upgrade_handler(
  State(server): State<Server>,
  upgrade: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
) -> axum::response::Response {
  match upgrade {
    Ok(ws) => {
      let max = server.inner.cfg.max_message_size;
      ws.max_message_size(max)
        .on_upgrade(move |socket| server.handle_socket(socket))
    }
    Err(rejection) => {
      // The transport performed the handshake, so there is no session to
      // hand to on_error; the failure is counted and logged instead.
      let err = WsError::HandshakeFailed(rejection.to_string());
      server.inner.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
      tracing::warn!(error = %err, "rejected WebSocket upgrade");
      rejection.into_response()
    }
  }
}

/// Reader half of a connection: inbound frames, idle deadline, ping timer
/// and the stop signal, multiplexed on one task.
async fn read_loop(
  server: Server,
  session: Arc<Session>,
  mut stream: SplitStream<WebSocket>,
) -> Option<WsError> {
  const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

  let cfg = session.config().clone();
  let mut stop_rx = server.inner.stop_tx.subscribe();

  let idle = cfg.idle_timeout;
  let idle_enabled = !idle.is_zero();
  let sleep = tokio::time::sleep(if idle_enabled { idle } else { FAR_FUTURE });
  tokio::pin!(sleep);

  let ping_period = if cfg.ping_interval.is_zero() {
    FAR_FUTURE
  } else {
    cfg.ping_interval
  };
  let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);

  loop {
    tokio::select! {
      msg = stream.next() => {
        if idle_enabled {
          sleep.as_mut().reset(tokio::time::Instant::now() + idle);
        }
        match msg {
          Some(Ok(Message::Text(text))) => {
            server.dispatch_incoming(&session, &text).await;
          }
          Some(Ok(Message::Binary(_))) => {
            // Binary frames are outside the protocol; dropped.
          }
          Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
            // Ping replies happen at the transport layer; either frame
            // counts as liveness for the idle deadline.
          }
          Some(Ok(Message::Close(_))) => {
            session.close();
            return None;
          }
          Some(Err(e)) => {
            session.mark_closing();
            return Some(WsError::ReadFailed(e.to_string()));
          }
          None => {
            session.mark_closing();
            return None;
          }
        }
      }
      _ = &mut sleep => {
        tracing::debug!(session = session.id(), "idle timeout, closing");
        session.close();
        return Some(WsError::IdleTimeout);
      }
      _ = ping.tick() => {
        session.send_ping();
      }
      _ = stop_rx.changed() => {
        if *stop_rx.borrow() {
          session.close();
          return None;
        }
      }
    }
  }
}

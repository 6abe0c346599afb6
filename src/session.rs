//! Per-connection session state and its serial write mailbox.
//!
//! Every accepted connection gets one [`Session`] plus a single writer task
//! draining the session's mailbox into the socket sink. All sends go
//! through the mailbox, so frames leave in enqueue order and partial
//! frames never interleave, without any per-frame locking.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::WsConfig;
use crate::error::WsError;
use crate::metrics::WsMetrics;

/// Outbound frame queued on a session's mailbox.
#[derive(Debug)]
pub(crate) enum Frame {
  Text(String),
  Binary(Vec<u8>),
  Ping(Vec<u8>),
  Close,
}

/// Handle to one live WebSocket connection.
///
/// Cheap to share (`Arc`); the server registry holds only weak references,
/// while in-flight tasks and user handlers keep the session alive.
pub struct Session {
  id: u64,
  tx: mpsc::UnboundedSender<Frame>,
  closing: AtomicBool,
  cfg: WsConfig,
  metrics: Arc<WsMetrics>,
}

impl Session {
  pub(crate) fn new(
    id: u64,
    cfg: WsConfig,
    metrics: Arc<WsMetrics>,
  ) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Arc::new(Self {
      id,
      tx,
      closing: AtomicBool::new(false),
      cfg,
      metrics,
    });
    (session, rx)
  }

  /// Unique id of this connection (process-local, monotonically assigned).
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn config(&self) -> &WsConfig {
    &self.cfg
  }

  /// Queue a text frame. Frames are delivered in enqueue order; sends on a
  /// closing session are dropped silently.
  pub fn send_text(&self, text: impl Into<String>) {
    if self.closing.load(Ordering::Acquire) {
      return;
    }
    if self.tx.send(Frame::Text(text.into())).is_ok() {
      self.metrics.messages_out_total.fetch_add(1, Ordering::Relaxed);
    }
  }

  /// Queue a binary frame, same ordering and close semantics as
  /// [`Session::send_text`].
  pub fn send_binary(&self, data: Vec<u8>) {
    if self.closing.load(Ordering::Acquire) {
      return;
    }
    if self.tx.send(Frame::Binary(data)).is_ok() {
      self.metrics.messages_out_total.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub(crate) fn send_ping(&self) {
    if self.closing.load(Ordering::Acquire) {
      return;
    }
    let _ = self.tx.send(Frame::Ping(Vec::new()));
  }

  /// Initiate a normal (1000) close. Idempotent: only the first call
  /// queues a close frame; pending frames ahead of it are still written.
  pub fn close(&self) {
    if !self.closing.swap(true, Ordering::AcqRel) {
      let _ = self.tx.send(Frame::Close);
    }
  }

  /// Flag the session as closing without queueing a close frame, for
  /// error paths where the transport is already gone.
  pub(crate) fn mark_closing(&self) {
    self.closing.store(true, Ordering::Release);
  }

  pub fn is_closing(&self) -> bool {
    self.closing.load(Ordering::Acquire)
  }
}

/// Writer half of a session: drains the mailbox into the socket sink until
/// a close frame, a write error, or mailbox shutdown.
pub(crate) async fn pump_writes(
  mut sink: SplitSink<WebSocket, Message>,
  mut rx: mpsc::UnboundedReceiver<Frame>,
) -> Option<WsError> {
  while let Some(frame) = rx.recv().await {
    let result = match frame {
      Frame::Text(text) => sink.send(Message::Text(text)).await,
      Frame::Binary(data) => sink.send(Message::Binary(data)).await,
      Frame::Ping(data) => sink.send(Message::Ping(data)).await,
      Frame::Close => {
        let _ = sink
          .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "normal closure".into(),
          })))
          .await;
        return None;
      }
    };

    if let Err(e) = result {
      return Some(WsError::WriteFailed(e.to_string()));
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  fn session() -> (Arc<Session>, mpsc::UnboundedReceiver<Frame>) {
    Session::new(1, WsConfig::default(), Arc::new(WsMetrics::new()))
  }

  #[test]
  fn frames_keep_enqueue_order() {
    let (session, mut rx) = session();
    session.send_text("first");
    session.send_binary(vec![1, 2]);
    session.send_text("second");

    assert!(matches!(rx.try_recv().unwrap(), Frame::Text(t) if t == "first"));
    assert!(matches!(rx.try_recv().unwrap(), Frame::Binary(b) if b == vec![1, 2]));
    assert!(matches!(rx.try_recv().unwrap(), Frame::Text(t) if t == "second"));
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn close_is_idempotent_and_queues_one_close_frame() {
    let (session, mut rx) = session();
    session.close();
    session.close();

    assert!(matches!(rx.try_recv().unwrap(), Frame::Close));
    assert!(rx.try_recv().is_err());
    assert!(session.is_closing());
  }

  #[test]
  fn sends_after_close_are_dropped() {
    let (session, mut rx) = session();
    session.close();
    session.send_text("late");
    session.send_binary(vec![9]);

    assert!(matches!(rx.try_recv().unwrap(), Frame::Close));
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn pending_frames_before_close_survive() {
    let (session, mut rx) = session();
    session.send_text("queued");
    session.close();

    assert!(matches!(rx.try_recv().unwrap(), Frame::Text(t) if t == "queued"));
    assert!(matches!(rx.try_recv().unwrap(), Frame::Close));
  }

  #[test]
  fn send_counts_outbound_metric() {
    let (session, _rx) = session();
    session.send_text("a");
    session.send_text("b");
    assert_eq!(
      session.metrics.messages_out_total.load(Ordering::Relaxed),
      2
    );
  }
}

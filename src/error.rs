use thiserror::Error;

/// Errors surfaced to user handlers on a WebSocket session.
#[derive(Debug, Error)]
pub enum WsError {
  #[error("WebSocket handshake failed: {0}")]
  HandshakeFailed(String),

  #[error("read failed: {0}")]
  ReadFailed(String),

  #[error("write failed: {0}")]
  WriteFailed(String),

  #[error("connection idle past the configured timeout")]
  IdleTimeout,
}

/// Errors reported by a [`crate::store::MessageStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("storage failed: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("storage worker failed: {0}")]
  Worker(String),
}

/// Errors on the long-polling HTTP surface.
#[derive(Debug, Error)]
pub enum PollError {
  #[error("long-polling bridge not attached")]
  BridgeUnattached,
}

//! Durable message storage.
//!
//! [`MessageStore`] is the capability the server and application handlers
//! program against; [`sqlite::SqliteMessageStore`] is the embedded
//! single-file provider. Expected semantics:
//!
//!  - `append(env)` persists an envelope, normalizing empty `id`/`ts`/`kind`.
//!  - `list_by_room(room, limit, before_id)` returns the latest messages of
//!    a room, newest-first; with `before_id` only strictly older rows.
//!  - `replay_from(start_id, limit)` returns rows with id strictly greater
//!    than `start_id`, oldest-first.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::protocol::Envelope;

mod sqlite;

pub use sqlite::SqliteMessageStore;

/// Abstract capability for durable envelope storage.
///
/// Implementations must be safe to call from multiple tasks concurrently;
/// a successfully returned `append` is observable by all subsequent reads.
#[async_trait]
pub trait MessageStore: Send + Sync {
  /// Persist an envelope and return it with `id`, `ts` and `kind`
  /// normalized. Generated ids sort lexicographically in creation order.
  async fn append(&self, env: &Envelope) -> Result<Envelope, StoreError>;

  /// List messages of a room, newest-first. `limit == 0` yields an empty
  /// list; `before_id` restricts to rows strictly older than that id.
  async fn list_by_room(
    &self,
    room: &str,
    limit: usize,
    before_id: Option<&str>,
  ) -> Result<Vec<Envelope>, StoreError>;

  /// Replay messages with `id > start_id`, oldest-first, capped at `limit`.
  async fn replay_from(
    &self,
    start_id: &str,
    limit: usize,
  ) -> Result<Vec<Envelope>, StoreError>;
}

//! SQLite-backed [`MessageStore`] with write-ahead logging.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::protocol::{Envelope, Payload};
use crate::store::MessageStore;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
  id           TEXT PRIMARY KEY,
  kind         TEXT NOT NULL,
  room         TEXT,
  type         TEXT NOT NULL,
  ts           TEXT NOT NULL,
  payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_room_id ON messages(room, id);
";

/// Single-file embedded message store.
///
/// One `messages` table, WAL journaling, ids assigned as zero-padded
/// microsecond timestamps kept strictly monotonic per store instance.
/// Blocking SQLite work runs on the blocking thread pool; the connection
/// is shared behind a mutex, so writers serialize inside the store.
pub struct SqliteMessageStore {
  conn: Arc<Mutex<Connection>>,
  last_id: AtomicU64,
}

impl SqliteMessageStore {
  /// Open (or create) the database at `path` and enable WAL.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    Self::from_connection(Connection::open(path)?)
  }

  /// In-memory store for tests and ephemeral runs. WAL does not apply to
  /// memory databases; everything else behaves identically.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, StoreError> {
    // journal_mode returns a row, so exec() would error out.
    conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
    conn.execute_batch(SCHEMA)?;

    // Seed the id floor from existing rows so generated ids stay strictly
    // above everything already persisted.
    let max_id: Option<String> =
      conn.query_row("SELECT MAX(id) FROM messages;", [], |row| row.get(0))?;
    let floor = max_id
      .as_deref()
      .and_then(|id| id.parse::<u64>().ok())
      .unwrap_or(0);

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      last_id: AtomicU64::new(floor),
    })
  }

  /// Next id: current UTC time in microseconds, zero-padded to 20 digits,
  /// bumped past the previous id when the clock reads equal or backwards.
  fn generate_id(&self) -> String {
    let micros = Utc::now().timestamp_micros().max(0) as u64;
    let prev = self
      .last_id
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(micros.max(last + 1))
      })
      .unwrap_or(0);
    format!("{:020}", micros.max(prev + 1))
  }

  fn now_iso8601() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
  }

  /// Fill in empty `id`, `ts` and `kind` before persisting.
  fn normalize(&self, env: &Envelope) -> Envelope {
    let mut m = env.clone();
    if m.id.is_empty() {
      m.id = self.generate_id();
    }
    if m.ts.is_empty() {
      m.ts = Self::now_iso8601();
    }
    if m.kind.is_empty() {
      m.kind = "event".to_string();
    }
    m
  }
}

fn lock_conn(conn: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
  conn
    .lock()
    .map_err(|_| StoreError::Worker("connection lock poisoned".into()))
}

fn row_to_envelope(row: &rusqlite::Row<'_>) -> rusqlite::Result<Envelope> {
  let payload_json: String = row.get(5)?;
  // A corrupt payload column degrades to an empty payload; the row itself
  // is still returned.
  let payload = serde_json::from_str::<serde_json::Value>(&payload_json)
    .map(|v| Payload::from_json(&v))
    .unwrap_or_default();

  Ok(Envelope {
    id: row.get(0)?,
    kind: row.get(1)?,
    room: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
    ty: row.get(3)?,
    ts: row.get(4)?,
    payload,
  })
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
  async fn append(&self, env: &Envelope) -> Result<Envelope, StoreError> {
    let persisted = self.normalize(env);
    let conn = Arc::clone(&self.conn);
    let row = persisted.clone();

    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
      let conn = lock_conn(&conn)?;
      let room: Option<&str> = if row.room.is_empty() { None } else { Some(&row.room) };
      conn.execute(
        "INSERT OR REPLACE INTO messages (id, kind, room, type, ts, payload_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        params![
          row.id,
          row.kind,
          room,
          row.ty,
          row.ts,
          row.payload.to_json().to_string()
        ],
      )?;
      Ok(())
    })
    .await
    .map_err(|e| StoreError::Worker(e.to_string()))??;

    Ok(persisted)
  }

  async fn list_by_room(
    &self,
    room: &str,
    limit: usize,
    before_id: Option<&str>,
  ) -> Result<Vec<Envelope>, StoreError> {
    if limit == 0 {
      return Ok(Vec::new());
    }

    let conn = Arc::clone(&self.conn);
    let room = room.to_string();
    let before_id = before_id.map(str::to_string);

    tokio::task::spawn_blocking(move || -> Result<Vec<Envelope>, StoreError> {
      let conn = lock_conn(&conn)?;
      let mut out = Vec::new();

      match before_id {
        Some(before) => {
          let mut stmt = conn.prepare(
            "SELECT id, kind, room, type, ts, payload_json FROM messages
             WHERE room = ?1 AND id < ?2 ORDER BY id DESC LIMIT ?3;",
          )?;
          let rows = stmt.query_map(params![room, before, limit as i64], row_to_envelope)?;
          for row in rows {
            out.push(row?);
          }
        }
        None => {
          let mut stmt = conn.prepare(
            "SELECT id, kind, room, type, ts, payload_json FROM messages
             WHERE room = ?1 ORDER BY id DESC LIMIT ?2;",
          )?;
          let rows = stmt.query_map(params![room, limit as i64], row_to_envelope)?;
          for row in rows {
            out.push(row?);
          }
        }
      }

      Ok(out)
    })
    .await
    .map_err(|e| StoreError::Worker(e.to_string()))?
  }

  async fn replay_from(
    &self,
    start_id: &str,
    limit: usize,
  ) -> Result<Vec<Envelope>, StoreError> {
    if limit == 0 {
      return Ok(Vec::new());
    }

    let conn = Arc::clone(&self.conn);
    let start_id = start_id.to_string();

    tokio::task::spawn_blocking(move || -> Result<Vec<Envelope>, StoreError> {
      let conn = lock_conn(&conn)?;
      let mut stmt = conn.prepare(
        "SELECT id, kind, room, type, ts, payload_json FROM messages
         WHERE id > ?1 ORDER BY id ASC LIMIT ?2;",
      )?;
      let rows = stmt.query_map(params![start_id, limit as i64], row_to_envelope)?;

      let mut out = Vec::new();
      for row in rows {
        out.push(row?);
      }
      Ok(out)
    })
    .await
    .map_err(|e| StoreError::Worker(e.to_string()))?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::Payload;

  fn message(room: &str, text: &str) -> Envelope {
    Envelope::event("chat.message", Payload::from([("text", text)])).with_room(room)
  }

  #[tokio::test]
  async fn append_normalizes_id_ts_and_kind() {
    let store = SqliteMessageStore::open_in_memory().unwrap();
    let row = store.append(&message("africa", "hi")).await.unwrap();

    assert_eq!(row.id.len(), 20);
    assert!(row.id.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(row.kind, "event");
    assert!(row.ts.ends_with('Z'));
    assert_eq!(row.payload.get_str("text"), Some("hi"));
  }

  #[tokio::test]
  async fn append_keeps_caller_supplied_metadata() {
    let store = SqliteMessageStore::open_in_memory().unwrap();
    let env = message("", "x")
      .with_id("00000000000000000009")
      .with_kind("system");
    let row = store.append(&env).await.unwrap();
    assert_eq!(row.id, "00000000000000000009");
    assert_eq!(row.kind, "system");
  }

  #[tokio::test]
  async fn generated_ids_are_strictly_increasing() {
    let store = SqliteMessageStore::open_in_memory().unwrap();

    let mut ids = Vec::new();
    for _ in 0..64 {
      ids.push(store.append(&message("africa", "m")).await.unwrap().id);
    }

    for pair in ids.windows(2) {
      assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
    }
  }

  #[tokio::test]
  async fn append_with_same_id_is_an_upsert() {
    let store = SqliteMessageStore::open_in_memory().unwrap();
    let first = message("africa", "one").with_id("00000000000000000001");
    let second = message("africa", "two").with_id("00000000000000000001");

    store.append(&first).await.unwrap();
    store.append(&second).await.unwrap();

    let rows = store.list_by_room("africa", 10, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload.get_str("text"), Some("two"));
  }

  #[tokio::test]
  async fn list_by_room_is_newest_first_with_pagination() {
    let store = SqliteMessageStore::open_in_memory().unwrap();
    for i in 1..=5 {
      let env = message("africa", &format!("m{i}")).with_id(format!("{:020}", i));
      store.append(&env).await.unwrap();
    }
    store
      .append(&message("europe", "other").with_id(format!("{:020}", 6)))
      .await
      .unwrap();

    let latest = store.list_by_room("africa", 2, None).await.unwrap();
    let texts: Vec<_> = latest.iter().map(|e| e.payload.get_str("text").unwrap()).collect();
    assert_eq!(texts, vec!["m5", "m4"]);

    let older = store
      .list_by_room("africa", 10, Some(&format!("{:020}", 4)))
      .await
      .unwrap();
    let texts: Vec<_> = older.iter().map(|e| e.payload.get_str("text").unwrap()).collect();
    assert_eq!(texts, vec!["m3", "m2", "m1"]);

    assert!(store.list_by_room("africa", 0, None).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn replay_from_returns_strictly_newer_rows_oldest_first() {
    let store = SqliteMessageStore::open_in_memory().unwrap();
    for i in 1..=4 {
      let env = message("africa", &format!("m{i}")).with_id(format!("{:020}", i));
      store.append(&env).await.unwrap();
    }

    let replayed = store
      .replay_from(&format!("{:020}", 2), 10)
      .await
      .unwrap();
    let texts: Vec<_> = replayed.iter().map(|e| e.payload.get_str("text").unwrap()).collect();
    assert_eq!(texts, vec!["m3", "m4"]);

    let capped = store.replay_from("", 3).await.unwrap();
    assert_eq!(capped.len(), 3);
    assert_eq!(capped[0].payload.get_str("text"), Some("m1"));

    assert!(store.replay_from("", 0).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn roomless_messages_store_null_room() {
    let store = SqliteMessageStore::open_in_memory().unwrap();
    store.append(&message("", "global")).await.unwrap();

    assert!(store.list_by_room("africa", 10, None).await.unwrap().is_empty());

    let all = store.replay_from("", 10).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].room.is_empty());
  }

  #[tokio::test]
  async fn rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages.db");

    {
      let store = SqliteMessageStore::open(&path).unwrap();
      store.append(&message("africa", "durable")).await.unwrap();
    }

    let reopened = SqliteMessageStore::open(&path).unwrap();
    let rows = reopened.list_by_room("africa", 10, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload.get_str("text"), Some("durable"));

    // New ids keep sorting after everything already on disk.
    let next = reopened.append(&message("africa", "later")).await.unwrap();
    assert!(next.id > rows[0].id);
  }
}

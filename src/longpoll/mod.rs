//! HTTP long-polling fallback: per-session bounded buffers and the bridge
//! that mirrors WebSocket traffic into them.
//!
//! A "session" here is an application-level id (e.g. `room:africa` or
//! `broadcast`), not a WebSocket connection. Each buffer is a bounded FIFO
//! of envelopes with a TTL refreshed on every push and poll.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::metrics::{gauge_sub, WsMetrics};
use crate::protocol::Envelope;

mod bridge;

pub use bridge::{default_session_id, LongPollBridge};

struct LpBuffer {
  last_seen: Instant,
  queue: VecDeque<Envelope>,
}

impl LpBuffer {
  fn new() -> Self {
    Self {
      last_seen: Instant::now(),
      queue: VecDeque::new(),
    }
  }

  fn touch(&mut self) {
    self.last_seen = Instant::now();
  }

  fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
    now.duration_since(self.last_seen) > ttl
  }
}

/// Thread-safe manager of per-session long-polling buffers.
///
/// One mutex guards the whole map; metric deltas are computed inside the
/// lock so external observers see consistent values after each operation.
pub struct LongPollManager {
  ttl: Duration,
  max_buffer: usize,
  metrics: Arc<WsMetrics>,
  buffers: Mutex<HashMap<String, LpBuffer>>,
}

impl LongPollManager {
  pub fn new(ttl: Duration, max_buffer: usize, metrics: Arc<WsMetrics>) -> Self {
    Self {
      ttl,
      max_buffer: max_buffer.max(1),
      metrics,
      buffers: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LpBuffer>> {
    match self.buffers.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn get_or_create<'a>(
    &self,
    buffers: &'a mut HashMap<String, LpBuffer>,
    sid: &str,
  ) -> &'a mut LpBuffer {
    if !buffers.contains_key(sid) {
      self.metrics.lp_sessions_total.fetch_add(1, Ordering::Relaxed);
      self.metrics.lp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }
    buffers.entry(sid.to_string()).or_insert_with(LpBuffer::new)
  }

  /// Enqueue an envelope for `sid`, evicting from the head when the buffer
  /// would exceed its bound.
  pub fn push_to(&self, sid: &str, env: Envelope) {
    let mut buffers = self.lock();
    let max = self.max_buffer;
    let buffer = self.get_or_create(&mut buffers, sid);

    let before = buffer.queue.len();
    buffer.queue.push_back(env);
    while buffer.queue.len() > max {
      buffer.queue.pop_front();
    }
    buffer.touch();
    let after = buffer.queue.len();

    self
      .metrics
      .lp_messages_enqueued_total
      .fetch_add(1, Ordering::Relaxed);
    if after > before {
      self
        .metrics
        .lp_messages_buffered
        .fetch_add((after - before) as u64, Ordering::Relaxed);
    } else if before > after {
      gauge_sub(&self.metrics.lp_messages_buffered, (before - after) as u64);
    }
  }

  /// Remove and return up to `max` envelopes for `sid`, FIFO.
  ///
  /// Absent buffers are created on demand unless `create_if_missing` is
  /// false, in which case the poll still counts but returns nothing.
  pub fn poll(&self, sid: &str, max: usize, create_if_missing: bool) -> Vec<Envelope> {
    let mut buffers = self.lock();
    self.metrics.lp_polls_total.fetch_add(1, Ordering::Relaxed);

    if !buffers.contains_key(sid) && !create_if_missing {
      return Vec::new();
    }

    let buffer = self.get_or_create(&mut buffers, sid);

    let n = max.min(buffer.queue.len());
    let out: Vec<Envelope> = buffer.queue.drain(..n).collect();
    buffer.touch();

    if !out.is_empty() {
      self
        .metrics
        .lp_messages_drained_total
        .fetch_add(out.len() as u64, Ordering::Relaxed);
      gauge_sub(&self.metrics.lp_messages_buffered, out.len() as u64);
    }

    out
  }

  /// Drop every buffer idle past the TTL, updating the session and
  /// buffered-message gauges.
  pub fn sweep_expired(&self) {
    let now = Instant::now();
    let mut buffers = self.lock();

    let mut dropped_sessions = 0u64;
    let mut dropped_messages = 0u64;
    buffers.retain(|_, buffer| {
      if buffer.is_expired(self.ttl, now) {
        dropped_sessions += 1;
        dropped_messages += buffer.queue.len() as u64;
        false
      } else {
        true
      }
    });

    if dropped_sessions > 0 {
      gauge_sub(&self.metrics.lp_sessions_active, dropped_sessions);
    }
    if dropped_messages > 0 {
      gauge_sub(&self.metrics.lp_messages_buffered, dropped_messages);
    }
  }

  pub fn session_count(&self) -> usize {
    self.lock().len()
  }

  pub fn buffer_size(&self, sid: &str) -> usize {
    self.lock().get(sid).map(|b| b.queue.len()).unwrap_or(0)
  }

  pub fn metrics(&self) -> &Arc<WsMetrics> {
    &self.metrics
  }
}

//! Atomic counters and gauges for WebSocket and long-polling activity,
//! rendered in Prometheus text exposition format (v0.0.4).

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters for WebSocket + long-polling activity.
///
/// All fields are lock-free atomics; mutation is safe from any thread.
/// Readers see a consistent value per metric, not a snapshot across them.
#[derive(Debug, Default)]
pub struct WsMetrics {
  // Core WebSocket metrics
  pub connections_total: AtomicU64,
  pub connections_active: AtomicU64,
  pub messages_in_total: AtomicU64,
  pub messages_out_total: AtomicU64,
  pub errors_total: AtomicU64,

  // Long-polling fallback metrics
  pub lp_sessions_total: AtomicU64,
  pub lp_sessions_active: AtomicU64,
  pub lp_polls_total: AtomicU64,
  pub lp_messages_buffered: AtomicU64,
  pub lp_messages_enqueued_total: AtomicU64,
  pub lp_messages_drained_total: AtomicU64,
}

/// Decrement a gauge without ever underflowing.
pub(crate) fn gauge_sub(gauge: &AtomicU64, n: u64) {
  let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
    Some(v.saturating_sub(n))
  });
}

impl WsMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Render all metrics in Prometheus text format.
  pub fn render_prometheus(&self) -> String {
    let mut out = String::with_capacity(2048);

    let mut metric = |name: &str, help: &str, kind: &str, value: u64| {
      let _ = writeln!(out, "# HELP wren_ws_{name} {help}");
      let _ = writeln!(out, "# TYPE wren_ws_{name} {kind}");
      let _ = writeln!(out, "wren_ws_{name} {value}\n");
    };

    metric(
      "connections_total",
      "Total WebSocket connections created",
      "counter",
      self.connections_total.load(Ordering::Relaxed),
    );
    metric(
      "connections_active",
      "Current active WebSocket connections",
      "gauge",
      self.connections_active.load(Ordering::Relaxed),
    );
    metric(
      "messages_in_total",
      "Total number of WebSocket messages received",
      "counter",
      self.messages_in_total.load(Ordering::Relaxed),
    );
    metric(
      "messages_out_total",
      "Total number of WebSocket messages sent",
      "counter",
      self.messages_out_total.load(Ordering::Relaxed),
    );
    metric(
      "errors_total",
      "Total number of WebSocket errors",
      "counter",
      self.errors_total.load(Ordering::Relaxed),
    );
    metric(
      "lp_sessions_total",
      "Total long-polling sessions ever created",
      "counter",
      self.lp_sessions_total.load(Ordering::Relaxed),
    );
    metric(
      "lp_sessions_active",
      "Current active long-polling sessions",
      "gauge",
      self.lp_sessions_active.load(Ordering::Relaxed),
    );
    metric(
      "lp_polls_total",
      "Total /ws/poll HTTP calls",
      "counter",
      self.lp_polls_total.load(Ordering::Relaxed),
    );
    metric(
      "lp_messages_buffered",
      "Current buffered messages for long-polling",
      "gauge",
      self.lp_messages_buffered.load(Ordering::Relaxed),
    );
    metric(
      "lp_messages_enqueued_total",
      "Total messages enqueued into long-poll buffers",
      "counter",
      self.lp_messages_enqueued_total.load(Ordering::Relaxed),
    );
    metric(
      "lp_messages_drained_total",
      "Total messages drained via /ws/poll",
      "counter",
      self.lp_messages_drained_total.load(Ordering::Relaxed),
    );

    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn render_contains_help_type_and_sample() {
    let metrics = WsMetrics::new();
    metrics.connections_total.store(3, Ordering::Relaxed);
    metrics.lp_messages_buffered.store(7, Ordering::Relaxed);

    let text = metrics.render_prometheus();
    assert!(text.contains("# HELP wren_ws_connections_total Total WebSocket connections created"));
    assert!(text.contains("# TYPE wren_ws_connections_total counter"));
    assert!(text.contains("wren_ws_connections_total 3"));
    assert!(text.contains("# TYPE wren_ws_lp_messages_buffered gauge"));
    assert!(text.contains("wren_ws_lp_messages_buffered 7"));
  }

  #[test]
  fn every_metric_is_rendered() {
    let text = WsMetrics::new().render_prometheus();
    for name in [
      "connections_total",
      "connections_active",
      "messages_in_total",
      "messages_out_total",
      "errors_total",
      "lp_sessions_total",
      "lp_sessions_active",
      "lp_polls_total",
      "lp_messages_buffered",
      "lp_messages_enqueued_total",
      "lp_messages_drained_total",
    ] {
      assert!(text.contains(&format!("wren_ws_{name} ")), "missing {name}");
    }
  }

  #[test]
  fn gauges_never_underflow() {
    let metrics = WsMetrics::new();
    metrics.lp_sessions_active.store(1, Ordering::Relaxed);
    gauge_sub(&metrics.lp_sessions_active, 5);
    assert_eq!(metrics.lp_sessions_active.load(Ordering::Relaxed), 0);
  }
}

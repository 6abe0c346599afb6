//! Typed configuration for the messaging runtime.
//!
//! Deserializable from TOML or JSON with per-field defaults, then clamped
//! into the runtime [`WsConfig`] so invalid values never reach the server.

use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub websocket: WsSection,

  #[serde(default)]
  pub storage: StorageSection,

  #[serde(default)]
  pub longpoll: LongPollSection,
}

/// Raw `[websocket]` section as read from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct WsSection {
  #[serde(default = "default_port")]
  pub port: u16,

  #[serde(default = "default_max_message_size")]
  pub max_message_size: usize,

  /// Idle timeout in seconds; 0 disables the idle close.
  #[serde(default = "default_idle_timeout")]
  pub idle_timeout: u64,

  #[serde(default = "default_enable_deflate")]
  pub enable_deflate: bool,

  /// Server-initiated ping interval in seconds; 0 disables pings.
  #[serde(default = "default_ping_interval")]
  pub ping_interval: u64,

  #[serde(default = "default_auto_ping_pong")]
  pub auto_ping_pong: bool,
}

fn default_port() -> u16 {
  9090
}

fn default_max_message_size() -> usize {
  64 * 1024
}

fn default_idle_timeout() -> u64 {
  60
}

fn default_enable_deflate() -> bool {
  true
}

fn default_ping_interval() -> u64 {
  30
}

fn default_auto_ping_pong() -> bool {
  true
}

impl Default for WsSection {
  fn default() -> Self {
    Self {
      port: default_port(),
      max_message_size: default_max_message_size(),
      idle_timeout: default_idle_timeout(),
      enable_deflate: default_enable_deflate(),
      ping_interval: default_ping_interval(),
      auto_ping_pong: default_auto_ping_pong(),
    }
  }
}

/// `[storage]` section. No path means the runtime runs without a durable
/// message store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSection {
  #[serde(default)]
  pub path: Option<String>,
}

/// `[longpoll]` section: buffer TTL and sizing for the fallback bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct LongPollSection {
  /// Buffer TTL in seconds.
  #[serde(default = "default_session_ttl")]
  pub session_ttl: u64,

  /// Max buffered envelopes per session id (drop-oldest beyond this).
  #[serde(default = "default_max_buffer")]
  pub max_buffer: usize,

  /// Interval between expired-buffer sweeps, in seconds.
  #[serde(default = "default_sweep_interval")]
  pub sweep_interval: u64,
}

fn default_session_ttl() -> u64 {
  60
}

fn default_max_buffer() -> usize {
  256
}

fn default_sweep_interval() -> u64 {
  30
}

impl Default for LongPollSection {
  fn default() -> Self {
    Self {
      session_ttl: default_session_ttl(),
      max_buffer: default_max_buffer(),
      sweep_interval: default_sweep_interval(),
    }
  }
}

/// Validated WebSocket tunables consumed by the server and sessions.
#[derive(Debug, Clone)]
pub struct WsConfig {
  pub port: u16,
  /// Maximum accepted inbound payload size in bytes.
  pub max_message_size: usize,
  /// Idle timeout; `Duration::ZERO` disables the idle close.
  pub idle_timeout: Duration,
  /// Permessage-deflate knob (on/off only).
  pub enable_deflate: bool,
  /// Server-initiated ping interval; `Duration::ZERO` disables pings.
  pub ping_interval: Duration,
  /// Answer protocol pings automatically.
  pub auto_ping_pong: bool,
}

impl Default for WsConfig {
  fn default() -> Self {
    WsConfig::from_section(&WsSection::default())
  }
}

impl WsConfig {
  /// Clamp a raw section into valid runtime values:
  /// port outside 1024..=65535 falls back to 9090, message size floors at
  /// 1 KiB, idle timeout floors at 5 s (0 keeps its disable meaning).
  pub fn from_section(raw: &WsSection) -> Self {
    let port = if raw.port >= 1024 { raw.port } else { default_port() };

    let idle_timeout = if raw.idle_timeout == 0 {
      Duration::ZERO
    } else {
      Duration::from_secs(raw.idle_timeout.max(5))
    };

    WsConfig {
      port,
      max_message_size: raw.max_message_size.max(1024),
      idle_timeout,
      enable_deflate: raw.enable_deflate,
      ping_interval: Duration::from_secs(raw.ping_interval),
      auto_ping_pong: raw.auto_ping_pong,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_documented_values() {
    let cfg = WsConfig::default();
    assert_eq!(cfg.port, 9090);
    assert_eq!(cfg.max_message_size, 64 * 1024);
    assert_eq!(cfg.idle_timeout, Duration::from_secs(60));
    assert!(cfg.enable_deflate);
    assert_eq!(cfg.ping_interval, Duration::from_secs(30));
    assert!(cfg.auto_ping_pong);
  }

  #[test]
  fn port_below_1024_falls_back_to_default() {
    let raw = WsSection {
      port: 80,
      ..WsSection::default()
    };
    assert_eq!(WsConfig::from_section(&raw).port, 9090);
  }

  #[test]
  fn message_size_floors_at_one_kib() {
    let raw = WsSection {
      max_message_size: 16,
      ..WsSection::default()
    };
    assert_eq!(WsConfig::from_section(&raw).max_message_size, 1024);
  }

  #[test]
  fn idle_timeout_floors_at_five_seconds_but_zero_disables() {
    let floored = WsSection {
      idle_timeout: 2,
      ..WsSection::default()
    };
    assert_eq!(
      WsConfig::from_section(&floored).idle_timeout,
      Duration::from_secs(5)
    );

    let disabled = WsSection {
      idle_timeout: 0,
      ..WsSection::default()
    };
    assert_eq!(WsConfig::from_section(&disabled).idle_timeout, Duration::ZERO);
  }

  #[test]
  fn sections_deserialize_with_defaults() {
    let cfg: Config = serde_json::from_str(r#"{"websocket":{"port":9200}}"#).unwrap();
    assert_eq!(cfg.websocket.port, 9200);
    assert_eq!(cfg.websocket.idle_timeout, 60);
    assert_eq!(cfg.longpoll.max_buffer, 256);
    assert!(cfg.storage.path.is_none());
  }
}

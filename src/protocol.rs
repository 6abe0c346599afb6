//! Typed JSON envelope protocol for WebSocket text frames.
//!
//! Wire format:
//!
//! ```json
//! {
//!   "id":      "00000000000000000042",
//!   "kind":    "event",
//!   "ts":      "2025-12-07T10:15:30Z",
//!   "room":    "africa",
//!   "type":    "chat.message",
//!   "payload": { "user": "alice", "text": "hi" }
//! }
//! ```
//!
//! `type` is required and non-empty; every other envelope field is optional
//! and represented as an empty string when absent. The payload is an
//! insertion-ordered key/value mapping, which maps 1:1 to a message-store
//! row (`id, kind, room, type, ts, payload_json`).

use serde_json::json;

/// A single payload value: null, bool, integer, float, string, array or
/// nested mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  Array(Vec<Value>),
  Map(Payload),
}

impl Value {
  /// Borrow the string content, if this value is a string.
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Int(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Float(f) => Some(*f),
      Value::Int(n) => Some(*n as f64),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  /// Convert from a parsed JSON value. Integers that fit `i64` stay
  /// integers; every other JSON number becomes a float.
  pub fn from_json(v: &serde_json::Value) -> Value {
    match v {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Bool(b) => Value::Bool(*b),
      serde_json::Value::Number(n) => {
        if let Some(i) = n.as_i64() {
          Value::Int(i)
        } else {
          Value::Float(n.as_f64().unwrap_or(0.0))
        }
      }
      serde_json::Value::String(s) => Value::Str(s.clone()),
      serde_json::Value::Array(items) => {
        Value::Array(items.iter().map(Value::from_json).collect())
      }
      serde_json::Value::Object(_) => Value::Map(Payload::from_json(v)),
    }
  }

  pub fn to_json(&self) -> serde_json::Value {
    match self {
      Value::Null => serde_json::Value::Null,
      Value::Bool(b) => json!(b),
      Value::Int(n) => json!(n),
      Value::Float(f) => json!(f),
      Value::Str(s) => json!(s),
      Value::Array(items) => {
        serde_json::Value::Array(items.iter().map(Value::to_json).collect())
      }
      Value::Map(p) => p.to_json(),
    }
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<i64> for Value {
  fn from(n: i64) -> Self {
    Value::Int(n)
  }
}

impl From<f64> for Value {
  fn from(f: f64) -> Self {
    Value::Float(f)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::Str(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::Str(s)
  }
}

/// Insertion-ordered key/value mapping used as the envelope payload.
///
/// Duplicate keys are retained in insertion order; lookups are last-wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
  entries: Vec<(String, Value)>,
}

impl Payload {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    self.entries.push((key.into(), value.into()));
  }

  /// Builder-style `push`, handy when assembling payloads inline.
  pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.push(key, value);
    self
  }

  /// Last-wins lookup by key.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.entries.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
  }

  /// Last-wins string lookup; `None` if the key is absent or not a string.
  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.get(key).and_then(Value::as_str)
  }

  pub fn get_i64(&self, key: &str) -> Option<i64> {
    self.get(key).and_then(Value::as_i64)
  }

  pub fn get_bool(&self, key: &str) -> Option<bool> {
    self.get(key).and_then(Value::as_bool)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
    self.entries.iter()
  }

  /// Convert a JSON object into a payload, preserving key order.
  /// Anything that is not an object yields an empty payload.
  pub fn from_json(v: &serde_json::Value) -> Payload {
    let mut payload = Payload::new();
    if let serde_json::Value::Object(map) = v {
      for (key, value) in map {
        payload.push(key.clone(), Value::from_json(value));
      }
    }
    payload
  }

  /// Serialize to a JSON object. Keys keep their first-occurrence position;
  /// duplicate keys collapse last-wins.
  pub fn to_json(&self) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in &self.entries {
      map.insert(key.clone(), value.to_json());
    }
    serde_json::Value::Object(map)
  }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Payload {
  fn from(entries: [(K, V); N]) -> Self {
    let mut payload = Payload::new();
    for (k, v) in entries {
      payload.push(k, v);
    }
    payload
  }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Payload {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut payload = Payload::new();
    for (k, v) in iter {
      payload.push(k, v);
    }
    payload
  }
}

/// Protocol envelope carried by WebSocket text frames.
///
/// Maps 1:1 to a message-store row. `id`, `kind`, `ts` and `room` use
/// empty-string-means-absent semantics so call sites stay light.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
  /// Stable identifier, lexicographically sortable in creation order.
  pub id: String,
  /// Broad category: "event", "system", "error", "history", ...
  pub kind: String,
  /// ISO-8601 UTC timestamp.
  pub ts: String,
  /// Logical room / channel. Empty means no room.
  pub room: String,
  /// Business message type, e.g. "chat.message". Required, non-empty.
  pub ty: String,
  /// Application payload.
  pub payload: Payload,
}

impl Envelope {
  /// New envelope with just `type` and `payload` set.
  pub fn event(ty: impl Into<String>, payload: Payload) -> Self {
    Envelope {
      ty: ty.into(),
      payload,
      ..Default::default()
    }
  }

  pub fn with_room(mut self, room: impl Into<String>) -> Self {
    self.room = room.into();
    self
  }

  pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
    self.kind = kind.into();
    self
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = id.into();
    self
  }

  /// Parse an envelope from a JSON text frame.
  ///
  /// Total: malformed JSON, non-object input, or a missing/empty/non-string
  /// `type` all yield `None`. Optional fields default to empty; a
  /// non-object `payload` becomes an empty payload.
  pub fn parse(text: &str) -> Option<Envelope> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    Envelope::from_json(&value)
  }

  /// Same as [`Envelope::parse`], starting from an already-parsed value.
  pub fn from_json(value: &serde_json::Value) -> Option<Envelope> {
    let obj = value.as_object()?;

    let field = |name: &str| -> String {
      obj
        .get(name)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string()
    };

    let ty = field("type");
    if ty.is_empty() {
      return None;
    }

    let payload = obj.get("payload").map(Payload::from_json).unwrap_or_default();

    Some(Envelope {
      id: field("id"),
      kind: field("kind"),
      ts: field("ts"),
      room: field("room"),
      ty,
      payload,
    })
  }

  /// Serialize to a JSON text frame. Empty optional fields are omitted;
  /// `type` and `payload` are always present.
  pub fn serialize(&self) -> String {
    self.to_json().to_string()
  }

  /// Serialize to a JSON value, for embedding in larger documents
  /// (e.g. the `/ws/poll` response array).
  pub fn to_json(&self) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    if !self.id.is_empty() {
      obj.insert("id".into(), json!(self.id));
    }
    if !self.kind.is_empty() {
      obj.insert("kind".into(), json!(self.kind));
    }
    if !self.ts.is_empty() {
      obj.insert("ts".into(), json!(self.ts));
    }
    if !self.room.is_empty() {
      obj.insert("room".into(), json!(self.room));
    }
    obj.insert("type".into(), json!(self.ty));
    obj.insert("payload".into(), self.payload.to_json());
    serde_json::Value::Object(obj)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_requires_type() {
    assert!(Envelope::parse(r#"{"payload":{}}"#).is_none());
    assert!(Envelope::parse(r#"{"type":""}"#).is_none());
    assert!(Envelope::parse(r#"{"type":42}"#).is_none());
  }

  #[test]
  fn parse_is_total() {
    assert!(Envelope::parse("").is_none());
    assert!(Envelope::parse("not json").is_none());
    assert!(Envelope::parse("[1,2,3]").is_none());
    assert!(Envelope::parse("\"just a string\"").is_none());
    assert!(Envelope::parse("{\"type\": \"x\"").is_none());
  }

  #[test]
  fn parse_defaults_optional_fields() {
    let env = Envelope::parse(r#"{"type":"chat.message"}"#).unwrap();
    assert_eq!(env.ty, "chat.message");
    assert!(env.id.is_empty());
    assert!(env.kind.is_empty());
    assert!(env.ts.is_empty());
    assert!(env.room.is_empty());
    assert!(env.payload.is_empty());
  }

  #[test]
  fn parse_ignores_non_string_metadata() {
    let env = Envelope::parse(r#"{"type":"x","id":7,"room":null,"payload":[1]}"#).unwrap();
    assert!(env.id.is_empty());
    assert!(env.room.is_empty());
    assert!(env.payload.is_empty());
  }

  #[test]
  fn serialize_omits_empty_fields() {
    let env = Envelope::event("chat.message", Payload::from([("user", "alice")]));
    let text = env.serialize();
    assert!(!text.contains("\"id\""));
    assert!(!text.contains("\"kind\""));
    assert!(!text.contains("\"room\""));
    assert!(text.contains("\"type\":\"chat.message\""));
    assert!(text.contains("\"user\":\"alice\""));
  }

  #[test]
  fn round_trip_preserves_envelope() {
    let mut payload = Payload::new();
    payload.push("user", "alice");
    payload.push("count", 3i64);
    payload.push("ratio", 0.5f64);
    payload.push("ok", true);
    payload.push("note", Value::Null);
    payload.push("tags", Value::Array(vec![Value::from("a"), Value::from("b")]));
    payload.push("meta", Value::Map(Payload::from([("nested", "yes")])));

    let env = Envelope {
      id: "00000000000000000001".into(),
      kind: "event".into(),
      ts: "2025-12-07T10:15:30Z".into(),
      room: "africa".into(),
      ty: "chat.message".into(),
      payload,
    };

    let parsed = Envelope::parse(&env.serialize()).unwrap();
    assert_eq!(parsed, env);
  }

  #[test]
  fn numbers_split_by_source_kind() {
    let env = Envelope::parse(r#"{"type":"t","payload":{"i":3,"f":3.0,"neg":-7}}"#).unwrap();
    assert_eq!(env.payload.get("i"), Some(&Value::Int(3)));
    assert_eq!(env.payload.get("f"), Some(&Value::Float(3.0)));
    assert_eq!(env.payload.get("neg"), Some(&Value::Int(-7)));
  }

  #[test]
  fn payload_preserves_insertion_order() {
    let env = Envelope::parse(r#"{"type":"t","payload":{"z":1,"a":2,"m":3}}"#).unwrap();
    let keys: Vec<&str> = env.payload.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["z", "a", "m"]);
  }

  #[test]
  fn duplicate_keys_are_last_wins_on_lookup() {
    let mut payload = Payload::new();
    payload.push("user", "alice");
    payload.push("user", "bob");
    assert_eq!(payload.len(), 2);
    assert_eq!(payload.get_str("user"), Some("bob"));

    // Serialization collapses duplicates at the first key position.
    let env = Envelope::event("t", payload);
    let text = env.serialize();
    assert_eq!(text.matches("\"user\"").count(), 1);
    assert!(text.contains("\"user\":\"bob\""));
  }

  #[test]
  fn nested_structures_survive_round_trip() {
    let text = r#"{"type":"t","payload":{"list":[{"k":1},[true,null]],"obj":{"inner":{"deep":"v"}}}}"#;
    let env = Envelope::parse(text).unwrap();
    let again = Envelope::parse(&env.serialize()).unwrap();
    assert_eq!(env, again);
  }
}

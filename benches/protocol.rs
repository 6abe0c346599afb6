use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wren::{Envelope, Payload, Value};

fn sample_text() -> String {
  r#"{"id":"00000000000000000042","kind":"event","ts":"2025-12-07T10:15:30Z","room":"africa","type":"chat.message","payload":{"user":"alice","text":"hello room","count":3,"ratio":0.25,"tags":["a","b","c"],"meta":{"client":"web","retry":false}}}"#
    .to_string()
}

fn sample_envelope() -> Envelope {
  let mut payload = Payload::new();
  payload.push("user", "alice");
  payload.push("text", "hello room");
  payload.push("count", 3i64);
  payload.push("ratio", 0.25f64);
  payload.push(
    "tags",
    Value::Array(vec![Value::from("a"), Value::from("b"), Value::from("c")]),
  );
  Envelope::event("chat.message", payload).with_room("africa")
}

fn parse(c: &mut Criterion) {
  let mut group = c.benchmark_group("protocol_parse");
  let text = sample_text();

  group.bench_function("parse_full_envelope", |b| {
    b.iter(|| black_box(Envelope::parse(black_box(&text))));
  });

  group.bench_function("parse_rejects_garbage", |b| {
    b.iter(|| black_box(Envelope::parse(black_box("{\"no\":\"type\"}"))));
  });

  group.finish();
}

fn serialize(c: &mut Criterion) {
  let mut group = c.benchmark_group("protocol_serialize");
  let env = sample_envelope();

  group.bench_function("serialize_full_envelope", |b| {
    b.iter(|| black_box(env.serialize()));
  });

  group.bench_function("round_trip", |b| {
    b.iter(|| black_box(Envelope::parse(&env.serialize())));
  });

  group.finish();
}

criterion_group!(benches, parse, serialize);
criterion_main!(benches);

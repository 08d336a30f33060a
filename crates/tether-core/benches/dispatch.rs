//! Dispatch benchmarks for tether-core.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use std::sync::Arc;
use tether_core::binding::enrich_postgres_payload;
use tether_core::{Channel, ChannelOptions, Frame, PostgresTransformer, RefCounter, Socket, SocketError};

#[derive(Default)]
struct NullSocket {
    refs: RefCounter,
}

impl Socket for NullSocket {
    fn is_connected(&self) -> bool {
        true
    }

    fn push(&self, _frame: Frame) -> Result<(), SocketError> {
        Ok(())
    }

    fn make_ref(&self) -> String {
        self.refs.next_ref()
    }

    fn has_logger(&self) -> bool {
        false
    }
}

fn joined_channel() -> Channel {
    let socket: Arc<dyn Socket> = Arc::new(NullSocket::default());
    let channel = Channel::new("realtime:bench", socket, ChannelOptions::default()).unwrap();
    channel.subscribe(|_, _| {}).unwrap();

    let join_ref = channel.join_ref().unwrap();
    channel
        .handle_frame(Frame::reply("realtime:bench", join_ref, "ok", json!({})))
        .unwrap();
    channel
}

fn bench_broadcast_dispatch(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    let mut group = c.benchmark_group("broadcast_dispatch");
    for bindings in [1usize, 10, 100] {
        let channel = joined_channel();
        for i in 0..bindings {
            let event = if i % 2 == 0 { "cursor" } else { "*" };
            channel.on_broadcast(event, |payload| {
                black_box(payload);
            });
        }

        let frame = Frame::new(
            "realtime:bench",
            "broadcast",
            json!({"type": "broadcast", "event": "cursor", "payload": {"x": 10, "y": 20}}),
        );

        group.throughput(Throughput::Elements(bindings as u64));
        group.bench_with_input(BenchmarkId::from_parameter(bindings), &frame, |b, frame| {
            b.iter(|| channel.handle_frame(black_box(frame.clone())).unwrap())
        });
    }
    group.finish();
}

fn bench_postgres_enrichment(c: &mut Criterion) {
    let transformer = PostgresTransformer::new();
    let payload: Value = json!({
        "ids": [1],
        "data": {
            "schema": "public",
            "table": "todos",
            "commit_timestamp": "2024-05-01T10:00:00Z",
            "type": "UPDATE",
            "columns": [
                {"name": "id", "type": "int8"},
                {"name": "done", "type": "bool"},
                {"name": "meta", "type": "jsonb"},
                {"name": "tags", "type": "_text"},
                {"name": "updated_at", "type": "timestamp"}
            ],
            "record": {
                "id": "42",
                "done": "t",
                "meta": "{\"priority\": 3}",
                "tags": "{home,urgent}",
                "updated_at": "2024-05-01 10:00:00"
            },
            "old_record": {"id": "42"},
            "errors": null
        }
    });

    c.bench_function("postgres_enrichment", |b| {
        b.iter(|| enrich_postgres_payload(black_box(&payload), &transformer))
    });
}

criterion_group!(benches, bench_broadcast_dispatch, bench_postgres_enrichment);
criterion_main!(benches);

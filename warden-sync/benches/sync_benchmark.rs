use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use warden_core::{
    GovernedId, MemoryRegistry, Operation, PendingOperation, SettingScope, StaticDirectory,
    Targets,
};
use warden_sync::{
    Authority, AuthorityStore, Domain, Envelope, Frame, MemoryBackend, OperationQueue,
    RevisionLedger, Settings, SyncChannel, SyncMessage,
};

fn push_frame() -> Frame {
    let push = warden_sync::Push {
        id: GovernedId::new("moduleA", "volume"),
        value: json!(0.5),
        soft: true,
        revision: Some(7),
        targets: Some([Uuid::new_v4(), Uuid::new_v4()].into()),
        requires_reload: false,
    };
    Frame::Message(Envelope::new(Uuid::new_v4(), Settings::push_message(push)))
}

fn bench_push_encode(c: &mut Criterion) {
    let frame = push_frame();
    c.bench_function("push_frame_encode", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_push_decode(c: &mut Criterion) {
    let encoded = push_frame().encode().unwrap();
    c.bench_function("push_frame_decode", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_route_push(c: &mut Criterion) {
    let Frame::Message(envelope) = push_frame() else {
        return;
    };
    c.bench_function("route_push", |b| {
        b.iter(|| black_box(Settings::route(black_box(&envelope.message))))
    });
}

fn bench_queue_enqueue_1000(c: &mut Criterion) {
    let ids: Vec<GovernedId> = (0..100)
        .map(|i| GovernedId::new("bench", format!("key{i}")))
        .collect();

    c.bench_function("queue_enqueue_1000", |b| {
        b.iter(|| {
            let mut queue = OperationQueue::new();
            for i in 0..1000 {
                let operation = if i % 2 == 0 {
                    Operation::Soft { enable: true }
                } else {
                    Operation::Lock {
                        targets: Targets::new(),
                    }
                };
                queue.enqueue(PendingOperation {
                    id: ids[i % ids.len()].clone(),
                    value: json!(i),
                    requires_reload: false,
                    operation,
                });
            }
            black_box(queue.len())
        })
    });
}

fn bench_flush_100_soft(c: &mut Criterion) {
    let registry = Arc::new(MemoryRegistry::new());
    let ids: Vec<GovernedId> = (0..100)
        .map(|i| GovernedId::new("bench", format!("key{i}")))
        .collect();
    for id in &ids {
        registry.register(id.clone(), SettingScope::Client, json!("value"), false);
    }
    let channel = Arc::new(SyncChannel::new(1024));
    let authority = Authority::<Settings>::new(
        Uuid::new_v4(),
        AuthorityStore::open(Arc::new(MemoryBackend::new()))
            .unwrap()
            .into_shared(),
        registry,
        Arc::new(StaticDirectory::default()),
        channel,
        Duration::ZERO,
    );

    c.bench_function("flush_100_soft_enables", |b| {
        b.iter(|| {
            for id in &ids {
                authority.queue_soft(id, true).unwrap();
            }
            black_box(authority.flush().unwrap())
        })
    });
}

fn bench_ledger_gate(c: &mut Criterion) {
    let ledger = RevisionLedger::<Settings>::open(Arc::new(MemoryBackend::new())).unwrap();
    let id = GovernedId::new("moduleA", "theme");
    ledger.mark_handled(&id, Some(12), &json!("dark")).unwrap();

    c.bench_function("ledger_is_handled", |b| {
        b.iter(|| black_box(ledger.is_handled(black_box(&id), black_box(12))))
    });
}

fn bench_channel_publish(c: &mut Criterion) {
    let channel = SyncChannel::new(1024);
    let _rx = channel.subscribe(Uuid::new_v4());
    let sender = Uuid::new_v4();

    c.bench_function("channel_publish_refresh", |b| {
        b.iter(|| black_box(channel.publish(sender, SyncMessage::Refresh).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_push_encode,
    bench_push_decode,
    bench_route_push,
    bench_queue_enqueue_1000,
    bench_flush_100_soft,
    bench_ledger_gate,
    bench_channel_publish,
);
criterion_main!(benches);

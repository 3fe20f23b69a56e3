//! Apply engine benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use outpost_core::{
    ApplyEngine, ApplyOptions, Database, EventBus, RecordType, SessionId, SnapshotDirection, SnapshotEntry,
};
use outpost_sync_protocol::WireRecord;
use outpost_testkit::{clinic_registry, payload};
use serde_json::json;
use std::sync::Arc;

/// A pull of `patients` patients with `per_patient` encounters each.
fn pull_batch(patients: usize, per_patient: usize) -> Vec<SnapshotEntry> {
    let mut entries = Vec::with_capacity(patients * (per_patient + 1));
    for p in 0..patients {
        let patient = format!("p{p:06}");
        for e in 0..per_patient {
            entries.push(
                WireRecord {
                    record_type: RecordType::from("encounters"),
                    record_id: format!("e{p:06}-{e}").into(),
                    data: payload(json!({"patient_id": patient, "reason": "checkup", "visit": e})),
                    is_deleted: false,
                    deleted_at: None,
                    updated_at_sync_tick: 1,
                }
                .into_entry(),
            );
        }
        entries.push(
            WireRecord {
                record_type: RecordType::from("patients"),
                record_id: patient.as_str().into(),
                data: payload(json!({"name": format!("Patient {p}")})),
                is_deleted: false,
                deleted_at: None,
                updated_at_sync_tick: 1,
            }
            .into_entry(),
        );
    }
    entries
}

fn staged(entries: &[SnapshotEntry]) -> (Arc<Database>, SessionId) {
    let db = Arc::new(Database::new(clinic_registry()));
    let session = SessionId::generate();
    db.snapshots().open(session);
    db.snapshots()
        .insert(session, SnapshotDirection::Incoming, entries.iter().cloned())
        .unwrap();
    (db, session)
}

/// Benchmark applying a staged pull into an empty store.
fn bench_apply_into_empty_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_into_empty_store");

    for patients in [100usize, 1_000, 5_000].iter() {
        let entries = pull_batch(*patients, 4);
        group.throughput(Throughput::Elements(entries.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(patients), &entries, |b, entries| {
            b.iter_batched(
                || staged(entries),
                |(db, session)| {
                    let report = ApplyEngine::new(db, Arc::new(EventBus::new()))
                        .apply_session(black_box(session), ApplyOptions::at(2))
                        .unwrap();
                    black_box(report);
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

/// Benchmark re-applying a pull the store already holds.
fn bench_apply_unchanged(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_unchanged");

    for patients in [100usize, 1_000].iter() {
        let entries = pull_batch(*patients, 4);
        group.throughput(Throughput::Elements(entries.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(patients), &entries, |b, entries| {
            let (db, session) = staged(entries);
            let engine = ApplyEngine::new(Arc::clone(&db), Arc::new(EventBus::new()));
            engine.apply_session(session, ApplyOptions::at(2)).unwrap();

            b.iter(|| {
                let report = engine.apply_session(black_box(session), ApplyOptions::at(3)).unwrap();
                black_box(report);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_apply_into_empty_store, bench_apply_unchanged);
criterion_main!(benches);

//! Properties that must hold for any data the generators can produce.

use outpost_core::{
    ApplyEngine, ApplyOptions, ChunkPlanner, ConflictGuard, CoreError, Database, EventBus, RecordDraft, RecordKey,
    RecordType, SessionId, SnapshotDirection, SnapshotEntry, TickWindow, WriteGateway, NEVER_SYNCED,
};
use outpost_sync_engine::{SyncEngine, SyncResult, SyncTransport};
use outpost_sync_protocol::{SyncMessage, WireRecord};
use outpost_testkit::prelude::*;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn entries(batch: &[WireRecord]) -> Vec<SnapshotEntry> {
    batch.iter().cloned().map(WireRecord::into_entry).collect()
}

fn stage(db: &Database, batch: &[WireRecord]) -> SessionId {
    let session = SessionId::generate();
    db.snapshots().open(session);
    db.snapshots()
        .insert(session, SnapshotDirection::Incoming, entries(batch))
        .unwrap();
    session
}

proptest! {
    #[test]
    fn chunk_plans_are_disjoint_bounded_and_covering(
        ids in id_set_strategy(300),
        limit in 1usize..40,
    ) {
        let space = SyntheticIdSpace::from_ids(ids);
        let plan = ChunkPlanner::new(limit)
            .unwrap()
            .plan(&space, &"encounters".into(), TickWindow::after(NEVER_SYNCED))
            .unwrap();

        prop_assert_eq!(plan.total, space.len());
        if space.is_empty() {
            prop_assert!(plan.chunks.is_empty());
            return Ok(());
        }
        prop_assert_eq!(plan.chunks[0].range.from_id.as_ref(), space.ids().first());
        prop_assert!(plan.chunks.last().unwrap().range.to_id.is_none());
        for pair in plan.chunks.windows(2) {
            prop_assert_eq!(pair[0].range.to_id.as_ref(), pair[1].range.from_id.as_ref());
        }
        for chunk in &plan.chunks {
            let inside = space.ids().iter().filter(|id| chunk.range.contains(id)).count();
            prop_assert_eq!(inside, chunk.count);
            prop_assert!(chunk.count <= limit || chunk.count == 1);
        }
        for id in space.ids() {
            prop_assert_eq!(plan.chunks.iter().filter(|c| c.range.contains(id)).count(), 1);
        }
    }

    #[test]
    fn shuffled_batches_apply_parents_first(batch in patient_batch_strategy()) {
        let db = Arc::new(Database::new(clinic_registry()));
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe_channel();
        let session = stage(&db, &batch);

        let report = ApplyEngine::new(Arc::clone(&db), bus)
            .apply_session(session, ApplyOptions::at(7))
            .unwrap();
        prop_assert_eq!(report.created, batch.len());
        prop_assert!(report.rejected.is_empty());

        let order: Vec<RecordType> = events.try_iter().map(|e| e.record_type).collect();
        prop_assert_eq!(order.len(), batch.len());
        let first_encounter = order.iter().position(|t| t.as_str() == "encounters");
        let last_patient = order.iter().rposition(|t| t.as_str() == "patients");
        if let (Some(first_encounter), Some(last_patient)) = (first_encounter, last_patient) {
            prop_assert!(last_patient < first_encounter);
        }
        prop_assert!(db.records(&"encounters".into()).iter().all(|r| r.updated_at_sync_tick == 7));
    }

    #[test]
    fn applying_the_same_pull_twice_changes_nothing(batch in patient_batch_strategy()) {
        let db = Arc::new(Database::new(clinic_registry()));
        let bus = Arc::new(EventBus::new());
        let engine = ApplyEngine::new(Arc::clone(&db), Arc::clone(&bus));

        let first = engine.apply_session(stage(&db, &batch), ApplyOptions::at(3)).unwrap();
        prop_assert_eq!(first.changed(), batch.len());

        let events = bus.subscribe_channel();
        let second = engine.apply_session(stage(&db, &batch), ApplyOptions::at(4)).unwrap();
        prop_assert_eq!(second.changed(), 0);
        prop_assert_eq!(second.unchanged, batch.len());
        prop_assert_eq!(events.try_iter().count(), 0);
        prop_assert!(db.records(&"patients".into()).iter().all(|r| r.updated_at_sync_tick == 3));
    }

    #[test]
    fn only_records_stamped_after_the_baseline_conflict(
        baseline in 0i64..50,
        ticks in prop::collection::vec(0i64..100, 1..20),
    ) {
        let db = Arc::new(Database::new(clinic_registry()));
        let gateway = WriteGateway::new(Arc::clone(&db), Arc::new(EventBus::new()));
        let staged: Vec<SnapshotEntry> = ticks
            .iter()
            .enumerate()
            .map(|(i, tick)| {
                let key = RecordKey::new("patients", format!("p{i}"));
                let draft = RecordDraft::new("patients", key.record_id.clone(), payload(json!({}))).with_tick(*tick);
                gateway.write(|w| w.save(draft)).unwrap();
                SnapshotEntry::from_record(&db.get(&key).unwrap())
            })
            .collect();

        let conflicts: BTreeSet<String> = ConflictGuard::new(baseline)
            .find_conflicts(&db, &staged)
            .into_iter()
            .map(|key| key.record_id.as_str().to_owned())
            .collect();
        let expected: BTreeSet<String> = ticks
            .iter()
            .enumerate()
            .filter(|(_, tick)| **tick > baseline)
            .map(|(i, _)| format!("p{i}"))
            .collect();
        prop_assert_eq!(conflicts, expected);
    }
}

#[test]
fn out_of_order_batches_are_refused_before_any_write() {
    let db = Arc::new(Database::new(clinic_registry()));
    let engine = ApplyEngine::new(Arc::clone(&db), Arc::new(EventBus::new()));
    let wire = |record_type: &str, id: &str, data| {
        WireRecord {
            record_type: record_type.into(),
            record_id: id.into(),
            data: payload(data),
            is_deleted: false,
            deleted_at: None,
            updated_at_sync_tick: 1,
        }
        .into_entry()
    };
    let patient = wire("patients", "p1", json!({"name": "Ana"}));
    let encounter = wire("encounters", "e1", json!({"patient_id": "p1"}));

    let err = engine
        .apply_batches(
            vec![
                ("encounters".into(), vec![encounter]),
                ("patients".into(), vec![patient]),
            ],
            ApplyOptions::at(2),
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::OrderingViolation { .. }));
    assert_eq!(db.count(&"encounters".into()), 0);
    assert_eq!(db.count(&"patients".into()), 0);
}

/// Lets the authority edit a record right before the node's first push lands.
struct InterferingTransport {
    inner: InProcessTransport,
    armed: AtomicBool,
}

impl SyncTransport for InterferingTransport {
    fn send(&self, request: SyncMessage) -> SyncResult<SyncMessage> {
        if matches!(request, SyncMessage::Push(_)) && self.armed.swap(false, Ordering::SeqCst) {
            self.inner
                .server()
                .write(|w| {
                    w.update(
                        "patients".into(),
                        ClinicSeed::patient(0, 0).as_str().into(),
                        payload(json!({"name": "Central edit"})),
                    )
                })
                .expect("authority write failed");
        }
        self.inner.send(request)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn close(&self) -> SyncResult<()> {
        self.inner.close()
    }
}

#[test]
fn concurrent_authority_edit_forces_a_restart_not_a_lost_update() {
    let authority = test_authority(1_000);
    ClinicSeed::default().seed(&authority);
    let transport = InterferingTransport {
        inner: InProcessTransport::new(Arc::clone(&authority)),
        armed: AtomicBool::new(false),
    };
    let db = Arc::new(Database::new(clinic_registry()));
    let node = SyncEngine::new(test_node_config("node-f0", ["f0"]), transport, db).unwrap();
    node.sync().unwrap();

    let patient = ClinicSeed::patient(0, 0);
    node.write(|w| {
        w.update(
            "patients".into(),
            patient.as_str().into(),
            payload(json!({"name": "Field edit"})),
        )
    })
    .unwrap();
    node.transport().armed.store(true, Ordering::SeqCst);

    let report = node.sync().unwrap();
    assert_eq!(report.restarts, 1);
    assert_eq!(node.stats().conflicts, 1);
    assert_eq!(authority.open_sessions(), 0);

    // The restarted session pushed against a baseline that includes the
    // central edit, so the field edit is the later write.
    let key = RecordKey::new("patients", patient.as_str());
    let central = authority.database().get(&key).unwrap();
    assert_eq!(central.field_str("name"), Some("Field edit"));
    assert_converged(&authority, &node, &["f0"]);
}

/// Edits a node row while the pull is being planned and records what the
/// node pushes.
struct LocalEditTransport {
    inner: InProcessTransport,
    gateway: WriteGateway,
    armed: AtomicBool,
    pushed: parking_lot::Mutex<Vec<RecordKey>>,
}

impl SyncTransport for LocalEditTransport {
    fn send(&self, request: SyncMessage) -> SyncResult<SyncMessage> {
        match &request {
            SyncMessage::InitiatePull(_) if self.armed.swap(false, Ordering::SeqCst) => {
                self.gateway
                    .update(
                        "encounters",
                        ClinicSeed::encounter(0, 0, 0).as_str(),
                        payload(json!({"patient_id": ClinicSeed::patient(0, 0), "reason": "field edit"})),
                    )
                    .expect("node write failed");
            }
            SyncMessage::Push(push) => {
                self.pushed
                    .lock()
                    .extend(push.records.iter().map(|r| RecordKey::new(r.record_type.clone(), r.record_id.clone())));
            }
            _ => {}
        }
        self.inner.send(request)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn close(&self) -> SyncResult<()> {
        self.inner.close()
    }
}

#[test]
fn restarted_session_pushes_only_local_edits_after_an_apply_conflict() {
    let authority = test_authority(1_000);
    ClinicSeed::default().seed(&authority);
    let db = Arc::new(Database::new(clinic_registry()));
    let transport = LocalEditTransport {
        inner: InProcessTransport::new(Arc::clone(&authority)),
        gateway: WriteGateway::new(Arc::clone(&db), Arc::new(EventBus::new())),
        armed: AtomicBool::new(false),
        pushed: parking_lot::Mutex::new(Vec::new()),
    };
    let node = SyncEngine::new(test_node_config("node-f0", ["f0"]), transport, db).unwrap();
    node.sync().unwrap();

    // The pull carries a patient and an encounter; the node edits the
    // encounter after sealing, so applying the pull conflicts.
    let (patient, encounter) = (ClinicSeed::patient(0, 0), ClinicSeed::encounter(0, 0, 0));
    authority
        .write(|w| {
            w.update("patients".into(), patient.as_str().into(), payload(json!({"name": "Central edit"})))?;
            w.update(
                "encounters".into(),
                encounter.as_str().into(),
                payload(json!({"patient_id": patient, "reason": "central edit"})),
            )
        })
        .unwrap();
    let central_patient_tick = authority
        .database()
        .get(&RecordKey::new("patients", patient.as_str()))
        .unwrap()
        .updated_at_sync_tick;
    node.transport().pushed.lock().clear();
    node.transport().armed.store(true, Ordering::SeqCst);

    let report = node.sync().unwrap();
    assert_eq!(report.restarts, 1);
    assert_eq!(node.stats().conflicts, 1);

    // Nothing from the conflicting pull was applied, so nothing pulled was
    // pushed back.
    let encounter_key = RecordKey::new("encounters", encounter.as_str());
    assert_eq!(*node.transport().pushed.lock(), vec![encounter_key.clone()]);
    let central = authority.database().get(&RecordKey::new("patients", patient.as_str())).unwrap();
    assert_eq!(central.field_str("name"), Some("Central edit"));
    assert_eq!(central.updated_at_sync_tick, central_patient_tick);
    assert_eq!(
        authority.database().get(&encounter_key).unwrap().field_str("reason"),
        Some("field edit")
    );
    assert_converged(&authority, &node, &["f0"]);
}

#[test]
fn baselines_never_move_backwards() {
    let authority = test_authority(3);
    ClinicSeed::default().seed(&authority);
    let mut harness = SyncHarness::new(Arc::clone(&authority));
    let node = harness.add_node("f0");

    let mut last = (NEVER_SYNCED, NEVER_SYNCED);
    for round in 0..5 {
        authority
            .write(|w| {
                w.insert(
                    "encounters".into(),
                    format!("central-{round}").as_str().into(),
                    payload(json!({"patient_id": ClinicSeed::patient(0, round % 3)})),
                )
            })
            .unwrap();
        harness
            .node(node)
            .write(|w| {
                w.insert(
                    "encounters".into(),
                    format!("field-{round}").as_str().into(),
                    payload(json!({"patient_id": ClinicSeed::patient(0, 0)})),
                )
            })
            .unwrap();

        let report = harness.sync_all().remove(node);
        assert!(report.pushed_through >= last.0);
        assert!(report.pulled_through >= last.1);
        assert!(report.pulled_through <= authority.clock().current_tick().unwrap());
        last = (report.pushed_through, report.pulled_through);
        harness.assert_all_converged();
    }
}

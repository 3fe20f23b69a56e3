//! Authority behavior under concurrent nodes and scope changes.

use outpost_core::{
    payload_from_value, Payload, RecordKey, ScopeRule, SyncDirection, Tick, TypeDefinition, TypeRegistry,
};
use outpost_sync_protocol::{
    AdvanceSessionRequest, InitiatePullRequest, PullRequest, PushRequest, SessionPhase, StartSessionRequest,
    StartStatus,
};
use outpost_sync_server::{ServerConfig, SyncServer};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn registry() -> Arc<TypeRegistry> {
    Arc::new(
        TypeRegistry::builder()
            .register(TypeDefinition::new("facilities", SyncDirection::PullOnly))
            .register(TypeDefinition::new("patients", SyncDirection::Bidirectional).with_scope(ScopeRule::Subject))
            .register(
                TypeDefinition::new("patient_facilities", SyncDirection::Bidirectional)
                    .with_scope(ScopeRule::association("patient_id", "facility_id"))
                    .with_reference("patient_id", "patients")
                    .with_reference("facility_id", "facilities"),
            )
            .register(
                TypeDefinition::new("encounters", SyncDirection::Bidirectional)
                    .with_scope(ScopeRule::subject_field("patient_id"))
                    .with_reference("patient_id", "patients"),
            )
            .build()
            .unwrap(),
    )
}

fn data(value: serde_json::Value) -> Payload {
    payload_from_value(value).unwrap()
}

/// Two facilities, one patient each, two encounters per patient.
fn seeded(config: ServerConfig) -> Arc<SyncServer> {
    let server = Arc::new(SyncServer::new(config, registry()).unwrap());
    server
        .write(|w| {
            for (facility, patient) in [("f1", "p1"), ("f2", "p2")] {
                w.insert("facilities".into(), facility.into(), data(json!({"name": facility})))?;
                w.insert("patients".into(), patient.into(), data(json!({"name": patient})))?;
                w.insert(
                    "patient_facilities".into(),
                    format!("a-{patient}").into(),
                    data(json!({"patient_id": patient, "facility_id": facility})),
                )?;
                for e in 0..2 {
                    w.insert(
                        "encounters".into(),
                        format!("{patient}-e{e}").into(),
                        data(json!({"patient_id": patient, "visit": e})),
                    )?;
                }
            }
            Ok(())
        })
        .unwrap();
    server
}

fn tick_of(server: &SyncServer, record_type: &str, id: &str) -> Tick {
    server
        .database()
        .get(&RecordKey::new(record_type, id))
        .unwrap()
        .updated_at_sync_tick
}

/// Runs a push-nothing session for `scopes` and returns every pulled key.
fn pull_keys(server: &SyncServer, node: &str, scopes: &[&str], since: Tick) -> BTreeSet<String> {
    let started = server
        .handle_start(StartSessionRequest::new(
            node.into(),
            scopes.iter().map(|s| (*s).to_owned()).collect(),
            since,
        ))
        .unwrap();
    let session_id = started.session_id.unwrap();
    let advance = |phase| {
        server
            .handle_advance(AdvanceSessionRequest {
                session_id,
                phase,
                from_tick: since,
            })
            .unwrap();
    };
    advance(SessionPhase::Pushing);
    server
        .handle_push(PushRequest {
            session_id,
            records: Vec::new(),
            complete: true,
        })
        .unwrap();
    advance(SessionPhase::PullPlanning);
    let plan = server
        .handle_initiate_pull(InitiatePullRequest {
            session_id,
            since_tick: since,
            record_types: None,
            full_resync_types: Vec::new(),
        })
        .unwrap();

    let mut keys = BTreeSet::new();
    for type_plan in plan.types {
        let page = server
            .handle_pull(PullRequest {
                session_id,
                since_tick: since,
                record_type: type_plan.record_type.clone(),
                cursor: None,
                limit: 1_000,
            })
            .unwrap();
        assert!(page.done);
        keys.extend(page.entries.iter().map(|e| format!("{}/{}", e.record_type, e.record_id)));
    }
    keys
}

#[test]
fn concurrent_starts_for_one_node_admit_exactly_one() {
    let server = seeded(ServerConfig::new(100));
    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));

    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let server = Arc::clone(&server);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                server
                    .handle_start(StartSessionRequest::new("node-1".into(), vec!["f1".to_owned()], -1))
                    .unwrap()
                    .status
            })
        })
        .collect();
    let statuses: Vec<StartStatus> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(statuses.iter().filter(|s| **s == StartStatus::Started).count(), 1);
    assert_eq!(
        statuses.iter().filter(|s| **s == StartStatus::AlreadyActive).count(),
        contenders - 1
    );
    assert_eq!(server.open_sessions(), 1);
}

#[test]
fn distinct_nodes_start_in_parallel() {
    let server = seeded(ServerConfig::new(100));
    let handles: Vec<_> = (0..4)
        .map(|n| {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                server
                    .handle_start(StartSessionRequest::new(
                        format!("node-{n}").into(),
                        vec!["f1".to_owned()],
                        -1,
                    ))
                    .unwrap()
                    .status
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), StartStatus::Started);
    }
    assert_eq!(server.open_sessions(), 4);
}

#[test]
fn reassignment_restamps_only_the_moved_subtree() {
    let server = seeded(ServerConfig::new(100));
    let seeded_at = tick_of(&server, "patients", "p1");
    let untouched = tick_of(&server, "encounters", "p2-e0");

    let moved_at = server
        .write(|w| {
            w.update(
                "patient_facilities".into(),
                "a-p1".into(),
                data(json!({"patient_id": "p1", "facility_id": "f2"})),
            )?;
            Ok(w.tick())
        })
        .unwrap();
    assert!(moved_at > seeded_at);

    assert_eq!(tick_of(&server, "patients", "p1"), moved_at);
    assert_eq!(tick_of(&server, "encounters", "p1-e0"), moved_at);
    assert_eq!(tick_of(&server, "encounters", "p1-e1"), moved_at);
    assert_eq!(tick_of(&server, "encounters", "p2-e0"), untouched);
    assert_eq!(tick_of(&server, "patients", "p2"), untouched);
    assert_eq!(server.scope().scopes_of_subject(&"p1".into()), BTreeSet::from(["f2".to_owned()]));

    // A node that already had everything for f2 up to the seed gets the
    // newcomer with its whole history.
    let keys = pull_keys(&server, "node-south", &["f2"], seeded_at);
    let expected: BTreeSet<String> = [
        "patient_facilities/a-p1",
        "patients/p1",
        "encounters/p1-e0",
        "encounters/p1-e1",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();
    assert_eq!(keys, expected);

    // The old facility no longer sees the patient.
    let keys = pull_keys(&server, "node-north", &["f1"], -1);
    assert!(!keys.contains("patients/p1"));
    assert!(keys.contains("facilities/f1"));
}

#[test]
fn seals_separate_sessions_from_later_writes() {
    let server = seeded(ServerConfig::new(100));
    let first = server
        .handle_start(StartSessionRequest::new("node-1".into(), vec!["f1".to_owned()], -1))
        .unwrap();
    let written_at = server
        .write(|w| {
            w.insert("encounters".into(), "p1-e9".into(), data(json!({"patient_id": "p1"})))?;
            Ok(w.tick())
        })
        .unwrap();
    assert!(written_at > first.from_tick);

    let second = server
        .handle_start(StartSessionRequest::new("node-2".into(), vec!["f1".to_owned()], -1))
        .unwrap();
    assert!(second.from_tick >= written_at);
}

#[tokio::test]
async fn lapse_sweeper_frees_abandoned_sessions() {
    let mut config = ServerConfig::new(100).with_session_lapse_timeout(Duration::from_millis(20));
    config.lapse_check_interval = Duration::from_millis(10);
    let server = seeded(config);
    let sweeper = server.spawn_lapse_sweeper();

    let started = server
        .handle_start(StartSessionRequest::new("node-1".into(), vec!["f1".to_owned()], -1))
        .unwrap();
    assert_eq!(started.status, StartStatus::Started);
    assert_eq!(server.open_sessions(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.open_sessions(), 0);
    let again = server
        .handle_start(StartSessionRequest::new("node-1".into(), vec!["f1".to_owned()], -1))
        .unwrap();
    assert_eq!(again.status, StartStatus::Started);

    drop(server);
    tokio::time::timeout(Duration::from_secs(1), sweeper).await.unwrap().unwrap();
}

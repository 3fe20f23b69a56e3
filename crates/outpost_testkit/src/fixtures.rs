//! Test fixtures: a clinic-shaped registry, seeded authorities and nodes.
//!
//! The registry mirrors a small health-records deployment. Facilities are
//! global reference data, patients are the scope subject, the
//! patient-facility table assigns patients to facilities, and encounters
//! and prescriptions hang off patients.

use crate::integration::InProcessTransport;
use outpost_core::{
    payload_from_value, CoreConfig, Database, Payload, ScopeRule, SyncDirection, Tick, TypeDefinition, TypeRegistry,
};
use outpost_sync_engine::{SyncConfig, SyncEngine};
use outpost_sync_server::{ServerConfig, SyncServer};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// A node wired to an in-process authority.
pub type TestNode = SyncEngine<InProcessTransport>;

/// The clinic registry.
pub fn clinic_registry() -> Arc<TypeRegistry> {
    let registry = TypeRegistry::builder()
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
        .register(
            TypeDefinition::new("prescriptions", SyncDirection::Bidirectional)
                .with_scope(ScopeRule::parent_field("encounter_id"))
                .with_reference("encounter_id", "encounters"),
        )
        .register(TypeDefinition::new("device_logs", SyncDirection::PushOnly))
        .build()
        .expect("clinic registry is valid");
    Arc::new(registry)
}

/// Builds a payload from a JSON object literal.
pub fn payload(value: Value) -> Payload {
    payload_from_value(value).expect("payload must be a JSON object")
}

/// An authority over the clinic registry.
pub fn test_authority(max_chunk_size: usize) -> Arc<SyncServer> {
    let config = ServerConfig::new(max_chunk_size);
    Arc::new(SyncServer::new(config, clinic_registry()).expect("failed to start authority"))
}

/// Node configuration used by [`test_node`].
pub fn test_node_config<I, S>(node_id: &str, scopes: I) -> SyncConfig
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    SyncConfig::new(node_id, "memory://authority")
        .with_scopes(scopes)
        .with_core(CoreConfig::new(1_000))
}

/// A node with an empty store, scoped to `scopes`.
pub fn test_node<I, S>(authority: &Arc<SyncServer>, node_id: &str, scopes: I) -> TestNode
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    test_node_with_config(authority, test_node_config(node_id, scopes))
}

/// A node with an empty store and the given configuration.
pub fn test_node_with_config(authority: &Arc<SyncServer>, config: SyncConfig) -> TestNode {
    let db = Arc::new(Database::new(clinic_registry()));
    SyncEngine::new(config, InProcessTransport::new(Arc::clone(authority)), db).expect("invalid node config")
}

/// Writes `config` to a temporary JSON file.
pub fn write_config_file(config: &SyncConfig) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    serde_json::to_writer_pretty(&mut file, config).expect("failed to serialize config");
    file.flush().expect("failed to flush config");
    file
}

/// Deterministic clinic data.
///
/// Facility `f{f}` holds patients `p{f}-{p}` (assigned through
/// `a{f}-{p}`), each with encounters `e{f}-{p}-{e}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClinicSeed {
    /// Number of facilities.
    pub facilities: usize,
    /// Patients assigned to each facility.
    pub patients_per_facility: usize,
    /// Encounters per patient.
    pub encounters_per_patient: usize,
}

impl Default for ClinicSeed {
    fn default() -> Self {
        Self {
            facilities: 2,
            patients_per_facility: 3,
            encounters_per_patient: 2,
        }
    }
}

impl ClinicSeed {
    /// Id of facility `f`.
    pub fn facility(f: usize) -> String {
        format!("f{f}")
    }

    /// Id of patient `p` of facility `f`.
    pub fn patient(f: usize, p: usize) -> String {
        format!("p{f}-{p}")
    }

    /// Id of encounter `e` of patient `p` of facility `f`.
    pub fn encounter(f: usize, p: usize, e: usize) -> String {
        format!("e{f}-{p}-{e}")
    }

    /// Records a node scoped to one facility receives on its first pull.
    pub fn in_scope_per_facility(&self) -> u64 {
        (self.facilities + self.patients_per_facility * (2 + self.encounters_per_patient)) as u64
    }

    /// Writes the seed through the authority's write path in one
    /// transaction. Returns the tick it was stamped with.
    pub fn seed(&self, authority: &SyncServer) -> Tick {
        authority
            .write(|w| {
                for f in 0..self.facilities {
                    let facility = Self::facility(f);
                    w.insert(
                        "facilities".into(),
                        facility.as_str().into(),
                        payload(json!({"name": format!("Facility {f}")})),
                    )?;
                    for p in 0..self.patients_per_facility {
                        let patient = Self::patient(f, p);
                        w.insert(
                            "patients".into(),
                            patient.as_str().into(),
                            payload(json!({"name": format!("Patient {f}/{p}")})),
                        )?;
                        w.insert(
                            "patient_facilities".into(),
                            format!("a{f}-{p}").as_str().into(),
                            payload(json!({"patient_id": patient, "facility_id": facility})),
                        )?;
                        for e in 0..self.encounters_per_patient {
                            w.insert(
                                "encounters".into(),
                                Self::encounter(f, p, e).as_str().into(),
                                payload(json!({"patient_id": patient, "reason": "checkup", "visit": e})),
                            )?;
                        }
                    }
                }
                Ok(w.tick())
            })
            .expect("failed to seed authority")
    }
}



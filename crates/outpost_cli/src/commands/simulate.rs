//! Simulate command implementation.
//!
//! Seeds an in-process authority with clinic data, attaches one node per
//! facility and runs sync rounds. Each round every node records a visit,
//! the authority records a referral per facility, and every node syncs.

use super::{CliError, CliResult};
use outpost_core::NodeId;
use outpost_sync_engine::SyncConfig;
use outpost_sync_protocol::SyncStatus;
use outpost_sync_server::{ServerConfig, SyncServer};
use outpost_testkit::{clinic_registry, payload, test_node_config, test_node_with_config, ClinicSeed, TestNode};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Facilities, one node each.
    pub facilities: usize,
    /// Patients assigned to each facility.
    pub patients_per_facility: usize,
    /// Encounters per patient in the seed.
    pub encounters_per_patient: usize,
    /// Sync rounds.
    pub rounds: usize,
    /// Authority chunk size when no server config file is given.
    pub chunk_size: usize,
    /// Authority configuration file.
    pub server_config: Option<PathBuf>,
    /// Node configuration template file.
    pub node_config: Option<PathBuf>,
}

/// One node's outcome in one round.
#[derive(Debug, Serialize)]
pub struct RoundResult {
    /// Round number, from 1.
    pub round: usize,
    /// Node id.
    pub node_id: String,
    /// Records pushed.
    pub pushed: u64,
    /// Records pulled.
    pub pulled: u64,
    /// Local rows changed by the pull.
    pub applied: usize,
    /// Conflict restarts.
    pub restarts: u32,
    /// New pull baseline.
    pub pulled_through: i64,
}

/// One node at the end of the simulation.
#[derive(Debug, Serialize)]
pub struct NodeSummary {
    /// Node id.
    pub node_id: String,
    /// Facility the node replicates.
    pub facility: String,
    /// Records held locally, across pulled types.
    pub local_records: usize,
    /// Authority records in the node's scope.
    pub expected_records: usize,
    /// Sessions completed.
    pub sessions: u64,
    /// Conflict restarts across all sessions.
    pub conflicts: u64,
    /// Status as a node would report it.
    pub status: SyncStatus,
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulationResult {
    /// Authority tick at the end.
    pub authority_tick: i64,
    /// Records held by the authority.
    pub authority_records: usize,
    /// Per-round outcomes.
    pub rounds: Vec<RoundResult>,
    /// Per-node summaries.
    pub nodes: Vec<NodeSummary>,
}

impl SimulationResult {
    /// Returns true if every node holds exactly its scope.
    pub fn converged(&self) -> bool {
        self.nodes.iter().all(|n| n.local_records == n.expected_records)
    }
}

/// Runs the simulation.
pub fn simulate(options: &SimulateOptions) -> CliResult<SimulationResult> {
    if options.facilities == 0 {
        return Err(CliError::InvalidArgument("at least one facility is required".into()));
    }
    if options.patients_per_facility == 0 {
        return Err(CliError::InvalidArgument("at least one patient per facility is required".into()));
    }

    let server_config = match &options.server_config {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::new(options.chunk_size),
    };
    let authority = Arc::new(SyncServer::new(server_config, clinic_registry())?);
    let seed = ClinicSeed {
        facilities: options.facilities,
        patients_per_facility: options.patients_per_facility,
        encounters_per_patient: options.encounters_per_patient,
    };
    let seeded_at = seed.seed(&authority);
    info!(facilities = seed.facilities, tick = seeded_at, "seeded authority");

    let template = match &options.node_config {
        Some(path) => Some(SyncConfig::from_json_file(path)?),
        None => None,
    };
    let mut nodes: Vec<(String, TestNode)> = Vec::with_capacity(options.facilities);
    for f in 0..options.facilities {
        let facility = ClinicSeed::facility(f);
        let node_id = format!("node-{facility}");
        let config = match &template {
            Some(template) => {
                let mut config = template.clone();
                config.node_id = NodeId::from(node_id.as_str());
                config.scopes = vec![facility.clone()];
                config
            }
            None => test_node_config(&node_id, [facility.as_str()]),
        };
        config.validate()?;
        nodes.push((facility, test_node_with_config(&authority, config)));
    }

    let mut rounds = Vec::new();
    for round in 1..=options.rounds {
        authority.write(|w| {
            for f in 0..options.facilities {
                w.insert(
                    "encounters".into(),
                    format!("referral-{round}-{f}").as_str().into(),
                    payload(json!({"patient_id": ClinicSeed::patient(f, 0), "reason": "referral"})),
                )?;
            }
            Ok(())
        })?;

        for (f, (_, node)) in nodes.iter().enumerate() {
            let patient = ClinicSeed::patient(f, round % seed.patients_per_facility);
            node.write(|w| {
                w.insert(
                    "encounters".into(),
                    format!("visit-{round}-{f}").as_str().into(),
                    payload(json!({"patient_id": patient, "reason": "visit"})),
                )
            })?;
            let report = node.sync_with_retry()?;
            rounds.push(RoundResult {
                round,
                node_id: node.config().node_id.to_string(),
                pushed: report.pushed,
                pulled: report.pulled,
                applied: report.applied.changed(),
                restarts: report.restarts,
                pulled_through: report.pulled_through,
            });
        }
    }

    // A quiet round so every node sees the others' last pushes.
    for (_, node) in &nodes {
        node.sync_with_retry()?;
    }

    let central = authority.database();
    let pull_types = central.registry().pull_types();
    let summaries = nodes
        .iter()
        .map(|(facility, node)| {
            let scopes: BTreeSet<String> = [facility.clone()].into_iter().collect();
            let expected_records = pull_types
                .iter()
                .flat_map(|t| central.records(t))
                .filter(|r| authority.scope().is_in_scope(r, &scopes))
                .count();
            let local_records = pull_types.iter().map(|t| node.database().count(t)).sum();
            let stats = node.stats();
            NodeSummary {
                node_id: node.config().node_id.to_string(),
                facility: facility.clone(),
                local_records,
                expected_records,
                sessions: stats.sessions_completed,
                conflicts: stats.conflicts,
                status: node.status(),
            }
        })
        .collect();

    Ok(SimulationResult {
        authority_tick: authority.clock().current_tick()?,
        authority_records: pull_types.iter().map(|t| central.count(t)).sum(),
        rounds,
        nodes: summaries,
    })
}

/// Runs the simulate command.
pub fn run(options: &SimulateOptions, format: &str) -> CliResult<()> {
    let result = simulate(options)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }
    Ok(())
}

fn print_text_output(result: &SimulationResult) {
    println!("Outpost Sync Simulation");
    println!("=======================");
    println!();
    println!("Authority:");
    println!("  Current tick: {}", result.authority_tick);
    println!("  Records:      {}", result.authority_records);
    println!();
    println!("Rounds:");
    for r in &result.rounds {
        println!(
            "  [{}] {:<12} pushed {:>4}  pulled {:>4}  applied {:>4}  restarts {}  pulled through {}",
            r.round, r.node_id, r.pushed, r.pulled, r.applied, r.restarts, r.pulled_through
        );
    }
    println!();
    println!("Nodes:");
    for n in &result.nodes {
        println!(
            "  {:<12} {} records ({} expected), {} sessions, {} conflicts, last tick {}",
            n.node_id,
            n.local_records,
            n.expected_records,
            n.sessions,
            n.conflicts,
            n.status
                .last_completed_tick
                .map_or_else(|| "-".to_owned(), |t| t.to_string())
        );
    }
    println!();
    if result.converged() {
        println!("✓ All nodes converged");
    } else {
        println!("✗ Some nodes hold records outside their scope or are missing records");
    }
}



//! Stress runs: many nodes syncing while the authority keeps writing.

use crate::fixtures::{payload, test_authority, test_node_config, test_node_with_config, ClinicSeed};
use crate::integration::assert_converged;
use outpost_sync_engine::RetryConfig;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Sessions attempted across all nodes.
    pub sessions: usize,
    /// Sessions that completed.
    pub completed: usize,
    /// Sessions that failed after retries.
    pub failed: usize,
    /// Conflict restarts across all nodes.
    pub conflicts: u64,
    /// Wall time of the run.
    pub duration: Duration,
}

impl StressTestResult {
    /// Completed sessions per second.
    pub fn sessions_per_second(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.completed as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Sessions: {}", self.sessions);
        println!("Completed: {}", self.completed);
        println!("Failed: {}", self.failed);
        println!("Conflict restarts: {}", self.conflicts);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} sessions/sec", self.sessions_per_second());
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Nodes, one per facility.
    pub nodes: usize,
    /// Sync rounds per node.
    pub rounds: usize,
    /// Records each node writes per round.
    pub writes_per_round: usize,
    /// Records the authority writes per round.
    pub authority_writes_per_round: usize,
    /// Authority chunk size.
    pub max_chunk_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            nodes: 4,
            rounds: 5,
            writes_per_round: 3,
            authority_writes_per_round: 5,
            max_chunk_size: 8,
        }
    }
}

/// Runs every node on its own thread against one authority, then checks
/// that each node converged after a final quiet sync.
pub fn run_sync_stress(config: &StressConfig) -> StressTestResult {
    let authority = test_authority(config.max_chunk_size);
    let seed = ClinicSeed {
        facilities: config.nodes,
        ..ClinicSeed::default()
    };
    seed.seed(&authority);

    let nodes: Vec<_> = (0..config.nodes)
        .map(|f| {
            let node_config = test_node_config(&format!("node-{f}"), [ClinicSeed::facility(f)])
                .with_retry(RetryConfig::new(5).with_initial_delay(Duration::from_millis(5)));
            Arc::new(test_node_with_config(&authority, node_config))
        })
        .collect();

    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let writer = {
        let authority = Arc::clone(&authority);
        let config = config.clone();
        thread::spawn(move || {
            for round in 0..config.rounds {
                for i in 0..config.authority_writes_per_round {
                    let f = i % config.nodes;
                    let patient = ClinicSeed::patient(f, i % seed.patients_per_facility);
                    authority
                        .write(|w| {
                            w.insert(
                                "encounters".into(),
                                format!("central-{round}-{i}").as_str().into(),
                                payload(json!({"patient_id": patient, "reason": "referral"})),
                            )
                        })
                        .expect("authority write failed");
                }
                thread::yield_now();
            }
        })
    };

    let handles: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(f, node)| {
            let node = Arc::clone(node);
            let config = config.clone();
            let completed = Arc::clone(&completed);
            let failed = Arc::clone(&failed);
            thread::spawn(move || {
                for round in 0..config.rounds {
                    for i in 0..config.writes_per_round {
                        let patient = ClinicSeed::patient(f, i % seed.patients_per_facility);
                        node.write(|w| {
                            w.insert(
                                "encounters".into(),
                                format!("n{f}-{round}-{i}").as_str().into(),
                                payload(json!({"patient_id": patient, "reason": "visit"})),
                            )
                        })
                        .expect("node write failed");
                    }
                    match node.sync_with_retry() {
                        Ok(_) => completed.fetch_add(1, Ordering::SeqCst),
                        Err(_) => failed.fetch_add(1, Ordering::SeqCst),
                    };
                }
            })
        })
        .collect();

    writer.join().expect("authority writer panicked");
    for handle in handles {
        handle.join().expect("node thread panicked");
    }
    let duration = start.elapsed();

    for (f, node) in nodes.iter().enumerate() {
        node.sync_with_retry().expect("final sync failed");
        assert_converged(&authority, node, &[ClinicSeed::facility(f).as_str()]);
    }

    StressTestResult {
        sessions: config.nodes * config.rounds,
        completed: completed.load(Ordering::SeqCst),
        failed: failed.load(Ordering::SeqCst),
        conflicts: nodes.iter().map(|n| n.stats().conflicts).sum(),
        duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_stress_run_converges() {
        let result = run_sync_stress(&StressConfig {
            nodes: 3,
            rounds: 3,
            writes_per_round: 2,
            authority_writes_per_round: 4,
            max_chunk_size: 4,
        });
        assert_eq!(result.sessions, 9);
        assert_eq!(result.completed + result.failed, 9);
        assert_eq!(result.failed, 0);
    }
}

//! Cross-crate integration helpers: transports that reach an in-process
//! authority, failure injection and convergence checks.

use crate::fixtures::{test_node, TestNode};
use outpost_core::RecordType;
use outpost_sync_engine::{SyncEngine, SyncError, SyncReport, SyncResult, SyncTransport};
use outpost_sync_protocol::SyncMessage;
use outpost_sync_server::SyncServer;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A transport that hands messages straight to an in-process authority.
///
/// Messages are still encoded and decoded, so the wire format is exercised.
pub struct InProcessTransport {
    server: Arc<SyncServer>,
    connected: AtomicBool,
    sent: AtomicUsize,
}

impl InProcessTransport {
    /// Creates a transport bound to `server`.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            connected: AtomicBool::new(true),
            sent: AtomicUsize::new(0),
        }
    }

    /// The authority behind this transport.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// Number of requests sent so far.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl SyncTransport for InProcessTransport {
    fn send(&self, request: SyncMessage) -> SyncResult<SyncMessage> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        let response = self.server.handle_bytes(&request.encode()?)?;
        Ok(SyncMessage::decode(&response)?)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Wraps a transport and drops requests with a given message name.
///
/// The first `failures` matching requests fail with a retryable transport
/// error before reaching the inner transport.
pub struct FlakyTransport<T: SyncTransport> {
    inner: T,
    message: &'static str,
    failures: AtomicUsize,
}

impl<T: SyncTransport> FlakyTransport<T> {
    /// Fails the next `failures` requests named `message` (see [`SyncMessage::name`]).
    pub fn new(inner: T, message: &'static str, failures: usize) -> Self {
        Self {
            inner,
            message,
            failures: AtomicUsize::new(failures),
        }
    }

    /// Arms `failures` more failures.
    pub fn fail_next(&self, failures: usize) {
        self.failures.store(failures, Ordering::SeqCst);
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: SyncTransport> SyncTransport for FlakyTransport<T> {
    fn send(&self, request: SyncMessage) -> SyncResult<SyncMessage> {
        if request.name() == self.message {
            let tripped = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if tripped {
                return Err(SyncError::transport_retryable(format!("injected failure on {}", self.message)));
            }
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

/// Asserts that `node` holds exactly what the authority would send a node
/// with `scopes`: every in-scope record of every pulled type, with the
/// same payload and deletion state.
///
/// Records the node created itself and has not pushed yet are not checked.
pub fn assert_converged<T: SyncTransport>(authority: &SyncServer, node: &SyncEngine<T>, scopes: &[&str]) {
    let scopes: BTreeSet<String> = scopes.iter().map(|s| (*s).to_owned()).collect();
    let central = authority.database();
    let local = node.database();
    for record_type in central.registry().pull_types() {
        for record in central.records(&record_type) {
            let found = local.get(&record.key());
            if authority.scope().is_in_scope(&record, &scopes) {
                let found = found.unwrap_or_else(|| panic!("{} missing on node", record.key()));
                assert_eq!(found.data, record.data, "{} payload diverged", record.key());
                assert_eq!(found.is_deleted(), record.is_deleted(), "{} deletion diverged", record.key());
            } else {
                assert!(found.is_none(), "{} is out of scope but present on node", record.key());
            }
        }
    }
}

/// One authority with several single-facility nodes.
pub struct SyncHarness {
    /// The authority.
    pub authority: Arc<SyncServer>,
    nodes: Vec<(String, TestNode)>,
}

impl SyncHarness {
    /// Creates a harness around `authority`.
    pub fn new(authority: Arc<SyncServer>) -> Self {
        Self {
            authority,
            nodes: Vec::new(),
        }
    }

    /// Adds a node scoped to `facility`. Returns its index.
    pub fn add_node(&mut self, facility: &str) -> usize {
        let node_id = format!("node-{}", self.nodes.len());
        let node = test_node(&self.authority, &node_id, [facility]);
        self.nodes.push((facility.to_owned(), node));
        self.nodes.len() - 1
    }

    /// Node `index`.
    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index].1
    }

    /// Syncs every node once, in order.
    pub fn sync_all(&self) -> Vec<SyncReport> {
        self.nodes
            .iter()
            .map(|(facility, node)| {
                node.sync()
                    .unwrap_or_else(|e| panic!("sync of node for {facility} failed: {e}"))
            })
            .collect()
    }

    /// Asserts every node has converged with the authority.
    pub fn assert_all_converged(&self) {
        for (facility, node) in &self.nodes {
            assert_converged(&self.authority, node, &[facility.as_str()]);
        }
    }

    /// Records of `record_type` held by node `index`.
    pub fn local_count(&self, index: usize, record_type: &str) -> usize {
        self.node(index).database().count(&RecordType::from(record_type))
    }
}



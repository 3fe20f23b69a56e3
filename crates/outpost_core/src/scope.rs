//! Scope maintenance.
//!
//! A record is "in scope" for a node when the node is entitled to receive
//! it. Scope flows from the association table (subject ↔ scope) down the
//! ownership edges declared in the registry: a record owned by a subject,
//! or by a parent that is itself owned by a subject, belongs to every scope
//! the subject is associated with.
//!
//! The [`DerivedScopeIndex`] caches those ownership edges so attribution
//! never needs a table scan. The [`ScopeMaintainer`] keeps the index current
//! from change events and, when an association or an owner link changes,
//! restamps the affected subtree so the next pull of the new scope picks it
//! up.

use crate::clock::txn_current_tick;
use crate::error::CoreResult;
use crate::events::{ChangeEvent, ChangeKind, ChangeSubscriber};
use crate::record::SyncRecord;
use crate::registry::ScopeRule;
use crate::store::Database;
use crate::types::{RecordId, RecordKey, RecordType};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Ownership edges and subject-to-scope associations.
#[derive(Debug, Default, Clone)]
pub struct DerivedScopeIndex {
    owner: HashMap<RecordKey, RecordKey>,
    children: HashMap<RecordKey, BTreeSet<RecordKey>>,
    associations: HashMap<RecordId, (RecordId, String)>,
    subject_scopes: HashMap<RecordId, BTreeMap<String, usize>>,
}

impl DerivedScopeIndex {
    /// Subject owning `key`, following owner links upward.
    ///
    /// `subject_type` is the registry's subject type; a subject owns itself.
    pub fn subject_of(&self, key: &RecordKey, subject_type: &RecordType) -> Option<RecordId> {
        let mut current = key;
        let mut seen = HashSet::new();
        loop {
            if &current.record_type == subject_type {
                return Some(current.record_id.clone());
            }
            if !seen.insert(current) {
                return None;
            }
            current = self.owner.get(current)?;
        }
    }

    /// Scopes a subject is currently associated with.
    pub fn scopes_of_subject(&self, subject: &RecordId) -> BTreeSet<String> {
        self.subject_scopes
            .get(subject)
            .map(|scopes| scopes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Records directly owned by `key`.
    pub fn dependents_of(&self, key: &RecordKey) -> Vec<RecordKey> {
        self.children
            .get(key)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of indexed ownership edges.
    pub fn edge_count(&self) -> usize {
        self.owner.len()
    }

    fn link(&mut self, child: RecordKey, owner: Option<RecordKey>) {
        if let Some(previous) = self.owner.remove(&child) {
            if let Some(siblings) = self.children.get_mut(&previous) {
                siblings.remove(&child);
                if siblings.is_empty() {
                    self.children.remove(&previous);
                }
            }
        }
        if let Some(owner) = owner {
            self.children
                .entry(owner.clone())
                .or_default()
                .insert(child.clone());
            self.owner.insert(child, owner);
        }
    }

    fn associate(&mut self, association: RecordId, link: Option<(RecordId, String)>) {
        if let Some((subject, scope)) = self.associations.remove(&association) {
            if let Some(scopes) = self.subject_scopes.get_mut(&subject) {
                if let Some(n) = scopes.get_mut(&scope) {
                    *n -= 1;
                    if *n == 0 {
                        scopes.remove(&scope);
                    }
                }
                if scopes.is_empty() {
                    self.subject_scopes.remove(&subject);
                }
            }
        }
        if let Some((subject, scope)) = link {
            *self
                .subject_scopes
                .entry(subject.clone())
                .or_default()
                .entry(scope.clone())
                .or_insert(0) += 1;
            self.associations.insert(association, (subject, scope));
        }
    }

    fn association_subject(&self, association: &RecordId) -> Option<&RecordId> {
        self.associations.get(association).map(|(subject, _)| subject)
    }
}

/// Keeps the [`DerivedScopeIndex`] current and cascades scope changes.
pub struct ScopeMaintainer {
    db: Arc<Database>,
    index: RwLock<DerivedScopeIndex>,
}

impl ScopeMaintainer {
    /// Creates a maintainer with an empty index. Call [`rebuild`](Self::rebuild)
    /// before subscribing it to a store that already holds records.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            index: RwLock::new(DerivedScopeIndex::default()),
        }
    }

    /// Rebuilds the index from the store. Only needed at startup.
    pub fn rebuild(&self) -> CoreResult<usize> {
        let registry = Arc::clone(self.db.registry());
        let mut index = DerivedScopeIndex::default();
        for record_type in registry.dependency_order() {
            let def = registry.definition(record_type)?;
            if def.scope.owner_field().is_none() {
                continue;
            }
            for record in self.db.records(record_type) {
                index_record(&mut index, &def.scope, def.owner_type(), &record);
            }
        }
        let edges = index.edge_count();
        *self.index.write() = index;
        info!(edges, "rebuilt scope index");
        Ok(edges)
    }

    /// A copy of the current index.
    pub fn snapshot(&self) -> DerivedScopeIndex {
        self.index.read().clone()
    }

    /// Subject owning `key`, if the registry declares a subject type.
    pub fn subject_of(&self, key: &RecordKey) -> Option<RecordId> {
        let subject_type = self.db.registry().subject_type()?;
        self.index.read().subject_of(key, subject_type)
    }

    /// Scopes a subject is associated with.
    pub fn scopes_of_subject(&self, subject: &RecordId) -> BTreeSet<String> {
        self.index.read().scopes_of_subject(subject)
    }

    /// Records directly owned by `key`.
    pub fn dependents_of(&self, key: &RecordKey) -> Vec<RecordKey> {
        self.index.read().dependents_of(key)
    }

    /// Returns true if `record` belongs to any of `scopes`.
    pub fn is_in_scope(&self, record: &SyncRecord, scopes: &BTreeSet<String>) -> bool {
        let Some(def) = self.db.registry().get(&record.record_type) else {
            return false;
        };
        match &def.scope {
            ScopeRule::Global => true,
            ScopeRule::ScopeField { field }
            | ScopeRule::Association {
                scope_field: field, ..
            } => record.field_str(field).is_some_and(|s| scopes.contains(s)),
            ScopeRule::Subject | ScopeRule::SubjectField { .. } | ScopeRule::ParentField { .. } => {
                let index = self.index.read();
                let subject = match self.db.registry().subject_type() {
                    Some(subject_type) => index.subject_of(&record.key(), subject_type),
                    None => None,
                };
                subject.is_some_and(|s| {
                    index
                        .subject_scopes
                        .get(&s)
                        .is_some_and(|linked| linked.keys().any(|scope| scopes.contains(scope)))
                })
            }
        }
    }

    /// Restamps `root` and everything it transitively owns to the current
    /// tick. Returns the number of records moved forward.
    pub fn cascade(&self, root: &RecordKey) -> CoreResult<usize> {
        let affected = {
            let index = self.index.read();
            let mut affected = vec![root.clone()];
            let mut visited: HashSet<RecordKey> = HashSet::from([root.clone()]);
            let mut queue: VecDeque<RecordKey> = VecDeque::from([root.clone()]);
            while let Some(key) = queue.pop_front() {
                if let Some(children) = index.children.get(&key) {
                    for child in children {
                        if visited.insert(child.clone()) {
                            affected.push(child.clone());
                            queue.push_back(child.clone());
                        }
                    }
                }
            }
            affected
        };

        let restamped = self.db.transaction(|txn| {
            let tick = txn_current_tick(txn)?;
            let mut restamped = 0;
            for key in &affected {
                if txn.restamp(key, tick) {
                    restamped += 1;
                }
            }
            Ok(restamped)
        })?;
        debug!(root = %root, visited = affected.len(), restamped, "scope cascade");
        Ok(restamped)
    }

    fn handle_association(&self, event: &ChangeEvent, subject_field: &str, scope_field: &str) -> CoreResult<()> {
        let Some(subject_type) = self.db.registry().subject_type().cloned() else {
            return Ok(());
        };
        let record = self.db.get(&event.key());
        let previous_subject = self
            .index
            .read()
            .association_subject(&event.record_id)
            .cloned();

        let link = record.as_ref().filter(|r| !r.is_deleted()).and_then(|r| {
            let subject = r.field_str(subject_field)?;
            let scope = r.field_str(scope_field)?;
            Some((RecordId::from(subject), scope.to_owned()))
        });
        let new_subject = link.as_ref().map(|(subject, _)| subject.clone());
        {
            let mut index = self.index.write();
            index.associate(event.record_id.clone(), link);
            let owner = record
                .as_ref()
                .and_then(|r| r.field_str(subject_field))
                .map(|s| RecordKey::new(subject_type.clone(), s));
            index.link(event.key(), owner);
        }

        let relinked = match event.kind {
            ChangeKind::Insert => true,
            ChangeKind::Update => {
                event.touches(subject_field) || event.touches(scope_field) || event.touches("deleted_at")
            }
            ChangeKind::Delete => false,
        };
        if !relinked {
            return Ok(());
        }
        let mut subjects: BTreeSet<RecordId> = new_subject.into_iter().collect();
        if event.touches(subject_field) {
            subjects.extend(previous_subject);
        }
        for subject in subjects {
            let root = RecordKey::new(subject_type.clone(), subject);
            let restamped = self.cascade(&root)?;
            info!(
                association = %event.record_id,
                subject = %root.record_id,
                restamped,
                "association changed, subject subtree restamped"
            );
        }
        Ok(())
    }

    fn handle_owned(&self, event: &ChangeEvent, scope: &ScopeRule, owner_field: &str) -> CoreResult<()> {
        let registry = Arc::clone(self.db.registry());
        let def = registry.definition(&event.record_type)?;
        let record = self.db.get(&event.key());
        {
            let mut index = self.index.write();
            match &record {
                Some(record) => {
                    index_record(&mut index, scope, def.owner_type(), record)
                }
                None => index.link(event.key(), None),
            }
        }
        if event.kind == ChangeKind::Update && event.touches(owner_field) {
            let restamped = self.cascade(&event.key())?;
            debug!(record = %event.key(), restamped, "owner changed, dependents restamped");
        }
        Ok(())
    }
}

impl ChangeSubscriber for ScopeMaintainer {
    fn on_change(&self, event: &ChangeEvent) -> CoreResult<()> {
        let registry = Arc::clone(self.db.registry());
        let Some(def) = registry.get(&event.record_type) else {
            return Ok(());
        };
        match &def.scope {
            ScopeRule::Association {
                subject_field,
                scope_field,
            } => self.handle_association(event, subject_field, scope_field),
            ScopeRule::SubjectField { field } | ScopeRule::ParentField { field } => {
                self.handle_owned(event, &def.scope, field)
            }
            ScopeRule::Global | ScopeRule::Subject | ScopeRule::ScopeField { .. } => Ok(()),
        }
    }
}

fn index_record(
    index: &mut DerivedScopeIndex,
    scope: &ScopeRule,
    owner_type: Option<&RecordType>,
    record: &SyncRecord,
) {
    let owner = match (scope.owner_field(), owner_type) {
        (Some(field), Some(owner_type)) => record
            .field_str(field)
            .map(|id| RecordKey::new(owner_type.clone(), id)),
        _ => None,
    };
    index.link(record.key(), owner);
    if let ScopeRule::Association {
        subject_field,
        scope_field,
    } = scope
    {
        let link = if record.is_deleted() {
            None
        } else {
            record
                .field_str(subject_field)
                .zip(record.field_str(scope_field))
                .map(|(subject, scope)| (RecordId::from(subject), scope.to_owned()))
        };
        index.associate(record.id.clone(), link);
    }
}



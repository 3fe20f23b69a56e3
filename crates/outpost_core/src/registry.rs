//! Registry of syncable record types.
//!
//! Every replicated type declares a direction, a deletion mode, how it maps
//! onto a scope, and the foreign keys it carries. The registry derives a
//! single global dependency order from those foreign keys and rejects cyclic
//! graphs when it is built, so every walk over the graph is known to
//! terminate.

use crate::error::{CoreError, CoreResult};
use crate::types::RecordType;
use std::collections::{HashMap, HashSet};

/// Which way records of a type travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Written on nodes and sent to the authority only.
    PushOnly,
    /// Written on the authority and sent to nodes only.
    PullOnly,
    /// Travels both ways.
    Bidirectional,
    /// Local to each node; never replicated.
    DoNotSync,
}

impl SyncDirection {
    /// Returns true if nodes push this type.
    pub fn pushes(self) -> bool {
        matches!(self, SyncDirection::PushOnly | SyncDirection::Bidirectional)
    }

    /// Returns true if nodes pull this type.
    pub fn pulls(self) -> bool {
        matches!(self, SyncDirection::PullOnly | SyncDirection::Bidirectional)
    }
}

/// How a delete is applied on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletionMode {
    /// Keep the row with `deleted_at` set.
    #[default]
    Tombstone,
    /// Physically remove the row.
    Purge,
}

/// How records of a type are attributed to a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeRule {
    /// Every node receives every record.
    Global,
    /// The type is the scope subject itself (e.g. patients).
    Subject,
    /// The record names its subject directly in `field`.
    SubjectField {
        /// Field holding the subject id.
        field: String,
    },
    /// The record is owned by the parent named in `field`, which resolves to a subject.
    ParentField {
        /// Field holding the parent id.
        field: String,
    },
    /// The record carries the scope id directly in `field`.
    ScopeField {
        /// Field holding the scope id.
        field: String,
    },
    /// The subject-to-scope association table.
    Association {
        /// Field holding the subject id.
        subject_field: String,
        /// Field holding the scope id.
        scope_field: String,
    },
}

impl ScopeRule {
    /// Shorthand for [`ScopeRule::SubjectField`].
    pub fn subject_field(field: impl Into<String>) -> Self {
        Self::SubjectField {
            field: field.into(),
        }
    }

    /// Shorthand for [`ScopeRule::ParentField`].
    pub fn parent_field(field: impl Into<String>) -> Self {
        Self::ParentField {
            field: field.into(),
        }
    }

    /// Shorthand for [`ScopeRule::ScopeField`].
    pub fn scope_field(field: impl Into<String>) -> Self {
        Self::ScopeField {
            field: field.into(),
        }
    }

    /// Shorthand for [`ScopeRule::Association`].
    pub fn association(subject_field: impl Into<String>, scope_field: impl Into<String>) -> Self {
        Self::Association {
            subject_field: subject_field.into(),
            scope_field: scope_field.into(),
        }
    }

    /// Fields whose change moves a record to a different scope.
    pub fn scoping_fields(&self) -> Vec<&str> {
        match self {
            ScopeRule::Global | ScopeRule::Subject => Vec::new(),
            ScopeRule::SubjectField { field }
            | ScopeRule::ParentField { field }
            | ScopeRule::ScopeField { field } => vec![field.as_str()],
            ScopeRule::Association {
                subject_field,
                scope_field,
            } => vec![subject_field.as_str(), scope_field.as_str()],
        }
    }

    /// The field linking a record to its owner in the derived scope index.
    pub fn owner_field(&self) -> Option<&str> {
        match self {
            ScopeRule::SubjectField { field } | ScopeRule::ParentField { field } => {
                Some(field.as_str())
            }
            ScopeRule::Association { subject_field, .. } => Some(subject_field.as_str()),
            _ => None,
        }
    }
}

/// A foreign key from one type to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    /// Field on the referencing record.
    pub field: String,
    /// Referenced type.
    pub target: RecordType,
    /// Whether the field may be absent.
    pub optional: bool,
}

/// Declaration of one syncable type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefinition {
    /// Type name.
    pub name: RecordType,
    /// Replication direction.
    pub direction: SyncDirection,
    /// Delete semantics on the receiving side.
    pub deletion: DeletionMode,
    /// Scope attribution.
    pub scope: ScopeRule,
    /// Declared foreign keys.
    pub relationships: Vec<Relationship>,
}

impl TypeDefinition {
    /// Creates a global, tombstoning type with no relationships.
    pub fn new(name: impl Into<RecordType>, direction: SyncDirection) -> Self {
        Self {
            name: name.into(),
            direction,
            deletion: DeletionMode::Tombstone,
            scope: ScopeRule::Global,
            relationships: Vec::new(),
        }
    }

    /// Sets the scope rule.
    pub fn with_scope(mut self, scope: ScopeRule) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the deletion mode.
    pub fn with_deletion(mut self, deletion: DeletionMode) -> Self {
        self.deletion = deletion;
        self
    }

    /// Declares a required foreign key.
    pub fn with_reference(mut self, field: impl Into<String>, target: impl Into<RecordType>) -> Self {
        self.relationships.push(Relationship {
            field: field.into(),
            target: target.into(),
            optional: false,
        });
        self
    }

    /// Declares an optional foreign key.
    pub fn with_optional_reference(
        mut self,
        field: impl Into<String>,
        target: impl Into<RecordType>,
    ) -> Self {
        self.relationships.push(Relationship {
            field: field.into(),
            target: target.into(),
            optional: true,
        });
        self
    }

    /// Finds the relationship declared on `field`.
    pub fn relationship(&self, field: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.field == field)
    }

    /// Type of the record that owns records of this type in the scope index.
    pub fn owner_type(&self) -> Option<&RecordType> {
        self.scope
            .owner_field()
            .and_then(|field| self.relationship(field))
            .map(|rel| &rel.target)
    }
}

/// Builder for [`TypeRegistry`].
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    definitions: Vec<TypeDefinition>,
}

impl TypeRegistryBuilder {
    /// Adds a type definition. Declaration order breaks ties in the dependency order.
    pub fn register(mut self, definition: TypeDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Validates the declarations and computes the dependency order.
    pub fn build(self) -> CoreResult<TypeRegistry> {
        TypeRegistry::from_definitions(self.definitions)
    }
}

/// Validated set of syncable types with their dependency order.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    definitions: HashMap<RecordType, TypeDefinition>,
    order: Vec<RecordType>,
    position: HashMap<RecordType, usize>,
    owned_types: HashMap<RecordType, Vec<RecordType>>,
    subject_type: Option<RecordType>,
    association_type: Option<RecordType>,
}

impl TypeRegistry {
    /// Starts a new registry declaration.
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    fn from_definitions(definitions: Vec<TypeDefinition>) -> CoreResult<Self> {
        let mut by_name: HashMap<RecordType, TypeDefinition> = HashMap::new();
        let mut declared = Vec::with_capacity(definitions.len());
        for def in definitions {
            if by_name.contains_key(&def.name) {
                return Err(CoreError::configuration(format!(
                    "record type {} registered twice",
                    def.name
                )));
            }
            declared.push(def.name.clone());
            by_name.insert(def.name.clone(), def);
        }

        for name in &declared {
            let def = &by_name[name];
            for rel in &def.relationships {
                if !by_name.contains_key(&rel.target) {
                    return Err(CoreError::configuration(format!(
                        "{}.{} references unregistered type {}",
                        name, rel.field, rel.target
                    )));
                }
            }
        }

        if let Some(cycle) = find_cycle(&declared, &by_name) {
            let path: Vec<&str> = cycle.iter().map(RecordType::as_str).collect();
            return Err(CoreError::configuration(format!(
                "relationship cycle: {}",
                path.join(" -> ")
            )));
        }

        let subject_type = unique_with(&declared, &by_name, |rule| {
            matches!(rule, ScopeRule::Subject)
        })?;
        let association_type = unique_with(&declared, &by_name, |rule| {
            matches!(rule, ScopeRule::Association { .. })
        })?;

        let mut owned_types: HashMap<RecordType, Vec<RecordType>> = HashMap::new();
        for name in &declared {
            let def = &by_name[name];
            let Some(owner_field) = def.scope.owner_field() else {
                continue;
            };
            let rel = def.relationship(owner_field).ok_or_else(|| {
                CoreError::configuration(format!(
                    "{name}: scope field {owner_field} has no declared relationship"
                ))
            })?;
            let expects_subject = !matches!(def.scope, ScopeRule::ParentField { .. });
            if expects_subject && subject_type.as_ref() != Some(&rel.target) {
                return Err(CoreError::configuration(format!(
                    "{name}.{owner_field} must reference the scope subject type"
                )));
            }
            if let ScopeRule::ParentField { .. } = def.scope {
                let parent = &by_name[&rel.target].scope;
                if matches!(parent, ScopeRule::Global | ScopeRule::ScopeField { .. }) {
                    return Err(CoreError::configuration(format!(
                        "{name}.{owner_field} references {} which has no subject",
                        rel.target
                    )));
                }
            }
            owned_types
                .entry(rel.target.clone())
                .or_default()
                .push(name.clone());
        }

        let order = topological_order(&declared, &by_name);
        let position = order
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();

        Ok(Self {
            definitions: by_name,
            order,
            position,
            owned_types,
            subject_type,
            association_type,
        })
    }

    /// Looks up a definition.
    pub fn get(&self, record_type: &RecordType) -> Option<&TypeDefinition> {
        self.definitions.get(record_type)
    }

    /// Looks up a definition, failing for unregistered types.
    pub fn definition(&self, record_type: &RecordType) -> CoreResult<&TypeDefinition> {
        self.get(record_type)
            .ok_or_else(|| CoreError::UnknownType(record_type.clone()))
    }

    /// Returns true if nodes push records of this type.
    pub fn should_push(&self, record_type: &RecordType) -> bool {
        self.get(record_type).is_some_and(|d| d.direction.pushes())
    }

    /// Returns true if nodes pull records of this type.
    pub fn should_pull(&self, record_type: &RecordType) -> bool {
        self.get(record_type).is_some_and(|d| d.direction.pulls())
    }

    /// Returns true if the type replicates at all.
    pub fn is_syncable(&self, record_type: &RecordType) -> bool {
        self.get(record_type)
            .is_some_and(|d| d.direction != SyncDirection::DoNotSync)
    }

    /// All registered types, referenced types before referencing types.
    pub fn dependency_order(&self) -> &[RecordType] {
        &self.order
    }

    /// Position of a type in the dependency order.
    pub fn position(&self, record_type: &RecordType) -> Option<usize> {
        self.position.get(record_type).copied()
    }

    /// Pushed types in dependency order.
    pub fn push_types(&self) -> Vec<RecordType> {
        self.order
            .iter()
            .filter(|t| self.should_push(t))
            .cloned()
            .collect()
    }

    /// Pulled types in dependency order.
    pub fn pull_types(&self) -> Vec<RecordType> {
        self.order
            .iter()
            .filter(|t| self.should_pull(t))
            .cloned()
            .collect()
    }

    /// Types whose records are owned by records of `record_type`.
    pub fn owned_types(&self, record_type: &RecordType) -> &[RecordType] {
        self.owned_types
            .get(record_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The scope subject type, if declared.
    pub fn subject_type(&self) -> Option<&RecordType> {
        self.subject_type.as_ref()
    }

    /// The association type, if declared.
    pub fn association_type(&self) -> Option<&RecordType> {
        self.association_type.as_ref()
    }

    /// Fails with [`CoreError::OrderingViolation`] unless `types` is strictly
    /// increasing in dependency order.
    pub fn check_order(&self, types: &[RecordType]) -> CoreResult<()> {
        let mut previous: Option<(&RecordType, usize)> = None;
        for record_type in types {
            let pos = self
                .position(record_type)
                .ok_or_else(|| CoreError::UnknownType(record_type.clone()))?;
            if let Some((prev_type, prev_pos)) = previous {
                if pos <= prev_pos {
                    return Err(CoreError::OrderingViolation {
                        record_type: record_type.clone(),
                        after: prev_type.clone(),
                    });
                }
            }
            previous = Some((record_type, pos));
        }
        Ok(())
    }

    /// Sorts types into dependency order, dropping duplicates.
    pub fn sort_by_dependency<I>(&self, types: I) -> CoreResult<Vec<RecordType>>
    where
        I: IntoIterator<Item = RecordType>,
    {
        let mut positioned = Vec::new();
        let mut seen = HashSet::new();
        for record_type in types {
            let pos = self
                .position(&record_type)
                .ok_or_else(|| CoreError::UnknownType(record_type.clone()))?;
            if seen.insert(pos) {
                positioned.push((pos, record_type));
            }
        }
        positioned.sort_by_key(|(pos, _)| *pos);
        Ok(positioned.into_iter().map(|(_, t)| t).collect())
    }
}

fn unique_with(
    declared: &[RecordType],
    defs: &HashMap<RecordType, TypeDefinition>,
    pred: impl Fn(&ScopeRule) -> bool,
) -> CoreResult<Option<RecordType>> {
    let mut found = declared.iter().filter(|t| pred(&defs[*t].scope));
    let first = found.next().cloned();
    if let Some(second) = found.next() {
        return Err(CoreError::configuration(format!(
            "{} and {} both declare the same scope role",
            first.as_ref().map(RecordType::as_str).unwrap_or_default(),
            second
        )));
    }
    Ok(first)
}

fn find_cycle(
    declared: &[RecordType],
    defs: &HashMap<RecordType, TypeDefinition>,
) -> Option<Vec<RecordType>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        node: &RecordType,
        defs: &HashMap<RecordType, TypeDefinition>,
        marks: &mut HashMap<RecordType, Mark>,
        stack: &mut Vec<RecordType>,
    ) -> Option<Vec<RecordType>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|t| t == node).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(node.clone());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(node.clone(), Mark::Visiting);
        stack.push(node.clone());
        for rel in &defs[node].relationships {
            if let Some(cycle) = visit(&rel.target, defs, marks, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        marks.insert(node.clone(), Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    declared
        .iter()
        .find_map(|t| visit(t, defs, &mut marks, &mut stack))
}

/// Stable topological sort: among ready types, declaration order wins.
fn topological_order(
    declared: &[RecordType],
    defs: &HashMap<RecordType, TypeDefinition>,
) -> Vec<RecordType> {
    let mut placed: HashSet<&RecordType> = HashSet::new();
    let mut order = Vec::with_capacity(declared.len());
    while order.len() < declared.len() {
        let next = declared.iter().find(|t| {
            !placed.contains(t)
                && defs[*t]
                    .relationships
                    .iter()
                    .all(|r| placed.contains(&r.target))
        });
        match next {
            Some(t) => {
                placed.insert(t);
                order.push(t.clone());
            }
            // unreachable once find_cycle has passed
            None => break,
        }
    }
    order
}



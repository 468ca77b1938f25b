//! Canonical Schema Registry
//!
//! Holds the declared entity types and their parent→child foreign keys and
//! derives one deterministic topological order from them. Creation walks the
//! order forwards, teardown walks it backwards.

use crate::error::{ProjectionError, ProjectionResult};
use crate::introspection::SchemaSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Every canonical entity type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    University,
    Institute,
    Department,
    Specialty,
    Course,
    Group,
    Student,
    Lecture,
    Material,
    ScheduleEntry,
    VisitRecord,
}

impl EntityKind {
    pub const ALL: [EntityKind; 11] = [
        EntityKind::University,
        EntityKind::Institute,
        EntityKind::Department,
        EntityKind::Specialty,
        EntityKind::Course,
        EntityKind::Group,
        EntityKind::Student,
        EntityKind::Lecture,
        EntityKind::Material,
        EntityKind::ScheduleEntry,
        EntityKind::VisitRecord,
    ];

    /// Snake-case alias used as a field prefix and in reports
    pub fn alias(&self) -> &'static str {
        match self {
            EntityKind::University => "university",
            EntityKind::Institute => "institute",
            EntityKind::Department => "department",
            EntityKind::Specialty => "specialty",
            EntityKind::Course => "course",
            EntityKind::Group => "group",
            EntityKind::Student => "student",
            EntityKind::Lecture => "lecture",
            EntityKind::Material => "material",
            EntityKind::ScheduleEntry => "schedule_entry",
            EntityKind::VisitRecord => "visit_record",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alias())
    }
}

/// Value shape of a canonical attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrKind {
    Text,
    Date,
    Timestamp,
    Bool,
}

impl AttrKind {
    /// Column type used when provisioning the canonical store
    pub fn sql_type(&self) -> &'static str {
        match self {
            AttrKind::Text => "TEXT",
            AttrKind::Date => "DATE",
            AttrKind::Timestamp => "TIMESTAMPTZ",
            AttrKind::Bool => "BOOLEAN",
        }
    }
}

/// A canonical attribute: its projected name and its source column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub field: &'static str,
    pub column: &'static str,
    pub kind: AttrKind,
}

impl Attribute {
    pub const fn new(field: &'static str, column: &'static str, kind: AttrKind) -> Self {
        Self { field, column, kind }
    }
}

/// Declaration of one entity type
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDef {
    pub kind: EntityKind,
    /// Source table
    pub table: &'static str,
    /// Graph node label
    pub label: &'static str,
    pub attributes: Vec<Attribute>,
}

impl EntityDef {
    pub fn alias(&self) -> &'static str {
        self.kind.alias()
    }
}

/// A parent→child foreign key together with its graph edge name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub child: EntityKind,
    pub parent: EntityKind,
    /// Foreign key column on the child's table
    pub column: &'static str,
    /// Edge type, directed child→parent
    pub edge: &'static str,
}

impl Relation {
    /// Canonical field name carrying the parent id on a child row
    pub fn field(&self) -> String {
        format!("{}_id", self.parent.alias())
    }
}

/// Validated registry with a precomputed topological order
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    entities: Vec<EntityDef>,
    relations: Vec<Relation>,
    order: Vec<EntityKind>,
}

impl SchemaRegistry {
    /// Validate declarations and compute the creation order.
    ///
    /// Fails with `Config` on duplicate or undeclared kinds and on a cyclic
    /// foreign-key graph.
    pub fn new(entities: Vec<EntityDef>, relations: Vec<Relation>) -> ProjectionResult<Self> {
        let mut declared = HashSet::new();
        for def in &entities {
            if !declared.insert(def.kind) {
                return Err(ProjectionError::Config(format!(
                    "Entity type '{}' declared twice",
                    def.kind
                )));
            }
        }

        for rel in &relations {
            for kind in [rel.child, rel.parent] {
                if !declared.contains(&kind) {
                    return Err(ProjectionError::Config(format!(
                        "Relation {} references undeclared entity type '{}'",
                        rel.edge, kind
                    )));
                }
            }
        }

        let order = Self::topological_order(&entities, &relations)?;

        Ok(Self {
            entities,
            relations,
            order,
        })
    }

    /// Kahn's algorithm; ties resolve by declaration order
    fn topological_order(
        entities: &[EntityDef],
        relations: &[Relation],
    ) -> ProjectionResult<Vec<EntityKind>> {
        let position: HashMap<EntityKind, usize> = entities
            .iter()
            .enumerate()
            .map(|(i, def)| (def.kind, i))
            .collect();

        let mut in_degree = vec![0usize; entities.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); entities.len()];
        for rel in relations {
            let (child, parent) = (position[&rel.child], position[&rel.parent]);
            in_degree[child] += 1;
            children[parent].push(child);
        }

        let mut ready: VecDeque<usize> = (0..entities.len())
            .filter(|i| in_degree[*i] == 0)
            .collect();
        let mut order = Vec::with_capacity(entities.len());

        while let Some(next) = ready.pop_front() {
            order.push(entities[next].kind);

            let mut unlocked = Vec::new();
            for &child in &children[next] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    unlocked.push(child);
                }
            }
            // Keep declaration order among newly ready types
            ready.extend(unlocked);
            ready.make_contiguous().sort_unstable();
        }

        if order.len() != entities.len() {
            let stuck: Vec<String> = entities
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, def)| def.kind.to_string())
                .collect();
            return Err(ProjectionError::Config(format!(
                "Foreign-key graph contains a cycle through: {}",
                stuck.join(", ")
            )));
        }

        Ok(order)
    }

    /// Entity types, every parent before its children
    pub fn creation_order(&self) -> &[EntityKind] {
        &self.order
    }

    /// Entity types, every child before its parents
    pub fn teardown_order(&self) -> Vec<EntityKind> {
        self.order.iter().rev().copied().collect()
    }

    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn entity(&self, kind: EntityKind) -> ProjectionResult<&EntityDef> {
        self.entities
            .iter()
            .find(|def| def.kind == kind)
            .ok_or_else(|| ProjectionError::Config(format!("Entity type '{}' is not declared", kind)))
    }

    /// Relations in which `kind` is the child, in declaration order
    pub fn parents(&self, kind: EntityKind) -> Vec<&Relation> {
        self.relations.iter().filter(|r| r.child == kind).collect()
    }

    /// Relations in which `kind` is the parent
    pub fn children(&self, kind: EntityKind) -> Vec<&Relation> {
        self.relations.iter().filter(|r| r.parent == kind).collect()
    }

    pub fn relation(&self, child: EntityKind, parent: EntityKind) -> Option<&Relation> {
        self.relations
            .iter()
            .find(|r| r.child == child && r.parent == parent)
    }

    /// Every entity type that depends on `kind`, directly or transitively
    pub fn descendants(&self, kind: EntityKind) -> HashSet<EntityKind> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([kind]);

        while let Some(current) = queue.pop_front() {
            for rel in self.children(current) {
                if seen.insert(rel.child) {
                    queue.push_back(rel.child);
                }
            }
        }

        seen
    }

    /// Compare a live catalog against the declarations.
    ///
    /// Returns one description per missing table or column; empty means the
    /// store matches.
    pub fn check_snapshot(&self, snapshot: &SchemaSnapshot) -> Vec<String> {
        let mut mismatches = Vec::new();

        for def in &self.entities {
            let Some(table) = snapshot.table(def.table) else {
                mismatches.push(format!("missing table '{}'", def.table));
                continue;
            };

            let expected = std::iter::once("id")
                .chain(def.attributes.iter().map(|a| a.column))
                .chain(self.parents(def.kind).into_iter().map(|r| r.column));

            for column in expected {
                if !table.has_column(column) {
                    mismatches.push(format!("missing column '{}.{}'", def.table, column));
                }
            }
        }

        mismatches
    }
}

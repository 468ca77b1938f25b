//! Join plans and canonical rows
//!
//! A [`JoinSpec`] names an entity type and the chain of ancestors to pull in
//! with it. [`QueryPlan::build`] resolves it against the registry into the
//! flat list of output fields every source backend evaluates the same way.

use crate::error::{ProjectionError, ProjectionResult};
use crate::schema::{AttrKind, EntityKind, Relation, SchemaRegistry};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Entity type plus an ancestor chain, e.g. Material → Lecture → Course
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSpec {
    pub base: EntityKind,
    pub hops: Vec<EntityKind>,
}

impl JoinSpec {
    pub fn of(base: EntityKind) -> Self {
        Self {
            base,
            hops: Vec::new(),
        }
    }

    /// Extend the chain to the parent of the last entity in it
    pub fn up(mut self, ancestor: EntityKind) -> Self {
        self.hops.push(ancestor);
        self
    }
}

/// What a plan field decodes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Id,
    Attr(AttrKind),
}

/// One output field of a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanField {
    /// Name in the canonical row
    pub name: String,
    /// Position in the chain: 0 is the base entity, n is the n-th hop
    pub step: usize,
    /// Source column on that step's table
    pub column: &'static str,
    pub value: ValueKind,
}

/// One resolved hop of the ancestor chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub kind: EntityKind,
    pub table: &'static str,
    /// Relation joining this step to the previous one (`None` for the base)
    pub via: Option<Relation>,
}

/// Fully resolved extraction plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub steps: Vec<PlanStep>,
    pub fields: Vec<PlanField>,
}

impl QueryPlan {
    /// Resolve a join spec. Every hop must follow a declared relation from
    /// the previous step, otherwise this is a `Config` error.
    pub fn build(registry: &SchemaRegistry, spec: &JoinSpec) -> ProjectionResult<Self> {
        let base = registry.entity(spec.base)?;
        let mut steps = vec![PlanStep {
            kind: spec.base,
            table: base.table,
            via: None,
        }];
        let mut fields = Vec::new();
        let mut seen = HashSet::new();

        let mut push = |fields: &mut Vec<PlanField>, field: PlanField| {
            if seen.insert(field.name.clone()) {
                fields.push(field);
            }
        };

        push(
            &mut fields,
            PlanField {
                name: "id".to_string(),
                step: 0,
                column: "id",
                value: ValueKind::Id,
            },
        );
        for attr in &base.attributes {
            push(
                &mut fields,
                PlanField {
                    name: attr.field.to_string(),
                    step: 0,
                    column: attr.column,
                    value: ValueKind::Attr(attr.kind),
                },
            );
        }
        for rel in registry.parents(spec.base) {
            push(
                &mut fields,
                PlanField {
                    name: rel.field(),
                    step: 0,
                    column: rel.column,
                    value: ValueKind::Id,
                },
            );
        }

        let mut previous = spec.base;
        for (i, &hop) in spec.hops.iter().enumerate() {
            let step = i + 1;
            let via = *registry.relation(previous, hop).ok_or_else(|| {
                ProjectionError::Config(format!(
                    "No relation from '{}' to '{}' in the join chain",
                    previous, hop
                ))
            })?;
            let def = registry.entity(hop)?;
            let alias = def.alias();

            push(
                &mut fields,
                PlanField {
                    name: format!("{}_id", alias),
                    step,
                    column: "id",
                    value: ValueKind::Id,
                },
            );
            for attr in &def.attributes {
                push(
                    &mut fields,
                    PlanField {
                        name: format!("{}_{}", alias, attr.field),
                        step,
                        column: attr.column,
                        value: ValueKind::Attr(attr.kind),
                    },
                );
            }
            for rel in registry.parents(hop) {
                push(
                    &mut fields,
                    PlanField {
                        name: format!("{}_{}", alias, rel.field()),
                        step,
                        column: rel.column,
                        value: ValueKind::Id,
                    },
                );
            }

            steps.push(PlanStep {
                kind: hop,
                table: def.table,
                via: Some(via),
            });
            previous = hop;
        }

        Ok(Self { steps, fields })
    }

    pub fn base(&self) -> EntityKind {
        self.steps[0].kind
    }
}

/// One extracted row: the entity's identity and its named fields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRow {
    pub kind: EntityKind,
    pub id: i64,
    pub fields: BTreeMap<String, Value>,
}

impl CanonicalRow {
    pub fn value(&self, field: &str) -> ProjectionResult<&Value> {
        self.fields.get(field).ok_or_else(|| {
            ProjectionError::SchemaMismatch(format!("{} row {} has no field '{}'", self.kind, self.id, field))
        })
    }

    /// Text field; null reads as `None`
    pub fn text(&self, field: &str) -> ProjectionResult<Option<&str>> {
        match self.value(field)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.as_str())),
            other => Err(self.wrong_type(field, "text", other)),
        }
    }

    /// Id field; null reads as `None`
    pub fn id_of(&self, field: &str) -> ProjectionResult<Option<i64>> {
        match self.value(field)? {
            Value::Null => Ok(None),
            Value::Number(n) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| self.wrong_type(field, "integer", &Value::Number(n.clone()))),
            other => Err(self.wrong_type(field, "integer", other)),
        }
    }

    fn wrong_type(&self, field: &str, expected: &str, got: &Value) -> ProjectionError {
        ProjectionError::SchemaMismatch(format!(
            "{} row {} field '{}' should be {}, got {}",
            self.kind, self.id, field, expected, got
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::university_registry;

    fn names(plan: &QueryPlan) -> Vec<&str> {
        plan.fields.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn test_plain_plan_lists_own_fields_and_parent_keys() {
        let registry = university_registry().unwrap();
        let plan = QueryPlan::build(&registry, &JoinSpec::of(EntityKind::Course)).unwrap();

        assert_eq!(
            names(&plan),
            vec!["id", "name", "term", "department_id", "specialty_id"]
        );
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn test_ancestor_chain_adds_prefixed_fields() {
        let registry = university_registry().unwrap();
        let spec = JoinSpec::of(EntityKind::Material)
            .up(EntityKind::Lecture)
            .up(EntityKind::Course);
        let plan = QueryPlan::build(&registry, &spec).unwrap();

        assert_eq!(
            names(&plan),
            vec![
                "id",
                "name",
                "content",
                "lecture_id",
                "lecture_name",
                "lecture_required",
                "lecture_course_id",
                "course_id",
                "course_name",
                "course_term",
                "course_department_id",
                "course_specialty_id",
            ]
        );
        // lecture_id comes from the base foreign key, not the joined row
        let lecture_id = plan.fields.iter().find(|f| f.name == "lecture_id").unwrap();
        assert_eq!(lecture_id.step, 0);
        assert_eq!(lecture_id.column, "id_lect");
    }

    #[test]
    fn test_hop_without_relation_is_rejected() {
        let registry = university_registry().unwrap();
        let spec = JoinSpec::of(EntityKind::Material).up(EntityKind::Course);
        assert!(matches!(
            QueryPlan::build(&registry, &spec),
            Err(ProjectionError::Config(_))
        ));
    }

    #[test]
    fn test_row_accessors_report_schema_mismatch() {
        let row = CanonicalRow {
            kind: EntityKind::Student,
            id: 7,
            fields: BTreeMap::from([
                ("full_name".to_string(), Value::from("Ivanov")),
                ("group_id".to_string(), Value::from(2)),
            ]),
        };

        assert_eq!(row.text("full_name").unwrap(), Some("Ivanov"));
        assert_eq!(row.id_of("group_id").unwrap(), Some(2));
        assert!(matches!(row.text("fio"), Err(ProjectionError::SchemaMismatch(_))));
        assert!(matches!(row.id_of("full_name"), Err(ProjectionError::SchemaMismatch(_))));
    }
}

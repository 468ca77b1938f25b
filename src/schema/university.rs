//! The university dataset declaration

use super::registry::{AttrKind, Attribute, EntityDef, EntityKind, Relation, SchemaRegistry};
use crate::error::ProjectionResult;

fn entity(
    kind: EntityKind,
    table: &'static str,
    label: &'static str,
    attributes: &[Attribute],
) -> EntityDef {
    EntityDef {
        kind,
        table,
        label,
        attributes: attributes.to_vec(),
    }
}

fn relation(
    child: EntityKind,
    parent: EntityKind,
    column: &'static str,
    edge: &'static str,
) -> Relation {
    Relation {
        child,
        parent,
        column,
        edge,
    }
}

/// Build the registry for the canonical university store
pub fn university_registry() -> ProjectionResult<SchemaRegistry> {
    use AttrKind::*;
    use EntityKind::*;

    let name = Attribute::new("name", "name", Text);

    let entities = vec![
        entity(University, "universities", "University", &[name]),
        entity(Institute, "institutes", "Institute", &[name]),
        entity(Department, "departments", "Department", &[name]),
        entity(
            Specialty,
            "specialties",
            "Specialty",
            &[name, Attribute::new("code", "code", Text)],
        ),
        entity(
            Course,
            "courses",
            "Course",
            &[name, Attribute::new("term", "term", Date)],
        ),
        entity(
            Group,
            "groups",
            "Group",
            &[
                name,
                Attribute::new("start_date", "startyear", Date),
                Attribute::new("end_date", "endyear", Date),
            ],
        ),
        entity(
            Student,
            "students",
            "Student",
            &[
                Attribute::new("full_name", "fio", Text),
                Attribute::new("admitted_on", "date_of_recipient", Date),
            ],
        ),
        entity(
            Lecture,
            "lectures",
            "Lecture",
            &[name, Attribute::new("required", "requirements", Bool)],
        ),
        entity(
            Material,
            "materials",
            "Material",
            &[name, Attribute::new("content", "content", Text)],
        ),
        entity(
            ScheduleEntry,
            "schedule",
            "ScheduleEntry",
            &[
                Attribute::new("starts_at", "starttime", Timestamp),
                Attribute::new("ends_at", "endtime", Timestamp),
            ],
        ),
        entity(
            VisitRecord,
            "visits",
            "VisitRecord",
            &[Attribute::new("visited_at", "visittime", Timestamp)],
        ),
    ];

    let relations = vec![
        relation(Institute, University, "id_univer", "PART_OF"),
        relation(Department, Institute, "id_institutes", "PART_OF"),
        relation(Course, Department, "id_kafedr_a", "BELONGS_TO"),
        relation(Course, Specialty, "id_spec", "HAS_SPECIALTY"),
        relation(Group, Department, "id_kafedr_a", "BELONGS_TO"),
        relation(Student, Group, "id_group", "MEMBER_OF"),
        relation(Lecture, Course, "id_course", "PART_OF"),
        relation(Material, Lecture, "id_lect", "ATTACHED_TO"),
        relation(ScheduleEntry, Lecture, "id_lect", "SCHEDULES"),
        relation(ScheduleEntry, Group, "id_group", "FOR_GROUP"),
        relation(VisitRecord, Student, "id_student", "VISIT_BY"),
        relation(VisitRecord, ScheduleEntry, "id_rasp", "VISIT_OF"),
    ];

    SchemaRegistry::new(entities, relations)
}

/// Synthesized edge from Student to Lecture, derived through visits
pub const ATTENDED_EDGE: &str = "ATTENDED";

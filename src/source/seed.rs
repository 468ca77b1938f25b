//! Canonical dataset provisioning
//!
//! [`CanonicalDataset`] holds source rows keyed by entity type, using source
//! column names. [`CanonicalDataset::reference`] builds the reference university
//! dataset; the caller passes the seeded generator used for synthetic values.

use crate::error::{ProjectionError, ProjectionResult};
use crate::schema::{AttrKind, EntityKind, SchemaRegistry};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// One source row: explicit id plus column values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRecord {
    pub id: i64,
    pub columns: BTreeMap<String, Value>,
}

/// Rows of every entity type, ids ascending within a type
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CanonicalDataset {
    tables: BTreeMap<EntityKind, Vec<SourceRecord>>,
}

impl CanonicalDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row with the next id for its type
    pub fn push(&mut self, kind: EntityKind, columns: Vec<(&str, Value)>) -> i64 {
        let rows = self.tables.entry(kind).or_default();
        let id = rows.last().map(|r| r.id + 1).unwrap_or(1);
        rows.push(SourceRecord {
            id,
            columns: columns
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
        id
    }

    pub fn rows(&self, kind: EntityKind) -> &[SourceRecord] {
        self.tables.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.rows(kind).len()
    }

    pub fn counts(&self) -> BTreeMap<EntityKind, usize> {
        EntityKind::ALL
            .iter()
            .map(|k| (*k, self.count(*k)))
            .collect()
    }

    pub fn total(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Every declared column must be present on every row
    pub fn validate(&self, registry: &SchemaRegistry) -> ProjectionResult<()> {
        for def in registry.entities() {
            let expected: Vec<&str> = def
                .attributes
                .iter()
                .map(|a| a.column)
                .chain(registry.parents(def.kind).into_iter().map(|r| r.column))
                .collect();

            for row in self.rows(def.kind) {
                if let Some(missing) = expected.iter().find(|c| !row.columns.contains_key(**c)) {
                    return Err(ProjectionError::SchemaMismatch(format!(
                        "{} row {} has no column '{}'",
                        def.kind, row.id, missing
                    )));
                }
            }
        }
        Ok(())
    }

    /// The reference university dataset: 3 universities, 4 institutes,
    /// 5 departments, 4 specialties, 5 courses, 4 groups, 19 students,
    /// 7 lectures, 5 materials, 10 schedule entries and 30 visits.
    pub fn reference<R: Rng + ?Sized>(rng: &mut R) -> Self {
        use EntityKind::*;

        let mut data = Self::new();
        let date = |y: i32, m: u32, d: u32| Value::from(format!("{:04}-{:02}-{:02}", y, m, d));

        for name in [
            "Московский Государственный Университет",
            "Санкт-Петербургский Государственный Университет",
            "Казанский Федеральный Университет",
        ] {
            data.push(University, vec![("name", name.into())]);
        }

        for (university, name) in [
            (1i64, "Институт компьютерных наук"),
            (1, "Институт математики"),
            (2, "Институт информационных технологий"),
            (3, "Институт физики"),
        ] {
            data.push(Institute, vec![("id_univer", university.into()), ("name", name.into())]);
        }

        for (institute, name) in [
            (1i64, "Кафедра программной инженерии"),
            (1, "Кафедра баз данных"),
            (2, "Кафедра высшей математики"),
            (3, "Кафедра искусственного интеллекта"),
            (4, "Кафедра теоретической физики"),
        ] {
            data.push(
                Department,
                vec![("id_institutes", institute.into()), ("name", name.into())],
            );
        }

        for (name, code) in [
            ("Информатика и вычислительная техника", "09.03.01"),
            ("Программная инженерия", "09.03.04"),
            ("Прикладная математика", "01.03.04"),
            ("Информационная безопасность", "10.03.01"),
        ] {
            data.push(Specialty, vec![("name", name.into()), ("code", code.into())]);
        }

        for (department, specialty, name) in [
            (1i64, 1i64, "Введение в программирование"),
            (2, 1, "Базы данных"),
            (3, 3, "Математический анализ"),
            (4, 2, "Машинное обучение"),
            (5, 4, "Физика"),
        ] {
            data.push(
                Course,
                vec![
                    ("id_kafedr_a", department.into()),
                    ("id_spec", specialty.into()),
                    ("name", name.into()),
                    ("term", date(2023, 9, 1)),
                ],
            );
        }

        for (department, name, start, end) in [
            (1i64, "ПИ-101", 2020, 2024),
            (2, "БД-102", 2020, 2024),
            (3, "МА-201", 2021, 2025),
            (4, "ИИ-301", 2022, 2026),
        ] {
            data.push(
                Group,
                vec![
                    ("id_kafedr_a", department.into()),
                    ("name", name.into()),
                    ("startyear", date(start, 9, 1)),
                    ("endyear", date(end, 6, 30)),
                ],
            );
        }

        let admitted_from = NaiveDate::from_ymd_opt(2018, 9, 1).unwrap_or_default();
        for _ in 0..19 {
            let surname = SURNAMES[rng.gen_range(0..SURNAMES.len())];
            let first = FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())];
            let admitted = admitted_from + Duration::days(rng.gen_range(0..5 * 365));
            data.push(
                Student,
                vec![
                    ("id_group", rng.gen_range(1i64..=4).into()),
                    ("fio", format!("{} {}", surname, first).into()),
                    ("date_of_recipient", admitted.format("%Y-%m-%d").to_string().into()),
                ],
            );
        }

        for (course, name, required) in [
            (1i64, "Введение в алгоритмы", true),
            (1, "Основы синтаксиса", true),
            (2, "Реляционная модель", true),
            (2, "SQL и нормализация", true),
            (3, "Пределы и производные", true),
            (4, "Нейронные сети", false),
            (5, "Механика", true),
        ] {
            data.push(
                Lecture,
                vec![
                    ("id_course", course.into()),
                    ("name", name.into()),
                    ("requirements", required.into()),
                ],
            );
        }

        for (lecture, name, content) in [
            (1i64, "Слайды по введению в алгоритмы", "Содержимое слайдов по введению в алгоритмы"),
            (1, "Примеры кода", "Примеры алгоритмов на Python"),
            (2, "Основы синтаксиса", "Базовые конструкции языка"),
            (3, "Презентация по БД", "Основные понятия и определения СУБД"),
            (5, "Формулы и теоремы", "Основные формулы математического анализа"),
        ] {
            data.push(
                Material,
                vec![
                    ("id_lect", lecture.into()),
                    ("name", name.into()),
                    ("content", content.into()),
                ],
            );
        }

        let base = reference_epoch();
        let mut starts = Vec::with_capacity(10);
        for day in 0..10 {
            let start = base + Duration::days(day) + Duration::hours(rng.gen_range(9..=16));
            let end = start + Duration::minutes(90);
            starts.push(start);
            data.push(
                ScheduleEntry,
                vec![
                    ("id_lect", rng.gen_range(1i64..=7).into()),
                    ("id_group", rng.gen_range(1i64..=4).into()),
                    ("starttime", timestamp(start)),
                    ("endtime", timestamp(end)),
                ],
            );
        }

        for _ in 0..30 {
            let schedule = rng.gen_range(0..starts.len());
            let visited = starts[schedule] + Duration::minutes(rng.gen_range(0..=15));
            data.push(
                VisitRecord,
                vec![
                    ("id_student", rng.gen_range(1i64..=19).into()),
                    ("id_rasp", (schedule as i64 + 1).into()),
                    ("visittime", timestamp(visited)),
                ],
            );
        }

        data
    }
}

/// Monday 2023-09-04 00:00 UTC, the first day of the reference schedule
pub fn reference_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 9, 4, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Canonical text form of a timestamp
pub fn timestamp(at: DateTime<Utc>) -> Value {
    Value::from(at.to_rfc3339())
}

/// Bind a JSON value as a typed SQL parameter for the column kind
pub fn sql_param(
    value: &Value,
    kind: Option<AttrKind>,
) -> ProjectionResult<Box<dyn postgres_types::ToSql + Sync + Send>> {
    let mismatch = || ProjectionError::SchemaMismatch(format!("cannot bind {} as {:?}", value, kind));

    Ok(match (kind, value) {
        (_, Value::Null) => match kind {
            None => Box::new(None::<i32>),
            Some(AttrKind::Text) => Box::new(None::<String>),
            Some(AttrKind::Date) => Box::new(None::<NaiveDate>),
            Some(AttrKind::Timestamp) => Box::new(None::<DateTime<Utc>>),
            Some(AttrKind::Bool) => Box::new(None::<bool>),
        },
        (None, Value::Number(n)) => {
            let id = n.as_i64().and_then(|i| i32::try_from(i).ok()).ok_or_else(mismatch)?;
            Box::new(id)
        }
        (Some(AttrKind::Text), Value::String(s)) => Box::new(s.clone()),
        (Some(AttrKind::Date), Value::String(s)) => {
            Box::new(NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| mismatch())?)
        }
        (Some(AttrKind::Timestamp), Value::String(s)) => Box::new(
            DateTime::parse_from_rfc3339(s)
                .map_err(|_| mismatch())?
                .with_timezone(&Utc),
        ),
        (Some(AttrKind::Bool), Value::Bool(b)) => Box::new(*b),
        _ => return Err(mismatch()),
    })
}

const SURNAMES: [&str; 12] = [
    "Иванов", "Петров", "Смирнова", "Кузнецов", "Попова", "Соколов",
    "Лебедева", "Козлов", "Новикова", "Морозов", "Волкова", "Зайцев",
];

const FIRST_NAMES: [&str; 10] = [
    "Алексей", "Мария", "Дмитрий", "Анна", "Сергей",
    "Екатерина", "Иван", "Ольга", "Михаил", "Наталья",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::university_registry;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_reference_counts() {
        let data = CanonicalDataset::reference(&mut StdRng::seed_from_u64(42));
        let expected = [
            (EntityKind::University, 3),
            (EntityKind::Institute, 4),
            (EntityKind::Department, 5),
            (EntityKind::Specialty, 4),
            (EntityKind::Course, 5),
            (EntityKind::Group, 4),
            (EntityKind::Student, 19),
            (EntityKind::Lecture, 7),
            (EntityKind::Material, 5),
            (EntityKind::ScheduleEntry, 10),
            (EntityKind::VisitRecord, 30),
        ];
        for (kind, count) in expected {
            assert_eq!(data.count(kind), count, "{}", kind);
        }
        assert_eq!(data.total(), 96);
    }

    #[test]
    fn test_reference_is_reproducible_for_a_seed() {
        let a = CanonicalDataset::reference(&mut StdRng::seed_from_u64(7));
        let b = CanonicalDataset::reference(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_reference_matches_registry_columns() {
        let registry = university_registry().unwrap();
        let data = CanonicalDataset::reference(&mut StdRng::seed_from_u64(1));
        data.validate(&registry).unwrap();
    }

    #[test]
    fn test_visits_fall_inside_their_schedule_slot() {
        let data = CanonicalDataset::reference(&mut StdRng::seed_from_u64(3));
        let schedule = data.rows(EntityKind::ScheduleEntry);

        for visit in data.rows(EntityKind::VisitRecord) {
            let rasp = visit.columns["id_rasp"].as_i64().unwrap();
            let slot = &schedule[(rasp - 1) as usize];
            let start = DateTime::parse_from_rfc3339(slot.columns["starttime"].as_str().unwrap()).unwrap();
            let at = DateTime::parse_from_rfc3339(visit.columns["visittime"].as_str().unwrap()).unwrap();
            let late = (at - start).num_minutes();
            assert!((0..=15).contains(&late));
        }
    }

    #[test]
    fn test_sql_param_rejects_wrong_shape() {
        assert!(sql_param(&Value::from("2023-09-01"), Some(AttrKind::Date)).is_ok());
        assert!(sql_param(&Value::from("soon"), Some(AttrKind::Date)).is_err());
        assert!(sql_param(&Value::from(true), Some(AttrKind::Text)).is_err());
        assert!(sql_param(&Value::Null, Some(AttrKind::Bool)).is_ok());
    }
}

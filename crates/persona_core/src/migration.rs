//! Bulk loading of a full historical timeline from an external system.
//!
//! Records arrive as bookings: each carries the values of the fields it
//! mentions, a validity interval and whether it is the subject's latest
//! booking. Previous migration output for the same fields is discarded, the
//! records are replayed oldest first through [`VersionedPerson::reconcile`],
//! and end bounds are inferred from adjacency except where bookings overlap.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    ActorId, ChangedFields, EntryId, Field, PersonPatch, PersonaError, PersonaResult, Reconcile,
    Source, Timestamp, VersionedPerson,
};

/// When and by whom a field was last changed in the source system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChangeMeta {
    pub modified_at: Timestamp,
    pub modified_by: ActorId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub applies_from: Timestamp,
    #[serde(default)]
    pub applies_to: Option<Timestamp>,
    #[serde(default)]
    pub latest_booking: bool,
    pub values: PersonPatch,
    #[serde(default)]
    pub modified: BTreeMap<Field, FieldChangeMeta>,
}

impl MigrationRecord {
    fn overlaps(&self, other: &MigrationRecord) -> bool {
        let Some(end) = self.applies_to else {
            return false;
        };
        other.applies_from < end && other.applies_to.is_none_or(|other_end| other_end > self.applies_from)
    }

    fn contains(&self, other: &MigrationRecord) -> bool {
        let Some(other_end) = other.applies_to else {
            return false;
        };
        self.applies_from <= other.applies_from && self.applies_to.is_none_or(|end| end >= other_end)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Entries created by this pass, i.e. those stamped with its `migrated_at`.
    pub created: Vec<EntryId>,
    pub discarded: usize,
    pub changed: ChangedFields,
}

/// Sorts records into application order: by start, open-ended last.
fn application_order(records: &[MigrationRecord]) -> Vec<usize> {
    let mut order = (0..records.len()).collect::<Vec<_>>();
    order.sort_by(|&left, &right| {
        let (left, right) = (&records[left], &records[right]);
        left.applies_from
            .cmp(&right.applies_from)
            .then_with(|| match (left.applies_to, right.applies_to) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
    });
    order
}

/// Whether a record's declared end must be kept verbatim instead of being
/// inferred from the next booking's start.
///
/// That is the case for nested bookings (contained in another record), for
/// bookings overlapping another record, and for a trailing historical
/// booking that has no successor to infer from.
fn keeps_declared_end(records: &[MigrationRecord], order: &[usize], position: usize) -> bool {
    let index = order[position];
    let record = &records[index];
    if record.applies_to.is_none() {
        return false;
    }
    let entangled = records.iter().enumerate().any(|(other_index, other)| {
        other_index != index && (other.contains(record) || record.overlaps(other))
    });
    let trailing = position + 1 == order.len() && !record.latest_booking;
    entangled || trailing
}

pub fn validate_records(records: &[MigrationRecord]) -> PersonaResult<()> {
    for (index, record) in records.iter().enumerate() {
        if let Some(end) = record.applies_to.filter(|end| *end < record.applies_from) {
            return Err(PersonaError::validation(format!(
                "migration record {index} ends at {end} before it starts at {}",
                record.applies_from
            )));
        }
        record.values.validate()?;
    }
    Ok(())
}

/// Replaces the migrated history of the mentioned fields with `records`.
///
/// `migrated_at` stamps every created entry and is also the record time for
/// fields without source metadata. Empty input changes nothing.
pub fn migrate_timeline(
    person: &mut VersionedPerson,
    records: &[MigrationRecord],
    actor: ActorId,
    migrated_at: Timestamp,
) -> PersonaResult<MigrationOutcome> {
    if records.is_empty() {
        return Ok(MigrationOutcome::default());
    }
    validate_records(records)?;

    let fields = records
        .iter()
        .flat_map(|record| record.values.mentioned_fields())
        .collect::<BTreeSet<_>>();
    let discarded = person.discard_migrated(&fields);
    if discarded > 0 {
        debug!(
            "discarded {discarded} migrated entries of subject {} before reload",
            person.subject_id()
        );
    }

    let order = application_order(records);
    let mut changed = ChangedFields::new();
    for (position, &index) in order.iter().enumerate() {
        let record = &records[index];
        let applies_to = if keeps_declared_end(records, &order, position) {
            record.applies_to
        } else {
            None
        };
        let mentioned = person.apply_patch(&record.values)?;
        for field in mentioned {
            let meta = record.modified.get(&field);
            let ctx = Reconcile {
                applies_from: record.applies_from,
                applies_to,
                recorded_at: meta.map_or(migrated_at, |meta| meta.modified_at),
                actor: meta.map_or(actor, |meta| meta.modified_by),
                source: Source::External,
                migrated_at: Some(migrated_at),
                force_anomalous: !record.latest_booking && record.applies_to.is_none(),
            };
            if person.reconcile_lapsed(&ctx, field) {
                changed.insert(field);
            } else {
                changed.extend(person.reconcile(&ctx, &[field]));
            }
        }
    }

    let created = person
        .entries()
        .iter()
        .filter(|entry| entry.migrated_at == Some(migrated_at))
        .map(|entry| entry.entry_id)
        .collect::<Vec<_>>();
    info!(
        "migrated {} records into {} entries for subject {}",
        records.len(),
        created.len(),
        person.subject_id()
    );
    Ok(MigrationOutcome {
        created,
        discarded,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{MigrationRecord, migrate_timeline};
    use crate::{
        ActorId, Field, FieldValue, PersonPatch, Presence, SubjectId, Timestamp, VersionedPerson,
    };

    fn ts(value: &str) -> Timestamp {
        Timestamp::parse_rfc3339(value).expect("timestamp")
    }

    fn status(code: &str) -> PersonPatch {
        PersonPatch {
            marital_status: Presence::value(crate::CodeRef::new(code).expect("code")),
            ..PersonPatch::default()
        }
    }

    fn record(from: &str, to: Option<&str>, latest: bool, code: &str) -> MigrationRecord {
        MigrationRecord {
            applies_from: ts(from),
            applies_to: to.map(ts),
            latest_booking: latest,
            values: status(code),
            modified: BTreeMap::new(),
        }
    }

    fn end_of(person: &VersionedPerson, code: &str) -> Option<Timestamp> {
        person
            .entries()
            .iter()
            .find(|entry| {
                entry.value == Some(FieldValue::Code(crate::CodeRef::new(code).unwrap()))
            })
            .and_then(|entry| entry.applies_to)
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let mut person = VersionedPerson::new(SubjectId::new(), Timestamp(0));
        let outcome =
            migrate_timeline(&mut person, &[], ActorId::new(), Timestamp(1)).expect("migrate");
        assert!(outcome.created.is_empty());
        assert!(person.entries().is_empty());
    }

    #[test]
    fn overlapping_booking_keeps_its_declared_end() {
        let records = vec![
            record("2025-01-01T00:00:00Z", None, true, "married"),
            record("2024-12-01T00:00:00Z", Some("2025-01-01T00:00:00Z"), false, "engaged"),
            record("2024-11-01T00:00:00Z", Some("2024-12-15T00:00:00Z"), false, "single"),
        ];
        let mut person = VersionedPerson::new(SubjectId::new(), Timestamp(0));
        let outcome =
            migrate_timeline(&mut person, &records, ActorId::new(), Timestamp::now()).expect("migrate");

        assert_eq!(outcome.created.len(), 3);
        assert_eq!(end_of(&person, "single"), Some(ts("2024-12-15T00:00:00Z")));
        assert_eq!(end_of(&person, "engaged"), Some(ts("2025-01-01T00:00:00Z")));
        assert_eq!(end_of(&person, "married"), None);
        let latest = person.latest_entry(Field::MaritalStatus).expect("latest");
        assert_eq!(latest.applies_from, ts("2025-01-01T00:00:00Z"));
        assert_eq!(person.value(Field::MaritalStatus), latest.value);
    }

    #[test]
    fn contained_booking_keeps_its_declared_end() {
        let records = vec![
            record("2024-01-01T00:00:00Z", Some("2024-12-31T00:00:00Z"), false, "married"),
            record("2024-03-01T00:00:00Z", Some("2024-04-01T00:00:00Z"), false, "separated"),
            record("2024-12-31T00:00:00Z", None, true, "divorced"),
        ];
        let mut person = VersionedPerson::new(SubjectId::new(), Timestamp(0));
        migrate_timeline(&mut person, &records, ActorId::new(), Timestamp::now()).expect("migrate");
        assert_eq!(end_of(&person, "separated"), Some(ts("2024-04-01T00:00:00Z")));
        assert_eq!(end_of(&person, "married"), Some(ts("2024-12-31T00:00:00Z")));
    }

    #[test]
    fn latest_booking_repeating_a_closed_value_stays_open() {
        let records = vec![
            record("2020-01-01T00:00:00Z", Some("2021-01-01T00:00:00Z"), false, "single"),
            record("2020-06-01T00:00:00Z", Some("2022-01-01T00:00:00Z"), false, "married"),
            record("2022-01-01T00:00:00Z", None, true, "married"),
        ];
        let mut person = VersionedPerson::new(SubjectId::new(), Timestamp(0));
        let outcome =
            migrate_timeline(&mut person, &records, ActorId::new(), Timestamp::now()).expect("migrate");

        assert_eq!(outcome.created.len(), 3);
        let history = person.field_history(Field::MaritalStatus);
        assert_eq!(history.iter().filter(|entry| entry.is_open()).count(), 1);
        let married = FieldValue::Code(crate::CodeRef::new("married").expect("code"));
        let present = person
            .value_at(Field::MaritalStatus, ts("2023-01-01T00:00:00Z"), None)
            .expect("value in 2023");
        assert_eq!(present.value, Some(married.clone()));
        assert_eq!(present.applies_from, ts("2022-01-01T00:00:00Z"));
        assert_eq!(person.value(Field::MaritalStatus), Some(married));
    }

    #[test]
    fn repeated_value_inside_a_closed_booking_adds_nothing() {
        let records = vec![
            record("2020-01-01T00:00:00Z", Some("2022-01-01T00:00:00Z"), false, "married"),
            record("2020-06-01T00:00:00Z", Some("2021-01-01T00:00:00Z"), false, "married"),
            record("2022-01-01T00:00:00Z", None, true, "divorced"),
        ];
        let mut person = VersionedPerson::new(SubjectId::new(), Timestamp(0));
        let outcome =
            migrate_timeline(&mut person, &records, ActorId::new(), Timestamp::now()).expect("migrate");
        assert_eq!(outcome.created.len(), 2);
    }

    #[test]
    fn adjacent_bookings_are_closed_by_their_successor() {
        let records = vec![
            record("2020-01-01T00:00:00Z", Some("2020-06-01T00:00:00Z"), false, "single"),
            record("2021-01-01T00:00:00Z", None, true, "married"),
        ];
        let mut person = VersionedPerson::new(SubjectId::new(), Timestamp(0));
        migrate_timeline(&mut person, &records, ActorId::new(), Timestamp::now()).expect("migrate");
        assert_eq!(end_of(&person, "single"), Some(ts("2021-01-01T00:00:00Z")));
    }

    #[test]
    fn unbounded_historical_booking_is_flagged() {
        let records = vec![
            record("2020-01-01T00:00:00Z", None, false, "single"),
            record("2021-01-01T00:00:00Z", None, true, "married"),
        ];
        let mut person = VersionedPerson::new(SubjectId::new(), Timestamp(0));
        migrate_timeline(&mut person, &records, ActorId::new(), Timestamp::now()).expect("migrate");
        let flagged = person.anomalies().collect::<Vec<_>>();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].applies_from, ts("2020-01-01T00:00:00Z"));
        assert_eq!(flagged[0].applies_to, None);
    }

    #[test]
    fn rerun_replaces_previous_migration_but_keeps_manual_edits() {
        let actor = ActorId::new();
        let mut person = VersionedPerson::new(SubjectId::new(), Timestamp(0));
        let manual = PersonPatch {
            given_name: Presence::value("Aino".into()),
            ..PersonPatch::default()
        };
        person.apply_edit(&manual, actor, ts("2025-02-01T00:00:00Z")).expect("edit");

        let records = vec![record("2024-01-01T00:00:00Z", None, true, "single")];
        migrate_timeline(&mut person, &records, actor, Timestamp::now()).expect("first");
        let records = vec![
            record("2023-01-01T00:00:00Z", Some("2024-01-01T00:00:00Z"), false, "single"),
            record("2024-01-01T00:00:00Z", None, true, "married"),
        ];
        let second = migrate_timeline(&mut person, &records, actor, Timestamp::now()).expect("second");

        assert_eq!(second.discarded, 1);
        assert_eq!(second.created.len(), 2);
        assert_eq!(person.field_history(Field::MaritalStatus).len(), 2);
        assert_eq!(person.field_history(Field::GivenName).len(), 1);
        assert!(person.pending().discarded.len() == 1);
    }

    #[test]
    fn source_metadata_becomes_record_time() {
        let source_actor = ActorId::new();
        let mut rec = record("2024-01-01T00:00:00Z", None, true, "single");
        rec.modified.insert(
            Field::MaritalStatus,
            super::FieldChangeMeta {
                modified_at: ts("2024-01-02T09:00:00Z"),
                modified_by: source_actor,
            },
        );
        let mut person = VersionedPerson::new(SubjectId::new(), Timestamp(0));
        migrate_timeline(&mut person, &[rec], ActorId::new(), Timestamp::now()).expect("migrate");
        let entry = person.latest_entry(Field::MaritalStatus).expect("entry");
        assert_eq!(entry.created_at, ts("2024-01-02T09:00:00Z"));
        assert_eq!(entry.created_by, source_actor);
        let meta = person.metadata(Field::MaritalStatus).expect("meta");
        assert_eq!(meta.last_modified_by, source_actor);
    }

    #[test]
    fn inverted_record_is_rejected_before_any_change() {
        let records = vec![record("2024-05-01T00:00:00Z", Some("2024-01-01T00:00:00Z"), false, "single")];
        let mut person = VersionedPerson::new(SubjectId::new(), Timestamp(0));
        assert!(migrate_timeline(&mut person, &records, ActorId::new(), Timestamp::now()).is_err());
        assert!(person.entries().is_empty());
        assert!(person.state().marital_status.is_none());
    }
}

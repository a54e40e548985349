//! Single corrections arriving from an external system.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    ActorId, ChangedFields, EntryId, Field, FieldChangeMeta, HistoryEntry, PersonPatch,
    PersonaError, PersonaResult, Presence, Reconcile, Source, SubjectId, Timestamp,
    VersionedPerson,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUpdate {
    pub subject_id: SubjectId,
    /// `true` when the correction concerns the subject's current period.
    pub latest_booking: bool,
    pub applies_from: Timestamp,
    #[serde(default)]
    pub applies_to: Option<Timestamp>,
    pub recorded_at: Timestamp,
    pub actor: ActorId,
    pub values: PersonPatch,
    #[serde(default)]
    pub modified: BTreeMap<Field, FieldChangeMeta>,
}

impl SyncUpdate {
    fn meta_for(&self, field: Field) -> FieldChangeMeta {
        self.modified
            .get(&field)
            .copied()
            .unwrap_or(FieldChangeMeta {
                modified_at: self.recorded_at,
                modified_by: self.actor,
            })
    }
}

/// Latest-booking path: mutate live values and reconcile each mentioned field
/// as an external change. Inverted bounds self-heal through the anomaly flag.
pub fn apply_latest_booking(
    person: &mut VersionedPerson,
    update: &SyncUpdate,
) -> PersonaResult<ChangedFields> {
    let fields = person.apply_patch(&update.values)?;
    let mut changed = ChangedFields::new();
    for field in fields {
        let meta = update.meta_for(field);
        let ctx = Reconcile {
            applies_from: update.applies_from,
            applies_to: update.applies_to,
            recorded_at: meta.modified_at,
            actor: meta.modified_by,
            source: Source::External,
            migrated_at: None,
            force_anomalous: false,
        };
        changed.extend(person.reconcile(&ctx, &[field]));
    }
    Ok(changed)
}

/// Historical-booking path: append one entry per mentioned field at the
/// declared interval without touching live values or any open entry.
///
/// Unlike reconciliation, contradictory bounds are rejected outright. A
/// booking without an end cannot be placed and is stored flagged anomalous.
pub fn insert_historical_booking(
    person: &mut VersionedPerson,
    update: &SyncUpdate,
) -> PersonaResult<Vec<EntryId>> {
    if let Some(end) = update.applies_to.filter(|end| *end < update.applies_from) {
        return Err(PersonaError::invalid_interval(format!(
            "historical booking for subject {} ends at {end} before it starts at {}",
            update.subject_id, update.applies_from
        )));
    }
    update.values.validate()?;

    let mut inserted = Vec::new();
    for field in update.values.mentioned_fields() {
        let Presence::SetTo(value) = update.values.get(field) else {
            continue;
        };
        let meta = update.meta_for(field);
        let entry = HistoryEntry {
            entry_id: EntryId::new(),
            subject_id: person.subject_id(),
            field,
            value: field.check(value)?,
            applies_from: update.applies_from,
            applies_to: update.applies_to,
            created_at: meta.modified_at,
            created_by: meta.modified_by,
            source: Source::External,
            migrated_at: None,
            merged_at: None,
            merged_from: None,
            anomalous: update.applies_to.is_none(),
        };
        debug!(
            "historical {} entry {} for subject {} at [{}, {:?})",
            field, entry.entry_id, entry.subject_id, entry.applies_from, entry.applies_to
        );
        inserted.push(entry.entry_id);
        person.push_entry(entry);
    }
    Ok(inserted)
}

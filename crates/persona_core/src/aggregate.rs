//! The versioned person aggregate and its reconciliation primitive.
//!
//! A [`VersionedPerson`] owns the live field values, every history entry of
//! the subject and the per-field metadata cache. All write paths (internal
//! edits, external syncs, migrations) funnel through
//! [`VersionedPerson::reconcile`], which diffs live values against the latest
//! entry of each requested field and closes/opens validity intervals.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use crate::entry::{CloseOutcome, entry_order};
use crate::{
    ActorId, EntryId, Field, FieldMetadata, FieldValue, HistoryEntry, PersonPatch, PersonState,
    PersonaResult, Source, SubjectId, Timestamp,
};

pub type ChangedFields = BTreeSet<Field>;

/// Parameters of one reconciliation pass.
#[derive(Clone, Copy, Debug)]
pub struct Reconcile {
    pub applies_from: Timestamp,
    pub applies_to: Option<Timestamp>,
    pub recorded_at: Timestamp,
    pub actor: ActorId,
    pub source: Source,
    pub migrated_at: Option<Timestamp>,
    pub force_anomalous: bool,
}

impl Reconcile {
    /// A same-instant internal edit: valid from the moment it was recorded.
    pub fn internal_edit(actor: ActorId, recorded_at: Timestamp) -> Self {
        Self {
            applies_from: recorded_at,
            applies_to: None,
            recorded_at,
            actor,
            source: Source::Internal,
            migrated_at: None,
            force_anomalous: false,
        }
    }
}

/// Entry-level changes not yet written to storage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingWrites {
    /// Created, closed, flagged or re-owned since the last save.
    pub touched: BTreeSet<EntryId>,
    /// Removed from the aggregate (superseded migration output).
    pub discarded: BTreeSet<EntryId>,
}

impl PendingWrites {
    pub fn is_empty(&self) -> bool {
        self.touched.is_empty() && self.discarded.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct VersionedPerson {
    subject_id: SubjectId,
    state: PersonState,
    entries: Vec<HistoryEntry>,
    metadata: BTreeMap<Field, FieldMetadata>,
    created_at: Timestamp,
    pending: PendingWrites,
}

impl VersionedPerson {
    /// A subject seen for the first time, with empty state and no history.
    pub fn new(subject_id: SubjectId, created_at: Timestamp) -> Self {
        Self {
            subject_id,
            state: PersonState::default(),
            entries: Vec::new(),
            metadata: BTreeMap::new(),
            created_at,
            pending: PendingWrites::default(),
        }
    }

    /// Rebuilds an aggregate from persisted parts.
    pub fn restore(
        subject_id: SubjectId,
        state: PersonState,
        entries: Vec<HistoryEntry>,
        metadata: BTreeMap<Field, FieldMetadata>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            subject_id,
            state,
            entries,
            metadata,
            created_at,
            pending: PendingWrites::default(),
        }
    }

    pub fn subject_id(&self) -> SubjectId {
        self.subject_id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn state(&self) -> &PersonState {
        &self.state
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn entry(&self, entry_id: EntryId) -> Option<&HistoryEntry> {
        self.entries.iter().find(|entry| entry.entry_id == entry_id)
    }

    pub fn metadata(&self, field: Field) -> Option<&FieldMetadata> {
        self.metadata.get(&field)
    }

    pub fn all_metadata(&self) -> &BTreeMap<Field, FieldMetadata> {
        &self.metadata
    }

    pub fn value(&self, field: Field) -> Option<FieldValue> {
        field.get(&self.state)
    }

    /// Sets a live value ahead of a [`reconcile`](Self::reconcile) call.
    pub fn set_value(&mut self, field: Field, value: Option<FieldValue>) -> PersonaResult<()> {
        field.set(&mut self.state, value)
    }

    /// Writes the patch's mentioned fields into live state and returns them.
    pub fn apply_patch(&mut self, patch: &PersonPatch) -> PersonaResult<Vec<Field>> {
        patch.apply_to(&mut self.state)
    }

    /// Entries of one field, oldest first.
    pub fn field_history(&self, field: Field) -> Vec<&HistoryEntry> {
        let mut history = self
            .entries
            .iter()
            .filter(|entry| entry.field == field)
            .collect::<Vec<_>>();
        history.sort_by(|left, right| entry_order(left, right));
        history
    }

    pub fn latest_entry(&self, field: Field) -> Option<&HistoryEntry> {
        self.latest_index(field).map(|index| &self.entries[index])
    }

    fn latest_index(&self, field: Field) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.field == field)
            .max_by(|(_, left), (_, right)| entry_order(left, right))
            .map(|(index, _)| index)
    }

    pub fn anomalies(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().filter(|entry| entry.anomalous)
    }

    /// The value of `field` valid at `valid_at`, as it was known at
    /// `known_at` (or now, when `None`).
    pub fn value_at(
        &self,
        field: Field,
        valid_at: Timestamp,
        known_at: Option<Timestamp>,
    ) -> Option<&HistoryEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.field == field)
            .filter(|entry| known_at.is_none_or(|known| entry.created_at <= known))
            .filter(|entry| entry.is_valid_at(valid_at))
            .max_by(|left, right| entry_order(left, right))
    }

    /// Diffs live values against each field's latest entry, closing the
    /// previous interval and appending a new entry for every field whose
    /// value changed. Live values must already be set by the caller.
    pub fn reconcile(&mut self, ctx: &Reconcile, fields: &[Field]) -> ChangedFields {
        let mut changed = ChangedFields::new();
        for &field in fields {
            let current = field.get(&self.state);
            let prior = self.latest_index(field);
            let differs = match prior {
                Some(index) => self.entries[index].value != current,
                None => true,
            };
            if !differs {
                continue;
            }
            if let Some(index) = prior {
                self.close_prior(index, ctx);
            }
            self.append_with_metadata(field, current, ctx);
            changed.insert(field);
        }
        changed
    }

    /// Appends the live value of `field` when its latest entry already ended
    /// before the interval in `ctx` does, even if the values are equal.
    /// Without this a replayed booking repeating a closed booking's value
    /// would leave the period after that close uncovered.
    pub(crate) fn reconcile_lapsed(&mut self, ctx: &Reconcile, field: Field) -> bool {
        let Some(end) = self
            .latest_index(field)
            .and_then(|index| self.entries[index].applies_to)
        else {
            return false;
        };
        if ctx.applies_to.is_some_and(|to| to <= end) {
            return false;
        }
        debug!(
            "latest {field} entry of subject {} ended at {end}; appending repeated value",
            self.subject_id
        );
        let current = field.get(&self.state);
        self.append_with_metadata(field, current, ctx);
        true
    }

    fn append_with_metadata(&mut self, field: Field, value: Option<FieldValue>, ctx: &Reconcile) {
        self.append(field, value, ctx);
        self.metadata.insert(
            field,
            FieldMetadata {
                last_modified_at: ctx.recorded_at,
                last_modified_by: ctx.actor,
            },
        );
    }

    fn close_prior(&mut self, index: usize, ctx: &Reconcile) {
        let prior = &mut self.entries[index];
        if !prior.is_open() {
            return;
        }
        let candidate = if ctx.applies_from > prior.applies_from {
            ctx.applies_from
        } else {
            ctx.recorded_at
        };
        match prior.close_at(candidate) {
            CloseOutcome::Closed => {
                debug!(
                    "closed {} entry {} of subject {} at {}",
                    prior.field, prior.entry_id, prior.subject_id, candidate
                );
            }
            CloseOutcome::FlaggedAnomalous => {
                warn!(
                    "entry {} ({}) of subject {} starts at {} after close candidate {}; flagged anomalous",
                    prior.entry_id, prior.field, prior.subject_id, prior.applies_from, candidate
                );
            }
        }
        self.pending.touched.insert(prior.entry_id);
    }

    fn append(&mut self, field: Field, value: Option<FieldValue>, ctx: &Reconcile) {
        let mut entry = HistoryEntry {
            entry_id: EntryId::new(),
            subject_id: self.subject_id,
            field,
            value,
            applies_from: ctx.applies_from,
            applies_to: ctx.applies_to,
            created_at: ctx.recorded_at,
            created_by: ctx.actor,
            source: ctx.source,
            migrated_at: ctx.migrated_at,
            merged_at: None,
            merged_from: None,
            anomalous: ctx.force_anomalous,
        };
        if entry.anomalous {
            entry.applies_to = None;
        } else if let Some(end) = entry.applies_to {
            entry.close_at(end);
        }
        self.push_entry(entry);
    }

    /// Appends an entry as-is, bypassing the open-entry closing logic.
    pub fn push_entry(&mut self, entry: HistoryEntry) {
        self.pending.touched.insert(entry.entry_id);
        self.entries.push(entry);
    }

    /// Marks an existing entry as modified so the next save writes it.
    pub(crate) fn entry_mut(&mut self, entry_id: EntryId) -> Option<&mut HistoryEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.entry_id == entry_id)?;
        self.pending.touched.insert(entry_id);
        Some(entry)
    }

    /// Drops every migration-produced entry of `fields`; manual and synced
    /// entries stay.
    pub fn discard_migrated(&mut self, fields: &BTreeSet<Field>) -> usize {
        let mut discarded = Vec::new();
        self.entries.retain(|entry| {
            let drop = entry.migrated_at.is_some() && fields.contains(&entry.field);
            if drop {
                discarded.push(entry.entry_id);
            }
            !drop
        });
        for entry_id in &discarded {
            self.pending.touched.remove(entry_id);
            self.pending.discarded.insert(*entry_id);
        }
        discarded.len()
    }

    pub(crate) fn set_metadata(&mut self, field: Field, metadata: FieldMetadata) {
        self.metadata.insert(field, metadata);
    }

    /// Removes and returns every entry, leaving an empty history. Used when
    /// the aggregate is merged into another subject.
    pub(crate) fn take_entries(&mut self) -> Vec<HistoryEntry> {
        self.pending.touched.clear();
        std::mem::take(&mut self.entries)
    }

    pub fn pending(&self) -> &PendingWrites {
        &self.pending
    }

    pub fn take_pending(&mut self) -> PendingWrites {
        std::mem::take(&mut self.pending)
    }

    /// Internal edit path: apply the patch, then reconcile the mentioned
    /// fields at `recorded_at`.
    pub fn apply_edit(
        &mut self,
        patch: &PersonPatch,
        actor: ActorId,
        recorded_at: Timestamp,
    ) -> PersonaResult<ChangedFields> {
        let fields = self.apply_patch(patch)?;
        Ok(self.reconcile(&Reconcile::internal_edit(actor, recorded_at), &fields))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{Reconcile, VersionedPerson};
    use crate::{
        ActorId, Field, FieldValue, PersonPatch, Presence, Source, SubjectId, Timestamp,
    };

    fn person() -> VersionedPerson {
        VersionedPerson::new(SubjectId::new(), Timestamp(0))
    }

    fn name_patch(name: &str) -> PersonPatch {
        PersonPatch {
            given_name: Presence::value(name.to_string()),
            ..PersonPatch::default()
        }
    }

    fn open_count(person: &VersionedPerson, field: Field) -> usize {
        person
            .field_history(field)
            .iter()
            .filter(|entry| entry.is_open())
            .count()
    }

    fn sync(from: i64, recorded: i64) -> Reconcile {
        Reconcile {
            applies_from: Timestamp(from),
            applies_to: None,
            recorded_at: Timestamp(recorded),
            actor: ActorId::new(),
            source: Source::External,
            migrated_at: None,
            force_anomalous: false,
        }
    }

    #[test]
    fn first_edit_opens_an_entry_and_records_metadata() {
        let mut person = person();
        let actor = ActorId::new();
        let changed = person
            .apply_edit(&name_patch("Aino"), actor, Timestamp(10))
            .expect("edit");
        assert_eq!(changed, BTreeSet::from([Field::GivenName]));
        let latest = person.latest_entry(Field::GivenName).expect("entry");
        assert!(latest.is_open());
        assert_eq!(latest.applies_from, Timestamp(10));
        assert_eq!(latest.source, Source::Internal);
        let meta = person.metadata(Field::GivenName).expect("metadata");
        assert_eq!(meta.last_modified_at, Timestamp(10));
        assert_eq!(meta.last_modified_by, actor);
    }

    #[test]
    fn successive_edits_keep_a_single_open_entry() {
        let mut person = person();
        let actor = ActorId::new();
        for (at, name) in [(10, "Aino"), (20, "Aini"), (30, "Aino"), (40, "Anna")] {
            person
                .apply_edit(&name_patch(name), actor, Timestamp(at))
                .expect("edit");
            assert_eq!(open_count(&person, Field::GivenName), 1);
        }
        let history = person.field_history(Field::GivenName);
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].applies_to, Some(Timestamp(20)));
        assert_eq!(history[1].applies_to, Some(Timestamp(30)));
        assert_eq!(history[2].applies_to, Some(Timestamp(40)));
        for entry in &history {
            assert!(entry.interval_is_consistent());
        }
        assert_eq!(
            person.latest_entry(Field::GivenName).unwrap().value,
            person.value(Field::GivenName)
        );
    }

    #[test]
    fn identical_values_are_a_no_op() {
        let mut person = person();
        let actor = ActorId::new();
        person
            .apply_edit(&name_patch("Aino"), actor, Timestamp(10))
            .expect("edit");
        let before_meta = *person.metadata(Field::GivenName).unwrap();
        let changed = person
            .apply_edit(&name_patch("Aino"), ActorId::new(), Timestamp(20))
            .expect("edit");
        assert!(changed.is_empty());
        assert_eq!(person.entries().len(), 1);
        assert_eq!(*person.metadata(Field::GivenName).unwrap(), before_meta);
    }

    #[test]
    fn backdated_change_closes_prior_at_record_time() {
        let mut person = person();
        person.set_value(Field::HeightCm, Some(FieldValue::Integer(170))).unwrap();
        person.reconcile(&sync(100, 100), &[Field::HeightCm]);

        person.set_value(Field::HeightCm, Some(FieldValue::Integer(171))).unwrap();
        person.reconcile(&sync(50, 200), &[Field::HeightCm]);

        let history = person.field_history(Field::HeightCm);
        assert_eq!(history[0].applies_from, Timestamp(100));
        assert_eq!(history[0].applies_to, Some(Timestamp(200)));
        assert!(!history[0].anomalous);
    }

    #[test]
    fn unresolvable_close_flags_prior_anomalous() {
        let mut person = person();
        person.set_value(Field::HeightCm, Some(FieldValue::Integer(170))).unwrap();
        person.reconcile(&sync(500, 500), &[Field::HeightCm]);

        person.set_value(Field::HeightCm, Some(FieldValue::Integer(171))).unwrap();
        person.reconcile(&sync(100, 200), &[Field::HeightCm]);

        let prior = person
            .entries()
            .iter()
            .find(|entry| entry.applies_from == Timestamp(500))
            .expect("prior");
        assert!(prior.anomalous);
        assert_eq!(prior.applies_to, None);
        let latest = person.latest_entry(Field::HeightCm).unwrap();
        assert_eq!(latest.value, Some(FieldValue::Integer(171)));
        assert_eq!(open_count(&person, Field::HeightCm), 1);
    }

    #[test]
    fn inverted_new_interval_self_heals() {
        let mut person = person();
        person.set_value(Field::Dependants, Some(FieldValue::Integer(1))).unwrap();
        let mut ctx = sync(300, 300);
        ctx.applies_to = Some(Timestamp(100));
        person.reconcile(&ctx, &[Field::Dependants]);
        let entry = person.latest_entry(Field::Dependants).unwrap();
        assert!(entry.anomalous);
        assert_eq!(entry.applies_to, None);
    }

    #[test]
    fn clearing_a_value_is_a_change() {
        let mut person = person();
        let actor = ActorId::new();
        person
            .apply_edit(&name_patch("Aino"), actor, Timestamp(10))
            .expect("edit");
        let clear = PersonPatch {
            given_name: Presence::cleared(),
            ..PersonPatch::default()
        };
        let changed = person.apply_edit(&clear, actor, Timestamp(20)).expect("edit");
        assert_eq!(changed, BTreeSet::from([Field::GivenName]));
        assert_eq!(person.latest_entry(Field::GivenName).unwrap().value, None);
    }

    #[test]
    fn value_at_answers_bitemporal_questions() {
        let mut person = person();
        let actor = ActorId::new();
        person.apply_edit(&name_patch("Aino"), actor, Timestamp(10)).unwrap();
        person.apply_edit(&name_patch("Anna"), actor, Timestamp(20)).unwrap();

        let at = |valid: i64, known: Option<i64>| {
            person
                .value_at(Field::GivenName, Timestamp(valid), known.map(Timestamp))
                .and_then(|entry| entry.value.clone())
        };
        assert_eq!(at(15, None), Some(FieldValue::String("Aino".into())));
        assert_eq!(at(25, None), Some(FieldValue::String("Anna".into())));
        assert_eq!(at(5, None), None);
        assert_eq!(at(15, Some(15)), Some(FieldValue::String("Aino".into())));
        // Nothing valid at 25 had been recorded yet at 15.
        assert_eq!(at(25, Some(15)), None);
    }

    #[test]
    fn pending_tracks_created_and_closed_entries() {
        let mut person = person();
        let actor = ActorId::new();
        person.apply_edit(&name_patch("Aino"), actor, Timestamp(10)).unwrap();
        let first = person.take_pending();
        assert_eq!(first.touched.len(), 1);
        person.apply_edit(&name_patch("Anna"), actor, Timestamp(20)).unwrap();
        let second = person.take_pending();
        assert_eq!(second.touched.len(), 2);
        assert!(person.pending().is_empty());
    }
}

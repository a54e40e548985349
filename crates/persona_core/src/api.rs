use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    ActorId, ChangedFields, EntryId, Field, FieldMetadata, FieldValue, HistoryEntry,
    MigrationRecord, PersonPatch, PersonState, PersonaResult, SubjectId, SyncUpdate, Timestamp,
};

/// External identity system consulted before a subject's first write.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn exists(&self, subject_id: SubjectId) -> PersonaResult<bool>;
}

/// Treats every subject as known. Used when no identity system is wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllIdentities;

#[async_trait]
impl IdentityValidator for AcceptAllIdentities {
    async fn exists(&self, _subject_id: SubjectId) -> PersonaResult<bool> {
        Ok(true)
    }
}

/// A fixed set of known subjects.
#[derive(Clone, Debug, Default)]
pub struct StaticIdentities {
    known: HashSet<SubjectId>,
}

impl StaticIdentities {
    pub fn insert(&mut self, subject_id: SubjectId) -> bool {
        self.known.insert(subject_id)
    }
}

impl FromIterator<SubjectId> for StaticIdentities {
    fn from_iter<I: IntoIterator<Item = SubjectId>>(iter: I) -> Self {
        Self {
            known: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl IdentityValidator for StaticIdentities {
    async fn exists(&self, subject_id: SubjectId) -> PersonaResult<bool> {
        Ok(self.known.contains(&subject_id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPersonInput {
    pub subject_id: SubjectId,
    pub actor: ActorId,
    /// Defaults to the store clock.
    #[serde(default)]
    pub recorded_at: Option<Timestamp>,
    pub patch: PersonPatch,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub changed: ChangedFields,
    /// Entries appended by a historical booking.
    pub inserted: Vec<EntryId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateTimelineInput {
    pub subject_id: SubjectId,
    pub actor: ActorId,
    pub records: Vec<MigrationRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub subject_id: SubjectId,
    pub migrated_at: Option<Timestamp>,
    pub created: Vec<EntryId>,
    pub discarded: usize,
    pub changed: ChangedFields,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSubjectsInput {
    pub from: SubjectId,
    pub to: SubjectId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub from: SubjectId,
    pub to: SubjectId,
    pub merged: bool,
    pub reowned: usize,
    pub changed: ChangedFields,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonView {
    pub subject_id: SubjectId,
    pub created_at: Timestamp,
    pub state: PersonState,
    pub metadata: BTreeMap<Field, FieldMetadata>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueAtInput {
    pub subject_id: SubjectId,
    pub field: Field,
    pub valid_at: Timestamp,
    #[serde(default)]
    pub known_at: Option<Timestamp>,
}

#[async_trait]
pub trait PersonWriteApi {
    async fn edit_person(&self, input: EditPersonInput) -> PersonaResult<ChangedFields>;
    /// Removes the subject with its history and metadata. Returns whether it existed.
    async fn purge_subject(&self, subject_id: SubjectId) -> PersonaResult<bool>;
}

#[async_trait]
pub trait PersonSyncApi {
    async fn apply_sync(&self, update: SyncUpdate) -> PersonaResult<SyncReport>;
}

#[async_trait]
pub trait PersonMigrationApi {
    async fn migrate_timeline(&self, input: MigrateTimelineInput)
    -> PersonaResult<MigrationReport>;
}

#[async_trait]
pub trait PersonMergeApi {
    async fn merge_subjects(&self, input: MergeSubjectsInput) -> PersonaResult<MergeReport>;
}

#[async_trait]
pub trait PersonReadApi {
    async fn read_person(&self, subject_id: SubjectId) -> PersonaResult<PersonView>;
    async fn field_history(
        &self,
        subject_id: SubjectId,
        field: Field,
    ) -> PersonaResult<Vec<HistoryEntry>>;
    async fn field_metadata(
        &self,
        subject_id: SubjectId,
        field: Field,
    ) -> PersonaResult<Option<FieldMetadata>>;
    async fn value_at(&self, input: ValueAtInput) -> PersonaResult<Option<FieldValue>>;
    async fn list_anomalies(&self, subject_id: SubjectId) -> PersonaResult<Vec<HistoryEntry>>;
}

#[cfg(test)]
mod tests {
    use super::{IdentityValidator, StaticIdentities};
    use crate::SubjectId;

    #[tokio::test]
    async fn static_identities_only_know_inserted_subjects() {
        let known = SubjectId::new();
        let mut identities = [known].into_iter().collect::<StaticIdentities>();
        assert!(identities.exists(known).await.expect("exists"));

        let late = SubjectId::new();
        assert!(!identities.exists(late).await.expect("exists"));
        assert!(identities.insert(late));
        assert!(identities.exists(late).await.expect("exists"));
    }
}

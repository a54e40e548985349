use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use sea_orm::sea_query;
use sea_orm::sea_query::{
    Expr, ExprTrait, MysqlQueryBuilder, OnConflict, PostgresQueryBuilder, Query,
    QueryStatementWriter, SqliteQueryBuilder, Value as SeaValue,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    DatabaseTransaction, QueryResult, Statement, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use uuid::Uuid;

use crate::db::*;
use crate::migration::Migrator;
use crate::{LimitsConfig, PersonaConfig, ValidationMode};
use persona_core::{
    AcceptAllIdentities, ActorId, ChangeNotification, ChangeSink, ChangedFields, EditPersonInput,
    EntryId, Field, FieldMetadata, FieldValue, HistoryEntry, Id, IdentityValidator, MergeReport,
    MergeSubjectsInput, MigrateTimelineInput, MigrationReport, NoopSink, PersonMergeApi,
    PersonMigrationApi, PersonPatch, PersonReadApi, PersonState, PersonSyncApi, PersonView,
    PersonWriteApi, PersonaError, PersonaResult, Presence, Source, SubjectId, SyncReport,
    SyncUpdate, Timestamp, ValueAtInput, VersionedPerson, apply_latest_booking, entry_order,
    insert_historical_booking, merge_subjects, migrate_timeline, validate_records,
};

/// SQL-backed home of person aggregates. Every write operation runs in one
/// transaction and publishes its change notification only after commit.
#[derive(Clone)]
pub struct PersonaStore {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    limits: PersonaLimits,
    validation_mode: ValidationMode,
    failpoints: HashSet<String>,
    identities: Arc<dyn IdentityValidator>,
    sink: Arc<dyn ChangeSink>,
}

#[derive(Clone, Copy, Debug)]
struct PersonaLimits {
    max_migration_records: usize,
    max_list_values: usize,
}

impl PersonaLimits {
    fn from_config(config: &PersonaConfig) -> Self {
        let limits = config.limits.clone().unwrap_or(LimitsConfig::with_defaults());
        Self {
            max_migration_records: limits.max_migration_records.unwrap_or(5_000),
            max_list_values: limits.max_list_values.unwrap_or(32),
        }
    }
}

const ENTRY_COLUMNS: [PersonaHistoryEntries; 13] = [
    PersonaHistoryEntries::EntryId,
    PersonaHistoryEntries::SubjectId,
    PersonaHistoryEntries::FieldName,
    PersonaHistoryEntries::ValueJson,
    PersonaHistoryEntries::AppliesFrom,
    PersonaHistoryEntries::AppliesTo,
    PersonaHistoryEntries::CreatedAt,
    PersonaHistoryEntries::CreatedBy,
    PersonaHistoryEntries::Source,
    PersonaHistoryEntries::MigratedAt,
    PersonaHistoryEntries::MergedAt,
    PersonaHistoryEntries::MergedFrom,
    PersonaHistoryEntries::Anomalous,
];

impl PersonaStore {
    pub async fn connect(config: &PersonaConfig, base_dir: &Path) -> PersonaResult<Self> {
        let url = config.connection_url(base_dir)?;
        let mut options = ConnectOptions::new(url);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        options.sqlx_logging(false);
        let conn = Database::connect(options).await.map_err(PersonaError::from)?;
        let backend = conn.get_database_backend();
        let store = Self {
            conn,
            backend,
            limits: PersonaLimits::from_config(config),
            validation_mode: config.validation_mode.unwrap_or(ValidationMode::Error),
            failpoints: config
                .failpoints
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect(),
            identities: Arc::new(AcceptAllIdentities),
            sink: Arc::new(NoopSink),
        };
        Migrator::up(&store.conn, None)
            .await
            .map_err(PersonaError::from)?;
        debug!("persona store connected ({:?})", store.backend);
        Ok(store)
    }

    /// Opens the datastore directory `base_dir`, creating `persona.json`
    /// and the SQLite file on first use.
    pub async fn open(base_dir: &Path) -> PersonaResult<Self> {
        let config = PersonaConfig::load_or_init(base_dir)?;
        info!(
            "opening {} persona store in {}",
            config.backend_name(),
            base_dir.display()
        );
        Self::connect(&config, base_dir).await
    }

    pub async fn connect_sqlite(path: &Path) -> PersonaResult<Self> {
        let config = PersonaConfig::default_sqlite(path.to_string_lossy());
        Self::connect(&config, path.parent().unwrap_or_else(|| Path::new("."))).await
    }

    /// Replaces the identity system consulted before a subject's first write.
    pub fn with_identity_validator(mut self, identities: Arc<dyn IdentityValidator>) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    fn validation_failure(&self, message: impl Into<String>) -> PersonaResult<()> {
        let message = message.into();
        match self.validation_mode {
            ValidationMode::Error => Err(PersonaError::validation(message)),
            ValidationMode::Warn => {
                warn!("persona validation warning: {message}");
                Ok(())
            }
            ValidationMode::Off => Ok(()),
        }
    }

    fn maybe_failpoint(&self, key: &str) -> PersonaResult<()> {
        if self.failpoints.contains(key) {
            Err(PersonaError::storage(format!("failpoint {key}")))
        } else {
            Ok(())
        }
    }

    fn check_list_limits(&self, patch: &PersonPatch) -> PersonaResult<()> {
        for field in patch.mentioned_fields() {
            let Presence::SetTo(Some(FieldValue::CodeList(codes))) = patch.get(field) else {
                continue;
            };
            if codes.len() > self.limits.max_list_values {
                self.validation_failure(format!(
                    "{field} carries {} codes, limit is {}",
                    codes.len(),
                    self.limits.max_list_values
                ))?;
            }
        }
        Ok(())
    }

    async fn notify(
        &self,
        subject_id: SubjectId,
        changed: &ChangedFields,
        source: Source,
        at: Timestamp,
    ) {
        if changed.is_empty() {
            return;
        }
        let notification = ChangeNotification {
            subject_id,
            changed_fields: changed.clone(),
            source,
            timestamp: at,
        };
        if let Err(err) = self.sink.publish(notification).await {
            warn!("change notification for subject {subject_id} not delivered: {err}");
        }
    }

    /// Every stored subject, in id order.
    pub async fn subject_ids(&self) -> PersonaResult<Vec<SubjectId>> {
        let select = Query::select()
            .from(PersonaSubjects::Table)
            .column(PersonaSubjects::SubjectId)
            .to_owned();
        let mut subjects = query_all(&self.conn, &select)
            .await?
            .iter()
            .map(|row| read_id(row, PersonaSubjects::SubjectId).map(SubjectId))
            .collect::<PersonaResult<Vec<_>>>()?;
        subjects.sort();
        Ok(subjects)
    }

    /// Takes the subject's write lock by bumping its lock version. Returns
    /// `false` when the subject has no row yet.
    async fn lock_subject<C: ConnectionTrait>(
        &self,
        conn: &C,
        subject_id: SubjectId,
    ) -> PersonaResult<bool> {
        let update = Query::update()
            .table(PersonaSubjects::Table)
            .value(
                PersonaSubjects::LockVersion,
                Expr::col(PersonaSubjects::LockVersion).add(1),
            )
            .and_where(
                Expr::col(PersonaSubjects::SubjectId).eq(id_value(self.backend, subject_id.0)),
            )
            .to_owned();
        Ok(exec(conn, &update).await? > 0)
    }

    async fn subject_exists<C: ConnectionTrait>(
        &self,
        conn: &C,
        subject_id: SubjectId,
    ) -> PersonaResult<bool> {
        let select = Query::select()
            .from(PersonaSubjects::Table)
            .column(PersonaSubjects::SubjectId)
            .and_where(
                Expr::col(PersonaSubjects::SubjectId).eq(id_value(self.backend, subject_id.0)),
            )
            .limit(1)
            .to_owned();
        Ok(query_one(conn, &select).await?.is_some())
    }

    /// Inserts an empty subject row after consulting the identity system.
    async fn create_subject(
        &self,
        tx: &DatabaseTransaction,
        subject_id: SubjectId,
        now: Timestamp,
    ) -> PersonaResult<()> {
        if !self.identities.exists(subject_id).await? {
            return Err(PersonaError::identity_not_found(format!(
                "subject {subject_id} is unknown to the identity system"
            )));
        }
        let state_json = serde_json::to_string(&PersonState::default())?;
        let insert = Query::insert()
            .into_table(PersonaSubjects::Table)
            .columns([
                PersonaSubjects::SubjectId,
                PersonaSubjects::StateJson,
                PersonaSubjects::CreatedAt,
                PersonaSubjects::UpdatedAt,
            ])
            .values_panic([
                id_value(self.backend, subject_id.0).into(),
                state_json.into(),
                now.as_micros().into(),
                now.as_micros().into(),
            ])
            .on_conflict(
                OnConflict::column(PersonaSubjects::SubjectId)
                    .do_nothing()
                    .to_owned(),
            )
            .to_owned();
        exec(tx, &insert).await?;
        debug!("created subject {subject_id}");
        Ok(())
    }

    /// Locks the subject and loads it, creating it first when absent.
    async fn lock_or_create(
        &self,
        tx: &DatabaseTransaction,
        subject_id: SubjectId,
        now: Timestamp,
    ) -> PersonaResult<VersionedPerson> {
        if !self.lock_subject(tx, subject_id).await? {
            self.create_subject(tx, subject_id, now).await?;
            if !self.lock_subject(tx, subject_id).await? {
                return Err(PersonaError::conflict(format!(
                    "subject {subject_id} could not be locked"
                )));
            }
        }
        self.load_person(tx, subject_id)
            .await?
            .ok_or_else(|| PersonaError::not_found(format!("subject {subject_id}")))
    }

    async fn load_person<C: ConnectionTrait>(
        &self,
        conn: &C,
        subject_id: SubjectId,
    ) -> PersonaResult<Option<VersionedPerson>> {
        let select = Query::select()
            .from(PersonaSubjects::Table)
            .columns([PersonaSubjects::StateJson, PersonaSubjects::CreatedAt])
            .and_where(
                Expr::col(PersonaSubjects::SubjectId).eq(id_value(self.backend, subject_id.0)),
            )
            .limit(1)
            .to_owned();
        let Some(row) = query_one(conn, &select).await? else {
            return Ok(None);
        };
        let state_json: String = row.try_get("", &col_name(PersonaSubjects::StateJson))?;
        let created_at: i64 = row.try_get("", &col_name(PersonaSubjects::CreatedAt))?;
        let state: PersonState = serde_json::from_str(&state_json)?;

        let entries = self.load_entries(conn, subject_id, None).await?;
        let metadata = self.load_metadata(conn, subject_id).await?;
        Ok(Some(VersionedPerson::restore(
            subject_id,
            state,
            entries,
            metadata,
            Timestamp(created_at),
        )))
    }

    async fn load_entries<C: ConnectionTrait>(
        &self,
        conn: &C,
        subject_id: SubjectId,
        field: Option<Field>,
    ) -> PersonaResult<Vec<HistoryEntry>> {
        let mut select = Query::select()
            .from(PersonaHistoryEntries::Table)
            .columns(ENTRY_COLUMNS)
            .and_where(
                Expr::col(PersonaHistoryEntries::SubjectId)
                    .eq(id_value(self.backend, subject_id.0)),
            )
            .to_owned();
        if let Some(field) = field {
            select.and_where(Expr::col(PersonaHistoryEntries::FieldName).eq(field.as_str()));
        }
        let rows = query_all(conn, &select).await?;
        rows.iter().map(read_entry).collect()
    }

    async fn load_metadata<C: ConnectionTrait>(
        &self,
        conn: &C,
        subject_id: SubjectId,
    ) -> PersonaResult<BTreeMap<Field, FieldMetadata>> {
        let select = Query::select()
            .from(PersonaFieldMetadata::Table)
            .columns([
                PersonaFieldMetadata::FieldName,
                PersonaFieldMetadata::LastModifiedAt,
                PersonaFieldMetadata::LastModifiedBy,
            ])
            .and_where(
                Expr::col(PersonaFieldMetadata::SubjectId)
                    .eq(id_value(self.backend, subject_id.0)),
            )
            .to_owned();
        let mut metadata = BTreeMap::new();
        for row in query_all(conn, &select).await? {
            let field_name: String = row.try_get("", &col_name(PersonaFieldMetadata::FieldName))?;
            metadata.insert(Field::from_str(&field_name)?, read_metadata(&row)?);
        }
        Ok(metadata)
    }

    async fn save_state(
        &self,
        tx: &DatabaseTransaction,
        person: &VersionedPerson,
        now: Timestamp,
    ) -> PersonaResult<()> {
        let state_json = serde_json::to_string(person.state())?;
        let upsert = Query::insert()
            .into_table(PersonaSubjects::Table)
            .columns([
                PersonaSubjects::SubjectId,
                PersonaSubjects::StateJson,
                PersonaSubjects::CreatedAt,
                PersonaSubjects::UpdatedAt,
            ])
            .values_panic([
                id_value(self.backend, person.subject_id().0).into(),
                state_json.into(),
                person.created_at().as_micros().into(),
                now.as_micros().into(),
            ])
            .on_conflict(
                OnConflict::column(PersonaSubjects::SubjectId)
                    .update_columns([PersonaSubjects::StateJson, PersonaSubjects::UpdatedAt])
                    .to_owned(),
            )
            .to_owned();
        exec(tx, &upsert).await?;
        Ok(())
    }

    /// Writes created, closed and re-owned entries and removes discarded ones.
    async fn save_entries(
        &self,
        tx: &DatabaseTransaction,
        person: &mut VersionedPerson,
    ) -> PersonaResult<()> {
        let pending = person.take_pending();
        for entry_id in &pending.discarded {
            let delete = Query::delete()
                .from_table(PersonaHistoryEntries::Table)
                .and_where(
                    Expr::col(PersonaHistoryEntries::EntryId).eq(id_value(self.backend, entry_id.0)),
                )
                .to_owned();
            exec(tx, &delete).await?;
        }
        for entry_id in &pending.touched {
            let Some(entry) = person.entry(*entry_id) else {
                continue;
            };
            self.upsert_entry(tx, entry).await?;
        }
        debug!(
            "subject {}: {} entries written, {} discarded",
            person.subject_id(),
            pending.touched.len(),
            pending.discarded.len()
        );
        Ok(())
    }

    async fn upsert_entry(
        &self,
        tx: &DatabaseTransaction,
        entry: &HistoryEntry,
    ) -> PersonaResult<()> {
        let value_json = entry
            .value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let upsert = Query::insert()
            .into_table(PersonaHistoryEntries::Table)
            .columns(ENTRY_COLUMNS)
            .values_panic([
                id_value(self.backend, entry.entry_id.0).into(),
                id_value(self.backend, entry.subject_id.0).into(),
                entry.field.as_str().into(),
                value_json.into(),
                entry.applies_from.as_micros().into(),
                entry.applies_to.map(Timestamp::as_micros).into(),
                entry.created_at.as_micros().into(),
                id_value(self.backend, entry.created_by.0).into(),
                entry.source.as_i16().into(),
                entry.migrated_at.map(Timestamp::as_micros).into(),
                entry.merged_at.map(Timestamp::as_micros).into(),
                opt_id_value(self.backend, entry.merged_from.map(|id| id.0)).into(),
                entry.anomalous.into(),
            ])
            .on_conflict(
                OnConflict::column(PersonaHistoryEntries::EntryId)
                    .update_columns([
                        PersonaHistoryEntries::SubjectId,
                        PersonaHistoryEntries::AppliesTo,
                        PersonaHistoryEntries::Anomalous,
                        PersonaHistoryEntries::MergedAt,
                        PersonaHistoryEntries::MergedFrom,
                    ])
                    .to_owned(),
            )
            .to_owned();
        exec(tx, &upsert).await?;
        Ok(())
    }

    async fn save_metadata(
        &self,
        tx: &DatabaseTransaction,
        person: &VersionedPerson,
    ) -> PersonaResult<()> {
        for (field, metadata) in person.all_metadata() {
            let upsert = Query::insert()
                .into_table(PersonaFieldMetadata::Table)
                .columns([
                    PersonaFieldMetadata::SubjectId,
                    PersonaFieldMetadata::FieldName,
                    PersonaFieldMetadata::LastModifiedAt,
                    PersonaFieldMetadata::LastModifiedBy,
                ])
                .values_panic([
                    id_value(self.backend, person.subject_id().0).into(),
                    field.as_str().into(),
                    metadata.last_modified_at.as_micros().into(),
                    id_value(self.backend, metadata.last_modified_by.0).into(),
                ])
                .on_conflict(
                    OnConflict::columns([
                        PersonaFieldMetadata::SubjectId,
                        PersonaFieldMetadata::FieldName,
                    ])
                    .update_columns([
                        PersonaFieldMetadata::LastModifiedAt,
                        PersonaFieldMetadata::LastModifiedBy,
                    ])
                    .to_owned(),
                )
                .to_owned();
            exec(tx, &upsert).await?;
        }
        Ok(())
    }

    async fn save_person(
        &self,
        tx: &DatabaseTransaction,
        person: &mut VersionedPerson,
        now: Timestamp,
    ) -> PersonaResult<()> {
        self.save_state(tx, person, now).await?;
        self.save_entries(tx, person).await?;
        self.maybe_failpoint("after_entries_saved")?;
        self.save_metadata(tx, person).await
    }

    /// Deletes the subject row, its metadata and any entries it still owns.
    async fn delete_subject_rows(
        &self,
        tx: &DatabaseTransaction,
        subject_id: SubjectId,
    ) -> PersonaResult<bool> {
        let subject = id_value(self.backend, subject_id.0);
        let delete_metadata = Query::delete()
            .from_table(PersonaFieldMetadata::Table)
            .and_where(Expr::col(PersonaFieldMetadata::SubjectId).eq(subject.clone()))
            .to_owned();
        exec(tx, &delete_metadata).await?;
        let delete_entries = Query::delete()
            .from_table(PersonaHistoryEntries::Table)
            .and_where(Expr::col(PersonaHistoryEntries::SubjectId).eq(subject.clone()))
            .to_owned();
        exec(tx, &delete_entries).await?;
        let delete_subject = Query::delete()
            .from_table(PersonaSubjects::Table)
            .and_where(Expr::col(PersonaSubjects::SubjectId).eq(subject))
            .to_owned();
        Ok(exec(tx, &delete_subject).await? > 0)
    }
}

#[async_trait]
impl PersonWriteApi for PersonaStore {
    async fn edit_person(&self, input: EditPersonInput) -> PersonaResult<ChangedFields> {
        input.patch.validate()?;
        self.check_list_limits(&input.patch)?;
        let tx = self.conn.begin().await?;
        let created_at = input.recorded_at.unwrap_or_else(Timestamp::now);
        let mut person = self.lock_or_create(&tx, input.subject_id, created_at).await?;
        // Read the clock under the subject lock so defaulted stamps follow commit order.
        let recorded_at = input.recorded_at.unwrap_or_else(Timestamp::now);
        let changed = person.apply_edit(&input.patch, input.actor, recorded_at)?;
        self.save_person(&tx, &mut person, recorded_at).await?;
        tx.commit().await?;

        debug!("edit of subject {} changed {changed:?}", input.subject_id);
        self.notify(input.subject_id, &changed, Source::Internal, recorded_at)
            .await;
        Ok(changed)
    }

    async fn purge_subject(&self, subject_id: SubjectId) -> PersonaResult<bool> {
        let tx = self.conn.begin().await?;
        self.lock_subject(&tx, subject_id).await?;
        let existed = self.delete_subject_rows(&tx, subject_id).await?;
        tx.commit().await?;
        if existed {
            info!("purged subject {subject_id}");
        }
        Ok(existed)
    }
}

#[async_trait]
impl PersonSyncApi for PersonaStore {
    async fn apply_sync(&self, update: SyncUpdate) -> PersonaResult<SyncReport> {
        update.values.validate()?;
        self.check_list_limits(&update.values)?;
        let subject_id = update.subject_id;
        let now = Timestamp::now();

        let tx = self.conn.begin().await?;
        if update.latest_booking {
            let mut person = self.lock_or_create(&tx, subject_id, now).await?;
            let changed = apply_latest_booking(&mut person, &update)?;
            self.save_person(&tx, &mut person, now).await?;
            tx.commit().await?;
            self.notify(subject_id, &changed, Source::External, update.recorded_at)
                .await;
            return Ok(SyncReport {
                changed,
                inserted: Vec::new(),
            });
        }

        // Historical bookings never read the open entry, so no lock; live
        // state and metadata stay untouched.
        if !self.subject_exists(&tx, subject_id).await? {
            self.create_subject(&tx, subject_id, now).await?;
        }
        let mut person = VersionedPerson::new(subject_id, now);
        let inserted = insert_historical_booking(&mut person, &update)?;
        self.save_entries(&tx, &mut person).await?;
        self.maybe_failpoint("after_entries_saved")?;
        tx.commit().await?;
        debug!(
            "historical booking for subject {subject_id}: {} entries",
            inserted.len()
        );
        Ok(SyncReport {
            changed: ChangedFields::new(),
            inserted,
        })
    }
}

#[async_trait]
impl PersonMigrationApi for PersonaStore {
    async fn migrate_timeline(
        &self,
        input: MigrateTimelineInput,
    ) -> PersonaResult<MigrationReport> {
        let subject_id = input.subject_id;
        if input.records.is_empty() {
            return Ok(MigrationReport {
                subject_id,
                migrated_at: None,
                created: Vec::new(),
                discarded: 0,
                changed: ChangedFields::new(),
            });
        }
        if input.records.len() > self.limits.max_migration_records {
            return Err(PersonaError::validation(format!(
                "migration for subject {subject_id} carries {} records, limit is {}",
                input.records.len(),
                self.limits.max_migration_records
            )));
        }
        validate_records(&input.records)?;
        for record in &input.records {
            self.check_list_limits(&record.values)?;
        }
        let migrated_at = Timestamp::now();

        let tx = self.conn.begin().await?;
        let mut person = self.lock_or_create(&tx, subject_id, migrated_at).await?;
        let outcome = migrate_timeline(&mut person, &input.records, input.actor, migrated_at)?;
        self.save_person(&tx, &mut person, migrated_at).await?;
        tx.commit().await?;

        info!(
            "migrated subject {subject_id}: {} entries created, {} discarded",
            outcome.created.len(),
            outcome.discarded
        );
        self.notify(subject_id, &outcome.changed, Source::External, migrated_at)
            .await;
        Ok(MigrationReport {
            subject_id,
            migrated_at: Some(migrated_at),
            created: outcome.created,
            discarded: outcome.discarded,
            changed: outcome.changed,
        })
    }
}

#[async_trait]
impl PersonMergeApi for PersonaStore {
    async fn merge_subjects(&self, input: MergeSubjectsInput) -> PersonaResult<MergeReport> {
        let MergeSubjectsInput { from, to } = input;
        if from == to {
            return Err(PersonaError::validation(format!(
                "cannot merge subject {to} into itself"
            )));
        }
        let merged_at = Timestamp::now();
        let unchanged = MergeReport {
            from,
            to,
            merged: false,
            reowned: 0,
            changed: ChangedFields::new(),
        };

        let tx = self.conn.begin().await?;
        let mut lock_order = [from, to];
        lock_order.sort();
        let mut from_exists = false;
        for subject_id in lock_order {
            let locked = self.lock_subject(&tx, subject_id).await?;
            if subject_id == from {
                from_exists = locked;
            }
        }
        if !from_exists {
            debug!("merge source {from} does not exist; nothing to merge");
            return Ok(unchanged);
        }
        let Some(source) = self.load_person(&tx, from).await? else {
            return Ok(unchanged);
        };
        let target = self.load_person(&tx, to).await?;

        let outcome = merge_subjects(source, to, target, merged_at)?;
        if !outcome.merged {
            return Ok(unchanged);
        }
        let mut target = outcome.target;
        self.save_person(&tx, &mut target, merged_at).await?;
        self.maybe_failpoint("after_merge_reowned")?;
        self.delete_subject_rows(&tx, from).await?;
        tx.commit().await?;

        self.notify(to, &outcome.changed, Source::External, merged_at)
            .await;
        Ok(MergeReport {
            from,
            to,
            merged: true,
            reowned: outcome.reowned,
            changed: outcome.changed,
        })
    }
}

#[async_trait]
impl PersonReadApi for PersonaStore {
    async fn read_person(&self, subject_id: SubjectId) -> PersonaResult<PersonView> {
        let person = self
            .load_person(&self.conn, subject_id)
            .await?
            .ok_or_else(|| PersonaError::not_found(format!("subject {subject_id}")))?;
        Ok(PersonView {
            subject_id,
            created_at: person.created_at(),
            state: person.state().clone(),
            metadata: person.all_metadata().clone(),
        })
    }

    async fn field_history(
        &self,
        subject_id: SubjectId,
        field: Field,
    ) -> PersonaResult<Vec<HistoryEntry>> {
        let mut entries = self.load_entries(&self.conn, subject_id, Some(field)).await?;
        entries.sort_by(entry_order);
        Ok(entries)
    }

    async fn field_metadata(
        &self,
        subject_id: SubjectId,
        field: Field,
    ) -> PersonaResult<Option<FieldMetadata>> {
        let select = Query::select()
            .from(PersonaFieldMetadata::Table)
            .columns([
                PersonaFieldMetadata::LastModifiedAt,
                PersonaFieldMetadata::LastModifiedBy,
            ])
            .and_where(
                Expr::col(PersonaFieldMetadata::SubjectId)
                    .eq(id_value(self.backend, subject_id.0)),
            )
            .and_where(Expr::col(PersonaFieldMetadata::FieldName).eq(field.as_str()))
            .limit(1)
            .to_owned();
        query_one(&self.conn, &select)
            .await?
            .map(|row| read_metadata(&row))
            .transpose()
    }

    async fn value_at(&self, input: ValueAtInput) -> PersonaResult<Option<FieldValue>> {
        let Some(person) = self.load_person(&self.conn, input.subject_id).await? else {
            return Ok(None);
        };
        Ok(person
            .value_at(input.field, input.valid_at, input.known_at)
            .and_then(|entry| entry.value.clone()))
    }

    async fn list_anomalies(&self, subject_id: SubjectId) -> PersonaResult<Vec<HistoryEntry>> {
        let select = Query::select()
            .from(PersonaHistoryEntries::Table)
            .columns(ENTRY_COLUMNS)
            .and_where(
                Expr::col(PersonaHistoryEntries::SubjectId)
                    .eq(id_value(self.backend, subject_id.0)),
            )
            .and_where(Expr::col(PersonaHistoryEntries::Anomalous).eq(true))
            .to_owned();
        let mut entries = query_all(&self.conn, &select)
            .await?
            .iter()
            .map(read_entry)
            .collect::<PersonaResult<Vec<_>>>()?;
        entries.sort_by(|left, right| {
            left.field
                .cmp(&right.field)
                .then_with(|| entry_order(left, right))
        });
        Ok(entries)
    }
}

fn read_entry(row: &QueryResult) -> PersonaResult<HistoryEntry> {
    let field_name: String = row.try_get("", &col_name(PersonaHistoryEntries::FieldName))?;
    let value_json: Option<String> = row.try_get("", &col_name(PersonaHistoryEntries::ValueJson))?;
    let source_raw: i16 = row.try_get("", &col_name(PersonaHistoryEntries::Source))?;
    let applies_from: i64 = row.try_get("", &col_name(PersonaHistoryEntries::AppliesFrom))?;
    let applies_to: Option<i64> = row.try_get("", &col_name(PersonaHistoryEntries::AppliesTo))?;
    let created_at: i64 = row.try_get("", &col_name(PersonaHistoryEntries::CreatedAt))?;
    let migrated_at: Option<i64> = row.try_get("", &col_name(PersonaHistoryEntries::MigratedAt))?;
    let merged_at: Option<i64> = row.try_get("", &col_name(PersonaHistoryEntries::MergedAt))?;
    let anomalous: bool = row.try_get("", &col_name(PersonaHistoryEntries::Anomalous))?;

    let value = value_json
        .map(|raw| serde_json::from_str::<FieldValue>(&raw))
        .transpose()?;
    let source = Source::from_i16(source_raw)
        .ok_or_else(|| PersonaError::storage(format!("unknown entry source {source_raw}")))?;
    Ok(HistoryEntry {
        entry_id: EntryId(read_id(row, PersonaHistoryEntries::EntryId)?),
        subject_id: SubjectId(read_id(row, PersonaHistoryEntries::SubjectId)?),
        field: Field::from_str(&field_name)?,
        value,
        applies_from: Timestamp(applies_from),
        applies_to: applies_to.map(Timestamp),
        created_at: Timestamp(created_at),
        created_by: ActorId(read_id(row, PersonaHistoryEntries::CreatedBy)?),
        source,
        migrated_at: migrated_at.map(Timestamp),
        merged_at: merged_at.map(Timestamp),
        merged_from: read_opt_id(row, PersonaHistoryEntries::MergedFrom)?.map(SubjectId),
        anomalous,
    })
}

fn read_metadata(row: &QueryResult) -> PersonaResult<FieldMetadata> {
    let last_modified_at: i64 = row.try_get("", &col_name(PersonaFieldMetadata::LastModifiedAt))?;
    Ok(FieldMetadata {
        last_modified_at: Timestamp(last_modified_at),
        last_modified_by: ActorId(read_id(
            row,
            PersonaFieldMetadata::LastModifiedBy,
        )?),
    })
}

fn id_value(backend: DatabaseBackend, id: Id) -> SeaValue {
    match backend {
        DatabaseBackend::Postgres => SeaValue::Uuid(Some(Uuid::from_bytes(id.as_bytes()))),
        DatabaseBackend::MySql => SeaValue::Bytes(Some(id.as_vec())),
        _ => SeaValue::String(Some(id.to_uuid_string())),
    }
}

fn opt_id_value(backend: DatabaseBackend, id: Option<Id>) -> SeaValue {
    match (id, backend) {
        (Some(id), _) => id_value(backend, id),
        (None, DatabaseBackend::Postgres) => SeaValue::Uuid(None),
        (None, DatabaseBackend::MySql) => SeaValue::Bytes(None),
        (None, _) => SeaValue::String(None),
    }
}

fn bytes_to_id(bytes: Vec<u8>) -> Option<Id> {
    let bytes: [u8; 16] = bytes.try_into().ok()?;
    Some(Id::from_bytes(bytes))
}

fn read_id(row: &QueryResult, column: impl sea_query::Iden) -> PersonaResult<Id> {
    let name = col_name(column);
    if let Ok(value) = row.try_get::<String>("", &name) {
        return Id::from_uuid_str(&value);
    }
    if let Ok(value) = row.try_get::<Uuid>("", &name) {
        return Ok(Id::from_bytes(*value.as_bytes()));
    }
    if let Ok(value) = row.try_get::<Vec<u8>>("", &name) {
        return bytes_to_id(value).ok_or_else(|| PersonaError::storage("invalid id length"));
    }
    Err(PersonaError::storage(format!("unsupported id format in {name}")))
}

fn read_opt_id(row: &QueryResult, column: impl sea_query::Iden) -> PersonaResult<Option<Id>> {
    let name = col_name(column);
    if let Ok(value) = row.try_get::<Option<String>>("", &name) {
        return value.map(|value| Id::from_uuid_str(&value)).transpose();
    }
    if let Ok(value) = row.try_get::<Option<Uuid>>("", &name) {
        return Ok(value.map(|value| Id::from_bytes(*value.as_bytes())));
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>>("", &name) {
        return Ok(value.and_then(bytes_to_id));
    }
    Ok(None)
}

fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

/// Runs a statement and returns the number of affected rows.
async fn exec<C, S>(conn: &C, stmt: &S) -> PersonaResult<u64>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let result = conn
        .execute_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(result.rows_affected())
}

async fn query_all<C, S>(conn: &C, stmt: &S) -> PersonaResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let rows = conn
        .query_all_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

async fn query_one<C, S>(conn: &C, stmt: &S) -> PersonaResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let row = conn
        .query_one_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(row)
}

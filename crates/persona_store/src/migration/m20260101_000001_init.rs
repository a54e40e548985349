use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

use crate::db::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();

        manager
            .create_table(
                Table::create()
                    .table(PersonaSubjects::Table)
                    .if_not_exists()
                    .col(id_col(backend, PersonaSubjects::SubjectId, false))
                    .col(ColumnDef::new(PersonaSubjects::StateJson).text().not_null())
                    .col(
                        ColumnDef::new(PersonaSubjects::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PersonaSubjects::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PersonaSubjects::LockVersion)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_persona_subjects")
                            .col(PersonaSubjects::SubjectId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PersonaHistoryEntries::Table)
                    .if_not_exists()
                    .col(id_col(backend, PersonaHistoryEntries::EntryId, false))
                    .col(id_col(backend, PersonaHistoryEntries::SubjectId, false))
                    .col(
                        ColumnDef::new(PersonaHistoryEntries::FieldName)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(ColumnDef::new(PersonaHistoryEntries::ValueJson).text())
                    .col(
                        ColumnDef::new(PersonaHistoryEntries::AppliesFrom)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(PersonaHistoryEntries::AppliesTo).big_integer())
                    .col(
                        ColumnDef::new(PersonaHistoryEntries::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(id_col(backend, PersonaHistoryEntries::CreatedBy, false))
                    .col(
                        ColumnDef::new(PersonaHistoryEntries::Source)
                            .small_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(PersonaHistoryEntries::MigratedAt).big_integer())
                    .col(ColumnDef::new(PersonaHistoryEntries::MergedAt).big_integer())
                    .col(id_col(backend, PersonaHistoryEntries::MergedFrom, true))
                    .col(
                        ColumnDef::new(PersonaHistoryEntries::Anomalous)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_persona_history_entries")
                            .col(PersonaHistoryEntries::EntryId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PersonaFieldMetadata::Table)
                    .if_not_exists()
                    .col(id_col(backend, PersonaFieldMetadata::SubjectId, false))
                    .col(
                        ColumnDef::new(PersonaFieldMetadata::FieldName)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PersonaFieldMetadata::LastModifiedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(id_col(backend, PersonaFieldMetadata::LastModifiedBy, false))
                    .primary_key(
                        Index::create()
                            .name("pk_persona_field_metadata")
                            .col(PersonaFieldMetadata::SubjectId)
                            .col(PersonaFieldMetadata::FieldName),
                    )
                    .to_owned(),
            )
            .await?;

        create_indexes(manager).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(PersonaFieldMetadata::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(PersonaHistoryEntries::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(PersonaSubjects::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}

async fn create_indexes(manager: &SchemaManager<'_>) -> Result<(), DbErr> {
    manager
        .create_index(
            Index::create()
                .name("persona_history_subject_field_idx")
                .table(PersonaHistoryEntries::Table)
                .col(PersonaHistoryEntries::SubjectId)
                .col(PersonaHistoryEntries::FieldName)
                .if_not_exists()
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("persona_history_subject_anomalous_idx")
                .table(PersonaHistoryEntries::Table)
                .col(PersonaHistoryEntries::SubjectId)
                .col(PersonaHistoryEntries::Anomalous)
                .if_not_exists()
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("persona_history_merged_from_idx")
                .table(PersonaHistoryEntries::Table)
                .col(PersonaHistoryEntries::MergedFrom)
                .if_not_exists()
                .to_owned(),
        )
        .await?;
    Ok(())
}

fn id_col(backend: DatabaseBackend, col: impl Iden, nullable: bool) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    match backend {
        DatabaseBackend::Postgres => {
            col_def.uuid();
        }
        DatabaseBackend::MySql => {
            col_def.binary_len(16);
        }
        _ => {
            col_def.string_len(36);
        }
    }
    if nullable {
        col_def.null();
    } else {
        col_def.not_null();
    }
    col_def
}

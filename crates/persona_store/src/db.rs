use sea_orm::sea_query;
use sea_orm_migration::prelude::Iden;

#[derive(Iden, Clone, Copy)]
pub enum PersonaSubjects {
    Table,
    SubjectId,
    StateJson,
    CreatedAt,
    UpdatedAt,
    LockVersion,
}

#[derive(Iden, Clone, Copy)]
pub enum PersonaHistoryEntries {
    Table,
    EntryId,
    SubjectId,
    FieldName,
    ValueJson,
    AppliesFrom,
    AppliesTo,
    CreatedAt,
    CreatedBy,
    Source,
    MigratedAt,
    MergedAt,
    MergedFrom,
    Anomalous,
}

#[derive(Iden, Clone, Copy)]
pub enum PersonaFieldMetadata {
    Table,
    SubjectId,
    FieldName,
    LastModifiedAt,
    LastModifiedBy,
}

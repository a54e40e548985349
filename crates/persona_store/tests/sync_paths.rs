use std::collections::BTreeMap;
use std::sync::Arc;

use persona_store::{
    ActorId, Field, FieldChangeMeta, FieldValue, PersonPatch, PersonReadApi, PersonSyncApi,
    PersonaConfig, PersonaError, PersonaResult, PersonaStore, Presence, Source, StaticIdentities,
    SubjectId, SyncUpdate, Timestamp,
};
use tempfile::{TempDir, tempdir};

async fn open(dir: &TempDir) -> PersonaResult<PersonaStore> {
    let base = dir.path();
    let config = PersonaConfig::default_sqlite(base.join("persona.sqlite").to_string_lossy());
    PersonaStore::connect(&config, base).await
}

fn dependants(
    subject_id: SubjectId,
    count: i64,
    latest: bool,
    from: i64,
    to: Option<i64>,
) -> SyncUpdate {
    SyncUpdate {
        subject_id,
        latest_booking: latest,
        applies_from: Timestamp(from),
        applies_to: to.map(Timestamp),
        recorded_at: Timestamp(10_000),
        actor: ActorId::new(),
        values: PersonPatch {
            dependants: Presence::value(count),
            ..PersonPatch::default()
        },
        modified: BTreeMap::new(),
    }
}

#[tokio::test]
async fn latest_booking_updates_current_state() -> PersonaResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(&dir).await?;
    let subject = SubjectId::new();

    let report = store
        .apply_sync(dependants(subject, 1, true, 1_000, None))
        .await?;
    assert!(report.changed.contains(&Field::Dependants));
    assert!(report.inserted.is_empty());

    let report = store
        .apply_sync(dependants(subject, 2, true, 5_000, None))
        .await?;
    assert!(report.changed.contains(&Field::Dependants));

    let view = store.read_person(subject).await?;
    assert_eq!(view.state.dependants, Some(2));
    let history = store.field_history(subject, Field::Dependants).await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].applies_to, Some(Timestamp(5_000)));
    assert!(history.iter().all(|entry| entry.source == Source::External));
    Ok(())
}

#[tokio::test]
async fn backdated_correction_before_open_start_closes_at_record_time() -> PersonaResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(&dir).await?;
    let subject = SubjectId::new();
    store
        .apply_sync(dependants(subject, 1, true, 5_000, None))
        .await?;

    let mut correction = dependants(subject, 3, true, 2_000, None);
    correction.recorded_at = Timestamp(9_000);
    store.apply_sync(correction).await?;

    let history = store.field_history(subject, Field::Dependants).await?;
    assert_eq!(history[0].applies_from, Timestamp(5_000));
    assert_eq!(history[0].applies_to, Some(Timestamp(9_000)));
    assert!(history[1].is_open());
    Ok(())
}

#[tokio::test]
async fn correction_before_everything_flags_the_prior_entry() -> PersonaResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(&dir).await?;
    let subject = SubjectId::new();
    store
        .apply_sync(dependants(subject, 1, true, 5_000, None))
        .await?;

    let mut correction = dependants(subject, 3, true, 1_000, None);
    correction.recorded_at = Timestamp(2_000);
    store.apply_sync(correction).await?;

    let anomalies = store.list_anomalies(subject).await?;
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].applies_from, Timestamp(5_000));
    assert_eq!(anomalies[0].applies_to, None);
    let view = store.read_person(subject).await?;
    assert_eq!(view.state.dependants, Some(3));
    Ok(())
}

#[tokio::test]
async fn historical_booking_leaves_the_present_alone() -> PersonaResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(&dir).await?;
    let subject = SubjectId::new();
    store
        .apply_sync(dependants(subject, 2, true, 5_000, None))
        .await?;
    let before = store.field_metadata(subject, Field::Dependants).await?;

    let mut past = dependants(subject, 0, false, 1_000, Some(3_000));
    let clerk = ActorId::new();
    past.modified.insert(
        Field::Dependants,
        FieldChangeMeta {
            modified_at: Timestamp(3_500),
            modified_by: clerk,
        },
    );
    let report = store.apply_sync(past).await?;
    assert_eq!(report.inserted.len(), 1);
    assert!(report.changed.is_empty());

    let view = store.read_person(subject).await?;
    assert_eq!(view.state.dependants, Some(2));
    assert_eq!(store.field_metadata(subject, Field::Dependants).await?, before);

    let history = store.field_history(subject, Field::Dependants).await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].value, Some(FieldValue::Integer(0)));
    assert_eq!(history[0].created_at, Timestamp(3_500));
    assert_eq!(history[0].created_by, clerk);
    assert!(history[1].is_open());
    Ok(())
}

#[tokio::test]
async fn contradictory_historical_bounds_fail_without_writing() -> PersonaResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(&dir).await?;
    let subject = SubjectId::new();
    let err = store
        .apply_sync(dependants(subject, 1, false, 3_000, Some(1_000)))
        .await
        .unwrap_err();
    assert!(matches!(err, PersonaError::InvalidInterval { .. }));
    assert!(!err.is_retryable());
    assert!(store.field_history(subject, Field::Dependants).await?.is_empty());
    assert!(store.read_person(subject).await.is_err());
    Ok(())
}

#[tokio::test]
async fn historical_creation_checks_identity() -> PersonaResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(&dir)
        .await?
        .with_identity_validator(Arc::new(StaticIdentities::default()));
    let err = store
        .apply_sync(dependants(SubjectId::new(), 1, false, 1_000, Some(2_000)))
        .await
        .unwrap_err();
    assert!(matches!(err, PersonaError::IdentityNotFound { .. }));
    Ok(())
}

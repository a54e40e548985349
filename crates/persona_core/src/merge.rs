//! Unification of two subjects' timelines.
//!
//! Every entry of the source subject is re-owned by the target and stamped
//! with merge provenance. Per field, the greater of the two latest entries
//! (by [`entry_order`]) supplies the target's live value; the other one is
//! closed at the merge time.

use std::cmp::Ordering;

use log::{debug, info, warn};

use crate::entry::{CloseOutcome, entry_order};
use crate::{
    ChangedFields, Field, FieldMetadata, HistoryEntry, PersonaError, PersonaResult, SubjectId,
    Timestamp, VersionedPerson,
};

#[derive(Clone, Debug)]
pub struct MergeOutcome {
    /// The target aggregate after the merge.
    pub target: VersionedPerson,
    /// Whether anything happened; `false` when the source had no history.
    pub merged: bool,
    pub reowned: usize,
    pub changed: ChangedFields,
}

/// Merges `from` into the subject `to`. A missing target aggregate is created
/// empty first. The caller deletes `from` afterwards when `merged` is set.
pub fn merge_subjects(
    mut from: VersionedPerson,
    to: SubjectId,
    target: Option<VersionedPerson>,
    merged_at: Timestamp,
) -> PersonaResult<MergeOutcome> {
    let from_id = from.subject_id();
    if from_id == to {
        return Err(PersonaError::validation(format!(
            "cannot merge subject {to} into itself"
        )));
    }
    let mut target = target.unwrap_or_else(|| VersionedPerson::new(to, merged_at));
    if target.subject_id() != to {
        return Err(PersonaError::validation(format!(
            "target aggregate belongs to {} not {to}",
            target.subject_id()
        )));
    }
    if from.entries().is_empty() {
        debug!("subject {from_id} has no history; merge into {to} is a no-op");
        return Ok(MergeOutcome {
            target,
            merged: false,
            reowned: 0,
            changed: ChangedFields::new(),
        });
    }

    let latest_from = Field::ALL
        .into_iter()
        .filter_map(|field| from.latest_entry(field).map(|entry| (field, entry.clone())))
        .collect::<Vec<_>>();
    let latest_to = Field::ALL
        .into_iter()
        .filter_map(|field| target.latest_entry(field).map(|entry| (field, entry.clone())))
        .collect::<Vec<_>>();
    let from_metadata = from.all_metadata().clone();

    let moved = from.take_entries();
    let reowned = moved.len();
    for mut entry in moved {
        entry.subject_id = to;
        entry.merged_at = Some(merged_at);
        entry.merged_from = Some(from_id);
        target.push_entry(entry);
    }

    let mut changed = ChangedFields::new();
    for (field, source_latest) in latest_from {
        let before = target.value(field);
        let target_latest = latest_to
            .iter()
            .find(|(candidate, _)| *candidate == field)
            .map(|(_, entry)| entry);
        let adopt = match target_latest {
            None => true,
            Some(target_latest) => {
                let (winner_is_source, loser) =
                    match entry_order(&source_latest, target_latest) {
                        Ordering::Greater => (true, target_latest),
                        _ => (false, &source_latest),
                    };
                close_loser(&mut target, loser, merged_at);
                winner_is_source
            }
        };
        if adopt {
            target.set_value(field, source_latest.value.clone())?;
            let metadata = from_metadata.get(&field).copied().unwrap_or(FieldMetadata {
                last_modified_at: source_latest.created_at,
                last_modified_by: source_latest.created_by,
            });
            target.set_metadata(field, metadata);
        }
        if target.value(field) != before {
            changed.insert(field);
        }
    }

    info!("merged subject {from_id} into {to}: {reowned} entries re-owned");
    Ok(MergeOutcome {
        target,
        merged: true,
        reowned,
        changed,
    })
}

fn close_loser(target: &mut VersionedPerson, loser: &HistoryEntry, merged_at: Timestamp) {
    if !loser.is_open() {
        return;
    }
    let Some(entry) = target.entry_mut(loser.entry_id) else {
        return;
    };
    if entry.close_at(merged_at) == CloseOutcome::FlaggedAnomalous {
        warn!(
            "merge loser {} ({}) starts after merge time {merged_at}; flagged anomalous",
            entry.entry_id,
            entry.field
        );
    }
}

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{ActorId, EntryId, Field, FieldValue, SubjectId, Timestamp};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Source {
    Internal = 1,
    External = 2,
}

impl Source {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Source::Internal),
            2 => Some(Source::External),
            _ => None,
        }
    }
}

/// One recorded value of one field, with its validity interval and
/// provenance. Only `applies_to`/`anomalous` change after creation (when the
/// entry is closed), plus the ownership columns when a merge re-owns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub entry_id: EntryId,
    pub subject_id: SubjectId,
    pub field: Field,
    pub value: Option<FieldValue>,
    pub applies_from: Timestamp,
    pub applies_to: Option<Timestamp>,
    pub created_at: Timestamp,
    pub created_by: ActorId,
    pub source: Source,
    pub migrated_at: Option<Timestamp>,
    pub merged_at: Option<Timestamp>,
    pub merged_from: Option<SubjectId>,
    pub anomalous: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseOutcome {
    Closed,
    FlaggedAnomalous,
}

impl HistoryEntry {
    /// Still current: no end bound and not flagged.
    pub fn is_open(&self) -> bool {
        self.applies_to.is_none() && !self.anomalous
    }

    /// Ends the validity interval at `at`. When that would put the end before
    /// the start the entry is flagged anomalous instead and keeps no end.
    pub fn close_at(&mut self, at: Timestamp) -> CloseOutcome {
        if self.applies_from > at {
            self.anomalous = true;
            self.applies_to = None;
            CloseOutcome::FlaggedAnomalous
        } else {
            self.applies_to = Some(at);
            CloseOutcome::Closed
        }
    }

    /// Whether the entry held at valid time `at`. Anomalous entries have no
    /// trustworthy interval and never match.
    pub fn is_valid_at(&self, at: Timestamp) -> bool {
        !self.anomalous
            && self.applies_from <= at
            && self.applies_to.is_none_or(|end| at < end)
    }

    pub fn interval_is_consistent(&self) -> bool {
        self.anomalous || self.applies_to.is_none_or(|end| self.applies_from <= end)
    }
}

/// Primary ordering key: the closing bound, with an open end treated as
/// +infinity and an anomalous entry placed at its start.
fn closing_bound(entry: &HistoryEntry) -> i64 {
    if entry.anomalous {
        entry.applies_from.as_micros()
    } else {
        entry.applies_to.map_or(i64::MAX, Timestamp::as_micros)
    }
}

/// Total order over the entries of one field, oldest-closed first. The
/// greatest entry is the field's latest.
///
/// Keys: closing bound, then `created_at`, then `applies_from`, then entry id.
pub fn entry_order(left: &HistoryEntry, right: &HistoryEntry) -> Ordering {
    closing_bound(left)
        .cmp(&closing_bound(right))
        .then_with(|| left.created_at.cmp(&right.created_at))
        .then_with(|| left.applies_from.cmp(&right.applies_from))
        .then_with(|| left.entry_id.cmp(&right.entry_id))
}

/// Who changed a field last, and when. Never historized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub last_modified_at: Timestamp,
    pub last_modified_by: ActorId,
}


#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::fixtures::entry;
    use super::{CloseOutcome, entry_order};
    use crate::Timestamp;

    #[test]
    fn open_entries_sort_after_closed_ones() {
        let closed = entry(0, Some(100), 50);
        let open = entry(10, None, 5);
        assert_eq!(entry_order(&closed, &open), Ordering::Less);
    }

    #[test]
    fn anomalous_entries_sort_by_their_start() {
        let mut anomalous = entry(40, None, 500);
        anomalous.anomalous = true;
        let closed = entry(0, Some(50), 10);
        let earlier = entry(0, Some(30), 10);
        assert_eq!(entry_order(&anomalous, &closed), Ordering::Less);
        assert_eq!(entry_order(&anomalous, &earlier), Ordering::Greater);
    }

    #[test]
    fn ties_break_on_created_then_start_then_id() {
        let a = entry(0, None, 10);
        let b = entry(0, None, 20);
        assert_eq!(entry_order(&a, &b), Ordering::Less);

        let c = entry(5, None, 10);
        assert_eq!(entry_order(&a, &c), Ordering::Less);

        let mut d = a.clone();
        d.entry_id = crate::EntryId::new();
        assert_eq!(entry_order(&a, &d), a.entry_id.cmp(&d.entry_id));
        assert_eq!(entry_order(&a, &a), Ordering::Equal);
    }

    #[test]
    fn closing_before_start_flags_anomaly() {
        let mut prior = entry(500, None, 500);
        assert_eq!(prior.close_at(Timestamp(200)), CloseOutcome::FlaggedAnomalous);
        assert!(prior.anomalous);
        assert_eq!(prior.applies_to, None);
        assert!(prior.interval_is_consistent());

        let mut other = entry(100, None, 100);
        assert_eq!(other.close_at(Timestamp(100)), CloseOutcome::Closed);
        assert_eq!(other.applies_to, Some(Timestamp(100)));
    }

    #[test]
    fn validity_is_half_open() {
        let e = entry(100, Some(200), 0);
        assert!(e.is_valid_at(Timestamp(100)));
        assert!(e.is_valid_at(Timestamp(199)));
        assert!(!e.is_valid_at(Timestamp(200)));
        assert!(!e.is_valid_at(Timestamp(99)));
    }
}

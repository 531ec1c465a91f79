//! Algorithms shared by both record keepers and by the synchronization
//! driver: ID partitioning, purge-safe time, center field diffs and watermark
//! serialization.

use std::collections::BTreeSet;
use std::ops::Range;

use rand::Rng;

use super::center::{LatestCenterChange, PrismsCenter};
use super::change::{ObjectRef, RecordValue};
use super::taxonomy::{CenterChanges, ChangeType, ObjectType};
use crate::error::{RecordError, Result};

/// Size of the ID partition owned by each center.
pub const ID_RANGE: i64 = 1_000_000_000;

/// Upper bound (exclusive) for randomly minted center IDs.
pub const MAX_CENTER_ID: i32 = 1_000_000;

/// The center that allocated `id`.
pub fn center_of(id: i64) -> i32 {
    id.div_euclid(ID_RANGE) as i32
}

/// The IDs reserved for `center_id`.
pub fn id_range(center_id: i32) -> Range<i64> {
    let start = center_id as i64 * ID_RANGE;
    start..start + ID_RANGE
}

/// The IDs of `center_id` still available to new change records.
///
/// Purged change IDs are retired: everything at or below `purged_max`, the
/// highest own change ID ever purged, is left out.
pub fn change_id_range(center_id: i32, purged_max: Option<i64>) -> Range<i64> {
    let range = id_range(center_id);
    let start = purged_max.map_or(range.start, |max| (max + 1).max(range.start));
    start.min(range.end)..range.end
}

/// Lowest ID in the range of `center_id` not present in `used`.
///
/// Fills gaps left by deleted IDs rather than always incrementing.
pub fn lowest_free_id(center_id: i32, used: &BTreeSet<i64>) -> Result<i64> {
    let range = id_range(center_id);
    lowest_free_id_in(center_id, range.clone(), used.range(range).copied())
}

/// Lowest ID in `range` not yielded by `used`, which must be ascending and
/// hold only IDs inside `range`.
pub fn lowest_free_id_in(
    center_id: i32,
    range: Range<i64>,
    used: impl IntoIterator<Item = i64>,
) -> Result<i64> {
    let mut candidate = range.start;
    for id in used {
        if id != candidate {
            break;
        }
        candidate += 1;
    }
    if candidate >= range.end {
        return Err(RecordError::IdSpaceExhausted(center_id));
    }
    Ok(candidate)
}

/// Mint a random center ID, avoiding `taken`.
pub fn random_center_id(taken: &[i32]) -> i32 {
    let mut rng = rand::thread_rng();
    loop {
        let candidate = rng.gen_range(1..MAX_CENTER_ID);
        if !taken.contains(&candidate) {
            return candidate;
        }
    }
}

/// The time before which change records may be purged without risking loss
/// for any peer.
///
/// This is the earliest `last_export` over all live centers, except that a
/// center which has never been exported to, or whose last export is older
/// than its `change_save_time`, does not constrain the result: such a peer
/// needs a full resync anyway.
pub fn purge_safe_time(centers: &[PrismsCenter], now: i64) -> i64 {
    centers
        .iter()
        .filter(|c| !c.deleted)
        .filter_map(|c| {
            let last_export = c.last_export?;
            (last_export >= now - c.change_save_time).then_some(last_export)
        })
        .fold(now, i64::min)
}

/// One user-visible field difference between two snapshots of a center.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub change_type: ChangeType,
    pub previous: Option<RecordValue>,
}

/// Compute the user-visible field changes from `old` to `new`.
///
/// Infrastructure fields (center ID, priority, import/export times) are not
/// reported. Password changes are reported without the previous value.
pub fn diff_center(old: &PrismsCenter, new: &PrismsCenter) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    let mut push = |change_type: ChangeType, previous: Option<RecordValue>| {
        changes.push(FieldChange {
            change_type,
            previous,
        })
    };

    if old.name != new.name {
        push(CenterChanges::NAME, Some(RecordValue::Text(old.name.clone())));
    }
    if old.server_url != new.server_url {
        push(CenterChanges::URL, old.server_url.clone().map(RecordValue::Text));
    }
    if old.server_user != new.server_user {
        push(
            CenterChanges::SERVER_USER,
            old.server_user.clone().map(RecordValue::Text),
        );
    }
    if old.server_password != new.server_password {
        push(CenterChanges::SERVER_PASSWORD, None);
    }
    if old.sync_frequency != new.sync_frequency {
        push(
            CenterChanges::SYNC_FREQUENCY,
            old.sync_frequency.map(RecordValue::Int),
        );
    }
    if old.client_user != new.client_user {
        push(
            CenterChanges::CLIENT_USER,
            old.client_user
                .map(|id| RecordValue::Object(ObjectRef::new(ObjectType::USER, id))),
        );
    }
    if old.change_save_time != new.change_save_time {
        push(
            CenterChanges::CHANGE_SAVE_TIME,
            Some(RecordValue::Int(old.change_save_time)),
        );
    }
    changes
}

/// One step of an edit script turning one list into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp<T> {
    Add(T),
    Remove(T),
}

/// Compute an edit script from `old` to `new`, treating both as sets.
///
/// Removals come first in `old` order, then additions in `new` order.
pub fn ordered_diff<T: PartialEq + Clone>(old: &[T], new: &[T]) -> Vec<DiffOp<T>> {
    let removed = old
        .iter()
        .filter(|item| !new.contains(item))
        .cloned()
        .map(DiffOp::Remove);
    let added = new
        .iter()
        .enumerate()
        .filter(|(i, item)| !old.contains(item) && !new[..*i].contains(item))
        .map(|(_, item)| DiffOp::Add(item.clone()));
    removed.chain(added).collect()
}

/// Serialize a watermark set for transmission to a peer.
pub fn serialize_center_changes(changes: &[LatestCenterChange]) -> Result<String> {
    Ok(serde_json::to_string(changes)?)
}

/// Parse a watermark set received from a peer.
pub fn parse_center_changes(json: &str) -> Result<Vec<LatestCenterChange>> {
    Ok(serde_json::from_str(json)?)
}

/// Look up the watermark for `(center_id, subject_center)` in a set,
/// returning 0 when the pair is absent.
pub fn watermark_for(changes: &[LatestCenterChange], center_id: i32, subject_center: i32) -> i64 {
    changes
        .iter()
        .filter(|c| c.center_id == center_id && c.subject_center == subject_center)
        .map(|c| c.latest_change)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn center(last_export: Option<i64>, save_time: i64) -> PrismsCenter {
        PrismsCenter {
            last_export,
            change_save_time: save_time,
            ..PrismsCenter::new("peer")
        }
    }

    #[test]
    fn test_center_of_recovers_owner() {
        for center_id in [0, 1, 17, 999_999] {
            let range = id_range(center_id);
            assert_eq!(center_of(range.start), center_id);
            assert_eq!(center_of(range.start + 12_345), center_id);
            assert_eq!(center_of(range.end - 1), center_id);
        }
    }

    #[test]
    fn test_lowest_free_id_fills_gaps() {
        let base = id_range(3).start;
        let used: BTreeSet<i64> = [base, base + 1, base + 3, 5, 9_999_999_999]
            .into_iter()
            .collect();
        assert_eq!(lowest_free_id(3, &used).unwrap(), base + 2);
        assert_eq!(lowest_free_id(4, &used).unwrap(), id_range(4).start);
        assert_eq!(lowest_free_id(0, &used).unwrap(), 0);
    }

    #[test]
    fn test_purged_change_ids_are_not_reissued() {
        let base = id_range(3).start;
        let used: BTreeSet<i64> = [base + 1, base + 4].into_iter().collect();
        assert_eq!(change_id_range(3, None), id_range(3));
        let free_above = |purged_max: i64| {
            let range = change_id_range(3, Some(purged_max));
            lowest_free_id_in(3, range.clone(), used.range(range).copied())
        };
        assert_eq!(free_above(base + 2).unwrap(), base + 3);
        assert_eq!(free_above(base + 3).unwrap(), base + 5);
        // A purged ID from another center's range does not move the floor
        assert_eq!(change_id_range(3, Some(7)).start, base);

        let full = change_id_range(3, Some(id_range(3).end - 1));
        assert!(full.is_empty());
        assert!(matches!(
            lowest_free_id_in(3, full, std::iter::empty()),
            Err(RecordError::IdSpaceExhausted(3))
        ));
    }

    #[test]
    fn test_random_center_id_avoids_taken() {
        let id = random_center_id(&[1, 2, 3]);
        assert!((1..MAX_CENTER_ID).contains(&id));
        assert!(![1, 2, 3].contains(&id));
    }

    #[test]
    fn test_purge_safe_time_is_earliest_export() {
        let centers = vec![center(Some(900), 1_000), center(Some(700), 1_000)];
        assert_eq!(purge_safe_time(&centers, 1_000), 700);
    }

    #[test]
    fn test_purge_safe_time_ignores_stale_and_never_exported() {
        let centers = vec![
            center(Some(900), 1_000),
            // Out of contact longer than its retention budget
            center(Some(100), 500),
            center(None, 1_000),
        ];
        assert_eq!(purge_safe_time(&centers, 1_000), 900);

        let mut deleted = center(Some(50), 10_000);
        deleted.deleted = true;
        assert_eq!(purge_safe_time(&[deleted], 1_000), 1_000);
    }

    #[test]
    fn test_diff_center_skips_infrastructure_fields() {
        let old = PrismsCenter::new("A");
        let mut new = old.clone();
        new.center_id = Some(4);
        new.priority = 9;
        new.last_export = Some(100);
        assert!(diff_center(&old, &new).is_empty());

        new.name = "B".into();
        new.server_password = Some("secret".into());
        let diff = diff_center(&old, &new);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff[0].change_type, CenterChanges::NAME);
        assert_eq!(diff[0].previous, Some(RecordValue::Text("A".into())));
        assert_eq!(diff[1].change_type, CenterChanges::SERVER_PASSWORD);
        assert_eq!(diff[1].previous, None);
    }

    #[test]
    fn test_ordered_diff() {
        let script = ordered_diff(&[1, 2, 3], &[3, 4, 4, 5]);
        assert_eq!(
            script,
            vec![
                DiffOp::Remove(1),
                DiffOp::Remove(2),
                DiffOp::Add(4),
                DiffOp::Add(5)
            ]
        );
        assert!(ordered_diff(&[1, 2], &[2, 1]).is_empty());
    }

    #[test]
    fn test_watermark_round_trip() {
        let changes = vec![
            LatestCenterChange::new(0, 0, 102),
            LatestCenterChange::new(7, 0, 55),
            LatestCenterChange::new(7, 7, 1_700_000_000_000),
        ];
        let json = serialize_center_changes(&changes).unwrap();
        assert!(json.contains(r#""centerID":7"#));
        assert_eq!(parse_center_changes(&json).unwrap(), changes);
    }

    #[test]
    fn test_watermark_for_missing_pair() {
        let changes = vec![LatestCenterChange::new(0, 0, 100)];
        assert_eq!(watermark_for(&changes, 0, 0), 100);
        assert_eq!(watermark_for(&changes, 1, 0), 0);
    }
}

//! The record keeper abstraction.
//!
//! This module defines the [`RecordKeeper`] trait which abstracts over the
//! storage backends (SQLite, in-memory) for change records, peer centers,
//! synchronization attempts and watermarks.

use std::sync::Arc;

use super::center::{LatestCenterChange, PrismsCenter, SyncRecord};
use super::change::{ChangeDraft, ChangeEntry, ChangeRecord, ObjectRef, RecordUser};
use super::purge::{PurgeControl, PurgeReport};
use crate::error::RecordError;

/// Result type for keeper operations.
pub type KeeperResult<T> = Result<T, RecordError>;

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The system clock.
pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Next strictly increasing timestamp: the clock reading, or one millisecond
/// past the last assigned timestamp if the clock has not moved past it.
pub(crate) fn next_timestamp(clock_now: i64, last_assigned: &mut i64) -> i64 {
    let time = if clock_now > *last_assigned {
        clock_now
    } else {
        *last_assigned + 1
    };
    *last_assigned = time;
    time
}

/// Trait for change-record storage backends.
///
/// A keeper is scoped to one namespace and acts on behalf of one center (its
/// [`center_id`](Self::center_id)). All mutating operations are serialized
/// inside the keeper, so a keeper may be shared between threads.
///
/// # Storage Model
///
/// - **Change records**: immutable, identified by IDs drawn from the ID range
///   of the center that created them
/// - **Watermarks**: per `(origin center, subject center)` pair, the latest
///   change time recorded and the latest change time purged
/// - **Centers**: peer descriptors, soft-deleted
/// - **Sync records**: one per synchronization attempt, with per-change
///   success/error associations
pub trait RecordKeeper: Send + Sync {
    /// The namespace isolating this keeper's dataset.
    fn namespace(&self) -> &str;

    /// This replica's center ID.
    fn center_id(&self) -> i32;

    /// This replica's synchronization priority.
    fn local_priority(&self) -> i32;

    // ===== Change records =====

    /// Record a new local change.
    ///
    /// Allocates an ID in this center's range, assigns a strictly increasing
    /// timestamp, stores the record, advances the watermark and runs the
    /// purge policy. Not idempotent: a failed call of unknown outcome must
    /// not be blindly retried.
    fn persist(&self, user: &RecordUser, draft: ChangeDraft) -> KeeperResult<ChangeRecord>;

    /// Store an already-identified record, typically one imported from a
    /// peer.
    ///
    /// Returns `false` without changing anything if a record with that ID
    /// already exists.
    fn persist_record(&self, record: &ChangeRecord) -> KeeperResult<bool>;

    /// IDs of changes newer than `since` that originated at `center_id` and
    /// modified the dataset of `subject_center`, ascending by time. `None`
    /// matches any center.
    fn change_ids(
        &self,
        center_id: Option<i32>,
        subject_center: Option<i32>,
        since: i64,
    ) -> KeeperResult<Vec<i64>>;

    /// Load changes by ID, in the order requested.
    ///
    /// Missing IDs yield `None`; records that cannot be fully reconstructed
    /// yield [`ChangeEntry::Error`].
    fn get_changes(&self, ids: &[i64]) -> KeeperResult<Vec<Option<ChangeEntry>>>;

    /// IDs of all changes in which `item` occupies any role, most recent
    /// first.
    fn history(&self, item: &ObjectRef) -> KeeperResult<Vec<i64>>;

    /// IDs of later changes to the same field or relationship as `change`,
    /// ascending by time.
    fn successors(&self, change: &ChangeRecord) -> KeeperResult<Vec<i64>>;

    /// Sort change IDs by time. Unknown IDs are dropped.
    fn sort_change_ids(&self, ids: &[i64], ascending: bool) -> KeeperResult<Vec<i64>>;

    /// Whether a change with this ID is stored.
    fn has_change(&self, id: i64) -> KeeperResult<bool> {
        Ok(self
            .get_changes(&[id])?
            .first()
            .is_some_and(Option::is_some))
    }

    /// Whether a change with this ID is stored and was not recorded as a
    /// failed import.
    fn has_successful_change(&self, id: i64) -> KeeperResult<bool>;

    /// The center owning the dataset the change modified.
    fn subject_center(&self, change_id: i64) -> KeeperResult<Option<i32>>;

    // ===== Watermarks =====

    /// The latest change time recorded for the pair, or 0 if none.
    fn latest_change(&self, center_id: i32, subject_center: i32) -> KeeperResult<i64>;

    /// Raise the watermark for the pair. Never lowers it.
    fn set_latest_change(&self, center_id: i32, subject_center: i32, time: i64)
    -> KeeperResult<()>;

    /// Every watermark this keeper holds.
    fn latest_changes(&self) -> KeeperResult<Vec<LatestCenterChange>>;

    /// The latest change time purged for the pair, or 0 if none.
    fn latest_purged_change(&self, center_id: i32, subject_center: i32) -> KeeperResult<i64>;

    // ===== Centers =====

    /// All centers that are not deleted.
    fn centers(&self) -> KeeperResult<Vec<PrismsCenter>>;

    /// Store a center.
    ///
    /// New centers get an ID and a creation record. For existing centers one
    /// change record is written per changed user-visible field; center ID,
    /// priority and import/export times are updated silently.
    fn put_center(&self, user: &RecordUser, center: &mut PrismsCenter) -> KeeperResult<()>;

    /// Soft-delete a center and record the deletion.
    fn remove_center(&self, user: &RecordUser, center: &PrismsCenter) -> KeeperResult<()>;

    /// Every center ID known to this keeper, including its own.
    fn all_center_ids(&self) -> KeeperResult<Vec<i32>>;

    // ===== Sync records =====

    /// Sync records for `center`, most recent first, optionally filtered by
    /// direction.
    fn sync_records(
        &self,
        center: &PrismsCenter,
        is_import: Option<bool>,
    ) -> KeeperResult<Vec<SyncRecord>>;

    /// Store a sync record, assigning its ID if it is new.
    fn put_sync_record(&self, record: &mut SyncRecord) -> KeeperResult<()>;

    /// Delete a sync record and its associations.
    fn remove_sync_record(&self, record: &SyncRecord) -> KeeperResult<()>;

    /// Record that a change was sent or received in `record`, successfully or
    /// not. Re-associating overwrites the earlier outcome.
    fn associate(&self, change_id: i64, record: &SyncRecord, error: bool) -> KeeperResult<()>;

    /// IDs of changes associated with `record` with the given outcome,
    /// ascending. A purge drops the associations of the changes it deletes.
    fn associated_changes(&self, record: &SyncRecord, error: bool) -> KeeperResult<Vec<i64>>;

    /// IDs of every change associated with `record`, ascending.
    fn sync_changes(&self, record: &SyncRecord) -> KeeperResult<Vec<i64>> {
        let mut ids = self.associated_changes(record, false)?;
        ids.extend(self.associated_changes(record, true)?);
        ids.sort_unstable();
        Ok(ids)
    }

    /// IDs of changes that failed in `record`.
    fn error_changes(&self, record: &SyncRecord) -> KeeperResult<Vec<i64>> {
        self.associated_changes(record, true)
    }

    /// IDs of changes that succeeded in `record`.
    fn success_changes(&self, record: &SyncRecord) -> KeeperResult<Vec<i64>> {
        self.associated_changes(record, false)
    }

    // ===== Purge =====

    /// Run the keeper's purge policy now.
    fn purge(&self, control: &PurgeControl) -> KeeperResult<PurgeReport>;
}

/// Require a stored sync record's ID.
pub(crate) fn stored_id(record: &SyncRecord) -> KeeperResult<i64> {
    record
        .id
        .ok_or_else(|| RecordError::NotFound("unsaved sync record".to_string()))
}

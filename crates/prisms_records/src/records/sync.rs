//! Reconciliation between centers.
//!
//! One direction of a synchronization from center A to center B runs as:
//!
//! 1. B advertises its watermarks ([`RecordKeeper::latest_changes`]).
//! 2. A calls [`plan_export`] with them and sends the planned changes.
//! 3. B stores them with [`import_changes`] and answers with
//!    [`build_receipt`].
//! 4. A records the per-change outcome with [`finish_export`].
//!
//! The functions here only do bookkeeping. Transport and the application of
//! imported changes to live data belong to the caller.

use super::center::{LatestCenterChange, PrismsCenter, SyncOutcome, SyncReceipt, SyncRecord};
use super::change::{ChangeRecord, RecordUser};
use super::keeper::{KeeperResult, RecordKeeper};
use super::utils::watermark_for;

/// What to send to a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportPlan {
    /// Changes the peer has not seen, ascending by time
    pub change_ids: Vec<i64>,
    /// `(origin center, subject center)` pairs for which changes the peer
    /// has not seen were already purged here. The peer needs a full resync
    /// of those datasets.
    pub needs_full_sync: Vec<(i32, i32)>,
}

/// What an import did with each received change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Stored, and no later local change touches the same field
    pub applied: Vec<i64>,
    /// Stored for audit, but a later local change already supersedes it
    pub superseded: Vec<i64>,
    /// Already imported successfully before
    pub duplicates: Vec<i64>,
    /// Could not be stored, with the reason
    pub errors: Vec<(i64, String)>,
}

impl ImportReport {
    /// Number of changes received without error.
    pub fn success_count(&self) -> usize {
        self.applied.len() + self.superseded.len() + self.duplicates.len()
    }
}

/// Plan an export against the watermarks a peer advertised.
///
/// For every sub-stream this keeper holds, selects the changes newer than
/// the peer's watermark for it.
pub fn plan_export(
    keeper: &dyn RecordKeeper,
    peer_watermarks: &[LatestCenterChange],
) -> KeeperResult<ExportPlan> {
    let mut plan = ExportPlan::default();
    let mut ids = Vec::new();

    for local in keeper.latest_changes()? {
        let (center, subject) = (local.center_id, local.subject_center);
        let seen = watermark_for(peer_watermarks, center, subject);
        if keeper.latest_purged_change(center, subject)? > seen {
            plan.needs_full_sync.push((center, subject));
        }
        if local.latest_change > seen {
            ids.extend(keeper.change_ids(Some(center), Some(subject), seen)?);
        }
    }

    plan.change_ids = keeper.sort_change_ids(&ids, true)?;
    if !plan.needs_full_sync.is_empty() {
        log::info!(
            "Peer needs a full resync of {} sub-streams",
            plan.needs_full_sync.len()
        );
    }
    Ok(plan)
}

/// Store changes received in `sync_record`, which must already be saved.
///
/// Changes are processed oldest first. Each one is associated with the sync
/// record as a success or an error. Replaying an import is harmless.
///
/// # Errors
///
/// Storage failures abort the import; a change that is merely invalid is
/// reported in [`ImportReport::errors`] instead.
pub fn import_changes(
    keeper: &dyn RecordKeeper,
    records: &[ChangeRecord],
    sync_record: &SyncRecord,
) -> KeeperResult<ImportReport> {
    let mut report = ImportReport::default();
    let mut ordered: Vec<&ChangeRecord> = records.iter().collect();
    ordered.sort_by_key(|r| (r.time(), r.id()));

    for record in ordered {
        let id = record.id();
        if keeper.has_successful_change(id)? {
            keeper.associate(id, sync_record, false)?;
            report.duplicates.push(id);
            continue;
        }
        match keeper.persist_record(record) {
            Ok(_) => {
                keeper.associate(id, sync_record, false)?;
                if keeper.successors(record)?.is_empty() {
                    report.applied.push(id);
                } else {
                    report.superseded.push(id);
                }
            }
            Err(e) if e.is_backend() => return Err(e),
            Err(e) => {
                log::warn!("Could not import change {}: {}", id, e);
                keeper.associate(id, sync_record, true)?;
                report.errors.push((id, e.to_string()));
            }
        }
    }

    log::debug!(
        "Imported {} changes ({} superseded, {} duplicates, {} errors)",
        report.applied.len(),
        report.superseded.len(),
        report.duplicates.len(),
        report.errors.len()
    );
    Ok(report)
}

/// Record the outcome of an export to `center`.
///
/// `results` pairs each sent change with whether the peer rejected it. The
/// sync record is saved with the overall outcome, and `center.last_export`
/// advances to the sync time when nothing failed.
pub fn finish_export(
    keeper: &dyn RecordKeeper,
    user: &RecordUser,
    center: &mut PrismsCenter,
    sync_record: &mut SyncRecord,
    results: &[(i64, bool)],
) -> KeeperResult<SyncReceipt> {
    let failed = results.iter().filter(|(_, error)| *error).count();
    sync_record.outcome = if failed == 0 {
        SyncOutcome::Success
    } else {
        SyncOutcome::Failed(format!("{} of {} changes failed", failed, results.len()))
    };
    keeper.put_sync_record(sync_record)?;
    for &(change_id, error) in results {
        keeper.associate(change_id, sync_record, error)?;
    }

    if failed == 0 && center.last_export.is_none_or(|t| t < sync_record.time) {
        center.last_export = Some(sync_record.time);
        keeper.put_center(user, center)?;
    }
    build_receipt(keeper, sync_record)
}

/// Summarize a sync record for the other side.
pub fn build_receipt(keeper: &dyn RecordKeeper, sync_record: &SyncRecord) -> KeeperResult<SyncReceipt> {
    Ok(SyncReceipt {
        success_count: keeper.success_changes(sync_record)?.len(),
        error_count: keeper.error_changes(sync_record)?.len(),
        correlation_id: sync_record.id,
    })
}

//! Retention policy for change records.
//!
//! [`AutoPurger`] decides which change records may be deleted. It never
//! selects a record at or after the purge-safe time, nor one excluded by user
//! or record type. Keepers feed it [`PurgeCandidate`]s and delete what it
//! selects.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::change::{ChangeDraft, ObjectRef, RecordValue};
use super::taxonomy::{Additivity, AutoPurgeChanges, ObjectType, RecordType, SubjectType};
use super::utils::{DiffOp, ordered_diff};
use crate::error::Result;

/// Retention configuration for one namespace.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AutoPurger {
    /// Keep at most this many (non-excluded) entries
    pub max_entry_count: Option<u64>,
    /// Delete entries older than this many milliseconds
    pub max_age: Option<i64>,
    /// Changes made by these users are never purged
    pub excluded_users: Vec<i64>,
    /// Changes of these types are never purged
    pub excluded_types: Vec<RecordType>,
}

/// What the purger needs to know about a stored change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PurgeCandidate {
    pub id: i64,
    pub time: i64,
    pub user_id: i64,
    /// `None` when the stored type names could not be resolved
    pub record_type: Option<RecordType>,
}

impl AutoPurger {
    /// Whether any limit is configured.
    pub fn is_active(&self) -> bool {
        self.max_entry_count.is_some() || self.max_age.is_some()
    }

    /// Whether `candidate` is protected by user or type exclusion.
    pub fn is_excluded(&self, candidate: &PurgeCandidate) -> bool {
        self.excluded_users.contains(&candidate.user_id)
            || candidate
                .record_type
                .is_some_and(|t| self.excluded_types.contains(&t))
    }

    /// Select the IDs to delete.
    ///
    /// `candidates` must be sorted ascending by time. The count and age
    /// criteria are evaluated independently over the non-excluded candidates
    /// and their results are combined. Nothing at or after `safe_time` is
    /// ever selected.
    pub fn select(&self, candidates: &[PurgeCandidate], now: i64, safe_time: i64) -> Vec<i64> {
        let eligible_total = candidates.iter().filter(|c| !self.is_excluded(c)).count();
        let before = candidates.partition_point(|c| c.time < safe_time);
        self.select_before(&candidates[..before], eligible_total, now, safe_time)
    }

    /// Like [`select`](Self::select), for a caller that only loads the
    /// candidates older than `safe_time`.
    ///
    /// `eligible_total` is the number of stored non-excluded changes of any
    /// age; the count criterion is measured against it.
    pub fn select_before(
        &self,
        candidates: &[PurgeCandidate],
        eligible_total: usize,
        now: i64,
        safe_time: i64,
    ) -> Vec<i64> {
        let eligible: Vec<&PurgeCandidate> = candidates
            .iter()
            .filter(|c| c.time < safe_time && !self.is_excluded(c))
            .collect();
        let mut selected = HashSet::new();

        if let Some(max) = self.max_entry_count {
            let excess = (eligible_total as u64).saturating_sub(max) as usize;
            selected.extend(eligible.iter().take(excess).map(|c| c.id));
        }

        if let Some(age) = self.max_age {
            let cutoff = now.saturating_sub(age).min(safe_time);
            selected.extend(eligible.iter().filter(|c| c.time < cutoff).map(|c| c.id));
        }

        eligible
            .iter()
            .map(|c| c.id)
            .filter(|id| selected.contains(id))
            .collect()
    }

    /// The audit changes turning `old` into `self`, recorded against the
    /// purger object `subject`.
    pub fn changes_from(&self, old: &AutoPurger, subject: ObjectRef) -> Result<Vec<ChangeDraft>> {
        let mut drafts = Vec::new();
        if old.max_entry_count != self.max_entry_count {
            drafts.push(ChangeDraft::modified(
                SubjectType::AUTO_PURGE,
                AutoPurgeChanges::ENTRY_COUNT,
                subject,
                old.max_entry_count.map(|c| RecordValue::Int(c as i64)),
            )?);
        }
        if old.max_age != self.max_age {
            drafts.push(ChangeDraft::modified(
                SubjectType::AUTO_PURGE,
                AutoPurgeChanges::AGE,
                subject,
                old.max_age.map(RecordValue::Int),
            )?);
        }
        for op in ordered_diff(&old.excluded_users, &self.excluded_users) {
            let (additivity, user) = match op {
                DiffOp::Add(user) => (Additivity::Added, user),
                DiffOp::Remove(user) => (Additivity::Removed, user),
            };
            drafts.push(ChangeDraft::related(
                SubjectType::AUTO_PURGE,
                AutoPurgeChanges::EXCLUDE_USER,
                additivity,
                subject,
                ObjectRef::new(ObjectType::USER, user),
            )?);
        }
        if !ordered_diff(&old.excluded_types, &self.excluded_types).is_empty() {
            let previous = old
                .excluded_types
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            drafts.push(ChangeDraft::modified(
                SubjectType::AUTO_PURGE,
                AutoPurgeChanges::EXCLUDE_TYPES,
                subject,
                Some(RecordValue::Text(previous)),
            )?);
        }
        Ok(drafts)
    }
}

/// Cooperative cancellation for purge sweeps.
///
/// Clones share the same cancel flag.
#[derive(Debug, Clone, Default)]
pub struct PurgeControl {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl PurgeControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the sweep once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Ask any sweep using this control to stop at the next record.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the sweep should stop now.
    pub fn should_stop(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// What a purge sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgeReport {
    /// IDs of deleted change records
    pub purged_changes: Vec<i64>,
    /// Number of deleted sync records
    pub purged_sync_records: usize,
    /// Objects whose last change record was deleted and that were expired
    pub expired_objects: Vec<ObjectRef>,
    /// The purge-safe time used for this sweep
    pub safe_time: i64,
    /// Whether the sweep stopped early
    pub cancelled: bool,
}

impl PurgeReport {
    pub fn empty(safe_time: i64) -> Self {
        Self {
            safe_time,
            ..Self::default()
        }
    }
}

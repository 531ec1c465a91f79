//! In-memory record keeper.
//!
//! This provides a [`RecordKeeper`] backed by sorted in-memory lists, for
//! lightweight or embedded deployments and for tests. Data is lost when the
//! keeper is dropped.
//!
//! Unlike [`SqliteRecordKeeper`](super::SqliteRecordKeeper), this keeper has
//! no configurable retention. Its background purge deletes every change older
//! than the purge-safe time unless an export of that change to some peer is
//! still being retried.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use super::center::{LatestCenterChange, PrismsCenter, SyncRecord};
use super::change::{ChangeDraft, ChangeEntry, ChangeRecord, ObjectRef, RecordUser};
use super::keeper::{Clock, KeeperResult, RecordKeeper, next_timestamp, stored_id, system_clock};
use super::persister::{BuiltinPersister, RecordPersister, registry_for};
use super::purge::{PurgeControl, PurgeReport};
use super::taxonomy::{ObjectType, SubjectType, TypeRegistry};
use super::utils::{
    center_of, change_id_range, diff_center, lowest_free_id, lowest_free_id_in, purge_safe_time,
    random_center_id,
};
use crate::config::KeeperConfig;
use crate::error::RecordError;

/// In-memory record keeper.
///
/// All state sits behind a single mutex; every operation, including the
/// purge sweep, holds it for its whole duration.
pub struct MemoryRecordKeeper {
    config: KeeperConfig,
    center_id: i32,
    clock: Clock,
    persister: Arc<dyn RecordPersister>,
    registry: TypeRegistry,
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Ascending by time
    changes: Vec<ChangeRecord>,
    /// Change ID -> time
    times: BTreeMap<i64, i64>,

    /// Keyed by local storage ID, including soft-deleted centers
    centers: IndexMap<i64, PrismsCenter>,

    sync_records: IndexMap<i64, SyncRecord>,

    /// (sync record ID, change ID) -> error
    associations: BTreeMap<(i64, i64), bool>,

    latest: BTreeMap<(i32, i32), i64>,
    purged: BTreeMap<(i32, i32), i64>,
    /// Highest own change ID purged so far
    purged_id_max: Option<i64>,

    last_time: i64,
    last_purge: i64,
}

impl MemoryState {
    fn insert_change(&mut self, record: ChangeRecord) {
        let pos = self.changes.partition_point(|r| r.time() <= record.time());
        self.times.insert(record.id(), record.time());
        self.changes.insert(pos, record);
    }

    fn find(&self, id: i64) -> Option<&ChangeRecord> {
        let &time = self.times.get(&id)?;
        let start = self.changes.partition_point(|r| r.time() < time);
        self.changes[start..]
            .iter()
            .take_while(|r| r.time() == time)
            .find(|r| r.id() == id)
    }

    fn raise(map: &mut BTreeMap<(i32, i32), i64>, key: (i32, i32), time: i64) {
        let entry = map.entry(key).or_insert(time);
        if time > *entry {
            *entry = time;
        }
    }

    /// Whether `change_id` was sent to `center` in an export that failed,
    /// fewer than `max_retries` times, and never successfully.
    fn awaited_by(&self, change_id: i64, center: i64, max_retries: u32) -> bool {
        let mut errors = 0;
        for record in self
            .sync_records
            .values()
            .filter(|s| s.center == center && !s.is_import)
        {
            let Some(id) = record.id else { continue };
            match self.associations.get(&(id, change_id)) {
                Some(false) => return false,
                Some(true) => errors += 1,
                None => {}
            }
        }
        errors > 0 && errors < max_retries
    }
}

impl MemoryRecordKeeper {
    /// Create an empty keeper.
    pub fn new(config: KeeperConfig) -> KeeperResult<Self> {
        config.validate()?;
        let center_id = config.center_id.unwrap_or_else(|| random_center_id(&[]));
        log::debug!(
            "Memory record keeper for namespace {} acting as center {}",
            config.namespace,
            center_id
        );
        Ok(Self {
            config,
            center_id,
            clock: system_clock(),
            persister: Arc::new(BuiltinPersister),
            registry: TypeRegistry::new(),
            state: Mutex::new(MemoryState::default()),
        })
    }

    /// Use `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Use `persister` to resolve application objects.
    pub fn with_persister(mut self, persister: Arc<dyn RecordPersister>) -> Self {
        self.registry = registry_for(persister.as_ref());
        self.persister = persister;
        self
    }

    /// The subject types this keeper knows.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Record a local change. The caller holds the lock.
    fn append_local(
        &self,
        state: &mut MemoryState,
        user: &RecordUser,
        draft: ChangeDraft,
    ) -> KeeperResult<ChangeRecord> {
        let range = change_id_range(self.center_id, state.purged_id_max);
        let id = lowest_free_id_in(
            self.center_id,
            range.clone(),
            state.times.range(range).map(|(&id, _)| id),
        )?;
        let time = next_timestamp((self.clock)(), &mut state.last_time);
        let record = ChangeRecord::new(id, time, user.clone(), draft)?;
        MemoryState::raise(
            &mut state.latest,
            (record.origin_center(), record.subject_center()),
            time,
        );
        log::debug!("Recorded change {} at {}: {}", id, time, record.describe());
        state.insert_change(record.clone());
        Ok(record)
    }

    /// Run the purge sweep if the purge interval has elapsed.
    fn maybe_purge(&self, state: &mut MemoryState) {
        let now = (self.clock)();
        if now - state.last_purge < self.config.purge_interval_millis {
            return;
        }
        state.last_purge = now;
        if let Err(e) = self.purge_locked(state, now, &PurgeControl::new()) {
            log::warn!("Background purge failed: {}", e);
        }
    }

    fn purge_locked(
        &self,
        state: &mut MemoryState,
        now: i64,
        control: &PurgeControl,
    ) -> KeeperResult<PurgeReport> {
        let centers: Vec<PrismsCenter> = state.centers.values().cloned().collect();
        let safe_time = purge_safe_time(&centers, now);
        let mut report = PurgeReport::empty(safe_time);
        let peers: Vec<i64> = centers
            .iter()
            .filter(|c| !c.deleted)
            .filter_map(|c| c.id)
            .collect();

        let mut doomed = Vec::new();
        for record in state.changes.iter().take_while(|r| r.time() < safe_time) {
            if control.should_stop() {
                report.cancelled = true;
                break;
            }
            let awaited = peers
                .iter()
                .any(|&p| state.awaited_by(record.id(), p, self.config.max_sync_retries));
            if awaited {
                log::debug!("Keeping change {}: export still being retried", record.id());
                continue;
            }
            doomed.push(record.id());
        }

        let doomed_set: HashSet<i64> = doomed.iter().copied().collect();
        let mut touched = BTreeSet::new();
        let mut kept = Vec::with_capacity(state.changes.len());
        for record in std::mem::take(&mut state.changes) {
            if doomed_set.contains(&record.id()) {
                MemoryState::raise(
                    &mut state.purged,
                    (record.origin_center(), record.subject_center()),
                    record.time(),
                );
                state.times.remove(&record.id());
                if center_of(record.id()) == self.center_id {
                    state.purged_id_max = state.purged_id_max.max(Some(record.id()));
                }
                touched.extend(record.referenced_objects());
            } else {
                kept.push(record);
            }
        }
        state.changes = kept;
        state
            .associations
            .retain(|(_, change_id), _| !doomed_set.contains(change_id));

        let associated: HashSet<i64> = state.associations.keys().map(|(s, _)| *s).collect();
        let before = state.sync_records.len();
        state.sync_records.retain(|id, record| {
            !(record.time < safe_time && record.outcome.is_success() && !associated.contains(id))
        });
        report.purged_sync_records = before - state.sync_records.len();

        let referenced: HashSet<ObjectRef> = if touched.is_empty() {
            HashSet::new()
        } else {
            state
                .changes
                .iter()
                .flat_map(ChangeRecord::referenced_objects)
                .collect()
        };
        for item in touched {
            if referenced.contains(&item) {
                continue;
            }
            if item.object_type == ObjectType::CENTER {
                if state.centers.get(&item.id).is_some_and(|c| c.deleted) {
                    state.centers.shift_remove(&item.id);
                    report.expired_objects.push(item);
                }
            } else if item.object_type != ObjectType::AUTO_PURGER {
                self.persister.expire_object(&item)?;
                report.expired_objects.push(item);
            }
        }

        if !doomed.is_empty() {
            log::debug!(
                "Purged {} changes before {} in namespace {}",
                doomed.len(),
                safe_time,
                self.config.namespace
            );
        }
        report.purged_changes = doomed;
        Ok(report)
    }
}

impl std::fmt::Debug for MemoryRecordKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRecordKeeper")
            .field("namespace", &self.config.namespace)
            .field("center_id", &self.center_id)
            .finish()
    }
}

impl RecordKeeper for MemoryRecordKeeper {
    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    fn center_id(&self) -> i32 {
        self.center_id
    }

    fn local_priority(&self) -> i32 {
        self.config.local_priority
    }

    fn persist(&self, user: &RecordUser, draft: ChangeDraft) -> KeeperResult<ChangeRecord> {
        let mut state = self.state.lock()?;
        let record = self.append_local(&mut state, user, draft)?;
        self.maybe_purge(&mut state);
        Ok(record)
    }

    fn persist_record(&self, record: &ChangeRecord) -> KeeperResult<bool> {
        let mut state = self.state.lock()?;
        if state.times.contains_key(&record.id()) {
            return Ok(false);
        }
        MemoryState::raise(
            &mut state.latest,
            (record.origin_center(), record.subject_center()),
            record.time(),
        );
        state.insert_change(record.clone());
        Ok(true)
    }

    fn change_ids(
        &self,
        center_id: Option<i32>,
        subject_center: Option<i32>,
        since: i64,
    ) -> KeeperResult<Vec<i64>> {
        let state = self.state.lock()?;
        Ok(state
            .changes
            .iter()
            .filter(|r| r.time() > since)
            .filter(|r| center_id.is_none_or(|c| r.origin_center() == c))
            .filter(|r| subject_center.is_none_or(|s| r.subject_center() == s))
            .map(|r| r.id())
            .collect())
    }

    fn get_changes(&self, ids: &[i64]) -> KeeperResult<Vec<Option<ChangeEntry>>> {
        let state = self.state.lock()?;
        Ok(ids
            .iter()
            .map(|&id| state.find(id).cloned().map(ChangeEntry::Record))
            .collect())
    }

    fn history(&self, item: &ObjectRef) -> KeeperResult<Vec<i64>> {
        let domains = self.persister.history_domains(&self.registry, item);
        let state = self.state.lock()?;
        Ok(state
            .changes
            .iter()
            .rev()
            .filter(|r| domains.contains(&r.subject_type()) && r.involves(item))
            .map(|r| r.id())
            .collect())
    }

    fn successors(&self, change: &ChangeRecord) -> KeeperResult<Vec<i64>> {
        let state = self.state.lock()?;
        Ok(state
            .changes
            .iter()
            .filter(|r| r.supersedes(change))
            .map(|r| r.id())
            .collect())
    }

    fn sort_change_ids(&self, ids: &[i64], ascending: bool) -> KeeperResult<Vec<i64>> {
        let wanted: HashSet<i64> = ids.iter().copied().collect();
        let state = self.state.lock()?;
        let mut sorted: Vec<i64> = state
            .changes
            .iter()
            .map(|r| r.id())
            .filter(|id| wanted.contains(id))
            .collect();
        if !ascending {
            sorted.reverse();
        }
        Ok(sorted)
    }

    fn has_change(&self, id: i64) -> KeeperResult<bool> {
        Ok(self.state.lock()?.times.contains_key(&id))
    }

    fn has_successful_change(&self, id: i64) -> KeeperResult<bool> {
        let state = self.state.lock()?;
        if !state.times.contains_key(&id) {
            return Ok(false);
        }
        let mut import_error = false;
        for ((sync_id, change_id), error) in &state.associations {
            if *change_id != id {
                continue;
            }
            let is_import = state.sync_records.get(sync_id).is_some_and(|s| s.is_import);
            if !is_import {
                continue;
            }
            if !*error {
                return Ok(true);
            }
            import_error = true;
        }
        Ok(!import_error)
    }

    fn subject_center(&self, change_id: i64) -> KeeperResult<Option<i32>> {
        let state = self.state.lock()?;
        Ok(state.find(change_id).map(ChangeRecord::subject_center))
    }

    fn latest_change(&self, center_id: i32, subject_center: i32) -> KeeperResult<i64> {
        let state = self.state.lock()?;
        Ok(state
            .latest
            .get(&(center_id, subject_center))
            .copied()
            .unwrap_or(0))
    }

    fn set_latest_change(
        &self,
        center_id: i32,
        subject_center: i32,
        time: i64,
    ) -> KeeperResult<()> {
        let mut state = self.state.lock()?;
        MemoryState::raise(&mut state.latest, (center_id, subject_center), time);
        Ok(())
    }

    fn latest_changes(&self) -> KeeperResult<Vec<LatestCenterChange>> {
        let state = self.state.lock()?;
        Ok(state
            .latest
            .iter()
            .map(|(&(c, s), &t)| LatestCenterChange::new(c, s, t))
            .collect())
    }

    fn latest_purged_change(&self, center_id: i32, subject_center: i32) -> KeeperResult<i64> {
        let state = self.state.lock()?;
        Ok(state
            .purged
            .get(&(center_id, subject_center))
            .copied()
            .unwrap_or(0))
    }

    fn centers(&self) -> KeeperResult<Vec<PrismsCenter>> {
        let state = self.state.lock()?;
        Ok(state
            .centers
            .values()
            .filter(|c| !c.deleted)
            .cloned()
            .collect())
    }

    fn put_center(&self, user: &RecordUser, center: &mut PrismsCenter) -> KeeperResult<()> {
        let mut state = self.state.lock()?;
        let existing = center
            .id
            .and_then(|id| state.centers.get(&id).cloned().map(|old| (id, old)));
        match existing {
            Some((id, old)) => {
                let subject = ObjectRef::new(ObjectType::CENTER, id);
                for field in diff_center(&old, center) {
                    let draft = ChangeDraft::modified(
                        SubjectType::CENTER,
                        field.change_type,
                        subject,
                        field.previous,
                    )?;
                    self.append_local(&mut state, user, draft)?;
                }
            }
            None => {
                let id = match center.id {
                    Some(id) => id,
                    None => {
                        let used: BTreeSet<i64> = state.centers.keys().copied().collect();
                        lowest_free_id(self.center_id, &used)?
                    }
                };
                center.id = Some(id);
                let subject = ObjectRef::new(ObjectType::CENTER, id);
                self.append_local(
                    &mut state,
                    user,
                    ChangeDraft::created(SubjectType::CENTER, subject),
                )?;
            }
        }
        if let Some(id) = center.id {
            state.centers.insert(id, center.clone());
        }
        self.maybe_purge(&mut state);
        Ok(())
    }

    fn remove_center(&self, user: &RecordUser, center: &PrismsCenter) -> KeeperResult<()> {
        let id = center
            .id
            .ok_or_else(|| RecordError::NotFound(format!("center '{}'", center.name)))?;
        let mut state = self.state.lock()?;
        let stored = state
            .centers
            .get_mut(&id)
            .ok_or_else(|| RecordError::NotFound(format!("center {}", id)))?;
        if stored.deleted {
            return Ok(());
        }
        stored.deleted = true;
        let subject = ObjectRef::new(ObjectType::CENTER, id);
        self.append_local(
            &mut state,
            user,
            ChangeDraft::deleted(SubjectType::CENTER, subject),
        )?;
        self.maybe_purge(&mut state);
        Ok(())
    }

    fn all_center_ids(&self) -> KeeperResult<Vec<i32>> {
        let state = self.state.lock()?;
        let mut ids = BTreeSet::from([self.center_id]);
        ids.extend(state.centers.values().filter_map(|c| c.center_id));
        for &(c, s) in state.latest.keys() {
            ids.insert(c);
            ids.insert(s);
        }
        Ok(ids.into_iter().collect())
    }

    fn sync_records(
        &self,
        center: &PrismsCenter,
        is_import: Option<bool>,
    ) -> KeeperResult<Vec<SyncRecord>> {
        let Some(center_id) = center.id else {
            return Ok(Vec::new());
        };
        let state = self.state.lock()?;
        let mut records: Vec<SyncRecord> = state
            .sync_records
            .values()
            .filter(|s| s.center == center_id)
            .filter(|s| is_import.is_none_or(|i| s.is_import == i))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(records)
    }

    fn put_sync_record(&self, record: &mut SyncRecord) -> KeeperResult<()> {
        let mut state = self.state.lock()?;
        let id = match record.id {
            Some(id) => id,
            None => {
                let used: BTreeSet<i64> = state.sync_records.keys().copied().collect();
                lowest_free_id(self.center_id, &used)?
            }
        };
        record.id = Some(id);
        state.sync_records.insert(id, record.clone());
        Ok(())
    }

    fn remove_sync_record(&self, record: &SyncRecord) -> KeeperResult<()> {
        let id = stored_id(record)?;
        let mut state = self.state.lock()?;
        state.sync_records.shift_remove(&id);
        state.associations.retain(|(sync_id, _), _| *sync_id != id);
        Ok(())
    }

    fn associate(&self, change_id: i64, record: &SyncRecord, error: bool) -> KeeperResult<()> {
        let id = stored_id(record)?;
        let mut state = self.state.lock()?;
        if !state.sync_records.contains_key(&id) {
            return Err(RecordError::NotFound(format!("sync record {}", id)));
        }
        state.associations.insert((id, change_id), error);
        Ok(())
    }

    fn associated_changes(&self, record: &SyncRecord, error: bool) -> KeeperResult<Vec<i64>> {
        let id = stored_id(record)?;
        let state = self.state.lock()?;
        Ok(state
            .associations
            .range((id, i64::MIN)..=(id, i64::MAX))
            .filter(|(_, e)| **e == error)
            .map(|((_, change_id), _)| *change_id)
            .collect())
    }

    fn purge(&self, control: &PurgeControl) -> KeeperResult<PurgeReport> {
        let mut state = self.state.lock()?;
        let now = (self.clock)();
        state.last_purge = now;
        self.purge_locked(&mut state, now, control)
    }
}

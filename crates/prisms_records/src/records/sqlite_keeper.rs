//! SQLite-backed record keeper.
//!
//! This module provides the durable [`RecordKeeper`]. Every table is keyed by
//! namespace so several logical datasets can share one database file. IDs are
//! allocated inside the transaction that inserts them, by filling the lowest
//! gap in this center's ID range.

use std::collections::BTreeSet;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};

use super::center::{LatestCenterChange, PrismsCenter, SyncOutcome, SyncRecord, SyncType};
use super::change::{
    ChangeDraft, ChangeEntry, ChangeRecord, ChangeRecordError, ObjectRef, RecordUser,
};
use super::keeper::{Clock, KeeperResult, RecordKeeper, next_timestamp, stored_id, system_clock};
use super::persister::{RecordPersister, registry_for};
use super::purge::{AutoPurger, PurgeCandidate, PurgeControl, PurgeReport};
use super::taxonomy::{ObjectType, RecordType, SubjectType, TypeRegistry, ValueType};
use super::utils::{
    center_of, change_id_range, diff_center, id_range, purge_safe_time, random_center_id,
};
use crate::config::KeeperConfig;
use crate::error::RecordError;

const CHANGE_TABLE: &str = "prisms_change_record";
const CENTER_TABLE: &str = "prisms_center";
const SYNC_TABLE: &str = "prisms_sync_record";
const LATEST_TABLE: &str = "prisms_latest_change";
const PURGED_TABLE: &str = "prisms_purged_change";

/// Filter on change rows `c` in namespace `?1` that neither an excluded user
/// nor an excluded record type protects from purging.
const PURGE_ELIGIBLE: &str = "c.namespace = ?1
    AND NOT EXISTS (
        SELECT 1 FROM prisms_purge_excl_user u
        WHERE u.namespace = c.namespace AND u.user_id = c.user_id
    )
    AND NOT EXISTS (
        SELECT 1 FROM prisms_purge_excl_type t
        WHERE t.namespace = c.namespace AND t.subject_type = c.subject_type
          AND t.change_type IS c.change_type AND t.additivity = c.additivity
    )";

const CHANGE_COLUMNS: &str = "id, change_time, user_id, user_name, subject_type, change_type, \
     additivity, major_subject, minor_subject, data1, data2, pre_value";

const CENTER_COLUMNS: &str = "id, center_id, name, server_url, server_user, server_password, \
     sync_frequency, client_user, sync_priority, change_save_time, last_import, last_export, \
     deleted";

const SYNC_COLUMNS: &str = "id, center, sync_type, is_import, sync_time, parallel_id, sync_error";

/// Row type for sync record queries:
/// (id, center, sync type, is import, time, parallel ID, error)
type SyncRow = (i64, i64, String, bool, i64, Option<i64>, Option<String>);

/// A change record as stored, before its types and objects are resolved.
#[derive(Debug, Clone)]
struct ChangeRow {
    id: i64,
    time: i64,
    user_id: i64,
    user_name: String,
    subject_type: String,
    change_type: Option<String>,
    additivity: i64,
    major_subject: i64,
    minor_subject: Option<i64>,
    data1: Option<i64>,
    data2: Option<i64>,
    pre_value: Option<String>,
}

impl ChangeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            time: row.get(1)?,
            user_id: row.get(2)?,
            user_name: row.get(3)?,
            subject_type: row.get(4)?,
            change_type: row.get(5)?,
            additivity: row.get(6)?,
            major_subject: row.get(7)?,
            minor_subject: row.get(8)?,
            data1: row.get(9)?,
            data2: row.get(10)?,
            pre_value: row.get(11)?,
        })
    }

    fn into_error(self, reason: String) -> ChangeRecordError {
        ChangeRecordError {
            id: self.id,
            time: self.time,
            user_id: self.user_id,
            subject_type: self.subject_type,
            change_type: self.change_type,
            additivity: self.additivity,
            major_subject: Some(self.major_subject),
            minor_subject: self.minor_subject,
            data1: self.data1,
            data2: self.data2,
            previous_value: self.pre_value,
            reason,
        }
    }
}

fn center_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrismsCenter> {
    Ok(PrismsCenter {
        id: Some(row.get(0)?),
        center_id: row.get(1)?,
        name: row.get(2)?,
        server_url: row.get(3)?,
        server_user: row.get(4)?,
        server_password: row.get(5)?,
        sync_frequency: row.get(6)?,
        client_user: row.get(7)?,
        priority: row.get(8)?,
        change_save_time: row.get(9)?,
        last_import: row.get(10)?,
        last_export: row.get(11)?,
        deleted: row.get(12)?,
    })
}

fn sync_record_from_row(row: SyncRow) -> KeeperResult<SyncRecord> {
    let (id, center, sync_type, is_import, time, parallel_id, error) = row;
    Ok(SyncRecord {
        id: Some(id),
        center,
        sync_type: sync_type.parse::<SyncType>()?,
        is_import,
        time,
        parallel_id,
        outcome: SyncOutcome::from_stored(error.as_deref()),
    })
}

/// Lowest unused ID in `range` for `table` within `namespace`.
///
/// Must run inside the transaction that inserts the row.
fn next_free_id(
    conn: &Connection,
    table: &str,
    namespace: &str,
    range: Range<i64>,
    center_id: i32,
) -> KeeperResult<i64> {
    if range.is_empty() {
        return Err(RecordError::IdSpaceExhausted(center_id));
    }
    let start_taken: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE namespace = ?1 AND id = ?2)"),
        params![namespace, range.start],
        |row| row.get(0),
    )?;
    if !start_taken {
        return Ok(range.start);
    }
    let next: Option<i64> = conn.query_row(
        &format!(
            "SELECT MIN(t1.id + 1) FROM {table} t1
             WHERE t1.namespace = ?1 AND t1.id >= ?2 AND t1.id < ?3
               AND NOT EXISTS (
                   SELECT 1 FROM {table} t2 WHERE t2.namespace = ?1 AND t2.id = t1.id + 1
               )"
        ),
        params![namespace, range.start, range.end],
        |row| row.get(0),
    )?;
    match next {
        Some(id) if id < range.end => Ok(id),
        _ => Err(RecordError::IdSpaceExhausted(center_id)),
    }
}

/// Raise a watermark in `table`, never lowering it.
fn raise_watermark(
    conn: &Connection,
    table: &str,
    namespace: &str,
    center_id: i32,
    subject_center: i32,
    time: i64,
) -> KeeperResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO {table} (namespace, center_id, subject_center, latest_change)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, center_id, subject_center)
             DO UPDATE SET latest_change = MAX(latest_change, excluded.latest_change)"
        ),
        params![namespace, center_id, subject_center, time],
    )?;
    Ok(())
}

fn read_watermark(
    conn: &Connection,
    table: &str,
    namespace: &str,
    center_id: i32,
    subject_center: i32,
) -> KeeperResult<i64> {
    let time: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT latest_change FROM {table}
                 WHERE namespace = ?1 AND center_id = ?2 AND subject_center = ?3"
            ),
            params![namespace, center_id, subject_center],
            |row| row.get(0),
        )
        .optional()?;
    Ok(time.unwrap_or(0))
}

/// Highest change ID of `center_id` that was ever purged.
fn purged_id_max(conn: &Connection, namespace: &str, center_id: i32) -> KeeperResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT max_id FROM prisms_purged_id WHERE namespace = ?1 AND center_id = ?2",
            params![namespace, center_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn raise_purged_id(conn: &Connection, namespace: &str, id: i64) -> KeeperResult<()> {
    conn.execute(
        "INSERT INTO prisms_purged_id (namespace, center_id, max_id) VALUES (?1, ?2, ?3)
         ON CONFLICT(namespace, center_id) DO UPDATE SET max_id = MAX(max_id, excluded.max_id)",
        params![namespace, center_of(id), id],
    )?;
    Ok(())
}

fn write_center(conn: &Connection, namespace: &str, center: &PrismsCenter) -> KeeperResult<()> {
    let id = center
        .id
        .ok_or_else(|| RecordError::NotFound(format!("center '{}'", center.name)))?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {CENTER_TABLE} (namespace, {CENTER_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            namespace,
            id,
            center.center_id,
            center.name,
            center.server_url,
            center.server_user,
            center.server_password,
            center.sync_frequency,
            center.client_user,
            center.priority,
            center.change_save_time,
            center.last_import,
            center.last_export,
            center.deleted,
        ],
    )?;
    Ok(())
}

fn load_centers(conn: &Connection, namespace: &str, live_only: bool) -> KeeperResult<Vec<PrismsCenter>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CENTER_COLUMNS} FROM {CENTER_TABLE}
         WHERE namespace = ?1 AND (?2 = 0 OR deleted = 0) ORDER BY id"
    ))?;
    let centers = stmt
        .query_map(params![namespace, live_only], center_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(centers)
}

/// State guarded by the keeper's lock.
struct Inner {
    conn: Connection,
    /// Last timestamp assigned to a local change
    last_time: i64,
    /// Cached auto-purge settings, replaced on every update
    purger: AutoPurger,
}

/// SQLite-backed record keeper.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex`; every operation holds it for its
/// whole duration, so ID allocation and insertion never interleave.
pub struct SqliteRecordKeeper {
    config: KeeperConfig,
    center_id: i32,
    clock: Clock,
    persister: Arc<dyn RecordPersister>,
    registry: TypeRegistry,
    inner: Mutex<Inner>,
}

impl SqliteRecordKeeper {
    /// Open or create a database at the given path.
    ///
    /// Creates the schema if needed and resolves this replica's center ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, if the schema
    /// cannot be created, or if the configuration is invalid.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: KeeperConfig,
        persister: Arc<dyn RecordPersister>,
    ) -> KeeperResult<Self> {
        Self::from_connection(Connection::open(path)?, config, persister)
    }

    /// Create a keeper over an in-memory database.
    ///
    /// Data is lost when the keeper is dropped.
    pub fn in_memory(
        config: KeeperConfig,
        persister: Arc<dyn RecordPersister>,
    ) -> KeeperResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, config, persister)
    }

    fn from_connection(
        conn: Connection,
        config: KeeperConfig,
        persister: Arc<dyn RecordPersister>,
    ) -> KeeperResult<Self> {
        config.validate()?;
        init_schema(&conn)?;
        let registry = registry_for(persister.as_ref());
        let center_id = bootstrap(&conn, &config)?;

        let range = id_range(center_id);
        let last_time: i64 = conn.query_row(
            &format!(
                "SELECT COALESCE(MAX(change_time), 0) FROM {CHANGE_TABLE}
                 WHERE namespace = ?1 AND id >= ?2 AND id < ?3"
            ),
            params![config.namespace, range.start, range.end],
            |row| row.get(0),
        )?;

        let purger = match load_auto_purger(&conn, &config.namespace, &registry)? {
            Some(purger) => purger,
            None if !config.retention.is_empty() => {
                let purger = config.retention.to_auto_purger(&registry)?;
                store_auto_purger(&conn, &config.namespace, &purger)?;
                log::info!(
                    "Seeded auto-purge settings for namespace {}",
                    config.namespace
                );
                purger
            }
            None => AutoPurger::default(),
        };

        Ok(Self {
            config,
            center_id,
            clock: system_clock(),
            persister,
            registry,
            inner: Mutex::new(Inner {
                conn,
                last_time,
                purger,
            }),
        })
    }

    /// Use `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The subject types this keeper knows.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// The current auto-purge settings.
    pub fn auto_purger(&self) -> KeeperResult<AutoPurger> {
        Ok(self.inner.lock()?.purger.clone())
    }

    /// Replace the auto-purge settings, recording one change per difference,
    /// then purge under the new settings.
    pub fn set_auto_purger(&self, user: &RecordUser, purger: &AutoPurger) -> KeeperResult<()> {
        let mut inner = self.inner.lock()?;
        let subject = ObjectRef::new(ObjectType::AUTO_PURGER, id_range(self.center_id).start);
        let drafts = purger.changes_from(&inner.purger, subject)?;
        if drafts.is_empty() {
            return Ok(());
        }
        {
            let Inner {
                conn, last_time, ..
            } = &mut *inner;
            let tx = conn.transaction()?;
            for draft in drafts {
                self.append_local(&tx, last_time, user, draft)?;
            }
            store_auto_purger(&tx, &self.config.namespace, purger)?;
            tx.commit()?;
        }
        inner.purger = purger.clone();
        log::info!(
            "Auto-purge settings for namespace {} updated by {}",
            self.config.namespace,
            user.name
        );
        self.auto_purge(&mut inner);
        Ok(())
    }

    /// Allocate, timestamp and insert a local change.
    fn append_local(
        &self,
        conn: &Connection,
        last_time: &mut i64,
        user: &RecordUser,
        draft: ChangeDraft,
    ) -> KeeperResult<ChangeRecord> {
        let purged_max = purged_id_max(conn, &self.config.namespace, self.center_id)?;
        let id = next_free_id(
            conn,
            CHANGE_TABLE,
            &self.config.namespace,
            change_id_range(self.center_id, purged_max),
            self.center_id,
        )?;
        let time = next_timestamp((self.clock)(), last_time);
        let record = ChangeRecord::new(id, time, user.clone(), draft)?;
        self.insert_change(conn, &record)?;
        log::debug!("Recorded change {} at {}: {}", id, time, record.describe());
        Ok(record)
    }

    /// Insert a change and advance its watermark.
    fn insert_change(&self, conn: &Connection, record: &ChangeRecord) -> KeeperResult<()> {
        let pre_value = match (record.change_type(), record.previous_value()) {
            (Some(change), Some(value)) => Some(self.persister.serialize_value(&change, value)?),
            _ => None,
        };
        conn.execute(
            &format!(
                "INSERT INTO {CHANGE_TABLE} (namespace, {CHANGE_COLUMNS}, subject_center)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                self.config.namespace,
                record.id(),
                record.time(),
                record.user().id,
                record.user().name,
                record.subject_type().name,
                record.change_type().map(|c| c.name),
                record.additivity().value(),
                record.major_subject().id,
                record.minor_subject().map(|o| o.id),
                record.data1().map(|o| o.id),
                record.data2().map(|o| o.id),
                pre_value,
                record.subject_center(),
            ],
        )?;
        raise_watermark(
            conn,
            LATEST_TABLE,
            &self.config.namespace,
            record.origin_center(),
            record.subject_center(),
            record.time(),
        )
    }

    fn load_row(&self, conn: &Connection, id: i64) -> KeeperResult<Option<ChangeRow>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM {CHANGE_TABLE} WHERE namespace = ?1 AND id = ?2"
                ),
                params![self.config.namespace, id],
                ChangeRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Rebuild a change from its row, degrading to an error entry when its
    /// types or objects cannot be resolved.
    fn reconstruct(&self, row: ChangeRow) -> ChangeEntry {
        match self.try_reconstruct(&row) {
            Ok(record) => ChangeEntry::Record(record),
            Err(e) => {
                log::warn!("Change {} could not be reconstructed: {}", row.id, e);
                ChangeEntry::Error(row.into_error(e.to_string()))
            }
        }
    }

    fn try_reconstruct(&self, row: &ChangeRow) -> KeeperResult<ChangeRecord> {
        let record_type = self.registry.record_type(
            &row.subject_type,
            row.change_type.as_deref(),
            row.additivity,
        )?;
        let subject = record_type.subject_type();
        let change = record_type.change_type();

        let major = self.resolve(subject.major_type, row.major_subject)?;
        let minor = self.resolve_slot("minor subject", change.and_then(|c| c.minor_type), row.minor_subject)?;
        let data1 = self.resolve_slot("data1", subject.metadata_type1, row.data1)?;
        let data2 = self.resolve_slot("data2", subject.metadata_type2, row.data2)?;

        let previous_value = match (change, row.pre_value.as_deref()) {
            (_, None) => None,
            (Some(change), Some(flat)) => match change.object_type {
                Some(value_type) => {
                    Some(self.persister.deserialize_value(&change, value_type, flat)?)
                }
                None => {
                    return Err(RecordError::InvalidRecord(format!(
                        "{} does not record previous values",
                        record_type
                    )));
                }
            },
            (None, Some(_)) => {
                return Err(RecordError::InvalidRecord(format!(
                    "{} cannot have a previous value",
                    record_type
                )));
            }
        };

        let user = self
            .persister
            .get_user(row.user_id)?
            .unwrap_or_else(|| RecordUser::new(row.user_id, row.user_name.clone()));

        let draft = ChangeDraft {
            record_type,
            major_subject: major,
            minor_subject: minor,
            previous_value,
            data1,
            data2,
        };
        ChangeRecord::new(row.id, row.time, user, draft)
    }

    fn resolve(&self, object_type: ObjectType, id: i64) -> KeeperResult<ObjectRef> {
        let object = ObjectRef::new(object_type, id);
        if object_type == ObjectType::CENTER || object_type == ObjectType::AUTO_PURGER {
            return Ok(object);
        }
        self.persister
            .resolve_object(object)?
            .ok_or_else(|| RecordError::NotFound(object.to_string()))
    }

    fn resolve_slot(
        &self,
        role: &str,
        declared: Option<ObjectType>,
        id: Option<i64>,
    ) -> KeeperResult<Option<ObjectRef>> {
        match (declared, id) {
            (_, None) => Ok(None),
            (Some(object_type), Some(id)) => self.resolve(object_type, id).map(Some),
            (None, Some(id)) => Err(RecordError::InvalidRecord(format!(
                "{} {} stored but none is declared",
                role, id
            ))),
        }
    }

    /// The objects a stored row names as major, minor or metadata subject,
    /// typed by the registry. Empty if the row's types are unknown.
    fn row_roles(&self, row: &ChangeRow) -> Vec<ObjectRef> {
        let Ok(record_type) =
            self.registry
                .record_type(&row.subject_type, row.change_type.as_deref(), row.additivity)
        else {
            return Vec::new();
        };
        let subject = record_type.subject_type();
        let minor_type = record_type.change_type().and_then(|c| c.minor_type);
        let mut roles = vec![ObjectRef::new(subject.major_type, row.major_subject)];
        let slots = [
            (minor_type, row.minor_subject),
            (subject.metadata_type1, row.data1),
            (subject.metadata_type2, row.data2),
        ];
        for (declared, id) in slots {
            if let (Some(object_type), Some(id)) = (declared, id) {
                roles.push(ObjectRef::new(object_type, id));
            }
        }
        roles
    }

    /// The object a stored row's previous value refers to, if any.
    fn row_previous_ref(&self, row: &ChangeRow) -> Option<ObjectRef> {
        let subject = self.registry.subject(&row.subject_type).ok()?;
        let change = subject.change_type(row.change_type.as_deref()?)?;
        match change.object_type? {
            ValueType::Object(object_type) => {
                let id = row.pre_value.as_deref()?.parse().ok()?;
                Some(ObjectRef::new(object_type, id))
            }
            _ => None,
        }
    }

    /// Rows that may mention `item` in any role or as a previous value.
    fn rows_mentioning(&self, conn: &Connection, item: &ObjectRef) -> KeeperResult<Vec<ChangeRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM {CHANGE_TABLE}
             WHERE namespace = ?1
               AND (major_subject = ?2 OR minor_subject = ?2 OR data1 = ?2 OR data2 = ?2
                    OR pre_value = ?3)
             ORDER BY change_time DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map(
                params![self.config.namespace, item.id, item.id.to_string()],
                ChangeRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Run the purge policy after a local change. Failures are logged; the
    /// change itself is already committed.
    fn auto_purge(&self, inner: &mut Inner) {
        let now = (self.clock)();
        match self.purge_locked(inner, now, &PurgeControl::new()) {
            Ok(report) if !report.purged_changes.is_empty() => log::debug!(
                "Auto-purged {} changes in namespace {}",
                report.purged_changes.len(),
                self.config.namespace
            ),
            Ok(_) => {}
            Err(e) => log::warn!("Auto-purge failed: {}", e),
        }
    }

    fn purge_locked(
        &self,
        inner: &mut Inner,
        now: i64,
        control: &PurgeControl,
    ) -> KeeperResult<PurgeReport> {
        let namespace = &self.config.namespace;
        let purger = inner.purger.clone();
        let tx = inner.conn.transaction()?;

        let centers = load_centers(&tx, namespace, false)?;
        let safe_time = purge_safe_time(&centers, now);
        let mut report = PurgeReport::empty(safe_time);

        let doomed = if purger.is_active() {
            let candidates = self.purge_candidates(&tx, safe_time)?;
            let eligible_total = if purger.max_entry_count.is_some() {
                self.eligible_change_count(&tx)?
            } else {
                0
            };
            purger.select_before(&candidates, eligible_total, now, safe_time)
        } else {
            Vec::new()
        };

        let mut touched = BTreeSet::new();
        for id in doomed {
            if control.should_stop() {
                report.cancelled = true;
                break;
            }
            let Some(row) = self.load_row(&tx, id)? else {
                continue;
            };
            raise_watermark(
                &tx,
                PURGED_TABLE,
                namespace,
                center_of(row.id),
                center_of(row.major_subject),
                row.time,
            )?;
            raise_purged_id(&tx, namespace, row.id)?;
            tx.execute(
                "DELETE FROM prisms_sync_assoc WHERE namespace = ?1 AND change_record = ?2",
                params![namespace, id],
            )?;
            tx.execute(
                &format!("DELETE FROM {CHANGE_TABLE} WHERE namespace = ?1 AND id = ?2"),
                params![namespace, id],
            )?;
            touched.extend(self.row_roles(&row));
            touched.extend(self.row_previous_ref(&row));
            report.purged_changes.push(id);
        }

        report.purged_sync_records = tx.execute(
            &format!(
                "DELETE FROM {SYNC_TABLE}
                 WHERE namespace = ?1 AND sync_time < ?2 AND sync_error IS NULL
                   AND NOT EXISTS (
                       SELECT 1 FROM prisms_sync_assoc a
                       WHERE a.namespace = ?1 AND a.sync_record = {SYNC_TABLE}.id
                   )"
            ),
            params![namespace, safe_time],
        )?;

        for item in touched {
            let still_referenced = self.rows_mentioning(&tx, &item)?.iter().any(|row| {
                self.row_roles(row).contains(&item) || self.row_previous_ref(row) == Some(item)
            });
            if still_referenced {
                continue;
            }
            if item.object_type == ObjectType::CENTER {
                let removed = tx.execute(
                    &format!(
                        "DELETE FROM {CENTER_TABLE} WHERE namespace = ?1 AND id = ?2 AND deleted = 1"
                    ),
                    params![namespace, item.id],
                )?;
                if removed > 0 {
                    log::debug!("Expired deleted center {}", item.id);
                    report.expired_objects.push(item);
                }
            } else if item.object_type != ObjectType::AUTO_PURGER {
                self.persister.expire_object(&item)?;
                report.expired_objects.push(item);
            }
        }

        tx.commit()?;
        Ok(report)
    }

    /// Changes older than `safe_time` that no exclusion protects, oldest
    /// first.
    fn purge_candidates(
        &self,
        conn: &Connection,
        safe_time: i64,
    ) -> KeeperResult<Vec<PurgeCandidate>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT c.id, c.change_time, c.user_id, c.subject_type, c.change_type, c.additivity
             FROM {CHANGE_TABLE} c
             WHERE {PURGE_ELIGIBLE} AND c.change_time < ?2
             ORDER BY c.change_time, c.id"
        ))?;
        let rows = stmt
            .query_map(params![self.config.namespace, safe_time], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, time, user_id, subject, change, additivity)| PurgeCandidate {
                id,
                time,
                user_id,
                record_type: self
                    .registry
                    .record_type(&subject, change.as_deref(), additivity)
                    .ok(),
            })
            .collect())
    }

    /// Number of stored changes, of any age, that no exclusion protects.
    fn eligible_change_count(&self, conn: &Connection) -> KeeperResult<usize> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {CHANGE_TABLE} c WHERE {PURGE_ELIGIBLE}"),
            params![self.config.namespace],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

impl std::fmt::Debug for SqliteRecordKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordKeeper")
            .field("namespace", &self.config.namespace)
            .field("center_id", &self.center_id)
            .finish()
    }
}

/// Initialize the database schema.
fn init_schema(conn: &Connection) -> KeeperResult<()> {
    conn.execute_batch(
        r#"
        -- This replica's identity per namespace
        CREATE TABLE IF NOT EXISTS prisms_installation (
            namespace TEXT PRIMARY KEY,
            center_id INTEGER NOT NULL,
            installation TEXT,
            install_date INTEGER NOT NULL
        );

        -- Peer centers (soft-deleted)
        CREATE TABLE IF NOT EXISTS prisms_center (
            namespace TEXT NOT NULL,
            id INTEGER NOT NULL,
            center_id INTEGER,
            name TEXT NOT NULL,
            server_url TEXT,
            server_user TEXT,
            server_password TEXT,
            sync_frequency INTEGER,
            client_user INTEGER,
            sync_priority INTEGER NOT NULL DEFAULT 0,
            change_save_time INTEGER NOT NULL,
            last_import INTEGER,
            last_export INTEGER,
            deleted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (namespace, id)
        );

        -- Change records (immutable, deleted only by purge)
        CREATE TABLE IF NOT EXISTS prisms_change_record (
            namespace TEXT NOT NULL,
            id INTEGER NOT NULL,
            change_time INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            user_name TEXT NOT NULL,
            subject_type TEXT NOT NULL,
            change_type TEXT,
            additivity INTEGER NOT NULL,
            subject_center INTEGER NOT NULL,
            major_subject INTEGER NOT NULL,
            minor_subject INTEGER,
            data1 INTEGER,
            data2 INTEGER,
            pre_value TEXT,
            PRIMARY KEY (namespace, id)
        );

        CREATE INDEX IF NOT EXISTS idx_change_time
            ON prisms_change_record(namespace, change_time);
        CREATE INDEX IF NOT EXISTS idx_change_major
            ON prisms_change_record(namespace, major_subject);
        CREATE INDEX IF NOT EXISTS idx_change_subject_center
            ON prisms_change_record(namespace, subject_center, change_time);

        -- Synchronization attempts
        CREATE TABLE IF NOT EXISTS prisms_sync_record (
            namespace TEXT NOT NULL,
            id INTEGER NOT NULL,
            center INTEGER NOT NULL,
            sync_type TEXT NOT NULL,
            is_import INTEGER NOT NULL,
            sync_time INTEGER NOT NULL,
            parallel_id INTEGER,
            sync_error TEXT,
            PRIMARY KEY (namespace, id)
        );

        -- Which changes each attempt carried, and whether they failed
        CREATE TABLE IF NOT EXISTS prisms_sync_assoc (
            namespace TEXT NOT NULL,
            sync_record INTEGER NOT NULL,
            change_record INTEGER NOT NULL,
            error INTEGER NOT NULL,
            PRIMARY KEY (namespace, sync_record, change_record)
        );

        CREATE INDEX IF NOT EXISTS idx_sync_assoc_change
            ON prisms_sync_assoc(namespace, change_record);

        -- Watermarks per (origin center, subject center)
        CREATE TABLE IF NOT EXISTS prisms_latest_change (
            namespace TEXT NOT NULL,
            center_id INTEGER NOT NULL,
            subject_center INTEGER NOT NULL,
            latest_change INTEGER NOT NULL,
            PRIMARY KEY (namespace, center_id, subject_center)
        );

        CREATE TABLE IF NOT EXISTS prisms_purged_change (
            namespace TEXT NOT NULL,
            center_id INTEGER NOT NULL,
            subject_center INTEGER NOT NULL,
            latest_change INTEGER NOT NULL,
            PRIMARY KEY (namespace, center_id, subject_center)
        );

        -- Purged change IDs are never reissued
        CREATE TABLE IF NOT EXISTS prisms_purged_id (
            namespace TEXT NOT NULL,
            center_id INTEGER NOT NULL,
            max_id INTEGER NOT NULL,
            PRIMARY KEY (namespace, center_id)
        );

        -- Auto-purge settings
        CREATE TABLE IF NOT EXISTS prisms_auto_purge (
            namespace TEXT PRIMARY KEY,
            entry_count INTEGER,
            age INTEGER
        );

        CREATE TABLE IF NOT EXISTS prisms_purge_excl_user (
            namespace TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            PRIMARY KEY (namespace, user_id)
        );

        CREATE TABLE IF NOT EXISTS prisms_purge_excl_type (
            namespace TEXT NOT NULL,
            subject_type TEXT NOT NULL,
            change_type TEXT,
            additivity INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// Resolve this replica's center ID, re-parenting a copied installation.
fn bootstrap(conn: &Connection, config: &KeeperConfig) -> KeeperResult<i32> {
    let namespace = &config.namespace;
    let stored: Option<(i32, Option<String>)> = conn
        .query_row(
            "SELECT center_id, installation FROM prisms_installation WHERE namespace = ?1",
            params![namespace],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let now = chrono::Utc::now().timestamp_millis();

    let Some((installed_id, stored_installation)) = stored else {
        let center_id = config.center_id.unwrap_or_else(|| random_center_id(&[]));
        conn.execute(
            "INSERT INTO prisms_installation (namespace, center_id, installation, install_date)
             VALUES (?1, ?2, ?3, ?4)",
            params![namespace, center_id, config.installation, now],
        )?;
        log::info!("Installed namespace {} as center {}", namespace, center_id);
        return Ok(center_id);
    };

    match (&config.installation, &stored_installation) {
        (Some(configured), Some(stored)) if configured != stored => {
            let mut taken: Vec<i32> = load_centers(conn, namespace, false)?
                .into_iter()
                .filter_map(|c| c.center_id)
                .collect();
            taken.push(installed_id);
            let center_id = config
                .center_id
                .filter(|id| !taken.contains(id))
                .unwrap_or_else(|| random_center_id(&taken));

            let mut previous = PrismsCenter::new(format!("Installation {}", installed_id));
            previous.center_id = Some(installed_id);
            previous.id = Some(next_free_id(
                conn,
                CENTER_TABLE,
                namespace,
                id_range(center_id),
                center_id,
            )?);
            write_center(conn, namespace, &previous)?;

            conn.execute(
                "UPDATE prisms_installation
                 SET center_id = ?2, installation = ?3, install_date = ?4
                 WHERE namespace = ?1",
                params![namespace, center_id, configured, now],
            )?;
            log::info!(
                "Namespace {} was copied from installation {}; center {} re-parented, now center {}",
                namespace,
                stored,
                installed_id,
                center_id
            );
            Ok(center_id)
        }
        (Some(configured), None) => {
            conn.execute(
                "UPDATE prisms_installation SET installation = ?2 WHERE namespace = ?1",
                params![namespace, configured],
            )?;
            Ok(installed_id)
        }
        _ => {
            if let Some(configured) = config.center_id
                && configured != installed_id
            {
                log::warn!(
                    "Namespace {} is installed as center {}; ignoring configured center {}",
                    namespace,
                    installed_id,
                    configured
                );
            }
            Ok(installed_id)
        }
    }
}

fn load_auto_purger(
    conn: &Connection,
    namespace: &str,
    registry: &TypeRegistry,
) -> KeeperResult<Option<AutoPurger>> {
    let settings: Option<(Option<i64>, Option<i64>)> = conn
        .query_row(
            "SELECT entry_count, age FROM prisms_auto_purge WHERE namespace = ?1",
            params![namespace],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((entry_count, age)) = settings else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT user_id FROM prisms_purge_excl_user WHERE namespace = ?1 ORDER BY user_id",
    )?;
    let excluded_users = stmt
        .query_map(params![namespace], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;

    let mut stmt = conn.prepare(
        "SELECT subject_type, change_type, additivity FROM prisms_purge_excl_type
         WHERE namespace = ?1",
    )?;
    let type_rows = stmt
        .query_map(params![namespace], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut excluded_types: Vec<RecordType> = Vec::with_capacity(type_rows.len());
    for (subject, change, additivity) in type_rows {
        match registry.record_type(&subject, change.as_deref(), additivity) {
            Ok(record_type) => excluded_types.push(record_type),
            Err(e) => log::warn!("Ignoring unknown excluded purge type: {}", e),
        }
    }

    Ok(Some(AutoPurger {
        max_entry_count: entry_count.map(|c| c.max(0) as u64),
        max_age: age,
        excluded_users,
        excluded_types,
    }))
}

fn store_auto_purger(conn: &Connection, namespace: &str, purger: &AutoPurger) -> KeeperResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO prisms_auto_purge (namespace, entry_count, age)
         VALUES (?1, ?2, ?3)",
        params![
            namespace,
            purger.max_entry_count.map(|c| c as i64),
            purger.max_age
        ],
    )?;
    conn.execute(
        "DELETE FROM prisms_purge_excl_user WHERE namespace = ?1",
        params![namespace],
    )?;
    for user in &purger.excluded_users {
        conn.execute(
            "INSERT OR IGNORE INTO prisms_purge_excl_user (namespace, user_id) VALUES (?1, ?2)",
            params![namespace, user],
        )?;
    }
    conn.execute(
        "DELETE FROM prisms_purge_excl_type WHERE namespace = ?1",
        params![namespace],
    )?;
    for record_type in &purger.excluded_types {
        conn.execute(
            "INSERT INTO prisms_purge_excl_type (namespace, subject_type, change_type, additivity)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                namespace,
                record_type.subject_type().name,
                record_type.change_type().map(|c| c.name),
                record_type.additivity().value()
            ],
        )?;
    }
    Ok(())
}

impl RecordKeeper for SqliteRecordKeeper {
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
        let mut inner = self.inner.lock()?;
        let record = {
            let Inner {
                conn, last_time, ..
            } = &mut *inner;
            let tx = conn.transaction()?;
            let record = self.append_local(&tx, last_time, user, draft)?;
            tx.commit()?;
            record
        };
        self.auto_purge(&mut inner);
        Ok(record)
    }

    fn persist_record(&self, record: &ChangeRecord) -> KeeperResult<bool> {
        let mut inner = self.inner.lock()?;
        let tx = inner.conn.transaction()?;
        let exists: bool = tx.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {CHANGE_TABLE} WHERE namespace = ?1 AND id = ?2)"),
            params![self.config.namespace, record.id()],
            |row| row.get(0),
        )?;
        if exists {
            return Ok(false);
        }
        self.insert_change(&tx, record)?;
        tx.commit()?;
        log::debug!("Imported change {} from center {}", record.id(), record.origin_center());
        Ok(true)
    }

    fn change_ids(
        &self,
        center_id: Option<i32>,
        subject_center: Option<i32>,
        since: i64,
    ) -> KeeperResult<Vec<i64>> {
        let range = center_id.map(id_range);
        let inner = self.inner.lock()?;
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT id FROM {CHANGE_TABLE}
             WHERE namespace = ?1 AND change_time > ?2
               AND (?3 IS NULL OR id >= ?3) AND (?4 IS NULL OR id < ?4)
               AND (?5 IS NULL OR subject_center = ?5)
             ORDER BY change_time, id"
        ))?;
        let ids = stmt
            .query_map(
                params![
                    self.config.namespace,
                    since,
                    range.as_ref().map(|r| r.start),
                    range.as_ref().map(|r| r.end),
                    subject_center
                ],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn get_changes(&self, ids: &[i64]) -> KeeperResult<Vec<Option<ChangeEntry>>> {
        let inner = self.inner.lock()?;
        let mut entries = Vec::with_capacity(ids.len());
        for &id in ids {
            let row = self.load_row(&inner.conn, id)?;
            entries.push(row.map(|row| self.reconstruct(row)));
        }
        Ok(entries)
    }

    fn history(&self, item: &ObjectRef) -> KeeperResult<Vec<i64>> {
        let domains = self.persister.history_domains(&self.registry, item);
        let inner = self.inner.lock()?;
        let rows = self.rows_mentioning(&inner.conn, item)?;
        Ok(rows
            .iter()
            .filter(|row| domains.iter().any(|d| d.name == row.subject_type))
            .filter(|row| self.row_roles(row).contains(item))
            .map(|row| row.id)
            .collect())
    }

    fn successors(&self, change: &ChangeRecord) -> KeeperResult<Vec<i64>> {
        let inner = self.inner.lock()?;
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT id FROM {CHANGE_TABLE}
             WHERE namespace = ?1 AND subject_type = ?2 AND change_type IS ?3
               AND major_subject = ?4 AND minor_subject IS ?5
               AND (additivity = 0) = ?6 AND change_time > ?7 AND id != ?8
             ORDER BY change_time, id"
        ))?;
        let ids = stmt
            .query_map(
                params![
                    self.config.namespace,
                    change.subject_type().name,
                    change.change_type().map(|c| c.name),
                    change.major_subject().id,
                    change.minor_subject().map(|o| o.id),
                    change.additivity().is_modification(),
                    change.time(),
                    change.id(),
                ],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn sort_change_ids(&self, ids: &[i64], ascending: bool) -> KeeperResult<Vec<i64>> {
        let inner = self.inner.lock()?;
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT change_time FROM {CHANGE_TABLE} WHERE namespace = ?1 AND id = ?2"
        ))?;
        let mut timed = Vec::with_capacity(ids.len());
        for &id in ids {
            let time: Option<i64> = stmt
                .query_row(params![self.config.namespace, id], |row| row.get(0))
                .optional()?;
            if let Some(time) = time {
                timed.push((time, id));
            }
        }
        timed.sort_unstable();
        timed.dedup();
        if !ascending {
            timed.reverse();
        }
        Ok(timed.into_iter().map(|(_, id)| id).collect())
    }

    fn has_change(&self, id: i64) -> KeeperResult<bool> {
        let inner = self.inner.lock()?;
        let exists = inner.conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {CHANGE_TABLE} WHERE namespace = ?1 AND id = ?2)"),
            params![self.config.namespace, id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn has_successful_change(&self, id: i64) -> KeeperResult<bool> {
        let inner = self.inner.lock()?;
        let successful = inner.conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {CHANGE_TABLE} WHERE namespace = ?1 AND id = ?2)
                   AND NOT (
                       EXISTS(SELECT 1 FROM prisms_sync_assoc a
                              JOIN {SYNC_TABLE} s ON s.namespace = a.namespace AND s.id = a.sync_record
                              WHERE a.namespace = ?1 AND a.change_record = ?2
                                AND s.is_import = 1 AND a.error = 1)
                       AND NOT EXISTS(SELECT 1 FROM prisms_sync_assoc a
                              JOIN {SYNC_TABLE} s ON s.namespace = a.namespace AND s.id = a.sync_record
                              WHERE a.namespace = ?1 AND a.change_record = ?2
                                AND s.is_import = 1 AND a.error = 0)
                   )"
            ),
            params![self.config.namespace, id],
            |row| row.get(0),
        )?;
        Ok(successful)
    }

    fn subject_center(&self, change_id: i64) -> KeeperResult<Option<i32>> {
        let inner = self.inner.lock()?;
        let center = inner
            .conn
            .query_row(
                &format!(
                    "SELECT subject_center FROM {CHANGE_TABLE} WHERE namespace = ?1 AND id = ?2"
                ),
                params![self.config.namespace, change_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(center)
    }

    fn latest_change(&self, center_id: i32, subject_center: i32) -> KeeperResult<i64> {
        let inner = self.inner.lock()?;
        read_watermark(
            &inner.conn,
            LATEST_TABLE,
            &self.config.namespace,
            center_id,
            subject_center,
        )
    }

    fn set_latest_change(
        &self,
        center_id: i32,
        subject_center: i32,
        time: i64,
    ) -> KeeperResult<()> {
        let inner = self.inner.lock()?;
        raise_watermark(
            &inner.conn,
            LATEST_TABLE,
            &self.config.namespace,
            center_id,
            subject_center,
            time,
        )
    }

    fn latest_changes(&self) -> KeeperResult<Vec<LatestCenterChange>> {
        let inner = self.inner.lock()?;
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT center_id, subject_center, latest_change FROM {LATEST_TABLE}
             WHERE namespace = ?1 ORDER BY center_id, subject_center"
        ))?;
        let changes = stmt
            .query_map(params![self.config.namespace], |row| {
                Ok(LatestCenterChange::new(row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    fn latest_purged_change(&self, center_id: i32, subject_center: i32) -> KeeperResult<i64> {
        let inner = self.inner.lock()?;
        read_watermark(
            &inner.conn,
            PURGED_TABLE,
            &self.config.namespace,
            center_id,
            subject_center,
        )
    }

    fn centers(&self) -> KeeperResult<Vec<PrismsCenter>> {
        let inner = self.inner.lock()?;
        load_centers(&inner.conn, &self.config.namespace, true)
    }

    fn put_center(&self, user: &RecordUser, center: &mut PrismsCenter) -> KeeperResult<()> {
        let namespace = &self.config.namespace;
        let mut inner = self.inner.lock()?;
        let created = {
            let Inner {
                conn, last_time, ..
            } = &mut *inner;
            let tx = conn.transaction()?;
            let existing = match center.id {
                Some(id) => tx
                    .query_row(
                        &format!(
                            "SELECT {CENTER_COLUMNS} FROM {CENTER_TABLE} WHERE namespace = ?1 AND id = ?2"
                        ),
                        params![namespace, id],
                        center_from_row,
                    )
                    .optional()?
                    .map(|old| (id, old)),
                None => None,
            };

            let created = match existing {
                Some((id, old)) => {
                    let subject = ObjectRef::new(ObjectType::CENTER, id);
                    for field in diff_center(&old, center) {
                        let draft = ChangeDraft::modified(
                            SubjectType::CENTER,
                            field.change_type,
                            subject,
                            field.previous,
                        )?;
                        self.append_local(&tx, last_time, user, draft)?;
                    }
                    write_center(&tx, namespace, center)?;
                    false
                }
                None => {
                    let id = match center.id {
                        Some(id) => id,
                        None => next_free_id(
                            &tx,
                            CENTER_TABLE,
                            namespace,
                            id_range(self.center_id),
                            self.center_id,
                        )?,
                    };
                    center.id = Some(id);
                    write_center(&tx, namespace, center)?;
                    self.append_local(
                        &tx,
                        last_time,
                        user,
                        ChangeDraft::created(
                            SubjectType::CENTER,
                            ObjectRef::new(ObjectType::CENTER, id),
                        ),
                    )?;
                    true
                }
            };
            tx.commit()?;
            created
        };
        if created {
            log::info!("Added center '{}' in namespace {}", center.name, namespace);
        }
        self.auto_purge(&mut inner);
        Ok(())
    }

    fn remove_center(&self, user: &RecordUser, center: &PrismsCenter) -> KeeperResult<()> {
        let id = center
            .id
            .ok_or_else(|| RecordError::NotFound(format!("center '{}'", center.name)))?;
        let namespace = &self.config.namespace;
        let mut inner = self.inner.lock()?;
        {
            let Inner {
                conn, last_time, ..
            } = &mut *inner;
            let tx = conn.transaction()?;
            let deleted: Option<bool> = tx
                .query_row(
                    &format!("SELECT deleted FROM {CENTER_TABLE} WHERE namespace = ?1 AND id = ?2"),
                    params![namespace, id],
                    |row| row.get(0),
                )
                .optional()?;
            match deleted {
                None => return Err(RecordError::NotFound(format!("center {}", id))),
                Some(true) => return Ok(()),
                Some(false) => {}
            }
            tx.execute(
                &format!("UPDATE {CENTER_TABLE} SET deleted = 1 WHERE namespace = ?1 AND id = ?2"),
                params![namespace, id],
            )?;
            self.append_local(
                &tx,
                last_time,
                user,
                ChangeDraft::deleted(SubjectType::CENTER, ObjectRef::new(ObjectType::CENTER, id)),
            )?;
            tx.commit()?;
        }
        log::info!("Removed center '{}' from namespace {}", center.name, namespace);
        self.auto_purge(&mut inner);
        Ok(())
    }

    fn all_center_ids(&self) -> KeeperResult<Vec<i32>> {
        let inner = self.inner.lock()?;
        let mut ids = BTreeSet::from([self.center_id]);
        ids.extend(
            load_centers(&inner.conn, &self.config.namespace, false)?
                .into_iter()
                .filter_map(|c| c.center_id),
        );
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT center_id, subject_center FROM {LATEST_TABLE} WHERE namespace = ?1"
        ))?;
        let pairs = stmt
            .query_map(params![self.config.namespace], |row| {
                Ok((row.get::<_, i32>(0)?, row.get::<_, i32>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (c, s) in pairs {
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
        let inner = self.inner.lock()?;
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT {SYNC_COLUMNS} FROM {SYNC_TABLE}
             WHERE namespace = ?1 AND center = ?2 AND (?3 IS NULL OR is_import = ?3)
             ORDER BY sync_time DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map(params![self.config.namespace, center_id, is_import], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<SyncRow>>>()?;
        rows.into_iter().map(sync_record_from_row).collect()
    }

    fn put_sync_record(&self, record: &mut SyncRecord) -> KeeperResult<()> {
        let namespace = &self.config.namespace;
        let mut inner = self.inner.lock()?;
        let tx = inner.conn.transaction()?;
        let id = match record.id {
            Some(id) => id,
            None => next_free_id(
                &tx,
                SYNC_TABLE,
                namespace,
                id_range(self.center_id),
                self.center_id,
            )?,
        };
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {SYNC_TABLE} (namespace, {SYNC_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                namespace,
                id,
                record.center,
                record.sync_type.to_string(),
                record.is_import,
                record.time,
                record.parallel_id,
                record.outcome.to_stored(),
            ],
        )?;
        tx.commit()?;
        record.id = Some(id);
        Ok(())
    }

    fn remove_sync_record(&self, record: &SyncRecord) -> KeeperResult<()> {
        let id = stored_id(record)?;
        let mut inner = self.inner.lock()?;
        let tx = inner.conn.transaction()?;
        tx.execute(
            "DELETE FROM prisms_sync_assoc WHERE namespace = ?1 AND sync_record = ?2",
            params![self.config.namespace, id],
        )?;
        tx.execute(
            &format!("DELETE FROM {SYNC_TABLE} WHERE namespace = ?1 AND id = ?2"),
            params![self.config.namespace, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn associate(&self, change_id: i64, record: &SyncRecord, error: bool) -> KeeperResult<()> {
        let id = stored_id(record)?;
        let inner = self.inner.lock()?;
        let exists: bool = inner.conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {SYNC_TABLE} WHERE namespace = ?1 AND id = ?2)"),
            params![self.config.namespace, id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(RecordError::NotFound(format!("sync record {}", id)));
        }
        inner.conn.execute(
            "INSERT INTO prisms_sync_assoc (namespace, sync_record, change_record, error)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, sync_record, change_record) DO UPDATE SET error = excluded.error",
            params![self.config.namespace, id, change_id, error],
        )?;
        Ok(())
    }

    fn associated_changes(&self, record: &SyncRecord, error: bool) -> KeeperResult<Vec<i64>> {
        let id = stored_id(record)?;
        let inner = self.inner.lock()?;
        let mut stmt = inner.conn.prepare(
            "SELECT change_record FROM prisms_sync_assoc
             WHERE namespace = ?1 AND sync_record = ?2 AND error = ?3
             ORDER BY change_record",
        )?;
        let ids = stmt
            .query_map(params![self.config.namespace, id, error], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn purge(&self, control: &PurgeControl) -> KeeperResult<PurgeReport> {
        let mut inner = self.inner.lock()?;
        let now = (self.clock)();
        let report = self.purge_locked(&mut inner, now, control)?;
        log::debug!(
            "Purge of namespace {} removed {} changes and {} sync records",
            self.config.namespace,
            report.purged_changes.len(),
            report.purged_sync_records
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::change::RecordValue;
    use crate::records::persister::BuiltinPersister;
    use crate::records::taxonomy::{Additivity, CenterChanges};
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::TempDir;

    fn admin() -> RecordUser {
        RecordUser::new(1, "admin")
    }

    fn builtin() -> Arc<dyn RecordPersister> {
        Arc::new(BuiltinPersister)
    }

    fn ticking_clock(start: i64, step: i64) -> Clock {
        let now = Arc::new(AtomicI64::new(start));
        Arc::new(move || now.fetch_add(step, Ordering::SeqCst))
    }

    fn keeper(center_id: i32) -> SqliteRecordKeeper {
        SqliteRecordKeeper::in_memory(KeeperConfig::new("test").with_center_id(center_id), builtin())
            .unwrap()
            .with_clock(ticking_clock(1_000, 10))
    }

    #[test]
    fn test_sqlite_next_free_id_fills_gaps() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let range = id_range(2);
        for offset in [0, 1, 3] {
            let mut center = PrismsCenter::new("c");
            center.id = Some(range.start + offset);
            write_center(&conn, "ns", &center).unwrap();
        }
        assert_eq!(
            next_free_id(&conn, CENTER_TABLE, "ns", range.clone(), 2).unwrap(),
            range.start + 2
        );
        assert_eq!(
            next_free_id(&conn, CENTER_TABLE, "other", range.clone(), 2).unwrap(),
            range.start
        );
        assert!(matches!(
            next_free_id(&conn, CENTER_TABLE, "ns", range.start..range.start + 2, 2),
            Err(RecordError::IdSpaceExhausted(2))
        ));
    }

    #[test]
    fn test_sqlite_persist_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.db");
        let config = KeeperConfig::new("clinic").with_center_id(7);

        let id = {
            let keeper = SqliteRecordKeeper::open(&path, config.clone(), builtin()).unwrap();
            let mut center = PrismsCenter::new("Remote");
            center.server_url = Some("https://remote.example".into());
            keeper.put_center(&admin(), &mut center).unwrap();
            center.name = "Renamed".into();
            keeper.put_center(&admin(), &mut center).unwrap();
            center.id.unwrap()
        };

        let keeper = SqliteRecordKeeper::open(&path, config, builtin()).unwrap();
        assert_eq!(keeper.center_id(), 7);
        let centers = keeper.centers().unwrap();
        assert_eq!(centers.len(), 1);
        assert_eq!(centers[0].id, Some(id));
        assert_eq!(centers[0].name, "Renamed");

        let history = keeper
            .history(&ObjectRef::new(ObjectType::CENTER, id))
            .unwrap();
        assert_eq!(history.len(), 2);
        let latest = keeper.get_changes(&history[..1]).unwrap()[0]
            .clone()
            .and_then(ChangeEntry::into_record)
            .unwrap();
        assert_eq!(latest.change_type(), Some(CenterChanges::NAME));
        assert_eq!(
            latest.describe_with(None),
            format!("center {}: name changed from 'Remote'", id)
        );
    }

    #[test]
    fn test_sqlite_random_center_id_when_unconfigured() {
        let keeper = SqliteRecordKeeper::in_memory(KeeperConfig::new("test"), builtin()).unwrap();
        assert!(keeper.center_id() > 0);
    }

    #[test]
    fn test_sqlite_copied_installation_is_reparented() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.db");
        let mut config = KeeperConfig::new("clinic").with_center_id(5);
        config.installation = Some("host-a".into());
        drop(SqliteRecordKeeper::open(&path, config.clone(), builtin()).unwrap());

        config.installation = Some("host-b".into());
        config.center_id = None;
        let keeper = SqliteRecordKeeper::open(&path, config, builtin()).unwrap();
        assert_ne!(keeper.center_id(), 5);

        let centers = keeper.centers().unwrap();
        assert_eq!(centers.len(), 1);
        assert_eq!(centers[0].name, "Installation 5");
        assert_eq!(centers[0].center_id, Some(5));
        assert_eq!(
            center_of(centers[0].id.unwrap()),
            keeper.center_id()
        );
        assert!(keeper.all_center_ids().unwrap().contains(&5));
    }

    #[test]
    fn test_sqlite_unknown_subject_degrades_to_error_entry() {
        let keeper = keeper(0);
        {
            let inner = keeper.inner.lock().unwrap();
            inner
                .conn
                .execute(
                    "INSERT INTO prisms_change_record (namespace, id, change_time, user_id,
                        user_name, subject_type, change_type, additivity, subject_center,
                        major_subject)
                     VALUES ('test', 5, 10, 1, 'admin', 'invoice', NULL, 1, 0, 12)",
                    [],
                )
                .unwrap();
        }
        let entries = keeper.get_changes(&[5, 6]).unwrap();
        match &entries[0] {
            Some(ChangeEntry::Error(error)) => {
                assert_eq!(error.subject_type, "invoice");
                assert_eq!(error.major_subject, Some(12));
                assert!(error.reason.contains("invoice"));
            }
            other => panic!("expected an error entry, got {:?}", other),
        }
        assert!(entries[1].is_none());
    }

    #[test]
    fn test_sqlite_persist_record_is_idempotent() {
        let source = keeper(1);
        let mut center = PrismsCenter::new("A");
        source.put_center(&admin(), &mut center).unwrap();
        let id = source.change_ids(Some(1), None, 0).unwrap()[0];
        let record = source.get_changes(&[id]).unwrap()[0]
            .clone()
            .and_then(ChangeEntry::into_record)
            .unwrap();

        let target = keeper(2);
        assert!(target.persist_record(&record).unwrap());
        assert!(!target.persist_record(&record).unwrap());
        let copy = target.get_changes(&[id]).unwrap()[0]
            .clone()
            .and_then(ChangeEntry::into_record)
            .unwrap();
        assert_eq!(copy, record);
        assert_eq!(target.latest_change(1, 1).unwrap(), record.time());
        assert_eq!(target.subject_center(id).unwrap(), Some(1));
    }

    #[test]
    fn test_sqlite_watermarks_are_monotonic() {
        let keeper = keeper(0);
        keeper.set_latest_change(3, 4, 200).unwrap();
        keeper.set_latest_change(3, 4, 100).unwrap();
        assert_eq!(keeper.latest_change(3, 4).unwrap(), 200);
        assert_eq!(keeper.latest_change(4, 3).unwrap(), 0);
        assert_eq!(keeper.latest_purged_change(3, 4).unwrap(), 0);
    }

    #[test]
    fn test_sqlite_successors_and_sorting() {
        let keeper = keeper(0);
        let mut center = PrismsCenter::new("A");
        keeper.put_center(&admin(), &mut center).unwrap();
        center.name = "B".into();
        keeper.put_center(&admin(), &mut center).unwrap();
        center.sync_frequency = Some(60_000);
        keeper.put_center(&admin(), &mut center).unwrap();
        center.name = "C".into();
        keeper.put_center(&admin(), &mut center).unwrap();

        let ids = keeper.change_ids(None, None, 0).unwrap();
        assert_eq!(ids.len(), 4);
        let first_rename = keeper.get_changes(&ids[1..2]).unwrap()[0]
            .clone()
            .and_then(ChangeEntry::into_record)
            .unwrap();
        assert_eq!(keeper.successors(&first_rename).unwrap(), vec![ids[3]]);

        let reversed: Vec<i64> = ids.iter().rev().copied().collect();
        assert_eq!(keeper.sort_change_ids(&reversed, true).unwrap(), ids);
        assert_eq!(keeper.sort_change_ids(&ids, false).unwrap(), reversed);
    }

    #[test]
    fn test_sqlite_sync_bookkeeping() {
        let keeper = keeper(0);
        let mut center = PrismsCenter::new("Peer");
        keeper.put_center(&admin(), &mut center).unwrap();
        let change = keeper.change_ids(None, None, 0).unwrap()[0];

        let mut import = SyncRecord::new(center.id.unwrap(), SyncType::ManualRemote, true, 50);
        keeper.put_sync_record(&mut import).unwrap();
        keeper.associate(change, &import, true).unwrap();
        assert!(!keeper.has_successful_change(change).unwrap());
        keeper.associate(change, &import, false).unwrap();
        assert!(keeper.has_successful_change(change).unwrap());
        assert_eq!(keeper.sync_changes(&import).unwrap(), vec![change]);

        import.outcome = SyncOutcome::Failed("peer rejected".into());
        keeper.put_sync_record(&mut import).unwrap();
        let stored = keeper.sync_records(&center, Some(true)).unwrap();
        assert_eq!(stored, vec![import.clone()]);

        keeper.remove_sync_record(&import).unwrap();
        assert!(keeper.sync_records(&center, None).unwrap().is_empty());
        assert!(keeper.success_changes(&import).unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_auto_purger_is_audited_and_applied() {
        let keeper = keeper(0);
        for name in ["A", "B", "C", "D"] {
            keeper
                .put_center(&admin(), &mut PrismsCenter::new(name))
                .unwrap();
        }
        let purger = AutoPurger {
            max_entry_count: Some(3),
            excluded_users: vec![99],
            ..Default::default()
        };
        keeper.set_auto_purger(&admin(), &purger).unwrap();
        assert_eq!(keeper.auto_purger().unwrap(), purger);

        // 4 creations + 2 audit changes, trimmed to the newest 3
        let remaining = keeper.change_ids(None, None, 0).unwrap();
        assert_eq!(remaining.len(), 3);
        let subjects: Vec<String> = keeper
            .get_changes(&remaining)
            .unwrap()
            .into_iter()
            .map(|e| e.unwrap().as_record().unwrap().subject_type().name.to_string())
            .collect();
        assert_eq!(subjects, vec!["center", "autoPurge", "autoPurge"]);
        assert!(keeper.latest_purged_change(0, 0).unwrap() > 0);
    }

    #[test]
    fn test_sqlite_purge_expires_deleted_center() {
        let keeper = keeper(0);
        let mut center = PrismsCenter::new("Gone");
        keeper.put_center(&admin(), &mut center).unwrap();
        keeper.remove_center(&admin(), &center).unwrap();
        keeper
            .set_auto_purger(
                &admin(),
                &AutoPurger {
                    max_age: Some(0),
                    excluded_types: vec![
                        RecordType::new(
                            SubjectType::AUTO_PURGE,
                            Some(crate::records::taxonomy::AutoPurgeChanges::AGE),
                            Additivity::Modified,
                        )
                        .unwrap(),
                    ],
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(keeper.history(&center.object_ref().unwrap()).unwrap().is_empty());
        let inner = keeper.inner.lock().unwrap();
        let remaining = load_centers(&inner.conn, "test", false).unwrap();
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_sqlite_purge_drops_settled_sync_records() {
        let keeper = keeper(0);
        let mut peer = PrismsCenter::new("Peer");
        keeper.put_center(&admin(), &mut peer).unwrap();
        let change = keeper.change_ids(None, None, 0).unwrap()[0];
        let peer_id = peer.id.unwrap();

        let mut stored = Vec::new();
        for (time, outcome) in [
            (10, SyncOutcome::Success),
            (20, SyncOutcome::Failed("peer offline".into())),
            (30, SyncOutcome::Unknown),
            (40, SyncOutcome::Success),
            (1_000_000_000_000, SyncOutcome::Success),
        ] {
            let mut record = SyncRecord::new(peer_id, SyncType::Automatic, false, time);
            record.outcome = outcome;
            keeper.put_sync_record(&mut record).unwrap();
            stored.push(record);
        }
        keeper.associate(change, &stored[3], false).unwrap();

        let report = keeper.purge(&PurgeControl::new()).unwrap();
        assert_eq!(report.purged_sync_records, 1);
        let kept: Vec<i64> = keeper
            .sync_records(&peer, None)
            .unwrap()
            .into_iter()
            .map(|s| s.time)
            .collect();
        assert_eq!(kept, vec![1_000_000_000_000, 40, 30, 20]);
    }

    #[test]
    fn test_sqlite_purged_change_ids_stay_retired_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.db");
        let config = KeeperConfig::new("clinic").with_center_id(0);
        let subject = {
            let keeper = SqliteRecordKeeper::open(&path, config.clone(), builtin())
                .unwrap()
                .with_clock(ticking_clock(1_000, 10));
            let mut center = PrismsCenter::new("A");
            keeper.put_center(&admin(), &mut center).unwrap();
            keeper
                .set_auto_purger(
                    &admin(),
                    &AutoPurger {
                        max_age: Some(0),
                        ..Default::default()
                    },
                )
                .unwrap();
            assert!(keeper.change_ids(None, None, 0).unwrap().is_empty());
            center.object_ref().unwrap()
        };

        let keeper = SqliteRecordKeeper::open(&path, config, builtin())
            .unwrap()
            .with_clock(ticking_clock(5_000, 10));
        let renamed = keeper
            .persist(
                &admin(),
                ChangeDraft::modified(
                    SubjectType::CENTER,
                    CenterChanges::NAME,
                    subject,
                    Some(RecordValue::Text("A".into())),
                )
                .unwrap(),
            )
            .unwrap();
        assert_eq!(renamed.id(), 2);
    }

    #[test]
    fn test_sqlite_retention_config_seeds_purger() {
        let mut config = KeeperConfig::new("test").with_center_id(0);
        config.retention.max_entry_count = Some(10);
        let keeper = SqliteRecordKeeper::in_memory(config, builtin()).unwrap();
        assert_eq!(keeper.auto_purger().unwrap().max_entry_count, Some(10));
    }
}

//! Integration tests for the record keepers

#[cfg(test)]
#[cfg(feature = "sqlite")]
mod keeper_integration_tests {
    use prisms_records::KeeperConfig;
    use prisms_records::records::utils::{center_of, parse_center_changes, serialize_center_changes};
    use prisms_records::records::{
        AutoPurger, ChangeDraft, ChangeEntry, ChangeRecord, ChangeType, Clock, ImportReport,
        MemoryRecordKeeper, ObjectRef, ObjectType, PrismsCenter, PurgeControl, RecordKeeper,
        RecordPersister, RecordUser, RecordValue, SqliteRecordKeeper, SubjectType, SyncRecord,
        SyncType, ValueType, import_changes, plan_export,
    };
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    const NOTE: ObjectType = ObjectType("note");
    const BODY: ChangeType = ChangeType::field("body", "body", ValueType::Text);
    const NOTE_CHANGES: &[ChangeType] = &[BODY];
    const NOTE_SUBJECT: SubjectType = SubjectType {
        name: "note",
        display: "note",
        major_type: NOTE,
        metadata_type1: None,
        metadata_type2: None,
        change_types: NOTE_CHANGES,
    };

    /// Application side of the keeper: knows notes, can forget them.
    #[derive(Default)]
    struct NotesPersister {
        forgotten: Mutex<HashSet<i64>>,
        expired: Mutex<Vec<ObjectRef>>,
    }

    impl NotesPersister {
        fn forget(&self, id: i64) {
            self.forgotten.lock().unwrap().insert(id);
        }

        fn expired(&self) -> Vec<ObjectRef> {
            let mut expired = self.expired.lock().unwrap().clone();
            expired.sort();
            expired
        }
    }

    impl RecordPersister for NotesPersister {
        fn subject_types(&self) -> Vec<SubjectType> {
            vec![NOTE_SUBJECT]
        }

        fn resolve_object(&self, object: ObjectRef) -> prisms_records::Result<Option<ObjectRef>> {
            if object.object_type == NOTE && self.forgotten.lock().unwrap().contains(&object.id) {
                return Ok(None);
            }
            Ok(Some(object))
        }

        fn expire_object(&self, item: &ObjectRef) -> prisms_records::Result<()> {
            self.expired.lock().unwrap().push(*item);
            Ok(())
        }
    }

    struct Fixture {
        keeper: SqliteRecordKeeper,
        persister: Arc<NotesPersister>,
        now: Arc<AtomicI64>,
    }

    impl Fixture {
        fn new(center_id: i32) -> Self {
            let persister = Arc::new(NotesPersister::default());
            let now = Arc::new(AtomicI64::new(10));
            let clock_now = now.clone();
            let clock: Clock = Arc::new(move || clock_now.load(Ordering::SeqCst));
            let keeper = SqliteRecordKeeper::in_memory(
                KeeperConfig::new("notes").with_center_id(center_id),
                persister.clone(),
            )
            .unwrap()
            .with_clock(clock);
            Self {
                keeper,
                persister,
                now,
            }
        }

        fn at(&self, time: i64) -> &SqliteRecordKeeper {
            self.now.store(time, Ordering::SeqCst);
            &self.keeper
        }
    }

    fn admin() -> RecordUser {
        RecordUser::new(1, "admin")
    }

    fn nurse() -> RecordUser {
        RecordUser::new(2, "nurse")
    }

    fn note(id: i64) -> ObjectRef {
        ObjectRef::new(NOTE, id)
    }

    fn created(id: i64) -> ChangeDraft {
        ChangeDraft::created(NOTE_SUBJECT, note(id))
    }

    fn edited(id: i64, previous: &str) -> ChangeDraft {
        ChangeDraft::modified(
            NOTE_SUBJECT,
            BODY,
            note(id),
            Some(RecordValue::Text(previous.to_string())),
        )
        .unwrap()
    }

    fn record(keeper: &dyn RecordKeeper, id: i64) -> ChangeRecord {
        keeper.get_changes(&[id]).unwrap()[0]
            .clone()
            .and_then(ChangeEntry::into_record)
            .unwrap()
    }

    /// A memory keeper receiving everything a source center exports.
    struct Receiver {
        keeper: MemoryRecordKeeper,
        session: SyncRecord,
    }

    impl Receiver {
        fn new() -> Self {
            let keeper = MemoryRecordKeeper::new(KeeperConfig::new("notes").with_center_id(2))
                .unwrap()
                .with_persister(Arc::new(NotesPersister::default()))
                .with_clock(Arc::new(|| 100));
            let mut source = PrismsCenter::new("Source");
            source.center_id = Some(1);
            keeper.put_center(&admin(), &mut source).unwrap();
            let mut session = SyncRecord::new(source.id.unwrap(), SyncType::Automatic, true, 100);
            keeper.put_sync_record(&mut session).unwrap();
            Self { keeper, session }
        }

        fn pull(&self, source: &dyn RecordKeeper) -> ImportReport {
            let plan = plan_export(source, &self.keeper.latest_changes().unwrap()).unwrap();
            let sent: Vec<ChangeRecord> = plan
                .change_ids
                .iter()
                .map(|&id| record(source, id))
                .collect();
            import_changes(&self.keeper, &sent, &self.session).unwrap()
        }
    }

    #[test]
    fn test_change_after_purge_reaches_peer_from_sqlite() {
        let a = Fixture::new(1);
        let b = Receiver::new();
        let first = a.at(100).persist(&nurse(), created(5)).unwrap();
        assert_eq!(b.pull(&a.keeper).applied, vec![first.id()]);

        let purger = AutoPurger {
            max_age: Some(0),
            ..Default::default()
        };
        a.at(1_000).set_auto_purger(&admin(), &purger).unwrap();
        assert!(!a.keeper.has_change(first.id()).unwrap());

        let second = a.at(2_000).persist(&nurse(), edited(5, "first draft")).unwrap();
        assert!(second.id() > first.id());
        let report = b.pull(&a.keeper);
        assert_eq!(report.applied, vec![second.id()]);
        assert!(report.duplicates.is_empty());
        assert_eq!(record(&b.keeper, second.id()), second);
    }

    #[test]
    fn test_change_after_purge_reaches_peer_from_memory() {
        let now = Arc::new(AtomicI64::new(100));
        let clock_now = now.clone();
        let a = MemoryRecordKeeper::new(KeeperConfig::new("notes").with_center_id(1))
            .unwrap()
            .with_persister(Arc::new(NotesPersister::default()))
            .with_clock(Arc::new(move || clock_now.load(Ordering::SeqCst)));
        let b = Receiver::new();
        let first = a.persist(&nurse(), created(5)).unwrap();
        assert_eq!(b.pull(&a).applied, vec![first.id()]);

        now.store(1_000, Ordering::SeqCst);
        assert_eq!(
            a.purge(&PurgeControl::new()).unwrap().purged_changes,
            vec![first.id()]
        );

        now.store(2_000, Ordering::SeqCst);
        let second = a.persist(&nurse(), edited(5, "first draft")).unwrap();
        assert_ne!(second.id(), first.id());
        let report = b.pull(&a);
        assert_eq!(report.applied, vec![second.id()]);
        assert!(report.duplicates.is_empty());
        assert_eq!(record(&b.keeper, second.id()), second);
    }

    #[test]
    fn test_ids_map_back_to_their_center() {
        let a = Fixture::new(3);
        let b = Fixture::new(4);
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push((3, a.at(100 + i).persist(&admin(), created(i)).unwrap().id()));
            ids.push((4, b.at(100 + i).persist(&admin(), created(i)).unwrap().id()));
        }
        let mut center = PrismsCenter::new("Peer");
        a.keeper.put_center(&admin(), &mut center).unwrap();
        ids.push((3, center.id.unwrap()));

        for (center_id, id) in ids {
            assert_eq!(center_of(id), center_id);
        }
    }

    #[test]
    fn test_peer_watermark_selects_newer_changes() {
        let a = Fixture::new(0);
        let mut ids = Vec::new();
        for (i, time) in [100, 101, 102].into_iter().enumerate() {
            ids.push(a.at(time).persist(&admin(), created(i as i64 + 5)).unwrap().id());
        }
        assert_eq!(
            a.keeper.change_ids(Some(0), Some(0), 100).unwrap(),
            vec![ids[1], ids[2]]
        );
        assert_eq!(a.keeper.latest_change(0, 0).unwrap(), 102);
    }

    #[test]
    fn test_persisted_change_reads_back_and_replay_is_noop() {
        let a = Fixture::new(0);
        a.at(100).persist(&nurse(), created(5)).unwrap();
        let persisted = a.at(110).persist(&nurse(), edited(5, "first draft")).unwrap();

        let stored = record(&a.keeper, persisted.id());
        assert_eq!(stored, persisted);
        assert_eq!(stored.describe(), "note 5: body changed from 'first draft'");
        assert!(!a.keeper.persist_record(&persisted).unwrap());
        assert_eq!(a.keeper.change_ids(None, None, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_watermark_never_regresses() {
        let a = Fixture::new(0);
        a.keeper.set_latest_change(7, 7, 500).unwrap();
        a.keeper.set_latest_change(7, 7, 400).unwrap();
        assert_eq!(a.keeper.latest_change(7, 7).unwrap(), 500);
    }

    #[test]
    fn test_successors() {
        let a = Fixture::new(0);
        a.at(100).persist(&nurse(), created(5)).unwrap();
        let x = a.at(110).persist(&nurse(), edited(5, "a")).unwrap();
        let other = a.at(115).persist(&nurse(), edited(6, "z")).unwrap();
        let y = a.at(120).persist(&nurse(), edited(5, "b")).unwrap();

        let after_x = a.keeper.successors(&x).unwrap();
        assert!(after_x.contains(&y.id()));
        assert!(!after_x.contains(&other.id()));
        assert!(!a.keeper.successors(&y).unwrap().contains(&x.id()));
    }

    #[test]
    fn test_watermark_json_round_trip() {
        let a = Fixture::new(0);
        a.at(100).persist(&nurse(), created(5)).unwrap();
        a.keeper.set_latest_change(4, 2, 77).unwrap();

        let marks = a.keeper.latest_changes().unwrap();
        let json = serialize_center_changes(&marks).unwrap();
        assert_eq!(parse_center_changes(&json).unwrap(), marks);
    }

    #[test]
    fn test_entry_count_purges_oldest() {
        let a = Fixture::new(0);
        let purger = AutoPurger {
            max_entry_count: Some(5),
            excluded_users: vec![admin().id],
            ..Default::default()
        };
        a.at(50).set_auto_purger(&admin(), &purger).unwrap();

        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(a.at(100 + i).persist(&nurse(), created(10 + i)).unwrap().id());
        }

        let remaining: Vec<i64> = a
            .keeper
            .change_ids(None, None, 0)
            .unwrap()
            .into_iter()
            .filter(|id| ids.contains(id))
            .collect();
        assert_eq!(remaining, ids[3..].to_vec());
        assert_eq!(a.persister.expired(), vec![note(10), note(11), note(12)]);
        assert_eq!(a.keeper.latest_purged_change(0, 0).unwrap(), 102);
    }

    #[test]
    fn test_excluded_user_survives_zero_max_age() {
        let a = Fixture::new(0);
        let protected = RecordUser::new(7, "auditor");
        let purger = AutoPurger {
            max_age: Some(0),
            excluded_users: vec![protected.id],
            ..Default::default()
        };
        a.at(50).set_auto_purger(&admin(), &purger).unwrap();

        for i in 0..4 {
            a.at(100 + i).persist(&nurse(), created(10 + i)).unwrap();
        }
        let kept = a.at(200).persist(&protected, created(20)).unwrap();
        let report = a.at(300).purge(&PurgeControl::new()).unwrap();
        assert!(!report.cancelled);

        assert_eq!(a.keeper.change_ids(None, None, 0).unwrap(), vec![kept.id()]);
    }

    #[test]
    fn test_unresolvable_object_degrades_to_error() {
        let a = Fixture::new(0);
        let kept = a.at(100).persist(&nurse(), created(5)).unwrap();
        let lost = a.at(101).persist(&nurse(), created(6)).unwrap();
        a.persister.forget(6);

        let entries = a.keeper.get_changes(&[kept.id(), lost.id()]).unwrap();
        assert_eq!(entries[0].as_ref().and_then(ChangeEntry::as_record), Some(&kept));
        match &entries[1] {
            Some(ChangeEntry::Error(error)) => {
                assert_eq!(error.id, lost.id());
                assert_eq!(error.subject_type, "note");
                assert_eq!(error.major_subject, Some(6));
            }
            other => panic!("expected an error entry, got {:?}", other),
        }
    }

    #[test]
    fn test_memory_keeper_agrees_on_change_selection() {
        let now = Arc::new(AtomicI64::new(100));
        let clock_now = now.clone();
        let memory = MemoryRecordKeeper::new(KeeperConfig::new("notes").with_center_id(0))
            .unwrap()
            .with_persister(Arc::new(NotesPersister::default()))
            .with_clock(Arc::new(move || clock_now.load(Ordering::SeqCst)));

        let mut ids = Vec::new();
        for (i, time) in [100, 101, 102].into_iter().enumerate() {
            now.store(time, Ordering::SeqCst);
            ids.push(memory.persist(&admin(), created(i as i64 + 5)).unwrap().id());
        }
        assert_eq!(
            memory.change_ids(Some(0), Some(0), 100).unwrap(),
            vec![ids[1], ids[2]]
        );
        assert_eq!(record(&memory, ids[0]).describe(), "note 5 created");
    }
}

//! Change records and the keepers that store them.
//!
//! Every mutation of a tracked object is described by an immutable
//! [`ChangeRecord`]. A [`RecordKeeper`] stores those records together with
//! the bookkeeping needed to replicate them between centers: peer
//! descriptors, per-attempt sync records and per-stream watermarks.

mod center;
mod change;
mod keeper;
mod memory_keeper;
mod persister;
mod purge;
#[cfg(feature = "sqlite")]
mod sqlite_keeper;
mod sync;
mod taxonomy;
pub mod utils;

pub use center::{
    DEFAULT_CHANGE_SAVE_TIME, LatestCenterChange, PrismsCenter, SyncOutcome, SyncReceipt,
    SyncRecord, SyncType,
};
pub use change::{
    ChangeDraft, ChangeEntry, ChangeRecord, ChangeRecordError, ObjectRef, RecordUser, RecordValue,
};
pub use keeper::{Clock, KeeperResult, RecordKeeper, system_clock};
pub use memory_keeper::MemoryRecordKeeper;
pub use persister::{BuiltinPersister, RecordPersister};
pub use purge::{AutoPurger, PurgeCandidate, PurgeControl, PurgeReport};
#[cfg(feature = "sqlite")]
pub use sqlite_keeper::SqliteRecordKeeper;
pub use sync::{ExportPlan, ImportReport, build_receipt, finish_export, import_changes, plan_export};
pub use taxonomy::{
    Additivity, AutoPurgeChanges, CenterChanges, ChangeType, ObjectType, RecordType, SubjectType,
    TypeRegistry, ValueType,
};

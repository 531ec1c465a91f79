//! Peer center descriptors and synchronization bookkeeping types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::change::ObjectRef;
use super::taxonomy::ObjectType;
use crate::error::RecordError;

/// Default time a peer may stay out of contact before it stops constraining
/// purges: 30 days.
pub const DEFAULT_CHANGE_SAVE_TIME: i64 = 30 * 24 * 60 * 60 * 1000;

/// A peer replica participating in synchronization.
#[derive(Debug, Clone, PartialEq)]
pub struct PrismsCenter {
    /// Local storage ID, `None` until the center is stored
    pub id: Option<i64>,
    /// The peer's own center ID, `None` until learned from the peer
    pub center_id: Option<i32>,
    /// Display name
    pub name: String,
    /// URL to poll the peer at
    pub server_url: Option<String>,
    /// User name to authenticate to the peer with
    pub server_user: Option<String>,
    /// Password to authenticate to the peer with
    pub server_password: Option<String>,
    /// How often to poll the peer (milliseconds)
    pub sync_frequency: Option<i64>,
    /// Local user the peer authenticates as when it polls us
    pub client_user: Option<i64>,
    /// Tie-breaker deciding import direction between two descriptors of the
    /// same logical center
    pub priority: i32,
    /// How long changes are kept for this peer before it must fully resync
    /// (milliseconds)
    pub change_save_time: i64,
    /// When changes were last imported from this peer
    pub last_import: Option<i64>,
    /// When changes were last exported to this peer
    pub last_export: Option<i64>,
    /// Soft-delete flag
    pub deleted: bool,
}

impl PrismsCenter {
    /// A new, unsaved center descriptor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            center_id: None,
            name: name.into(),
            server_url: None,
            server_user: None,
            server_password: None,
            sync_frequency: None,
            client_user: None,
            priority: 0,
            change_save_time: DEFAULT_CHANGE_SAVE_TIME,
            last_import: None,
            last_export: None,
            deleted: false,
        }
    }

    /// Reference to this center for use in change records.
    pub fn object_ref(&self) -> Option<ObjectRef> {
        self.id.map(|id| ObjectRef::new(ObjectType::CENTER, id))
    }
}

/// How a synchronization attempt was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncType {
    /// Scheduled polling
    Automatic,
    /// Triggered by a user, exchanged over the network
    ManualRemote,
    /// Exchanged through a file
    File,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::Automatic => write!(f, "automatic"),
            SyncType::ManualRemote => write!(f, "manual-remote"),
            SyncType::File => write!(f, "file"),
        }
    }
}

impl FromStr for SyncType {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(SyncType::Automatic),
            "manual-remote" => Ok(SyncType::ManualRemote),
            "file" => Ok(SyncType::File),
            _ => Err(RecordError::ValueParse {
                value: s.to_string(),
                reason: "unknown synchronization type".to_string(),
            }),
        }
    }
}

/// Marker stored for an attempt whose outcome is unknown.
const UNKNOWN_OUTCOME: &str = "?";

/// Outcome of a synchronization attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncOutcome {
    /// Completed successfully
    Success,
    /// Interrupted before the outcome could be confirmed
    #[default]
    Unknown,
    /// Failed with the given reason
    Failed(String),
}

impl SyncOutcome {
    /// The stored form: `None` for success, `"?"` for unknown, otherwise the
    /// failure reason.
    pub fn to_stored(&self) -> Option<String> {
        match self {
            SyncOutcome::Success => None,
            SyncOutcome::Unknown => Some(UNKNOWN_OUTCOME.to_string()),
            SyncOutcome::Failed(reason) => Some(reason.clone()),
        }
    }

    /// Parse the stored form.
    pub fn from_stored(stored: Option<&str>) -> Self {
        match stored {
            None => SyncOutcome::Success,
            Some(UNKNOWN_OUTCOME) => SyncOutcome::Unknown,
            Some(reason) => SyncOutcome::Failed(reason.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success)
    }
}

/// One synchronization attempt with a peer center.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    /// Storage ID, `None` until stored
    pub id: Option<i64>,
    /// Local storage ID of the peer center
    pub center: i64,
    pub sync_type: SyncType,
    pub is_import: bool,
    /// Milliseconds since the Unix epoch
    pub time: i64,
    /// Correlates a local export with the peer's import of the same exchange
    pub parallel_id: Option<i64>,
    pub outcome: SyncOutcome,
}

impl SyncRecord {
    /// A new, unsaved attempt whose outcome is not yet known.
    pub fn new(center: i64, sync_type: SyncType, is_import: bool, time: i64) -> Self {
        Self {
            id: None,
            center,
            sync_type,
            is_import,
            time,
            parallel_id: None,
            outcome: SyncOutcome::Unknown,
        }
    }
}

/// The latest change time recorded for changes originating at `center_id`
/// that modified the dataset owned by `subject_center`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LatestCenterChange {
    #[serde(rename = "centerID")]
    pub center_id: i32,
    #[serde(rename = "subjectCenter")]
    pub subject_center: i32,
    #[serde(rename = "latestChange")]
    pub latest_change: i64,
}

impl LatestCenterChange {
    pub fn new(center_id: i32, subject_center: i32, latest_change: i64) -> Self {
        Self {
            center_id,
            subject_center,
            latest_change,
        }
    }
}

/// Summary returned to the exporting peer after an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReceipt {
    #[serde(rename = "successCount")]
    pub success_count: usize,
    #[serde(rename = "errorCount")]
    pub error_count: usize,
    /// Storage ID of the sync record on the side that produced the receipt
    #[serde(rename = "correlationID")]
    pub correlation_id: Option<i64>,
}

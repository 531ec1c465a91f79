//! Classification of what changed and how.
//!
//! A [`SubjectType`] names the kind of object a change is about (its *major
//! subject*) and declares up to two metadata object types. A [`ChangeType`]
//! names one field or relationship of that subject. Together with an
//! [`Additivity`] they form a [`RecordType`].
//!
//! Subject and change types are plain descriptors carrying their declared
//! types as data. The crate ships two built-in subjects ([`SubjectType::CENTER`]
//! and [`SubjectType::AUTO_PURGE`]); applications add their own through a
//! [`TypeRegistry`], usually populated from a
//! [`RecordPersister`](super::RecordPersister).

use std::fmt;
use std::hash::{Hash, Hasher};

use super::change::{ObjectRef, RecordValue};
use crate::error::{RecordError, Result};

/// Name of a kind of object that may be referenced from a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectType(pub &'static str);

impl ObjectType {
    /// A peer center descriptor ([`PrismsCenter`](super::PrismsCenter)).
    pub const CENTER: ObjectType = ObjectType("center");
    /// A user of the embedding application.
    pub const USER: ObjectType = ObjectType("user");
    /// The per-namespace [`AutoPurger`](super::AutoPurger) settings.
    pub const AUTO_PURGER: ObjectType = ObjectType("autoPurger");

    /// The type name.
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Type of a value replaced by a modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Text,
    /// Milliseconds since the Unix epoch
    Time,
    /// A reference to another object
    Object(ObjectType),
}

/// Whether a change added, removed or modified data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Additivity {
    /// Something was deleted (-1)
    Removed,
    /// A field was changed (0)
    Modified,
    /// Something was created (+1)
    Added,
}

impl Additivity {
    /// The stored integer form: +1, -1 or 0.
    pub fn value(self) -> i64 {
        match self {
            Additivity::Removed => -1,
            Additivity::Modified => 0,
            Additivity::Added => 1,
        }
    }

    /// Parse the stored integer form.
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            -1 => Some(Additivity::Removed),
            0 => Some(Additivity::Modified),
            1 => Some(Additivity::Added),
            _ => None,
        }
    }

    pub fn is_modification(self) -> bool {
        self == Additivity::Modified
    }
}

/// A field- or relationship-level change under a [`SubjectType`].
///
/// Equality and hashing use the name only.
#[derive(Debug, Clone, Copy)]
pub struct ChangeType {
    /// Stable name, used in storage and on the wire
    pub name: &'static str,
    /// Human-readable label used in descriptions
    pub display: &'static str,
    /// Type of the other endpoint of a relationship change
    pub minor_type: Option<ObjectType>,
    /// Type of the value being replaced by a modification
    pub object_type: Option<ValueType>,
    /// Whether the replaced value is stored by identifier rather than inline
    pub identifiable: bool,
}

impl ChangeType {
    /// A change to a plain field whose previous value is stored inline.
    pub const fn field(name: &'static str, display: &'static str, value: ValueType) -> Self {
        let identifiable = matches!(value, ValueType::Object(_));
        Self {
            name,
            display,
            minor_type: None,
            object_type: Some(value),
            identifiable,
        }
    }

    /// A change to a field whose previous value must not be recorded
    /// (credentials, for instance).
    pub const fn opaque(name: &'static str, display: &'static str) -> Self {
        Self {
            name,
            display,
            minor_type: None,
            object_type: None,
            identifiable: false,
        }
    }

    /// An addition or removal of a related object.
    pub const fn relation(name: &'static str, display: &'static str, minor: ObjectType) -> Self {
        Self {
            name,
            display,
            minor_type: Some(minor),
            object_type: None,
            identifiable: false,
        }
    }

    /// Render a human-readable description of a change of this type.
    pub fn describe(
        &self,
        additivity: Additivity,
        minor: Option<&ObjectRef>,
        before: Option<&RecordValue>,
        after: Option<&RecordValue>,
    ) -> String {
        match (additivity, minor) {
            (Additivity::Added, Some(minor)) => format!("{} added to {}", minor, self.display),
            (Additivity::Removed, Some(minor)) => {
                format!("{} removed from {}", minor, self.display)
            }
            (Additivity::Added, None) => format!("{} set", self.display),
            (Additivity::Removed, None) => format!("{} cleared", self.display),
            (Additivity::Modified, _) => match (before, after) {
                (Some(before), Some(after)) => {
                    format!("{} changed from {} to {}", self.display, before, after)
                }
                (Some(before), None) => format!("{} changed from {}", self.display, before),
                (None, Some(after)) => format!("{} set to {}", self.display, after),
                (None, None) => format!("{} changed", self.display),
            },
        }
    }
}

impl PartialEq for ChangeType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ChangeType {}

impl Hash for ChangeType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The major subject of a change.
///
/// Equality and hashing use the name only.
#[derive(Debug, Clone, Copy)]
pub struct SubjectType {
    /// Stable name, used in storage and on the wire
    pub name: &'static str,
    /// Human-readable label used in descriptions
    pub display: &'static str,
    /// Type every major subject of this kind must have
    pub major_type: ObjectType,
    /// Type of the first metadata slot, if used
    pub metadata_type1: Option<ObjectType>,
    /// Type of the second metadata slot, if used
    pub metadata_type2: Option<ObjectType>,
    /// All change types valid for this subject
    pub change_types: &'static [ChangeType],
}

/// Field changes recorded against a [`PrismsCenter`](super::PrismsCenter).
pub struct CenterChanges;

impl CenterChanges {
    pub const NAME: ChangeType = ChangeType::field("name", "name", ValueType::Text);
    pub const URL: ChangeType = ChangeType::field("url", "server URL", ValueType::Text);
    pub const SERVER_USER: ChangeType =
        ChangeType::field("serverUser", "server user name", ValueType::Text);
    pub const SERVER_PASSWORD: ChangeType = ChangeType::opaque("serverPassword", "server password");
    pub const SYNC_FREQUENCY: ChangeType =
        ChangeType::field("syncFrequency", "synchronization frequency", ValueType::Int);
    pub const CLIENT_USER: ChangeType = ChangeType::field(
        "clientUser",
        "client user",
        ValueType::Object(ObjectType::USER),
    );
    pub const CHANGE_SAVE_TIME: ChangeType =
        ChangeType::field("changeSaveTime", "modification save time", ValueType::Int);
}

/// Changes recorded against the [`AutoPurger`](super::AutoPurger) settings.
pub struct AutoPurgeChanges;

impl AutoPurgeChanges {
    pub const ENTRY_COUNT: ChangeType =
        ChangeType::field("entryCount", "maximum entry count", ValueType::Int);
    pub const AGE: ChangeType = ChangeType::field("age", "maximum age", ValueType::Int);
    pub const EXCLUDE_USER: ChangeType =
        ChangeType::relation("excludeUser", "excluded users", ObjectType::USER);
    pub const EXCLUDE_TYPES: ChangeType =
        ChangeType::field("excludeTypes", "excluded types", ValueType::Text);
}

const CENTER_CHANGES: &[ChangeType] = &[
    CenterChanges::NAME,
    CenterChanges::URL,
    CenterChanges::SERVER_USER,
    CenterChanges::SERVER_PASSWORD,
    CenterChanges::SYNC_FREQUENCY,
    CenterChanges::CLIENT_USER,
    CenterChanges::CHANGE_SAVE_TIME,
];

const AUTO_PURGE_CHANGES: &[ChangeType] = &[
    AutoPurgeChanges::ENTRY_COUNT,
    AutoPurgeChanges::AGE,
    AutoPurgeChanges::EXCLUDE_USER,
    AutoPurgeChanges::EXCLUDE_TYPES,
];

impl SubjectType {
    /// Peer center descriptors.
    pub const CENTER: SubjectType = SubjectType {
        name: "center",
        display: "center",
        major_type: ObjectType::CENTER,
        metadata_type1: None,
        metadata_type2: None,
        change_types: CENTER_CHANGES,
    };

    /// Auto-purge settings.
    pub const AUTO_PURGE: SubjectType = SubjectType {
        name: "autoPurge",
        display: "auto-purge settings",
        major_type: ObjectType::AUTO_PURGER,
        metadata_type1: None,
        metadata_type2: None,
        change_types: AUTO_PURGE_CHANGES,
    };

    /// Look up one of this subject's change types by name.
    pub fn change_type(&self, name: &str) -> Option<ChangeType> {
        self.change_types.iter().find(|c| c.name == name).copied()
    }

    /// Whether `change` is one of this subject's change types.
    pub fn owns(&self, change: &ChangeType) -> bool {
        self.change_types.iter().any(|c| c == change)
    }

    /// Whether an object of `object_type` can occupy any role in a change of
    /// this subject.
    pub fn mentions(&self, object_type: ObjectType) -> bool {
        self.major_type == object_type
            || self.metadata_type1 == Some(object_type)
            || self.metadata_type2 == Some(object_type)
            || self
                .change_types
                .iter()
                .any(|c| c.minor_type == Some(object_type))
    }

    /// Describe the creation or deletion of a subject.
    pub fn describe(&self, additivity: Additivity, major: &ObjectRef) -> String {
        match additivity {
            Additivity::Added => format!("{} {} created", self.display, major.id),
            Additivity::Removed => format!("{} {} deleted", self.display, major.id),
            Additivity::Modified => format!("{} {} modified", self.display, major.id),
        }
    }
}

impl PartialEq for SubjectType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for SubjectType {}

impl Hash for SubjectType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The `(subject, change, additivity)` triple classifying a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordType {
    subject_type: SubjectType,
    change_type: Option<ChangeType>,
    additivity: Additivity,
}

impl RecordType {
    /// Create a record type.
    ///
    /// A change type is required for modifications and must belong to the
    /// subject type.
    pub fn new(
        subject_type: SubjectType,
        change_type: Option<ChangeType>,
        additivity: Additivity,
    ) -> Result<Self> {
        match change_type {
            None if additivity.is_modification() => {
                return Err(RecordError::InvalidRecord(format!(
                    "a modification of {} requires a change type",
                    subject_type
                )));
            }
            Some(change) if !subject_type.owns(&change) => {
                return Err(RecordError::UnknownChangeType {
                    subject: subject_type.name.to_string(),
                    change: change.name.to_string(),
                });
            }
            _ => {}
        }
        Ok(Self {
            subject_type,
            change_type,
            additivity,
        })
    }

    /// The creation of a `subject_type` object.
    pub fn created(subject_type: SubjectType) -> Self {
        Self {
            subject_type,
            change_type: None,
            additivity: Additivity::Added,
        }
    }

    /// The deletion of a `subject_type` object.
    pub fn deleted(subject_type: SubjectType) -> Self {
        Self {
            subject_type,
            change_type: None,
            additivity: Additivity::Removed,
        }
    }

    pub fn subject_type(&self) -> SubjectType {
        self.subject_type
    }

    pub fn change_type(&self) -> Option<ChangeType> {
        self.change_type
    }

    pub fn additivity(&self) -> Additivity {
        self.additivity
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.change_type {
            Some(change) => write!(f, "{}/{}/{}", self.subject_type, change, self.additivity.value()),
            None => write!(f, "{}/{}", self.subject_type, self.additivity.value()),
        }
    }
}

/// The set of subject types known to a keeper.
///
/// Always contains the built-in subjects; application subjects are added
/// with [`TypeRegistry::register`].
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    subjects: Vec<SubjectType>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self {
            subjects: vec![SubjectType::CENTER, SubjectType::AUTO_PURGE],
        }
    }
}

impl TypeRegistry {
    /// A registry holding only the built-in subjects.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an application subject type. Registering the same name twice is a
    /// no-op.
    pub fn register(&mut self, subject: SubjectType) {
        if !self.subjects.contains(&subject) {
            self.subjects.push(subject);
        }
    }

    /// All registered subjects.
    pub fn subjects(&self) -> &[SubjectType] {
        &self.subjects
    }

    /// Resolve a subject type by name.
    pub fn subject(&self, name: &str) -> Result<SubjectType> {
        self.subjects
            .iter()
            .find(|s| s.name == name)
            .copied()
            .ok_or_else(|| RecordError::UnknownSubjectType(name.to_string()))
    }

    /// Resolve a change type of `subject` by name.
    pub fn change(&self, subject: &SubjectType, name: &str) -> Result<ChangeType> {
        subject
            .change_type(name)
            .ok_or_else(|| RecordError::UnknownChangeType {
                subject: subject.name.to_string(),
                change: name.to_string(),
            })
    }

    /// Resolve a record type from its stored names.
    pub fn record_type(
        &self,
        subject: &str,
        change: Option<&str>,
        additivity: i64,
    ) -> Result<RecordType> {
        let subject_type = self.subject(subject)?;
        let change_type = change
            .map(|name| self.change(&subject_type, name))
            .transpose()?;
        let additivity = Additivity::from_value(additivity).ok_or_else(|| {
            RecordError::InvalidRecord(format!("additivity {} is not one of -1, 0, 1", additivity))
        })?;
        RecordType::new(subject_type, change_type, additivity)
    }

    /// Subjects under which an object of `object_type` can appear.
    pub fn history_domains(&self, object_type: ObjectType) -> Vec<SubjectType> {
        self.subjects
            .iter()
            .filter(|s| s.mentions(object_type))
            .copied()
            .collect()
    }
}

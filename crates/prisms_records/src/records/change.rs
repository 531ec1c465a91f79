//! Change records, the immutable unit of history.
//!
//! Records reference the objects they describe through [`ObjectRef`]s (type
//! plus stable identifier) rather than holding the objects themselves. The
//! embedding application resolves identifiers lazily through its
//! [`RecordPersister`](super::RecordPersister).

use std::fmt;

use chrono::DateTime;

use super::taxonomy::{Additivity, ChangeType, ObjectType, RecordType, SubjectType, ValueType};
use super::utils::center_of;
use crate::error::{RecordError, Result};

/// A reference to an object by type and identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub object_type: ObjectType,
    pub id: i64,
}

impl ObjectRef {
    pub fn new(object_type: ObjectType, id: i64) -> Self {
        Self { object_type, id }
    }

    /// The center whose ID partition this object was created in.
    pub fn center(&self) -> i32 {
        center_of(self.id)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.object_type, self.id)
    }
}

/// A value replaced by a modification.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Milliseconds since the Unix epoch
    Time(i64),
    Object(ObjectRef),
}

impl RecordValue {
    /// Whether this value is an instance of `value_type`.
    pub fn matches(&self, value_type: ValueType) -> bool {
        match (self, value_type) {
            (RecordValue::Bool(_), ValueType::Bool)
            | (RecordValue::Int(_), ValueType::Int)
            | (RecordValue::Float(_), ValueType::Float)
            | (RecordValue::Text(_), ValueType::Text)
            | (RecordValue::Time(_), ValueType::Time) => true,
            (RecordValue::Object(obj), ValueType::Object(t)) => obj.object_type == t,
            _ => false,
        }
    }

    /// Encode as a flat string. Objects are encoded by identifier.
    pub fn to_flat(&self) -> String {
        match self {
            RecordValue::Bool(b) => b.to_string(),
            RecordValue::Int(i) => i.to_string(),
            RecordValue::Float(f) => f.to_string(),
            RecordValue::Text(s) => s.clone(),
            RecordValue::Time(t) => t.to_string(),
            RecordValue::Object(obj) => obj.id.to_string(),
        }
    }

    /// Decode a flat string produced by [`RecordValue::to_flat`].
    pub fn from_flat(value_type: ValueType, flat: &str) -> Result<Self> {
        let parse_err = |reason: String| RecordError::ValueParse {
            value: flat.to_string(),
            reason,
        };
        Ok(match value_type {
            ValueType::Bool => RecordValue::Bool(flat.parse().map_err(|e| parse_err(format!("{e}")))?),
            ValueType::Int => RecordValue::Int(flat.parse().map_err(|e| parse_err(format!("{e}")))?),
            ValueType::Float => {
                RecordValue::Float(flat.parse().map_err(|e| parse_err(format!("{e}")))?)
            }
            ValueType::Text => RecordValue::Text(flat.to_string()),
            ValueType::Time => RecordValue::Time(flat.parse().map_err(|e| parse_err(format!("{e}")))?),
            ValueType::Object(t) => RecordValue::Object(ObjectRef::new(
                t,
                flat.parse().map_err(|e| parse_err(format!("{e}")))?,
            )),
        })
    }
}

impl fmt::Display for RecordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordValue::Bool(b) => write!(f, "{}", b),
            RecordValue::Int(i) => write!(f, "{}", i),
            RecordValue::Float(v) => write!(f, "{}", v),
            RecordValue::Text(s) => write!(f, "'{}'", s),
            RecordValue::Time(t) => match DateTime::from_timestamp_millis(*t) {
                Some(dt) => write!(f, "{}", dt.to_rfc3339()),
                None => write!(f, "{}", t),
            },
            RecordValue::Object(obj) => write!(f, "{}", obj),
        }
    }
}

/// The user who caused a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordUser {
    pub id: i64,
    pub name: String,
}

impl RecordUser {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// This user as a referenceable object.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(ObjectType::USER, self.id)
    }
}

/// Everything about a change except its identity, timestamp and author.
///
/// Passed to [`RecordKeeper::persist`](super::RecordKeeper::persist), which
/// assigns the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDraft {
    pub record_type: RecordType,
    pub major_subject: ObjectRef,
    pub minor_subject: Option<ObjectRef>,
    pub previous_value: Option<RecordValue>,
    pub data1: Option<ObjectRef>,
    pub data2: Option<ObjectRef>,
}

impl ChangeDraft {
    /// A draft of the given type about `major_subject`, with no other roles
    /// filled in.
    pub fn new(record_type: RecordType, major_subject: ObjectRef) -> Self {
        Self {
            record_type,
            major_subject,
            minor_subject: None,
            previous_value: None,
            data1: None,
            data2: None,
        }
    }

    /// The creation of `major_subject`.
    pub fn created(subject_type: SubjectType, major_subject: ObjectRef) -> Self {
        Self::new(RecordType::created(subject_type), major_subject)
    }

    /// The deletion of `major_subject`.
    pub fn deleted(subject_type: SubjectType, major_subject: ObjectRef) -> Self {
        Self::new(RecordType::deleted(subject_type), major_subject)
    }

    /// A modification of one field of `major_subject`.
    pub fn modified(
        subject_type: SubjectType,
        change_type: ChangeType,
        major_subject: ObjectRef,
        previous_value: Option<RecordValue>,
    ) -> Result<Self> {
        let record_type = RecordType::new(subject_type, Some(change_type), Additivity::Modified)?;
        Ok(Self {
            previous_value,
            ..Self::new(record_type, major_subject)
        })
    }

    /// The addition or removal of `minor_subject` in a relationship of
    /// `major_subject`.
    pub fn related(
        subject_type: SubjectType,
        change_type: ChangeType,
        additivity: Additivity,
        major_subject: ObjectRef,
        minor_subject: ObjectRef,
    ) -> Result<Self> {
        let record_type = RecordType::new(subject_type, Some(change_type), additivity)?;
        Ok(Self {
            minor_subject: Some(minor_subject),
            ..Self::new(record_type, major_subject)
        })
    }

    pub fn with_data1(mut self, data1: ObjectRef) -> Self {
        self.data1 = Some(data1);
        self
    }

    pub fn with_data2(mut self, data2: ObjectRef) -> Self {
        self.data2 = Some(data2);
        self
    }

    /// Check every role against the declared types of the record type.
    pub fn validate(&self) -> Result<()> {
        let subject = self.record_type.subject_type();
        let invalid = |msg: String| Err(RecordError::InvalidRecord(msg));

        if self.major_subject.object_type != subject.major_type {
            return invalid(format!(
                "major subject {} is not a {}",
                self.major_subject, subject.major_type
            ));
        }
        check_slot("data1", subject.metadata_type1, self.data1)?;
        check_slot("data2", subject.metadata_type2, self.data2)?;

        let change = self.record_type.change_type();
        let minor_type = change.and_then(|c| c.minor_type);
        check_slot("minor subject", minor_type, self.minor_subject)?;

        if let Some(previous) = &self.previous_value {
            if !self.record_type.additivity().is_modification() {
                return invalid(format!(
                    "previous value {} given for a non-modification",
                    previous
                ));
            }
            match change.and_then(|c| c.object_type) {
                Some(value_type) if previous.matches(value_type) => {}
                Some(value_type) => {
                    return invalid(format!(
                        "previous value {} is not a {:?}",
                        previous, value_type
                    ));
                }
                None => {
                    return invalid(format!(
                        "change type {} does not record previous values",
                        self.record_type
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_slot(role: &str, declared: Option<ObjectType>, actual: Option<ObjectRef>) -> Result<()> {
    match (declared, actual) {
        (None, None) => Ok(()),
        (Some(t), Some(obj)) if obj.object_type == t => Ok(()),
        (Some(t), Some(obj)) => Err(RecordError::InvalidRecord(format!(
            "{} {} is not a {}",
            role, obj, t
        ))),
        (Some(t), None) => Err(RecordError::InvalidRecord(format!(
            "{} of type {} is required",
            role, t
        ))),
        (None, Some(obj)) => Err(RecordError::InvalidRecord(format!(
            "{} {} given but none is declared",
            role, obj
        ))),
    }
}

/// One immutable entry of history.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    id: i64,
    time: i64,
    user: RecordUser,
    draft: ChangeDraft,
}

impl ChangeRecord {
    /// Create a change record, validating every role against its type.
    pub fn new(id: i64, time: i64, user: RecordUser, draft: ChangeDraft) -> Result<Self> {
        draft.validate()?;
        Ok(Self {
            id,
            time,
            user,
            draft,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Milliseconds since the Unix epoch
    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn user(&self) -> &RecordUser {
        &self.user
    }

    pub fn record_type(&self) -> RecordType {
        self.draft.record_type
    }

    pub fn subject_type(&self) -> SubjectType {
        self.draft.record_type.subject_type()
    }

    pub fn change_type(&self) -> Option<ChangeType> {
        self.draft.record_type.change_type()
    }

    pub fn additivity(&self) -> Additivity {
        self.draft.record_type.additivity()
    }

    pub fn major_subject(&self) -> ObjectRef {
        self.draft.major_subject
    }

    pub fn minor_subject(&self) -> Option<ObjectRef> {
        self.draft.minor_subject
    }

    pub fn previous_value(&self) -> Option<&RecordValue> {
        self.draft.previous_value.as_ref()
    }

    pub fn data1(&self) -> Option<ObjectRef> {
        self.draft.data1
    }

    pub fn data2(&self) -> Option<ObjectRef> {
        self.draft.data2
    }

    /// The center that created this record.
    pub fn origin_center(&self) -> i32 {
        center_of(self.id)
    }

    /// The center owning the dataset this record modified.
    pub fn subject_center(&self) -> i32 {
        self.draft.major_subject.center()
    }

    /// Every object this record references, in role order.
    pub fn referenced_objects(&self) -> Vec<ObjectRef> {
        let mut refs = vec![self.draft.major_subject];
        refs.extend(self.draft.minor_subject);
        refs.extend(self.draft.data1);
        refs.extend(self.draft.data2);
        if let Some(RecordValue::Object(obj)) = &self.draft.previous_value {
            refs.push(*obj);
        }
        refs
    }

    /// Whether `item` occupies any role in this record.
    pub fn references(&self, item: &ObjectRef) -> bool {
        self.referenced_objects().contains(item)
    }

    /// Whether `item` is the major subject, minor subject or a metadata
    /// object of this record. Previous values do not count.
    pub fn involves(&self, item: &ObjectRef) -> bool {
        self.draft.major_subject == *item
            || self.draft.minor_subject == Some(*item)
            || self.draft.data1 == Some(*item)
            || self.draft.data2 == Some(*item)
    }

    /// Whether this record supersedes `earlier`: a later change to the same
    /// field or relationship of the same subject.
    pub fn supersedes(&self, earlier: &ChangeRecord) -> bool {
        self.time > earlier.time
            && self.id != earlier.id
            && self.subject_type() == earlier.subject_type()
            && self.change_type() == earlier.change_type()
            && self.major_subject() == earlier.major_subject()
            && self.minor_subject() == earlier.minor_subject()
            && self.additivity().is_modification() == earlier.additivity().is_modification()
    }

    /// Human-readable description of this change.
    ///
    /// `current` is the value after the change, when the caller knows it.
    pub fn describe_with(&self, current: Option<&RecordValue>) -> String {
        match self.change_type() {
            None => self
                .subject_type()
                .describe(self.additivity(), &self.draft.major_subject),
            Some(change) => {
                let text = change.describe(
                    self.additivity(),
                    self.draft.minor_subject.as_ref(),
                    self.draft.previous_value.as_ref(),
                    current,
                );
                format!("{} {}: {}", self.subject_type().display, self.draft.major_subject.id, text)
            }
        }
    }

    pub fn describe(&self) -> String {
        self.describe_with(None)
    }
}

/// A change record whose referenced types or objects could not be resolved.
///
/// Carries the raw identifiers and names so history is never silently lost.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecordError {
    pub id: i64,
    pub time: i64,
    pub user_id: i64,
    pub subject_type: String,
    pub change_type: Option<String>,
    pub additivity: i64,
    pub major_subject: Option<i64>,
    pub minor_subject: Option<i64>,
    pub data1: Option<i64>,
    pub data2: Option<i64>,
    pub previous_value: Option<String>,
    /// Why the record could not be reconstructed
    pub reason: String,
}

/// A change as read back from a keeper.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEntry {
    Record(ChangeRecord),
    Error(ChangeRecordError),
}

impl ChangeEntry {
    pub fn id(&self) -> i64 {
        match self {
            ChangeEntry::Record(r) => r.id(),
            ChangeEntry::Error(e) => e.id,
        }
    }

    pub fn time(&self) -> i64 {
        match self {
            ChangeEntry::Record(r) => r.time(),
            ChangeEntry::Error(e) => e.time,
        }
    }

    pub fn as_record(&self) -> Option<&ChangeRecord> {
        match self {
            ChangeEntry::Record(r) => Some(r),
            ChangeEntry::Error(_) => None,
        }
    }

    pub fn into_record(self) -> Option<ChangeRecord> {
        match self {
            ChangeEntry::Record(r) => Some(r),
            ChangeEntry::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ChangeEntry::Error(_))
    }
}

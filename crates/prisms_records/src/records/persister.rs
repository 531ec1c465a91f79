//! The boundary to the embedding application.
//!
//! A keeper knows how to store its own built-in objects (centers and
//! auto-purge settings). Everything else a change record references belongs
//! to the application, which describes and resolves it through a
//! [`RecordPersister`].

use super::change::{ObjectRef, RecordUser, RecordValue};
use super::taxonomy::{ChangeType, SubjectType, TypeRegistry, ValueType};
use crate::error::Result;

/// Application hooks used by record keepers.
///
/// Every method has a default suitable for an application with no subject
/// types of its own.
pub trait RecordPersister: Send + Sync {
    /// Application subject types, registered alongside the built-in ones.
    fn subject_types(&self) -> Vec<SubjectType> {
        Vec::new()
    }

    /// Resolve a user by ID.
    ///
    /// Returns `None` if the application does not know the user; the keeper
    /// then falls back to the name stored with the change.
    fn get_user(&self, _id: i64) -> Result<Option<RecordUser>> {
        Ok(None)
    }

    /// Resolve an application object referenced by a stored change.
    ///
    /// Returns `None` if the object can no longer be resolved, in which case
    /// the change is read back as a
    /// [`ChangeRecordError`](super::ChangeRecordError).
    fn resolve_object(&self, object: ObjectRef) -> Result<Option<ObjectRef>> {
        Ok(Some(object))
    }

    /// Serialize a previous value to a flat string for storage.
    fn serialize_value(&self, _change: &ChangeType, value: &RecordValue) -> Result<String> {
        Ok(value.to_flat())
    }

    /// Deserialize a previous value stored by [`serialize_value`](Self::serialize_value).
    fn deserialize_value(
        &self,
        _change: &ChangeType,
        value_type: ValueType,
        flat: &str,
    ) -> Result<RecordValue> {
        RecordValue::from_flat(value_type, flat)
    }

    /// Subject types under which `item` may appear, used for history queries.
    fn history_domains(&self, registry: &TypeRegistry, item: &ObjectRef) -> Vec<SubjectType> {
        registry.history_domains(item.object_type)
    }

    /// Called when the last change record referencing `item` has been purged,
    /// so the application may hard-delete it if it was only soft-deleted.
    fn expire_object(&self, _item: &ObjectRef) -> Result<()> {
        Ok(())
    }
}

/// A persister for keepers that only record built-in subjects.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinPersister;

impl RecordPersister for BuiltinPersister {}

/// Build the type registry for a keeper from its persister.
pub(crate) fn registry_for(persister: &dyn RecordPersister) -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    for subject in persister.subject_types() {
        registry.register(subject);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::taxonomy::ObjectType;

    struct NotesPersister;

    const NOTE: ObjectType = ObjectType("note");
    const NOTE_CHANGES: &[ChangeType] = &[ChangeType::field("body", "body", ValueType::Text)];
    const NOTE_SUBJECT: SubjectType = SubjectType {
        name: "note",
        display: "note",
        major_type: NOTE,
        metadata_type1: None,
        metadata_type2: None,
        change_types: NOTE_CHANGES,
    };

    impl RecordPersister for NotesPersister {
        fn subject_types(&self) -> Vec<SubjectType> {
            vec![NOTE_SUBJECT]
        }
    }

    #[test]
    fn test_registry_includes_application_subjects() {
        let registry = registry_for(&NotesPersister);
        assert!(registry.subject("note").is_ok());
        assert!(registry.subject("center").is_ok());

        let builtin = registry_for(&BuiltinPersister);
        assert!(builtin.subject("note").is_err());
    }

    #[test]
    fn test_default_value_serialization() {
        let value = RecordValue::Text("hello".into());
        let flat = BuiltinPersister
            .serialize_value(&NOTE_CHANGES[0], &value)
            .unwrap();
        let back = BuiltinPersister
            .deserialize_value(&NOTE_CHANGES[0], ValueType::Text, &flat)
            .unwrap();
        assert_eq!(back, value);
    }
}

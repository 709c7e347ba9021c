//! Callable classification: interpreted, foreign, or not callable.
//!
//! Wrapper layers (bound methods, partials, static/class methods, decorator
//! chains, callable instances) are peeled off up to a bounded depth. Past the
//! bound, on a cycle, or on any introspection error the object is treated as
//! not callable rather than guessed at. Plain instances of natively defined
//! classes are not callable themselves but still enter native code through
//! their class's slots.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::object_model::{NativeKind, ObjectId, ObjectModel, ObjectShape};

/// Native entry points of a foreign callable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignEntry {
    pub kind: NativeKind,
    pub addresses: Vec<u64>,
    pub declared_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    NotCallable,
    Interpreted,
    Foreign(ForeignEntry),
    /// Not callable, but an instance of a native class with these slot entries.
    NativeInstance(ForeignEntry),
}

impl Classification {
    pub fn is_callable(&self) -> bool {
        matches!(self, Classification::Interpreted | Classification::Foreign(_))
    }

    /// Native entries reached through this object, callable or not.
    pub fn foreign(&self) -> Option<&ForeignEntry> {
        match self {
            Classification::Foreign(entry) | Classification::NativeInstance(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn into_foreign(self) -> Option<ForeignEntry> {
        match self {
            Classification::Foreign(entry) | Classification::NativeInstance(entry) => Some(entry),
            _ => None,
        }
    }
}

fn foreign_entry(kind: NativeKind, mut entries: Vec<u64>, declared_name: Option<String>) -> ForeignEntry {
    entries.retain(|addr| *addr != 0);
    entries.sort_unstable();
    entries.dedup();
    ForeignEntry {
        kind,
        addresses: entries,
        declared_name,
    }
}

/// Slot entries of an instance's class, when that class is native.
fn instance_of<M: ObjectModel + ?Sized>(model: &M, class: ObjectId) -> Classification {
    match model.shape(class) {
        Ok(ObjectShape::Native {
            kind: NativeKind::Type,
            entries,
            declared_name,
        }) => Classification::NativeInstance(foreign_entry(NativeKind::Type, entries, declared_name)),
        _ => Classification::NotCallable,
    }
}

/// Classify `id`, following at most `max_unwrap` delegation layers.
pub fn classify<M: ObjectModel + ?Sized>(model: &M, id: ObjectId, max_unwrap: usize) -> Classification {
    let mut current = id;
    let mut peeled: HashSet<ObjectId> = HashSet::new();

    for _ in 0..=max_unwrap {
        let shape = match model.shape(current) {
            Ok(shape) => shape,
            Err(e) => {
                debug!(object = current, error = %e, "introspection failed; treating as not callable");
                return Classification::NotCallable;
            }
        };
        match shape {
            ObjectShape::Module { .. } | ObjectShape::Data => return Classification::NotCallable,
            ObjectShape::InterpretedFunction | ObjectShape::InterpretedClass => {
                return Classification::Interpreted
            }
            ObjectShape::Native {
                kind,
                entries,
                declared_name,
            } => return Classification::Foreign(foreign_entry(kind, entries, declared_name)),
            ObjectShape::Instance { class } => return instance_of(model, class),
            ObjectShape::Wrapper { inner: next, .. }
            | ObjectShape::CallableInstance { class: next } => {
                if !peeled.insert(current) {
                    break;
                }
                current = next;
            }
        }
    }

    debug!(object = id, max_unwrap, "unwrap bound reached; treating as not callable");
    Classification::NotCallable
}

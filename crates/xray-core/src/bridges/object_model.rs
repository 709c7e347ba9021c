//! Read-only view of an interpreter's live object graph.
//!
//! The bridge engine never touches interpreter objects directly: it asks an
//! [`ObjectModel`] for each object's representation shape and its attribute
//! references. Shapes form a small closed set so the classifier is a plain
//! match, not open-ended type dispatch.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::XrayResult;

/// Identity of an object for the lifetime of one scan (the interpreter's `id()`).
pub type ObjectId = u64;

/// Native object layouts whose entry points can be read without invoking them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeKind {
    /// Builtin function or method: the method-definition entry.
    BuiltinFunction,
    MethodDescriptor,
    WrapperDescriptor,
    MethodWrapper,
    /// Get/set descriptor: getter and setter entries.
    GetSetDescriptor,
    CythonFunction,
    /// Binding-generator function record: implementation and data entries.
    BindingFunction,
    /// Vectorised function: one entry per inner loop.
    Ufunc,
    /// FFI function pointer wrapper, usually with a declared foreign name.
    FfiPointer,
    /// Type defined by an extension module: its slot functions.
    Type,
}

/// Layers that delegate to another callable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapperKind {
    BoundMethod,
    Partial,
    StaticMethod,
    ClassMethod,
    /// Decorator chain exposing `__wrapped__`.
    Decorated,
}

/// Representation of one object as seen by the introspection layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ObjectShape {
    Module {
        file: Option<PathBuf>,
    },
    InterpretedFunction,
    InterpretedClass,
    Native {
        kind: NativeKind,
        entries: Vec<u64>,
        #[serde(default)]
        declared_name: Option<String>,
    },
    Wrapper {
        kind: WrapperKind,
        inner: ObjectId,
    },
    /// Instance whose class defines the call protocol.
    CallableInstance {
        class: ObjectId,
    },
    /// Instance without the call protocol whose class was defined by an
    /// extension module; the class's slot functions still run native code.
    Instance {
        class: ObjectId,
    },
    Data,
}

impl ObjectShape {
    pub fn is_module(&self) -> bool {
        matches!(self, ObjectShape::Module { .. })
    }
}

/// Introspection backend: a live interpreter or a recorded snapshot.
///
/// Implementations must be read-only. Any lookup that would have to run
/// interpreter code returns an error instead.
pub trait ObjectModel {
    /// Import a module by dotted name and return its identity.
    fn import_module(&self, import_name: &str) -> XrayResult<ObjectId>;

    fn shape(&self, id: ObjectId) -> XrayResult<ObjectShape>;

    /// Named references held by the object, in any order.
    fn attributes(&self, id: ObjectId) -> XrayResult<Vec<(String, ObjectId)>>;
}

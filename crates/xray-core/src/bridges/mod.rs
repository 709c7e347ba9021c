pub mod classifier;
pub mod discovery;
pub mod object_model;
pub mod recovery;
pub mod snapshot;
pub mod symbols;

pub use classifier::{classify, Classification, ForeignEntry};
pub use object_model::{NativeKind, ObjectId, ObjectModel, ObjectShape, WrapperKind};
pub use recovery::{recover_bridges, ScanRequest};
pub use snapshot::RuntimeSnapshot;
pub use symbols::{ExportedSymbol, MappedLibrary, MatchMode, Resolution, SymbolResolver};

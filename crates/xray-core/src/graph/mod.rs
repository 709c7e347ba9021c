pub mod input;
pub mod model;
pub mod stitch;

pub use input::{InterpretedCallGraph, NativeCallGraph};
pub use model::{NodeId, SerializedGraph, UnifiedGraph};
pub use stitch::{stitch, StitchInputs, StitchReport};

//! Rank fusion and document windowing.

pub mod fusion;
pub mod windowing;

pub use fusion::{FusedResult, FusionEngine, FusionWeights, fuse};
pub use windowing::{DocumentWindow, WindowConfig, Windower};

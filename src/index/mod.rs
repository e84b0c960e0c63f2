//! Index generations and the batch pipeline that builds them.

pub mod builder;
pub mod generation;

pub use builder::IndexBuilder;
pub use generation::{BuildMetadata, IndexGeneration};

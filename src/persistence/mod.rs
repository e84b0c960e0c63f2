//! Disk persistence for index generations.
//!
//! - [`format`]: checksummed blob framing shared by every binary file.
//! - [`layout`]: one directory per generation, a `CURRENT` pointer, and
//!   recovery of interrupted writes.
//!
//! The delta segment's durable log lives with the store (`store::log`) since
//! it is appended to on every update, not written once per build.

pub mod error;
pub mod format;
pub mod layout;

pub use error::{PersistenceError, PersistenceResult};
pub use layout::GenerationStore;

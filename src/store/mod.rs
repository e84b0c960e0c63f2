//! Item storage: the immutable main store of a build plus the mutable delta
//! segment that absorbs incremental updates until the next rebuild.

pub mod delta_store;
pub mod log;
pub mod segment;

pub use delta_store::DeltaStore;
pub use log::SegmentLog;
pub use segment::{
    AppendResult, DeltaSegment, ItemOverride, SegmentEntry, SegmentOp, SegmentView,
};

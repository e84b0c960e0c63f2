//! Partitioning: k-means and anchor selection.

pub mod kmeans;
pub mod selector;

pub use kmeans::{FitReport, KMeans};
pub use selector::{allocate_quotas, assign_all, nearest_anchor, AnchorSelection, AnchorSelector};

//! leann: a selective-recomputation vector index.
//!
//! Instead of storing every embedding, the index keeps a small set of
//! **anchors** (k-means centroids) in a navigable graph, and for every item
//! only the id of its owning anchor plus a product-quantized code of the
//! residual `x - anchor`. Queries find the nearest anchors through the graph,
//! rebuild approximate embeddings for those anchors' members, and score them.
//!
//! ```text
//! build:  items ─▶ anchors (k-means) ─▶ graph (HNSW | Vamana) ─▶ PQ codebooks ─▶ delta store
//! query:  q ─▶ top-C anchors ─▶ members ─▶ anchor + decode(code) ─▶ score ─▶ top-k (─▶ rerank)
//! update: item ─▶ nearest anchor ─▶ encode ─▶ delta segment      (graph untouched until rebuild)
//! ```
//!
//! - [`partitioning`]: anchor selection (k-means, grouped quotas).
//! - [`graph`]: HNSW, in-memory Vamana, and disk-resident Vamana over anchors.
//! - [`quantization`]: residual product quantization and code packing.
//! - [`store`]: the immutable delta store and the append-only delta segment.
//! - [`index`]: build pipeline and the immutable [`IndexGeneration`].
//! - [`query`]: the query engine.
//! - [`update`]: incremental updates and atomic rebuilds.
//! - [`health`]: validation metrics and on-disk validation.
//! - [`persistence`]: generation directories, framing, crash recovery.
//!
//! # Cosine and normalization
//!
//! Under [`Metric::Cosine`] every vector is unit-normalized on the way in, so
//! anchors live on the same scale as items and a reconstruction `x̂` of `x`
//! satisfies `cos(x, x̂) ≥ 1 - ‖x - x̂‖ / ‖x‖`.
//!
//! # Example
//!
//! ```rust,ignore
//! use leann::{IndexBuilder, IndexHandle, LeannConfig, QueryEngine, QueryRequest};
//!
//! let config = LeannConfig::with_dimension(128);
//! let generation = IndexBuilder::new(&config).build(items)?;
//! let engine = QueryEngine::new(IndexHandle::new(generation));
//! let hits = engine.search(&QueryRequest::vector(query).top_k(10))?;
//! ```

pub mod cancel;
pub mod collab;
pub mod config;
pub mod distance;
pub mod error;
pub mod eval;
pub mod graph;
pub mod handle;
pub mod health;
pub mod index;
pub mod partitioning;
pub mod persistence;
pub mod quantization;
pub mod query;
pub mod store;
pub mod types;
pub mod update;

pub use cancel::CancelToken;
pub use collab::{Embedder, GuardedEmbedder, GuardedReranker, Reranker};
pub use config::{GraphBackend, LeannConfig, TimeoutPolicy};
pub use distance::Metric;
pub use error::{ErrorClass, LeannError, Result};
pub use handle::IndexHandle;
pub use health::{validate_store, HealthIssue, HealthReport, HealthStatus, ValidationOutcome};
pub use index::{IndexBuilder, IndexGeneration};
pub use persistence::GenerationStore;
pub use query::{QueryEngine, QueryFilters, QueryHit, QueryRequest, QueryResponse};
pub use types::{AnchorId, DeltaRecord, Item, ItemId, ItemMetadata, NewItem};
pub use update::{DiffRequest, GrowthStats, RebuildTrigger, UpdateManager};

//! Core data model: items, their metadata, and compressed delta records.

use serde::{Deserialize, Serialize};

/// External item identifier.
pub type ItemId = u64;

/// Anchor identifier. Anchor ids are also graph node ids.
pub type AnchorId = u32;

/// Descriptive tags carried by every item.
///
/// `text` is the item content. It is kept so a rebuild can re-embed the item
/// and so the rerank stage has something to score.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub path: String,
    pub kind: Option<String>,
    pub language: Option<String>,
    pub text: Option<String>,
}

impl ItemMetadata {
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    #[must_use]
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// An item at ingestion time. The embedding is dropped once encoded.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: ItemId,
    pub embedding: Vec<f32>,
    pub metadata: ItemMetadata,
}

impl Item {
    pub fn new(id: ItemId, embedding: Vec<f32>, metadata: ItemMetadata) -> Self {
        Self {
            id,
            embedding,
            metadata,
        }
    }
}

/// An item that still needs embedding, or that already carries a vector.
#[derive(Debug, Clone)]
pub enum ItemSource {
    Text(String),
    Vector(Vec<f32>),
}

/// A pending add or change submitted to the update manager.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub id: ItemId,
    pub source: ItemSource,
    pub metadata: ItemMetadata,
}

impl NewItem {
    /// Item whose embedding is computed from `metadata.text` (or the given text).
    pub fn from_text(id: ItemId, text: impl Into<String>, metadata: ItemMetadata) -> Self {
        let text = text.into();
        let metadata = ItemMetadata {
            text: Some(text.clone()),
            ..metadata
        };
        Self {
            id,
            source: ItemSource::Text(text),
            metadata,
        }
    }

    pub fn from_vector(id: ItemId, embedding: Vec<f32>, metadata: ItemMetadata) -> Self {
        Self {
            id,
            source: ItemSource::Vector(embedding),
            metadata,
        }
    }
}

/// Persisted per-item record: owning anchor plus the PQ code of the residual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub item_id: ItemId,
    pub anchor_id: AnchorId,
    pub code: Vec<u8>,
    pub metadata: ItemMetadata,
}

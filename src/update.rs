//! Incremental updates and generation rebuilds.
//!
//! Adds, changes and removals are encoded against the active generation's
//! anchors and codebooks and appended to its delta segment, so they are
//! queryable immediately. The anchor graph never changes between builds.
//!
//! A rebuild gathers the live corpus, builds generation `v + 1` off to the
//! side, seals the old segment, replays whatever was appended during the
//! build into the new one, persists it, and swaps the active pointer. Any
//! failure before the swap leaves the previous generation serving.
//!
//! ```text
//! snapshot(high_water) ──build──▶ next ──seal old──▶ replay (high_water..] ──▶ persist ──▶ swap
//! ```

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::collab::GuardedEmbedder;
use crate::config::UpdateConfig;
use crate::error::{LeannError, Result};
use crate::handle::IndexHandle;
use crate::health::{HealthIssue, HealthReport};
use crate::index::{IndexBuilder, IndexGeneration};
use crate::persistence::GenerationStore;
use crate::store::{AppendResult, SegmentOp};
use crate::types::{DeltaRecord, Item, ItemId, ItemMetadata, ItemSource, NewItem};

/// How often an append retries after finding its segment sealed.
const SEALED_RETRIES: usize = 3;

/// Size of the delta segment relative to the main store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthStats {
    /// Distinct items added, changed or removed since the last build.
    pub segment_items: usize,
    pub main_items: usize,
    pub ratio: f32,
}

impl GrowthStats {
    pub fn new(segment_items: usize, main_items: usize) -> Self {
        Self {
            segment_items,
            main_items,
            ratio: segment_items as f32 / main_items.max(1) as f32,
        }
    }

    /// Whether either growth limit is exceeded.
    pub fn exceeds(&self, config: &UpdateConfig) -> bool {
        self.segment_items > config.delta_index_threshold || self.ratio > config.max_delta_ratio
    }
}

/// Why a rebuild runs.
#[derive(Debug, Clone, PartialEq)]
pub enum RebuildTrigger {
    DeltaThreshold(GrowthStats),
    Schedule { elapsed: Duration },
    Explicit,
    /// Health fell below a configured minimum.
    Health {
        health_score: f32,
        issues: Vec<HealthIssue>,
    },
}

/// Per-item results of a batch. One bad item never fails the others.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: Vec<ItemId>,
    pub failed: Vec<(ItemId, LeannError)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Changes computed by an external differ (e.g. a file watcher).
#[derive(Debug, Clone, Default)]
pub struct DiffRequest {
    pub added: Vec<NewItem>,
    pub changed: Vec<NewItem>,
    pub removed: Vec<ItemId>,
}

#[derive(Debug, Default)]
pub struct DiffOutcome {
    pub upserts: BatchOutcome,
    pub removed: Vec<ItemId>,
    /// Removal requests for ids the index does not hold.
    pub unknown: Vec<ItemId>,
}

#[derive(Debug, Clone)]
pub struct RebuildOutcome {
    pub trigger: RebuildTrigger,
    pub previous: u64,
    pub version: u64,
    pub items: usize,
    pub re_embedded: usize,
    /// Items rebuilt from their reconstruction because no text or embedder
    /// was available.
    pub approximated: usize,
    /// Segment entries appended during the build and carried over.
    pub replayed: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct RebuildState {
    last_rebuild: Instant,
}

/// Applies updates to the generation behind an [`IndexHandle`].
#[derive(Debug)]
pub struct UpdateManager {
    handle: IndexHandle,
    embedder: Option<GuardedEmbedder>,
    store: Option<GenerationStore>,
    cancel: CancelToken,
    rebuild: Mutex<RebuildState>,
}

impl UpdateManager {
    pub fn new(handle: IndexHandle) -> Self {
        Self {
            handle,
            embedder: None,
            store: None,
            cancel: CancelToken::new(),
            rebuild: Mutex::new(RebuildState {
                last_rebuild: Instant::now(),
            }),
        }
    }

    pub fn with_embedder(mut self, embedder: GuardedEmbedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Persist rebuilt generations under `store` before activating them.
    pub fn with_store(mut self, store: GenerationStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn handle(&self) -> &IndexHandle {
        &self.handle
    }

    pub fn growth(&self) -> Result<GrowthStats> {
        Ok(self.handle.require()?.growth())
    }

    /// Add or replace one item. Queryable once this returns.
    pub fn add(&self, item: NewItem) -> Result<u64> {
        let (id, embedding, metadata) = self.materialize(item)?;
        self.upsert(id, embedding, metadata)
    }

    /// Add many items, embedding text in batches. Failures are per item.
    pub fn add_batch(&self, items: Vec<NewItem>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for result in self.materialize_batch(items) {
            match result {
                Ok((id, embedding, metadata)) => match self.upsert(id, embedding, metadata) {
                    Ok(_) => outcome.applied.push(id),
                    Err(e) => outcome.failed.push((id, e)),
                },
                Err((id, e)) => outcome.failed.push((id, e)),
            }
        }
        if !outcome.failed.is_empty() {
            warn!(
                applied = outcome.applied.len(),
                failed = outcome.failed.len(),
                "batch add partially failed"
            );
        }
        outcome
    }

    /// Tombstone `id`. Returns `false` if the index does not hold it.
    pub fn remove(&self, id: ItemId) -> Result<bool> {
        let seq = self.append_with_retry(|generation| {
            if !generation.contains_live(id) {
                return Ok(None);
            }
            Ok(Some(SegmentOp::Tombstone(id)))
        })?;
        if seq.is_none() {
            debug!(id, "remove of unknown item");
        }
        Ok(seq.is_some())
    }

    /// Apply an externally computed diff. The anchor graph is untouched.
    pub fn diff_update(&self, diff: DiffRequest) -> Result<DiffOutcome> {
        let DiffRequest {
            added,
            changed,
            removed,
        } = diff;
        let mut outcome = DiffOutcome::default();
        for id in removed {
            if self.remove(id)? {
                outcome.removed.push(id);
            } else {
                outcome.unknown.push(id);
            }
        }
        let mut upserts = added;
        upserts.extend(changed);
        outcome.upserts = self.add_batch(upserts);
        info!(
            upserts = outcome.upserts.applied.len(),
            failed = outcome.upserts.failed.len(),
            removed = outcome.removed.len(),
            unknown = outcome.unknown.len(),
            "diff applied"
        );
        Ok(outcome)
    }

    /// Triggers that currently call for a rebuild. `health` adds a health
    /// trigger when `rebuild_on_unhealthy` is set and a minimum is missed.
    pub fn rebuild_triggers(&self, health: Option<&HealthReport>) -> Result<Vec<RebuildTrigger>> {
        let generation = self.handle.require()?;
        let config = &generation.config().update;
        let mut triggers = Vec::new();

        let growth = generation.growth();
        if growth.exceeds(config) {
            triggers.push(RebuildTrigger::DeltaThreshold(growth));
        }
        if let Some(interval) = config.rebuild_interval() {
            let elapsed = self.rebuild.lock().last_rebuild.elapsed();
            if elapsed >= interval {
                triggers.push(RebuildTrigger::Schedule { elapsed });
            }
        }
        if let Some(report) = health {
            if config.rebuild_on_unhealthy && report.below_minimums() {
                triggers.push(RebuildTrigger::Health {
                    health_score: report.health_score,
                    issues: report.breached_minimums(),
                });
            }
        }
        Ok(triggers)
    }

    /// Rebuild if any trigger fires. Health is assessed only when the
    /// configuration allows health-triggered rebuilds.
    pub fn maybe_rebuild(&self) -> Result<Option<RebuildOutcome>> {
        let Some(generation) = self.handle.snapshot() else {
            return Ok(None);
        };
        let health = if generation.config().update.rebuild_on_unhealthy {
            Some(HealthReport::assess(&generation)?)
        } else {
            None
        };
        drop(generation);
        match self.rebuild_triggers(health.as_ref())?.into_iter().next() {
            Some(trigger) => self.rebuild(trigger).map(Some),
            None => Ok(None),
        }
    }

    /// Build and activate the next generation. Serialised with other rebuilds.
    pub fn rebuild(&self, trigger: RebuildTrigger) -> Result<RebuildOutcome> {
        let mut state = self.rebuild.lock();
        let start = Instant::now();
        let current = self.handle.require()?;
        info!(version = current.version(), ?trigger, "rebuild started");

        let (records, high_water) = current.live_snapshot();
        if records.is_empty() {
            return Err(LeannError::build("live corpus is empty"));
        }
        let (items, re_embedded, approximated) = self.gather(&current, records)?;
        let item_count = items.len();

        let mut version = current.version() + 1;
        if let Some(store) = &self.store {
            if let Some(latest) = store.latest_version()? {
                version = version.max(latest + 1);
            }
        }
        let config = current.config().clone();
        let next = IndexBuilder::new(&config)
            .with_version(version)
            .with_cancel(&self.cancel)
            .with_approximated(approximated)
            .build(items)?;

        current.segment().seal();
        let finished = self.carry_over(&current, next, high_water);
        let (next, replayed) = match finished {
            Ok(done) => done,
            Err(e) => {
                current.segment().unseal();
                warn!(version, error = %e, "rebuild abandoned, previous generation stays active");
                return Err(e);
            }
        };

        self.handle.install(next);
        state.last_rebuild = Instant::now();
        let outcome = RebuildOutcome {
            trigger,
            previous: current.version(),
            version,
            items: item_count,
            re_embedded,
            approximated,
            replayed,
            elapsed: start.elapsed(),
        };
        info!(
            version,
            items = item_count,
            re_embedded,
            approximated,
            replayed,
            elapsed = ?outcome.elapsed,
            "rebuild complete"
        );
        Ok(outcome)
    }

    /// Replay entries appended after `high_water` into `next` and persist it.
    fn carry_over(
        &self,
        current: &IndexGeneration,
        next: IndexGeneration,
        high_water: u64,
    ) -> Result<(IndexGeneration, usize)> {
        let pending = current.segment().entries_after(high_water);
        for entry in &pending {
            let op = match &entry.op {
                SegmentOp::Upsert(record) => {
                    let embedding = self.rematerialize(current, record)?;
                    SegmentOp::Upsert(next.encode(
                        record.item_id,
                        embedding,
                        record.metadata.clone(),
                    )?)
                }
                SegmentOp::Tombstone(id) => SegmentOp::Tombstone(*id),
            };
            next.segment().replay(op)?;
        }
        let next = match &self.store {
            Some(store) => store.publish(&next)?,
            None => next,
        };
        Ok((next, pending.len()))
    }

    /// Full-precision vectors for a rebuild: re-embedded text where possible,
    /// reconstructions otherwise.
    fn gather(
        &self,
        current: &IndexGeneration,
        records: Vec<DeltaRecord>,
    ) -> Result<(Vec<Item>, usize, usize)> {
        let (with_text, without_text): (Vec<DeltaRecord>, Vec<DeltaRecord>) = records
            .into_iter()
            .partition(|r| self.embedder.is_some() && r.metadata.text.is_some());

        let mut items = Vec::with_capacity(with_text.len() + without_text.len());
        if let Some(embedder) = &self.embedder {
            if !with_text.is_empty() {
                let texts: Vec<String> = with_text
                    .iter()
                    .filter_map(|r| r.metadata.text.clone())
                    .collect();
                let vectors = embedder
                    .embed(&texts)
                    .map_err(|e| LeannError::build(format!("re-embedding failed: {e}")))?;
                for (record, embedding) in with_text.into_iter().zip(vectors) {
                    items.push(Item::new(record.item_id, embedding, record.metadata));
                }
            }
        }
        let re_embedded = items.len();

        let approximated = without_text.len();
        if approximated > 0 {
            warn!(
                items = approximated,
                "rebuilding items from reconstructed embeddings"
            );
        }
        for record in without_text {
            let embedding = current.reconstruct(&record)?;
            items.push(Item::new(record.item_id, embedding, record.metadata));
        }
        Ok((items, re_embedded, approximated))
    }

    fn rematerialize(&self, current: &IndexGeneration, record: &DeltaRecord) -> Result<Vec<f32>> {
        match (&self.embedder, &record.metadata.text) {
            (Some(embedder), Some(text)) => embedder.embed_one(text),
            _ => current.reconstruct(record),
        }
    }

    fn materialize(&self, item: NewItem) -> Result<(ItemId, Vec<f32>, ItemMetadata)> {
        let NewItem {
            id,
            source,
            metadata,
        } = item;
        let embedding = match source {
            ItemSource::Vector(v) => v,
            ItemSource::Text(text) => self.require_embedder()?.embed_one(&text)?,
        };
        Ok((id, embedding, metadata))
    }

    /// Embed every text item in one batched call, falling back to per-item
    /// calls if the batch fails so one bad input cannot sink the rest.
    #[allow(clippy::type_complexity)]
    fn materialize_batch(
        &self,
        items: Vec<NewItem>,
    ) -> Vec<std::result::Result<(ItemId, Vec<f32>, ItemMetadata), (ItemId, LeannError)>> {
        let texts: Vec<String> = items
            .iter()
            .filter_map(|item| match &item.source {
                ItemSource::Text(t) => Some(t.clone()),
                ItemSource::Vector(_) => None,
            })
            .collect();
        let batched = match (&self.embedder, texts.is_empty()) {
            (Some(embedder), false) => match embedder.embed(&texts) {
                Ok(vectors) => Some(vectors.into_iter()),
                Err(e) => {
                    warn!(items = texts.len(), error = %e, "batch embedding failed, retrying per item");
                    None
                }
            },
            _ => None,
        };

        match batched {
            Some(mut vectors) => items
                .into_iter()
                .map(|item| {
                    let NewItem {
                        id,
                        source,
                        metadata,
                    } = item;
                    match source {
                        ItemSource::Vector(v) => Ok((id, v, metadata)),
                        ItemSource::Text(_) => vectors
                            .next()
                            .map(|v| (id, v, metadata))
                            .ok_or((id, LeannError::Unavailable("embedding missing".to_string()))),
                    }
                })
                .collect(),
            None => items
                .into_iter()
                .map(|item| {
                    let id = item.id;
                    self.materialize(item).map_err(|e| (id, e))
                })
                .collect(),
        }
    }

    fn require_embedder(&self) -> Result<&GuardedEmbedder> {
        self.embedder
            .as_ref()
            .ok_or_else(|| LeannError::Unavailable("no embedder configured".to_string()))
    }

    fn upsert(&self, id: ItemId, embedding: Vec<f32>, metadata: ItemMetadata) -> Result<u64> {
        let seq = self.append_with_retry(|generation| {
            let record = generation.encode(id, embedding.clone(), metadata.clone())?;
            Ok(Some(SegmentOp::Upsert(record)))
        })?;
        seq.ok_or_else(|| LeannError::build(format!("item {id} was not appended")))
    }

    /// Append the op built by `make_op` to the active segment. A sealed
    /// segment means a rebuild is swapping generations: wait for it and
    /// retry against whatever is active afterwards.
    fn append_with_retry<F>(&self, make_op: F) -> Result<Option<u64>>
    where
        F: Fn(&IndexGeneration) -> Result<Option<SegmentOp>>,
    {
        for attempt in 0..=SEALED_RETRIES {
            let generation = self.handle.require()?;
            let Some(op) = make_op(&generation)? else {
                return Ok(None);
            };
            match generation.segment().append(op)? {
                AppendResult::Appended(seq) => return Ok(Some(seq)),
                AppendResult::Sealed => {
                    debug!(attempt, version = generation.version(), "segment sealed, retrying");
                    drop(generation);
                    drop(self.rebuild.lock());
                }
            }
        }
        Err(LeannError::Unavailable(
            "delta segment stayed sealed across retries".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnchorConfig, LeannConfig, QuantizerConfig};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn config() -> LeannConfig {
        let mut config = LeannConfig::with_dimension(16);
        config.anchors = AnchorConfig {
            count: 8,
            ..AnchorConfig::default()
        };
        config.quantizer = QuantizerConfig {
            sub_vectors: 4,
            codebook_size: 16,
            training_samples: 512,
            validation_samples: 64,
            ..QuantizerConfig::default()
        };
        config.update.delta_index_threshold = 5;
        config.update.max_delta_ratio = 1.0;
        config
    }

    fn vector(rng: &mut StdRng) -> Vec<f32> {
        (0..16).map(|_| rng.random::<f32>() - 0.5).collect()
    }

    fn manager(n: u64) -> UpdateManager {
        let mut rng = StdRng::seed_from_u64(9);
        let items = (0..n)
            .map(|id| {
                Item::new(
                    id,
                    vector(&mut rng),
                    ItemMetadata::with_path(format!("src/{id}.rs")),
                )
            })
            .collect();
        let generation = IndexBuilder::new(&config()).build(items).unwrap();
        UpdateManager::new(IndexHandle::new(generation))
    }

    #[test]
    fn growth_ratio_handles_empty_main() {
        let g = GrowthStats::new(3, 0);
        assert_eq!(g.ratio, 3.0);
        let cfg = UpdateConfig {
            delta_index_threshold: 100,
            ..UpdateConfig::default()
        };
        assert!(GrowthStats::new(101, 10_000).exceeds(&cfg));
        assert!(!GrowthStats::new(100, 10_000).exceeds(&cfg));
    }

    #[test]
    fn add_then_remove() {
        let m = manager(200);
        let mut rng = StdRng::seed_from_u64(1);
        m.add(NewItem::from_vector(
            1000,
            vector(&mut rng),
            ItemMetadata::with_path("new.rs"),
        ))
        .unwrap();
        let generation = m.handle().require().unwrap();
        assert!(generation.contains_live(1000));
        assert!(m.remove(1000).unwrap());
        assert!(!generation.contains_live(1000));
        assert!(!m.remove(1000).unwrap());
        assert!(!m.remove(99_999).unwrap());
    }

    #[test]
    fn text_items_need_an_embedder() {
        let m = manager(50);
        let err = m
            .add(NewItem::from_text(7, "fn main() {}", ItemMetadata::with_path("a.rs")))
            .unwrap_err();
        assert!(matches!(err, LeannError::Unavailable(_)));
    }

    #[test]
    fn batch_isolates_bad_items() {
        let m = manager(50);
        let mut rng = StdRng::seed_from_u64(2);
        let outcome = m.add_batch(vec![
            NewItem::from_vector(500, vector(&mut rng), ItemMetadata::default()),
            NewItem::from_vector(501, vec![1.0; 3], ItemMetadata::default()),
            NewItem::from_vector(502, vector(&mut rng), ItemMetadata::default()),
        ]);
        assert_eq!(outcome.applied, vec![500, 502]);
        assert_eq!(outcome.failed.len(), 1);
        assert!(matches!(
            outcome.failed[0],
            (501, LeannError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn threshold_trigger_fires_after_enough_updates() {
        let m = manager(100);
        assert!(m.rebuild_triggers(None).unwrap().is_empty());
        for id in 0..6 {
            assert!(m.remove(id).unwrap());
        }
        let triggers = m.rebuild_triggers(None).unwrap();
        assert!(matches!(
            triggers.as_slice(),
            [RebuildTrigger::DeltaThreshold(g)] if g.segment_items == 6
        ));
    }

    #[test]
    fn rebuild_folds_segment_into_next_generation() {
        let m = manager(120);
        let mut rng = StdRng::seed_from_u64(3);
        m.add(NewItem::from_vector(
            777,
            vector(&mut rng),
            ItemMetadata::with_path("added.rs"),
        ))
        .unwrap();
        m.remove(3).unwrap();

        let outcome = m.rebuild(RebuildTrigger::Explicit).unwrap();
        assert_eq!(outcome.previous, 1);
        assert_eq!(outcome.version, 2);
        assert_eq!(outcome.items, 120);
        assert_eq!(outcome.approximated, 120);

        let next = m.handle().require().unwrap();
        assert_eq!(next.version(), 2);
        assert!(next.segment().is_empty());
        assert!(next.store().contains(777));
        assert!(!next.store().contains(3));
        assert_eq!(next.metadata().approximated_items, 120);
    }

    #[test]
    fn cancelled_rebuild_keeps_previous_generation() {
        let cancel = CancelToken::new();
        let m = manager(80).with_cancel(cancel.clone());
        m.remove(1).unwrap();
        cancel.cancel();
        assert!(matches!(
            m.rebuild(RebuildTrigger::Explicit),
            Err(LeannError::Cancelled)
        ));
        let generation = m.handle().require().unwrap();
        assert_eq!(generation.version(), 1);
        assert!(!generation.segment().is_sealed());
        assert!(m.remove(2).unwrap());
    }
}

//! Delta segment: append-only upserts and tombstones since the last full build.
//!
//! Entries carry a strictly increasing sequence number. For any item id the
//! latest entry wins and supersedes whatever the main store holds.
//!
//! A segment is sealed when a rebuild takes over its entries. Appends to a
//! sealed segment report [`AppendResult::Sealed`] so the caller can retry
//! against the generation that replaced it.

use std::collections::{BTreeSet, HashMap};

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use super::log::SegmentLog;
use crate::error::Result;
use crate::types::{AnchorId, DeltaRecord, ItemId};

/// A single mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentOp {
    Upsert(DeltaRecord),
    Tombstone(ItemId),
}

impl SegmentOp {
    pub fn item_id(&self) -> ItemId {
        match self {
            SegmentOp::Upsert(r) => r.item_id,
            SegmentOp::Tombstone(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub seq: u64,
    pub op: SegmentOp,
}

/// Outcome of [`DeltaSegment::append`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Appended(u64),
    /// A rebuild owns this segment; retry on the active generation.
    Sealed,
}

/// What the segment says about one item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ItemOverride<'a> {
    Live(&'a DeltaRecord),
    Removed,
}

#[derive(Debug, Default)]
struct SegmentInner {
    entries: Vec<SegmentEntry>,
    /// Item id -> index of its latest entry.
    latest: HashMap<ItemId, usize>,
    /// Live upserted members per anchor.
    by_anchor: HashMap<AnchorId, BTreeSet<ItemId>>,
    last_seq: u64,
    sealed: bool,
    log: Option<SegmentLog>,
}

impl SegmentInner {
    fn apply(&mut self, entry: SegmentEntry) {
        let id = entry.op.item_id();
        if let Some(&prev) = self.latest.get(&id) {
            if let SegmentOp::Upsert(old) = &self.entries[prev].op {
                if let Some(members) = self.by_anchor.get_mut(&old.anchor_id) {
                    members.remove(&id);
                }
            }
        }
        if let SegmentOp::Upsert(record) = &entry.op {
            self.by_anchor
                .entry(record.anchor_id)
                .or_default()
                .insert(id);
        }
        self.last_seq = self.last_seq.max(entry.seq);
        self.latest.insert(id, self.entries.len());
        self.entries.push(entry);
    }

    fn lookup(&self, id: ItemId) -> Option<ItemOverride<'_>> {
        let &idx = self.latest.get(&id)?;
        Some(match &self.entries[idx].op {
            SegmentOp::Upsert(r) => ItemOverride::Live(r),
            SegmentOp::Tombstone(_) => ItemOverride::Removed,
        })
    }
}

/// Shared, lock-guarded delta segment of one generation.
#[derive(Debug, Default)]
pub struct DeltaSegment {
    inner: RwLock<SegmentInner>,
}

impl DeltaSegment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild in-memory state from replayed entries.
    pub fn from_entries(entries: impl IntoIterator<Item = SegmentEntry>) -> Self {
        let mut inner = SegmentInner::default();
        for entry in entries {
            inner.apply(entry);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Mirror future appends into `log`.
    pub fn attach_log(&self, log: SegmentLog) {
        self.inner.write().log = Some(log);
    }

    /// Append `op` with the next sequence number.
    ///
    /// With a log attached the entry is durable before it becomes visible.
    pub fn append(&self, op: SegmentOp) -> Result<AppendResult> {
        let mut inner = self.inner.write();
        if inner.sealed {
            return Ok(AppendResult::Sealed);
        }
        let entry = SegmentEntry {
            seq: inner.last_seq + 1,
            op,
        };
        if let Some(log) = inner.log.as_mut() {
            log.append(&entry)?;
        }
        let seq = entry.seq;
        inner.apply(entry);
        Ok(AppendResult::Appended(seq))
    }

    /// Replay an entry taken from another segment, keeping its payload but
    /// assigning a local sequence number.
    pub(crate) fn replay(&self, op: SegmentOp) -> Result<u64> {
        match self.append(op)? {
            AppendResult::Appended(seq) => Ok(seq),
            AppendResult::Sealed => Err(crate::persistence::PersistenceError::InvalidState(
                "replay into a sealed segment".to_string(),
            )
            .into()),
        }
    }

    /// Stop accepting appends. Returns the last sequence number.
    pub fn seal(&self) -> u64 {
        let mut inner = self.inner.write();
        inner.sealed = true;
        inner.last_seq
    }

    /// Reopen after an abandoned rebuild.
    pub fn unseal(&self) {
        self.inner.write().sealed = false;
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.read().sealed
    }

    /// Entries with `seq > after`, in order.
    pub fn entries_after(&self, after: u64) -> Vec<SegmentEntry> {
        let inner = self.inner.read();
        let start = inner.entries.partition_point(|e| e.seq <= after);
        inner.entries[start..].to_vec()
    }

    pub fn entries(&self) -> Vec<SegmentEntry> {
        self.inner.read().entries.clone()
    }

    /// Read view for expansion and lookups. Appends block while it is held.
    pub fn view(&self) -> SegmentView<'_> {
        SegmentView {
            inner: self.inner.read(),
        }
    }

    /// Distinct items touched since the last build.
    pub fn pending_items(&self) -> usize {
        self.inner.read().latest.len()
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.read().last_seq
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

/// Consistent read-only view of a segment.
pub struct SegmentView<'a> {
    inner: RwLockReadGuard<'a, SegmentInner>,
}

impl SegmentView<'_> {
    pub fn lookup(&self, id: ItemId) -> Option<ItemOverride<'_>> {
        self.inner.lookup(id)
    }

    /// Whether the segment supersedes the main store for `id`.
    pub fn touches(&self, id: ItemId) -> bool {
        self.inner.latest.contains_key(&id)
    }

    /// Live upserts assigned to `anchor`, by ascending item id.
    pub fn live_members(&self, anchor: AnchorId) -> impl Iterator<Item = &DeltaRecord> + '_ {
        self.inner
            .by_anchor
            .get(&anchor)
            .into_iter()
            .flatten()
            .filter_map(|id| match self.inner.lookup(*id) {
                Some(ItemOverride::Live(r)) => Some(r),
                _ => None,
            })
    }

    /// Every live upsert, by ascending item id.
    pub fn live_records(&self) -> Vec<&DeltaRecord> {
        let mut out: Vec<&DeltaRecord> = self
            .inner
            .latest
            .keys()
            .filter_map(|id| match self.inner.lookup(*id) {
                Some(ItemOverride::Live(r)) => Some(r),
                _ => None,
            })
            .collect();
        out.sort_by_key(|r| r.item_id);
        out
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.last_seq
    }

    pub fn pending_items(&self) -> usize {
        self.inner.latest.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemMetadata;

    fn record(id: ItemId, anchor: AnchorId) -> DeltaRecord {
        DeltaRecord {
            item_id: id,
            anchor_id: anchor,
            code: vec![0, 1],
            metadata: ItemMetadata::with_path(format!("{id}.rs")),
        }
    }

    fn appended(r: AppendResult) -> u64 {
        match r {
            AppendResult::Appended(seq) => seq,
            AppendResult::Sealed => panic!("segment unexpectedly sealed"),
        }
    }

    #[test]
    fn sequence_numbers_increase() {
        let seg = DeltaSegment::new();
        let a = appended(seg.append(SegmentOp::Upsert(record(1, 0))).unwrap());
        let b = appended(seg.append(SegmentOp::Tombstone(2)).unwrap());
        assert!(b > a);
        assert_eq!(seg.last_seq(), b);
    }

    #[test]
    fn latest_entry_wins() {
        let seg = DeltaSegment::new();
        let _ = seg.append(SegmentOp::Upsert(record(7, 0))).unwrap();
        let _ = seg.append(SegmentOp::Upsert(record(7, 3))).unwrap();
        {
            let view = seg.view();
            assert_eq!(view.live_members(0).count(), 0);
            assert_eq!(view.live_members(3).map(|r| r.item_id).collect::<Vec<_>>(), vec![7]);
        }

        let _ = seg.append(SegmentOp::Tombstone(7)).unwrap();
        let view = seg.view();
        assert_eq!(view.lookup(7), Some(ItemOverride::Removed));
        assert_eq!(view.live_members(3).count(), 0);
        assert!(view.touches(7));
        assert_eq!(view.pending_items(), 1);
    }

    #[test]
    fn sealed_segment_rejects_appends() {
        let seg = DeltaSegment::new();
        let _ = seg.append(SegmentOp::Upsert(record(1, 0))).unwrap();
        let high = seg.seal();
        assert_eq!(
            seg.append(SegmentOp::Tombstone(1)).unwrap(),
            AppendResult::Sealed
        );
        seg.unseal();
        let seq = appended(seg.append(SegmentOp::Tombstone(1)).unwrap());
        assert_eq!(seg.entries_after(high).len(), 1);
        assert_eq!(seg.entries_after(high)[0].seq, seq);
    }

    #[test]
    fn from_entries_restores_state() {
        let seg = DeltaSegment::new();
        let _ = seg.append(SegmentOp::Upsert(record(1, 2))).unwrap();
        let _ = seg.append(SegmentOp::Upsert(record(2, 2))).unwrap();
        let _ = seg.append(SegmentOp::Tombstone(1)).unwrap();

        let restored = DeltaSegment::from_entries(seg.entries());
        assert_eq!(restored.last_seq(), 3);
        let view = restored.view();
        let ids: Vec<ItemId> = view.live_records().iter().map(|r| r.item_id).collect();
        assert_eq!(ids, vec![2]);
    }
}

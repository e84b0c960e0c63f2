//! Main delta store: one [`DeltaRecord`] per item of the last full build.

use std::collections::HashMap;

use crate::error::{LeannError, Result};
use crate::types::{AnchorId, DeltaRecord, ItemId};

/// Immutable item table with per-anchor member lists.
#[derive(Debug, Default)]
pub struct DeltaStore {
    /// Sorted by item id.
    records: Vec<DeltaRecord>,
    index: HashMap<ItemId, usize>,
    /// `members[anchor]` = positions in `records`, ascending item id.
    members: Vec<Vec<u32>>,
}

impl DeltaStore {
    /// Index `records` for `num_anchors` anchors.
    ///
    /// Fails on duplicate item ids or anchor ids out of range.
    pub fn from_records(mut records: Vec<DeltaRecord>, num_anchors: usize) -> Result<Self> {
        records.sort_by_key(|r| r.item_id);
        let mut index = HashMap::with_capacity(records.len());
        let mut members = vec![Vec::new(); num_anchors];

        for (pos, record) in records.iter().enumerate() {
            if index.insert(record.item_id, pos).is_some() {
                return Err(LeannError::build(format!(
                    "duplicate item id {}",
                    record.item_id
                )));
            }
            let anchor = record.anchor_id as usize;
            let Some(list) = members.get_mut(anchor) else {
                return Err(LeannError::build(format!(
                    "item {} references anchor {} but only {} anchors exist",
                    record.item_id, record.anchor_id, num_anchors
                )));
            };
            list.push(pos as u32);
        }

        Ok(Self {
            records,
            index,
            members,
        })
    }

    pub fn get(&self, id: ItemId) -> Option<&DeltaRecord> {
        self.index.get(&id).map(|&pos| &self.records[pos])
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.index.contains_key(&id)
    }

    /// Members of `anchor`, ascending item id. Empty for unknown anchors.
    pub fn members(&self, anchor: AnchorId) -> impl Iterator<Item = &DeltaRecord> + '_ {
        self.members
            .get(anchor as usize)
            .into_iter()
            .flatten()
            .map(|&pos| &self.records[pos as usize])
    }

    pub fn member_counts(&self) -> Vec<usize> {
        self.members.iter().map(Vec::len).collect()
    }

    pub fn records(&self) -> &[DeltaRecord] {
        &self.records
    }

    pub fn num_anchors(&self) -> usize {
        self.members.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

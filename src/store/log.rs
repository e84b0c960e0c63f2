//! Durable log backing a delta segment (`segment/`).
//!
//! Thin layer over `durability::walog`. Each segment entry is written as a
//! framed record file, then committed by a WAL entry naming its sequence
//! number:
//!
//! ```text
//! segment/
//! ├── wal/                 durability::walog segments
//! └── records/<seq>.rec    framed postcard SegmentEntry
//! ```
//!
//! The WAL is the commit point. A record file with no WAL entry (a crash
//! between the two writes) is ignored on replay; a WAL entry whose record is
//! missing or corrupt is an error. Torn WAL tails are handled by the WAL
//! reader's best-effort replay.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use durability::storage::{Directory as _, FsDirectory};
use durability::walog::{WalEntry, WalReader, WalWriter};
use tracing::debug;

use super::segment::SegmentEntry;
use crate::persistence::error::{PersistenceError, PersistenceResult};
use crate::persistence::format::{decode_blob, encode_blob, SEGMENT_RECORD_MAGIC};

const WAL_DIR: &str = "wal";
const RECORDS_DIR: &str = "records";

fn record_path(seq: u64) -> String {
    format!("{RECORDS_DIR}/{seq:020}.rec")
}

/// Append handle for a segment directory.
pub struct SegmentLog {
    root: PathBuf,
    dir: Arc<FsDirectory>,
}

impl fmt::Debug for SegmentLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentLog").field("root", &self.root).finish()
    }
}

impl SegmentLog {
    /// Open the segment directory at `root`, creating its layout if needed.
    pub fn open(root: &Path) -> PersistenceResult<Self> {
        std::fs::create_dir_all(root)?;
        let dir = FsDirectory::new(root.to_path_buf())?;
        dir.create_dir_all(WAL_DIR)?;
        dir.create_dir_all(RECORDS_DIR)?;
        Ok(Self {
            root: root.to_path_buf(),
            dir: Arc::new(dir),
        })
    }

    /// Write `entries` to a fresh segment directory at `root`.
    pub fn create(root: &Path, entries: &[SegmentEntry]) -> PersistenceResult<Self> {
        let log = Self::open(root)?;
        let mut wal = log.writer();
        for entry in entries {
            log.commit(&mut wal, entry)?;
        }
        wal.flush()?;
        Ok(log)
    }

    fn writer(&self) -> WalWriter {
        let dir: Arc<dyn durability::Directory> = self.dir.clone();
        WalWriter::new_conservative(dir)
    }

    fn commit(&self, wal: &mut WalWriter, entry: &SegmentEntry) -> PersistenceResult<()> {
        let payload = postcard::to_allocvec(entry)?;
        self.dir
            .atomic_write(&record_path(entry.seq), &encode_blob(SEGMENT_RECORD_MAGIC, &payload))?;
        wal.append(WalEntry::AddSegment {
            entry_id: 0,
            segment_id: entry.seq,
            doc_count: 1,
        })?;
        Ok(())
    }

    /// Make one entry durable. The WAL writer flushes after every append.
    pub fn append(&mut self, entry: &SegmentEntry) -> PersistenceResult<()> {
        let mut wal = self.writer();
        self.commit(&mut wal, entry)?;
        wal.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Every committed entry, in commit order.
    pub fn replay(&self) -> PersistenceResult<Vec<SegmentEntry>> {
        let dir: Arc<dyn durability::Directory> = self.dir.clone();
        let committed = WalReader::new(dir).replay_best_effort()?;
        let mut entries = Vec::with_capacity(committed.len());
        for wal_entry in committed {
            let seq = match wal_entry {
                WalEntry::AddSegment { segment_id, .. } => segment_id,
                _ => {
                    return Err(PersistenceError::Format(format!(
                        "unexpected entry kind in {}/{WAL_DIR}",
                        self.root.display()
                    )))
                }
            };
            entries.push(self.read_record(seq)?);
        }
        debug!(path = %self.root.display(), entries = entries.len(), "segment log replayed");
        Ok(entries)
    }

    fn read_record(&self, seq: u64) -> PersistenceResult<SegmentEntry> {
        let path = record_path(seq);
        if !self.dir.exists(&path) {
            return Err(PersistenceError::NotFound(format!(
                "{}/{path}",
                self.root.display()
            )));
        }
        let mut bytes = Vec::new();
        self.dir.open_file(&path)?.read_to_end(&mut bytes)?;
        let entry: SegmentEntry = postcard::from_bytes(decode_blob(SEGMENT_RECORD_MAGIC, &bytes)?)?;
        if entry.seq != seq {
            return Err(PersistenceError::Format(format!(
                "record {path} holds sequence {}",
                entry.seq
            )));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::segment::SegmentOp;

    fn tombstone(seq: u64, id: u64) -> SegmentEntry {
        SegmentEntry {
            seq,
            op: SegmentOp::Tombstone(id),
        }
    }

    #[test]
    fn appended_entries_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("segment");
        let mut log = SegmentLog::create(&root, &[tombstone(1, 10)]).unwrap();
        log.append(&tombstone(2, 11)).unwrap();
        log.append(&tombstone(3, 12)).unwrap();

        let replayed = SegmentLog::open(&root).unwrap().replay().unwrap();
        let seqs: Vec<u64> = replayed.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(replayed[1].op, SegmentOp::Tombstone(11));
    }

    #[test]
    fn uncommitted_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("segment");
        let log = SegmentLog::create(&root, &[tombstone(1, 10)]).unwrap();

        // Record written, crash before the WAL entry.
        let orphan = tombstone(2, 11);
        let payload = postcard::to_allocvec(&orphan).unwrap();
        std::fs::write(
            root.join(record_path(2)),
            encode_blob(SEGMENT_RECORD_MAGIC, &payload),
        )
        .unwrap();

        let replayed = log.replay().unwrap();
        assert_eq!(replayed, vec![tombstone(1, 10)]);
    }

    #[test]
    fn committed_entry_without_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("segment");
        let log = SegmentLog::create(&root, &[tombstone(1, 10), tombstone(2, 11)]).unwrap();
        std::fs::remove_file(root.join(record_path(2))).unwrap();

        let err = log.replay().unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
        assert!(err.is_structural());
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("segment");
        let log = SegmentLog::create(&root, &[tombstone(1, 10)]).unwrap();
        let path = root.join(record_path(1));
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(log.replay().unwrap_err().is_structural());
    }

    #[test]
    fn empty_log_replays_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = SegmentLog::create(&dir.path().join("segment"), &[]).unwrap();
        assert!(log.replay().unwrap().is_empty());
    }
}

//! On-disk layout of index generations.
//!
//! ```text
//! <root>/
//! ├── CURRENT            "gen-<version>\n", replaced by rename
//! ├── gen-1/
//! │   ├── anchors.bin    framed postcard, see `format`
//! │   ├── graph.bin      or graph.disk for disk-resident Vamana
//! │   ├── codebooks.bin
//! │   ├── deltas.bin
//! │   ├── segment/       WAL + records, see `store::log`
//! │   └── metadata.json
//! └── gen-2.tmp/         in-progress write, removed on recovery
//! ```
//!
//! A generation directory is written under a `.tmp` name and renamed into
//! place once complete; `CURRENT` only ever names complete directories. A
//! crash at any point leaves the previously active generation loadable.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{PersistenceError, PersistenceResult};
use super::format::{
    read_blob, write_blob, ANCHORS_MAGIC, CODEBOOK_MAGIC, DELTAS_MAGIC, GRAPH_MAGIC,
};
use crate::config::GraphBackend;
use crate::error::Result;
use crate::graph::{write_disk_graph, AnchorGraph, DiskVamana, HnswGraph, StoredGraph, VamanaGraph};
use crate::index::{BuildMetadata, IndexGeneration};
use crate::quantization::ProductQuantizer;
use crate::store::{DeltaSegment, DeltaStore, SegmentLog};
use crate::types::DeltaRecord;

const CURRENT: &str = "CURRENT";
const ANCHORS_FILE: &str = "anchors.bin";
const GRAPH_FILE: &str = "graph.bin";
const DISK_GRAPH_FILE: &str = "graph.disk";
const CODEBOOKS_FILE: &str = "codebooks.bin";
const DELTAS_FILE: &str = "deltas.bin";
const SEGMENT_DIR: &str = "segment";
const METADATA_FILE: &str = "metadata.json";
const TMP_SUFFIX: &str = ".tmp";

/// Same wire shape as [`StoredGraph`], without cloning the graph.
#[derive(Serialize)]
enum StoredGraphRef<'a> {
    Hnsw(&'a HnswGraph),
    Vamana(&'a VamanaGraph),
}

fn generation_name(version: u64) -> String {
    format!("gen-{version}")
}

fn parse_generation_name(name: &str) -> Option<u64> {
    name.strip_prefix("gen-")?.parse().ok()
}

fn not_found(path: &Path) -> PersistenceError {
    PersistenceError::NotFound(path.display().to_string())
}

fn sync_dir(path: &Path) -> PersistenceResult<()> {
    // Directory fsync makes renames durable on Unix; elsewhere it is best effort.
    if let Ok(dir) = File::open(path) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Root directory holding every persisted generation.
#[derive(Debug, Clone)]
pub struct GenerationStore {
    root: PathBuf,
}

impl GenerationStore {
    /// Open (creating if needed) and clean up interrupted writes.
    pub fn open(root: impl AsRef<Path>) -> PersistenceResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let store = Self { root };
        store.recover()?;
        Ok(store)
    }

    /// Open an existing store without creating or modifying anything.
    pub fn open_existing(root: impl AsRef<Path>) -> PersistenceResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(not_found(&root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation_dir(&self, version: u64) -> PathBuf {
        self.root.join(generation_name(version))
    }

    /// Remove leftovers of interrupted writes. Returns how many were removed.
    pub fn recover(&self) -> PersistenceResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            warn!(path = %path.display(), "removed interrupted generation write");
            removed += 1;
        }
        Ok(removed)
    }

    /// Persist `generation` into its own directory. Does not activate it.
    pub fn write(&self, generation: &IndexGeneration) -> Result<PathBuf> {
        let version = generation.version();
        let final_dir = self.generation_dir(version);
        if final_dir.exists() {
            return Err(PersistenceError::InvalidState(format!(
                "generation {version} already exists at {}",
                final_dir.display()
            ))
            .into());
        }
        let tmp_dir = self
            .root
            .join(format!("{}{TMP_SUFFIX}", generation_name(version)));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).map_err(PersistenceError::from)?;
        }
        fs::create_dir_all(&tmp_dir).map_err(PersistenceError::from)?;

        write_blob(&tmp_dir.join(ANCHORS_FILE), ANCHORS_MAGIC, &generation.anchors())?;
        self.write_graph(&tmp_dir, generation)?;
        write_blob(
            &tmp_dir.join(CODEBOOKS_FILE),
            CODEBOOK_MAGIC,
            generation.quantizer(),
        )?;
        write_blob(
            &tmp_dir.join(DELTAS_FILE),
            DELTAS_MAGIC,
            &generation.store().records(),
        )?;
        SegmentLog::create(&tmp_dir.join(SEGMENT_DIR), &generation.segment().entries())?;
        let metadata =
            serde_json::to_vec_pretty(generation.metadata()).map_err(PersistenceError::from)?;
        let mut file = File::create(tmp_dir.join(METADATA_FILE)).map_err(PersistenceError::from)?;
        file.write_all(&metadata).map_err(PersistenceError::from)?;
        file.sync_all().map_err(PersistenceError::from)?;
        sync_dir(&tmp_dir)?;

        fs::rename(&tmp_dir, &final_dir).map_err(PersistenceError::from)?;
        sync_dir(&self.root)?;
        info!(version, path = %final_dir.display(), "generation persisted");
        Ok(final_dir)
    }

    fn write_graph(&self, dir: &Path, generation: &IndexGeneration) -> PersistenceResult<()> {
        let on_disk = matches!(
            &generation.config().graph,
            GraphBackend::Vamana(params) if params.on_disk
        );
        match generation.graph() {
            AnchorGraph::Hnsw(g) => {
                write_blob(&dir.join(GRAPH_FILE), GRAPH_MAGIC, &StoredGraphRef::Hnsw(g))
            }
            AnchorGraph::Vamana(g) if on_disk => write_disk_graph(&dir.join(DISK_GRAPH_FILE), g),
            AnchorGraph::Vamana(g) => {
                write_blob(&dir.join(GRAPH_FILE), GRAPH_MAGIC, &StoredGraphRef::Vamana(g))
            }
            AnchorGraph::OnDisk(g) => {
                fs::copy(g.path(), dir.join(DISK_GRAPH_FILE))?;
                Ok(())
            }
        }
    }

    /// Point `CURRENT` at `version`.
    pub fn activate(&self, version: u64) -> PersistenceResult<()> {
        let dir = self.generation_dir(version);
        if !dir.is_dir() {
            return Err(not_found(&dir));
        }
        let tmp = self.root.join(format!("{CURRENT}{TMP_SUFFIX}"));
        let mut file = File::create(&tmp)?;
        writeln!(file, "{}", generation_name(version))?;
        file.sync_all()?;
        fs::rename(&tmp, self.root.join(CURRENT))?;
        sync_dir(&self.root)?;
        info!(version, "generation activated");
        Ok(())
    }

    /// Version named by `CURRENT`, if any.
    pub fn active_version(&self) -> PersistenceResult<Option<u64>> {
        let path = self.root.join(CURRENT);
        let contents = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        parse_generation_name(contents.trim())
            .map(Some)
            .ok_or_else(|| PersistenceError::Format(format!("malformed CURRENT: {contents:?}")))
    }

    /// Complete generation directories, ascending.
    pub fn versions(&self) -> PersistenceResult<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(v) = parse_generation_name(&entry.file_name().to_string_lossy()) {
                versions.push(v);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn load_active(&self) -> Result<IndexGeneration> {
        let version = self
            .active_version()?
            .ok_or_else(|| not_found(&self.root.join(CURRENT)))?;
        self.load(version)
    }

    /// Load and verify one generation. The segment log stays attached so
    /// later appends are durable.
    pub fn load(&self, version: u64) -> Result<IndexGeneration> {
        let dir = self.generation_dir(version);
        if !dir.is_dir() {
            return Err(not_found(&dir).into());
        }

        let metadata_path = dir.join(METADATA_FILE);
        let raw = fs::read(&metadata_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => not_found(&metadata_path),
            _ => PersistenceError::Io(e),
        })?;
        let metadata: BuildMetadata =
            serde_json::from_slice(&raw).map_err(PersistenceError::from)?;
        if metadata.version != version {
            return Err(PersistenceError::Format(format!(
                "{} claims version {}",
                dir.display(),
                metadata.version
            ))
            .into());
        }
        let config = metadata.config.clone();
        config
            .validate()
            .map_err(|e| PersistenceError::Format(format!("stored configuration: {e}")))?;

        let anchors: Vec<Vec<f32>> = read_blob(&dir.join(ANCHORS_FILE), ANCHORS_MAGIC)?;
        if let Some(bad) = anchors.iter().find(|a| a.len() != config.dimension) {
            return Err(PersistenceError::Format(format!(
                "anchor of dimension {} in a {}-d index",
                bad.len(),
                config.dimension
            ))
            .into());
        }

        let disk_graph = dir.join(DISK_GRAPH_FILE);
        let graph = if disk_graph.exists() {
            AnchorGraph::OnDisk(DiskVamana::open(&disk_graph)?)
        } else {
            read_blob::<StoredGraph>(&dir.join(GRAPH_FILE), GRAPH_MAGIC)?.into()
        };

        graph.validate(anchors.len())?;

        let quantizer: ProductQuantizer =
            read_blob(&dir.join(CODEBOOKS_FILE), CODEBOOK_MAGIC)?;
        let records: Vec<DeltaRecord> = read_blob(&dir.join(DELTAS_FILE), DELTAS_MAGIC)?;
        let code_len = quantizer.layout().code_len();
        if let Some(bad) = records.iter().find(|r| r.code.len() != code_len) {
            return Err(PersistenceError::Format(format!(
                "item {} has a {}-byte code, expected {code_len}",
                bad.item_id,
                bad.code.len()
            ))
            .into());
        }
        let store = DeltaStore::from_records(records, anchors.len())
            .map_err(|e| PersistenceError::Format(e.to_string()))?;

        let segment_dir = dir.join(SEGMENT_DIR);
        if !segment_dir.is_dir() {
            return Err(not_found(&segment_dir).into());
        }
        let log = SegmentLog::open(&segment_dir)?;
        let segment = DeltaSegment::from_entries(log.replay()?);
        segment.attach_log(log);

        debug!(
            version,
            anchors = anchors.len(),
            items = store.len(),
            segment = segment.len(),
            "generation loaded"
        );
        IndexGeneration::from_parts(config, anchors, quantizer, graph, store, segment, metadata)
            .map_err(|e| PersistenceError::Format(e.to_string()).into())
    }

    /// Delete all but the newest `keep` generations, never the active one.
    pub fn prune(&self, keep: usize) -> PersistenceResult<Vec<u64>> {
        let active = self.active_version()?;
        let versions = self.versions()?;
        let cutoff = versions.len().saturating_sub(keep);
        let mut removed = Vec::new();
        for &v in &versions[..cutoff] {
            if Some(v) == active {
                continue;
            }
            fs::remove_dir_all(self.generation_dir(v))?;
            removed.push(v);
        }
        if !removed.is_empty() {
            info!(?removed, "pruned old generations");
        }
        Ok(removed)
    }

    /// Write, activate and reload `generation`. The returned generation has
    /// its segment log attached.
    pub fn publish(&self, generation: &IndexGeneration) -> Result<IndexGeneration> {
        let version = generation.version();
        self.write(generation)?;
        let loaded = self.load(version)?;
        self.activate(version)?;
        Ok(loaded)
    }

    /// Highest complete generation on disk, active or not.
    pub fn latest_version(&self) -> PersistenceResult<Option<u64>> {
        Ok(self.versions()?.last().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_names_round_trip() {
        assert_eq!(parse_generation_name(&generation_name(42)), Some(42));
        assert_eq!(parse_generation_name("gen-x"), None);
        assert_eq!(parse_generation_name("gen-3.tmp"), None);
    }

    #[test]
    fn recover_removes_tmp_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("gen-2.tmp")).unwrap();
        fs::write(dir.path().join("CURRENT.tmp"), "gen-2").unwrap();
        fs::create_dir_all(dir.path().join("gen-1")).unwrap();

        let store = GenerationStore::open(dir.path()).unwrap();
        assert!(!dir.path().join("gen-2.tmp").exists());
        assert!(!dir.path().join("CURRENT.tmp").exists());
        assert_eq!(store.versions().unwrap(), vec![1]);
    }

    #[test]
    fn missing_current_means_no_active_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationStore::open(dir.path()).unwrap();
        assert_eq!(store.active_version().unwrap(), None);
        assert!(store.load_active().is_err());
    }

    #[test]
    fn activate_requires_a_complete_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.activate(3),
            Err(PersistenceError::NotFound(_))
        ));
        fs::create_dir_all(store.generation_dir(3)).unwrap();
        store.activate(3).unwrap();
        assert_eq!(store.active_version().unwrap(), Some(3));
    }
}

//! Disk-resident Vamana adjacency.
//!
//! Anchor vectors stay in memory; only adjacency lives on disk, read one node
//! record at a time by offset.
//!
//! Format:
//! - Header (64 bytes):
//!   - Magic (8 bytes)
//!   - Num nodes (8 bytes)
//!   - Max degree (8 bytes)
//!   - Start node (8 bytes)
//!   - Metric tag (1 byte)
//!   - CRC32 of all node records (4 bytes)
//!   - Padding (27 bytes)
//! - Nodes:
//!   - For each node:
//!     - Degree (4 bytes)
//!     - Neighbors (max_degree * 4 bytes, zero padded)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::search::beam_search;
use super::vamana::VamanaGraph;
use crate::distance::Metric;
use crate::error::Result;
use crate::persistence::error::{PersistenceError, PersistenceResult};

// Magic bytes for the disk graph file: "LDSK" + version 1
const GRAPH_MAGIC: &[u8; 8] = b"LDSK\x00\x00\x00\x01";
const HEADER_SIZE: u64 = 64;

fn metric_tag(metric: Metric) -> u8 {
    match metric {
        Metric::Cosine => 0,
        Metric::InnerProduct => 1,
        Metric::L2 => 2,
    }
}

fn metric_from_tag(tag: u8) -> PersistenceResult<Metric> {
    match tag {
        0 => Ok(Metric::Cosine),
        1 => Ok(Metric::InnerProduct),
        2 => Ok(Metric::L2),
        other => Err(PersistenceError::Format(format!("unknown metric tag {other}"))),
    }
}

/// Write `graph` in the fixed-stride format, fsynced.
pub fn write_disk_graph(path: &Path, graph: &VamanaGraph) -> PersistenceResult<()> {
    let max_degree = graph.max_degree;
    let mut records = Vec::with_capacity(graph.len() * (4 + max_degree * 4));
    for neighbors in &graph.adjacency {
        if neighbors.len() > max_degree {
            return Err(PersistenceError::Serialization(format!(
                "node degree {} exceeds max_degree {}",
                neighbors.len(),
                max_degree
            )));
        }
        records.extend_from_slice(&(neighbors.len() as u32).to_le_bytes());
        for &nb in neighbors {
            records.extend_from_slice(&nb.to_le_bytes());
        }
        // Zero padding keeps every record the same size.
        records.resize(records.len() + (max_degree - neighbors.len()) * 4, 0);
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(GRAPH_MAGIC)?;
    writer.write_all(&(graph.len() as u64).to_le_bytes())?;
    writer.write_all(&(max_degree as u64).to_le_bytes())?;
    writer.write_all(&u64::from(graph.medoid).to_le_bytes())?;
    writer.write_all(&[metric_tag(graph.metric)])?;
    writer.write_all(&crc32fast::hash(&records).to_le_bytes())?;
    writer.write_all(&[0u8; 27])?;
    writer.write_all(&records)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Reader for the disk graph format.
///
/// Uses seek + read under a mutex; concurrent queries serialize on adjacency
/// fetches only.
pub struct DiskGraphReader {
    file: Mutex<File>,
    path: PathBuf,
    pub num_nodes: usize,
    pub max_degree: usize,
    pub start_node: u32,
    pub metric: Metric,
    record_size: u64,
}

impl std::fmt::Debug for DiskGraphReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskGraphReader")
            .field("path", &self.path)
            .field("num_nodes", &self.num_nodes)
            .field("max_degree", &self.max_degree)
            .field("start_node", &self.start_node)
            .finish()
    }
}

impl DiskGraphReader {
    /// Open a graph file and verify its header and record checksum.
    pub fn open(path: &Path) -> PersistenceResult<Self> {
        let mut file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PersistenceError::NotFound(path.display().to_string()),
            _ => PersistenceError::Io(e),
        })?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)
            .map_err(|_| PersistenceError::Format("disk graph header truncated".to_string()))?;
        if &header[0..8] != GRAPH_MAGIC {
            return Err(PersistenceError::Format(
                "invalid disk graph file".to_string(),
            ));
        }

        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&header[off..off + 8]);
            u64::from_le_bytes(b)
        };
        let num_nodes = u64_at(8) as usize;
        let max_degree = u64_at(16) as usize;
        let start_node = u64_at(24) as u32;
        let metric = metric_from_tag(header[32])?;
        let expected = u32::from_le_bytes([header[33], header[34], header[35], header[36]]);

        let record_size = 4 + (max_degree as u64 * 4); // degree (4) + neighbors (max * 4)
        let expected_len = HEADER_SIZE + record_size * num_nodes as u64;
        let actual_len = file.metadata()?.len();
        if actual_len != expected_len {
            return Err(PersistenceError::Format(format!(
                "disk graph is {actual_len} bytes, expected {expected_len}"
            )));
        }
        if num_nodes > 0 && start_node as usize >= num_nodes {
            return Err(PersistenceError::Format(format!(
                "start node {start_node} out of range for {num_nodes} nodes"
            )));
        }

        let mut hasher = crc32fast::Hasher::new();
        let mut reader = BufReader::new(&mut file);
        let mut chunk = [0u8; 8192];
        loop {
            let read = reader.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            hasher.update(&chunk[..read]);
        }
        let actual = hasher.finalize();
        if actual != expected {
            return Err(PersistenceError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            num_nodes,
            max_degree,
            start_node,
            metric,
            record_size,
        })
    }

    /// Read neighbors for a node into `out`.
    pub fn neighbors(&self, node_id: u32, out: &mut Vec<u32>) -> PersistenceResult<()> {
        if node_id as usize >= self.num_nodes {
            return Err(PersistenceError::Format(format!(
                "node {node_id} out of range for {} nodes",
                self.num_nodes
            )));
        }

        let offset = HEADER_SIZE + (u64::from(node_id) * self.record_size);
        let mut record = vec![0u8; self.record_size as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut record)?;
        }

        let degree = u32::from_le_bytes([record[0], record[1], record[2], record[3]]) as usize;
        if degree > self.max_degree {
            return Err(PersistenceError::Format(
                "invalid node degree in graph file".to_string(),
            ));
        }
        let start = out.len();
        out.extend(
            record[4..4 + degree * 4]
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        if let Some(&bad) = out[start..].iter().find(|&&id| id as usize >= self.num_nodes) {
            out.truncate(start);
            return Err(PersistenceError::Format(format!(
                "node {node_id} links to {bad}, only {} nodes",
                self.num_nodes
            )));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Vamana graph searched through a [`DiskGraphReader`].
#[derive(Debug)]
pub struct DiskVamana {
    reader: DiskGraphReader,
}

impl DiskVamana {
    pub fn open(path: &Path) -> PersistenceResult<Self> {
        Ok(Self {
            reader: DiskGraphReader::open(path)?,
        })
    }

    pub fn search(
        &self,
        vectors: &[Vec<f32>],
        query: &[f32],
        k: usize,
        beam_width: usize,
    ) -> Result<Vec<(u32, f32)>> {
        let metric = self.reader.metric;
        let mut out = beam_search(
            &[self.reader.start_node],
            beam_width.max(k),
            |n, buf| Ok(self.reader.neighbors(n, buf)?),
            |id| metric.distance(query, &vectors[id as usize]),
        )?;
        out.truncate(k);
        Ok(out)
    }

    pub fn neighbors(&self, node: u32, out: &mut Vec<u32>) -> Result<()> {
        Ok(self.reader.neighbors(node, out)?)
    }

    pub fn len(&self) -> usize {
        self.reader.num_nodes
    }

    pub fn is_empty(&self) -> bool {
        self.reader.num_nodes == 0
    }

    pub fn entry_point(&self) -> u32 {
        self.reader.start_node
    }

    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    pub fn reader(&self) -> &DiskGraphReader {
        &self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VamanaParams;

    fn small_graph() -> (Vec<Vec<f32>>, VamanaGraph) {
        let vectors: Vec<Vec<f32>> = (0..40)
            .map(|i| vec![(i as f32).cos(), (i as f32).sin(), i as f32 / 40.0])
            .collect();
        let params = VamanaParams {
            max_degree: 6,
            build_beam_width: 16,
            ..VamanaParams::default()
        };
        let g = VamanaGraph::build(&vectors, &params, Metric::L2, 4, None).unwrap();
        (vectors, g)
    }

    #[test]
    fn disk_search_matches_memory_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.disk");
        let (vectors, g) = small_graph();
        write_disk_graph(&path, &g).unwrap();

        let disk = DiskVamana::open(&path).unwrap();
        assert_eq!(disk.len(), 40);
        assert_eq!(disk.entry_point(), g.medoid);
        for (i, v) in vectors.iter().enumerate().step_by(7) {
            let mem = g.search(&vectors, v, 3, 16).unwrap();
            let dsk = disk.search(&vectors, v, 3, 16).unwrap();
            assert_eq!(mem, dsk, "query {i}");
        }
    }

    #[test]
    fn adjacency_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.disk");
        let (_, g) = small_graph();
        write_disk_graph(&path, &g).unwrap();
        let reader = DiskGraphReader::open(&path).unwrap();
        let mut buf = Vec::new();
        for (i, expected) in g.adjacency.iter().enumerate() {
            buf.clear();
            reader.neighbors(i as u32, &mut buf).unwrap();
            assert_eq!(&buf, expected);
        }
    }

    #[test]
    fn corrupted_record_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.disk");
        let (_, g) = small_graph();
        write_disk_graph(&path, &g).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let idx = HEADER_SIZE as usize + 5;
        bytes[idx] ^= 0x5a;
        std::fs::write(&path, bytes).unwrap();

        let err = DiskGraphReader::open(&path).unwrap_err();
        assert!(matches!(err, PersistenceError::ChecksumMismatch { .. }));
    }

    #[test]
    fn out_of_range_neighbor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.disk");
        let (_, g) = small_graph();
        assert!(!g.adjacency[0].is_empty());
        write_disk_graph(&path, &g).unwrap();

        // Point node 0's first neighbor past the end, with a valid checksum.
        let mut bytes = std::fs::read(&path).unwrap();
        let first = HEADER_SIZE as usize + 4;
        bytes[first..first + 4].copy_from_slice(&999u32.to_le_bytes());
        let crc = crc32fast::hash(&bytes[HEADER_SIZE as usize..]);
        bytes[33..37].copy_from_slice(&crc.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let reader = DiskGraphReader::open(&path).unwrap();
        let mut buf = Vec::new();
        let err = reader.neighbors(0, &mut buf).unwrap_err();
        assert!(matches!(err, PersistenceError::Format(_)));
        assert!(buf.is_empty());

        let graph = crate::graph::AnchorGraph::OnDisk(DiskVamana::open(&path).unwrap());
        assert!(graph.validate(40).is_err());
    }

    #[test]
    fn node_count_must_match_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.disk");
        let (_, g) = small_graph();
        write_disk_graph(&path, &g).unwrap();

        let graph = crate::graph::AnchorGraph::OnDisk(DiskVamana::open(&path).unwrap());
        graph.validate(40).unwrap();
        assert!(graph.validate(39).is_err());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = DiskGraphReader::open(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }
}

use crate::config::{SPILL_BATCH, WRITE_BUFFER_SIZE};
use crate::models::DirectedEdge;
use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use tracing::{debug, info};

const EDGE_BYTES: usize = 8;

/// Receives the final, sorted and deduplicated edge stream.
pub trait EdgeSink {
    fn accept(&mut self, edge: DirectedEdge) -> Result<()>;
}

impl EdgeSink for Vec<DirectedEdge> {
    fn accept(&mut self, edge: DirectedEdge) -> Result<()> {
        self.push(edge);
        Ok(())
    }
}

/// On-disk edge spill partitioned by source-id range.
///
/// Shard `i` only holds sources below those of shard `i + 1`, so sorting and deduplicating
/// each shard independently and concatenating them in order yields the globally sorted,
/// unique edge list. The spill directory is removed when the set is dropped.
pub struct SpillSet {
    dir: TempDir,
    shards: Vec<Mutex<BufWriter<File>>>,
    paths: Vec<PathBuf>,
    max_id: u32,
}

impl SpillSet {
    /// Creates `shard_count` spill files under a fresh hidden directory inside `parent`.
    pub fn create(parent: &Path, shard_count: usize, max_id: u32) -> Result<Self> {
        let shard_count = shard_count.max(1);
        let dir = tempfile::Builder::new()
            .prefix(".linkgraph-spill-")
            .tempdir_in(parent)
            .with_context(|| format!("Failed to create spill directory in {:?}", parent))?;

        let mut shards = Vec::with_capacity(shard_count);
        let mut paths = Vec::with_capacity(shard_count);
        for i in 0..shard_count {
            let path = dir.path().join(format!("edges_{:03}.bin", i));
            let file = File::create(&path)
                .with_context(|| format!("Failed to create spill shard: {:?}", path))?;
            shards.push(Mutex::new(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)));
            paths.push(path);
        }
        debug!(dir = ?dir.path(), shards = shard_count, max_id, "Spill set created");

        Ok(Self {
            dir,
            shards,
            paths,
            max_id,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Monotone in `source`: a larger source never maps to a smaller shard.
    #[inline]
    pub fn shard_of(&self, source: u32) -> usize {
        let n = self.shards.len() as u64;
        let bucket = source.min(self.max_id) as u64 * n / (self.max_id as u64 + 1);
        bucket as usize
    }

    /// A per-worker buffered writer.
    pub fn writer(&self) -> SpillWriter<'_> {
        SpillWriter {
            set: self,
            buffers: vec![Vec::new(); self.shards.len()],
        }
    }

    fn append(&self, shard: usize, edges: &[DirectedEdge]) -> Result<()> {
        let mut bytes = Vec::with_capacity(edges.len() * EDGE_BYTES);
        for edge in edges {
            bytes.extend_from_slice(&edge.to_bytes());
        }
        let mut file = self.shards[shard]
            .lock()
            .map_err(|_| anyhow!("spill shard {} lock poisoned", shard))?;
        file.write_all(&bytes)
            .with_context(|| format!("Failed to write spill shard: {:?}", self.paths[shard]))?;
        Ok(())
    }

    /// Sorts and deduplicates each shard in order and streams the result into `sink`.
    /// Returns the number of unique edges delivered.
    pub fn reduce<S: EdgeSink>(self, sink: &mut S) -> Result<u64> {
        let SpillSet {
            dir, shards, paths, ..
        } = self;

        for (shard, path) in shards.into_iter().zip(&paths) {
            let mut writer = shard
                .into_inner()
                .map_err(|_| anyhow!("spill shard lock poisoned: {:?}", path))?;
            writer
                .flush()
                .with_context(|| format!("Failed to flush spill shard: {:?}", path))?;
        }

        let pb = ProgressBar::new(paths.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} Reducing edges [{bar:30.cyan/blue}] {pos}/{len} shards")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut unique = 0u64;
        let mut spilled = 0u64;
        for path in &paths {
            let mut edges = read_shard(path)?;
            spilled += edges.len() as u64;
            edges.par_sort_unstable();
            edges.dedup();
            for edge in &edges {
                sink.accept(*edge)?;
            }
            unique += edges.len() as u64;
            drop(edges);
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove spill shard: {:?}", path))?;
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!(spilled, unique, "Edge reduction complete");
        dir.close()
            .context("Failed to remove spill directory")?;
        Ok(unique)
    }
}

fn read_shard(path: &Path) -> Result<Vec<DirectedEdge>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read spill shard: {:?}", path))?;
    if bytes.len() % EDGE_BYTES != 0 {
        return Err(anyhow!(
            "spill shard {:?} has a truncated record ({} bytes)",
            path,
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(EDGE_BYTES)
        .map(|chunk| {
            let mut buf = [0u8; EDGE_BYTES];
            buf.copy_from_slice(chunk);
            DirectedEdge::from_bytes(buf)
        })
        .collect())
}

/// Buffers edges per shard and appends a batch under the shard lock once it fills.
pub struct SpillWriter<'a> {
    set: &'a SpillSet,
    buffers: Vec<Vec<DirectedEdge>>,
}

impl SpillWriter<'_> {
    #[inline]
    pub fn push(&mut self, edge: DirectedEdge) -> Result<()> {
        let shard = self.set.shard_of(edge.source);
        let buffer = &mut self.buffers[shard];
        buffer.push(edge);
        if buffer.len() >= SPILL_BATCH {
            self.set.append(shard, buffer)?;
            buffer.clear();
        }
        Ok(())
    }

    /// Must be called before the writer goes away; unflushed edges are lost otherwise.
    pub fn flush(&mut self) -> Result<()> {
        for (shard, buffer) in self.buffers.iter_mut().enumerate() {
            if !buffer.is_empty() {
                self.set.append(shard, buffer)?;
                buffer.clear();
            }
        }
        Ok(())
    }
}

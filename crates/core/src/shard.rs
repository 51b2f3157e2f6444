//! On-disk shard containers and the buffer that fills them.
//!
//! A shard is a gzip-compressed bincode encoding of [`ShardFile`]: one
//! [`FieldArray`] per tokenized field plus the shared example count. Every
//! write goes through a temporary file that is renamed into place, so a
//! reader never observes a half-written shard.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::array::{FieldArray, TokenizedData};
use crate::error::{PipelineError, Result};

pub const SHARD_EXTENSION: &str = "shard";

/// `output_chunk_{worker}_{file}_{start_doc}_{chunk}.shard`
pub fn sequential_shard_name(
    worker_id: usize,
    file_index: usize,
    start_doc_index: usize,
    chunk_number: u64,
) -> String {
    format!("output_chunk_{worker_id}_{file_index}_{start_doc_index}_{chunk_number}.{SHARD_EXTENSION}")
}

/// `output_chunk_{bucket}.shard`
pub fn bucket_shard_name(bucket: usize) -> String {
    format!("output_chunk_{bucket}.{SHARD_EXTENSION}")
}

/// Shard files directly inside `dir`, sorted by name.
pub fn list_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(PipelineError::at(dir))?;
    let mut shards = Vec::new();
    for entry in entries {
        let path = entry.map_err(PipelineError::at(dir))?.path();
        if path.extension().is_some_and(|ext| ext == SHARD_EXTENSION) {
            shards.push(path);
        }
    }
    shards.sort();
    Ok(shards)
}

/// Contents of one shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardFile {
    pub n_examples: u64,
    pub datasets: BTreeMap<String, FieldArray>,
}

impl ShardFile {
    /// Concatenate every field of `data`. All fields must end up with the
    /// same number of rows.
    pub fn from_tokenized(data: &TokenizedData) -> Result<Self> {
        let mut datasets = BTreeMap::new();
        for (name, arrays) in data {
            if arrays.is_empty() {
                continue;
            }
            datasets.insert(name.clone(), FieldArray::concat(arrays)?);
        }
        let mut shard = Self {
            n_examples: 0,
            datasets,
        };
        shard.n_examples = shard.common_rows()?;
        Ok(shard)
    }

    /// The shared row count of every field.
    fn common_rows(&self) -> Result<u64> {
        let mut rows = None;
        for (name, array) in &self.datasets {
            match rows {
                None => rows = Some(array.rows()),
                Some(expected) if expected != array.rows() => {
                    return Err(PipelineError::Shard(format!(
                        "field '{name}' has {} rows, expected {expected}",
                        array.rows()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(rows.unwrap_or(0) as u64)
    }

    fn check(&self) -> Result<()> {
        let rows = self.common_rows()?;
        if !self.datasets.is_empty() && rows != self.n_examples {
            return Err(PipelineError::Shard(format!(
                "n_examples is {} but the fields hold {rows} rows",
                self.n_examples
            )));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.n_examples == 0
    }

    pub fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        let datasets = self
            .datasets
            .iter()
            .map(|(name, array)| Ok((name.clone(), array.select_rows(rows)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            n_examples: rows.len() as u64,
            datasets,
        })
    }

    /// Append the rows of `other` after our own.
    pub fn extend(&mut self, other: ShardFile) -> Result<()> {
        if self.datasets.is_empty() {
            *self = other;
            return Ok(());
        }
        if self.datasets.keys().ne(other.datasets.keys()) {
            return Err(PipelineError::Shard(
                "cannot append a shard with different fields".to_string(),
            ));
        }
        for (name, array) in other.datasets {
            if let Some(existing) = self.datasets.get_mut(&name) {
                *existing = FieldArray::concat(&[existing.clone(), array])?;
            }
        }
        self.n_examples = self.common_rows()?;
        Ok(())
    }
}

/// Write `shard` to `path`, refusing shards whose fields disagree on row count.
pub fn write_shard(path: &Path, shard: &ShardFile) -> Result<()> {
    shard.check()?;
    let tmp = path.with_extension(format!("{SHARD_EXTENSION}.tmp"));
    {
        let file = File::create(&tmp).map_err(PipelineError::at(&tmp))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        bincode::serialize_into(&mut encoder, shard)?;
        let mut writer = encoder.finish().map_err(PipelineError::at(&tmp))?;
        writer.flush().map_err(PipelineError::at(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(PipelineError::at(path))
}

pub fn read_shard(path: &Path) -> Result<ShardFile> {
    let file = File::open(path).map_err(PipelineError::at(path))?;
    let decoder = MultiGzDecoder::new(BufReader::new(file));
    let shard: ShardFile = bincode::deserialize_from(decoder)?;
    shard.check()?;
    Ok(shard)
}

/// Append `rows` to the shard at `path`, creating it when missing.
/// Returns the new example count of the shard.
pub fn append_to_shard(path: &Path, rows: ShardFile) -> Result<u64> {
    let mut shard = if path.exists() {
        read_shard(path)?
    } else {
        ShardFile::default()
    };
    shard.extend(rows)?;
    write_shard(path, &shard)?;
    Ok(shard.n_examples)
}

/// Permute the rows of the shard at `path` in place.
pub fn shuffle_shard_in_place(path: &Path, seed: u64) -> Result<u64> {
    let shard = read_shard(path)?;
    let mut order: Vec<usize> = (0..shard.n_examples as usize).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let shuffled = shard.select_rows(&order)?;
    write_shard(path, &shuffled)?;
    Ok(shuffled.n_examples)
}

/// Accumulates tokenized frames until they are worth a shard.
#[derive(Debug, Default)]
pub struct ShardBuffer {
    data: TokenizedData,
    bytes: u64,
}

impl ShardBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: TokenizedData) {
        for (field, arrays) in data {
            self.bytes += arrays.iter().map(FieldArray::byte_size).sum::<u64>();
            self.data.entry(field).or_default().extend(arrays);
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.data.values().flatten().all(|array| array.rows() == 0)
    }

    /// Drain the buffer into a shard.
    pub fn take(&mut self) -> Result<ShardFile> {
        self.bytes = 0;
        ShardFile::from_tokenized(&std::mem::take(&mut self.data))
    }
}

/// Fixed pool of bucket locks; bucket `b` maps to lock `b % len`.
#[derive(Debug)]
pub struct LockPool {
    locks: Vec<Mutex<()>>,
}

impl LockPool {
    pub fn new(size: usize) -> Self {
        Self {
            locks: (0..size.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn lock(&self, bucket: usize) -> MutexGuard<'_, ()> {
        // the guarded data is (), so a poisoned lock is still usable
        self.locks[bucket % self.locks.len()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scatter the rows of `shard` uniformly over `bucket_count` bucket shards
/// in `output_dir`, appending under the bucket's lock.
pub fn append_shuffled<R: Rng + ?Sized>(
    shard: &ShardFile,
    output_dir: &Path,
    bucket_count: usize,
    locks: &LockPool,
    rng: &mut R,
) -> Result<()> {
    if shard.is_empty() {
        return Ok(());
    }
    let bucket_count = bucket_count.max(1);
    let mut assignment: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for row in 0..shard.n_examples as usize {
        assignment
            .entry(rng.gen_range(0..bucket_count))
            .or_default()
            .push(row);
    }
    for (bucket, rows) in assignment {
        let part = shard.select_rows(&rows)?;
        let path = output_dir.join(bucket_shard_name(bucket));
        let _guard = locks.lock(bucket);
        append_to_shard(&path, part)?;
    }
    Ok(())
}

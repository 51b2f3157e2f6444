//! Per-worker checkpoint and statistics files.
//!
//! Each worker owns `checkpoint_process_{id}.txt`, a single line of five
//! comma-separated integers, and `checkpoint_process_stats_{id}.json`, its
//! cumulative statistics. Both are replaced atomically.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PipelineError, Result};
use crate::reader::ReadPosition;
use crate::stats::DataStats;

/// Progress of one worker, as of its last flushed shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub file_index: usize,
    pub doc_index: usize,
    /// Absolute number of the next chunk this worker has not yet written.
    pub chunk_number: u64,
    pub chunks_written: u64,
    pub sequences_written: u64,
}

impl CheckpointRecord {
    pub fn position(&self) -> ReadPosition {
        ReadPosition {
            file_index: self.file_index,
            doc_index: self.doc_index,
        }
    }
}

impl fmt::Display for CheckpointRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}",
            self.file_index,
            self.doc_index,
            self.chunk_number,
            self.chunks_written,
            self.sequences_written
        )
    }
}

impl FromStr for CheckpointRecord {
    type Err = PipelineError;

    fn from_str(line: &str) -> Result<Self> {
        let fields = line
            .trim()
            .split(',')
            .map(|field| field.trim().parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::Serialization(format!("checkpoint '{line}': {e}")))?;
        let &[file_index, doc_index, chunk_number, chunks_written, sequences_written] = fields.as_slice()
        else {
            return Err(PipelineError::Serialization(format!(
                "checkpoint '{line}' does not hold five integers"
            )));
        };
        Ok(Self {
            file_index: file_index as usize,
            doc_index: doc_index as usize,
            chunk_number,
            chunks_written,
            sequences_written,
        })
    }
}

/// Checkpoint files of one output directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn checkpoint_path(&self, worker_id: usize) -> PathBuf {
        self.dir.join(format!("checkpoint_process_{worker_id}.txt"))
    }

    pub fn stats_path(&self, worker_id: usize) -> PathBuf {
        self.dir
            .join(format!("checkpoint_process_stats_{worker_id}.json"))
    }

    /// The worker's last checkpoint, or the start of input when the file is
    /// missing or unreadable.
    pub fn load(&self, worker_id: usize) -> CheckpointRecord {
        let path = self.checkpoint_path(worker_id);
        if !path.exists() {
            return CheckpointRecord::default();
        }
        match fs::read_to_string(&path)
            .map_err(PipelineError::at(&path))
            .and_then(|content| content.parse())
        {
            Ok(record) => record,
            Err(err) => {
                log::warn!(
                    "ignoring checkpoint of worker {worker_id} at {}: {err}",
                    path.display()
                );
                CheckpointRecord::default()
            }
        }
    }

    pub fn load_all(&self, workers: usize) -> Vec<CheckpointRecord> {
        (0..workers).map(|id| self.load(id)).collect()
    }

    pub fn save(&self, worker_id: usize, record: &CheckpointRecord) -> Result<()> {
        write_atomic(&self.checkpoint_path(worker_id), record.to_string().as_bytes())
    }

    /// The worker's cumulative statistics, empty when missing or unreadable.
    pub fn load_stats(&self, worker_id: usize) -> DataStats {
        let path = self.stats_path(worker_id);
        if !path.exists() {
            return DataStats::new();
        }
        let parsed = fs::read(&path)
            .map_err(PipelineError::at(&path))
            .and_then(|bytes| Ok(serde_json::from_slice::<BTreeMap<String, u64>>(&bytes)?));
        match parsed {
            Ok(map) => DataStats::from_map(&map),
            Err(err) => {
                log::warn!(
                    "ignoring statistics of worker {worker_id} at {}: {err}",
                    path.display()
                );
                DataStats::new()
            }
        }
    }

    pub fn save_stats(&self, worker_id: usize, stats: &DataStats) -> Result<()> {
        let json = serde_json::to_vec_pretty(&stats.to_map())?;
        write_atomic(&self.stats_path(worker_id), &json)
    }

    /// Sum of every `checkpoint_process_stats_*.json` in the directory.
    pub fn aggregate_stats(&self) -> Result<DataStats> {
        let mut total = DataStats::new();
        if !self.dir.exists() {
            return Ok(total);
        }
        let entries = fs::read_dir(&self.dir).map_err(PipelineError::at(&self.dir))?;
        for entry in entries {
            let name = entry.map_err(PipelineError::at(&self.dir))?.file_name();
            let id = name
                .to_str()
                .and_then(|n| n.strip_prefix("checkpoint_process_stats_"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(id) = id {
                total.merge(&self.load_stats(id));
            }
        }
        Ok(total)
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).map_err(PipelineError::at(&tmp))?;
    fs::rename(&tmp, path).map_err(PipelineError::at(path))
}

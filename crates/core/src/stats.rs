//! Dataset statistics: local counters and the shared atomic registry.

use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Every counter tracked by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatField {
    Discarded,
    Processed,
    Successful,
    Examples,
    TotalRawDocs,
    RawDocsSkipped,
    LossValidTokens,
    NumPadTokens,
    NonPadTokens,
    NumMaskedTokens,
    NumTokens,
    NormalizedBytesCount,
    NormalizedCharsCount,
    RawBytesCount,
    RawCharsCount,
    NumSequencesBeforePacking,
}

impl StatField {
    pub const ALL: [StatField; 16] = [
        StatField::Discarded,
        StatField::Processed,
        StatField::Successful,
        StatField::Examples,
        StatField::TotalRawDocs,
        StatField::RawDocsSkipped,
        StatField::LossValidTokens,
        StatField::NumPadTokens,
        StatField::NonPadTokens,
        StatField::NumMaskedTokens,
        StatField::NumTokens,
        StatField::NormalizedBytesCount,
        StatField::NormalizedCharsCount,
        StatField::RawBytesCount,
        StatField::RawCharsCount,
        StatField::NumSequencesBeforePacking,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StatField::Discarded => "discarded",
            StatField::Processed => "processed",
            StatField::Successful => "successful",
            StatField::Examples => "examples",
            StatField::TotalRawDocs => "total_raw_docs",
            StatField::RawDocsSkipped => "raw_docs_skipped",
            StatField::LossValidTokens => "loss_valid_tokens",
            StatField::NumPadTokens => "num_pad_tokens",
            StatField::NonPadTokens => "non_pad_tokens",
            StatField::NumMaskedTokens => "num_masked_tokens",
            StatField::NumTokens => "num_tokens",
            StatField::NormalizedBytesCount => "normalized_bytes_count",
            StatField::NormalizedCharsCount => "normalized_chars_count",
            StatField::RawBytesCount => "raw_bytes_count",
            StatField::RawCharsCount => "raw_chars_count",
            StatField::NumSequencesBeforePacking => "num_sequences_before_packing",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|field| field.as_str() == name)
    }

    /// Counters left out of the final summary while they are zero.
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            StatField::RawDocsSkipped | StatField::NumSequencesBeforePacking
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A set of counters owned by one worker, one frame or one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataStats {
    counts: [u64; StatField::ALL.len()],
}

impl Index<StatField> for DataStats {
    type Output = u64;

    fn index(&self, field: StatField) -> &u64 {
        &self.counts[field.index()]
    }
}

impl IndexMut<StatField> for DataStats {
    fn index_mut(&mut self, field: StatField) -> &mut u64 {
        &mut self.counts[field.index()]
    }
}

impl DataStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: &DataStats) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            *mine += theirs;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|&count| count == 0)
    }

    pub fn to_map(&self) -> BTreeMap<String, u64> {
        StatField::ALL
            .iter()
            .map(|&field| (field.as_str().to_string(), self[field]))
            .collect()
    }

    /// Build counters from a name → count map. Unknown names are ignored.
    pub fn from_map(map: &BTreeMap<String, u64>) -> Self {
        let mut stats = Self::new();
        for (name, &count) in map {
            match StatField::from_name(name) {
                Some(field) => stats[field] = count,
                None => log::debug!("ignoring unknown statistic '{name}'"),
            }
        }
        stats
    }
}

/// Counters shared by every worker of a job.
///
/// Each field is incremented independently; no update spans several fields.
#[derive(Debug, Default)]
pub struct SharedStats {
    counts: [AtomicU64; StatField::ALL.len()],
    progress: AtomicU64,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, field: StatField, by: u64) {
        if by > 0 {
            self.counts[field.index()].fetch_add(by, Ordering::Relaxed);
        }
    }

    pub fn add(&self, stats: &DataStats) {
        for field in StatField::ALL {
            self.increment(field, stats[field]);
        }
    }

    pub fn get(&self, field: StatField) -> u64 {
        self.counts[field.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DataStats {
        let mut stats = DataStats::new();
        for field in StatField::ALL {
            stats[field] = self.get(field);
        }
        stats
    }

    /// Number of frames fully handled so far, for progress reporting.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn advance_progress(&self, frames: u64) {
        self.progress.fetch_add(frames, Ordering::Relaxed);
    }
}

/// Token statistics of one `[input_ids, attention_mask, labels]` example.
pub fn sample_stats(input_ids: &[u32], attention_mask: &[u32], eos_id: u32, pad_id: u32) -> DataStats {
    let mut stats = DataStats::new();
    let num_tokens = input_ids.len() as u64;
    let loss_valid: u64 = attention_mask.iter().map(|&m| u64::from(m)).sum();
    stats[StatField::NumPadTokens] = input_ids.iter().filter(|&&id| id == pad_id).count() as u64;
    stats[StatField::NonPadTokens] = input_ids
        .iter()
        .filter(|&&id| id != eos_id && id != pad_id)
        .count() as u64;
    stats[StatField::NumTokens] = num_tokens;
    stats[StatField::LossValidTokens] = loss_valid;
    stats[StatField::NumMaskedTokens] = num_tokens.saturating_sub(loss_valid);
    stats
}

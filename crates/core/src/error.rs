//! Error taxonomy shared across the pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Convenient result type used throughout the crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Failures that abort a job, a worker, or a single document.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The job configuration failed validation. Raised before any worker starts.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Filesystem IO error with optional context path.
    #[error("io error while processing {path:?}: {source}")]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },
    /// The tokenizer capability failed to encode or decode.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    /// Serialization or deserialization failure (configs, shards, stats files).
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A raw record could not be decoded and skipping was not enabled.
    #[error("malformed record {doc_index} in {path:?}: {reason}")]
    MalformedRecord {
        path: PathBuf,
        doc_index: usize,
        reason: String,
    },
    /// A per-document failure that escaped its document.
    #[error(transparent)]
    Document(#[from] DocumentError),
    /// Shard contents are inconsistent (mismatched row counts, dtypes, shapes).
    #[error("shard error: {0}")]
    Shard(String),
    /// A worker thread failed or a channel peer disappeared.
    #[error("worker error: {0}")]
    Worker(String),
}

/// Recoverable per-document failures. The document is discarded and counted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("{0} is empty")]
    EmptyField(String),
    #[error("cannot determine prompt from the chosen text: no `{0}` marker found")]
    MissingPromptDelimiter(String),
    #[error("cannot determine prompt from the rendered chat: no response delimiter found")]
    MissingResponseDelimiter,
    #[error(
        "chosen and rejected prompt ids may only differ on the last token \
         ({differing_tokens} differing tokens, length difference {length_difference})"
    )]
    PromptMismatch {
        differing_tokens: usize,
        length_difference: usize,
    },
    #[error("sequence invariant violated: {0}")]
    Invariant(String),
    #[error("document shape does not match the token generator: {0}")]
    UnexpectedShape(String),
    #[error("token id {0} is outside the tokenizer vocabulary")]
    Encoding(u64),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for PipelineError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl PipelineError {
    /// Helper constructor that attaches an optional path when wrapping IO errors.
    pub fn io(source: std::io::Error, path: Option<PathBuf>) -> Self {
        Self::Io { source, path }
    }

    /// Closure wrapping an IO error with `path`, for `map_err`.
    pub fn at(path: &std::path::Path) -> impl Fn(std::io::Error) -> Self + '_ {
        move |source| Self::io(source, Some(path.to_path_buf()))
    }

    /// Whether this error only concerns the document being encoded.
    pub fn is_document_level(&self) -> bool {
        matches!(self, Self::Document(_) | Self::Tokenizer(_))
    }
}

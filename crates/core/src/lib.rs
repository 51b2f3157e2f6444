//! Core preprocessing logic for seqshard.
//!
//! This crate turns raw text corpora into fixed-length tokenized training
//! examples. A [`Pipeline`] reads input files in bounded chunks, encodes each
//! document with a [`TokenGenerator`] (causal packing, fill-in-the-middle or
//! preference pairs), and writes gzip-compressed shards to the output
//! directory, checkpointing after every shard so an interrupted job resumes
//! where it stopped.
//!
//! ```no_run
//! use std::sync::Arc;
//! use seqshard_core::{ByteTokenizer, GeneratorRegistry, JobConfig, Pipeline};
//!
//! # fn main() -> seqshard_core::Result<()> {
//! let config = JobConfig::from_path("job.toml")?;
//! let pipeline = Pipeline::new(
//!     config,
//!     Arc::new(ByteTokenizer::new()),
//!     GeneratorRegistry::with_defaults(),
//! )?;
//! let summary = pipeline.run()?;
//! println!("{} examples", summary.examples());
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod chat;
pub mod checkpoint;
pub mod config;
mod error;
pub mod fim;
pub mod generator;
pub mod memory;
pub mod pipeline;
pub mod reader;
pub mod shard;
pub mod stats;
pub mod text;
mod tokenizer;

pub use array::{ArrayValues, FieldArray, TokenizedData};
pub use chat::{ChatContent, ChatMessage};
pub use config::{JobConfig, Mode, SpecialIds, TrainingObjective};
pub use error::{DocumentError, PipelineError, Result};
pub use generator::{
    Encoded, GeneratorContext, GeneratorFactory, GeneratorKind, GeneratorRegistry, TokenGenerator,
};
pub use pipeline::{JobSummary, Pipeline, Topology};
pub use reader::{Document, RecordShape};
pub use stats::{DataStats, StatField};
pub use tokenizer::{ByteTokenizer, SharedTokenizer, Tokenizer};

//! Token generators turn the documents of a frame into fixed-width examples.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::array::{FieldArray, TokenizedData};
use crate::config::{JobConfig, Mode, SpecialIds, TrainingObjective};
use crate::error::{PipelineError, Result};
use crate::reader::{Document, Frame, RecordShape};
use crate::stats::{DataStats, StatField};
use crate::tokenizer::SharedTokenizer;

mod dpo;
mod pretraining;

pub use dpo::DpoGenerator;
pub use pretraining::PretrainingGenerator;

/// Name of the field holding the stacked example rows.
pub const DATA_FIELD: &str = "data";

/// Examples and statistics produced from one document.
#[derive(Debug, Default)]
pub struct Encoded {
    pub data: TokenizedData,
    pub stats: DataStats,
}

impl Encoded {
    pub fn push(&mut self, field: &str, array: FieldArray) {
        self.data.entry(field.to_string()).or_default().push(array);
    }

    /// Number of examples in `field`.
    pub fn rows(&self, field: &str) -> usize {
        self.data
            .get(field)
            .map_or(0, |arrays| arrays.iter().map(FieldArray::rows).sum())
    }
}

/// Capability that encodes documents for one training task.
pub trait TokenGenerator: Send {
    /// Encode a single document.
    ///
    /// Document-level failures (`PipelineError::Document`,
    /// `PipelineError::Tokenizer`) discard only this document.
    fn encode(&mut self, document: Document) -> Result<Encoded>;

    /// How the reader should shape raw records for this generator.
    fn record_shape(&self) -> RecordShape;

    /// Row names of every example, in storage order.
    fn features(&self) -> Vec<String>;

    /// Trailing tokens held back for packing, emptied by the call.
    fn take_leftover(&mut self) -> Vec<u32> {
        Vec::new()
    }

    /// Encode the combined leftover tokens of every tokenizer worker.
    fn encode_leftover(&mut self, _leftover: Vec<u32>) -> Result<Encoded> {
        Ok(Encoded::default())
    }

    /// Encode every document of `frame` into `frame.tokenized`.
    ///
    /// Discarded documents are logged and counted in `frame.stats`.
    fn encode_frame(&mut self, frame: &mut Frame) -> Result<()> {
        let documents = std::mem::take(&mut frame.documents);
        for (offset, document) in documents.into_iter().enumerate() {
            match self.encode(document) {
                Ok(encoded) => {
                    frame.stats.merge(&encoded.stats);
                    for (field, arrays) in encoded.data {
                        frame.tokenized.entry(field).or_default().extend(arrays);
                    }
                }
                Err(err) if err.is_document_level() => {
                    log::warn!(
                        "discarding document {} of file {}: {err}",
                        frame.start_doc_index + offset,
                        frame.file_index
                    );
                    frame.stats[StatField::Processed] += 1;
                    frame.stats[StatField::Discarded] += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Built-in generators plus explicitly registered custom ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GeneratorKind {
    Pretraining,
    Fim,
    Dpo,
    Custom(String),
}

impl GeneratorKind {
    pub fn from_config(config: &JobConfig) -> Result<Self> {
        match config.setup.mode {
            Mode::Pretraining => Ok(match config.dataset.training_objective {
                TrainingObjective::Causal => GeneratorKind::Pretraining,
                TrainingObjective::Fim => GeneratorKind::Fim,
            }),
            Mode::Dpo => Ok(GeneratorKind::Dpo),
            Mode::Custom => config
                .setup
                .token_generator
                .clone()
                .map(GeneratorKind::Custom)
                .ok_or_else(|| {
                    PipelineError::Config("setup.token_generator is required".to_string())
                }),
        }
    }

    /// Whether the generator carries a packing prefix across frames.
    pub fn uses_leftover(&self, config: &JobConfig) -> bool {
        matches!(self, GeneratorKind::Pretraining | GeneratorKind::Fim)
            && config.dataset.pack_sequences
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneratorKind::Pretraining => write!(f, "pretraining"),
            GeneratorKind::Fim => write!(f, "fim"),
            GeneratorKind::Dpo => write!(f, "dpo"),
            GeneratorKind::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Everything a factory needs to build one generator instance.
#[derive(Clone)]
pub struct GeneratorContext<'a> {
    pub config: &'a JobConfig,
    pub tokenizer: SharedTokenizer,
    pub ids: SpecialIds,
    /// Distinct per worker so random choices do not repeat across workers.
    pub seed: u64,
}

pub type GeneratorFactory =
    Arc<dyn Fn(&GeneratorContext<'_>) -> Result<Box<dyn TokenGenerator>> + Send + Sync>;

/// Maps generator kinds to their constructors.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    factories: HashMap<GeneratorKind, GeneratorFactory>,
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GeneratorRegistry {
    /// Registry holding the pretraining, fill-in-the-middle and preference generators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(
            GeneratorKind::Pretraining,
            Arc::new(|ctx: &GeneratorContext<'_>| {
                Ok(Box::new(PretrainingGenerator::new(ctx)?) as Box<dyn TokenGenerator>)
            }),
        );
        registry.register(
            GeneratorKind::Fim,
            Arc::new(|ctx: &GeneratorContext<'_>| {
                Ok(Box::new(PretrainingGenerator::new(ctx)?) as Box<dyn TokenGenerator>)
            }),
        );
        registry.register(
            GeneratorKind::Dpo,
            Arc::new(|ctx: &GeneratorContext<'_>| {
                Ok(Box::new(DpoGenerator::new(ctx)) as Box<dyn TokenGenerator>)
            }),
        );
        registry
    }

    pub fn register(&mut self, kind: GeneratorKind, factory: GeneratorFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn contains(&self, kind: &GeneratorKind) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn build(
        &self,
        kind: &GeneratorKind,
        ctx: &GeneratorContext<'_>,
    ) -> Result<Box<dyn TokenGenerator>> {
        let factory = self.factories.get(kind).ok_or_else(|| {
            PipelineError::Config(format!("no token generator registered for '{kind}'"))
        })?;
        factory(ctx)
    }
}

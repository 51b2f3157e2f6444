//! Job configuration: `setup`, `processing` and `dataset` groups.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::tokenizer::Tokenizer;

/// Complete description of one preprocessing job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Pretraining,
    Dpo,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_processes")]
    pub processes: usize,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub data: DataSource,
    /// Files listing one input path per line. Replaces directory discovery.
    #[serde(default)]
    pub metadata_files: Vec<PathBuf>,
    /// Name of a registered custom token generator (`mode = "custom"`).
    #[serde(default)]
    pub token_generator: Option<String>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            processes: default_processes(),
            mode: Mode::default(),
            data: DataSource::default(),
            metadata_files: Vec::new(),
            token_generator: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSource {
    #[serde(rename = "type", default = "default_source_type")]
    pub kind: String,
    #[serde(default)]
    pub source: Option<PathBuf>,
}

impl Default for DataSource {
    fn default() -> Self {
        Self {
            kind: default_source_type(),
            source: None,
        }
    }
}

/// Names of the record fields each mode reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataKeys {
    #[serde(default)]
    pub text_key: Option<String>,
    #[serde(default)]
    pub prompt_key: Option<String>,
    #[serde(default)]
    pub chosen_key: Option<String>,
    #[serde(default)]
    pub rejected_key: Option<String>,
}

/// Writer count divisors for the role-split topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriterPolicy {
    #[serde(default = "default_sequential_divisor")]
    pub sequential_divisor: usize,
    #[serde(default = "default_shuffle_divisor")]
    pub shuffle_divisor: usize,
}

impl Default for WriterPolicy {
    fn default() -> Self {
        Self {
            sequential_divisor: default_sequential_divisor(),
            shuffle_divisor: default_shuffle_divisor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub huggingface_tokenizer: Option<String>,
    #[serde(default)]
    pub custom_tokenizer: Option<String>,
    #[serde(default)]
    pub eos_id: Option<u32>,
    #[serde(default)]
    pub pad_id: Option<u32>,
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,
    /// Frame byte budget in KB.
    #[serde(default = "default_chunk_size_kb")]
    pub read_chunk_size: u64,
    /// Shard byte budget in KB.
    #[serde(default = "default_chunk_size_kb")]
    pub write_chunk_size: u64,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub shuffle_seed: u64,
    #[serde(default)]
    pub resume_from_checkpoint: bool,
    #[serde(rename = "fraction_of_RAM_alloted", default = "default_ram_fraction")]
    pub fraction_of_ram_alloted: f64,
    #[serde(rename = "UNSAFE_skip_jsonl_decoding_errors", default)]
    pub unsafe_skip_decoding_errors: bool,
    #[serde(default = "default_true")]
    pub display_pbar: bool,
    #[serde(default)]
    pub read_hook_kwargs: DataKeys,
    #[serde(default)]
    pub writer_policy: WriterPolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            huggingface_tokenizer: None,
            custom_tokenizer: None,
            eos_id: None,
            pad_id: None,
            max_seq_length: default_max_seq_length(),
            max_prompt_length: default_max_prompt_length(),
            read_chunk_size: default_chunk_size_kb(),
            write_chunk_size: default_chunk_size_kb(),
            shuffle: false,
            shuffle_seed: 0,
            resume_from_checkpoint: false,
            fraction_of_ram_alloted: default_ram_fraction(),
            unsafe_skip_decoding_errors: false,
            display_pbar: true,
            read_hook_kwargs: DataKeys::default(),
            writer_policy: WriterPolicy::default(),
        }
    }
}

impl ProcessingConfig {
    pub fn read_chunk_bytes(&self) -> u64 {
        self.read_chunk_size * 1024
    }

    pub fn write_chunk_bytes(&self) -> u64 {
        self.write_chunk_size * 1024
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingObjective {
    #[default]
    Causal,
    Fim,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationMode {
    KeepStart,
    #[default]
    KeepEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    #[serde(default)]
    pub training_objective: TrainingObjective,
    #[serde(default = "default_true")]
    pub pack_sequences: bool,
    #[serde(default = "default_min_sequence_len")]
    pub min_sequence_len: usize,
    #[serde(default = "default_fim_rate")]
    pub fim_rate: f64,
    #[serde(default = "default_spm_rate")]
    pub spm_rate: f64,
    #[serde(default)]
    pub fim_prefix_tok: Option<String>,
    #[serde(default)]
    pub fim_middle_tok: Option<String>,
    #[serde(default)]
    pub fim_suffix_tok: Option<String>,
    #[serde(default)]
    pub fim_pad_tok: Option<String>,
    #[serde(default = "default_user_role")]
    pub user_role: String,
    #[serde(default = "default_assistant_role")]
    pub assistant_role: String,
    #[serde(default)]
    pub response_delimiter: Option<String>,
    #[serde(default)]
    pub truncation_mode: TruncationMode,
    #[serde(default)]
    pub wikitext_detokenize: bool,
    #[serde(default)]
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            training_objective: TrainingObjective::default(),
            pack_sequences: true,
            min_sequence_len: default_min_sequence_len(),
            fim_rate: default_fim_rate(),
            spm_rate: default_spm_rate(),
            fim_prefix_tok: None,
            fim_middle_tok: None,
            fim_suffix_tok: None,
            fim_pad_tok: None,
            user_role: default_user_role(),
            assistant_role: default_assistant_role(),
            response_delimiter: None,
            truncation_mode: TruncationMode::default(),
            wikitext_detokenize: false,
            seed: 0,
        }
    }
}

/// End-of-sequence and padding ids in effect for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpecialIds {
    pub eos_id: u32,
    pub pad_id: u32,
}

impl JobConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).map_err(|e| PipelineError::io(e, Some(path.to_path_buf())))?;
        let config: JobConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(PipelineError::Config(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every constraint and report all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let setup = &self.setup;
        let processing = &self.processing;
        let dataset = &self.dataset;

        match (&processing.huggingface_tokenizer, &processing.custom_tokenizer) {
            (Some(_), Some(_)) => errors.push(
                "processing.huggingface_tokenizer and processing.custom_tokenizer are mutually exclusive"
                    .to_string(),
            ),
            (None, None) => errors.push(
                "one of processing.huggingface_tokenizer or processing.custom_tokenizer is required"
                    .to_string(),
            ),
            _ => {}
        }

        if setup.processes == 0 {
            errors.push("setup.processes must be greater than 0".to_string());
        }
        if setup.data.kind != "local" {
            errors.push(format!(
                "setup.data.type '{}' is not supported, only 'local'",
                setup.data.kind
            ));
        }
        if setup.data.source.is_none() && setup.metadata_files.is_empty() {
            errors.push("setup.data.source or setup.metadata_files is required".to_string());
        }
        if processing.max_seq_length == 0 {
            errors.push("processing.max_seq_length must be greater than 0".to_string());
        }
        if processing.read_chunk_size == 0 {
            errors.push("processing.read_chunk_size must be greater than 0".to_string());
        }
        if processing.write_chunk_size == 0 {
            errors.push("processing.write_chunk_size must be greater than 0".to_string());
        }
        if !(processing.fraction_of_ram_alloted > 0.0 && processing.fraction_of_ram_alloted <= 1.0)
        {
            errors.push("processing.fraction_of_RAM_alloted must be in (0, 1]".to_string());
        }
        if processing.writer_policy.sequential_divisor == 0
            || processing.writer_policy.shuffle_divisor == 0
        {
            errors.push("processing.writer_policy divisors must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&dataset.fim_rate) {
            errors.push("dataset.fim_rate must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&dataset.spm_rate) {
            errors.push("dataset.spm_rate must be in [0, 1]".to_string());
        }

        let keys = &processing.read_hook_kwargs;
        match setup.mode {
            Mode::Pretraining => {
                if keys.text_key.is_none() {
                    errors.push("processing.read_hook_kwargs.text_key is required".to_string());
                }
                if dataset.training_objective == TrainingObjective::Fim {
                    for (name, value) in [
                        ("fim_prefix_tok", &dataset.fim_prefix_tok),
                        ("fim_middle_tok", &dataset.fim_middle_tok),
                        ("fim_suffix_tok", &dataset.fim_suffix_tok),
                    ] {
                        if value.is_none() {
                            errors.push(format!(
                                "dataset.{name} is required for the fim training objective"
                            ));
                        }
                    }
                }
            }
            Mode::Dpo => {
                if keys.chosen_key.is_none() || keys.rejected_key.is_none() {
                    errors.push(
                        "processing.read_hook_kwargs.chosen_key and rejected_key are required"
                            .to_string(),
                    );
                }
                if processing.max_prompt_length >= processing.max_seq_length {
                    errors.push(
                        "processing.max_prompt_length must be smaller than max_seq_length"
                            .to_string(),
                    );
                }
            }
            Mode::Custom => {
                if setup.token_generator.is_none() {
                    errors.push("setup.token_generator is required for custom mode".to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(errors.join("; ")))
        }
    }

    /// Resolve eos/pad ids from overrides and the tokenizer.
    pub fn special_ids(&self, tokenizer: &dyn Tokenizer) -> SpecialIds {
        let eos_id = self
            .processing
            .eos_id
            .unwrap_or_else(|| tokenizer.eos_token_id());
        let pad_id = match (self.processing.pad_id, self.processing.eos_id) {
            (Some(pad), _) => pad,
            (None, Some(_)) => eos_id,
            (None, None) => tokenizer.pad_token_id().unwrap_or(eos_id),
        };
        SpecialIds { eos_id, pad_id }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_processes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_source_type() -> String {
    "local".to_string()
}

fn default_sequential_divisor() -> usize {
    10
}

fn default_shuffle_divisor() -> usize {
    2
}

fn default_max_seq_length() -> usize {
    2048
}

fn default_max_prompt_length() -> usize {
    512
}

fn default_chunk_size_kb() -> u64 {
    1024
}

fn default_ram_fraction() -> f64 {
    0.7
}

fn default_true() -> bool {
    true
}

fn default_min_sequence_len() -> usize {
    10
}

fn default_fim_rate() -> f64 {
    0.9
}

fn default_spm_rate() -> f64 {
    0.5
}

fn default_user_role() -> String {
    "user".to_string()
}

fn default_assistant_role() -> String {
    "assistant".to_string()
}

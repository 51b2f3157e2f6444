//! CLI tool for preprocessing text corpora into tokenized training shards.
//!
//! Loads a JSON or TOML job file, builds the tokenizer (a HuggingFace
//! `tokenizer.json` or the built-in byte tokenizer), runs the pipeline and
//! prints the job summary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use log::LevelFilter;

use seqshard_core::{
    ByteTokenizer, GeneratorRegistry, JobConfig, JobSummary, Pipeline, PipelineError,
    SharedTokenizer, StatField, Tokenizer,
};

/// Tokenize, pack and shard a text corpus for training.
#[derive(Parser, Debug)]
#[command(name = "seqshard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Job configuration file (.json or .toml)
    #[arg(long, short)]
    config: PathBuf,

    /// Override setup.processes
    #[arg(long)]
    processes: Option<usize>,

    /// Override setup.output_dir
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Resume from the checkpoints in the output directory
    #[arg(long)]
    resume: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity (-q warn, -qq error)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,
}

const EOS_CANDIDATES: [&str; 5] = [
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<eos>",
];

const BOS_CANDIDATES: [&str; 3] = ["<s>", "<|begin_of_text|>", "<bos>"];

/// Wrapper around a HuggingFace `tokenizer.json`.
///
/// The Rust-native tokenizers library is `Send + Sync`, so one instance is
/// shared by every worker thread.
struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos_id: u32,
    bos_id: Option<u32>,
    adds_bos: bool,
}

impl HfTokenizer {
    /// Load `tokenizer.json` from a file or a model directory.
    fn load(path: &Path, eos_override: Option<u32>) -> Result<Self> {
        let file = if path.is_dir() {
            path.join("tokenizer.json")
        } else {
            path.to_path_buf()
        };
        let inner = tokenizers::Tokenizer::from_file(&file)
            .map_err(|e| anyhow!("cannot load tokenizer from {}: {e}", file.display()))?;

        let find = |candidates: &[&str]| candidates.iter().find_map(|token| inner.token_to_id(token));
        let eos_id = match (eos_override, find(&EOS_CANDIDATES[..])) {
            (Some(id), _) | (None, Some(id)) => id,
            (None, None) => bail!(
                "{} has no known end-of-sequence token; set processing.eos_id",
                file.display()
            ),
        };
        let bos_id = find(&BOS_CANDIDATES[..]);
        let adds_bos = match bos_id {
            Some(bos) => inner
                .encode("a", true)
                .map(|encoding| encoding.get_ids().first() == Some(&bos))
                .unwrap_or(false),
            None => false,
        };
        Ok(Self {
            inner,
            eos_id,
            bos_id,
            adds_bos,
        })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> seqshard_core::Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> seqshard_core::Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.inner.get_padding().map(|padding| padding.pad_id)
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos_id
    }

    fn adds_bos_token(&self) -> bool {
        self.adds_bos
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

fn build_tokenizer(config: &JobConfig) -> Result<SharedTokenizer> {
    let processing = &config.processing;
    if let Some(path) = &processing.huggingface_tokenizer {
        log::info!("loading tokenizer from {path}");
        let tokenizer = HfTokenizer::load(Path::new(path), processing.eos_id)?;
        return Ok(Arc::new(tokenizer));
    }
    match processing.custom_tokenizer.as_deref() {
        Some("bytes") => {
            let dataset = &config.dataset;
            let mut tokenizer = ByteTokenizer::new().with_special_tokens(
                [
                    &dataset.fim_prefix_tok,
                    &dataset.fim_middle_tok,
                    &dataset.fim_suffix_tok,
                ]
                .into_iter()
                .flatten()
                .cloned(),
            );
            if let Some(pad) = &dataset.fim_pad_tok {
                tokenizer = tokenizer.with_pad_token(pad);
            }
            Ok(Arc::new(tokenizer))
        }
        Some(other) => bail!("unknown custom tokenizer '{other}', expected 'bytes'"),
        None => bail!("no tokenizer configured"),
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    let level = match (quiet, verbose) {
        (1, _) => LevelFilter::Warn,
        (q, _) if q > 1 => LevelFilter::Error,
        (_, 0) => LevelFilter::Info,
        (_, 1) => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    builder.filter_level(level);
    let _ = builder.try_init();
}

fn print_summary(summary: &JobSummary, output_dir: &Path) {
    println!("\n[summary]");
    println!("  Topology: {}", summary.topology);
    for (name, count) in &summary.statistics {
        println!("  {name}: {count}");
    }
    println!(
        "  Average chars/bytes per sequence: {} / {}",
        summary.average_chars_per_sequence, summary.average_bytes_per_sequence
    );
    if let Some(factor) = summary.packing_factor {
        println!("  Packing factor: {factor:.3}");
    }
    println!("  Features: {}", summary.features.join(", "));
    println!("  Elapsed: {:.1}s", summary.elapsed_secs);
    println!("  Output: {}", output_dir.display());
    println!("  Metadata: {}", output_dir.join("data_params.json").display());
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let mut config = JobConfig::from_path(&args.config)
        .with_context(|| format!("invalid job configuration {}", args.config.display()))?;
    if let Some(processes) = args.processes {
        config.setup.processes = processes;
    }
    if let Some(output_dir) = args.output_dir {
        config.setup.output_dir = output_dir;
    }
    if args.resume {
        config.processing.resume_from_checkpoint = true;
    }
    let output_dir = config.setup.output_dir.clone();

    let tokenizer = build_tokenizer(&config)?;
    let pipeline = Pipeline::new(config, tokenizer, GeneratorRegistry::with_defaults())
        .context("cannot start the preprocessing job")?;
    let summary = pipeline.run().context("preprocessing job failed")?;

    print_summary(&summary, &output_dir);
    if summary.examples() == 0 && summary.stat(StatField::Processed) > 0 {
        log::warn!("every document was discarded, no examples were written");
    }
    if !summary.succeeded() {
        bail!(
            "{} workers failed: {}",
            summary.failed_workers.len(),
            summary.failed_workers.join("; ")
        );
    }
    Ok(())
}

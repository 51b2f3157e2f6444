//! Pipeline orchestrator: plans the worker topology, runs reader, tokenizer
//! and writer threads connected by bounded queues, checkpoints every flushed
//! shard and writes the job summary.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::config::{JobConfig, SpecialIds, WriterPolicy};
use crate::error::{PipelineError, Result};
use crate::generator::{GeneratorContext, GeneratorKind, GeneratorRegistry, TokenGenerator};
use crate::memory::{available_memory_bytes, estimate_queue_capacity};
use crate::reader::{estimated_input_bytes, resolve_input_files, Frame, ReadPosition, Reader, RecordShape};
use crate::shard::{
    append_shuffled, list_shards, sequential_shard_name, shuffle_shard_in_place, write_shard,
    LockPool, ShardBuffer, ShardFile,
};
use crate::stats::{DataStats, SharedStats, StatField};
use crate::text::{format_time, human_readable_size};
use crate::tokenizer::SharedTokenizer;

/// Bucket locks used when a dedicated writer role exists.
const ROLE_SPLIT_LOCKS: usize = 128;

/// Share of available memory the shuffle pass may use.
const SHUFFLE_MEMORY_FRACTION: f64 = 0.4;

const PARAMS_FILE: &str = "data_params.json";

/// Frame on its way through the queues; `None` ends the stream.
type Packet = Option<(u64, Frame)>;

/// Trailing packing tokens of one worker, tagged with the worker index.
type Leftover = (usize, Vec<u32>);

/// How the configured processes are split into roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    /// Every worker reads, tokenizes and writes its own share of the files.
    FileSplit { workers: usize },
    /// One reader feeding `tokenizers`, whose output `writers` flush.
    RoleSplit { tokenizers: usize, writers: usize },
}

impl Topology {
    pub fn plan(processes: usize, shuffle: bool, policy: &WriterPolicy) -> Self {
        if processes < 3 {
            return Topology::FileSplit {
                workers: processes.max(1),
            };
        }
        let rest = processes - 1;
        let writers = if shuffle {
            rest / policy.shuffle_divisor.max(1)
        } else {
            rest.div_ceil(policy.sequential_divisor.max(1))
        };
        // every writer needs at least one tokenizer queue
        let writers = writers.clamp(1, rest / 2);
        Topology::RoleSplit {
            tokenizers: rest - writers,
            writers,
        }
    }

    /// Number of workers that own checkpoint files.
    pub fn checkpoint_workers(&self) -> usize {
        match *self {
            Topology::FileSplit { workers } => workers,
            Topology::RoleSplit { writers, .. } => writers,
        }
    }

    /// Worker id of the leftover finalizer, after every checkpointing worker.
    pub fn finalizer_id(&self) -> usize {
        self.checkpoint_workers()
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::FileSplit { workers } => write!(f, "file-split with {workers} workers"),
            Topology::RoleSplit {
                tokenizers,
                writers,
            } => write!(
                f,
                "role-split with 1 reader, {tokenizers} tokenizers and {writers} writers"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Reader,
    Tokenizer,
    Writer,
    FileWorker,
    Finalizer,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerRole::Reader => "reader",
            WorkerRole::Tokenizer => "tokenizer",
            WorkerRole::Writer => "writer",
            WorkerRole::FileWorker => "worker",
            WorkerRole::Finalizer => "finalizer",
        };
        f.write_str(name)
    }
}

/// Completion message every worker sends before exiting.
#[derive(Debug)]
struct WorkerEvent {
    role: WorkerRole,
    id: usize,
    outcome: std::result::Result<(), String>,
}

struct WorkerHandle<'scope> {
    role: WorkerRole,
    id: usize,
    handle: ScopedJoinHandle<'scope, ()>,
}

fn spawn_worker<'scope, F>(
    scope: &'scope Scope<'scope, '_>,
    events: &Sender<WorkerEvent>,
    role: WorkerRole,
    id: usize,
    body: F,
) -> WorkerHandle<'scope>
where
    F: FnOnce() -> Result<()> + Send + 'scope,
{
    let events = events.clone();
    let handle = scope.spawn(move || {
        let outcome = body().map_err(|err| err.to_string());
        // the parent drains events until every worker has exited
        events.send(WorkerEvent { role, id, outcome }).ok();
    });
    WorkerHandle { role, id, handle }
}

/// State shared by every worker of one run.
struct Shared {
    stats: SharedStats,
    locks: LockPool,
    buckets: usize,
}

/// Final statistics and metadata of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub topology: Topology,
    pub statistics: BTreeMap<String, u64>,
    pub average_chars_per_sequence: u64,
    pub average_bytes_per_sequence: u64,
    /// Documents per example, when packing was used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packing_factor: Option<f64>,
    pub features: Vec<String>,
    pub eos_id: u32,
    pub pad_id: u32,
    pub vocab_size: usize,
    pub failed_workers: Vec<String>,
    pub elapsed_secs: f64,
}

impl JobSummary {
    pub fn stat(&self, field: StatField) -> u64 {
        self.statistics.get(field.as_str()).copied().unwrap_or(0)
    }

    pub fn examples(&self) -> u64 {
        self.stat(StatField::Examples)
    }

    pub fn succeeded(&self) -> bool {
        self.failed_workers.is_empty()
    }

    fn new(
        pipeline: &Pipeline,
        stats: &DataStats,
        failed_workers: Vec<String>,
        elapsed: Duration,
    ) -> Self {
        let statistics: BTreeMap<String, u64> = StatField::ALL
            .iter()
            .filter(|field| !(field.is_optional() && stats[**field] == 0))
            .map(|&field| (field.as_str().to_string(), stats[field]))
            .collect();
        let examples = stats[StatField::Examples];
        let per_example = |total: u64| {
            if examples == 0 {
                0
            } else {
                total.div_ceil(examples)
            }
        };
        let packed = stats[StatField::NumSequencesBeforePacking];
        Self {
            topology: pipeline.topology,
            statistics,
            average_chars_per_sequence: per_example(stats[StatField::RawCharsCount]),
            average_bytes_per_sequence: per_example(stats[StatField::RawBytesCount]),
            packing_factor: (pipeline.config.dataset.pack_sequences && examples > 0 && packed > 0)
                .then(|| packed as f64 / examples as f64),
            features: pipeline.features.clone(),
            eos_id: pipeline.ids.eos_id,
            pad_id: pipeline.ids.pad_id,
            vocab_size: pipeline.tokenizer.vocab_size(),
            failed_workers,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    /// The `post-process` section of the job metadata file.
    fn post_process(&self) -> serde_json::Value {
        let mut section = serde_json::Map::new();
        let renamed = [
            ("discarded", "discarded_files"),
            ("processed", "processed_files"),
            ("successful", "successful_files"),
            ("examples", "n_examples"),
        ];
        for (name, &count) in &self.statistics {
            let key = renamed
                .iter()
                .find(|(from, _)| from == name)
                .map_or(name.as_str(), |(_, to)| to);
            section.insert(key.to_string(), count.into());
        }
        section.insert(
            "average_chars_per_sequence".into(),
            self.average_chars_per_sequence.into(),
        );
        section.insert(
            "average_bytes_per_sequence".into(),
            self.average_bytes_per_sequence.into(),
        );
        if let Some(factor) = self.packing_factor {
            section.insert("vsl_packing_factor".into(), factor.into());
        }
        section.insert("eos_id".into(), self.eos_id.into());
        section.insert("pad_id".into(), self.pad_id.into());
        section.insert("vocab_size".into(), self.vocab_size.into());
        serde_json::Value::Object(section)
    }
}

/// A validated, ready-to-run preprocessing job.
pub struct Pipeline {
    config: JobConfig,
    tokenizer: SharedTokenizer,
    registry: GeneratorRegistry,
    kind: GeneratorKind,
    files: Vec<PathBuf>,
    topology: Topology,
    queue_capacity: usize,
    ids: SpecialIds,
    shape: RecordShape,
    features: Vec<String>,
    store: CheckpointStore,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("kind", &self.kind)
            .field("files", &self.files.len())
            .field("topology", &self.topology)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl Pipeline {
    /// Validate the job and prepare its output directory.
    ///
    /// Every configuration problem is reported here, before any worker starts.
    pub fn new(
        config: JobConfig,
        tokenizer: SharedTokenizer,
        registry: GeneratorRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let kind = GeneratorKind::from_config(&config)?;
        if !registry.contains(&kind) {
            return Err(PipelineError::Config(format!(
                "no token generator registered for '{kind}'"
            )));
        }

        let files = resolve_input_files(&config.setup)?;
        let processing = &config.processing;
        let topology = Topology::plan(
            config.setup.processes,
            processing.shuffle,
            &processing.writer_policy,
        );
        let queue_capacity = match topology {
            Topology::FileSplit { .. } => 0,
            Topology::RoleSplit { .. } => estimate_queue_capacity(
                available_memory_bytes(),
                processing.fraction_of_ram_alloted,
                processing.read_chunk_bytes(),
                config.setup.processes - 1,
            )?,
        };

        let ids = config.special_ids(tokenizer.as_ref());
        let template = registry.build(
            &kind,
            &GeneratorContext {
                config: &config,
                tokenizer: tokenizer.clone(),
                ids,
                seed: config.dataset.seed,
            },
        )?;
        let shape = template.record_shape();
        let features = template.features();

        let output_dir = &config.setup.output_dir;
        fs::create_dir_all(output_dir).map_err(PipelineError::at(output_dir))?;
        if !processing.resume_from_checkpoint && !list_shards(output_dir)?.is_empty() {
            return Err(PipelineError::Config(format!(
                "{} already contains shards; enable resume_from_checkpoint or choose another output_dir",
                output_dir.display()
            )));
        }
        let params = serde_json::to_vec_pretty(&config)?;
        let params_path = output_dir.join(PARAMS_FILE);
        fs::write(&params_path, params).map_err(PipelineError::at(&params_path))?;

        log::info!(
            "{} input files ({}), {kind} generator, {topology}, queue capacity {queue_capacity}",
            files.len(),
            human_readable_size(estimated_input_bytes(&files))
        );
        Ok(Self {
            store: CheckpointStore::new(output_dir),
            config,
            tokenizer,
            registry,
            kind,
            files,
            topology,
            queue_capacity,
            ids,
            shape,
            features,
        })
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Run the job to completion.
    ///
    /// Worker failures do not abort the run: they are logged and listed in
    /// [`JobSummary::failed_workers`].
    pub fn run(&self) -> Result<JobSummary> {
        let started = Instant::now();
        let processing = &self.config.processing;
        let input_bytes = estimated_input_bytes(&self.files);
        let shared = Shared {
            stats: SharedStats::new(),
            locks: LockPool::new(match self.topology {
                Topology::FileSplit { .. } => thread::available_parallelism().map_or(1, |n| n.get()),
                Topology::RoleSplit { .. } => ROLE_SPLIT_LOCKS,
            }),
            buckets: input_bytes.div_ceil(processing.write_chunk_bytes()).max(1) as usize,
        };
        if processing.resume_from_checkpoint {
            let prior = self.store.aggregate_stats()?;
            log::info!(
                "resuming with {} examples already written",
                prior[StatField::Examples]
            );
            shared.stats.add(&prior);
        }
        let total_chunks = input_bytes.div_ceil(processing.read_chunk_bytes());
        let done = AtomicBool::new(false);

        let failed_workers = thread::scope(|scope| {
            let monitor = processing
                .display_pbar
                .then(|| scope.spawn(|| monitor_progress(&shared.stats, &done, total_chunks)));

            let (events_tx, events_rx) = mpsc::channel();
            let handles = match self.topology {
                Topology::FileSplit { workers } => {
                    self.launch_file_split(scope, &shared, &events_tx, workers)
                }
                Topology::RoleSplit {
                    tokenizers,
                    writers,
                } => self.launch_role_split(scope, &shared, &events_tx, tokenizers, writers),
            };
            drop(events_tx);

            let failed = collect_failures(events_rx, handles);
            done.store(true, Ordering::Relaxed);
            if let Some(monitor) = monitor {
                monitor.join().ok();
            }
            failed
        });

        if processing.shuffle && failed_workers.is_empty() {
            self.shuffle_shards()?;
        }

        let summary = JobSummary::new(
            self,
            &shared.stats.snapshot(),
            failed_workers,
            started.elapsed(),
        );
        self.write_post_process(&summary)?;
        log::info!(
            "wrote {} examples in {}",
            summary.examples(),
            format_time(started.elapsed().as_secs())
        );
        Ok(summary)
    }

    fn build_generator(&self, worker_id: usize) -> Result<Box<dyn TokenGenerator>> {
        self.registry.build(
            &self.kind,
            &GeneratorContext {
                config: &self.config,
                tokenizer: self.tokenizer.clone(),
                ids: self.ids,
                seed: self.config.dataset.seed.wrapping_add(worker_id as u64),
            },
        )
    }

    fn reader(&self, files: Vec<PathBuf>) -> Reader {
        let processing = &self.config.processing;
        Reader::new(
            files,
            processing.read_chunk_bytes(),
            self.shape,
            processing.read_hook_kwargs.clone(),
            processing.unsafe_skip_decoding_errors,
        )
    }

    fn uses_leftover(&self) -> bool {
        self.kind.uses_leftover(&self.config)
    }

    fn launch_file_split<'scope, 'env>(
        &'env self,
        scope: &'scope Scope<'scope, 'env>,
        shared: &'env Shared,
        events: &Sender<WorkerEvent>,
        workers: usize,
    ) -> Vec<WorkerHandle<'scope>> {
        let (prefix_tx, prefix_rx) = self.prefix_channel();
        let mut handles: Vec<WorkerHandle<'scope>> = (0..workers)
            .map(|id| {
                let prefix = prefix_tx.clone();
                spawn_worker(scope, events, WorkerRole::FileWorker, id, move || {
                    self.file_worker(shared, id, workers, prefix)
                })
            })
            .collect();
        drop(prefix_tx);
        if let Some(prefixes) = prefix_rx {
            let id = self.topology.finalizer_id();
            handles.push(spawn_worker(scope, events, WorkerRole::Finalizer, id, move || {
                self.finalize_leftover(shared, prefixes)
            }));
        }
        handles
    }

    fn launch_role_split<'scope, 'env>(
        &'env self,
        scope: &'scope Scope<'scope, 'env>,
        shared: &'env Shared,
        events: &Sender<WorkerEvent>,
        tokenizers: usize,
        writers: usize,
    ) -> Vec<WorkerHandle<'scope>> {
        let capacity = self.queue_capacity;
        let (input_txs, input_rxs): (Vec<SyncSender<Packet>>, Vec<Receiver<Packet>>) =
            (0..tokenizers).map(|_| mpsc::sync_channel(capacity)).unzip();
        let (output_txs, output_rxs): (Vec<SyncSender<Packet>>, Vec<Receiver<Packet>>) =
            (0..tokenizers).map(|_| mpsc::sync_channel(capacity)).unzip();
        let (prefix_tx, prefix_rx) = self.prefix_channel();

        let mut handles = vec![spawn_worker(scope, events, WorkerRole::Reader, 0, move || {
            self.read_frames(shared, input_txs, writers)
        })];

        for (id, (input, output)) in input_rxs.into_iter().zip(output_txs).enumerate() {
            let prefix = prefix_tx.clone();
            handles.push(spawn_worker(scope, events, WorkerRole::Tokenizer, id, move || {
                self.tokenize_frames(id, input, output, prefix)
            }));
        }
        drop(prefix_tx);

        let mut owned: Vec<Vec<(usize, Receiver<Packet>)>> = (0..writers).map(|_| Vec::new()).collect();
        for (queue, rx) in output_rxs.into_iter().enumerate() {
            owned[queue % writers].push((queue, rx));
        }
        for (id, queues) in owned.into_iter().enumerate() {
            handles.push(spawn_worker(scope, events, WorkerRole::Writer, id, move || {
                self.write_frames(shared, id, queues, tokenizers, writers)
            }));
        }

        if let Some(prefixes) = prefix_rx {
            let id = self.topology.finalizer_id();
            handles.push(spawn_worker(scope, events, WorkerRole::Finalizer, id, move || {
                self.finalize_leftover(shared, prefixes)
            }));
        }
        handles
    }

    fn prefix_channel(&self) -> (Option<Sender<Leftover>>, Option<Receiver<Leftover>>) {
        if self.uses_leftover() {
            let (tx, rx) = mpsc::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        }
    }

    /// Read, tokenize and write every `workers`-th input file.
    fn file_worker(
        &self,
        shared: &Shared,
        id: usize,
        workers: usize,
        prefix: Option<Sender<Leftover>>,
    ) -> Result<()> {
        let (global_index, files): (Vec<usize>, Vec<PathBuf>) = self
            .files
            .iter()
            .enumerate()
            .filter(|(index, _)| index % workers == id)
            .map(|(index, path)| (index, path.clone()))
            .unzip();
        let mut sink = ShardSink::open(self, shared, id);
        let start = sink.record;
        if start != CheckpointRecord::default() {
            log::info!("worker {id} resumes at {start}");
        }

        let mut generator = self.build_generator(id)?;
        let reader = self.reader(files);
        let mut chunk = start.chunk_number;
        for frame in reader.stream(start.position()) {
            let mut frame = frame?;
            let file_index = global_index[frame.file_index];
            generator.encode_frame(&mut frame)?;
            sink.accept(frame, chunk, file_index)?;
            shared.stats.advance_progress(1);
            chunk += 1;
        }
        sink.finish()?;

        if let Some(prefix) = prefix {
            prefix
                .send((id, generator.take_leftover()))
                .map_err(|_| PipelineError::Worker("leftover finalizer stopped".to_string()))?;
        }
        Ok(())
    }

    /// Distribute frames round-robin over the tokenizer queues.
    ///
    /// Reading restarts at the least advanced writer; chunks every owning
    /// writer has already flushed are skipped.
    fn read_frames(
        &self,
        shared: &Shared,
        queues: Vec<SyncSender<Packet>>,
        writers: usize,
    ) -> Result<()> {
        let tokenizers = queues.len() as u64;
        let checkpoints = self.store.load_all(writers);
        let start = checkpoints
            .iter()
            .min_by_key(|record| record.chunk_number)
            .copied()
            .unwrap_or_default();
        if start != CheckpointRecord::default() {
            log::info!("reader resumes at {start}");
        }

        let reader = self.reader(self.files.clone());
        let mut chunk = start.chunk_number;
        for frame in reader.stream(start.position()) {
            let frame = frame?;
            let tokenizer = (chunk % tokenizers) as usize;
            let writer = tokenizer % writers;
            if chunk >= checkpoints[writer].chunk_number {
                queues[tokenizer]
                    .send(Some((chunk, frame)))
                    .map_err(|_| {
                        PipelineError::Worker(format!("tokenizer {tokenizer} stopped accepting frames"))
                    })?;
            } else {
                shared.stats.advance_progress(1);
            }
            chunk += 1;
        }
        for queue in &queues {
            queue.send(None).ok();
        }
        Ok(())
    }

    fn tokenize_frames(
        &self,
        id: usize,
        input: Receiver<Packet>,
        output: SyncSender<Packet>,
        prefix: Option<Sender<Leftover>>,
    ) -> Result<()> {
        let mut generator = self.build_generator(id)?;
        // a disconnected reader ends the stream like a sentinel
        while let Ok(Some((chunk, mut frame))) = input.recv() {
            generator.encode_frame(&mut frame)?;
            output
                .send(Some((chunk, frame)))
                .map_err(|_| PipelineError::Worker(format!("writer of tokenizer {id} stopped")))?;
        }
        if let Some(prefix) = prefix {
            prefix
                .send((id, generator.take_leftover()))
                .map_err(|_| PipelineError::Worker("leftover finalizer stopped".to_string()))?;
        }
        output.send(None).ok();
        Ok(())
    }

    /// Drain the owned tokenizer queues in chunk order.
    fn write_frames(
        &self,
        shared: &Shared,
        id: usize,
        mut queues: Vec<(usize, Receiver<Packet>)>,
        tokenizers: usize,
        writers: usize,
    ) -> Result<()> {
        let mut sink = ShardSink::open(self, shared, id);
        let start = sink.record;
        if start != CheckpointRecord::default() {
            log::info!("writer {id} resumes at {start}");
        }
        let first_queue = (0..tokenizers as u64)
            .map(|offset| ((start.chunk_number + offset) % tokenizers as u64) as usize)
            .find(|queue| queue % writers == id);
        let mut next = first_queue
            .and_then(|first| queues.iter().position(|(queue, _)| *queue == first))
            .unwrap_or(0);

        while !queues.is_empty() {
            next %= queues.len();
            match queues[next].1.recv() {
                Ok(Some((chunk, frame))) => {
                    let file_index = frame.file_index;
                    sink.accept(frame, chunk, file_index)?;
                    shared.stats.advance_progress(1);
                    next += 1;
                }
                Ok(None) => {
                    queues.remove(next);
                }
                // a tokenizer that died without a sentinel leaves a gap in
                // the chunk sequence; nothing past it may be checkpointed
                Err(_) => {
                    let queue = queues[next].0;
                    return Err(PipelineError::Worker(format!(
                        "tokenizer {queue} stopped before the end of its stream"
                    )));
                }
            }
        }
        sink.finish()
    }

    /// Encode the combined leftover of every worker into one final shard.
    fn finalize_leftover(&self, shared: &Shared, prefixes: Receiver<Leftover>) -> Result<()> {
        let mut parts: Vec<Leftover> = prefixes.iter().collect();
        parts.sort_by_key(|(worker, _)| *worker);
        let tokens: Vec<u32> = parts.into_iter().flat_map(|(_, tokens)| tokens).collect();
        if tokens.is_empty() {
            return Ok(());
        }

        let id = self.topology.finalizer_id();
        let mut generator = self.build_generator(id)?;
        let encoded = generator.encode_leftover(tokens)?;
        let shard = ShardFile::from_tokenized(&encoded.data)?;
        let mut stats = encoded.stats;
        if !shard.is_empty() {
            let output_dir = &self.config.setup.output_dir;
            if self.config.processing.shuffle {
                let mut rng = StdRng::seed_from_u64(
                    self.config.processing.shuffle_seed.wrapping_add(id as u64),
                );
                append_shuffled(&shard, output_dir, shared.buckets, &shared.locks, &mut rng)?;
            } else {
                write_shard(&output_dir.join(sequential_shard_name(id, 0, 0, 0)), &shard)?;
            }
            stats[StatField::Examples] += shard.n_examples;
        }

        let mut cumulative = self.store.load_stats(id);
        cumulative.merge(&stats);
        self.store.save_stats(id, &cumulative)?;
        shared.stats.add(&stats);
        Ok(())
    }

    /// Second shuffle pass: permute the rows of every bucket shard.
    fn shuffle_shards(&self) -> Result<()> {
        let shards = list_shards(&self.config.setup.output_dir)?;
        let Some(first) = shards.first() else {
            return Ok(());
        };
        // each task holds the shard and its permuted copy
        let shard_bytes = fs::metadata(first).map_err(PipelineError::at(first))?.len().max(1) * 2;
        let budget = SHUFFLE_MEMORY_FRACTION * available_memory_bytes() as f64;
        let threads = ((budget / shard_bytes as f64).ceil() as usize)
            .clamp(1, self.config.setup.processes.max(1));
        log::info!("shuffling {} shards with {threads} threads", shards.len());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| PipelineError::Worker(format!("cannot start the shuffle pool: {e}")))?;
        let seed = self.config.processing.shuffle_seed;
        pool.install(|| {
            shards
                .par_iter()
                .enumerate()
                .try_for_each(|(index, path)| {
                    shuffle_shard_in_place(path, seed.wrapping_add(index as u64)).map(|_| ())
                })
        })
    }

    fn write_post_process(&self, summary: &JobSummary) -> Result<()> {
        let path = self.config.setup.output_dir.join(PARAMS_FILE);
        let mut params: serde_json::Value = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(_) => serde_json::to_value(&self.config)?,
        };
        if let Some(object) = params.as_object_mut() {
            object.insert("post-process".to_string(), summary.post_process());
            object.insert("features".to_string(), summary.features.clone().into());
        }
        fs::write(&path, serde_json::to_vec_pretty(&params)?).map_err(PipelineError::at(&path))
    }
}

/// Receive completion events, then join every worker.
fn collect_failures(events: Receiver<WorkerEvent>, handles: Vec<WorkerHandle<'_>>) -> Vec<String> {
    let mut failed = Vec::new();
    for event in events {
        match event.outcome {
            Ok(()) => log::debug!("{} {} finished", event.role, event.id),
            Err(err) => {
                log::error!("{} {} failed: {err}", event.role, event.id);
                failed.push(format!("{} {}: {err}", event.role, event.id));
            }
        }
    }
    for worker in handles {
        if worker.handle.join().is_err() {
            log::error!("{} {} panicked", worker.role, worker.id);
            failed.push(format!("{} {}: panicked", worker.role, worker.id));
        }
    }
    failed
}

fn monitor_progress(stats: &SharedStats, done: &AtomicBool, total_chunks: u64) {
    let bar = ProgressBar::new(total_chunks.max(1));
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} chunks {msg}")
    {
        bar.set_style(style.progress_chars("=>-"));
    }
    while !done.load(Ordering::Relaxed) {
        let position = stats.progress();
        if position > bar.length().unwrap_or(0) {
            bar.set_length(position);
        }
        bar.set_position(position);
        bar.set_message(format!(
            "processed {} discarded {}",
            stats.get(StatField::Processed),
            stats.get(StatField::Discarded)
        ));
        thread::sleep(Duration::from_millis(200));
    }
    bar.finish_with_message("done");
}

/// Buffers one worker's frames into shards and checkpoints what was flushed.
struct ShardSink<'a> {
    pipeline: &'a Pipeline,
    shared: &'a Shared,
    worker_id: usize,
    /// Last committed checkpoint.
    record: CheckpointRecord,
    /// Statistics of every committed frame, across resumes.
    cumulative: DataStats,
    pending: DataStats,
    pending_position: Option<(ReadPosition, u64)>,
    buffer: ShardBuffer,
    /// `(file, start doc, chunk)` of the first frame in the buffer.
    first: Option<(usize, usize, u64)>,
    rng: StdRng,
}

impl<'a> ShardSink<'a> {
    fn open(pipeline: &'a Pipeline, shared: &'a Shared, worker_id: usize) -> Self {
        let seed = pipeline
            .config
            .processing
            .shuffle_seed
            .wrapping_add(worker_id as u64);
        Self {
            pipeline,
            shared,
            worker_id,
            record: pipeline.store.load(worker_id),
            cumulative: pipeline.store.load_stats(worker_id),
            pending: DataStats::new(),
            pending_position: None,
            buffer: ShardBuffer::new(),
            first: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn accept(&mut self, frame: Frame, chunk_number: u64, file_index: usize) -> Result<()> {
        self.first
            .get_or_insert((file_index, frame.start_doc_index, chunk_number));
        self.pending_position = Some((frame.next_position(), chunk_number + 1));
        self.pending.merge(&frame.stats);
        self.buffer.push(frame.tokenized);

        if self.buffer.is_empty() {
            self.commit()
        } else if self.buffer.byte_size() >= self.pipeline.config.processing.write_chunk_bytes() {
            self.flush()
        } else {
            Ok(())
        }
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            let shard = self.buffer.take()?;
            let output_dir = &self.pipeline.config.setup.output_dir;
            if self.pipeline.config.processing.shuffle {
                append_shuffled(
                    &shard,
                    output_dir,
                    self.shared.buckets,
                    &self.shared.locks,
                    &mut self.rng,
                )?;
            } else {
                let (file, doc, chunk) = self.first.unwrap_or((0, 0, self.record.chunk_number));
                let name = sequential_shard_name(self.worker_id, file, doc, chunk);
                write_shard(&output_dir.join(name), &shard)?;
            }
            self.pending[StatField::Examples] += shard.n_examples;
            self.record.chunks_written += 1;
            self.record.sequences_written += shard.n_examples;
        }
        self.commit()
    }

    /// Persist statistics and checkpoint for everything flushed so far.
    fn commit(&mut self) -> Result<()> {
        let Some((position, next_chunk)) = self.pending_position.take() else {
            return Ok(());
        };
        self.record.file_index = position.file_index;
        self.record.doc_index = position.doc_index;
        self.record.chunk_number = next_chunk;

        let store = &self.pipeline.store;
        self.cumulative.merge(&self.pending);
        store.save(self.worker_id, &self.record)?;
        store.save_stats(self.worker_id, &self.cumulative)?;
        self.shared.stats.add(&self.pending);
        self.pending = DataStats::new();
        self.first = None;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::chat::ChatMessage;
    use crate::config::{DataKeys, Mode};
    use crate::generator::{Encoded, GeneratorFactory, DATA_FIELD};
    use crate::reader::Document;
    use crate::shard::read_shard;
    use crate::array::{ArrayValues, FieldArray};
    use crate::tokenizer::ByteTokenizer;
    use tempfile::TempDir;

    fn write_inputs(dir: &Path, files: usize, docs: usize) {
        for file in 0..files {
            let mut contents = String::new();
            for doc in 0..docs {
                let text = format!(
                    "document {doc} of file {file}: {}",
                    "lorem ipsum ".repeat(doc % 7 + 3)
                );
                contents.push_str(&serde_json::json!({ "text": text }).to_string());
                contents.push('\n');
            }
            fs::write(dir.join(format!("part_{file}.jsonl")), contents).unwrap();
        }
    }

    fn job(input: &Path, output: &Path, processes: usize) -> JobConfig {
        let mut config = JobConfig::default();
        config.setup.output_dir = output.to_path_buf();
        config.setup.processes = processes;
        config.setup.data.source = Some(input.to_path_buf());
        config.processing.custom_tokenizer = Some("bytes".into());
        config.processing.max_seq_length = 32;
        config.processing.read_chunk_size = 1;
        config.processing.write_chunk_size = 2;
        config.processing.display_pbar = false;
        config.processing.read_hook_kwargs = DataKeys {
            text_key: Some("text".into()),
            ..DataKeys::default()
        };
        config
    }

    fn run_job(config: JobConfig) -> JobSummary {
        run_with(config, GeneratorRegistry::with_defaults())
    }

    fn run_with(config: JobConfig, registry: GeneratorRegistry) -> JobSummary {
        Pipeline::new(config, Arc::new(ByteTokenizer::new()), registry)
            .unwrap()
            .run()
            .unwrap()
    }

    fn all_rows(dir: &Path) -> Vec<Vec<i64>> {
        let mut rows = Vec::new();
        for path in list_shards(dir).unwrap() {
            let shard = read_shard(&path).unwrap();
            let array = &shard.datasets[DATA_FIELD];
            rows.extend((0..array.rows()).map(|i| array.int_row(i).unwrap()));
        }
        rows.sort();
        rows
    }

    #[test]
    fn test_topology_plan() {
        let policy = WriterPolicy::default();
        assert_eq!(
            Topology::plan(2, false, &policy),
            Topology::FileSplit { workers: 2 }
        );
        assert_eq!(
            Topology::plan(5, false, &policy),
            Topology::RoleSplit {
                tokenizers: 3,
                writers: 1
            }
        );
        assert_eq!(
            Topology::plan(5, true, &policy),
            Topology::RoleSplit {
                tokenizers: 2,
                writers: 2
            }
        );
        assert_eq!(
            Topology::plan(3, true, &policy),
            Topology::RoleSplit {
                tokenizers: 1,
                writers: 1
            }
        );
    }

    #[test]
    fn test_topologies_produce_same_examples() {
        let input = TempDir::new().unwrap();
        write_inputs(input.path(), 3, 40);

        let split = TempDir::new().unwrap();
        let mut config = job(input.path(), split.path(), 2);
        config.dataset.pack_sequences = false;
        let file_split = run_job(config);
        assert!(file_split.succeeded());

        let roles = TempDir::new().unwrap();
        let mut config = job(input.path(), roles.path(), 5);
        config.dataset.pack_sequences = false;
        let role_split = run_job(config);
        assert!(role_split.succeeded());

        assert!(file_split.examples() > 0);
        assert_eq!(file_split.examples(), role_split.examples());
        assert_eq!(all_rows(split.path()), all_rows(roles.path()));
        assert_eq!(file_split.stat(StatField::TotalRawDocs), 120);
        assert_eq!(role_split.stat(StatField::Processed), 120);
    }

    #[test]
    fn test_resume_is_idempotent() {
        for processes in [2, 5] {
            let input = TempDir::new().unwrap();
            write_inputs(input.path(), 2, 50);
            let output = TempDir::new().unwrap();

            let first = run_job(job(input.path(), output.path(), processes));
            assert!(first.succeeded());
            let shards = list_shards(output.path()).unwrap();
            let rows = all_rows(output.path());

            let mut config = job(input.path(), output.path(), processes);
            config.processing.resume_from_checkpoint = true;
            let second = run_job(config);
            assert!(second.succeeded());
            assert_eq!(second.statistics, first.statistics);
            assert_eq!(list_shards(output.path()).unwrap(), shards);
            assert_eq!(all_rows(output.path()), rows);
        }
    }

    #[test]
    fn test_resume_after_partial_run() {
        let input = TempDir::new().unwrap();
        write_inputs(input.path(), 2, 30);

        let full = TempDir::new().unwrap();
        let mut config = job(input.path(), full.path(), 2);
        config.dataset.pack_sequences = false;
        let complete = run_job(config);

        // first pass sees only the first file
        let partial_input = TempDir::new().unwrap();
        fs::copy(
            input.path().join("part_0.jsonl"),
            partial_input.path().join("part_0.jsonl"),
        )
        .unwrap();
        let output = TempDir::new().unwrap();
        let mut config = job(partial_input.path(), output.path(), 1);
        config.dataset.pack_sequences = false;
        run_job(config);

        let mut config = job(input.path(), output.path(), 1);
        config.dataset.pack_sequences = false;
        config.processing.resume_from_checkpoint = true;
        let resumed = run_job(config);

        assert_eq!(resumed.examples(), complete.examples());
        assert_eq!(all_rows(output.path()), all_rows(full.path()));
    }

    #[test]
    fn test_existing_shards_rejected() {
        let input = TempDir::new().unwrap();
        write_inputs(input.path(), 1, 10);
        let output = TempDir::new().unwrap();
        run_job(job(input.path(), output.path(), 1));

        let err = Pipeline::new(
            job(input.path(), output.path(), 1),
            Arc::new(ByteTokenizer::new()),
            GeneratorRegistry::with_defaults(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_leftover_written_once() {
        let input = TempDir::new().unwrap();
        write_inputs(input.path(), 3, 7);
        let output = TempDir::new().unwrap();
        let mut config = job(input.path(), output.path(), 5);
        config.dataset.min_sequence_len = 1;
        let summary = run_job(config);

        let finalizer_shard = output.path().join(sequential_shard_name(1, 0, 0, 0));
        assert!(finalizer_shard.exists());
        assert!(output.path().join("checkpoint_process_stats_1.json").exists());
        let total: u64 = list_shards(output.path())
            .unwrap()
            .iter()
            .map(|path| read_shard(path).unwrap().n_examples)
            .sum();
        assert_eq!(total, summary.examples());

        let params: serde_json::Value =
            serde_json::from_slice(&fs::read(output.path().join(PARAMS_FILE)).unwrap()).unwrap();
        assert_eq!(params["post-process"]["n_examples"], summary.examples());
        assert_eq!(params["post-process"]["eos_id"], 256);
    }

    #[test]
    fn test_shuffled_output() {
        let input = TempDir::new().unwrap();
        write_inputs(input.path(), 2, 40);

        let plain = TempDir::new().unwrap();
        let mut config = job(input.path(), plain.path(), 3);
        config.dataset.pack_sequences = false;
        let sequential = run_job(config);

        let shuffled_dir = TempDir::new().unwrap();
        let mut config = job(input.path(), shuffled_dir.path(), 3);
        config.dataset.pack_sequences = false;
        config.processing.shuffle = true;
        config.processing.shuffle_seed = 5;
        let shuffled = run_job(config);

        assert_eq!(shuffled.examples(), sequential.examples());
        assert!(list_shards(shuffled_dir.path())
            .unwrap()
            .iter()
            .all(|path| path.file_name().unwrap().to_string_lossy().split('_').count() == 3));
        assert_eq!(all_rows(shuffled_dir.path()), all_rows(plain.path()));
    }

    #[test]
    fn test_preference_job_discards_empty_pairs() {
        let input = TempDir::new().unwrap();
        let records = [
            serde_json::json!({ "prompt": "Hi", "chosen": "Hello!", "rejected": "Go away" }),
            serde_json::json!({ "prompt": "Hi", "chosen": "", "rejected": "Go away" }),
            serde_json::json!({
                "prompt": "Hi",
                "chosen": [ChatMessage::user("Hi"), ChatMessage::assistant("Hello!")],
                "rejected": [ChatMessage::user("Hi"), ChatMessage::assistant("No.")],
            }),
        ];
        let contents: String = records.iter().map(|r| format!("{r}\n")).collect();
        fs::write(input.path().join("pairs.jsonl"), contents).unwrap();

        let output = TempDir::new().unwrap();
        let mut config = job(input.path(), output.path(), 1);
        config.setup.mode = Mode::Dpo;
        config.processing.max_seq_length = 64;
        config.processing.max_prompt_length = 16;
        config.processing.read_hook_kwargs = DataKeys {
            prompt_key: Some("prompt".into()),
            chosen_key: Some("chosen".into()),
            rejected_key: Some("rejected".into()),
            ..DataKeys::default()
        };
        let summary = run_job(config);

        assert_eq!(summary.stat(StatField::Discarded), 1);
        assert_eq!(summary.stat(StatField::Successful), 2);
        assert_eq!(summary.examples(), 2);
        assert_eq!(summary.features.len(), 6);
        let shard = read_shard(&list_shards(output.path()).unwrap()[0]).unwrap();
        assert_eq!(shard.datasets[DATA_FIELD].row_shape(), &[6, 64]);
    }

    /// Emits the byte length of every record's `text` field.
    struct LengthGenerator {
        fail_on: Option<&'static str>,
        panic_on: Option<&'static str>,
    }

    impl TokenGenerator for LengthGenerator {
        fn encode(&mut self, document: Document) -> Result<Encoded> {
            let Document::Fields(fields) = document else {
                return Err(PipelineError::Worker("expected raw fields".into()));
            };
            let text = fields
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if self.fail_on.is_some_and(|marker| text.contains(marker)) {
                return Err(PipelineError::Shard("cannot store this record".into()));
            }
            if self.panic_on.is_some_and(|marker| text.contains(marker)) {
                panic!("generator bug");
            }
            let mut encoded = Encoded::default();
            encoded.push(
                "length",
                FieldArray::from_ids(vec![1], vec![text.len() as u32])?,
            );
            encoded.push(
                "long",
                FieldArray::from_bools(vec![1], vec![text.len() > 64])?,
            );
            let head = text.split(':').next().unwrap_or_default().to_string();
            encoded.push("head", FieldArray::from_strings(vec![1], vec![head])?);
            encoded.stats[StatField::Processed] = 1;
            encoded.stats[StatField::Successful] = 1;
            Ok(encoded)
        }

        fn record_shape(&self) -> RecordShape {
            RecordShape::Fields
        }

        fn features(&self) -> Vec<String> {
            ["length", "long", "head"].map(String::from).to_vec()
        }
    }

    fn length_registry(
        fail_on: Option<&'static str>,
        panic_on: Option<&'static str>,
    ) -> GeneratorRegistry {
        let mut registry = GeneratorRegistry::with_defaults();
        let factory: GeneratorFactory = Arc::new(move |_ctx: &GeneratorContext<'_>| {
            Ok(Box::new(LengthGenerator { fail_on, panic_on }) as Box<dyn TokenGenerator>)
        });
        registry.register(GeneratorKind::Custom("length".into()), factory);
        registry
    }

    fn custom_job(input: &Path, output: &Path, processes: usize) -> JobConfig {
        let mut config = job(input, output, processes);
        config.setup.mode = Mode::Custom;
        config.setup.token_generator = Some("length".into());
        config
    }

    #[test]
    fn test_custom_generator() {
        let input = TempDir::new().unwrap();
        write_inputs(input.path(), 2, 12);
        let output = TempDir::new().unwrap();
        let summary = run_with(
            custom_job(input.path(), output.path(), 4),
            length_registry(None, None),
        );
        assert!(summary.succeeded());
        assert_eq!(summary.examples(), 24);
        assert_eq!(summary.features, ["length", "long", "head"].map(String::from));

        let shard = read_shard(&list_shards(output.path()).unwrap()[0]).unwrap();
        assert_eq!(shard.datasets["length"].dtype(), "uint16");
        assert_eq!(shard.datasets["long"].dtype(), "bool");
        let heads = &shard.datasets["head"];
        assert_eq!(heads.dtype(), "str");
        assert_eq!(heads.rows(), shard.n_examples as usize);
        assert!(matches!(
            heads.values(),
            ArrayValues::Str(values) if values.iter().all(|v| v.starts_with("document "))
        ));
    }

    #[test]
    fn test_unregistered_custom_generator() {
        let input = TempDir::new().unwrap();
        write_inputs(input.path(), 1, 2);
        let output = TempDir::new().unwrap();
        let err = Pipeline::new(
            custom_job(input.path(), output.path(), 1),
            Arc::new(ByteTokenizer::new()),
            GeneratorRegistry::with_defaults(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_worker_failures_reported() {
        for processes in [1, 4] {
            let input = TempDir::new().unwrap();
            write_inputs(input.path(), 2, 12);
            let output = TempDir::new().unwrap();
            let summary = run_with(
                custom_job(input.path(), output.path(), processes),
                length_registry(Some("document 5 of file 1"), None),
            );
            assert!(!summary.succeeded());
            assert!(summary
                .failed_workers
                .iter()
                .any(|failure| failure.contains("cannot store this record")));
        }
    }

    fn shard_examples(dir: &Path) -> u64 {
        list_shards(dir)
            .unwrap()
            .iter()
            .map(|path| read_shard(path).unwrap().n_examples)
            .sum()
    }

    #[test]
    fn test_resume_after_tokenizer_failure() {
        let input = TempDir::new().unwrap();
        write_inputs(input.path(), 2, 100);
        let output = TempDir::new().unwrap();

        let failed = run_with(
            custom_job(input.path(), output.path(), 4),
            length_registry(Some("document 5 of file 0"), None),
        );
        assert!(!failed.succeeded());
        assert!(failed.examples() < 200);
        let record = CheckpointStore::new(output.path()).load(0);
        assert!(record.chunk_number <= 5);

        let mut config = custom_job(input.path(), output.path(), 4);
        config.processing.resume_from_checkpoint = true;
        let resumed = run_with(config, length_registry(None, None));
        assert!(resumed.succeeded());
        assert_eq!(resumed.examples(), 200);
        assert_eq!(shard_examples(output.path()), 200);
    }

    #[test]
    fn test_statistics_follow_checkpoint() {
        let input = TempDir::new().unwrap();
        write_inputs(input.path(), 2, 20);

        let clean = TempDir::new().unwrap();
        let mut config = job(input.path(), clean.path(), 1);
        config.dataset.pack_sequences = false;
        let complete = run_job(config);

        let output = TempDir::new().unwrap();
        let blocker = output.path().join("checkpoint_process_0.tmp");
        fs::create_dir(&blocker).unwrap();
        let mut config = job(input.path(), output.path(), 1);
        config.dataset.pack_sequences = false;
        let interrupted = run_job(config);
        assert!(!interrupted.succeeded());
        assert!(!output.path().join("checkpoint_process_stats_0.json").exists());

        fs::remove_dir(&blocker).unwrap();
        let mut config = job(input.path(), output.path(), 1);
        config.dataset.pack_sequences = false;
        config.processing.resume_from_checkpoint = true;
        let resumed = run_job(config);
        assert!(resumed.succeeded());
        assert_eq!(resumed.statistics, complete.statistics);
        assert_eq!(all_rows(output.path()), all_rows(clean.path()));
    }

    #[test]
    fn test_worker_panic_reported() {
        let input = TempDir::new().unwrap();
        write_inputs(input.path(), 2, 12);
        let output = TempDir::new().unwrap();
        let summary = run_with(
            custom_job(input.path(), output.path(), 3),
            length_registry(None, Some("document 3 of file 0")),
        );
        assert!(summary
            .failed_workers
            .iter()
            .any(|failure| failure == "tokenizer 0: panicked"));
    }
}

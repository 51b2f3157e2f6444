//! Chunk reader: input discovery and restartable, byte-budgeted frame streaming.
//!
//! Every record of an input file has a stable document index (its ordinal in
//! the file, malformed records included), so streaming from a
//! `(file_index, doc_index)` position reproduces exactly the frames an
//! uninterrupted run would have produced from that point on. Frames never
//! span two files.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use walkdir::WalkDir;

use crate::array::TokenizedData;
use crate::chat::ChatContent;
use crate::config::{DataKeys, SetupConfig};
use crate::error::{PipelineError, Result};
use crate::stats::{DataStats, StatField};
use crate::text::{clean_text, compression_factor, floor_char_boundary};

/// Suffixes of the input files the reader understands.
pub const VALID_EXTENSIONS: [&str; 6] = [
    ".jsonl",
    ".jsonl.gz",
    ".json.gz",
    ".jsonl.zst",
    ".txt",
    ".csv",
];

fn has_valid_extension(path: &Path) -> bool {
    let name = path.to_string_lossy();
    VALID_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Discover all supported input files under `root`, sorted.
pub fn discover_input_files(root: &Path) -> Vec<PathBuf> {
    if root.is_file() {
        return if has_valid_extension(root) {
            vec![root.to_path_buf()]
        } else {
            Vec::new()
        };
    }
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && has_valid_extension(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

/// Read input paths listed one per line in `metadata_files`.
pub fn read_metadata_files(metadata_files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for metadata in metadata_files {
        let contents = fs::read_to_string(metadata)
            .map_err(|e| PipelineError::io(e, Some(metadata.clone())))?;
        paths.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(PathBuf::from),
        );
    }
    Ok(paths)
}

/// Resolve the job's input files. An empty result is a configuration error.
pub fn resolve_input_files(setup: &SetupConfig) -> Result<Vec<PathBuf>> {
    let files = if !setup.metadata_files.is_empty() {
        read_metadata_files(&setup.metadata_files)?
    } else if let Some(source) = &setup.data.source {
        discover_input_files(source)
    } else {
        Vec::new()
    };
    if files.is_empty() {
        return Err(PipelineError::Config(format!(
            "no input files with extensions {VALID_EXTENSIONS:?} found"
        )));
    }
    Ok(files)
}

/// Total on-disk input size, counting compressed files at their expected decoded size.
pub fn estimated_input_bytes(files: &[PathBuf]) -> u64 {
    files
        .iter()
        .map(|path| {
            let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            len * compression_factor(path)
        })
        .sum()
}

/// How raw records are interpreted for the token generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    /// A single text field.
    Text,
    /// Optional prompt with chosen and rejected responses.
    Preference,
    /// The whole record, for custom generators.
    Fields,
}

/// One input record after field extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Text(String),
    Preference {
        prompt: Option<String>,
        chosen: ChatContent,
        rejected: ChatContent,
    },
    Fields(Map<String, Value>),
}

impl Document {
    /// Extract the fields `shape` needs. Missing fields become empty values,
    /// which the generators discard.
    pub fn from_record(record: Map<String, Value>, shape: RecordShape, keys: &DataKeys) -> Self {
        match shape {
            RecordShape::Text => {
                let key = keys.text_key.as_deref().unwrap_or("text");
                Document::Text(string_field(&record, key).unwrap_or_default())
            }
            RecordShape::Preference => {
                let prompt = keys
                    .prompt_key
                    .as_deref()
                    .and_then(|key| string_field(&record, key));
                let chosen = chat_field(&record, keys.chosen_key.as_deref().unwrap_or("chosen"));
                let rejected =
                    chat_field(&record, keys.rejected_key.as_deref().unwrap_or("rejected"));
                Document::Preference {
                    prompt,
                    chosen,
                    rejected,
                }
            }
            RecordShape::Fields => Document::Fields(record),
        }
    }
}

fn string_field(record: &Map<String, Value>, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn chat_field(record: &Map<String, Value>, key: &str) -> ChatContent {
    record
        .get(key)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_else(|| ChatContent::Text(String::new()))
}

/// Resume cursor: the next document to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadPosition {
    pub file_index: usize,
    pub doc_index: usize,
}

/// A bounded batch of records read from one file.
#[derive(Debug, Default)]
pub struct Frame {
    pub file_index: usize,
    /// Document index of the first record in the frame.
    pub start_doc_index: usize,
    /// Document index one past the last record in the frame.
    pub end_doc_index: usize,
    pub documents: Vec<Document>,
    pub tokenized: TokenizedData,
    pub stats: DataStats,
}

impl Frame {
    /// Where reading continues after this frame.
    pub fn next_position(&self) -> ReadPosition {
        ReadPosition {
            file_index: self.file_index,
            doc_index: self.end_doc_index,
        }
    }
}

type ParsedRecord = std::result::Result<Map<String, Value>, String>;

struct RawRecord {
    bytes: u64,
    parsed: ParsedRecord,
}

type RecordSource = Box<dyn Iterator<Item = Result<RawRecord>>>;

fn open_source(path: &Path, text_key: &str) -> Result<RecordSource> {
    let io_err = |e: std::io::Error| PipelineError::io(e, Some(path.to_path_buf()));
    let name = path.to_string_lossy();
    if name.ends_with(".txt") {
        let contents = fs::read_to_string(path).map_err(io_err)?;
        let mut record = Map::new();
        let bytes = contents.len() as u64;
        record.insert(text_key.to_string(), Value::String(clean_text(&contents)));
        return Ok(Box::new(std::iter::once(Ok(RawRecord {
            bytes,
            parsed: Ok(record),
        }))));
    }

    let file = File::open(path).map_err(io_err)?;
    if name.ends_with(".csv") {
        return Ok(Box::new(CsvRecords::new(file, path)?));
    }
    let reader: Box<dyn Read> = if name.ends_with(".gz") {
        Box::new(MultiGzDecoder::new(file))
    } else if name.ends_with(".zst") {
        Box::new(zstd::stream::read::Decoder::new(file).map_err(io_err)?)
    } else {
        Box::new(file)
    };
    Ok(Box::new(JsonLines {
        reader: BufReader::new(reader),
        path: path.to_path_buf(),
        buf: Vec::new(),
    }))
}

struct JsonLines {
    reader: BufReader<Box<dyn Read>>,
    path: PathBuf,
    buf: Vec<u8>,
}

impl Iterator for JsonLines {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(n) => {
                    let line = self.buf.trim_ascii();
                    if line.is_empty() {
                        continue;
                    }
                    return Some(Ok(RawRecord {
                        bytes: n as u64,
                        parsed: parse_json_line(line),
                    }));
                }
                Err(e) => return Some(Err(PipelineError::io(e, Some(self.path.clone())))),
            }
        }
    }
}

fn parse_json_line(line: &[u8]) -> ParsedRecord {
    match serde_json::from_slice::<Value>(line) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("record is not a JSON object".to_string()),
        Err(e) => {
            let text = String::from_utf8_lossy(line);
            let preview = &text[..floor_char_boundary(&text, 80)];
            Err(format!("{e} in `{preview}`"))
        }
    }
}

struct CsvRecords {
    reader: csv::Reader<File>,
    headers: Vec<String>,
}

impl CsvRecords {
    fn new(file: File, path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
        let headers = reader
            .headers()
            .map_err(|e| PipelineError::MalformedRecord {
                path: path.to_path_buf(),
                doc_index: 0,
                reason: format!("unreadable csv header: {e}"),
            })?
            .iter()
            .map(str::to_string)
            .collect();
        Ok(Self { reader, headers })
    }
}

impl Iterator for CsvRecords {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = csv::StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(false) => None,
            Ok(true) => {
                let bytes = record.as_slice().len() as u64;
                let parsed = if record.len() == self.headers.len() {
                    Ok(self
                        .headers
                        .iter()
                        .zip(record.iter())
                        .map(|(k, v)| (k.clone(), Value::String(v.to_string())))
                        .collect())
                } else {
                    Err(format!(
                        "expected {} columns, found {}",
                        self.headers.len(),
                        record.len()
                    ))
                };
                Some(Ok(RawRecord { bytes, parsed }))
            }
            Err(e) => Some(Ok(RawRecord {
                bytes: 0,
                parsed: Err(e.to_string()),
            })),
        }
    }
}

/// Streams frames out of an ordered list of input files.
#[derive(Debug, Clone)]
pub struct Reader {
    files: Vec<PathBuf>,
    max_chunk_bytes: u64,
    shape: RecordShape,
    keys: DataKeys,
    skip_malformed: bool,
}

impl Reader {
    pub fn new(
        files: Vec<PathBuf>,
        max_chunk_bytes: u64,
        shape: RecordShape,
        keys: DataKeys,
        skip_malformed: bool,
    ) -> Self {
        Self {
            files,
            max_chunk_bytes: max_chunk_bytes.max(1),
            shape,
            keys,
            skip_malformed,
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Lazily read frames starting at `start`.
    pub fn stream(&self, start: ReadPosition) -> FrameStream<'_> {
        FrameStream {
            reader: self,
            file_index: start.file_index,
            skip_docs: start.doc_index,
            next_doc: 0,
            source: None,
            lookahead: None,
        }
    }
}

/// Iterator over the frames of a [`Reader`].
pub struct FrameStream<'a> {
    reader: &'a Reader,
    file_index: usize,
    skip_docs: usize,
    next_doc: usize,
    source: Option<RecordSource>,
    lookahead: Option<RawRecord>,
}

impl FrameStream<'_> {
    fn current_path(&self) -> &Path {
        &self.reader.files[self.file_index]
    }

    /// Open the current file and skip already consumed documents.
    fn open_current(&mut self) -> Result<()> {
        let text_key = self.reader.keys.text_key.as_deref().unwrap_or("text");
        let mut source = open_source(self.current_path(), text_key)?;
        self.next_doc = 0;
        while self.next_doc < self.skip_docs {
            match source.next() {
                Some(record) => {
                    record?;
                    self.next_doc += 1;
                }
                None => break,
            }
        }
        self.skip_docs = 0;
        self.source = Some(source);
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<RawRecord>> {
        if let Some(record) = self.lookahead.take() {
            return Ok(Some(record));
        }
        match self.source.as_mut().and_then(Iterator::next) {
            Some(record) => record.map(Some),
            None => Ok(None),
        }
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.file_index >= self.reader.files.len() {
                return Ok(None);
            }
            if self.source.is_none() {
                self.open_current()?;
            }

            let mut frame = Frame {
                file_index: self.file_index,
                start_doc_index: self.next_doc,
                end_doc_index: self.next_doc,
                ..Frame::default()
            };
            let mut frame_bytes = 0u64;
            while let Some(record) = self.next_record()? {
                if frame.end_doc_index > frame.start_doc_index
                    && frame_bytes + record.bytes > self.reader.max_chunk_bytes
                {
                    self.lookahead = Some(record);
                    break;
                }
                frame_bytes += record.bytes;
                self.accept(&mut frame, record)?;
            }

            if frame.end_doc_index > frame.start_doc_index {
                return Ok(Some(frame));
            }
            // file exhausted
            self.source = None;
            self.file_index += 1;
        }
    }

    fn accept(&mut self, frame: &mut Frame, record: RawRecord) -> Result<()> {
        let doc_index = self.next_doc;
        self.next_doc += 1;
        frame.end_doc_index = self.next_doc;
        frame.stats[StatField::TotalRawDocs] += 1;
        match record.parsed {
            Ok(map) => {
                frame
                    .documents
                    .push(Document::from_record(map, self.reader.shape, &self.reader.keys));
                Ok(())
            }
            Err(reason) if self.reader.skip_malformed => {
                log::warn!(
                    "skipping malformed record {doc_index} in {:?}: {reason}",
                    self.current_path()
                );
                frame.stats[StatField::RawDocsSkipped] += 1;
                Ok(())
            }
            Err(reason) => Err(PipelineError::MalformedRecord {
                path: self.current_path().to_path_buf(),
                doc_index,
                reason,
            }),
        }
    }
}

impl Iterator for FrameStream<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                // stop after the first fatal error
                self.file_index = self.reader.files.len();
                self.source = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn text_keys() -> DataKeys {
        DataKeys {
            text_key: Some("text".to_string()),
            ..DataKeys::default()
        }
    }

    fn write_jsonl(path: &Path, docs: &[&str]) {
        let mut file = File::create(path).unwrap();
        for doc in docs {
            writeln!(file, "{}", serde_json::json!({ "text": doc })).unwrap();
        }
    }

    fn texts(frame: &Frame) -> Vec<String> {
        frame
            .documents
            .iter()
            .map(|d| match d {
                Document::Text(t) => t.clone(),
                other => panic!("unexpected document {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_discover_input_files() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("sub")).unwrap();
        for name in ["b.jsonl", "sub/a.jsonl.zst", "c.csv", "skip.parquet", "d.txt"] {
            fs::write(temp.path().join(name), "").unwrap();
        }
        let files = discover_input_files(temp.path());
        assert_eq!(files.len(), 4);
        assert!(files.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_metadata_files() {
        let temp = TempDir::new().unwrap();
        let meta = temp.path().join("files.txt");
        fs::write(&meta, "/data/a.jsonl\n\n/data/b.jsonl\n").unwrap();
        let files = read_metadata_files(&[meta]).unwrap();
        assert_eq!(files, vec![PathBuf::from("/data/a.jsonl"), PathBuf::from("/data/b.jsonl")]);
    }

    #[test]
    fn test_frames_respect_budget_and_files() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.jsonl");
        let b = temp.path().join("b.jsonl");
        write_jsonl(&a, &["one", "two", "three"]);
        write_jsonl(&b, &[&"x".repeat(100)]);

        // each line of `a` is ~16 bytes, so two fit in a 40 byte budget
        let reader = Reader::new(vec![a, b], 40, RecordShape::Text, text_keys(), false);
        let frames: Vec<Frame> = reader
            .stream(ReadPosition::default())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(texts(&frames[0]), vec!["one", "two"]);
        assert_eq!((frames[0].start_doc_index, frames[0].end_doc_index), (0, 2));
        assert_eq!(texts(&frames[1]), vec!["three"]);
        // oversized record still forms a frame on its own
        assert_eq!(frames[2].file_index, 1);
        assert_eq!(frames[2].documents.len(), 1);
    }

    #[test]
    fn test_resume_reproduces_remaining_frames() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.jsonl");
        let docs: Vec<String> = (0..20).map(|i| format!("document {i}")).collect();
        let refs: Vec<&str> = docs.iter().map(String::as_str).collect();
        write_jsonl(&a, &refs);

        let reader = Reader::new(vec![a], 64, RecordShape::Text, text_keys(), false);
        let full: Vec<Frame> = reader
            .stream(ReadPosition::default())
            .collect::<Result<_>>()
            .unwrap();
        let cursor = full[1].next_position();
        let resumed: Vec<Frame> = reader.stream(cursor).collect::<Result<_>>().unwrap();

        assert_eq!(resumed.len(), full.len() - 2);
        for (r, f) in resumed.iter().zip(&full[2..]) {
            assert_eq!(texts(r), texts(f));
            assert_eq!(r.start_doc_index, f.start_doc_index);
        }
    }

    #[test]
    fn test_malformed_records() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.jsonl");
        fs::write(&path, "{\"text\": \"ok\"}\n{not json\n{\"text\": \"fine\"}\n").unwrap();

        let strict = Reader::new(vec![path.clone()], 1 << 20, RecordShape::Text, text_keys(), false);
        let err = strict.stream(ReadPosition::default()).next().unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord { doc_index: 1, .. }));

        let lenient = Reader::new(vec![path], 1 << 20, RecordShape::Text, text_keys(), true);
        let frame = lenient.stream(ReadPosition::default()).next().unwrap().unwrap();
        assert_eq!(texts(&frame), vec!["ok", "fine"]);
        assert_eq!(frame.stats[StatField::TotalRawDocs], 3);
        assert_eq!(frame.stats[StatField::RawDocsSkipped], 1);
        assert_eq!(frame.end_doc_index, 3);
    }

    #[test]
    fn test_compressed_csv_and_txt_inputs() {
        let temp = TempDir::new().unwrap();
        let gz = temp.path().join("a.jsonl.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(File::create(&gz).unwrap(), flate2::Compression::default());
        writeln!(encoder, "{}", serde_json::json!({"text": "gzipped"})).unwrap();
        encoder.finish().unwrap();

        let zst = temp.path().join("b.jsonl.zst");
        let raw = format!("{}\n", serde_json::json!({"text": "zstd"}));
        fs::write(&zst, zstd::encode_all(raw.as_bytes(), 0).unwrap()).unwrap();

        let csv = temp.path().join("c.csv");
        fs::write(&csv, "text,other\nfrom csv,1\n").unwrap();

        let txt = temp.path().join("d.txt");
        fs::write(&txt, "plain\r\ntext\n").unwrap();

        let reader = Reader::new(vec![gz, zst, csv, txt], 1 << 20, RecordShape::Text, text_keys(), false);
        let all: Vec<String> = reader
            .stream(ReadPosition::default())
            .flat_map(|f| texts(&f.unwrap()))
            .collect();
        assert_eq!(all, vec!["gzipped", "zstd", "from csv", "plain\ntext"]);
    }

    #[test]
    fn test_preference_records() {
        let record = serde_json::json!({
            "prompt": "Q",
            "chosen": [{"role": "assistant", "content": "good"}],
            "rejected": "bad"
        });
        let keys = DataKeys {
            prompt_key: Some("prompt".into()),
            chosen_key: Some("chosen".into()),
            rejected_key: Some("rejected".into()),
            ..DataKeys::default()
        };
        let Value::Object(map) = record else { unreachable!() };
        let doc = Document::from_record(map, RecordShape::Preference, &keys);
        match doc {
            Document::Preference { prompt, chosen, rejected } => {
                assert_eq!(prompt.as_deref(), Some("Q"));
                assert!(matches!(chosen, ChatContent::Messages(ref m) if m.len() == 1));
                assert_eq!(rejected.as_text(), Some("bad"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

//! Causal language-model examples, optionally reformatted for fill-in-the-middle.

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{Encoded, GeneratorContext, TokenGenerator, DATA_FIELD};
use crate::array::FieldArray;
use crate::config::{SpecialIds, TrainingObjective};
use crate::error::{DocumentError, PipelineError, Result};
use crate::fim::{fim, FimSettings, FimTokens, FormattedSample};
use crate::reader::{Document, RecordShape};
use crate::stats::{sample_stats, StatField};
use crate::text::{char_byte_counts, wikitext_detokenize};
use crate::tokenizer::{SharedTokenizer, Tokenizer};

/// Packs documents into `max_seq_length` windows of inputs, loss mask and labels.
pub struct PretrainingGenerator {
    tokenizer: SharedTokenizer,
    ids: SpecialIds,
    vocab_size: usize,
    seq_len: usize,
    pack_sequences: bool,
    min_sequence_len: usize,
    wikitext_detokenize: bool,
    fim: Option<FimSettings>,
    rng: StdRng,
    /// Tokens waiting for enough text to fill the next window.
    prefix: Vec<u32>,
    samples: usize,
}

impl PretrainingGenerator {
    pub fn new(ctx: &GeneratorContext<'_>) -> Result<Self> {
        let dataset = &ctx.config.dataset;
        let fim = match dataset.training_objective {
            TrainingObjective::Causal => None,
            TrainingObjective::Fim => Some(fim_settings(ctx)?),
        };
        Ok(Self {
            tokenizer: ctx.tokenizer.clone(),
            ids: ctx.ids,
            vocab_size: ctx.tokenizer.vocab_size(),
            seq_len: ctx.config.processing.max_seq_length,
            pack_sequences: dataset.pack_sequences,
            min_sequence_len: dataset.min_sequence_len,
            wikitext_detokenize: dataset.wikitext_detokenize,
            fim,
            rng: StdRng::seed_from_u64(ctx.seed),
            prefix: Vec::new(),
            samples: 0,
        })
    }

    /// Turn one window of at most `seq_len + 1` real tokens into an example.
    fn format_window(&mut self, window: &[u32]) -> Result<FormattedSample> {
        let sample_idx = self.samples;
        self.samples += 1;
        if let Some(settings) = &self.fim {
            return fim(
                window,
                self.seq_len,
                sample_idx,
                self.tokenizer.as_ref(),
                settings,
                &mut self.rng,
            );
        }

        let real = window.len().saturating_sub(1);
        let mut input_ids = window[..real].to_vec();
        let mut labels = window[1.min(window.len())..].to_vec();
        let mut attention_mask = vec![1; real];
        input_ids.resize(self.seq_len, self.ids.pad_id);
        labels.resize(self.seq_len, self.ids.pad_id);
        attention_mask.resize(self.seq_len, 0);
        Ok(FormattedSample {
            input_ids,
            attention_mask,
            labels,
        })
    }

    /// Format `windows` into one stacked array, dropping the too-short ones.
    fn emit<'a>(
        &mut self,
        windows: impl IntoIterator<Item = &'a [u32]>,
        encoded: &mut Encoded,
    ) -> Result<()> {
        let mut values = Vec::new();
        let mut rows = 0;
        for window in windows {
            if window.len() < self.min_sequence_len.max(2) {
                log::debug!(
                    "dropping a window of {} tokens, shorter than min_sequence_len",
                    window.len()
                );
                continue;
            }
            let sample = self.format_window(window)?;
            encoded.stats.merge(&sample_stats(
                &sample.input_ids,
                &sample.attention_mask,
                self.ids.eos_id,
                self.ids.pad_id,
            ));
            values.extend(sample.input_ids);
            values.extend(sample.attention_mask);
            values.extend(sample.labels);
            rows += 1;
        }
        if rows > 0 {
            encoded.push(
                DATA_FIELD,
                FieldArray::from_ids(vec![3, self.seq_len], values)?,
            );
        }
        Ok(())
    }
}

impl TokenGenerator for PretrainingGenerator {
    fn encode(&mut self, document: Document) -> Result<Encoded> {
        let Document::Text(raw) = document else {
            return Err(DocumentError::UnexpectedShape("expected a text document".into()).into());
        };
        if raw.is_empty() {
            return Err(DocumentError::EmptyField("text".into()).into());
        }

        let mut encoded = Encoded::default();
        let (raw_chars, raw_bytes) = char_byte_counts(&raw);
        encoded.stats[StatField::RawCharsCount] = raw_chars;
        encoded.stats[StatField::RawBytesCount] = raw_bytes;
        let text = if self.wikitext_detokenize {
            wikitext_detokenize(&raw)
        } else {
            raw
        };
        let (chars, bytes) = char_byte_counts(&text);
        encoded.stats[StatField::NormalizedCharsCount] = chars;
        encoded.stats[StatField::NormalizedBytesCount] = bytes;

        let mut ids = self.tokenizer.encode(&text)?;
        if let Some(&id) = ids.iter().find(|&&id| id as usize >= self.vocab_size) {
            return Err(DocumentError::Encoding(id.into()).into());
        }
        ids.push(self.ids.eos_id);
        encoded.stats[StatField::NumSequencesBeforePacking] = 1;

        let window = self.seq_len + 1;
        if self.pack_sequences {
            let carried = self.prefix.len();
            let mut pending = std::mem::take(&mut self.prefix);
            pending.extend(ids);
            let full = pending.len() / window * window;
            if let Err(err) = self.emit(pending[..full].chunks(window), &mut encoded) {
                // only this document's tokens are discarded
                pending.truncate(carried);
                self.prefix = pending;
                return Err(err);
            }
            pending.drain(..full);
            self.prefix = pending;
        } else {
            self.emit(ids.chunks(window), &mut encoded)?;
        }

        encoded.stats[StatField::Processed] = 1;
        encoded.stats[StatField::Successful] = 1;
        Ok(encoded)
    }

    fn record_shape(&self) -> RecordShape {
        RecordShape::Text
    }

    fn features(&self) -> Vec<String> {
        ["input_ids", "attention_mask", "labels"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn take_leftover(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.prefix)
    }

    fn encode_leftover(&mut self, leftover: Vec<u32>) -> Result<Encoded> {
        let mut encoded = Encoded::default();
        if leftover.is_empty() {
            return Ok(encoded);
        }
        let window = self.seq_len + 1;
        self.emit(leftover.chunks(window), &mut encoded)?;
        log::info!(
            "encoded {} leftover tokens into {} examples",
            leftover.len(),
            encoded.rows(DATA_FIELD)
        );
        Ok(encoded)
    }
}

fn fim_settings(ctx: &GeneratorContext<'_>) -> Result<FimSettings> {
    let dataset = &ctx.config.dataset;
    let tokenizer = ctx.tokenizer.as_ref();
    let lookup = |name: &str, token: Option<&String>| -> Result<u32> {
        let token = token.ok_or_else(|| {
            PipelineError::Config(format!("dataset.{name} is required for fim"))
        })?;
        tokenizer.token_to_id(token).ok_or_else(|| {
            PipelineError::Config(format!("fim token '{token}' is not in the vocabulary"))
        })
    };
    let pad = match dataset.fim_pad_tok.as_ref() {
        Some(_) => lookup("fim_pad_tok", dataset.fim_pad_tok.as_ref())?,
        None => ctx.ids.pad_id,
    };
    Ok(FimSettings {
        fim_rate: dataset.fim_rate,
        spm_rate: dataset.spm_rate,
        tokens: FimTokens {
            prefix: lookup("fim_prefix_tok", dataset.fim_prefix_tok.as_ref())?,
            middle: lookup("fim_middle_tok", dataset.fim_middle_tok.as_ref())?,
            suffix: lookup("fim_suffix_tok", dataset.fim_suffix_tok.as_ref())?,
            pad,
            eos: ctx.ids.eos_id,
            bos: tokenizer
                .adds_bos_token()
                .then(|| tokenizer.bos_token_id())
                .flatten(),
        },
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::JobConfig;
    use crate::tokenizer::ByteTokenizer;

    fn config(seq_len: usize, pack: bool) -> JobConfig {
        let mut config = JobConfig::default();
        config.processing.custom_tokenizer = Some("bytes".into());
        config.processing.max_seq_length = seq_len;
        config.dataset.pack_sequences = pack;
        config.dataset.min_sequence_len = 2;
        config
    }

    fn generator(config: &JobConfig, tokenizer: ByteTokenizer) -> PretrainingGenerator {
        let tokenizer: SharedTokenizer = Arc::new(tokenizer);
        let ctx = GeneratorContext {
            config,
            ids: config.special_ids(tokenizer.as_ref()),
            tokenizer,
            seed: 7,
        };
        PretrainingGenerator::new(&ctx).unwrap()
    }

    fn rows(encoded: &Encoded) -> Vec<Vec<i64>> {
        let array = FieldArray::concat(&encoded.data[DATA_FIELD]).unwrap();
        (0..array.rows()).map(|i| array.int_row(i).unwrap()).collect()
    }

    #[test]
    fn test_packing_carries_prefix() {
        let config = config(4, true);
        let mut generator = generator(&config, ByteTokenizer::new());
        // "abc" + eos = 4 tokens, below one window of 5
        let first = generator.encode(Document::Text("abc".into())).unwrap();
        assert_eq!(first.rows(DATA_FIELD), 0);
        assert_eq!(first.stats[StatField::Successful], 1);

        let second = generator.encode(Document::Text("defg".into())).unwrap();
        assert_eq!(second.rows(DATA_FIELD), 1);
        let row = &rows(&second)[0];
        // inputs a b c eos, mask ones, labels b c eos d
        assert_eq!(&row[..4], &[97, 98, 99, 256]);
        assert_eq!(&row[4..8], &[1, 1, 1, 1]);
        assert_eq!(&row[8..], &[98, 99, 256, 100]);

        let leftover = generator.take_leftover();
        assert_eq!(leftover, vec![101, 102, 103, 256]);
        assert!(generator.take_leftover().is_empty());

        let tail = generator.encode_leftover(leftover).unwrap();
        let row = &rows(&tail)[0];
        assert_eq!(&row[..4], &[101, 102, 103, 256]);
        assert_eq!(&row[4..8], &[1, 1, 1, 0]);
        assert_eq!(&row[8..], &[102, 103, 256, 256]);
    }

    #[test]
    fn test_unpacked_pads_last_window() {
        let config = config(4, false);
        let mut generator = generator(&config, ByteTokenizer::new());
        let encoded = generator.encode(Document::Text("ab".into())).unwrap();
        let row = &rows(&encoded)[0];
        // eos doubles as pad
        assert_eq!(&row[..4], &[97, 98, 256, 256]);
        assert_eq!(&row[4..8], &[1, 1, 0, 0]);
        assert_eq!(&row[8..], &[98, 256, 256, 256]);
        assert_eq!(encoded.stats[StatField::LossValidTokens], 2);
        assert!(generator.take_leftover().is_empty());
    }

    #[test]
    fn test_short_windows_dropped() {
        let mut config = config(4, false);
        config.dataset.min_sequence_len = 4;
        let mut generator = generator(&config, ByteTokenizer::new());
        let encoded = generator.encode(Document::Text("ab".into())).unwrap();
        assert_eq!(encoded.rows(DATA_FIELD), 0);
        assert_eq!(encoded.stats[StatField::Successful], 1);
    }

    #[test]
    fn test_fim_examples_end_in_eos() {
        let mut config = config(16, true);
        config.dataset.training_objective = TrainingObjective::Fim;
        config.dataset.fim_rate = 1.0;
        config.dataset.fim_prefix_tok = Some("<pre>".into());
        config.dataset.fim_middle_tok = Some("<mid>".into());
        config.dataset.fim_suffix_tok = Some("<suf>".into());
        let tokenizer = ByteTokenizer::new().with_special_tokens(["<pre>", "<mid>", "<suf>"]);
        let mut generator = generator(&config, tokenizer);
        let encoded = generator
            .encode(Document::Text("fn main() { println!(); }".into()))
            .unwrap();
        assert_eq!(encoded.rows(DATA_FIELD), 1);
        let row = &rows(&encoded)[0];
        let valid = row[16..32].iter().sum::<i64>() as usize;
        assert!(valid > 0);
        assert_eq!(row[32 + valid - 1], 256);
    }

    /// Claims a vocabulary smaller than the ids it produces.
    struct TruncatedVocab(ByteTokenizer);

    impl Tokenizer for TruncatedVocab {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            self.0.encode(text)
        }

        fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
            self.0.decode(ids, skip_special_tokens)
        }

        fn vocab_size(&self) -> usize {
            90
        }

        fn eos_token_id(&self) -> u32 {
            self.0.eos_token_id()
        }
    }

    #[test]
    fn test_out_of_vocabulary_ids_rejected() {
        let config = config(8, true);
        let tokenizer: SharedTokenizer = Arc::new(TruncatedVocab(ByteTokenizer::new()));
        let ctx = GeneratorContext {
            config: &config,
            ids: config.special_ids(tokenizer.as_ref()),
            tokenizer,
            seed: 0,
        };
        let mut generator = PretrainingGenerator::new(&ctx).unwrap();
        assert!(generator.encode(Document::Text("ABC".into())).is_ok());
        let err = generator.encode(Document::Text("abc".into())).unwrap_err();
        assert!(matches!(err, PipelineError::Document(DocumentError::Encoding(97))));
        assert!(err.is_document_level());
    }

    /// Refuses to decode any run containing `!`.
    struct BangRejecting(ByteTokenizer);

    impl Tokenizer for BangRejecting {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            self.0.encode(text)
        }

        fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
            if ids.contains(&(b'!' as u32)) {
                return Err(PipelineError::Tokenizer("cannot decode '!'".into()));
            }
            self.0.decode(ids, skip_special_tokens)
        }

        fn vocab_size(&self) -> usize {
            self.0.vocab_size()
        }

        fn eos_token_id(&self) -> u32 {
            self.0.eos_token_id()
        }

        fn token_to_id(&self, token: &str) -> Option<u32> {
            self.0.token_to_id(token)
        }
    }

    #[test]
    fn test_failed_document_keeps_carried_tokens() {
        let mut config = config(32, true);
        config.dataset.training_objective = TrainingObjective::Fim;
        config.dataset.fim_rate = 1.0;
        config.dataset.fim_prefix_tok = Some("<pre>".into());
        config.dataset.fim_middle_tok = Some("<mid>".into());
        config.dataset.fim_suffix_tok = Some("<suf>".into());
        let tokenizer: SharedTokenizer = Arc::new(BangRejecting(
            ByteTokenizer::new().with_special_tokens(["<pre>", "<mid>", "<suf>"]),
        ));
        let ctx = GeneratorContext {
            config: &config,
            ids: config.special_ids(tokenizer.as_ref()),
            tokenizer,
            seed: 3,
        };
        let mut generator = PretrainingGenerator::new(&ctx).unwrap();

        let first = generator.encode(Document::Text("abcdefghij".into())).unwrap();
        assert_eq!(first.rows(DATA_FIELD), 0);
        let carried: Vec<u32> = (97..=106).chain([256]).collect();
        assert_eq!(generator.prefix, carried);

        // the window holding the first document fails to format
        assert!(generator.encode(Document::Text("!".repeat(30))).is_err());
        assert_eq!(generator.prefix, carried);

        // 11 carried + 22 new tokens fill exactly one 33-token window
        let third = generator.encode(Document::Text("k".repeat(21))).unwrap();
        assert_eq!(third.rows(DATA_FIELD), 1);
        assert!(generator.take_leftover().is_empty());
    }

    #[test]
    fn test_fim_requires_tokens() {
        let mut config = config(16, true);
        config.dataset.training_objective = TrainingObjective::Fim;
        let tokenizer: SharedTokenizer = Arc::new(ByteTokenizer::new());
        let ctx = GeneratorContext {
            config: &config,
            ids: config.special_ids(tokenizer.as_ref()),
            tokenizer,
            seed: 0,
        };
        assert!(matches!(
            PretrainingGenerator::new(&ctx),
            Err(PipelineError::Config(_))
        ));
    }
}

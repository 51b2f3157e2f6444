//! Preference pairs encoded as chosen/rejected input ids, loss masks and labels.

use super::{Encoded, GeneratorContext, TokenGenerator, DATA_FIELD};
use crate::array::FieldArray;
use crate::chat::{format_chat, ChatContent, ChatMessage};
use crate::config::{SpecialIds, TruncationMode};
use crate::error::{DocumentError, Result};
use crate::reader::{Document, RecordShape};
use crate::stats::{DataStats, StatField};
use crate::text::{char_byte_counts, wikitext_detokenize};
use crate::tokenizer::{SharedTokenizer, Tokenizer};

/// Markers searched for the start of the response when no delimiter is configured.
const RESPONSE_MARKERS: [&str; 2] = ["[/INST]", "<|assistant|>"];

/// Prompt and response ids of one side of a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TokenizedAnswer {
    prompt: Vec<u32>,
    response: Vec<u32>,
}

pub struct DpoGenerator {
    tokenizer: SharedTokenizer,
    ids: SpecialIds,
    max_seq_length: usize,
    max_prompt_length: usize,
    user_role: String,
    assistant_role: String,
    response_delimiter: Option<String>,
    truncation_mode: TruncationMode,
    wikitext_detokenize: bool,
}

impl DpoGenerator {
    pub fn new(ctx: &GeneratorContext<'_>) -> Self {
        let dataset = &ctx.config.dataset;
        Self {
            tokenizer: ctx.tokenizer.clone(),
            ids: ctx.ids,
            max_seq_length: ctx.config.processing.max_seq_length,
            max_prompt_length: ctx.config.processing.max_prompt_length,
            user_role: dataset.user_role.clone(),
            assistant_role: dataset.assistant_role.clone(),
            response_delimiter: dataset.response_delimiter.clone(),
            truncation_mode: dataset.truncation_mode,
            wikitext_detokenize: dataset.wikitext_detokenize,
        }
    }

    fn render(&self, messages: &[ChatMessage]) -> String {
        self.tokenizer
            .apply_chat_template(messages, false)
            .unwrap_or_else(|| format_chat(messages))
    }

    /// Derive the prompt from the chosen text: everything up to and
    /// including the last `<assistant_role>:` marker.
    ///
    /// The text is lowercased before the search but the role is not, so a
    /// role with capitals never matches.
    fn infer_prompt(&self, chosen: &str) -> Result<String> {
        let marker = format!("{}:", self.assistant_role);
        let idx = chosen
            .to_ascii_lowercase()
            .rfind(&marker)
            .ok_or_else(|| DocumentError::MissingPromptDelimiter(marker.clone()))?;
        Ok(chosen[..idx + marker.len()].to_string())
    }

    /// Render both sides of the pair as full conversations.
    fn render_pair(
        &self,
        prompt: Option<String>,
        chosen: ChatContent,
        rejected: ChatContent,
    ) -> Result<(String, String)> {
        let prompt = match (prompt, chosen.as_text()) {
            (None, Some(text)) if rejected.as_text().is_some() => Some(self.infer_prompt(text)?),
            (prompt, _) => prompt,
        };

        let both_structured =
            matches!(chosen, ChatContent::Messages(_)) && matches!(rejected, ChatContent::Messages(_));
        if prompt.is_some() && both_structured {
            let chosen = chosen.into_messages(&self.assistant_role);
            let rejected = rejected.into_messages(&self.assistant_role);
            return Ok((self.render(&chosen), self.render(&rejected)));
        }

        let prompt_messages: Vec<ChatMessage> = prompt
            .map(|text| vec![ChatMessage::new(self.user_role.as_str(), text)])
            .unwrap_or_default();
        let conversation = |response: ChatContent| {
            let mut messages = prompt_messages.clone();
            messages.extend(response.into_messages(&self.assistant_role));
            self.render(&messages)
        };
        Ok((conversation(chosen), conversation(rejected)))
    }

    fn response_start(&self, rendered: &str) -> Option<usize> {
        match &self.response_delimiter {
            Some(delimiter) => rendered.rfind(delimiter.as_str()),
            None => RESPONSE_MARKERS
                .iter()
                .filter_map(|marker| rendered.rfind(marker))
                .max(),
        }
    }

    /// Split the encoding of `full` into prompt and response ids.
    ///
    /// When the prompt does not tokenize to a prefix of `full` the boundary
    /// token is merged, so the split moves one token left.
    fn build_tokenized_answer(&self, prompt: &str, full: &str) -> Result<TokenizedAnswer> {
        let full_ids = self.tokenizer.encode(full)?;
        let prompt_ids = self.tokenizer.encode(prompt)?;
        if prompt_ids.len() > full_ids.len() {
            return Err(DocumentError::Invariant(format!(
                "prompt encodes to {} tokens but the full text to {}",
                prompt_ids.len(),
                full_ids.len()
            ))
            .into());
        }
        let mut start = prompt_ids.len();
        if prompt_ids[..] != full_ids[..start] {
            start = start.saturating_sub(1);
        }
        Ok(TokenizedAnswer {
            prompt: full_ids[..start].to_vec(),
            response: full_ids[start..].to_vec(),
        })
    }

    fn truncate_prompt(&self, prompt: &mut Vec<u32>) {
        let keep = self.max_prompt_length;
        if prompt.len() <= keep {
            return;
        }
        match self.truncation_mode {
            TruncationMode::KeepStart => prompt.truncate(keep),
            TruncationMode::KeepEnd => {
                prompt.drain(..prompt.len() - keep);
            }
        }
    }

    /// Build `[input_ids, attention_mask, labels]` padded to `max_seq_length`.
    fn finish(&self, answer: &TokenizedAnswer, stats: &mut DataStats) -> [Vec<u32>; 3] {
        let len = self.max_seq_length;
        let pad = self.ids.pad_id;
        let masked_prefix = answer.prompt.len().saturating_sub(1);

        let mut input_ids = answer.prompt.clone();
        input_ids.extend_from_slice(&answer.response);
        let mut labels = input_ids[1.min(input_ids.len())..].to_vec();
        for label in labels.iter_mut().take(masked_prefix) {
            *label = pad;
        }
        let mut attention_mask = vec![1u32; input_ids.len()];

        stats[StatField::NumPadTokens] += (len - input_ids.len()) as u64 * 2;
        stats[StatField::NumPadTokens] += (len - labels.len()) as u64;

        input_ids.resize(len, pad);
        labels.resize(len, pad);
        attention_mask.resize(len, 0);
        for mask in attention_mask.iter_mut().take(masked_prefix) {
            *mask = 0;
        }
        [input_ids, attention_mask, labels]
    }
}

impl TokenGenerator for DpoGenerator {
    fn encode(&mut self, document: Document) -> Result<Encoded> {
        let Document::Preference {
            prompt,
            chosen,
            rejected,
        } = document
        else {
            return Err(
                DocumentError::UnexpectedShape("expected a preference pair".into()).into(),
            );
        };
        match (chosen.is_empty(), rejected.is_empty()) {
            (true, true) => return Err(DocumentError::EmptyField("chosen and rejected".into()).into()),
            (true, false) => return Err(DocumentError::EmptyField("chosen".into()).into()),
            (false, true) => return Err(DocumentError::EmptyField("rejected".into()).into()),
            (false, false) => {}
        }

        let mut encoded = Encoded::default();
        let (mut prompt_chosen, mut prompt_rejected) = self.render_pair(prompt, chosen, rejected)?;
        let (chars, bytes) = char_byte_counts(&prompt_chosen);
        let (rchars, rbytes) = char_byte_counts(&prompt_rejected);
        encoded.stats[StatField::RawCharsCount] = chars + rchars;
        encoded.stats[StatField::RawBytesCount] = bytes + rbytes;
        if self.wikitext_detokenize {
            prompt_chosen = wikitext_detokenize(&prompt_chosen);
            prompt_rejected = wikitext_detokenize(&prompt_rejected);
        }
        let (chars, bytes) = char_byte_counts(&prompt_chosen);
        let (rchars, rbytes) = char_byte_counts(&prompt_rejected);
        encoded.stats[StatField::NormalizedCharsCount] = chars + rchars;
        encoded.stats[StatField::NormalizedBytesCount] = bytes + rbytes;

        let idx = self
            .response_start(&prompt_chosen)
            .ok_or(DocumentError::MissingResponseDelimiter)?;
        let prompt = &prompt_chosen[..idx];

        let mut chosen = self.build_tokenized_answer(prompt, &prompt_chosen)?;
        let mut rejected = self.build_tokenized_answer(prompt, &prompt_rejected)?;

        let differing_tokens = chosen
            .prompt
            .iter()
            .zip(&rejected.prompt)
            .filter(|(a, b)| a != b)
            .count();
        let length_difference = chosen.prompt.len().abs_diff(rejected.prompt.len());
        if differing_tokens > 1 || length_difference > 1 {
            return Err(DocumentError::PromptMismatch {
                differing_tokens,
                length_difference,
            }
            .into());
        }

        let tokenizer = self.tokenizer.as_ref();
        let bos = (!tokenizer.adds_bos_token())
            .then(|| tokenizer.bos_token_id().unwrap_or(self.ids.eos_id));
        for answer in [&mut chosen, &mut rejected] {
            if let Some(bos) = bos {
                answer.prompt.insert(0, bos);
            }
            answer.response.push(self.ids.eos_id);
        }

        let longer = chosen.response.len().max(rejected.response.len());
        for answer in [&mut chosen, &mut rejected] {
            if answer.prompt.len() + longer > self.max_seq_length {
                self.truncate_prompt(&mut answer.prompt);
            }
        }
        let response_budget = self.max_seq_length.saturating_sub(self.max_prompt_length);
        for answer in [&mut chosen, &mut rejected] {
            if answer.prompt.len() + longer > self.max_seq_length {
                answer.response.truncate(response_budget);
            }
        }
        for answer in [&chosen, &rejected] {
            if answer.prompt.len() + answer.response.len() > self.max_seq_length {
                return Err(DocumentError::Invariant(format!(
                    "{} tokens exceed max_seq_length after truncation",
                    answer.prompt.len() + answer.response.len()
                ))
                .into());
            }
        }

        let mut values = Vec::with_capacity(6 * self.max_seq_length);
        for answer in [&chosen, &rejected] {
            for row in self.finish(answer, &mut encoded.stats) {
                values.extend(row);
            }
        }
        let loss_valid: u64 = (0..2)
            .map(|side| {
                let start = (side * 3 + 1) * self.max_seq_length;
                values[start..start + self.max_seq_length]
                    .iter()
                    .map(|&m| u64::from(m))
                    .sum::<u64>()
            })
            .sum();
        let total = 2 * self.max_seq_length as u64;
        encoded.stats[StatField::NumTokens] = 6 * self.max_seq_length as u64;
        encoded.stats[StatField::LossValidTokens] = loss_valid;
        encoded.stats[StatField::NumMaskedTokens] = total - loss_valid;
        encoded.stats[StatField::Processed] = 1;
        encoded.stats[StatField::Successful] = 1;
        encoded.push(
            DATA_FIELD,
            FieldArray::from_ids(vec![6, self.max_seq_length], values)?,
        );
        Ok(encoded)
    }

    fn record_shape(&self) -> RecordShape {
        RecordShape::Preference
    }

    fn features(&self) -> Vec<String> {
        [
            "chosen_input_ids",
            "chosen_attention_mask",
            "chosen_labels",
            "rejected_input_ids",
            "rejected_attention_mask",
            "rejected_labels",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{JobConfig, Mode};
    use crate::error::PipelineError;
    use crate::reader::Frame;
    use crate::tokenizer::ByteTokenizer;

    fn generator(max_seq: usize, max_prompt: usize) -> DpoGenerator {
        let mut config = JobConfig::default();
        config.setup.mode = Mode::Dpo;
        config.processing.max_seq_length = max_seq;
        config.processing.max_prompt_length = max_prompt;
        let tokenizer: SharedTokenizer = Arc::new(ByteTokenizer::new());
        let ctx = GeneratorContext {
            config: &config,
            ids: config.special_ids(tokenizer.as_ref()),
            tokenizer,
            seed: 0,
        };
        DpoGenerator::new(&ctx)
    }

    fn pair(prompt: Option<&str>, chosen: &str, rejected: &str) -> Document {
        Document::Preference {
            prompt: prompt.map(String::from),
            chosen: chosen.into(),
            rejected: rejected.into(),
        }
    }

    fn rows(encoded: &Encoded, len: usize) -> Vec<Vec<i64>> {
        let row = encoded.data[DATA_FIELD][0].int_row(0).unwrap();
        row.chunks(len).map(<[i64]>::to_vec).collect()
    }

    #[test]
    fn test_prompt_region_masked() {
        let mut generator = generator(64, 16);
        let encoded = generator
            .encode(pair(Some("Hi"), "Hello!", "Go away"))
            .unwrap();
        let rows = rows(&encoded, 64);
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|row| row.len() == 64));

        // "[INST] Hi " is 10 bytes, plus the leading eos standing in for bos
        let prompt_len = 11;
        let chosen_len = prompt_len + "[/INST] Hello!".len() + 1;
        assert_eq!(rows[0][0], 256);
        assert!(rows[1][..prompt_len - 1].iter().all(|&m| m == 0));
        assert!(rows[1][prompt_len - 1..chosen_len].iter().all(|&m| m == 1));
        assert!(rows[1][chosen_len..].iter().all(|&m| m == 0));
        assert!(rows[2][..prompt_len - 1].iter().all(|&l| l == 256));
        assert_eq!(rows[2][prompt_len - 1], i64::from(b'['));
        assert_eq!(rows[2][chosen_len - 2], 256);

        let rejected_len = prompt_len + "[/INST] Go away".len() + 1;
        let expected_valid = (chosen_len - prompt_len + 1) + (rejected_len - prompt_len + 1);
        assert_eq!(encoded.stats[StatField::LossValidTokens], expected_valid as u64);
        assert_eq!(encoded.stats[StatField::NumTokens], 6 * 64);
        assert_eq!(encoded.stats[StatField::Successful], 1);
    }

    #[test]
    fn test_empty_chosen_discarded() {
        let mut generator = generator(64, 16);
        let mut frame = Frame {
            documents: vec![pair(Some("Hi"), "", "Go away")],
            ..Frame::default()
        };
        generator.encode_frame(&mut frame).unwrap();
        assert_eq!(frame.stats[StatField::Discarded], 1);
        assert!(frame.tokenized.is_empty());
    }

    #[test]
    fn test_prompt_inferred_from_chosen() {
        let mut generator = generator(128, 64);
        let encoded = generator
            .encode(pair(None, "Human: hi Assistant: hello", "Human: hi Assistant: bye"))
            .unwrap();
        assert_eq!(encoded.rows(DATA_FIELD), 1);

        let err = generator
            .encode(pair(None, "no marker here", "nor here"))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Document(DocumentError::MissingPromptDelimiter(_))
        ));
    }

    #[test]
    fn test_inferred_prompt_ends_at_marker() {
        let mut generator = generator(128, 64);
        assert_eq!(
            generator.infer_prompt("User: hi ASSISTANT: hello").unwrap(),
            "User: hi ASSISTANT:"
        );

        generator.assistant_role = "Assistant".into();
        assert!(matches!(
            generator.infer_prompt("User: hi Assistant: hello"),
            Err(PipelineError::Document(DocumentError::MissingPromptDelimiter(_)))
        ));
    }

    /// Byte tokenizer that folds fixed strings into single ids, scanning
    /// left to right.
    struct MergingTokenizer {
        merges: Vec<(&'static str, u32)>,
    }

    impl Tokenizer for MergingTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            let mut ids = Vec::new();
            let mut rest = text.as_bytes();
            while let Some((&byte, tail)) = rest.split_first() {
                match self
                    .merges
                    .iter()
                    .find(|(piece, _)| rest.starts_with(piece.as_bytes()))
                {
                    Some((piece, id)) => {
                        ids.push(*id);
                        rest = &rest[piece.len()..];
                    }
                    None => {
                        ids.push(u32::from(byte));
                        rest = tail;
                    }
                }
            }
            Ok(ids)
        }

        fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
            let bytes: Vec<u8> = ids.iter().filter_map(|&id| u8::try_from(id).ok()).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn vocab_size(&self) -> usize {
            300
        }

        fn eos_token_id(&self) -> u32 {
            256
        }
    }

    fn merging_generator(merges: Vec<(&'static str, u32)>) -> DpoGenerator {
        let mut config = JobConfig::default();
        config.setup.mode = Mode::Dpo;
        config.processing.max_seq_length = 64;
        config.processing.max_prompt_length = 16;
        let tokenizer: SharedTokenizer = Arc::new(MergingTokenizer { merges });
        let ctx = GeneratorContext {
            config: &config,
            ids: config.special_ids(tokenizer.as_ref()),
            tokenizer,
            seed: 0,
        };
        DpoGenerator::new(&ctx)
    }

    #[test]
    fn test_boundary_merge_moves_split() {
        // merges the prompt's trailing space into the rejected response only
        let mut generator = merging_generator(vec![(" [/INST] G", 280)]);
        let encoded = generator
            .encode(pair(Some("Hi"), "Hello!", "Go away"))
            .unwrap();
        let rows = rows(&encoded, 64);

        // bos stand-in + "[INST] Hi " for chosen, one token shorter for rejected
        assert!(rows[1][..10].iter().all(|&m| m == 0));
        assert_eq!(rows[1][10], 1);
        assert!(rows[4][..9].iter().all(|&m| m == 0));
        assert_eq!(rows[4][9], 1);
        assert_eq!(rows[3][10], 280);
        assert_eq!(rows[5][9], 280);
    }

    #[test]
    fn test_prompt_mismatch_rejected() {
        // swallows part of the prompt into the rejected response
        let mut generator = merging_generator(vec![("Hi [/INST] Go", 281)]);
        let err = generator
            .encode(pair(Some("Hi"), "Hello!", "Go away"))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Document(DocumentError::PromptMismatch {
                differing_tokens: 2,
                length_difference: 1,
            })
        ));

        let mut frame = Frame {
            documents: vec![pair(Some("Hi"), "Hello!", "Go away")],
            ..Frame::default()
        };
        generator.encode_frame(&mut frame).unwrap();
        assert_eq!(frame.stats[StatField::Discarded], 1);
    }

    #[test]
    fn test_long_prompt_truncated() {
        let mut generator = generator(32, 8);
        let long_prompt = "x".repeat(40);
        let encoded = generator
            .encode(pair(Some(&long_prompt), "Hello!", "Go away"))
            .unwrap();
        let rows = rows(&encoded, 32);
        // the prompt keeps its last 8 tokens
        assert!(rows[1][..7].iter().all(|&m| m == 0));
        assert_eq!(rows[1][7], 1);
        assert_eq!(rows[0][8], i64::from(b'['));
        let chosen_len = 8 + "[/INST] Hello!".len() + 1;
        assert_eq!(rows[1].iter().sum::<i64>() as usize, chosen_len - 7);
    }

    #[test]
    fn test_missing_response_delimiter() {
        let mut generator = generator(64, 16);
        generator.response_delimiter = Some("<bot>".into());
        let err = generator
            .encode(pair(Some("Hi"), "Hello!", "Go away"))
            .unwrap_err();
        assert!(err.is_document_level());
    }
}

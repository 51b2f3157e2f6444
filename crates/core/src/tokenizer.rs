//! The tokenizer capability consumed by every token generator.

use std::sync::Arc;

use crate::chat::ChatMessage;
use crate::error::{PipelineError, Result};

/// Trait for tokenization operations.
///
/// Only `encode`, `decode`, `vocab_size` and `eos_token_id` are required.
/// Chat templating is optional: when `apply_chat_template` returns `None`
/// callers fall back to manual role-tag formatting.
pub trait Tokenizer {
    /// Encode text into token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids back into text.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    fn vocab_size(&self) -> usize;

    fn eos_token_id(&self) -> u32;

    fn pad_token_id(&self) -> Option<u32> {
        None
    }

    fn bos_token_id(&self) -> Option<u32> {
        None
    }

    /// Whether `encode` already prepends the bos token.
    fn adds_bos_token(&self) -> bool {
        false
    }

    /// Look up the id of a single (usually special) token.
    fn token_to_id(&self, _token: &str) -> Option<u32> {
        None
    }

    /// Render a conversation with the tokenizer's own chat template.
    fn apply_chat_template(
        &self,
        _messages: &[ChatMessage],
        _add_generation_prompt: bool,
    ) -> Option<String> {
        None
    }
}

// Blanket implementation for references to Tokenizers
impl<T: Tokenizer + ?Sized> Tokenizer for &T {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        (*self).encode(text)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        (*self).decode(ids, skip_special_tokens)
    }

    fn vocab_size(&self) -> usize {
        (*self).vocab_size()
    }

    fn eos_token_id(&self) -> u32 {
        (*self).eos_token_id()
    }

    fn pad_token_id(&self) -> Option<u32> {
        (*self).pad_token_id()
    }

    fn bos_token_id(&self) -> Option<u32> {
        (*self).bos_token_id()
    }

    fn adds_bos_token(&self) -> bool {
        (*self).adds_bos_token()
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (*self).token_to_id(token)
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Option<String> {
        (*self).apply_chat_template(messages, add_generation_prompt)
    }
}

/// Tokenizer handle shared by every worker thread.
pub type SharedTokenizer = Arc<dyn Tokenizer + Send + Sync>;

/// Byte-level tokenizer: ids `0..256` are raw bytes, special tokens follow.
///
/// The first special token is the end-of-sequence token. Special tokens are
/// matched greedily (longest first) before falling back to bytes, so
/// `encode(a + b) == encode(a) + encode(b)` whenever no special token
/// straddles the boundary.
#[derive(Debug, Clone)]
pub struct ByteTokenizer {
    special_tokens: Vec<String>,
    pad_token: Option<u32>,
    bos_token: Option<u32>,
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteTokenizer {
    pub const BYTE_VOCAB: u32 = 256;
    pub const EOS_TOKEN: &'static str = "<|endoftext|>";

    pub fn new() -> Self {
        Self {
            special_tokens: vec![Self::EOS_TOKEN.to_string()],
            pad_token: None,
            bos_token: None,
        }
    }

    /// Register additional special tokens (duplicates are ignored).
    #[must_use]
    pub fn with_special_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for token in tokens {
            let token = token.into();
            if !self.special_tokens.contains(&token) {
                self.special_tokens.push(token);
            }
        }
        self
    }

    /// Use (and register) `token` as the padding token.
    #[must_use]
    pub fn with_pad_token(mut self, token: &str) -> Self {
        self = self.with_special_tokens([token]);
        self.pad_token = self.token_to_id(token);
        self
    }

    /// Use (and register) `token` as the bos token. It is not added by `encode`.
    #[must_use]
    pub fn with_bos_token(mut self, token: &str) -> Self {
        self = self.with_special_tokens([token]);
        self.bos_token = self.token_to_id(token);
        self
    }

    fn special_id(&self, index: usize) -> u32 {
        Self::BYTE_VOCAB + index as u32
    }

    fn match_special(&self, rest: &str) -> Option<(usize, &str)> {
        self.special_tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| !token.is_empty() && rest.starts_with(token.as_str()))
            .max_by_key(|(_, token)| token.len())
            .map(|(index, token)| (index, token.as_str()))
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len());
        let mut offset = 0;
        while offset < text.len() {
            let rest = &text[offset..];
            if let Some((index, token)) = self.match_special(rest) {
                ids.push(self.special_id(index));
                offset += token.len();
                continue;
            }
            let ch = rest.chars().next().ok_or_else(|| {
                PipelineError::Tokenizer(format!("invalid char boundary at {offset}"))
            })?;
            let mut buf = [0u8; 4];
            ids.extend(ch.encode_utf8(&mut buf).bytes().map(u32::from));
            offset += ch.len_utf8();
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            if id < Self::BYTE_VOCAB {
                bytes.push(id as u8);
                continue;
            }
            let index = (id - Self::BYTE_VOCAB) as usize;
            let token = self
                .special_tokens
                .get(index)
                .ok_or_else(|| PipelineError::Tokenizer(format!("unknown token id {id}")))?;
            if !skip_special_tokens {
                bytes.extend_from_slice(token.as_bytes());
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        Self::BYTE_VOCAB as usize + self.special_tokens.len()
    }

    fn eos_token_id(&self) -> u32 {
        self.special_id(0)
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos_token
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.special_tokens
            .iter()
            .position(|t| t == token)
            .map(|index| self.special_id(index))
    }
}

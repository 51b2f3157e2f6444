//! Token-budget formatter for the fill-in-the-middle objective.
//!
//! A window of token ids is split into sub-documents at every eos token. Each
//! sub-document is either rearranged into prefix/suffix/middle order (after
//! splitting its decoded text at two random character boundaries and
//! re-encoding the three parts) or kept autoregressive. Re-encoding can change
//! the token count, so the segments are then truncated or padded until the
//! formatted sequence is exactly `seq_len + 1` tokens long, which yields
//! `seq_len` inputs and `seq_len` shifted labels.

use rand::Rng;

use crate::error::{DocumentError, Result};
use crate::text::char_to_byte_offset;
use crate::tokenizer::Tokenizer;

/// Token order of one formatted segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FimFormat {
    /// `<pre> prefix <suf> suffix <mid> middle <eos>`
    Psm,
    /// `<pre><suf> suffix <mid> prefix middle <eos>`
    Spm,
    /// `prefix middle suffix <eos>`, with prefix and middle empty.
    Ar,
}

impl FimFormat {
    /// Special tokens added around the segment, eos included.
    fn special_token_count(self) -> i64 {
        match self {
            FimFormat::Psm | FimFormat::Spm => 4,
            FimFormat::Ar => 1,
        }
    }
}

/// One sub-document split into its three parts.
///
/// Autoregressive segments keep all their tokens in `suffix`, so truncation
/// always starts from the end of a segment's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub prefix: Vec<u32>,
    pub middle: Vec<u32>,
    pub suffix: Vec<u32>,
    pub padding: Vec<u32>,
    pub format: FimFormat,
}

impl Segment {
    pub fn autoregressive(tokens: Vec<u32>) -> Self {
        Self {
            prefix: Vec::new(),
            middle: Vec::new(),
            suffix: tokens,
            padding: Vec::new(),
            format: FimFormat::Ar,
        }
    }

    fn text_len(&self) -> usize {
        self.prefix.len() + self.middle.len() + self.suffix.len()
    }
}

/// Special token ids used by the formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FimTokens {
    pub prefix: u32,
    pub middle: u32,
    pub suffix: u32,
    pub pad: u32,
    pub eos: u32,
    /// Prepended to every segment when the tokenizer adds bos by default.
    pub bos: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FimSettings {
    pub fim_rate: f64,
    pub spm_rate: f64,
    pub tokens: FimTokens,
}

/// `seq_len`-long inputs, loss mask and next-token labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormattedSample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<u32>,
}

/// Split `tokens` into the non-empty runs between eos tokens.
///
/// The run after the last eos is kept when non-empty; a window without any
/// eos is a single run.
pub fn split_on_eos(tokens: &[u32], eos: u32) -> Vec<&[u32]> {
    tokens
        .split(|&id| id == eos)
        .filter(|run| !run.is_empty())
        .collect()
}

fn encode_without_bos(tokenizer: &dyn Tokenizer, text: &str) -> Result<Vec<u32>> {
    let mut ids = tokenizer.encode(text)?;
    if tokenizer.adds_bos_token() && ids.first().copied() == tokenizer.bos_token_id() {
        ids.remove(0);
    }
    Ok(ids)
}

/// Decide the format of one sub-document and split it accordingly.
pub fn chunk<R: Rng + ?Sized>(
    tokens: &[u32],
    tokenizer: &dyn Tokenizer,
    settings: &FimSettings,
    rng: &mut R,
) -> Result<Segment> {
    if !rng.gen_bool(settings.fim_rate) {
        return Ok(Segment::autoregressive(tokens.to_vec()));
    }

    let contents = tokenizer.decode(tokens, false)?;
    let num_chars = contents.chars().count();
    // boundaries may coincide or sit at either end, leaving empty parts
    let mut bounds = [rng.gen_range(0..=num_chars), rng.gen_range(0..=num_chars)];
    bounds.sort_unstable();
    let start = char_to_byte_offset(&contents, bounds[0]);
    let end = char_to_byte_offset(&contents, bounds[1]);

    let format = if rng.gen_bool(settings.spm_rate) {
        FimFormat::Spm
    } else {
        FimFormat::Psm
    };
    Ok(Segment {
        prefix: encode_without_bos(tokenizer, &contents[..start])?,
        middle: encode_without_bos(tokenizer, &contents[start..end])?,
        suffix: encode_without_bos(tokenizer, &contents[end..])?,
        padding: Vec::new(),
        format,
    })
}

/// Number of tokens the formatted segments exceed (`> 0`) or miss (`< 0`)
/// the target length by, accounting for the shift between inputs and labels.
pub fn length_difference(segments: &[Segment], seq_len: usize, with_bos: bool) -> i64 {
    let text: usize = segments.iter().map(Segment::text_len).sum();
    let specials: i64 = segments
        .iter()
        .map(|s| s.format.special_token_count() + i64::from(with_bos))
        .sum();
    text as i64 + specials - 1 - seq_len as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Prefix,
    Middle,
    Suffix,
}

impl Region {
    fn next(self) -> Self {
        match self {
            Region::Suffix => Region::Prefix,
            Region::Prefix => Region::Middle,
            Region::Middle => Region::Suffix,
        }
    }
}

/// Remove `count` tokens, visiting the segments round-robin.
///
/// Each segment loses tokens from the end of its suffix first, then from the
/// start of its prefix, and only then from the start of its middle. A visit
/// that finds the current region empty moves that segment to the next region
/// without removing anything.
pub fn truncate_segments(segments: &mut [Segment], count: usize, sample_idx: usize) -> Result<()> {
    let available: usize = segments.iter().map(Segment::text_len).sum();
    if count > available {
        return Err(DocumentError::Invariant(format!(
            "cannot remove {count} tokens from segments holding {available}"
        ))
        .into());
    }

    let mut regions = vec![Region::Suffix; segments.len()];
    let mut remaining = count;
    let mut i = 0;
    while remaining > 0 {
        let segment = &mut segments[i];
        let removed = match regions[i] {
            Region::Suffix => segment.suffix.pop().is_some(),
            Region::Prefix if !segment.prefix.is_empty() => {
                segment.prefix.remove(0);
                true
            }
            Region::Middle if !segment.middle.is_empty() => {
                segment.middle.remove(0);
                true
            }
            _ => false,
        };
        if removed {
            remaining -= 1;
        } else {
            regions[i] = regions[i].next();
            if regions[i] == Region::Middle {
                log::warn!(
                    "context {i} of sample {sample_idx} is truncating its middle section; \
                     prefix and suffix are exhausted"
                );
            }
        }
        i = (i + 1) % segments.len();
    }
    Ok(())
}

/// Append `count` pad tokens after the last segment.
pub fn pad_segments(segments: &mut [Segment], count: usize, pad: u32) {
    if let Some(last) = segments.last_mut() {
        last.padding.extend(std::iter::repeat(pad).take(count));
    }
}

/// Concatenate the segments in their formats and shift into inputs and labels.
pub fn format_fim(segments: &[Segment], seq_len: usize, tokens: &FimTokens) -> Result<FormattedSample> {
    let mut sequence = Vec::with_capacity(seq_len + 1);
    let mut total_padding = 0;
    for segment in segments {
        sequence.extend(tokens.bos);
        match segment.format {
            FimFormat::Psm => {
                sequence.push(tokens.prefix);
                sequence.extend_from_slice(&segment.prefix);
                sequence.push(tokens.suffix);
                sequence.extend_from_slice(&segment.suffix);
                sequence.push(tokens.middle);
                sequence.extend_from_slice(&segment.middle);
            }
            FimFormat::Spm => {
                sequence.push(tokens.prefix);
                sequence.push(tokens.suffix);
                sequence.extend_from_slice(&segment.suffix);
                sequence.push(tokens.middle);
                sequence.extend_from_slice(&segment.prefix);
                sequence.extend_from_slice(&segment.middle);
            }
            FimFormat::Ar => {
                sequence.extend_from_slice(&segment.prefix);
                sequence.extend_from_slice(&segment.middle);
                sequence.extend_from_slice(&segment.suffix);
            }
        }
        sequence.push(tokens.eos);
        sequence.extend_from_slice(&segment.padding);
        total_padding += segment.padding.len();
    }

    if sequence.len() != seq_len + 1 || total_padding > seq_len {
        log::error!(
            "formatted sequence has {} tokens and {total_padding} padding, expected {}",
            sequence.len(),
            seq_len + 1
        );
        return Err(DocumentError::Invariant(format!(
            "formatted length {} does not match sequence length {seq_len}",
            sequence.len().saturating_sub(1)
        ))
        .into());
    }

    let labels = sequence[1..].to_vec();
    sequence.truncate(seq_len);
    let valid = seq_len - total_padding;
    let mut attention_mask = vec![1; valid];
    attention_mask.resize(seq_len, 0);

    if valid == 0 || labels[valid - 1] != tokens.eos {
        log::error!("the formatted sequence does not end with an eos token");
        return Err(DocumentError::Invariant("last valid label is not eos".to_string()).into());
    }

    Ok(FormattedSample {
        input_ids: sequence,
        attention_mask,
        labels,
    })
}

/// Apply the fill-in-the-middle transformation to one window of tokens.
///
/// `tokens` holds the real (unpadded) tokens of the window, at most
/// `seq_len + 1` of them. The result always has exactly `seq_len` positions.
pub fn fim<R: Rng + ?Sized>(
    tokens: &[u32],
    seq_len: usize,
    sample_idx: usize,
    tokenizer: &dyn Tokenizer,
    settings: &FimSettings,
    rng: &mut R,
) -> Result<FormattedSample> {
    let fim_tokens = &settings.tokens;
    let mut segments = split_on_eos(tokens, fim_tokens.eos)
        .into_iter()
        .map(|run| chunk(run, tokenizer, settings, rng))
        .collect::<Result<Vec<_>>>()?;
    if segments.is_empty() {
        segments.push(Segment::autoregressive(Vec::new()));
    }

    let diff = length_difference(&segments, seq_len, fim_tokens.bos.is_some());
    if diff >= 0 {
        truncate_segments(&mut segments, diff as usize, sample_idx)?;
    } else {
        pad_segments(&mut segments, diff.unsigned_abs() as usize, fim_tokens.pad);
    }
    format_fim(&segments, seq_len, fim_tokens)
}

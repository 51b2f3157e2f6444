//! Helper functions for text normalisation and human readable reporting.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

// Bracket and quote spacing patterns used by the wikitext detokenizer
static PAREN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(\s*([^\)]*?)\s*\)").unwrap());
static SQUARE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\s*([^\]]*?)\s*\]").unwrap());
static CURLY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\s*([^}]*?)\s*\}").unwrap());
static DOUBLE_QUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""\s*([^"]*?)\s*""#).unwrap());
static SINGLE_QUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'\s*([^']*?)\s*'").unwrap());

/// Find the largest valid UTF-8 char boundary <= index.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        s.len()
    } else {
        let mut i = index;
        while i > 0 && !s.is_char_boundary(i) {
            i -= 1;
        }
        i
    }
}

/// Byte offset of the `char_index`-th character, or `s.len()` past the end.
pub fn char_to_byte_offset(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map_or(s.len(), |(offset, _)| offset)
}

/// Clean text by normalizing line endings and trimming trailing whitespace.
pub fn clean_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim_end()
        .to_string()
}

/// Undo the whitespace tokenization of wikitext dumps.
pub fn wikitext_detokenize(text: &str) -> String {
    let mut s = text.replace("s '", "s'");

    // number separators
    for (from, to) in [(" @-@ ", "-"), (" @,@ ", ","), (" @.@ ", ".")] {
        s = s.replace(from, to);
    }

    // punctuation
    for (from, to) in [
        (" : ", ": "),
        (" ; ", "; "),
        (" . ", ". "),
        (" ! ", "! "),
        (" ? ", "? "),
        (" , ", ", "),
    ] {
        s = s.replace(from, to);
    }

    s = PAREN_RE.replace_all(&s, "($1)").into_owned();
    s = SQUARE_RE.replace_all(&s, "[$1]").into_owned();
    s = CURLY_RE.replace_all(&s, "{$1}").into_owned();
    s = DOUBLE_QUOTE_RE.replace_all(&s, "\"$1\"").into_owned();
    s = SINGLE_QUOTE_RE.replace_all(&s, "'$1'").into_owned();

    for (from, to) in [
        ("= = = =", "===="),
        ("= = =", "==="),
        ("= =", "=="),
        (" \u{b0} ", "\u{b0}"),
        (" \n", "\n"),
        ("\n ", "\n"),
        (" N ", " 1 "),
        (" 's", "'s"),
    ] {
        s = s.replace(from, to);
    }
    s
}

/// Character and byte counts of `text`.
pub fn char_byte_counts(text: &str) -> (u64, u64) {
    (text.chars().count() as u64, text.len() as u64)
}

/// Format a byte count as `12.3 MB`.
pub fn human_readable_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Format a duration in seconds as `1h 02m 03s`.
pub fn format_time(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// How many times larger the decoded content of `path` is assumed to be.
pub fn compression_factor(path: &Path) -> u64 {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("gz") | Some("zst") => 3,
        _ => 1,
    }
}

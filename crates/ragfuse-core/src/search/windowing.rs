//! Token windowing of candidate documents for fine-grained reranking and
//! citation.
//!
//! Tokens are whitespace-delimited words. Documents that fit in one window
//! yield exactly one window. Longer documents are split on paragraph breaks
//! (a gap holding two or more newlines), short paragraphs are glued to their
//! neighbours, and each segment is chunked with a fixed stride of
//! `size_tokens - floor(size_tokens * overlap_pct)`. Pure and deterministic.

use serde::{Deserialize, Serialize};

use crate::candidate::{Candidate, Metadata};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    pub enabled: bool,
    pub size_tokens: usize,
    /// Fraction of a window shared with the next one, in [0, 1).
    pub overlap_pct: f64,
    /// Paragraphs shorter than this are merged into a neighbour.
    pub min_window_tokens: usize,
    pub max_windows_per_doc: usize,
    /// How many of the top fused candidates get windowed.
    pub top_n: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size_tokens: 150,
            overlap_pct: 0.33,
            min_window_tokens: 30,
            max_windows_per_doc: 3,
            top_n: 20,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_tokens == 0 {
            return Err(ConfigError::invalid("window.size_tokens", "must be >= 1"));
        }
        if !(0.0..1.0).contains(&self.overlap_pct) {
            return Err(ConfigError::invalid("window.overlap_pct", "must be within [0, 1)"));
        }
        if self.min_window_tokens > self.size_tokens {
            return Err(ConfigError::invalid(
                "window.min_window_tokens",
                "must be <= window.size_tokens",
            ));
        }
        if self.max_windows_per_doc == 0 {
            return Err(ConfigError::invalid("window.max_windows_per_doc", "must be >= 1"));
        }
        Ok(())
    }

    /// Token step between consecutive window starts; at least 1.
    #[must_use]
    pub fn stride(&self) -> usize {
        let overlap = (self.size_tokens as f64 * self.overlap_pct).floor() as usize;
        self.size_tokens.saturating_sub(overlap).max(1)
    }
}

/// A contiguous token span of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentWindow {
    pub window_id: String,
    pub document_id: String,
    pub text: String,
    /// Inclusive start token offset.
    pub start_token: usize,
    /// Exclusive end token offset; always greater than `start_token`.
    pub end_token: usize,
    pub window_index: usize,
    pub original_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_char: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_char: Option<usize>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl DocumentWindow {
    #[must_use]
    pub fn token_len(&self) -> usize {
        self.end_token - self.start_token
    }
}

#[derive(Debug, Clone, Copy)]
struct Token {
    byte_start: usize,
    byte_end: usize,
    char_start: usize,
    char_end: usize,
    /// Preceded by a paragraph break.
    paragraph_start: bool,
}

fn tokenize_spans(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut newlines_in_gap = 0usize;
    let mut current: Option<(usize, usize, bool)> = None;
    let mut char_total = 0usize;

    for (char_idx, (byte_idx, ch)) in text.char_indices().enumerate() {
        char_total = char_idx + 1;
        if ch.is_whitespace() {
            if let Some((byte_start, char_start, paragraph_start)) = current.take() {
                tokens.push(Token {
                    byte_start,
                    byte_end: byte_idx,
                    char_start,
                    char_end: char_idx,
                    paragraph_start,
                });
            }
            if ch == '\n' {
                newlines_in_gap += 1;
            }
        } else if current.is_none() {
            let paragraph_start = newlines_in_gap >= 2 && !tokens.is_empty();
            current = Some((byte_idx, char_idx, paragraph_start));
            newlines_in_gap = 0;
        }
    }
    if let Some((byte_start, char_start, paragraph_start)) = current {
        tokens.push(Token {
            byte_start,
            byte_end: text.len(),
            char_start,
            char_end: char_total,
            paragraph_start,
        });
    }
    tokens
}

/// Paragraph token ranges with short paragraphs glued to a neighbour.
fn segments(tokens: &[Token], min_tokens: usize) -> Vec<(usize, usize)> {
    let mut paragraphs: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        if token.paragraph_start && i > start {
            paragraphs.push((start, i));
            start = i;
        }
    }
    if start < tokens.len() {
        paragraphs.push((start, tokens.len()));
    }

    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(paragraphs.len());
    for (s, e) in paragraphs {
        match merged.last_mut() {
            Some(last) if last.1 - last.0 < min_tokens => last.1 = e,
            _ => merged.push((s, e)),
        }
    }
    // A short tail joins the previous segment.
    if merged.len() > 1 {
        if let Some(&(s, e)) = merged.last() {
            if e - s < min_tokens {
                merged.pop();
                if let Some(prev) = merged.last_mut() {
                    prev.1 = e;
                }
            }
        }
    }
    merged
}

#[derive(Debug, Clone, Default)]
pub struct Windower {
    config: WindowConfig,
}

impl Windower {
    pub fn new(config: WindowConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Window every candidate, at most `max_windows_per_doc` each (config
    /// value when `None`). Output is grouped by candidate in input order.
    pub fn create_windows(
        &self,
        candidates: &[Candidate],
        max_windows_per_doc: Option<usize>,
    ) -> Vec<DocumentWindow> {
        let cap = max_windows_per_doc.unwrap_or(self.config.max_windows_per_doc);
        candidates
            .iter()
            .flat_map(|c| self.window_document(c, cap))
            .collect()
    }

    /// Windows of one candidate. Text without tokens yields nothing.
    pub fn window_document(&self, candidate: &Candidate, cap: usize) -> Vec<DocumentWindow> {
        let text = candidate.text.as_str();
        let tokens = tokenize_spans(text);
        if tokens.is_empty() || cap == 0 {
            return Vec::new();
        }

        let size = self.config.size_tokens;
        let stride = self.config.stride();
        let mut spans: Vec<(usize, usize)> = Vec::new();

        if tokens.len() <= size {
            spans.push((0, tokens.len()));
        } else {
            'outer: for (seg_start, seg_end) in segments(&tokens, self.config.min_window_tokens) {
                let mut start = seg_start;
                loop {
                    let end = (start + size).min(seg_end);
                    spans.push((start, end));
                    if spans.len() >= cap {
                        break 'outer;
                    }
                    if end == seg_end {
                        break;
                    }
                    start += stride;
                }
            }
        }

        spans.truncate(cap);
        spans
            .into_iter()
            .enumerate()
            .map(|(window_index, (start, end))| {
                let first = tokens[start];
                let last = tokens[end - 1];
                DocumentWindow {
                    window_id: format!("{}#w{}", candidate.id, window_index),
                    document_id: candidate.id.clone(),
                    text: text[first.byte_start..last.byte_end].to_string(),
                    start_token: start,
                    end_token: end,
                    window_index,
                    original_score: candidate.score,
                    start_char: Some(first.char_start),
                    end_char: Some(last.char_end),
                    metadata: candidate.metadata.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize, prefix: &str) -> String {
        (0..n).map(|i| format!("{prefix}{i}")).collect::<Vec<_>>().join(" ")
    }

    fn windower(size: usize, overlap: f64, min: usize, cap: usize) -> Windower {
        Windower::new(WindowConfig {
            size_tokens: size,
            overlap_pct: overlap,
            min_window_tokens: min,
            max_windows_per_doc: cap,
            ..WindowConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn short_document_is_one_window() {
        let c = Candidate::new("d", 0.7, "just a few words here");
        let windows = Windower::default().create_windows(&[c], None);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start_token, 0);
        assert_eq!(windows[0].end_token, 5);
        assert_eq!(windows[0].text, "just a few words here");
        assert_eq!(windows[0].window_id, "d#w0");
        assert!((windows[0].original_score - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_document_has_no_windows() {
        let c = Candidate::new("d", 0.7, "   \n ");
        assert!(Windower::default().create_windows(&[c], None).is_empty());
    }

    #[test]
    fn stride_respects_overlap() {
        let config = WindowConfig::default();
        assert_eq!(config.stride(), 101);
        let w = windower(10, 0.3, 1, 10);
        let c = Candidate::new("d", 1.0, words(25, "t"));
        let windows = w.create_windows(&[c], None);
        let starts: Vec<usize> = windows.iter().map(|w| w.start_token).collect();
        assert_eq!(starts, vec![0, 7, 14, 21]);
        assert_eq!(windows.last().map(|w| w.end_token), Some(25));
    }

    #[test]
    fn cap_limits_windows() {
        let w = windower(10, 0.0, 1, 2);
        let c = Candidate::new("d", 1.0, words(100, "t"));
        let windows = w.create_windows(&[c.clone()], None);
        assert_eq!(windows.len(), 2);
        assert_eq!(w.create_windows(&[c], Some(5)).len(), 5);
    }

    #[test]
    fn paragraphs_start_new_windows() {
        let text = format!("{}\n\n{}", words(12, "a"), words(12, "b"));
        let w = windower(20, 0.0, 5, 10);
        let windows = w.create_windows(&[Candidate::new("d", 1.0, text)], None);
        assert_eq!(windows.len(), 2);
        assert_eq!((windows[0].start_token, windows[0].end_token), (0, 12));
        assert_eq!((windows[1].start_token, windows[1].end_token), (12, 24));
        assert!(windows[1].text.starts_with("b0"));
    }

    #[test]
    fn short_paragraphs_are_merged() {
        let text = format!("{}\n\n{}\n\n{}", words(3, "a"), words(3, "b"), words(20, "c"));
        let w = windower(20, 0.0, 5, 10);
        let windows = w.create_windows(&[Candidate::new("d", 1.0, text)], None);
        // The two 3-token paragraphs form one segment.
        assert_eq!(windows.len(), 2);
        assert_eq!((windows[0].start_token, windows[0].end_token), (0, 6));
        assert_eq!((windows[1].start_token, windows[1].end_token), (6, 26));
    }

    #[test]
    fn char_offsets_slice_original_text() {
        let text = format!("héllo wörld {}", words(30, "x"));
        let w = windower(10, 0.5, 1, 10);
        let c = Candidate::new("d", 1.0, text.clone());
        for window in w.create_windows(&[c], None) {
            let (s, e) = (window.start_char.unwrap(), window.end_char.unwrap());
            let slice: String = text.chars().skip(s).take(e - s).collect();
            assert_eq!(slice, window.text);
        }
    }

    #[test]
    fn indices_strictly_increase() {
        let w = windower(8, 0.25, 2, 10);
        let windows = w.create_windows(&[Candidate::new("d", 1.0, words(50, "w"))], None);
        for pair in windows.windows(2) {
            assert!(pair[1].window_index > pair[0].window_index);
            assert!(pair[1].start_token >= pair[0].start_token);
        }
    }

    #[test]
    fn invalid_overlap_rejected() {
        assert!(windower_config_err(1.0));
        assert!(windower_config_err(-0.1));
    }

    fn windower_config_err(overlap: f64) -> bool {
        Windower::new(WindowConfig {
            overlap_pct: overlap,
            ..WindowConfig::default()
        })
        .is_err()
    }
}

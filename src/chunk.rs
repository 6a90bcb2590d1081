//! Sliding-window text chunker with soft boundaries.
//!
//! Advances a window of `chunk_size` characters over the text. When the
//! window's right edge falls inside the text, the edge is pulled back to
//! the nearest sentence end (`.`, `!` or `?` followed by whitespace) or,
//! failing that, the nearest whitespace within `lookback` characters. The
//! next window starts `overlap` characters before the previous end.
//!
//! Offsets are character positions, so multi-byte text never splits
//! inside a code point. Whitespace-only slices are dropped.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{Chunk, Document};

const DEFAULT_LOOKBACK: usize = 50;

/// A trimmed slice of the source, in character offsets.
#[derive(Debug, Clone, PartialEq)]
struct Span {
    start: usize,
    end: usize,
    text: String,
}

#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    chunk_size: usize,
    overlap: usize,
    lookback: usize,
}

impl ChunkSplitter {
    /// Requires `chunk_size > overlap`.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if overlap >= chunk_size {
            bail!(
                "overlap ({}) must be smaller than chunk_size ({})",
                overlap,
                chunk_size
            );
        }
        Ok(Self {
            chunk_size,
            overlap,
            lookback: DEFAULT_LOOKBACK,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Ok(Self::new(config.chunk_size, config.overlap)?.with_lookback(config.lookback))
    }

    pub fn with_lookback(mut self, lookback: usize) -> Self {
        self.lookback = lookback;
        self
    }

    /// Split `text` into ordered, non-empty chunk strings.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.spans(text).into_iter().map(|s| s.text).collect()
    }

    /// Split a document into [`Chunk`]s with positional metadata.
    pub fn chunk_document(&self, document: &Document) -> Vec<Chunk> {
        let spans = self.spans(&document.text);
        let count = spans.len();
        spans
            .into_iter()
            .enumerate()
            .map(|(index, span)| Chunk {
                id: format!("{}#{}", document.id, index),
                document_id: document.id.clone(),
                chunk_index: index,
                chunk_count: count,
                start: span.start,
                end: span.end,
                hash: sha256_hex(&span.text),
                text: span.text,
            })
            .collect()
    }

    fn spans(&self, text: &str) -> Vec<Span> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        let mut spans = Vec::new();
        let mut start = 0;

        while start < len {
            let hard_end = (start + self.chunk_size).min(len);
            let end = if hard_end < len {
                self.soft_end(&chars, start, hard_end)
            } else {
                hard_end
            };

            if let Some(span) = trimmed_span(&chars, start, end) {
                spans.push(span);
            }
            if end >= len {
                break;
            }

            let next = end.saturating_sub(self.overlap);
            // A soft end close to `start` can leave the cursor in place.
            start = if next > start { next } else { end };
        }

        spans
    }

    /// Pick the window end in `(start, hard_end]`.
    fn soft_end(&self, chars: &[char], start: usize, hard_end: usize) -> usize {
        let floor = hard_end.saturating_sub(self.lookback).max(start + 1);

        let sentence = (floor..hard_end).rev().find(|&p| {
            matches!(chars[p], '.' | '!' | '?')
                && chars.get(p + 1).is_some_and(|c| c.is_whitespace())
        });
        if let Some(p) = sentence {
            return p + 1;
        }

        match (floor..hard_end).rev().find(|&p| chars[p].is_whitespace()) {
            Some(p) => p + 1,
            None => hard_end,
        }
    }
}

fn trimmed_span(chars: &[char], start: usize, end: usize) -> Option<Span> {
    let window = &chars[start..end];
    let first = window.iter().position(|c| !c.is_whitespace())?;
    let last = window.iter().rposition(|c| !c.is_whitespace())?;
    Some(Span {
        start: start + first,
        end: start + last + 1,
        text: window[first..=last].iter().collect(),
    })
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

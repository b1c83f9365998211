//! Paragraph-level chunker and chunk merger.
//!
//! Chunking runs over the entries of a [`DocumentMap`] rather than raw text,
//! so page numbers and section context survive into every chunk.
//!
//! # Algorithm
//!
//! 1. Convert the token target to a byte budget using a 4 chars/token ratio.
//! 2. Accumulate entries into a buffer, joined by `\n\n`.
//! 3. Flush the buffer whenever the next entry would exceed the budget, and
//!    before every title or section heading so chunks never straddle
//!    sections.
//! 4. An entry larger than the budget on its own is hard-split at the
//!    nearest newline or space boundary.
//!
//! Merging then groups adjacent chunks greedily up to the larger merged
//! target. A chunk that alone exceeds the merged target becomes its own
//! merged chunk. A map with no entries yields no chunks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::docmap::{DocumentMap, MapEntry};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Rough token estimate for `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// One paragraph-level chunk of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub title: String,
    pub section: String,
    pub pages: Vec<u32>,
    pub content: String,
    pub token_count: usize,
    pub content_hash: String,
}

/// A chunk after it was written to object storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub name: String,
    pub uri: String,
    pub chunk: Chunk,
}

/// A group of adjacent chunks; the unit sent to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedChunk {
    pub merged_content: String,
    pub token_count: usize,
    pub pages: Vec<u32>,
    pub merged_file_names: Vec<String>,
    pub merged_file_uris: Vec<String>,
    pub file_class: String,
}

#[derive(Default)]
struct Buffer {
    text: String,
    pages: Vec<u32>,
    title: String,
    section: String,
}

impl Buffer {
    fn push(&mut self, entry: &MapEntry, text: &str) {
        if self.text.is_empty() {
            self.title = entry.title.clone();
            self.section = entry.section.clone();
        } else {
            self.text.push_str("\n\n");
        }
        self.text.push_str(text);
        if !self.pages.contains(&entry.page_number) {
            self.pages.push(entry.page_number);
        }
    }

    fn flush_into(&mut self, chunks: &mut Vec<Chunk>) {
        if self.text.trim().is_empty() {
            *self = Buffer::default();
            return;
        }
        let buffer = std::mem::take(self);
        chunks.push(make_chunk(
            chunks.len(),
            buffer.title,
            buffer.section,
            buffer.pages,
            buffer.text,
        ));
    }
}

/// Split a document map into chunks of at most `chunk_target_size` tokens.
pub fn build_chunks(map: &DocumentMap, chunk_target_size: usize) -> Vec<Chunk> {
    let max_chars = chunk_target_size.max(1) * CHARS_PER_TOKEN;
    let mut chunks = Vec::new();
    let mut buffer = Buffer::default();

    for entry in &map.structure {
        let text = entry.text.trim();
        if text.is_empty() {
            continue;
        }

        if entry.kind.opens_section() {
            buffer.flush_into(&mut chunks);
        }

        if text.len() > max_chars {
            buffer.flush_into(&mut chunks);
            for piece in hard_split(text, max_chars) {
                buffer.push(entry, piece);
                buffer.flush_into(&mut chunks);
            }
            continue;
        }

        let would_be = if buffer.text.is_empty() {
            text.len()
        } else {
            buffer.text.len() + 2 + text.len()
        };
        if would_be > max_chars {
            buffer.flush_into(&mut chunks);
        }
        buffer.push(entry, text);
    }

    buffer.flush_into(&mut chunks);
    chunks
}

/// Group adjacent chunks up to `merged_chunk_target_size` tokens each.
pub fn merge_chunks(
    chunks: &[StoredChunk],
    merged_chunk_target_size: usize,
    file_class: &str,
) -> Vec<MergedChunk> {
    let mut merged = Vec::new();
    let mut current: Option<MergedChunk> = None;

    for stored in chunks {
        let tokens = stored.chunk.token_count;
        if let Some(group) = current.as_ref() {
            if group.token_count + tokens > merged_chunk_target_size {
                merged.extend(current.take());
            }
        }
        let group = current.get_or_insert_with(|| MergedChunk {
            merged_content: String::new(),
            token_count: 0,
            pages: Vec::new(),
            merged_file_names: Vec::new(),
            merged_file_uris: Vec::new(),
            file_class: file_class.to_string(),
        });
        if !group.merged_content.is_empty() {
            group.merged_content.push_str("\n\n");
        }
        group.merged_content.push_str(&stored.chunk.content);
        group.token_count += tokens;
        for page in &stored.chunk.pages {
            if !group.pages.contains(page) {
                group.pages.push(*page);
            }
        }
        group.merged_file_names.push(stored.name.clone());
        group.merged_file_uris.push(stored.uri.clone());
    }

    merged.extend(current);
    merged
}

/// Split an oversized entry at newline or space boundaries.
fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            pieces.push(remaining);
            break;
        }
        let limit = snap_to_char_boundary(remaining, max_chars);
        let mut cut = remaining[..limit]
            .rfind(|c: char| c == '\n' || c == ' ')
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        if cut == 0 {
            cut = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let (head, tail) = remaining.split_at(cut);
        pieces.push(head);
        remaining = tail;
    }

    pieces
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(
    index: usize,
    title: String,
    section: String,
    pages: Vec<u32>,
    content: String,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    Chunk {
        index,
        title,
        section,
        pages,
        token_count: estimate_tokens(&content),
        content_hash: format!("{:x}", hasher.finalize()),
        content,
    }
}

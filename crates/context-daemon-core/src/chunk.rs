//! Source-code chunker.
//!
//! Splits a file into [`CodeChunk`]s that follow top-level definition
//! boundaries (functions, types, impl blocks, classes) and respect a
//! `max_bytes` limit. When no boundaries can be found, or a single unit is
//! too large, the text falls back to fixed-size overlapping windows.
//!
//! # Algorithm
//!
//! 1. Walk lines, tracking bracket depth. A non-blank line that starts in
//!    column 0 at depth 0 opens a new unit, unless it only closes a block.
//! 2. Attribute, decorator, and comment lines directly above a unit start
//!    are pulled into that unit.
//! 3. Accumulate whole units into a chunk until the next unit would exceed
//!    `max_bytes`, then flush.
//! 4. Units larger than `max_bytes` are split into windows of `max_bytes`
//!    overlapping by `overlap_bytes`, snapped to line ends where possible.
//!
//! Chunking is deterministic: the same text always yields the same ranges.

use std::ops::Range;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub max_bytes: usize,
    pub overlap_bytes: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_bytes: 1500,
            overlap_bytes: 200,
        }
    }
}

/// A contiguous slice of a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChunk {
    pub index: usize,
    pub byte_range: Range<usize>,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// Split `content` into chunks. Whitespace-only input yields no chunks.
pub fn chunk_code(content: &str, params: ChunkParams) -> Vec<CodeChunk> {
    let max = params.max_bytes.max(1);
    let overlap = params.overlap_bytes.min(max / 2);

    if content.trim().is_empty() {
        return Vec::new();
    }

    let units = unit_ranges(content);
    let mut ranges: Vec<Range<usize>> = Vec::new();
    let mut current: Option<Range<usize>> = None;

    for unit in units {
        let unit_len = unit.end - unit.start;
        if unit_len > max {
            if let Some(buf) = current.take() {
                ranges.push(buf);
            }
            ranges.extend(windows(content, unit, max, overlap));
            continue;
        }
        current = match current.take() {
            Some(buf) if unit.end - buf.start <= max => Some(buf.start..unit.end),
            Some(buf) => {
                ranges.push(buf);
                Some(unit)
            }
            None => Some(unit),
        };
    }
    if let Some(buf) = current {
        ranges.push(buf);
    }

    ranges
        .into_iter()
        .filter(|r| !content[r.clone()].trim().is_empty())
        .enumerate()
        .map(|(index, range)| make_chunk(content, index, range))
        .collect()
}

/// Byte ranges of top-level units, covering `content` end to end.
fn unit_ranges(content: &str) -> Vec<Range<usize>> {
    let mut starts = vec![0usize];
    let mut depth: i64 = 0;
    // Start offset of a run of attribute/comment lines at depth 0.
    let mut lead_in: Option<usize> = None;
    let mut offset = 0usize;

    for line in content.split_inclusive('\n') {
        let trimmed_end = line.trim_end();
        let at_top = depth <= 0;

        if at_top && !trimmed_end.is_empty() && !line.starts_with(char::is_whitespace) {
            if is_lead_in(trimmed_end) {
                lead_in.get_or_insert(offset);
            } else if !is_block_close(trimmed_end) {
                let start = lead_in.take().unwrap_or(offset);
                if start > 0 && starts.last() != Some(&start) {
                    starts.push(start);
                }
            } else {
                lead_in = None;
            }
        } else if trimmed_end.is_empty() {
            lead_in = None;
        }

        depth += bracket_delta(trimmed_end);
        if depth < 0 {
            depth = 0;
        }
        offset += line.len();
    }

    let mut ranges = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(content.len());
        if end > start {
            ranges.push(start..end);
        }
    }
    ranges
}

fn is_lead_in(line: &str) -> bool {
    line.starts_with("#[")
        || line.starts_with("#!")
        || line.starts_with('@')
        || line.starts_with("//")
        || line.starts_with("/*")
        || line.starts_with('*')
        || (line.starts_with('#') && !line.starts_with("#include") && !line.starts_with("#define"))
}

fn is_block_close(line: &str) -> bool {
    matches!(line.chars().next(), Some('}') | Some(')') | Some(']'))
}

/// Net bracket depth change of a line, ignoring string literals and `//` comments.
fn bracket_delta(line: &str) -> i64 {
    let mut delta = 0i64;
    let mut in_str: Option<char> = None;
    let mut escaped = false;
    let mut prev = '\0';
    for ch in line.chars() {
        if let Some(quote) = in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_str = None;
            }
            prev = ch;
            continue;
        }
        match ch {
            '"' | '`' => in_str = Some(ch),
            '/' if prev == '/' => break,
            '{' | '(' | '[' => delta += 1,
            '}' | ')' | ']' => delta -= 1,
            _ => {}
        }
        prev = ch;
    }
    delta
}

/// Overlapping windows over `range`, each at most `max` bytes.
fn windows(content: &str, range: Range<usize>, max: usize, overlap: usize) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let hard_end = snap_to_char_boundary(content, (start + max).min(range.end));
        let end = if hard_end < range.end {
            // Prefer ending on a line break in the back half of the window.
            content[start..hard_end]
                .rfind('\n')
                .map(|pos| start + pos + 1)
                .filter(|&e| e > start + max / 2)
                .unwrap_or(hard_end)
        } else {
            hard_end
        };
        let end = if end <= start {
            next_char_boundary(content, start)
        } else {
            end
        };
        out.push(start..end);
        if end >= range.end {
            break;
        }
        let next = snap_to_char_boundary(content, end.saturating_sub(overlap));
        start = if next > start { next } else { end };
    }
    out
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

fn next_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index + 1;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i.min(s.len())
}

/// SHA-256 of `bytes`, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn make_chunk(content: &str, index: usize, range: Range<usize>) -> CodeChunk {
    let text = content[range.clone()].to_string();
    CodeChunk {
        index,
        hash: content_hash(text.as_bytes()),
        byte_range: range,
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUST: &str = "use std::io;\n\n/// Adds.\nfn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n\n#[derive(Debug)]\nstruct Point {\n    x: i32,\n}\n\nimpl Point {\n    fn new() -> Self {\n        Point { x: 0 }\n    }\n}\n";

    fn params(max: usize) -> ChunkParams {
        ChunkParams {
            max_bytes: max,
            overlap_bytes: 8,
        }
    }

    #[test]
    fn small_file_is_one_chunk() {
        let chunks = chunk_code(RUST, params(4096));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].byte_range, 0..RUST.len());
    }

    #[test]
    fn splits_on_definition_boundaries() {
        let chunks = chunk_code(RUST, params(60));
        assert!(chunks.len() >= 3, "{chunks:#?}");
        let fn_chunk = chunks.iter().find(|c| c.text.contains("fn add")).unwrap();
        assert!(fn_chunk.text.contains("/// Adds."), "doc comment stays with its fn");
        assert!(fn_chunk.text.contains("a + b\n}"), "function kept whole");
        let struct_chunk = chunks.iter().find(|c| c.text.contains("struct Point")).unwrap();
        assert!(struct_chunk.text.contains("#[derive(Debug)]"));
        let impl_chunk = chunks.iter().find(|c| c.text.contains("impl Point")).unwrap();
        assert!(impl_chunk.text.contains("Point { x: 0 }"));
    }

    #[test]
    fn ranges_match_text() {
        for c in chunk_code(RUST, params(50)) {
            assert_eq!(&RUST[c.byte_range.clone()], c.text);
            assert_eq!(c.hash, content_hash(c.text.as_bytes()));
        }
    }

    #[test]
    fn python_indentation_units() {
        let src = "import os\n\ndef a():\n    return 1\n\nclass B:\n    def m(self):\n        return 2\n";
        let chunks = chunk_code(src, params(50));
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.contains("def a():\n    return 1"));
        assert!(chunks
            .iter()
            .any(|c| c.text.starts_with("class B:") && c.text.contains("return 2")));
    }

    #[test]
    fn oversized_unit_falls_back_to_overlapping_windows() {
        let body: String = (0..100).map(|i| format!("    let v{i} = {i};\n")).collect();
        let src = format!("fn big() {{\n{body}}}\n");
        let chunks = chunk_code(&src, ChunkParams { max_bytes: 200, overlap_bytes: 40 });
        assert!(chunks.len() > 5);
        for pair in chunks.windows(2) {
            assert!(pair[1].byte_range.start < pair[0].byte_range.end, "windows overlap");
            assert!(pair[1].byte_range.start > pair[0].byte_range.start, "windows advance");
        }
        assert_eq!(chunks.last().unwrap().byte_range.end, src.len());
        for c in &chunks {
            assert!(c.text.len() <= 200);
        }
    }

    #[test]
    fn contiguous_indices() {
        let src: String = (0..40).map(|i| format!("fn f{i}() {{}}\n")).collect();
        let chunks = chunk_code(&src, params(64));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn multibyte_text_never_splits_a_char() {
        let src = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘".repeat(10);
        let chunks = chunk_code(&src, ChunkParams { max_bytes: 17, overlap_bytes: 5 });
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(src.is_char_boundary(c.byte_range.start));
            assert!(src.is_char_boundary(c.byte_range.end));
        }
    }

    #[test]
    fn blank_input_has_no_chunks() {
        assert!(chunk_code("", params(100)).is_empty());
        assert!(chunk_code("\n\n   \n", params(100)).is_empty());
    }

    #[test]
    fn deterministic() {
        let a = chunk_code(RUST, params(40));
        let b = chunk_code(RUST, params(40));
        assert_eq!(a, b);
    }
}

//! Splits file contents into non-overlapping, size-bounded line-span chunks.
//!
//! Generalizes the teacher's `embedder.rs::chunk_text` (a fixed-char-budget,
//! small-overlap chunker tuned for one embedding model) into the contract
//! this crate needs everywhere chunks are produced: chunker output feeds
//! both the embedding pipeline (C2/C3) and the FTS index (C6), so it must
//! not bake in an embedding-specific overlap policy.

use crate::error::{CidxError, CidxResult};

/// Soft byte-size cap per chunk. Configurable per call; this is the
/// documented default (SPEC_FULL.md §4.1).
pub const DEFAULT_SOFT_CAP_BYTES: usize = 1_500;

/// Number of trailing lines to carry over into the next chunk. Zero by
/// default: overlap is not required for correctness and code chunks read
/// better without duplicated lines.
pub const DEFAULT_OVERLAP_LINES: usize = 0;

/// Bytes sniffed from the start of a file to decide if it's binary.
const BINARY_SNIFF_BYTES: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub text: String,
    pub language: &'static str,
}

/// Returns `true` if the byte slice looks binary: a NUL byte appears within
/// the first `BINARY_SNIFF_BYTES` bytes.
pub fn looks_binary(bytes: &[u8]) -> bool {
    let probe = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    probe.contains(&0u8)
}

/// Split `bytes` into chunks. `language` is typically resolved once per file
/// via `lang::detect_language` and threaded through unchanged.
///
/// Binary files (per `looks_binary`) produce no chunks. Invalid UTF-8 is
/// treated as a read failure (`FileUnreadable`-equivalent), since the FTS
/// and embedding stages both require text.
pub fn chunk_file(
    path: &str,
    bytes: &[u8],
    language: &'static str,
    soft_cap_bytes: usize,
    overlap_lines: usize,
) -> CidxResult<Vec<Chunk>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if looks_binary(bytes) {
        tracing::debug!(path, "skipping binary file");
        return Ok(Vec::new());
    }

    let content = std::str::from_utf8(bytes).map_err(|e| {
        CidxError::BadInput(format!("{path}: not valid UTF-8 ({e})"))
    })?;

    Ok(chunk_text(content, soft_cap_bytes, overlap_lines, language))
}

/// Pure text-chunking core, separated from file I/O so tests don't need a
/// filesystem fixture.
pub fn chunk_text(
    content: &str,
    soft_cap_bytes: usize,
    overlap_lines: usize,
    language: &'static str,
) -> Vec<Chunk> {
    // Trailing newline-only content produces no trailing empty line.
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current_bytes = 0usize;
    let mut chunk_start_idx = 0usize; // 0-based index into `lines`
    let mut buf: Vec<&str> = Vec::new();

    let mut i = 0usize;
    while i < lines.len() {
        let line = lines[i];
        let line_bytes = line.len() + 1; // + newline

        if line_bytes > soft_cap_bytes && buf.is_empty() {
            // A single logical line exceeding the cap becomes its own chunk.
            chunks.push(make_chunk(chunk_start_idx, i, &[line], language));
            chunk_start_idx = i + 1;
            current_bytes = 0;
            i += 1;
            continue;
        }

        if current_bytes + line_bytes > soft_cap_bytes && !buf.is_empty() {
            let emitted_end_idx = chunk_start_idx + buf.len() - 1;
            chunks.push(make_chunk(chunk_start_idx, emitted_end_idx, &buf, language));

            // Non-overlapping by default: next chunk starts right after this
            // one. `overlap_lines` carries the trailing N lines forward.
            let carry = overlap_lines.min(buf.len());
            let next_start_idx = emitted_end_idx + 1 - carry;
            buf = lines[next_start_idx..=emitted_end_idx].to_vec();
            current_bytes = buf.iter().map(|l| l.len() + 1).sum();
            chunk_start_idx = next_start_idx;
            continue; // re-process current line against the new buffer
        }

        buf.push(line);
        current_bytes += line_bytes;
        i += 1;
    }

    if !buf.is_empty() {
        let end_idx = chunk_start_idx + buf.len() - 1;
        chunks.push(make_chunk(chunk_start_idx, end_idx, &buf, language));
    }

    chunks
}

fn make_chunk(start_idx: usize, end_idx: usize, lines: &[&str], language: &'static str) -> Chunk {
    Chunk {
        start_line: start_idx + 1,
        end_line: end_idx + 1,
        text: lines.join("\n"),
        language,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_produces_no_chunks() {
        assert!(chunk_text("", 1500, 0, "plaintext").is_empty());
    }

    #[test]
    fn trailing_newline_only_is_dropped() {
        let chunks = chunk_text("line one\n", 1500, 0, "plaintext");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 1);
    }

    #[test]
    fn small_file_is_one_chunk() {
        let chunks = chunk_text("a\nb\nc\n", 1500, 0, "python");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "a\nb\nc");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
    }

    #[test]
    fn chunks_are_non_overlapping_and_contiguous() {
        let content = (1..=50).map(|n| format!("line{n}")).collect::<Vec<_>>().join("\n");
        let chunks = chunk_text(&content, 40, 0, "plaintext");
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end_line + 1, pair[1].start_line);
        }
        assert_eq!(chunks.first().unwrap().start_line, 1);
        assert_eq!(chunks.last().unwrap().end_line, 50);
    }

    #[test]
    fn oversized_single_line_is_its_own_chunk() {
        let long_line = "x".repeat(3000);
        let content = format!("short\n{long_line}\nshort2");
        let chunks = chunk_text(&content, 1500, 0, "plaintext");
        let oversized = chunks.iter().find(|c| c.text.len() >= 3000).unwrap();
        assert_eq!(oversized.start_line, oversized.end_line);
    }

    #[test]
    fn overlap_lines_are_carried_into_next_chunk() {
        let content = (1..=20).map(|n| format!("line{n}")).collect::<Vec<_>>().join("\n");
        let chunks = chunk_text(&content, 40, 2, "plaintext");
        assert!(chunks.len() > 1);
        // With overlap, consecutive chunks may share line numbers.
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line <= pair[0].end_line + 1);
        }
    }

    #[test]
    fn binary_detection_via_nul_byte() {
        let mut bytes = b"hello".to_vec();
        bytes.push(0);
        bytes.extend_from_slice(b"world");
        assert!(looks_binary(&bytes));
        assert!(!looks_binary(b"plain text content"));
    }

    #[test]
    fn chunk_file_skips_binary() {
        let bytes = [b'a', 0, b'b'];
        let chunks = chunk_file("bin.dat", &bytes, "plaintext", 1500, 0).unwrap();
        assert!(chunks.is_empty());
    }
}

use sha2::{Digest, Sha256};

use crate::config::IndexerConfig;

/// A chunk produced from one file, not yet embedded.
///
/// `start_line`/`end_line` are 1-based inclusive and always refer to the
/// chunk's own slice of the source: ranges of adjacent chunks are contiguous
/// and never overlap. Configured overlap lines and the synthetic file header
/// are carried in `content` only.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub id: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    /// Hash of `content`.
    pub hash: String,
}

pub struct Chunker {
    chunk_tokens: usize,
    overlap_lines: usize,
    file_header: bool,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            chunk_tokens: 512,
            overlap_lines: 1,
            file_header: true,
        }
    }
}

impl Chunker {
    pub fn new(config: &IndexerConfig) -> Self {
        Self {
            chunk_tokens: config.chunk_size,
            overlap_lines: config.overlap_lines,
            file_header: true,
        }
    }

    pub fn with_file_header(mut self, enabled: bool) -> Self {
        self.file_header = enabled;
        self
    }

    /// Split `content` into size-bounded chunks. Deterministic: the same
    /// input bytes always produce identical chunks and ids.
    pub fn chunk(&self, file_path: &str, content: &str) -> Vec<RawChunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        let lines: Vec<&str> = content.lines().collect();
        let budget = self.chunk_tokens;

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut chars = 0;

        for (i, line) in lines.iter().enumerate() {
            chars += line.len() + 1;

            if estimate_tokens_for(chars) >= budget {
                chunks.push(self.build(file_path, &lines, start, i));
                start = i + 1;
                chars = 0;
            }
        }

        // Trailing remainder, unless it is blank filler.
        if start < lines.len() {
            let blank = lines[start..].iter().all(|l| l.trim().is_empty());
            if !blank || chunks.is_empty() {
                chunks.push(self.build(file_path, &lines, start, lines.len() - 1));
            }
        }

        chunks
    }

    fn build(&self, file_path: &str, lines: &[&str], start: usize, end: usize) -> RawChunk {
        let mut body = String::new();

        if self.file_header {
            body.push_str("File: ");
            body.push_str(file_path);
            body.push_str("\n\n");
        }

        if start > 0 && self.overlap_lines > 0 {
            let from = start.saturating_sub(self.overlap_lines);
            for line in &lines[from..start] {
                body.push_str(line);
                body.push('\n');
            }
        }

        body.push_str(&lines[start..=end].join("\n"));

        let hash = {
            let mut hasher = Sha256::new();
            hasher.update(body.as_bytes());
            hex::encode(hasher.finalize())
        };
        let id = chunk_id(file_path, start + 1, end + 1, &hash);

        RawChunk {
            id,
            content: body,
            start_line: start + 1,
            end_line: end + 1,
            hash,
        }
    }
}

/// Deterministic chunk identity: same path, range, and content always map to
/// the same id; any of them changing produces a new one.
pub fn chunk_id(file_path: &str, start_line: usize, end_line: usize, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{file_path}:{start_line}:{end_line}:{content_hash}").as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

// Same heuristic as embedder::estimate_tokens, applied to a running count.
fn estimate_tokens_for(chars: usize) -> usize {
    chars.div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, overlap_lines: usize) -> IndexerConfig {
        IndexerConfig {
            chunk_size,
            overlap_lines,
            ..IndexerConfig::default()
        }
    }

    fn numbered_lines(n: usize) -> String {
        (1..=n)
            .map(|i| format!("line number {i:04}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn empty_and_whitespace_files_yield_no_chunks() {
        let chunker = Chunker::default();
        assert!(chunker.chunk("a.txt", "").is_empty());
        assert!(chunker.chunk("a.txt", "   \n\n\t\n").is_empty());
    }

    #[test]
    fn small_file_is_one_chunk_covering_all_lines() {
        let chunker = Chunker::new(&config(512, 0));
        let chunks = chunker.chunk("src/a.rs", "fn a() {}\nfn b() {}\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 2);
    }

    #[test]
    fn ranges_are_contiguous_and_non_overlapping() {
        let content = numbered_lines(600);
        let chunker = Chunker::new(&config(512, 2));
        let chunks = chunker.chunk("big.txt", &content);

        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].start_line, 1);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_line, pair[0].end_line + 1);
        }
        assert_eq!(chunks.last().unwrap().end_line, 600);
    }

    #[test]
    fn overlap_lines_are_content_only_context() {
        let content = numbered_lines(600);
        let with = Chunker::new(&config(512, 2)).chunk("big.txt", &content);
        let without = Chunker::new(&config(512, 0)).chunk("big.txt", &content);

        assert_eq!(with.len(), without.len());
        // Same core ranges either way.
        for (a, b) in with.iter().zip(&without) {
            assert_eq!((a.start_line, a.end_line), (b.start_line, b.end_line));
        }
        // The second chunk's content carries the tail of the first.
        let boundary = with[0].end_line;
        assert!(with[1].content.contains(&format!("line number {boundary:04}")));
        assert!(!without[1].content.contains(&format!("line number {boundary:04}")));
    }

    #[test]
    fn file_header_prefixes_content_but_not_ranges() {
        let chunker = Chunker::default();
        let chunks = chunker.chunk("src/lib.rs", "pub fn x() {}\n");
        assert!(chunks[0].content.starts_with("File: src/lib.rs\n\n"));
        assert_eq!(chunks[0].start_line, 1);

        let bare = Chunker::default()
            .with_file_header(false)
            .chunk("src/lib.rs", "pub fn x() {}\n");
        assert_eq!(bare[0].content, "pub fn x() {}");
    }

    #[test]
    fn chunking_is_bit_stable() {
        let content = numbered_lines(300);
        let chunker = Chunker::default();
        assert_eq!(chunker.chunk("a.rs", &content), chunker.chunk("a.rs", &content));
    }

    #[test]
    fn identical_content_at_different_paths_gets_distinct_ids() {
        let content = numbered_lines(50);
        let chunker = Chunker::default().with_file_header(false);
        let a = chunker.chunk("a.rs", &content);
        let b = chunker.chunk("b.rs", &content);

        assert_eq!(a[0].content, b[0].content);
        assert_ne!(a[0].id, b[0].id);
    }

    #[test]
    fn id_changes_when_content_changes() {
        let a = chunk_id("a.rs", 1, 10, "aaaa");
        let b = chunk_id("a.rs", 1, 10, "bbbb");
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }
}

//! Overlapping chunker for documents and source code.
//!
//! Text is first cut into *units* on semantic boundaries: paragraphs and
//! Markdown headings for documents, top-level definitions for code (see
//! [`crate::chunk_code`]). Units that are too large on their own are split
//! further on line breaks, then sentence ends, then whitespace, and finally
//! on raw character boundaries.
//!
//! Units are then packed greedily into windows of at most `C` bytes
//! (`max_tokens × CHARS_PER_TOKEN`). Every window after the first starts up
//! to `O` bytes before the end of the previous one, preferring a word start
//! (documents) or a line start (code), so context carries across boundaries.
//!
//! Chunks are exact byte spans of the input. Dropping each chunk's leading
//! `overlap` bytes and concatenating gives back the original text, see
//! [`reconstruct`].

use std::ops::Range;

use crate::chunk_code;
use crate::config::ChunkingConfig;
use crate::models::{Chunk, SourceKind, Span};

/// A segment of the text that is never split across windows unless it is oversized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Unit {
    pub start: usize,
    pub end: usize,
    pub symbol: Option<String>,
}

impl Unit {
    pub(crate) fn new(range: Range<usize>, symbol: Option<String>) -> Self {
        Self {
            start: range.start,
            end: range.end,
            symbol,
        }
    }

    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Where an overlapping window prefers to begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Word,
    Line,
}

/// Separators tried in order when a unit exceeds the piece limit.
const SEPARATORS: [&str; 3] = ["\n", ". ", " "];

/// Split a normalized source into ordered, overlapping chunks.
///
/// Returns no chunks for empty or whitespace-only text. Output depends only
/// on the arguments, so repeated calls give identical boundaries and ordinals.
pub fn chunk_source(
    source_path: &str,
    text: &str,
    kind: SourceKind,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let language = language_tag(source_path);
    let max_chars = config.max_chars().max(1);
    let overlap = config.overlap_chars().min(max_chars - 1);

    let (units, boundary) = match kind {
        SourceKind::Document => (document_units(text), Boundary::Word),
        SourceKind::Code => {
            let units = language
                .and_then(|lang| chunk_code::definition_units(text, lang))
                .unwrap_or_else(|| line_units(text));
            (units, Boundary::Line)
        }
    };

    let piece_limit = (max_chars - overlap).max(1);
    let units: Vec<Unit> = units
        .into_iter()
        .flat_map(|u| {
            let symbol = u.symbol.clone();
            split_oversized(text, u.start..u.end, piece_limit, 0)
                .into_iter()
                .map(move |r| Unit::new(r, symbol.clone()))
        })
        .collect();

    let lines = LineIndex::new(text);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut carried = 0usize;
    let mut i = 0usize;

    while i < units.len() {
        let mut end = units[i].end;
        let mut j = i + 1;
        while j < units.len() && units[j].end - start <= max_chars {
            end = units[j].end;
            j += 1;
        }

        let symbol = units[i..j].iter().find_map(|u| u.symbol.clone());
        chunks.push(Chunk {
            source_path: source_path.to_string(),
            ordinal: chunks.len() as u32,
            kind,
            language: language.map(str::to_string),
            symbol,
            span: Span {
                start,
                end,
                start_line: lines.line_of(start),
                end_line: lines.line_of(end.saturating_sub(1).max(start)),
            },
            overlap: carried,
            text: text[start..end].to_string(),
        });

        if j == units.len() {
            break;
        }
        let next = overlap_start(text, start, end, overlap, boundary);
        carried = end - next;
        start = next;
        i = j;
    }

    chunks
}

/// Rebuild the normalized source text from its chunks.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut sorted: Vec<&Chunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.ordinal);
    sorted.iter().map(|c| c.fresh_text()).collect()
}

/// Map a file extension to a language or format tag.
pub fn language_tag(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    let tag = match ext.as_str() {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "mjs" | "cjs" | "jsx" => "javascript",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "tsx",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "html" | "htm" => "html",
        "css" => "css",
        "md" | "markdown" => "markdown",
        "rst" => "rst",
        "txt" => "text",
        "pdf" => "pdf",
        "docx" => "docx",
        "pptx" => "pptx",
        "xlsx" => "xlsx",
        _ => return None,
    };
    Some(tag)
}

/// Paragraph units. A unit ends after its trailing blank lines; a Markdown
/// heading always opens a new unit.
fn document_units(text: &str) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut unit_start = 0;
    let mut pos = 0;
    let mut prev_blank = false;

    for line in text.split_inclusive('\n') {
        let blank = line.trim().is_empty();
        if pos > unit_start && !blank && (prev_blank || is_heading(line)) {
            units.push(Unit::new(unit_start..pos, None));
            unit_start = pos;
        }
        prev_blank = blank;
        pos += line.len();
    }
    if pos > unit_start {
        units.push(Unit::new(unit_start..pos, None));
    }
    units
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return false;
    }
    let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
    (1..=6).contains(&hashes)
        && trimmed[hashes..]
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace())
}

/// One unit per line. Fallback for code without a usable syntax tree.
pub(crate) fn line_units(text: &str) -> Vec<Unit> {
    let mut pos = 0;
    text.split_inclusive('\n')
        .map(|line| {
            let unit = Unit::new(pos..pos + line.len(), None);
            pos += line.len();
            unit
        })
        .collect()
}

fn split_oversized(text: &str, range: Range<usize>, limit: usize, level: usize) -> Vec<Range<usize>> {
    if range.len() <= limit {
        return vec![range];
    }
    let Some(sep) = SEPARATORS.get(level) else {
        return hard_split(text, range, limit);
    };

    let slice = &text[range.clone()];
    let mut pieces = Vec::new();
    let mut piece_start = range.start;
    for (idx, _) in slice.match_indices(sep) {
        let cut = range.start + idx + sep.len();
        if cut < range.end {
            pieces.push(piece_start..cut);
            piece_start = cut;
        }
    }
    pieces.push(piece_start..range.end);

    if pieces.len() == 1 {
        return split_oversized(text, range, limit, level + 1);
    }

    let mut merged = Vec::new();
    let mut acc: Option<Range<usize>> = None;
    for piece in pieces {
        acc = match acc {
            Some(a) if piece.end - a.start <= limit => Some(a.start..piece.end),
            Some(a) => {
                merged.push(a);
                Some(piece)
            }
            None => Some(piece),
        };
    }
    merged.extend(acc);

    merged
        .into_iter()
        .flat_map(|r| split_oversized(text, r, limit, level + 1))
        .collect()
}

fn hard_split(text: &str, range: Range<usize>, limit: usize) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let mut cut = (start + limit).min(range.end);
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == start {
            cut = next_char_boundary(text, start + 1);
        }
        out.push(start..cut);
        start = cut;
    }
    out
}

/// First position in the last `overlap` bytes of `[prev_start, end)` where the
/// next window may begin.
fn overlap_start(text: &str, prev_start: usize, end: usize, overlap: usize, boundary: Boundary) -> usize {
    if overlap == 0 {
        return end;
    }
    let lo = next_char_boundary(text, end.saturating_sub(overlap).max(prev_start + 1));
    if lo >= end {
        return end;
    }

    let bytes = text.as_bytes();
    let line_start = |p: usize| bytes[p - 1] == b'\n';
    let word_start = |p: usize| bytes[p - 1].is_ascii_whitespace() && !bytes[p].is_ascii_whitespace();

    let candidates = lo..end;
    let found = match boundary {
        Boundary::Line => candidates
            .clone()
            .find(|&p| line_start(p))
            .or_else(|| candidates.clone().find(|&p| word_start(p))),
        Boundary::Word => candidates.clone().find(|&p| word_start(p)),
    };
    found.unwrap_or(lo)
}

fn next_char_boundary(text: &str, mut pos: usize) -> usize {
    while pos < text.len() && !text.is_char_boundary(pos) {
        pos += 1;
    }
    pos.min(text.len())
}

/// Byte offset to 1-based line number.
struct LineIndex {
    newlines: Vec<usize>,
}

impl LineIndex {
    fn new(text: &str) -> Self {
        Self {
            newlines: text
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i)
                .collect(),
        }
    }

    fn line_of(&self, offset: usize) -> u32 {
        (self.newlines.partition_point(|&nl| nl < offset) + 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_tokens: usize, overlap_tokens: usize) -> ChunkingConfig {
        ChunkingConfig::new(max_tokens, overlap_tokens)
    }

    fn doc(text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
        chunk_source("notes.md", text, SourceKind::Document, config)
    }

    #[test]
    fn empty_and_whitespace_yield_nothing() {
        assert!(doc("", &cfg(10, 2)).is_empty());
        assert!(doc("  \n\n\t \n", &cfg(10, 2)).is_empty());
    }

    #[test]
    fn small_text_is_single_chunk_without_overlap() {
        let chunks = doc("Hello, world!", &cfg(700, 80));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].overlap, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].span.start_line, 1);
        assert_eq!(chunks[0].span.end_line, 1);
        assert_eq!(chunks[0].language.as_deref(), Some("markdown"));
    }

    #[test]
    fn text_exactly_at_budget_is_single_chunk() {
        let text = "a".repeat(40);
        let chunks = doc(&text, &cfg(10, 2));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn paragraphs_are_split_and_overlap_is_bounded() {
        // max 20 bytes, overlap 4 bytes
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let config = cfg(5, 1);
        let chunks = doc(text, &config);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i as u32);
            assert!(c.text.len() <= config.max_chars(), "chunk {} too long", i);
            assert!(c.overlap <= config.overlap_chars());
        }
        assert_eq!(chunks[0].overlap, 0);
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn adjacent_chunks_share_the_overlap_bytes() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} talks about topic {}.", i, i * 7))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = doc(&text, &cfg(30, 6));
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            let shared = &next.text[..next.overlap];
            assert!(prev.text.ends_with(shared));
            assert_eq!(next.span.start + next.overlap, prev.span.end);
        }
    }

    #[test]
    fn overlap_prefers_word_starts() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu nu xi";
        let chunks = doc(text, &cfg(5, 2));
        for c in chunks.iter().skip(1) {
            let first = c.text.chars().next().unwrap();
            assert!(!first.is_whitespace(), "chunk starts mid-gap: {:?}", c.text);
        }
    }

    #[test]
    fn reconstruction_is_exact_for_awkward_text() {
        let text = "# Title\n\nÜnïcödé wörds everywhere, ✓ ✓ ✓.\nA line without end\n\n\n\n## Next\nxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\n";
        for (max, ov) in [(2, 0), (3, 1), (5, 2), (8, 3), (100, 10)] {
            let chunks = doc(text, &cfg(max, ov));
            assert_eq!(reconstruct(&chunks), text, "max={} overlap={}", max, ov);
        }
    }

    #[test]
    fn headings_start_new_units() {
        let text = "# One\nintro text for one\n# Two\nintro text for two\n";
        let units = document_units(text);
        assert_eq!(units.len(), 2);
        assert!(text[units[1].start..].starts_with("# Two"));
    }

    #[test]
    fn hashtag_is_not_a_heading() {
        assert!(is_heading("# Title\n"));
        assert!(is_heading("### Deep\n"));
        assert!(!is_heading("#hashtag\n"));
        assert!(!is_heading("        # indented code\n"));
    }

    #[test]
    fn line_numbers_follow_spans() {
        let text = "first para\n\nsecond para\nstill second\n\nthird para here\n";
        let chunks = doc(text, &cfg(4, 0));
        assert_eq!(chunks[0].span.start_line, 1);
        let last = chunks.last().unwrap();
        assert_eq!(last.span.end_line, 6);
    }

    #[test]
    fn deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta epsilon zeta eta theta";
        let c1 = doc(text, &cfg(3, 1));
        let c2 = doc(text, &cfg(3, 1));
        assert_eq!(c1, c2);
    }

    #[test]
    fn unknown_code_falls_back_to_line_windows() {
        let text = (0..30)
            .map(|i| format!("line {} of a shell script\n", i))
            .collect::<String>();
        let chunks = chunk_source("repo/run.weird", &text, SourceKind::Code, &cfg(20, 10));
        assert!(chunks.len() > 1);
        for c in chunks.iter().skip(1) {
            // code overlap starts on a line boundary when one is in range
            assert!(c.text.starts_with("line "), "{:?}", c.text);
        }
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn language_tags() {
        assert_eq!(language_tag("svc/src/lib.rs"), Some("rust"));
        assert_eq!(language_tag("a/b.TSX"), Some("tsx"));
        assert_eq!(language_tag("README"), None);
        assert_eq!(language_tag("notes.txt"), Some("text"));
    }
}

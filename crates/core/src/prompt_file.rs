//! Prompt file grammar.
//!
//! A prompt file is line-oriented text. Every meaningful line has the shape
//!
//! ```text
//! <prompt text> (<kind1>):<count1>, <kind2>):<count2>, ...
//! ```
//!
//! e.g. `a misty mountain at dawn (landscape):3, portrait):1`. The line is
//! split on the last `" ("`, then the ratio part is scanned left-to-right for
//! `<name>):<digits>` fragments. Malformed lines produce a [`ParseWarning`]
//! and are skipped; they never abort the file.

use std::path::Path;

use serde::Serialize;

use crate::error::CoreError;

/// Separator between the prompt text and its ratio list.
const SPLIT_DELIMITER: &str = " (";

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// One requested workflow variant and how many images to generate with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RatioSpec {
    /// Workflow key, e.g. `"landscape"`.
    pub kind: String,
    /// Number of images, always at least 1.
    pub count: u32,
}

/// A single valid prompt line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptEntry {
    /// Prompt text, trimmed and non-empty.
    pub text: String,
    /// Requested variants in the order they appear on the line. Never empty.
    pub ratios: Vec<RatioSpec>,
    /// 1-based line number in the source file.
    pub line_num: usize,
}

impl PromptEntry {
    /// Number of images this entry requests across all its ratios.
    pub fn image_count(&self) -> u64 {
        self.ratios.iter().map(|r| u64::from(r.count)).sum()
    }
}

/// A line that looked like a prompt but could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseWarning {
    /// The line contains `(` but no `" ("` to split on.
    #[error("line {line_num}: no ' (' separator before the ratio list: {line}")]
    MissingSplit { line_num: usize, line: String },

    /// The ratio part contained no `<name>):<count>` fragment.
    #[error("line {line_num}: no valid ratio fragment: {line}")]
    NoRatios { line_num: usize, line: String },
}

impl ParseWarning {
    pub fn line_num(&self) -> usize {
        match self {
            Self::MissingSplit { line_num, .. } | Self::NoRatios { line_num, .. } => *line_num,
        }
    }
}

/// Result of parsing a whole prompt file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPromptFile {
    pub entries: Vec<PromptEntry>,
    pub warnings: Vec<ParseWarning>,
}

impl ParsedPromptFile {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of images requested by every entry.
    pub fn total_images(&self) -> u64 {
        self.entries.iter().map(PromptEntry::image_count).sum()
    }
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Read and parse a prompt file from disk.
///
/// Invalid UTF-8 is replaced rather than rejected. The only errors are a
/// missing file ([`CoreError::NotFound`]) and other read failures.
pub fn parse_prompt_file(path: &Path) -> Result<ParsedPromptFile, CoreError> {
    let bytes = std::fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            CoreError::NotFound {
                entity: "Prompt file",
                name: path.display().to_string(),
            }
        } else {
            CoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    Ok(parse_prompt_text(&String::from_utf8_lossy(&bytes)))
}

/// Parse prompt file contents.
pub fn parse_prompt_text(content: &str) -> ParsedPromptFile {
    let mut parsed = ParsedPromptFile::default();

    for (idx, raw) in content.lines().enumerate() {
        match parse_line(raw, idx + 1) {
            LineResult::Entry(entry) => parsed.entries.push(entry),
            LineResult::Warning(warning) => parsed.warnings.push(warning),
            LineResult::Ignored => {}
        }
    }

    parsed
}

/// Extract every `<name>):<digits>` pair from a ratio list.
///
/// Scanning rules:
/// - A name is a run of non-`)` characters and must be followed by `):`
///   and at least one ASCII digit.
/// - When a fragment does not match, scanning resumes after the `)` that
///   ended the attempted name, so junk between fragments is skipped.
/// - Names are trimmed of whitespace and list commas. Fragments with an
///   empty name, a zero count, or a count that does not fit in `u32` are
///   dropped.
pub fn extract_ratios(ratio_part: &str) -> Vec<RatioSpec> {
    let bytes = ratio_part.as_bytes();
    let mut ratios = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] == b')' {
            pos += 1;
            continue;
        }

        // The name runs up to the next ')'. No ')' means no more fragments.
        let Some(close) = ratio_part[pos..].find(')').map(|off| pos + off) else {
            break;
        };

        let digits_start = close + 2;
        if bytes.get(close + 1) != Some(&b':')
            || !bytes.get(digits_start).is_some_and(u8::is_ascii_digit)
        {
            pos = close + 1;
            continue;
        }

        let digits_end = bytes[digits_start..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .map_or(bytes.len(), |off| digits_start + off);

        let name = ratio_part[pos..close].trim_matches(|c: char| c.is_whitespace() || c == ',');
        let count = ratio_part[digits_start..digits_end].parse::<u32>().ok();

        if let Some(count) = count.filter(|c| *c > 0) {
            if !name.is_empty() {
                ratios.push(RatioSpec {
                    kind: name.to_string(),
                    count,
                });
            }
        }

        pos = digits_end;
    }

    ratios
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

enum LineResult {
    Entry(PromptEntry),
    Warning(ParseWarning),
    Ignored,
}

fn parse_line(raw: &str, line_num: usize) -> LineResult {
    let line = raw.trim();
    if line.is_empty() || !line.contains('(') {
        return LineResult::Ignored;
    }

    let Some((text, ratio_part)) = line.rsplit_once(SPLIT_DELIMITER) else {
        return LineResult::Warning(ParseWarning::MissingSplit {
            line_num,
            line: line.to_string(),
        });
    };

    let ratios = extract_ratios(ratio_part);
    if ratios.is_empty() {
        return LineResult::Warning(ParseWarning::NoRatios {
            line_num,
            line: line.to_string(),
        });
    }

    // `line` is trimmed and the delimiter starts with a space, so the text
    // before it always holds at least one non-whitespace character.
    LineResult::Entry(PromptEntry {
        text: text.trim().to_string(),
        ratios,
        line_num,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

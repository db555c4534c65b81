//! Source file loading with memory mapping and newline normalization.
//!
//! Input files are read as UTF-8 (memory-mapped above a size threshold),
//! stripped of a leading BOM, and normalized to `\n` line endings before
//! any line arithmetic happens. All chunk line numbers refer to the
//! normalized text.

// Memory mapping requires unsafe but is well-documented and safe for read-only access
#![allow(unsafe_code)]

use crate::core::LineRange;
use crate::error::{IoError, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Threshold for using memory mapping (1MB).
const MMAP_THRESHOLD: u64 = 1024 * 1024;

/// Maximum file size to read into memory (1GB).
const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// A source file normalized for line-oriented chunking.
///
/// Lines are 1-based everywhere; line `n` is the `n`-th newline-separated
/// segment of the normalized text. An empty file has zero lines.
#[derive(Debug, Clone)]
pub struct SourceText {
    /// Normalized text (`\n` endings, no BOM).
    text: String,
    /// Byte range of each line within `text`, excluding the newline.
    line_spans: Vec<(usize, usize)>,
}

impl SourceText {
    /// Loads and normalizes a source file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable, oversized, or
    /// not valid UTF-8.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_string(read_file(path)?))
    }

    /// Normalizes raw text into a line-indexed source.
    #[must_use]
    pub fn from_string(raw: String) -> Self {
        let stripped = raw.strip_prefix('\u{feff}').unwrap_or(&raw);
        let text = if stripped.contains('\r') {
            stripped.replace("\r\n", "\n").replace('\r', "\n")
        } else {
            stripped.to_string()
        };

        let mut line_spans = Vec::new();
        let mut start = 0;
        for (pos, _) in text.match_indices('\n') {
            line_spans.push((start, pos));
            start = pos + 1;
        }
        if start < text.len() {
            line_spans.push((start, text.len()));
        }

        Self { text, line_spans }
    }

    /// Number of lines in the file.
    #[must_use]
    pub const fn line_count(&self) -> usize {
        self.line_spans.len()
    }

    /// Whether the file has no lines at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.line_spans.is_empty()
    }

    /// Returns line `n` (1-based) without its newline, or `None` when out
    /// of bounds.
    #[must_use]
    pub fn line(&self, n: usize) -> Option<&str> {
        let (start, end) = *self.line_spans.get(n.checked_sub(1)?)?;
        Some(&self.text[start..end])
    }

    /// Iterates over all lines in order.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.line_spans
            .iter()
            .map(move |&(start, end)| &self.text[start..end])
    }

    /// Extracts the text covered by `range`, newline-joined.
    ///
    /// Returns `None` when the range falls outside the file.
    #[must_use]
    pub fn slice(&self, range: LineRange) -> Option<String> {
        if !range.is_valid() || range.end > self.line_count() {
            return None;
        }
        let (first_start, _) = self.line_spans[range.start - 1];
        let (_, last_end) = self.line_spans[range.end - 1];
        Some(self.text[first_start..last_end].to_string())
    }

    /// Finds the first line within `range` whose text contains `needle`.
    ///
    /// Used by boundary refinement to locate a semantic marker returned by
    /// the model. The search is an exact substring match.
    #[must_use]
    pub fn find_line_containing(&self, range: LineRange, needle: &str) -> Option<usize> {
        if needle.is_empty() {
            return None;
        }
        (range.start..=range.end.min(self.line_count()))
            .find(|&n| self.line(n).is_some_and(|l| l.contains(needle)))
    }

    /// The whole normalized text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Reads a file to string, memory-mapping large files.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid UTF-8.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path_ref = path.as_ref();
    let path_str = path_ref.to_string_lossy().to_string();

    if !path_ref.exists() {
        return Err(IoError::FileNotFound { path: path_str }.into());
    }

    let file = File::open(path_ref).map_err(|e| IoError::ReadFailed {
        path: path_str.clone(),
        reason: e.to_string(),
    })?;

    let size = file
        .metadata()
        .map_err(|e| IoError::ReadFailed {
            path: path_str.clone(),
            reason: e.to_string(),
        })?
        .len();

    if size > MAX_FILE_SIZE {
        return Err(IoError::ReadFailed {
            path: path_str,
            reason: format!("file too large: {size} bytes (max: {MAX_FILE_SIZE} bytes)"),
        }
        .into());
    }

    let bytes = if size >= MMAP_THRESHOLD {
        // Safety: the mapping is read-only and dropped before return
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| IoError::MmapFailed {
                path: path_str.clone(),
                reason: e.to_string(),
            })?
        };
        mmap.to_vec()
    } else {
        let mut buffer = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        let mut file = &file;
        file.read_to_end(&mut buffer).map_err(|e| IoError::ReadFailed {
            path: path_str.clone(),
            reason: e.to_string(),
        })?;
        buffer
    };

    String::from_utf8(bytes).map_err(|e| {
        IoError::ReadFailed {
            path: path_str,
            reason: format!("invalid UTF-8: {e}"),
        }
        .into()
    })
}

/// Writes content to a file, creating parent directories if needed.
///
/// # Errors
///
/// Returns an error if directory creation or file writing fails.
pub fn write_file<P: AsRef<Path>>(path: P, content: &str) -> Result<()> {
    let path_ref = path.as_ref();
    ensure_parent(path_ref)?;
    std::fs::write(path_ref, content).map_err(|e| {
        IoError::WriteFailed {
            path: path_ref.to_string_lossy().to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Writes content durably via a temp file and atomic rename.
///
/// The temp file lives in the target's directory so the rename never
/// crosses filesystems. Readers observe either the old or the new content,
/// never a partial write.
///
/// # Errors
///
/// Returns an error if writing or renaming fails.
pub fn atomic_write_file<P: AsRef<Path>>(path: P, content: &str) -> Result<()> {
    let path_ref = path.as_ref();
    ensure_parent(path_ref)?;

    let file_name = path_ref
        .file_name()
        .map_or_else(|| ".tmp".to_string(), |n| n.to_string_lossy().to_string());
    let tmp_path = path_ref.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()));

    std::fs::write(&tmp_path, content).map_err(|e| IoError::WriteFailed {
        path: tmp_path.to_string_lossy().to_string(),
        reason: e.to_string(),
    })?;

    std::fs::rename(&tmp_path, path_ref).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        IoError::WriteFailed {
            path: path_ref.to_string_lossy().to_string(),
            reason: format!("rename failed: {e}"),
        }
        .into()
    })
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(|e| IoError::DirectoryFailed {
            path: parent.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_small_file() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("small.txt");
        std::fs::write(&file_path, "Hello, world!").unwrap();

        let content = read_file(&file_path).unwrap();
        assert_eq!(content, "Hello, world!");
    }

    #[test]
    fn test_read_nonexistent_file() {
        let result = read_file("/nonexistent/path/file.txt");
        assert!(result.is_err());
    }

    #[test]
    fn test_read_invalid_utf8() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("invalid.bin");
        std::fs::write(&file_path, [0xff, 0xfe, 0x00, 0x01]).unwrap();

        assert!(read_file(&file_path).is_err());
    }

    #[test]
    fn test_read_large_file_mmap_path() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("large.txt");
        let large_content = "line of text\n".repeat(100_000);
        assert!(large_content.len() as u64 >= MMAP_THRESHOLD);
        std::fs::write(&file_path, &large_content).unwrap();

        let content = read_file(&file_path).unwrap();
        assert_eq!(content.len(), large_content.len());
    }

    #[test]
    fn test_source_text_lines() {
        let source = SourceText::from_string("alpha\nbeta\ngamma".to_string());
        assert_eq!(source.line_count(), 3);
        assert_eq!(source.line(1), Some("alpha"));
        assert_eq!(source.line(3), Some("gamma"));
        assert_eq!(source.line(4), None);
        assert_eq!(source.line(0), None);
    }

    #[test]
    fn test_source_text_trailing_newline() {
        let source = SourceText::from_string("a\nb\n".to_string());
        assert_eq!(source.line_count(), 2);
        assert_eq!(source.line(2), Some("b"));
    }

    #[test]
    fn test_source_text_empty() {
        let source = SourceText::from_string(String::new());
        assert!(source.is_empty());
        assert_eq!(source.line_count(), 0);
        assert!(source.slice(LineRange::new(1, 1)).is_none());
    }

    #[test]
    fn test_source_text_crlf_normalized() {
        let source = SourceText::from_string("one\r\ntwo\rthree".to_string());
        assert_eq!(source.line_count(), 3);
        assert_eq!(source.line(1), Some("one"));
        assert_eq!(source.line(2), Some("two"));
        assert_eq!(source.line(3), Some("three"));
    }

    #[test]
    fn test_source_text_bom_stripped() {
        let source = SourceText::from_string("\u{feff}first\nsecond".to_string());
        assert_eq!(source.line(1), Some("first"));
    }

    #[test]
    fn test_source_text_slice() {
        let source = SourceText::from_string("a\nb\nc\nd".to_string());
        assert_eq!(source.slice(LineRange::new(2, 3)), Some("b\nc".to_string()));
        assert_eq!(source.slice(LineRange::new(1, 4)), Some("a\nb\nc\nd".to_string()));
        assert!(source.slice(LineRange::new(3, 5)).is_none());
    }

    #[test]
    fn test_source_text_find_line_containing() {
        let source =
            SourceText::from_string("preamble\n## Entry 4 March\nbody\n## Entry 5 March".to_string());
        assert_eq!(
            source.find_line_containing(LineRange::new(1, 4), "## Entry 4"),
            Some(2)
        );
        assert_eq!(
            source.find_line_containing(LineRange::new(3, 4), "## Entry"),
            Some(4)
        );
        assert_eq!(source.find_line_containing(LineRange::new(1, 4), "absent"), None);
        assert_eq!(source.find_line_containing(LineRange::new(1, 4), ""), None);
    }

    #[test]
    fn test_write_file_creates_parents() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("a/b/out.txt");
        write_file(&file_path, "content").unwrap();
        assert_eq!(std::fs::read_to_string(&file_path).unwrap(), "content");
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("state.json");
        atomic_write_file(&file_path, "{\"v\":1}").unwrap();
        atomic_write_file(&file_path, "{\"v\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&file_path).unwrap(), "{\"v\":2}");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_source_text_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("doc.txt");
        std::fs::write(&file_path, "x\r\ny\r\n").unwrap();

        let source = SourceText::load(&file_path).unwrap();
        assert_eq!(source.line_count(), 2);
        assert_eq!(source.text(), "x\ny\n");
    }
}

//! Text chunking module
//!
//! Splits normalized text into fixed-size, overlapping character windows.

use crate::errors::IngestionError;
use petpal_common::config::IngestionConfig;
use tracing::{debug, warn};

/// Configuration for text chunking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Window size in characters
    pub chunk_size: usize,
    /// Characters shared by consecutive windows
    pub chunk_overlap: usize,
    /// Windows shorter than this (after trimming) are dropped
    pub min_chunk_len: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 150,
            min_chunk_len: 150,
        }
    }
}

impl From<&IngestionConfig> for ChunkingConfig {
    fn from(config: &IngestionConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            min_chunk_len: config.min_chunk_len,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestionError> {
        if self.chunk_size == 0 {
            return Err(IngestionError::ConfigError(
                "chunk_size must be greater than zero".to_string(),
            ));
        }

        if self.chunk_overlap >= self.chunk_size {
            warn!(
                chunk_size = self.chunk_size,
                chunk_overlap = self.chunk_overlap,
                "Overlap is not smaller than chunk size; windows advance one character at a time"
            );
        }

        Ok(())
    }
}

/// Collapse every whitespace run into a single space and trim the ends
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split text into overlapping chunks.
///
/// Positions are counted in characters, not bytes. The cursor always moves
/// forward by at least one character.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let normalized = normalize(text);
    let chars: Vec<char> = normalized.chars().collect();
    let total_len = chars.len();

    let mut chunks = Vec::new();
    if total_len == 0 || config.chunk_size == 0 {
        return chunks;
    }

    let mut start = 0;
    while start < total_len {
        let end = (start + config.chunk_size).min(total_len);
        let window: String = chars[start..end].iter().collect();
        let chunk = window.trim();

        if chunk.chars().count() >= config.min_chunk_len {
            chunks.push(chunk.to_string());
        }

        if end == total_len {
            break;
        }

        start = end.saturating_sub(config.chunk_overlap).max(start + 1);
    }

    debug!(
        input_len = total_len,
        chunk_count = chunks.len(),
        chunk_size = config.chunk_size,
        "Text chunked"
    );

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, chunk_overlap: usize, min_chunk_len: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            chunk_overlap,
            min_chunk_len,
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Hello \n\n\tWorld  "), "Hello World");
        assert_eq!(normalize(" \n "), "");
    }

    #[test]
    fn test_windows_overlap() {
        let text = "abcdefghij";
        let chunks = chunk_text(text, &config(4, 1, 1));
        assert_eq!(chunks, vec!["abcd", "defg", "ghij"]);
    }

    #[test]
    fn test_short_tail_is_dropped() {
        // windows: [0,800), [650,1000) -> tail has 350 chars
        let text = "a".repeat(1000);
        let chunks = chunk_text(&text, &ChunkingConfig::default());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 800);
        assert_eq!(chunks[1].len(), 350);

        let chunks = chunk_text(&text, &config(800, 150, 400));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_short_text_single_or_none() {
        let text = "word ".repeat(40); // 199 chars after normalization
        assert_eq!(chunk_text(&text, &ChunkingConfig::default()).len(), 1);
        assert!(chunk_text("too short", &ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn test_overlap_not_smaller_than_size_still_progresses() {
        let chunks = chunk_text("abcdef", &config(3, 3, 1));
        assert_eq!(chunks, vec!["abc", "bcd", "cde", "def"]);

        let chunks = chunk_text("abcdef", &config(3, 10, 1));
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let text = "ééééé";
        let chunks = chunk_text(text, &config(2, 0, 1));
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn test_chunks_are_trimmed() {
        let chunks = chunk_text("ab cd ef", &config(3, 0, 1));
        assert_eq!(chunks, vec!["ab", "cd", "ef"]);
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", &ChunkingConfig::default()).is_empty());
        assert!(chunk_text("   \n\t ", &ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn test_validate() {
        assert!(config(0, 0, 0).validate().is_err());
        assert!(config(10, 20, 1).validate().is_ok());
        assert!(ChunkingConfig::default().validate().is_ok());
    }
}

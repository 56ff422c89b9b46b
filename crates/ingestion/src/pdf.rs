//! PDF text extraction module
//!
//! Extracts text content from PDF files using lopdf and judges whether the
//! result is real text or binary noise (scanned or image-only PDFs).

use crate::errors::IngestionError;
use std::path::Path;
use tracing::{debug, warn};

/// Extract text content from a PDF file, page by page
pub fn extract_text_from_pdf(path: &Path) -> Result<String, IngestionError> {
    let doc = lopdf::Document::load(path).map_err(|e| IngestionError::PdfParseError {
        path: path.display().to_string(),
        message: format!("Failed to load PDF: {}", e),
    })?;

    if doc.is_encrypted() {
        return Err(IngestionError::PdfParseError {
            path: path.display().to_string(),
            message: "PDF is password protected".to_string(),
        });
    }

    let pages = doc.get_pages();
    debug!(page_count = pages.len(), "Extracting text from PDF");

    let mut text = String::new();
    for page_num in pages.keys() {
        match doc.extract_text(&[*page_num]) {
            Ok(page_text) => {
                text.push_str(&page_text);
                text.push('\n');
            }
            Err(e) => {
                warn!(page = page_num, error = %e, "Failed to extract text from page, skipping");
            }
        }
    }

    debug!(chars = text.chars().count(), "Text extraction complete");

    Ok(text)
}

fn is_readable(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || c.is_whitespace()
        || matches!(c, '.' | ',' | '!' | '?' | ';' | ':' | '\'' | '"' | '(' | ')' | '-')
}

/// Fraction of characters that are letters, digits, whitespace or common punctuation
pub fn readable_ratio(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let readable = text.chars().filter(|c| is_readable(*c)).count();
    readable as f64 / total as f64
}

/// Whether extracted text is worth chunking
pub fn is_usable(text: &str, min_len: usize, min_ratio: f64) -> bool {
    text.chars().count() > min_len && readable_ratio(text) > min_ratio
}

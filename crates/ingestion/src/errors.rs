//! Ingestion error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("PDF parse error for {path}: {message}")]
    PdfParseError { path: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Documents folder not found: {0} (it has been created, add files and rerun)")]
    DocumentsDirMissing(PathBuf),

    #[error("No {kind} files found in {dir}")]
    NoFiles { dir: PathBuf, kind: &'static str },

    #[error("Preflight check failed: {0}")]
    Preflight(String),

    #[error(transparent)]
    App(#[from] petpal_common::errors::AppError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

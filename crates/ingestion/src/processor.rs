//! Ingestion processor
//!
//! Core logic for turning files into embedded chunks: text extraction,
//! quality check, chunking, embedding and storage.

use crate::chunker::{chunk_text, ChunkingConfig};
use crate::errors::IngestionError;
use crate::pdf::{extract_text_from_pdf, is_usable, readable_ratio};
use async_trait::async_trait;
use petpal_common::config::IngestionConfig;
use petpal_common::db::{PendingChunk, Repository};
use petpal_common::embeddings::Embedder;
use petpal_common::errors::Result as AppResult;
use petpal_common::metrics;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Storage used by the processor
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn count_documents(&self) -> AppResult<u64>;
    async fn has_chunk_index_column(&self) -> AppResult<bool>;
    async fn create_document(&self, title: &str, source_path: &str) -> AppResult<Uuid>;
    async fn insert_chunk(
        &self,
        document_id: Uuid,
        chunk_index: Option<i32>,
        chunk_text: &str,
        embedding: &[f32],
    ) -> AppResult<Uuid>;
    async fn chunks_missing_embedding(&self) -> AppResult<Vec<PendingChunk>>;
    async fn set_chunk_embedding(&self, chunk_id: Uuid, embedding: &[f32]) -> AppResult<bool>;
}

#[async_trait]
impl ChunkStore for Repository {
    async fn count_documents(&self) -> AppResult<u64> {
        Repository::count_documents(self).await
    }

    async fn has_chunk_index_column(&self) -> AppResult<bool> {
        Repository::has_chunk_index_column(self).await
    }

    async fn create_document(&self, title: &str, source_path: &str) -> AppResult<Uuid> {
        Ok(Repository::create_document(self, title, source_path).await?.id)
    }

    async fn insert_chunk(
        &self,
        document_id: Uuid,
        chunk_index: Option<i32>,
        chunk_text: &str,
        embedding: &[f32],
    ) -> AppResult<Uuid> {
        Repository::insert_chunk(self, document_id, chunk_index, chunk_text, Some(embedding)).await
    }

    async fn chunks_missing_embedding(&self) -> AppResult<Vec<PendingChunk>> {
        Repository::chunks_missing_embedding(self, i64::MAX as u64).await
    }

    async fn set_chunk_embedding(&self, chunk_id: Uuid, embedding: &[f32]) -> AppResult<bool> {
        Repository::set_chunk_embedding(self, chunk_id, embedding).await
    }
}

/// Kind of source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Text,
}

impl FileKind {
    pub fn extension(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Text => "txt",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FileKind::Pdf => "PDF",
            FileKind::Text => "text",
        }
    }

    /// Case-insensitive extension match
    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(self.extension()))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Ingested,
    Skipped(String),
}

/// Outcome for one file
#[derive(Debug, Clone)]
pub struct FileReport {
    pub file: String,
    pub document_id: Option<Uuid>,
    pub chunks: usize,
    pub stored: usize,
    pub status: FileStatus,
}

impl FileReport {
    fn skipped(file: &str, reason: impl Into<String>) -> Self {
        Self {
            file: file.to_string(),
            document_id: None,
            chunks: 0,
            stored: 0,
            status: FileStatus::Skipped(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub documents: u64,
    pub has_chunk_index: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub pending: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Ingestion processor
pub struct IngestionProcessor {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    chunking_config: ChunkingConfig,
    min_text_len: usize,
    min_readable_ratio: f64,
    progress_every: usize,
    has_chunk_index: bool,
}

impl IngestionProcessor {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn Embedder>,
        chunking_config: ChunkingConfig,
        config: &IngestionConfig,
    ) -> Result<Self, IngestionError> {
        chunking_config.validate()?;

        Ok(Self {
            store,
            embedder,
            chunking_config,
            min_text_len: config.min_text_len,
            min_readable_ratio: config.min_readable_ratio,
            progress_every: config.progress_every.max(1),
            has_chunk_index: false,
        })
    }

    /// Verify the database and embedding server before any work is done
    pub async fn preflight(&mut self) -> Result<PreflightReport, IngestionError> {
        let documents = self
            .store
            .count_documents()
            .await
            .map_err(|e| IngestionError::Preflight(format!("database connection failed: {}", e)))?;
        info!(documents = documents, "Database connection verified");

        self.has_chunk_index = self
            .store
            .has_chunk_index_column()
            .await
            .map_err(|e| IngestionError::Preflight(format!("schema check failed: {}", e)))?;
        info!(
            "chunk_index column {}",
            if self.has_chunk_index { "exists" } else { "does not exist" }
        );

        self.embedder.ping().await.map_err(|e| {
            IngestionError::Preflight(format!("embedding server not reachable: {}", e))
        })?;
        info!(model = %self.embedder.model_name(), "Embedding server verified");

        Ok(PreflightReport {
            documents,
            has_chunk_index: self.has_chunk_index,
        })
    }

    /// Ingest a single file
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn ingest_file(&self, path: &Path, kind: FileKind) -> Result<FileReport, IngestionError> {
        let file_name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.clone());

        info!(file = %file_name, "Ingesting file");

        let text = match kind {
            FileKind::Pdf => match extract_text_from_pdf(path) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Could not extract text; the PDF may be scanned, protected or corrupted");
                    return Ok(FileReport::skipped(&file_name, e.to_string()));
                }
            },
            FileKind::Text => std::fs::read_to_string(path)?,
        };

        debug!(chars = text.chars().count(), "Text loaded");

        if kind == FileKind::Pdf && !is_usable(&text, self.min_text_len, self.min_readable_ratio) {
            let ratio = readable_ratio(&text);
            warn!(
                chars = text.chars().count(),
                readable_pct = (ratio * 100.0).round(),
                "Low quality text; convert the PDF to a .txt file and ingest it as text"
            );
            return Ok(FileReport::skipped(
                &file_name,
                format!("low quality text ({:.0}% readable)", ratio * 100.0),
            ));
        }

        let chunks = chunk_text(&text, &self.chunking_config);
        if chunks.is_empty() {
            warn!("No chunks produced");
            return Ok(FileReport::skipped(&file_name, "no chunks produced"));
        }

        info!(chunk_count = chunks.len(), "Text chunked");

        let source_path = format!("documents/{}", file_name);
        let document_id = self.store.create_document(&title, &source_path).await?;
        info!(document_id = %document_id, "Document created");

        let total = chunks.len();
        let mut stored = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            match self.store_chunk(document_id, i, chunk).await {
                Ok(_) => stored += 1,
                Err(e) => error!(chunk = i, error = %e, "Chunk failed, skipping"),
            }

            if (i + 1) % self.progress_every == 0 || i + 1 == total {
                info!("Processed {}/{} chunks", i + 1, total);
            }
        }

        metrics::record_ingestion(kind.extension(), stored, total - stored);
        info!(stored = stored, total = total, "Completed {}", file_name);

        Ok(FileReport {
            file: file_name,
            document_id: Some(document_id),
            chunks: total,
            stored,
            status: FileStatus::Ingested,
        })
    }

    async fn store_chunk(&self, document_id: Uuid, index: usize, text: &str) -> AppResult<Uuid> {
        let embedding = self.embedder.embed(text).await?;
        let chunk_index = self.has_chunk_index.then_some(index as i32);
        self.store
            .insert_chunk(document_id, chunk_index, text, &embedding)
            .await
    }

    /// Ingest every file of a kind in a directory, in name order
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub async fn ingest_directory(
        &self,
        dir: &Path,
        kind: FileKind,
    ) -> Result<Vec<FileReport>, IngestionError> {
        let files = list_files(dir, kind)?;
        info!(count = files.len(), "Found {} file(s) to process", kind.label());

        let mut reports = Vec::with_capacity(files.len());
        for path in files {
            match self.ingest_file(&path, kind).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to process file");
                    let name = path
                        .file_name()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default();
                    reports.push(FileReport::skipped(&name, e.to_string()));
                }
            }
        }

        Ok(reports)
    }

    /// Embed every stored chunk that has no embedding yet
    pub async fn backfill(&self) -> Result<BackfillReport, IngestionError> {
        let pending = self.store.chunks_missing_embedding().await?;
        info!(rows = pending.len(), "Rows to embed");

        let mut report = BackfillReport {
            pending: pending.len(),
            ..BackfillReport::default()
        };

        for row in pending {
            let result = async {
                let embedding = self.embedder.embed(&row.chunk_text).await?;
                self.store.set_chunk_embedding(row.id, &embedding).await?;
                Ok::<_, petpal_common::errors::AppError>(embedding.len())
            }
            .await;

            match result {
                Ok(dim) => {
                    report.updated += 1;
                    debug!(chunk_id = %row.id, dim = dim, "Embedded");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(chunk_id = %row.id, error = %e, "Backfill failed for chunk");
                }
            }
        }

        Ok(report)
    }
}

/// Files of the given kind, sorted by name. A missing directory is created
/// and reported as an error.
pub fn list_files(dir: &Path, kind: FileKind) -> Result<Vec<PathBuf>, IngestionError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        return Err(IngestionError::DocumentsDirMissing(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && kind.matches(&path) {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(IngestionError::NoFiles {
            dir: dir.to_path_buf(),
            kind: kind.label(),
        });
    }

    Ok(files)
}

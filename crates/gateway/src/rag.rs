//! Retrieval of stored document chunks for chat context

use petpal_common::db::{ChunkMatch, Repository};
use petpal_common::embeddings::Embedder;
use petpal_common::errors::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Chunk reference returned to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub similarity: f64,
}

impl From<&ChunkMatch> for Source {
    fn from(chunk: &ChunkMatch) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            document_id: chunk.document_id,
            similarity: chunk.similarity,
        }
    }
}

#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    repo: Repository,
    top_k: usize,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, repo: Repository, top_k: usize) -> Self {
        Self {
            embedder,
            repo,
            top_k: top_k.max(1),
        }
    }

    /// Embed the query and fetch the closest chunks
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ChunkMatch>> {
        let embedding = self.embedder.embed(query).await?;
        let chunks = self.repo.match_chunks(&embedding, self.top_k).await?;

        tracing::debug!(
            embed_dim = embedding.len(),
            chunks_found = chunks.len(),
            "Retrieved context"
        );

        Ok(chunks)
    }
}

/// Render retrieved chunks as a context block for the system prompt
pub fn context_block(chunks: &[ChunkMatch]) -> String {
    let sources = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("Source {} (sim {:.3}):\n{}", i + 1, c.similarity, c.chunk_text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Use the CONTEXT when relevant. If it is not relevant, answer normally.\n\nCONTEXT:\n{}",
        sources
    )
}

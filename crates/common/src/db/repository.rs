//! Repository pattern for database operations
//!
//! Documents go through the SeaORM entities; anything touching the
//! `vector` column is raw SQL with pgvector literals.

use crate::db::models::*;
use crate::db::{to_vector_literal, DbPool};
use crate::errors::Result;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    FromQueryResult, PaginatorTrait, Set, Statement,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Chunk returned by similarity search
#[derive(Debug, Clone, Serialize, Deserialize, FromQueryResult)]
pub struct ChunkMatch {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub chunk_text: String,
    pub similarity: f64,
}

/// Chunk stored without an embedding
#[derive(Debug, Clone, FromQueryResult)]
pub struct PendingChunk {
    pub id: Uuid,
    pub chunk_text: String,
}

#[derive(Debug, FromQueryResult)]
struct Exists {
    present: bool,
}

/// DDL for the documents and chunks tables
pub(crate) fn schema_sql(dimension: usize) -> String {
    format!(
        r#"
        CREATE EXTENSION IF NOT EXISTS vector;

        CREATE TABLE IF NOT EXISTS documents (
            id UUID PRIMARY KEY,
            title TEXT NOT NULL,
            source_path TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        CREATE TABLE IF NOT EXISTS chunks (
            id UUID PRIMARY KEY,
            document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            chunk_index INTEGER,
            chunk_text TEXT NOT NULL,
            embedding vector({dimension}),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        ALTER TABLE chunks ADD COLUMN IF NOT EXISTS chunk_index INTEGER;

        CREATE INDEX IF NOT EXISTS chunks_document_id_idx ON chunks (document_id);
        "#
    )
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> &DatabaseConnection {
        self.pool.conn()
    }

    // ========================================================================
    // Health Check & Schema
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    /// Create the vector extension and tables if they are missing
    pub async fn apply_schema(&self, dimension: usize) -> Result<()> {
        self.conn().execute_unprepared(&schema_sql(dimension)).await?;
        tracing::info!(dimension = dimension, "Schema applied");
        Ok(())
    }

    /// Whether `chunks.chunk_index` exists
    pub async fn has_chunk_index_column(&self) -> Result<bool> {
        let stmt = Statement::from_string(
            DbBackend::Postgres,
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.columns
                WHERE table_name = 'chunks' AND column_name = 'chunk_index'
            ) AS present
            "#,
        );

        let row = Exists::find_by_statement(stmt).one(self.conn()).await?;
        Ok(row.map(|r| r.present).unwrap_or(false))
    }

    // ========================================================================
    // Document Operations
    // ========================================================================

    /// Count stored documents
    pub async fn count_documents(&self) -> Result<u64> {
        DocumentEntity::find()
            .count(self.conn())
            .await
            .map_err(Into::into)
    }

    /// Create a new document row
    pub async fn create_document(&self, title: &str, source_path: &str) -> Result<Document> {
        let document = DocumentActiveModel {
            id: Set(Uuid::new_v4()),
            title: Set(title.to_string()),
            source_path: Set(source_path.to_string()),
            created_at: Set(chrono::Utc::now().into()),
        };

        document.insert(self.conn()).await.map_err(Into::into)
    }

    // ========================================================================
    // Chunk Operations
    // ========================================================================

    /// Insert one chunk. `chunk_index` is written only when given, so the
    /// insert also works against tables without that column.
    pub async fn insert_chunk(
        &self,
        document_id: Uuid,
        chunk_index: Option<i32>,
        chunk_text: &str,
        embedding: Option<&[f32]>,
    ) -> Result<Uuid> {
        let chunk_id = Uuid::new_v4();
        let embedding_str = embedding.map(to_vector_literal);

        let stmt = match chunk_index {
            Some(index) => Statement::from_sql_and_values(
                DbBackend::Postgres,
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, chunk_text, embedding, created_at)
                VALUES ($1, $2, $3, $4, $5::vector, NOW())
                "#,
                vec![
                    chunk_id.into(),
                    document_id.into(),
                    index.into(),
                    chunk_text.into(),
                    embedding_str.into(),
                ],
            ),
            None => Statement::from_sql_and_values(
                DbBackend::Postgres,
                r#"
                INSERT INTO chunks (id, document_id, chunk_text, embedding, created_at)
                VALUES ($1, $2, $3, $4::vector, NOW())
                "#,
                vec![
                    chunk_id.into(),
                    document_id.into(),
                    chunk_text.into(),
                    embedding_str.into(),
                ],
            ),
        };

        self.conn().execute(stmt).await?;
        Ok(chunk_id)
    }

    /// Chunks whose embedding is still NULL, oldest first
    pub async fn chunks_missing_embedding(&self, limit: u64) -> Result<Vec<PendingChunk>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT id, chunk_text
            FROM chunks
            WHERE embedding IS NULL
            ORDER BY created_at
            LIMIT $1
            "#,
            vec![(limit as i64).into()],
        );

        PendingChunk::find_by_statement(stmt)
            .all(self.conn())
            .await
            .map_err(Into::into)
    }

    /// Store the embedding of an existing chunk
    pub async fn set_chunk_embedding(&self, chunk_id: Uuid, embedding: &[f32]) -> Result<bool> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "UPDATE chunks SET embedding = $1::vector WHERE id = $2",
            vec![to_vector_literal(embedding).into(), chunk_id.into()],
        );

        let result = self.conn().execute(stmt).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cosine-similarity search, best match first
    pub async fn match_chunks(&self, embedding: &[f32], limit: usize) -> Result<Vec<ChunkMatch>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT
                c.id AS chunk_id,
                c.document_id,
                c.chunk_text,
                (1 - (c.embedding <=> $1::vector))::float8 AS similarity
            FROM chunks c
            WHERE c.embedding IS NOT NULL
            ORDER BY c.embedding <=> $1::vector
            LIMIT $2
            "#,
            vec![to_vector_literal(embedding).into(), (limit as i64).into()],
        );

        ChunkMatch::find_by_statement(stmt)
            .all(self.conn())
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_uses_dimension() {
        let sql = schema_sql(768);
        assert!(sql.contains("embedding vector(768)"));
        assert!(sql.contains("CREATE EXTENSION IF NOT EXISTS vector"));
        assert!(sql.contains("ON DELETE CASCADE"));
    }

    #[test]
    fn test_schema_is_idempotent() {
        let sql = schema_sql(384);
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement is not idempotent: {statement}"
            );
        }
    }
}

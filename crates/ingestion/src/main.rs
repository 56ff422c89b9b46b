//! PetPal RAG ingestion tool
//!
//! Fills the pgvector store the chat backend retrieves from:
//! 1. Reads PDFs or text files from the documents folder
//! 2. Normalizes and chunks the text
//! 3. Embeds each chunk with the local embedding server
//! 4. Stores documents and chunks in Postgres

mod chunker;
mod errors;
mod pdf;
mod processor;

use clap::{Parser, Subcommand};
use petpal_common::{
    config::AppConfig,
    db::{DbPool, Repository},
    embeddings::create_embedder,
    logging, VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chunker::ChunkingConfig;
use crate::processor::{FileKind, FileStatus, IngestionProcessor};

#[derive(Parser, Debug)]
#[command(name = "ingest", version, about = "Load documents into the PetPal vector store")]
struct Cli {
    /// Configuration file to load instead of config/default
    #[arg(long, global = true)]
    config: Option<String>,

    /// Chunk window size in characters
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Characters shared by consecutive chunks
    #[arg(long, global = true)]
    chunk_overlap: Option<usize>,

    /// Drop chunks shorter than this many characters
    #[arg(long, global = true)]
    min_chunk_len: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every PDF in the documents folder
    Pdfs {
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Ingest every .txt file in the documents folder
    Text {
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Embed stored chunks that have no embedding yet
    Backfill,

    /// Create the vector extension and tables
    InitSchema,
}

impl Cli {
    fn chunking_config(&self, config: &AppConfig) -> ChunkingConfig {
        let mut chunking = ChunkingConfig::from(&config.ingestion);
        if let Some(size) = self.chunk_size {
            chunking.chunk_size = size;
        }
        if let Some(overlap) = self.chunk_overlap {
            chunking.chunk_overlap = overlap;
        }
        if let Some(min) = self.min_chunk_len {
            chunking.min_chunk_len = min;
        }
        chunking
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Load configuration
    let config = AppConfig::load_with(cli.config.as_deref())?;

    logging::init(&config.observability);

    info!("Starting PetPal ingestion v{}", VERSION);

    let db = DbPool::new(&config.database).await?;
    let repo = Repository::new(db);

    let (kind, dir) = match &cli.command {
        Command::InitSchema => {
            repo.apply_schema(config.embedding.dimension).await?;
            info!("Schema ready");
            return Ok(());
        }
        Command::Backfill => {
            let processor = prepared_processor(&cli, &config, repo).await?;
            let report = processor.backfill().await?;
            info!(
                pending = report.pending,
                updated = report.updated,
                failed = report.failed,
                "Backfill complete"
            );
            return Ok(());
        }
        Command::Pdfs { dir } => (FileKind::Pdf, dir),
        Command::Text { dir } => (FileKind::Text, dir),
    };

    let processor = prepared_processor(&cli, &config, repo).await?;
    let dir = dir.clone().unwrap_or_else(|| config.ingestion.documents_dir.clone());
    let reports = processor.ingest_directory(&dir, kind).await?;

    let mut ingested = 0;
    for report in &reports {
        match &report.status {
            FileStatus::Ingested => {
                ingested += 1;
                info!(
                    file = %report.file,
                    stored = report.stored,
                    chunks = report.chunks,
                    "Ingested"
                );
            }
            FileStatus::Skipped(reason) => {
                warn!(file = %report.file, reason = %reason, "Skipped");
            }
        }
    }

    info!(files = reports.len(), ingested = ingested, "Ingestion complete");

    Ok(())
}

/// Build the processor and run the preflight checks
async fn prepared_processor(
    cli: &Cli,
    config: &AppConfig,
    repo: Repository,
) -> anyhow::Result<IngestionProcessor> {
    let embedder = create_embedder(&config.embedding)?;
    let mut processor = IngestionProcessor::new(
        Arc::new(repo),
        embedder,
        cli.chunking_config(config),
        &config.ingestion,
    )?;

    processor.preflight().await?;

    Ok(processor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_overrides() {
        let cli = Cli::try_parse_from(["ingest", "pdfs", "--chunk-size", "500", "--min-chunk-len", "50"])
            .unwrap();
        let chunking = cli.chunking_config(&AppConfig::default());

        assert_eq!(chunking.chunk_size, 500);
        assert_eq!(chunking.chunk_overlap, 150);
        assert_eq!(chunking.min_chunk_len, 50);
        assert!(matches!(cli.command, Command::Pdfs { dir: None }));
    }

    #[test]
    fn test_subcommands() {
        let cli = Cli::try_parse_from(["ingest", "text", "--dir", "notes"]).unwrap();
        assert!(matches!(cli.command, Command::Text { dir: Some(ref d) } if d == &PathBuf::from("notes")));

        assert!(matches!(
            Cli::try_parse_from(["ingest", "init-schema"]).unwrap().command,
            Command::InitSchema
        ));
        assert!(Cli::try_parse_from(["ingest"]).is_err());

        let cli = Cli::try_parse_from(["ingest", "backfill", "--config", "config/ingest"]).unwrap();
        assert!(matches!(cli.command, Command::Backfill));
        assert_eq!(cli.config.as_deref(), Some("config/ingest"));
    }
}

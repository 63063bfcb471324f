/// Ingest structured catalog JSON files into the vector store
///
/// Reads every *.json catalog in the given directory, builds passage
/// documents with deterministic ids, writes a preview file for the operator,
/// embeds the passages in batches, and upserts them into PostgreSQL.
///
/// Run with: cargo run --bin ingest -- <catalog_dir> [--preview-only]

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cosmetics_assistant_bot::{config::Config, ingest, rag::RagSystem};

const PREVIEW_FILE: &str = "documents_preview.txt";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    pretty_env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let preview_only = args.iter().any(|a| a == "--preview-only");
    let dir: PathBuf = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("catalog_json"));

    println!("Loading catalogs from {}...", dir.display());
    let catalogs = ingest::load_catalogs(&dir)?;
    if catalogs.is_empty() {
        anyhow::bail!("No catalog JSON files found in {}", dir.display());
    }

    let products = ingest::prepare_products(&catalogs);
    let guides = ingest::prepare_knowledge(&catalogs);
    println!("Prepared {} products and {} guides", products.len(), guides.len());

    if products.is_empty() && guides.is_empty() {
        anyhow::bail!("Catalogs contained no products or knowledge articles");
    }

    ingest::write_preview(&products, &guides, Path::new(PREVIEW_FILE))?;
    println!("Preview written to {}", PREVIEW_FILE);

    if preview_only {
        println!("--preview-only given, stopping before the load.");
        return Ok(());
    }

    let config = Config::from_env()?;
    let rag = Arc::new(
        RagSystem::new(config)
            .await
            .context("Failed to initialize the RAG system")?,
    );
    rag.initialize_schema().await?;

    let mut documents = products;
    documents.extend(guides);

    let loaded = ingest::load_documents(&rag, &documents).await?;
    println!("Done: {} documents loaded into the vector store.", loaded);

    Ok(())
}

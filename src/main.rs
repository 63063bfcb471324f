/// Cosmetics Assistant Bot
///
/// A Telegram bot for a cosmetics shop that answers product questions with
/// retrieval-augmented generation over the shop catalog.
///
/// The bot:
/// - Retrieves the closest catalog documents from PostgreSQL + pgvector
/// - Generates replies through an OpenAI-compatible API behind a proxy
/// - Collects consultation and order requests and forwards them to a
///   managers' group
/// - Logs every interaction to a Google Sheets spreadsheet

use anyhow::Result;
use std::sync::Arc;
use cosmetics_assistant_bot::{bot, config, http_server, rag};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    pretty_env_logger::init();

    log::info!("Starting Cosmetics Assistant Bot...");

    // Load configuration from environment
    let cfg = config::Config::from_env()?;

    // Validate configuration and connections
    cfg.validate().await?;

    // Initialize the RAG system and the vector store schema
    let rag_system = Arc::new(rag::RagSystem::new(cfg.clone()).await?);
    rag_system.initialize_schema().await?;

    // Health/stats endpoint for container deployments
    let state = http_server::AppState {
        rag_system: rag_system.clone(),
    };
    let http_port = cfg.http_port;
    tokio::spawn(async move {
        if let Err(e) = http_server::start_server(state, http_port).await {
            log::error!("HTTP server error: {:#}", e);
        }
    });

    // Run the bot
    bot::run_bot_with_rag(cfg, rag_system).await?;

    Ok(())
}

/// RAG (Retrieval-Augmented Generation) module with PostgreSQL + pgvector
///
/// This module handles:
/// - Vector storage of catalog documents in PostgreSQL with the pgvector extension
/// - Embedding generation through an OpenAI-compatible /embeddings endpoint
/// - Semantic retrieval of the closest catalog documents for a user question
/// - Prompt building with retrieved context and conversation history
/// - Reply generation through an OpenAI-compatible /chat/completions endpoint

use anyhow::{Context, Result};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tiktoken_rs::CoreBPE;

use crate::config::Config;

/// Embedding dimension of text-embedding-3-small (and ada-002)
pub const EMBEDDING_DIM: usize = 1536;

/// A retrieved catalog document with its similarity score
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: HashMap<String, String>,
    /// Cosine distance to the query (smaller is closer)
    pub distance: f32,
}

/// Represents a message in conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String, // "user" or "assistant"
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ConversationMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ConversationMessage,
}

/// Main RAG system structure
pub struct RagSystem {
    config: Config,
    db_pool: PgPool,
    http_client: reqwest::Client,
    tokenizer: CoreBPE,
}

impl RagSystem {
    /// Initialize the RAG system
    pub async fn new(config: Config) -> Result<Self> {
        let db_pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        // Completion calls against a proxy can be slow for long prompts
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        let tokenizer = tiktoken_rs::cl100k_base().context("Failed to load cl100k tokenizer")?;

        Ok(Self {
            config,
            db_pool,
            http_client,
            tokenizer,
        })
    }

    /// Initialize the database schema if it doesn't exist
    pub async fn initialize_schema(&self) -> Result<()> {
        log::info!("Initializing database schema...");

        // Enable pgvector extension
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.db_pool)
            .await
            .context("Failed to create vector extension")?;

        let create_table_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                embedding vector({}),
                metadata JSONB,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            self.config.embeddings_table, EMBEDDING_DIM
        );

        sqlx::query(&create_table_query)
            .execute(&self.db_pool)
            .await
            .context("Failed to create embeddings table")?;

        // Create index for cosine similarity search
        let create_index_query = format!(
            r#"
            CREATE INDEX IF NOT EXISTS {}_embedding_idx
            ON {} USING ivfflat (embedding vector_cosine_ops)
            WITH (lists = 100)
            "#,
            self.config.embeddings_table, self.config.embeddings_table
        );

        sqlx::query(&create_index_query)
            .execute(&self.db_pool)
            .await
            .context("Failed to create vector index")?;

        log::info!("Database schema initialized successfully");
        Ok(())
    }

    /// Generate embeddings for a batch of texts in a single API call
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            input: texts.to_vec(),
            model: self.config.embedding_model.clone(),
        };

        let response = self
            .http_client
            .post(self.config.embeddings_url())
            .header("Authorization", format!("Bearer {}", self.config.openai_api_key))
            .json(&request)
            .send()
            .await
            .context("Failed to send embedding request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            anyhow::bail!("Embeddings API error (status {}): {}", status, error_text);
        }

        let mut response: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        if response.data.len() != texts.len() {
            anyhow::bail!(
                "Embeddings API returned {} vectors for {} inputs",
                response.data.len(),
                texts.len()
            );
        }

        // The API is allowed to reorder entries; the index field is authoritative
        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Generate an embedding for a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().context("No embedding returned")
    }

    /// Insert or update a catalog document with a precomputed embedding
    pub async fn upsert_document(
        &self,
        id: &str,
        content: &str,
        metadata: &HashMap<String, String>,
        embedding: Vec<f32>,
    ) -> Result<()> {
        let metadata_json =
            serde_json::to_value(metadata).context("Failed to serialize metadata")?;

        let insert_query = format!(
            r#"
            INSERT INTO {} (id, content, embedding, metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET content = $2, embedding = $3, metadata = $4
            "#,
            self.config.embeddings_table
        );

        sqlx::query(&insert_query)
            .bind(id)
            .bind(content)
            .bind(Vector::from(embedding))
            .bind(metadata_json)
            .execute(&self.db_pool)
            .await
            .context("Failed to upsert document")?;

        Ok(())
    }

    /// Retrieve the closest catalog documents for a query
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        log::info!("Searching catalog for query: {}", query);

        let query_embedding = self.embed(query).await?;

        let search_query = format!(
            r#"
            SELECT id, content, metadata, embedding <=> $1 AS distance
            FROM {}
            ORDER BY embedding <=> $1
            LIMIT $2
            "#,
            self.config.embeddings_table
        );

        let rows = sqlx::query(&search_query)
            .bind(Vector::from(query_embedding))
            .bind(self.config.top_k_results as i64)
            .fetch_all(&self.db_pool)
            .await
            .context("Failed to search for similar vectors")?;

        let hits: Vec<SearchHit> = rows
            .into_iter()
            .map(|row| {
                let metadata: serde_json::Value = row.get("metadata");
                SearchHit {
                    id: row.get::<String, _>("id"),
                    content: row.get::<String, _>("content"),
                    metadata: metadata_map(&metadata),
                    distance: row.get::<f64, _>("distance") as f32,
                }
            })
            .collect();

        log::info!("Retrieved {} catalog documents", hits.len());
        Ok(hits)
    }

    /// Number of documents currently stored
    pub async fn count_documents(&self) -> Result<i64> {
        let query = format!("SELECT COUNT(*) AS count FROM {}", self.config.embeddings_table);
        let row = sqlx::query(&query)
            .fetch_one(&self.db_pool)
            .await
            .context("Failed to count documents")?;
        Ok(row.get::<i64, _>("count"))
    }

    /// Build the context block from retrieved documents, trimmed to the token budget
    ///
    /// Documents are dropped whole from the tail once the budget is exceeded;
    /// the closest document is always kept.
    pub fn build_context(&self, hits: &[SearchHit]) -> Option<String> {
        build_context(hits, self.config.max_context_tokens, &self.tokenizer)
    }

    /// Generate a reply for the user's message
    ///
    /// # Arguments
    /// * `user_message` - The user's question (or "/start" for the greeting)
    /// * `conversation_history` - Previous messages in this dialog
    /// * `rag_context` - Retrieved catalog context, if any
    pub async fn generate_reply(
        &self,
        user_message: &str,
        conversation_history: &[ConversationMessage],
        rag_context: Option<&str>,
    ) -> Result<String> {
        log::info!("Generating reply using {}", self.config.chat_model);

        let system_message = ConversationMessage {
            role: "system".to_string(),
            content: build_system_prompt(rag_context),
        };

        // Build messages array: system + trailing history window + current message
        let mut messages = vec![system_message];

        let history_start = conversation_history
            .len()
            .saturating_sub(self.config.max_conversation_history);
        messages.extend_from_slice(&conversation_history[history_start..]);

        messages.push(ConversationMessage::user(user_message));

        let request = ChatRequest {
            model: self.config.chat_model.clone(),
            messages,
            temperature: 0.3, // Low temperature for factual consultations
            max_tokens: 700,
        };

        let response = self
            .http_client
            .post(self.config.chat_completions_url())
            .header("Authorization", format!("Bearer {}", self.config.openai_api_key))
            .json(&request)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            anyhow::bail!("Chat API error (status {}): {}", status, error_text);
        }

        let response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        let answer = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("No response from the chat model")?;

        log::info!("Reply generated successfully");
        Ok(answer)
    }

    /// Generate the /start greeting (no history, no retrieval context)
    pub async fn greeting(&self) -> Result<String> {
        self.generate_reply("/start", &[], None).await
    }
}

/// System prompt for the shop consultant persona
fn build_system_prompt(rag_context: Option<&str>) -> String {
    let mut prompt = String::from(
        "You are a friendly consultant for a professional cosmetics shop. \
        You help customers pick skincare products and explain how to use them.\n\
        \n\
        RULES:\n\
        1. Base product recommendations ONLY on the catalog excerpts below. \
        Never invent products, ingredients, article numbers, or prices.\n\
        2. If the catalog excerpts do not cover the question, say so and \
        suggest contacting a manager.\n\
        3. When the customer wants to buy something or talk to a person, point \
        them to the 'Place an order' and 'Contact a manager' keyboard buttons.\n\
        4. When the customer sends /start, introduce yourself briefly and \
        offer help with choosing products.\n\
        5. Keep answers concise and practical.\n",
    );

    match rag_context {
        Some(context) => {
            prompt.push_str("\nCatalog excerpts:\n");
            prompt.push_str(context);
            prompt.push_str("\n---");
        }
        None => {
            prompt.push_str("\nNo catalog excerpts were retrieved for this message.");
        }
    }

    prompt
}

/// Convert a JSONB metadata value into a flat string map
fn metadata_map(value: &serde_json::Value) -> HashMap<String, String> {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect(),
        _ => HashMap::new(),
    }
}

/// Render a metadata map with stable key order
fn format_metadata(metadata: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = metadata.keys().collect();
    keys.sort();
    keys.iter()
        .map(|k| format!("{}: {}", k, metadata[*k]))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Build the numbered context block from retrieved documents
///
/// Returns None when there are no hits. Documents past the token budget are
/// dropped whole; the first (closest) document is always included.
pub fn build_context(hits: &[SearchHit], max_tokens: usize, tokenizer: &CoreBPE) -> Option<String> {
    if hits.is_empty() {
        return None;
    }

    let mut blocks = Vec::new();
    let mut used_tokens = 0usize;

    for (i, hit) in hits.iter().enumerate() {
        let block = format!(
            "Document {}:\n{}\nMetadata: {}",
            i + 1,
            hit.content,
            format_metadata(&hit.metadata)
        );
        let block_tokens = tokenizer.encode_with_special_tokens(&block).len();

        if !blocks.is_empty() && used_tokens + block_tokens > max_tokens {
            log::debug!(
                "Context budget reached: keeping {} of {} documents",
                blocks.len(),
                hits.len()
            );
            break;
        }

        used_tokens += block_tokens;
        blocks.push(block);
    }

    Some(blocks.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, content: &str, metadata: &[(&str, &str)]) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            content: content.to_string(),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            distance: 0.1,
        }
    }

    #[test]
    fn context_is_none_without_hits() {
        let tokenizer = tiktoken_rs::cl100k_base().unwrap();
        assert!(build_context(&[], 1000, &tokenizer).is_none());
    }

    #[test]
    fn context_numbers_documents_and_sorts_metadata() {
        let tokenizer = tiktoken_rs::cl100k_base().unwrap();
        let hits = vec![
            hit("a", "Cleansing milk", &[("type", "product"), ("brand", "Reviderm")]),
            hit("b", "Skin care basics", &[("type", "guide")]),
        ];

        let context = build_context(&hits, 1000, &tokenizer).unwrap();
        assert!(context.starts_with("Document 1:\nCleansing milk\nMetadata: brand: Reviderm; type: product"));
        assert!(context.contains("Document 2:\nSkin care basics\nMetadata: type: guide"));
    }

    #[test]
    fn context_drops_whole_documents_past_budget() {
        let tokenizer = tiktoken_rs::cl100k_base().unwrap();
        let long = "moisturizing ".repeat(200);
        let hits = vec![hit("a", "Short description", &[]), hit("b", &long, &[])];

        // Budget fits the first block but not the second
        let context = build_context(&hits, 50, &tokenizer).unwrap();
        assert!(context.contains("Document 1"));
        assert!(!context.contains("Document 2"));
    }

    #[test]
    fn first_document_survives_a_tiny_budget() {
        let tokenizer = tiktoken_rs::cl100k_base().unwrap();
        let hits = vec![hit("a", &"text ".repeat(100), &[])];
        assert!(build_context(&hits, 1, &tokenizer).is_some());
    }

    #[test]
    fn system_prompt_embeds_context_when_present() {
        let with = build_system_prompt(Some("Document 1:\nCleansing milk"));
        assert!(with.contains("Catalog excerpts:"));
        assert!(with.contains("Cleansing milk"));

        let without = build_system_prompt(None);
        assert!(without.contains("No catalog excerpts"));
    }

    #[test]
    fn metadata_map_flattens_non_string_values() {
        let value = serde_json::json!({"name": "Tonic", "count": 3});
        let map = metadata_map(&value);
        assert_eq!(map["name"], "Tonic");
        assert_eq!(map["count"], "3");
    }
}

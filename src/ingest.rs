/// Knowledge base ingestion module
///
/// Loads structured catalog JSON files, turns products and knowledge articles
/// into passage documents with deterministic ids, writes an operator preview,
/// and loads everything into the vector store in embedding batches.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::catalog::Catalog;
use crate::rag::RagSystem;

/// Number of passages embedded per API call
pub const EMBEDDING_BATCH_SIZE: usize = 32;

/// A passage ready for embedding and storage
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDocument {
    pub id: String,
    pub text: String,
    pub metadata: HashMap<String, String>,
}

/// Normalize free text into an id segment
///
/// Lowercases, strips everything but letters, digits, underscores, whitespace
/// and dashes, collapses whitespace runs into single underscores, and trims
/// underscores. Inputs that reduce to nothing become "unknown".
pub fn normalize_id(text: &str) -> String {
    let lowered = text.to_lowercase();
    let filtered: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();

    let joined = filtered.split_whitespace().collect::<Vec<_>>().join("_");
    let trimmed = joined.trim_matches('_');

    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Append `_1`, `_2`, ... until the id is unique within this run
fn dedup_id(base: String, seen: &mut HashSet<String>) -> String {
    let mut id = base.clone();
    let mut counter = 1;
    while seen.contains(&id) {
        id = format!("{}_{}", base, counter);
        counter += 1;
    }
    seen.insert(id.clone());
    id
}

/// Build passage documents for every product in the given catalogs
pub fn prepare_products(catalogs: &[Catalog]) -> Vec<PreparedDocument> {
    let mut documents = Vec::new();
    let mut seen = HashSet::new();

    for catalog in catalogs {
        for product in &catalog.products {
            let text = format!(
                "passage: Product: {} / {}\nBrand: {}\nLine: {}\n{}",
                product.name_ru,
                product.name_en,
                product.brand,
                product.line,
                product.description_full
            );

            let base_id = format!(
                "product_{}_{}",
                normalize_id(&product.brand),
                normalize_id(&product.name_en)
            );
            let id = dedup_id(base_id, &mut seen);

            let skus = serde_json::to_string(&product.skus).unwrap_or_else(|_| "[]".to_string());

            let mut metadata = HashMap::new();
            metadata.insert("type".to_string(), "product".to_string());
            metadata.insert("name_ru".to_string(), product.name_ru.clone());
            metadata.insert("brand".to_string(), product.brand.clone());
            metadata.insert("line".to_string(), product.line.clone());
            metadata.insert("skin_type".to_string(), product.skin_type.clone());
            metadata.insert("skus".to_string(), skus);

            documents.push(PreparedDocument { id, text, metadata });
        }
    }

    documents
}

/// Build passage documents for every knowledge article in the given catalogs
pub fn prepare_knowledge(catalogs: &[Catalog]) -> Vec<PreparedDocument> {
    let mut documents = Vec::new();
    let mut seen = HashSet::new();

    for catalog in catalogs {
        for article in &catalog.knowledge {
            let text = format!("passage: Topic: {}\n{}", article.title, article.content);

            let base_id = format!("guide_{}", normalize_id(&article.title));
            let id = dedup_id(base_id, &mut seen);

            let mut metadata = HashMap::new();
            metadata.insert("type".to_string(), "guide".to_string());
            metadata.insert("title".to_string(), article.title.clone());

            documents.push(PreparedDocument { id, text, metadata });
        }
    }

    documents
}

/// Load every `*.json` catalog file from a directory
///
/// Files that fail to read or parse are logged and skipped so one broken
/// export does not block the whole load.
pub fn load_catalogs(dir: &Path) -> Result<Vec<Catalog>> {
    let mut catalogs = Vec::new();

    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read catalog directory {}", dir.display()))?;

    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    paths.sort();

    log::info!("Found {} JSON files in {}", paths.len(), dir.display());

    for path in paths {
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Catalog>(&raw) {
                Ok(catalog) => {
                    log::info!(
                        "Loaded {}: {} products, {} knowledge articles",
                        path.display(),
                        catalog.products.len(),
                        catalog.knowledge.len()
                    );
                    catalogs.push(catalog);
                }
                Err(e) => log::error!("Skipping {}: invalid catalog JSON: {}", path.display(), e),
            },
            Err(e) => log::error!("Skipping {}: read error: {}", path.display(), e),
        }
    }

    Ok(catalogs)
}

fn content_preview(text: &str) -> String {
    let preview: String = text.chars().take(200).collect();
    if preview.len() < text.len() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Write the operator preview: first five products and first five guides
pub fn write_preview(
    products: &[PreparedDocument],
    guides: &[PreparedDocument],
    path: &Path,
) -> Result<()> {
    let mut file = fs::File::create(path)
        .with_context(|| format!("Failed to create preview file {}", path.display()))?;

    writeln!(file, "[DOCUMENT PREVIEW]")?;
    writeln!(file, "{}", "=".repeat(80))?;

    for (label, documents) in [("PRODUCTS", products), ("GUIDES", guides)] {
        writeln!(file, "\n{} (first 5):", label)?;
        writeln!(file, "{}", "-".repeat(80))?;

        for doc in documents.iter().take(5) {
            writeln!(file, "ID: {}", doc.id)?;
            let mut keys: Vec<&String> = doc.metadata.keys().collect();
            keys.sort();
            for key in keys {
                writeln!(file, "  {}: {}", key, doc.metadata[key])?;
            }
            writeln!(file, "Content: {}", content_preview(&doc.text))?;
            writeln!(file, "{}", "-".repeat(80))?;
        }
    }

    log::info!("Preview file written to {}", path.display());
    Ok(())
}

/// Embed prepared documents in batches and upsert them into the vector store
pub async fn load_documents(rag: &RagSystem, documents: &[PreparedDocument]) -> Result<usize> {
    let total = documents.len();
    log::info!("Loading {} documents into the vector store", total);

    for (batch_index, batch) in documents.chunks(EMBEDDING_BATCH_SIZE).enumerate() {
        let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
        let embeddings = rag
            .embed_batch(&texts)
            .await
            .with_context(|| format!("Embedding batch {} failed", batch_index + 1))?;

        for (doc, embedding) in batch.iter().zip(embeddings) {
            rag.upsert_document(&doc.id, &doc.text, &doc.metadata, embedding)
                .await?;
        }

        log::info!(
            "Loaded {}/{} documents",
            (batch_index * EMBEDDING_BATCH_SIZE + batch.len()).min(total),
            total
        );
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{KnowledgeArticle, Product, Sku};

    #[test]
    fn normalize_id_strips_and_collapses() {
        assert_eq!(normalize_id("Cleansing Milk!"), "cleansing_milk");
        assert_eq!(normalize_id("  Dr.  Spiller  "), "dr_spiller");
        assert_eq!(normalize_id("Крем дневной"), "крем_дневной");
    }

    #[test]
    fn normalize_id_falls_back_to_unknown() {
        assert_eq!(normalize_id(""), "unknown");
        assert_eq!(normalize_id("!!!"), "unknown");
    }

    fn product(brand: &str, name_en: &str) -> Product {
        Product {
            brand: brand.to_string(),
            name_en: name_en.to_string(),
            name_ru: "Молочко".to_string(),
            line: "Skinessentials".to_string(),
            skin_type: "dry skin".to_string(),
            description_full: "Gentle cleanser.".to_string(),
            skus: vec![Sku {
                art: "80009".to_string(),
                vol: "200 ml".to_string(),
                kind: "home".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn products_get_deterministic_ids_and_passage_text() {
        let catalogs = vec![Catalog {
            products: vec![product("Reviderm", "Cleansing Milk")],
            knowledge: vec![],
        }];

        let docs = prepare_products(&catalogs);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "product_reviderm_cleansing_milk");
        assert_eq!(
            docs[0].text,
            "passage: Product: Молочко / Cleansing Milk\nBrand: Reviderm\nLine: Skinessentials\nGentle cleanser."
        );
        assert_eq!(docs[0].metadata["type"], "product");
        assert!(docs[0].metadata["skus"].contains("\"art\":\"80009\""));
    }

    #[test]
    fn duplicate_product_ids_get_counter_suffixes() {
        let catalogs = vec![Catalog {
            products: vec![
                product("Reviderm", "Cleansing Milk"),
                product("Reviderm", "Cleansing Milk"),
                product("Reviderm", "Cleansing Milk"),
            ],
            knowledge: vec![],
        }];

        let ids: Vec<String> = prepare_products(&catalogs).into_iter().map(|d| d.id).collect();
        assert_eq!(
            ids,
            vec![
                "product_reviderm_cleansing_milk",
                "product_reviderm_cleansing_milk_1",
                "product_reviderm_cleansing_milk_2",
            ]
        );
    }

    #[test]
    fn knowledge_articles_become_guides() {
        let catalogs = vec![Catalog {
            products: vec![],
            knowledge: vec![KnowledgeArticle {
                title: "Caring for oily skin".to_string(),
                content: "Cleanse twice a day.".to_string(),
                ..Default::default()
            }],
        }];

        let docs = prepare_knowledge(&catalogs);
        assert_eq!(docs[0].id, "guide_caring_for_oily_skin");
        assert_eq!(docs[0].text, "passage: Topic: Caring for oily skin\nCleanse twice a day.");
        assert_eq!(docs[0].metadata["type"], "guide");
    }

    #[test]
    fn load_catalogs_skips_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("good.json"),
            r#"{"products": [], "knowledge": [{"title": "T", "content": "C"}]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("broken.json"), "not json").unwrap();
        fs::write(dir.path().join("ignored.txt"), "plain text").unwrap();

        let catalogs = load_catalogs(dir.path()).unwrap();
        assert_eq!(catalogs.len(), 1);
        assert_eq!(catalogs[0].knowledge.len(), 1);
    }

    #[test]
    fn preview_lists_first_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.txt");

        let catalogs = vec![Catalog {
            products: vec![product("Reviderm", "Cleansing Milk")],
            knowledge: vec![],
        }];
        let products = prepare_products(&catalogs);

        write_preview(&products, &[], &path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("[DOCUMENT PREVIEW]"));
        assert!(written.contains("ID: product_reviderm_cleansing_milk"));
        assert!(written.contains("Content: passage: Product:"));
    }

    #[test]
    fn long_content_is_truncated_in_preview() {
        let text = "э".repeat(300);
        let preview = content_preview(&text);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 203);
    }
}

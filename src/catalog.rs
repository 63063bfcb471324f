/// Catalog extraction module
///
/// Turns cleaned catalog text into a structured catalog (products + knowledge
/// articles) using the chat model with a JSON response format. Large files are
/// split on line boundaries and processed chunk by chunk, with product ids
/// numbered sequentially across the whole file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::Config;
use crate::rag::ConversationMessage;

/// Chunk size for splitting large catalog files (characters)
pub const EXTRACTION_CHUNK_CHARS: usize = 20_000;

const MAX_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(10);

lazy_static::lazy_static! {
    /// Cyrillic-to-Latin table used for slugs
    static ref TRANSLIT: HashMap<char, &'static str> = {
        let pairs = [
            ('а', "a"), ('б', "b"), ('в', "v"), ('г', "g"), ('д', "d"),
            ('е', "e"), ('ё', "yo"), ('ж', "zh"), ('з', "z"), ('и', "i"),
            ('й', "y"), ('к', "k"), ('л', "l"), ('м', "m"), ('н', "n"),
            ('о', "o"), ('п', "p"), ('р', "r"), ('с', "s"), ('т', "t"),
            ('у', "u"), ('ф', "f"), ('х', "h"), ('ц', "ts"), ('ч', "ch"),
            ('ш', "sh"), ('щ', "shch"), ('ъ', ""), ('ы', "y"), ('ь', ""),
            ('э', "e"), ('ю', "yu"), ('я', "ya"),
        ];
        let mut map = HashMap::new();
        for (c, s) in pairs {
            map.insert(c, s);
            // Uppercase letters share the lowercase transliteration
            for upper in c.to_uppercase() {
                map.insert(upper, s);
            }
        }
        map
    };
}

/// A structured catalog: products plus standalone knowledge articles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub knowledge: Vec<KnowledgeArticle>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub name_ru: String,
    #[serde(default)]
    pub name_en: String,
    #[serde(default)]
    pub line: String,
    #[serde(default)]
    pub category: String,
    /// Product kind (cream, tonic, serum, ...)
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub skin_type: String,
    #[serde(default)]
    pub usage: String,
    #[serde(default)]
    pub description_full: String,
    #[serde(default)]
    pub skus: Vec<Sku>,
}

/// A purchasable article number with its volume and home/pro marker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sku {
    #[serde(default)]
    pub art: String,
    #[serde(default)]
    pub vol: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeArticle {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl Catalog {
    /// Merge another catalog into this one (chunked extraction)
    pub fn merge(&mut self, other: Catalog) {
        self.products.extend(other.products);
        self.knowledge.extend(other.knowledge);
    }
}

/// Transliterate a string into a lowercase Latin slug
///
/// Alphanumerics are kept, Cyrillic letters are transliterated, everything
/// else becomes a dash; runs of dashes collapse and edges are trimmed.
pub fn transliterate(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if let Some(mapped) = TRANSLIT.get(&c) {
            out.push_str(mapped);
        } else if c.is_alphanumeric() {
            out.push(c);
        } else {
            out.push('-');
        }
    }

    let mut collapsed = String::with_capacity(out.len());
    let mut prev_dash = false;
    for c in out.chars() {
        if c == '-' {
            if !prev_dash {
                collapsed.push('-');
            }
            prev_dash = true;
        } else {
            collapsed.push(c);
            prev_dash = false;
        }
    }

    collapsed.trim_matches('-').to_lowercase()
}

/// Split text into chunks of roughly `max_chars`, never breaking a line
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.split('\n') {
        if current.len() + line.len() + 1 < max_chars {
            current.push_str(line);
            current.push('\n');
        } else {
            if !current.trim().is_empty() {
                chunks.push(current.trim().to_string());
            }
            current = format!("{}\n", line);
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }

    chunks
}

/// Recover an English product name from a legacy slug id
///
/// Legacy ids look like `brand_line_cleansing_milk`; the tail past the brand
/// and line is the English name, provided it is plain ASCII (letters required).
pub fn recover_name_en(old_id: &str) -> Option<String> {
    let parts: Vec<&str> = old_id.split('_').collect();
    if parts.len() < 3 {
        return None;
    }

    let tail = parts[2..].join("_");
    let plain_ascii = tail
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain_ascii && tail.chars().any(|c| c.is_ascii_alphabetic()) {
        Some(tail.replace('_', " "))
    } else {
        None
    }
}

/// Assign sequential six-digit ids, recovering `name_en` from legacy ids first
///
/// The counter is shared across chunks of one file so ids stay unique.
pub fn assign_product_ids(products: &mut [Product], counter: &mut usize) {
    for product in products.iter_mut() {
        if product.name_en.is_empty() {
            if let Some(name_en) = recover_name_en(&product.id) {
                product.name_en = name_en;
            }
        }

        *counter += 1;
        product.id = format!("{:06}", counter);
    }
}

/// Chat request with a forced JSON object response
#[derive(Debug, Serialize)]
struct ExtractionRequest {
    model: String,
    messages: Vec<ConversationMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    choices: Vec<ExtractionChoice>,
}

#[derive(Debug, Deserialize)]
struct ExtractionChoice {
    message: ConversationMessage,
}

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are an expert at structuring cosmetics catalogs. Convert ALL of the given text into a JSON structure.

CRITICAL RULES:

1. PRODUCTS (products):
   - Process EVERY section of the catalog (cleansing, peeling/exfoliation, skin preparation, moisturizing, sun protection, and all others), not just the first one.
   - A product always has a name (name_ru) and almost always an article number.
   - Article numbers often appear AFTER the description. A line like "Art. 12345" with no product name belongs to the PREVIOUS product; add it to that product's skus array.
   - NEVER emit a product object without name_ru.
   - A product with several article numbers (different volumes) gets several entries in skus.
   - skus format: [{"art": "80009", "vol": "200 ml", "type": "home"}, {"art": "80227", "vol": "500 ml", "type": "pro"}]
   - description_full: keep the FULL text of the mechanism-of-action, active-ingredients, and key-benefits sections joined into one coherent text. Do not shorten it. Drop only ALL-CAPS marketing slogans and repeats of the product name.
   - usage: the FULL usage instructions (home use and/or professional use), unshortened.
   - line: the product line name when given.
   - category: copy the section heading EXACTLY as written.
   - type: the product form (cream, tonic, serum, milk, gel, emulsion, concentrate, mask, spray, lotion, powder, balm, fluid, ...), taken from the name when present.
   - skin_type: the skin types / indications text, unshortened.
   - name_en: the English product name when it appears after the local name; otherwise leave empty.

2. KNOWLEDGE (knowledge):
   - Any meaningful block that is NOT about a specific product: skin problems, brand philosophy, technologies and ingredients in general, care protocols, care steps, general recommendations.
   - category: the knowledge category (e.g. "Skin types", "Care protocols", "Technologies").
   - recommendations: an array of recommendations when present.

3. Return ONLY valid JSON with the keys "products" and "knowledge"."#;

/// Run one extraction call over a single chunk of catalog text
///
/// Retries transient failures (including unparseable model output) with a
/// fixed delay before giving up.
pub async fn extract_catalog(
    client: &reqwest::Client,
    config: &Config,
    text: &str,
    brand: &str,
) -> Result<Catalog> {
    let user_prompt = format!(
        "Extract ALL products and knowledge from EVERY section of the following text. Brand: {}\n\n\
        TEXT:\n{}\n\n\
        Return ONLY valid JSON in the format {{\"products\": [...], \"knowledge\": [...]}}",
        brand, text
    );

    let request = ExtractionRequest {
        model: config.chat_model.clone(),
        messages: vec![
            ConversationMessage {
                role: "system".to_string(),
                content: EXTRACTION_SYSTEM_PROMPT.to_string(),
            },
            ConversationMessage::user(user_prompt),
        ],
        temperature: 0.3,
        response_format: ResponseFormat {
            kind: "json_object".to_string(),
        },
    };

    let mut last_error = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            log::warn!("Retrying extraction (attempt {}/{})...", attempt, MAX_ATTEMPTS);
            sleep(RETRY_DELAY).await;
        }

        match extract_once(client, config, &request).await {
            Ok(catalog) => return Ok(catalog),
            Err(e) => {
                log::warn!(
                    "Extraction attempt {}/{} failed: {:#}",
                    attempt,
                    MAX_ATTEMPTS,
                    e
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("extraction failed")))
}

async fn extract_once(
    client: &reqwest::Client,
    config: &Config,
    request: &ExtractionRequest,
) -> Result<Catalog> {
    let response = client
        .post(config.chat_completions_url())
        .header("Authorization", format!("Bearer {}", config.openai_api_key))
        .json(request)
        .send()
        .await
        .context("Failed to send extraction request")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());
        anyhow::bail!("Chat API error (status {}): {}", status, error_text);
    }

    let response: ExtractionResponse = response
        .json()
        .await
        .context("Failed to parse chat completion response")?;

    let content = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .context("No response from the chat model")?;

    serde_json::from_str(&content).context("Model output was not a valid catalog JSON")
}

/// Extract a whole catalog file, chunking it when it is too large
///
/// A chunk whose extraction keeps failing is logged and skipped so one bad
/// chunk does not lose the rest of the file.
pub async fn extract_file(
    client: &reqwest::Client,
    config: &Config,
    text: &str,
    brand: &str,
) -> Result<Catalog> {
    let mut counter = 0usize;
    let mut result = Catalog::default();

    if text.len() <= EXTRACTION_CHUNK_CHARS {
        let mut catalog = extract_catalog(client, config, text, brand).await?;
        assign_product_ids(&mut catalog.products, &mut counter);
        return Ok(catalog);
    }

    let chunks = split_into_chunks(text, EXTRACTION_CHUNK_CHARS);
    log::info!("File split into {} chunks", chunks.len());

    for (i, chunk) in chunks.iter().enumerate() {
        log::info!("Processing chunk {}/{} ({} chars)", i + 1, chunks.len(), chunk.len());
        match extract_catalog(client, config, chunk, brand).await {
            Ok(mut catalog) => {
                assign_product_ids(&mut catalog.products, &mut counter);
                result.merge(catalog);
            }
            Err(e) => {
                log::error!("Chunk {}/{} failed, skipping: {:#}", i + 1, chunks.len(), e);
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transliterates_cyrillic_product_names() {
        assert_eq!(transliterate("Очищающее молочко"), "ochishchayushchee-molochko");
        assert_eq!(transliterate("Dr. Spiller"), "dr-spiller");
    }

    #[test]
    fn transliterate_collapses_and_trims_dashes() {
        assert_eq!(transliterate("  Крем -- дневной  "), "krem-dnevnoy");
        assert_eq!(transliterate("!!!"), "");
    }

    #[test]
    fn chunks_never_break_lines() {
        let text = "first line\nsecond line\nthird line";
        let chunks = split_into_chunks(text, 15);
        assert_eq!(chunks, vec!["first line", "second line", "third line"]);
    }

    #[test]
    fn small_text_is_a_single_chunk() {
        let chunks = split_into_chunks("one\ntwo", 1000);
        assert_eq!(chunks, vec!["one\ntwo"]);
    }

    #[test]
    fn recovers_english_name_from_legacy_id() {
        assert_eq!(
            recover_name_en("reviderm_skinessentials_cleansing_milk"),
            Some("cleansing milk".to_string())
        );
        // Too few segments
        assert_eq!(recover_name_en("reviderm_milk"), None);
        // Non-ASCII tail
        assert_eq!(recover_name_en("reviderm_line_молочко"), None);
        // Digits only
        assert_eq!(recover_name_en("reviderm_line_123"), None);
    }

    #[test]
    fn assigns_sequential_ids_across_calls() {
        let mut counter = 0;

        let mut first = vec![
            Product {
                id: "reviderm_skinessentials_cleansing_milk".to_string(),
                ..Default::default()
            },
            Product {
                id: "misc".to_string(),
                name_en: "thermal tonic".to_string(),
                ..Default::default()
            },
        ];
        assign_product_ids(&mut first, &mut counter);
        assert_eq!(first[0].id, "000001");
        assert_eq!(first[0].name_en, "cleansing milk");
        assert_eq!(first[1].id, "000002");
        // Existing name_en is never overwritten
        assert_eq!(first[1].name_en, "thermal tonic");

        let mut second = vec![Product::default()];
        assign_product_ids(&mut second, &mut counter);
        assert_eq!(second[0].id, "000003");
    }

    #[test]
    fn parses_model_output_with_type_fields() {
        let json = r#"{
            "products": [{
                "id": "x",
                "brand": "Reviderm",
                "name_ru": "Очищающее молочко",
                "type": "молочко",
                "skus": [{"art": "80009", "vol": "200 ml", "type": "home"}]
            }],
            "knowledge": [{"title": "Care", "content": "Steps", "recommendations": ["daily"]}]
        }"#;

        let catalog: Catalog = serde_json::from_str(json).unwrap();
        assert_eq!(catalog.products.len(), 1);
        assert_eq!(catalog.products[0].kind, "молочко");
        assert_eq!(catalog.products[0].skus[0].kind, "home");
        assert_eq!(catalog.knowledge[0].recommendations, vec!["daily"]);
    }

    #[test]
    fn missing_keys_default_to_empty() {
        let catalog: Catalog = serde_json::from_str("{}").unwrap();
        assert!(catalog.products.is_empty());
        assert!(catalog.knowledge.is_empty());
    }
}

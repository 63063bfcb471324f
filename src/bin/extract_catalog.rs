/// Extract a structured catalog from cleaned catalog text
///
/// Runs the chat model over a catalog text file (chunked when large) and
/// writes the resulting products/knowledge JSON next to the other catalog
/// exports, ready for the ingest step.
///
/// Run with: cargo run --bin extract_catalog -- <input_file> [brand]

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use cosmetics_assistant_bot::{catalog, config::Config};

const OUTPUT_DIR: &str = "catalog_json";

/// Guess the brand from the file name when none is given
fn infer_brand(file_name: &str) -> &'static str {
    let lower = file_name.to_lowercase();
    if lower.contains("seboradin") {
        "Seboradin"
    } else if lower.contains("spiller") {
        "Dr. Spiller"
    } else {
        "Reviderm"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    pretty_env_logger::init();

    let mut args = std::env::args().skip(1);
    let input: PathBuf = args
        .next()
        .map(PathBuf::from)
        .context("Usage: extract_catalog <input_file> [brand]")?;

    let file_name = input
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let brand = args.next().unwrap_or_else(|| infer_brand(&file_name).to_string());

    let text = fs::read_to_string(&input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    println!("Processing {} ({} chars)", input.display(), text.len());
    println!("Brand: {}", brand);

    let config = Config::from_env()?;

    // Extraction over big chunks is slow; give the proxy plenty of time
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(900))
        .build()
        .context("Failed to create HTTP client")?;

    let result = catalog::extract_file(&client, &config, &text, &brand).await?;

    println!("Found {} products", result.products.len());
    println!("Found {} knowledge articles", result.knowledge.len());

    fs::create_dir_all(OUTPUT_DIR)
        .with_context(|| format!("Failed to create {}", OUTPUT_DIR))?;

    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("catalog");
    let output = PathBuf::from(OUTPUT_DIR).join(format!("{}.json", stem));

    let json = serde_json::to_string_pretty(&result)?;
    fs::write(&output, json)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Result saved to {}", output.display());

    Ok(())
}

//! Seed-record loading.
//!
//! Loads pre-sectioned document records (JSON) into the store and builds
//! the document's full-text index. Segmenting raw transcripts into
//! sections is an upstream concern — this module only persists structured
//! records, resolves the document language, and indexes the result.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::index::SearchIndex;
use crate::language;
use crate::models::SeedDocument;
use crate::store::SpanStore;

/// Parse a seed file.
pub fn load_seed(path: &Path) -> Result<SeedDocument> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file: {}", path.display()))?;
    let seed: SeedDocument =
        serde_json::from_str(&content).with_context(|| "Failed to parse seed file")?;
    if seed.sections.is_empty() {
        anyhow::bail!("seed document '{}' has no sections", seed.name);
    }
    Ok(seed)
}

/// Load a seed document into the store and index it. Returns the new
/// document id.
pub async fn run_seed(
    config: &Config,
    store: &dyn SpanStore,
    index: &dyn SearchIndex,
    seed: &SeedDocument,
) -> Result<i64> {
    let document_id = store
        .create_document(&seed.name, seed.language.as_deref())
        .await?;
    let sections = store.insert_sections(document_id, &seed.sections).await?;

    for label in &seed.labels {
        store
            .upsert_label(
                document_id,
                &label.name,
                &label.color,
                label.code_rule.as_deref(),
            )
            .await?;
    }

    index.build_index(document_id, &sections).await?;

    let resolved = language::resolve(store, document_id, &config.language.default).await?;

    info!(
        document_id,
        name = %seed.name,
        sections = sections.len(),
        labels = seed.labels.len(),
        language = %resolved,
        "document seeded"
    );
    Ok(document_id)
}

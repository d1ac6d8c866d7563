//! Rule Suggestion Generator.
//!
//! Two jobs: evaluate a stored boolean code rule against the per-document
//! full-text index ([`search`]), and synthesize an initial rule from an
//! example annotation ([`suggest_rule`]). Synthesis runs two passes over
//! the (label-token, example-token) pairs: a lexical pass keyed on
//! normalized Levenshtein similarity, then a semantic pass keyed on
//! embedding similarity. The cutoffs deliberately differ — near-exact
//! matches drive precision, semantically related terms boost recall — and
//! the result is one combined boolean query the coder can inspect and
//! edit.

use tracing::{debug, info};

use crate::config::SuggestionConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::index::SearchIndex;
use crate::language;
use crate::models::SearchHit;
use crate::store::SpanStore;
use crate::text;

/// Evaluate a code rule against a document's index.
///
/// Returns hits ranked by descending score; an empty list when nothing
/// matches; [`crate::error::Error::QuerySyntax`] for a malformed rule.
/// `limit = None` returns every match.
pub async fn search(
    index: &dyn SearchIndex,
    document_id: i64,
    rule: &str,
    limit: Option<i64>,
) -> Result<Vec<SearchHit>> {
    let hits = index.query(document_id, rule, limit).await?;
    debug!(document_id, rule, hits = hits.len(), "code rule evaluated");
    Ok(hits)
}

/// Synthesize a code rule from a label name and one example span.
///
/// Returns the empty string when no token pair clears either cutoff —
/// callers treat that as "no rule suggested", not as an error.
pub fn suggest_rule(
    label: &str,
    example: &str,
    language: &str,
    embedder: &dyn EmbeddingProvider,
    cfg: &SuggestionConfig,
) -> String {
    let label_tokens = text::tokenize(label);
    // Stopwords, punctuation, and whitespace are stripped from the example
    // side only; the label is the coder's chosen name and stays whole.
    let example_tokens = text::content_tokens(example, language);

    let mut rule = String::new();

    // Lexical pass: near-exact example terms, AND-joined.
    for label_token in &label_tokens {
        for example_token in &example_tokens {
            let lev = strsim::normalized_levenshtein(label_token, example_token);
            if lev > cfg.lev_cutoff {
                let term = format!("{example_token}*");
                if !rule.contains(&term) {
                    if !rule.is_empty() {
                        rule.push_str(" AND ");
                    }
                    rule.push_str(&term);
                }
            }
        }
    }

    // Semantic pass: related terms, grouped in one OR clause.
    let mut clause_open = false;
    let mut first_term = true;
    for label_token in &label_tokens {
        for example_token in &example_tokens {
            let term = format!("{example_token}*");
            if rule.contains(&term) {
                continue;
            }
            let sim = embedder.similarity(label_token, example_token) as f64;
            if sim > cfg.sim_cutoff {
                if !clause_open {
                    if !rule.is_empty() {
                        rule.push_str(" AND (");
                    } else {
                        rule.push('(');
                    }
                    clause_open = true;
                }
                if !first_term {
                    rule.push_str(" OR ");
                } else {
                    first_term = false;
                }
                rule.push_str(&term);
            }
        }
    }
    if clause_open {
        rule.push(')');
    }

    rule
}

/// Synthesize and persist a rule for a label from whatever example
/// annotation exists.
///
/// The example may not exist yet (the annotation carrying the new label is
/// written by a separate flow), so the lookup is retried in a bounded loop
/// rather than recursively. Returns `None` when no rule could be
/// suggested.
pub async fn suggest_rule_for_label(
    store: &dyn SpanStore,
    document_id: i64,
    label: &str,
    embedder: &dyn EmbeddingProvider,
    cfg: &SuggestionConfig,
    default_language: &str,
) -> Result<Option<String>> {
    let language = language::resolve(store, document_id, default_language).await?;

    for attempt in 1..=cfg.max_rule_attempts {
        match store.example_span_for_label(document_id, label).await? {
            Some(example) => {
                let rule = suggest_rule(label, &example, &language, embedder, cfg);
                if rule.is_empty() {
                    info!(document_id, label, "no rule suggested from example");
                    return Ok(None);
                }
                store.set_code_rule(document_id, label, &rule).await?;
                info!(document_id, label, rule = %rule, "code rule suggested");
                return Ok(Some(rule));
            }
            None => {
                debug!(document_id, label, attempt, "no example annotation yet");
            }
        }
    }

    Ok(None)
}

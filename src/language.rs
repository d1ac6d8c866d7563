//! Document language resolution.
//!
//! The language tag selects stopword sets for rule synthesis, TF-IDF
//! features, and explanation filtering. It is inferred once per document
//! from the longest section — the sample with the most signal — and cached
//! on the document row. Inference compares stopword hit rates between the
//! supported languages; an inconclusive result falls back silently to the
//! configured default (the `LanguageResolution` soft-fail contract).

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::stopwords;
use crate::store::SpanStore;
use crate::text;

/// Resolve (and cache) the language of a document.
///
/// `LanguageResolution` failures never escape: the fallback to
/// `default_language` is applied here so callers always get a usable tag.
/// Store failures still propagate.
pub async fn resolve(
    store: &dyn SpanStore,
    document_id: i64,
    default_language: &str,
) -> Result<String> {
    if let Some(cached) = store.document_language(document_id).await? {
        return Ok(cached);
    }

    let sections = store.sections(document_id).await?;
    let longest = sections
        .iter()
        .max_by_key(|s| s.text.chars().count())
        .map(|s| s.text.as_str())
        .unwrap_or("");

    let language = match infer(longest) {
        Ok(language) => language,
        Err(Error::LanguageResolution) => {
            warn!(
                document_id,
                default_language, "language inference inconclusive, using default"
            );
            default_language.to_string()
        }
        Err(other) => return Err(other),
    };

    store.set_document_language(document_id, &language).await?;
    Ok(language)
}

/// Infer a language tag from a text sample by comparing stopword hit
/// rates between the supported languages.
///
/// Fails with [`Error::LanguageResolution`] when the sample carries no
/// signal (empty text, no stopword hits, or a tie).
pub fn infer(sample: &str) -> Result<String> {
    let tokens = text::tokenize(sample);
    if tokens.is_empty() {
        return Err(Error::LanguageResolution);
    }

    let hits = |list: &[&str]| -> usize {
        tokens
            .iter()
            .filter(|t| list.contains(&t.as_str()))
            .count()
    };

    let en = hits(stopwords::ENGLISH);
    let de = hits(stopwords::GERMAN);
    debug!(en, de, tokens = tokens.len(), "language stopword hits");

    if (en == 0 && de == 0) || en == de {
        return Err(Error::LanguageResolution);
    }
    Ok(if en > de { "en" } else { "de" }.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewSection;
    use crate::store::memory::MemorySpanStore;

    #[test]
    fn infers_english() {
        assert_eq!(
            infer("The team was very slow in the first week of the project").unwrap(),
            "en"
        );
    }

    #[test]
    fn infers_german() {
        assert_eq!(
            infer("Das Team war in der ersten Woche des Projekts sehr langsam").unwrap(),
            "de"
        );
    }

    #[test]
    fn no_signal_is_inconclusive() {
        assert!(matches!(infer(""), Err(Error::LanguageResolution)));
        assert!(matches!(
            infer("lorem ipsum dolor"),
            Err(Error::LanguageResolution)
        ));
    }

    #[tokio::test]
    async fn resolve_caches_on_document() {
        let store = MemorySpanStore::new();
        let doc = store.create_document("interview", None).await.unwrap();
        store
            .insert_sections(
                doc,
                &[NewSection {
                    conversation: "c1".into(),
                    attribute: "q1".into(),
                    text: "The team was very slow in the first week".into(),
                }],
            )
            .await
            .unwrap();

        let language = resolve(&store, doc, "de").await.unwrap();
        assert_eq!(language, "en");
        assert_eq!(
            store.document_language(doc).await.unwrap(),
            Some("en".to_string())
        );
    }

    #[tokio::test]
    async fn resolve_falls_back_to_default() {
        let store = MemorySpanStore::new();
        let doc = store.create_document("empty", None).await.unwrap();
        let language = resolve(&store, doc, "de").await.unwrap();
        assert_eq!(language, "de");
    }
}

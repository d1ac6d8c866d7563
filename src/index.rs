//! Per-document full-text index over sections.
//!
//! The [`SearchIndex`] trait is the contract the rule generator consumes:
//! build (or rebuild) the index for one document, then evaluate boolean
//! code rules against it. [`Fts5Index`] implements it on the
//! `sections_fts` FTS5 virtual table. One document's index never
//! contaminates another's results — every row carries the document id and
//! every query filters on it.

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{SearchHit, Section};

/// Full-text indexing collaborator.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Replace the indexed sections for a document. Rebuildable from
    /// scratch at any time.
    async fn build_index(&self, document_id: i64, sections: &[Section]) -> Result<()>;

    /// Evaluate a boolean code rule, returning hits ranked by descending
    /// score with a per-hit highlight. `limit = None` means unbounded; no
    /// match yields an empty list, a malformed rule
    /// [`Error::QuerySyntax`].
    async fn query(
        &self,
        document_id: i64,
        rule: &str,
        limit: Option<i64>,
    ) -> Result<Vec<SearchHit>>;
}

// ============ Rule normalization ============

/// Normalize a code rule for the FTS5 parser.
///
/// Connectives (`and`, `or`, `not`) are case-insensitive in code rules but
/// must be uppercase for FTS5; everything else is a term and left
/// untouched. Unbalanced parentheses, empty rules, and connective-only
/// rules are rejected here so the caller gets a [`Error::QuerySyntax`]
/// before the index is even consulted.
pub fn normalize_rule(rule: &str) -> Result<String> {
    let trimmed = rule.trim();
    if trimmed.is_empty() {
        return Err(Error::QuerySyntax("empty code rule".to_string()));
    }

    let mut depth: i32 = 0;
    for ch in trimmed.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::QuerySyntax(format!(
                        "unbalanced parentheses in '{trimmed}'"
                    )));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::QuerySyntax(format!(
            "unbalanced parentheses in '{trimmed}'"
        )));
    }

    let mut saw_term = false;
    let mut normalized = Vec::new();
    for word in trimmed.split_whitespace() {
        let bare = word.trim_matches(|c| c == '(' || c == ')');
        if matches!(bare.to_lowercase().as_str(), "and" | "or" | "not") && !bare.is_empty() {
            normalized.push(word.replace(bare, &bare.to_uppercase()));
        } else {
            if !bare.is_empty() {
                saw_term = true;
            }
            normalized.push(word.to_string());
        }
    }
    if !saw_term {
        return Err(Error::QuerySyntax(format!(
            "code rule '{trimmed}' contains no search terms"
        )));
    }

    Ok(normalized.join(" "))
}

// ============ FTS5 implementation ============

/// [`SearchIndex`] over the `sections_fts` FTS5 table.
pub struct Fts5Index {
    pool: SqlitePool,
}

impl Fts5Index {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Map an sqlx failure on a MATCH query: FTS5 parse errors become
/// [`Error::QuerySyntax`], everything else stays a store failure.
fn classify_query_error(err: sqlx::Error, rule: &str) -> Error {
    if let sqlx::Error::Database(ref db_err) = err {
        let message = db_err.message().to_lowercase();
        if message.contains("fts5") || message.contains("syntax error") || message.contains("match")
        {
            return Error::QuerySyntax(format!("'{rule}': {}", db_err.message()));
        }
    }
    Error::Store(anyhow!(err))
}

#[async_trait]
impl SearchIndex for Fts5Index {
    async fn build_index(&self, document_id: i64, sections: &[Section]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| Error::Store(e.into()))?;

        sqlx::query("DELETE FROM sections_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Store(e.into()))?;

        for section in sections {
            sqlx::query("INSERT INTO sections_fts (section_id, document_id, text) VALUES (?, ?, ?)")
                .bind(section.id)
                .bind(document_id)
                .bind(&section.text)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Store(e.into()))?;
        }

        tx.commit().await.map_err(|e| Error::Store(e.into()))?;
        Ok(())
    }

    async fn query(
        &self,
        document_id: i64,
        rule: &str,
        limit: Option<i64>,
    ) -> Result<Vec<SearchHit>> {
        let normalized = normalize_rule(rule)?;

        // LIMIT -1 is SQLite's "no limit".
        let rows = sqlx::query(
            r#"
            SELECT section_id, rank,
                   snippet(sections_fts, 2, '>>>', '<<<', '...', 24) AS highlight
            FROM sections_fts
            WHERE sections_fts MATCH ? AND document_id = ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&normalized)
        .bind(document_id)
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_query_error(e, rule))?;

        let hits = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                SearchHit {
                    section_id: row.get("section_id"),
                    highlight: row.get("highlight"),
                    score: -rank, // negate so higher = better
                }
            })
            .collect();

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_uppercases_connectives() {
        assert_eq!(
            normalize_rule("team and (slow* or fast*)").unwrap(),
            "team AND (slow* OR fast*)"
        );
    }

    #[test]
    fn normalize_leaves_terms_alone() {
        // "android" contains "and" but is a term, not a connective.
        assert_eq!(normalize_rule("android or ios").unwrap(), "android OR ios");
    }

    #[test]
    fn normalize_handles_not() {
        assert_eq!(
            normalize_rule("team not manager").unwrap(),
            "team NOT manager"
        );
    }

    #[test]
    fn empty_rule_is_syntax_error() {
        assert!(matches!(normalize_rule("   "), Err(Error::QuerySyntax(_))));
    }

    #[test]
    fn unbalanced_parentheses_are_rejected() {
        assert!(matches!(
            normalize_rule("(team AND slow"),
            Err(Error::QuerySyntax(_))
        ));
        assert!(matches!(
            normalize_rule("team) AND (slow"),
            Err(Error::QuerySyntax(_))
        ));
    }

    #[test]
    fn connective_only_rule_is_rejected() {
        assert!(matches!(
            normalize_rule("AND OR"),
            Err(Error::QuerySyntax(_))
        ));
    }

    #[test]
    fn mixed_case_connectives_are_normalized() {
        assert_eq!(normalize_rule("a And b Or c").unwrap(), "a AND b OR c");
    }
}

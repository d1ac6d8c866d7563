//! SQLite-backed [`SpanStore`] implementation over an sqlx pool.
//!
//! Single-statement operations rely on SQLite's per-statement atomicity;
//! multi-step mutations (label cascades, the flagged purge) run inside one
//! sqlx transaction so a crash cannot leave a recommendation orphaned from
//! its annotation or vice versa.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::models::{
    Annotation, Label, NewAnnotation, NewRecommendation, NewSection, Recommendation,
    RecommendationSource, Section,
};

use super::SpanStore;

/// [`SpanStore`] over SQLite.
pub struct SqliteSpanStore {
    pool: SqlitePool,
}

impl SqliteSpanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn label_column(source: RecommendationSource) -> &'static str {
    match source {
        RecommendationSource::Rule => "rule_label",
        RecommendationSource::Model => "model_label",
    }
}

fn section_from_row(row: &sqlx::sqlite::SqliteRow) -> Section {
    Section {
        id: row.get("id"),
        document_id: row.get("document_id"),
        conversation: row.get("conversation"),
        attribute: row.get("attribute"),
        text: row.get("text"),
    }
}

fn annotation_from_row(row: &sqlx::sqlite::SqliteRow) -> Annotation {
    Annotation {
        id: row.get("id"),
        document_id: row.get("document_id"),
        annotation_id: row.get("annotation_id"),
        conversation: row.get("conversation"),
        attribute: row.get("attribute"),
        start: row.get("start"),
        length: row.get("length"),
        text: row.get("text"),
        label: row.get("label"),
        is_recommendation: row.get::<i64, _>("is_recommendation") != 0,
        section_id: row.get("section_id"),
        match_highlight: row.get("match_highlight"),
        confidence: row.get("confidence"),
    }
}

fn recommendation_from_row(row: &sqlx::sqlite::SqliteRow) -> Recommendation {
    Recommendation {
        id: row.get("id"),
        document_id: row.get("document_id"),
        section_id: row.get("section_id"),
        rule_label: row.get("rule_label"),
        model_label: row.get("model_label"),
        confidence: row.get("confidence"),
        deletion_flag: row.get::<i64, _>("deletion_flag") != 0,
        highlight: row.get("highlight"),
        annotation_id: row.get("annotation_id"),
    }
}

#[async_trait]
impl SpanStore for SqliteSpanStore {
    async fn create_document(&self, name: &str, language: Option<&str>) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let result =
            sqlx::query("INSERT INTO documents (name, language, last_changed) VALUES (?, ?, ?)")
                .bind(name)
                .bind(language)
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.last_insert_rowid())
    }

    async fn document_language(&self, document_id: i64) -> Result<Option<String>> {
        let language: Option<Option<String>> =
            sqlx::query_scalar("SELECT language FROM documents WHERE id = ?")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(language.flatten())
    }

    async fn set_document_language(&self, document_id: i64, language: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET language = ? WHERE id = ?")
            .bind(language)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_document(&self, document_id: i64, timestamp: i64) -> Result<()> {
        sqlx::query("UPDATE documents SET last_changed = ? WHERE id = ?")
            .bind(timestamp)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_sections(
        &self,
        document_id: i64,
        sections: &[NewSection],
    ) -> Result<Vec<Section>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(sections.len());

        for section in sections {
            let result = sqlx::query(
                "INSERT INTO sections (document_id, conversation, attribute, text) VALUES (?, ?, ?, ?)",
            )
            .bind(document_id)
            .bind(&section.conversation)
            .bind(&section.attribute)
            .bind(&section.text)
            .execute(&mut *tx)
            .await?;

            inserted.push(Section {
                id: result.last_insert_rowid(),
                document_id,
                conversation: section.conversation.clone(),
                attribute: section.attribute.clone(),
                text: section.text.clone(),
            });
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn sections(&self, document_id: i64) -> Result<Vec<Section>> {
        let rows = sqlx::query(
            "SELECT id, document_id, conversation, attribute, text FROM sections WHERE document_id = ? ORDER BY id",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(section_from_row).collect())
    }

    async fn section(&self, document_id: i64, section_id: i64) -> Result<Option<Section>> {
        let row = sqlx::query(
            "SELECT id, document_id, conversation, attribute, text FROM sections WHERE document_id = ? AND id = ?",
        )
        .bind(document_id)
        .bind(section_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(section_from_row))
    }

    async fn section_group(
        &self,
        document_id: i64,
        conversation: &str,
        attribute: &str,
    ) -> Result<Vec<Section>> {
        let rows = sqlx::query(
            "SELECT id, document_id, conversation, attribute, text FROM sections \
             WHERE document_id = ? AND conversation = ? AND attribute = ? ORDER BY id",
        )
        .bind(document_id)
        .bind(conversation)
        .bind(attribute)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(section_from_row).collect())
    }

    async fn upsert_label(
        &self,
        document_id: i64,
        name: &str,
        color: &str,
        code_rule: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO labels (document_id, name, color, code_rule) VALUES (?, ?, ?, ?)
            ON CONFLICT(document_id, name) DO UPDATE SET
                color = excluded.color,
                code_rule = COALESCE(excluded.code_rule, labels.code_rule)
            "#,
        )
        .bind(document_id)
        .bind(name)
        .bind(color)
        .bind(code_rule)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn labels(&self, document_id: i64) -> Result<Vec<Label>> {
        let rows = sqlx::query(
            "SELECT document_id, name, color, code_rule FROM labels WHERE document_id = ? ORDER BY name",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Label {
                document_id: row.get("document_id"),
                name: row.get("name"),
                color: row.get("color"),
                code_rule: row.get("code_rule"),
            })
            .collect())
    }

    async fn label(&self, document_id: i64, name: &str) -> Result<Option<Label>> {
        let row = sqlx::query(
            "SELECT document_id, name, color, code_rule FROM labels WHERE document_id = ? AND name = ?",
        )
        .bind(document_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Label {
            document_id: row.get("document_id"),
            name: row.get("name"),
            color: row.get("color"),
            code_rule: row.get("code_rule"),
        }))
    }

    async fn set_code_rule(&self, document_id: i64, label: &str, rule: &str) -> Result<()> {
        sqlx::query("UPDATE labels SET code_rule = ? WHERE document_id = ? AND name = ?")
            .bind(rule)
            .bind(document_id)
            .bind(label)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rename_label(&self, document_id: i64, from: &str, to: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE labels SET name = ? WHERE document_id = ? AND name = ?")
            .bind(to)
            .bind(document_id)
            .bind(from)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE annotations SET label = ? WHERE document_id = ? AND label = ?")
            .bind(to)
            .bind(document_id)
            .bind(from)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE recommendations SET rule_label = ? WHERE document_id = ? AND rule_label = ?",
        )
        .bind(to)
        .bind(document_id)
        .bind(from)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE recommendations SET model_label = ? WHERE document_id = ? AND model_label = ?",
        )
        .bind(to)
        .bind(document_id)
        .bind(from)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_label(&self, document_id: i64, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM labels WHERE document_id = ? AND name = ?")
            .bind(document_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM annotations WHERE document_id = ? AND label = ?")
            .bind(document_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM recommendations WHERE document_id = ? AND (rule_label = ? OR model_label = ?)",
        )
        .bind(document_id)
        .bind(name)
        .bind(name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn annotations(&self, document_id: i64) -> Result<Vec<Annotation>> {
        let rows = sqlx::query("SELECT * FROM annotations WHERE document_id = ? ORDER BY id")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(annotation_from_row).collect())
    }

    async fn confirmed_annotations(
        &self,
        document_id: i64,
        include_rule_recommendations: bool,
    ) -> Result<Vec<Annotation>> {
        let sql = if include_rule_recommendations {
            // Confidence 1 selects rule-derived machine annotations; model
            // annotations always score below their calibration cutoff's
            // ceiling and are never fed back as positives.
            "SELECT * FROM annotations WHERE document_id = ? AND (is_recommendation = 0 OR confidence = 1)"
        } else {
            "SELECT * FROM annotations WHERE document_id = ? AND is_recommendation = 0"
        };
        let rows = sqlx::query(sql)
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(annotation_from_row).collect())
    }

    async fn example_span_for_label(
        &self,
        document_id: i64,
        label: &str,
    ) -> Result<Option<String>> {
        let text: Option<String> = sqlx::query_scalar(
            "SELECT text FROM annotations WHERE document_id = ? AND label = ? LIMIT 1",
        )
        .bind(document_id)
        .bind(label)
        .fetch_optional(&self.pool)
        .await?;
        Ok(text)
    }

    async fn human_annotation_exists(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM annotations \
             WHERE document_id = ? AND section_id = ? AND label = ? AND is_recommendation = 0",
        )
        .bind(document_id)
        .bind(section_id)
        .bind(label)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn insert_annotation(&self, annotation: &NewAnnotation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO annotations
                (document_id, annotation_id, conversation, attribute, start, length, text,
                 label, is_recommendation, section_id, match_highlight, confidence)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(annotation.document_id)
        .bind(&annotation.annotation_id)
        .bind(&annotation.conversation)
        .bind(&annotation.attribute)
        .bind(annotation.start)
        .bind(annotation.length)
        .bind(&annotation.text)
        .bind(&annotation.label)
        .bind(annotation.is_recommendation as i64)
        .bind(annotation.section_id)
        .bind(&annotation.match_highlight)
        .bind(annotation.confidence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn promote_annotation(&self, document_id: i64, annotation_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE annotations SET is_recommendation = 0, match_highlight = NULL, confidence = NULL \
             WHERE document_id = ? AND annotation_id = ?",
        )
        .bind(document_id)
        .bind(annotation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recommended_section_ids(
        &self,
        document_id: i64,
        label: &str,
        source: RecommendationSource,
    ) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT section_id FROM recommendations WHERE document_id = ? AND {} = ?",
            label_column(source)
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(document_id)
            .bind(label)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn recommendation_exists(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
        source: RecommendationSource,
    ) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM recommendations WHERE document_id = ? AND section_id = ? AND {} = ?",
            label_column(source)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(document_id)
            .bind(section_id)
            .bind(label)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn insert_recommendation(&self, rec: &NewRecommendation) -> Result<()> {
        let (rule_label, model_label) = match rec.source {
            RecommendationSource::Rule => (Some(rec.label.as_str()), None),
            RecommendationSource::Model => (None, Some(rec.label.as_str())),
        };
        sqlx::query(
            r#"
            INSERT INTO recommendations
                (document_id, section_id, rule_label, model_label, confidence, deletion_flag, highlight)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(rec.document_id)
        .bind(rec.section_id)
        .bind(rule_label)
        .bind(model_label)
        .bind(rec.confidence)
        .bind(&rec.highlight)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn flag_recommendation(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
        source: RecommendationSource,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE recommendations SET deletion_flag = 1 \
             WHERE document_id = ? AND section_id = ? AND {} = ?",
            label_column(source)
        );
        sqlx::query(&sql)
            .bind(document_id)
            .bind(section_id)
            .bind(label)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn flag_model_recommendations(&self, document_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE recommendations SET deletion_flag = 1 WHERE document_id = ? AND confidence < 1",
        )
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn labels_with_model_recommendations(&self, document_id: i64) -> Result<Vec<String>> {
        let labels: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT model_label FROM recommendations \
             WHERE document_id = ? AND model_label IS NOT NULL",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(labels)
    }

    async fn unrealized_recommendations(&self, document_id: i64) -> Result<Vec<Recommendation>> {
        let rows = sqlx::query(
            "SELECT * FROM recommendations \
             WHERE document_id = ? AND annotation_id IS NULL AND deletion_flag = 0 ORDER BY id",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(recommendation_from_row).collect())
    }

    async fn stamp_recommendation(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
        source: RecommendationSource,
        annotation_id: &str,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE recommendations SET annotation_id = ? \
             WHERE document_id = ? AND section_id = ? AND {} = ?",
            label_column(source)
        );
        sqlx::query(&sql)
            .bind(annotation_id)
            .bind(document_id)
            .bind(section_id)
            .bind(label)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_recommendation_by_annotation(
        &self,
        document_id: i64,
        annotation_id: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM recommendations WHERE document_id = ? AND annotation_id = ?")
            .bind(document_id)
            .bind(annotation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_flagged(&self, document_id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let linked: Vec<String> = sqlx::query_scalar(
            "SELECT annotation_id FROM recommendations \
             WHERE document_id = ? AND deletion_flag = 1 AND annotation_id IS NOT NULL",
        )
        .bind(document_id)
        .fetch_all(&mut *tx)
        .await?;

        for annotation_id in &linked {
            sqlx::query(
                "DELETE FROM annotations \
                 WHERE document_id = ? AND annotation_id = ? AND is_recommendation = 1",
            )
            .bind(document_id)
            .bind(annotation_id)
            .execute(&mut *tx)
            .await?;
        }

        let result =
            sqlx::query("DELETE FROM recommendations WHERE document_id = ? AND deletion_flag = 1")
                .bind(document_id)
                .execute(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

//! Storage abstraction for qoda.
//!
//! The [`SpanStore`] trait is the narrow read/write contract onto
//! documents, sections, labels, annotations, and recommendations. The
//! engine components never touch SQL directly; they consume this trait,
//! enabling pluggable backends (SQLite for the CLI, in-memory for unit
//! tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Multi-step mutations (label cascades, the flagged-recommendation purge)
//! must be atomic within a single call: a crash between "mark retired" and
//! "physically delete" must not be observable.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Annotation, Label, NewAnnotation, NewRecommendation, NewSection, Recommendation,
    RecommendationSource, Section,
};

/// Abstract storage backend for qoda.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | Documents | `create_document`, `document_language`, `set_document_language`, `touch_document` |
/// | Sections | `insert_sections`, `sections`, `section`, `section_group` |
/// | Labels | `upsert_label`, `labels`, `label`, `set_code_rule`, `rename_label`, `delete_label` |
/// | Annotations | `annotations`, `confirmed_annotations`, `example_span_for_label`, `human_annotation_exists`, `insert_annotation`, `promote_annotation` |
/// | Recommendations | `recommended_section_ids`, `recommendation_exists`, `insert_recommendation`, `flag_recommendation`, `flag_model_recommendations`, `labels_with_model_recommendations`, `unrealized_recommendations`, `stamp_recommendation`, `delete_recommendation_by_annotation`, `purge_flagged` |
#[async_trait]
pub trait SpanStore: Send + Sync {
    // ─── Documents ───

    /// Create a document, returning its id.
    async fn create_document(&self, name: &str, language: Option<&str>) -> Result<i64>;

    /// Cached language tag for a document, if resolved.
    async fn document_language(&self, document_id: i64) -> Result<Option<String>>;

    /// Cache the resolved language tag on the document row.
    async fn set_document_language(&self, document_id: i64, language: &str) -> Result<()>;

    /// Stamp the document's last-changed timestamp.
    async fn touch_document(&self, document_id: i64, timestamp: i64) -> Result<()>;

    // ─── Sections ───

    /// Append sections in order, returning them with assigned ids.
    async fn insert_sections(
        &self,
        document_id: i64,
        sections: &[NewSection],
    ) -> Result<Vec<Section>>;

    /// All sections of a document, ascending id order.
    async fn sections(&self, document_id: i64) -> Result<Vec<Section>>;

    /// One section by id.
    async fn section(&self, document_id: i64, section_id: i64) -> Result<Option<Section>>;

    /// All sections of one (conversation, attribute) group, ascending id
    /// order — the order that defines span offsets.
    async fn section_group(
        &self,
        document_id: i64,
        conversation: &str,
        attribute: &str,
    ) -> Result<Vec<Section>>;

    // ─── Labels ───

    /// Insert or update a codebook label.
    async fn upsert_label(
        &self,
        document_id: i64,
        name: &str,
        color: &str,
        code_rule: Option<&str>,
    ) -> Result<()>;

    /// All labels of a document.
    async fn labels(&self, document_id: i64) -> Result<Vec<Label>>;

    /// One label by name.
    async fn label(&self, document_id: i64, name: &str) -> Result<Option<Label>>;

    /// Store a code rule on an existing label.
    async fn set_code_rule(&self, document_id: i64, label: &str, rule: &str) -> Result<()>;

    /// Rename a label, cascading to annotations and recommendations in one
    /// atomic step.
    async fn rename_label(&self, document_id: i64, from: &str, to: &str) -> Result<()>;

    /// Delete a label and everything referencing it in one atomic step.
    async fn delete_label(&self, document_id: i64, name: &str) -> Result<()>;

    // ─── Annotations ───

    /// All annotations of a document.
    async fn annotations(&self, document_id: i64) -> Result<Vec<Annotation>>;

    /// Annotations usable as classifier positives: human annotations
    /// always; machine annotations only when `include_rule_recommendations`
    /// and their confidence is exactly 1 (which rules out model-made ones).
    async fn confirmed_annotations(
        &self,
        document_id: i64,
        include_rule_recommendations: bool,
    ) -> Result<Vec<Annotation>>;

    /// The span text of any annotation carrying this label, if one exists.
    async fn example_span_for_label(&self, document_id: i64, label: &str)
        -> Result<Option<String>>;

    /// Whether a human annotation exists for (section, label).
    async fn human_annotation_exists(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
    ) -> Result<bool>;

    /// Insert an annotation row.
    async fn insert_annotation(&self, annotation: &NewAnnotation) -> Result<()>;

    /// Turn a machine annotation into a human one (clears highlight and
    /// confidence).
    async fn promote_annotation(&self, document_id: i64, annotation_id: &str) -> Result<()>;

    // ─── Recommendations ───

    /// Section ids currently recommended for (label, source).
    async fn recommended_section_ids(
        &self,
        document_id: i64,
        label: &str,
        source: RecommendationSource,
    ) -> Result<Vec<i64>>;

    /// Whether a recommendation row exists for (section, label, source).
    async fn recommendation_exists(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
        source: RecommendationSource,
    ) -> Result<bool>;

    /// Insert a recommendation row with `deletion_flag = false`.
    async fn insert_recommendation(&self, rec: &NewRecommendation) -> Result<()>;

    /// Flag one recommendation for deferred removal.
    async fn flag_recommendation(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
        source: RecommendationSource,
    ) -> Result<()>;

    /// Flag every model recommendation (confidence < 1) for removal.
    /// Returns the number of rows flagged.
    async fn flag_model_recommendations(&self, document_id: i64) -> Result<u64>;

    /// Distinct labels that currently have model recommendations.
    async fn labels_with_model_recommendations(&self, document_id: i64) -> Result<Vec<String>>;

    /// Recommendations not yet materialized into annotations
    /// (`annotation_id` is null, not flagged).
    async fn unrealized_recommendations(&self, document_id: i64) -> Result<Vec<Recommendation>>;

    /// Record the annotation id a recommendation resolved to.
    async fn stamp_recommendation(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
        source: RecommendationSource,
        annotation_id: &str,
    ) -> Result<()>;

    /// Drop the recommendation linked to an accepted annotation.
    async fn delete_recommendation_by_annotation(
        &self,
        document_id: i64,
        annotation_id: &str,
    ) -> Result<()>;

    /// Atomically delete every flagged recommendation together with its
    /// linked machine annotation. Returns the number of recommendations
    /// removed.
    async fn purge_flagged(&self, document_id: i64) -> Result<u64>;
}

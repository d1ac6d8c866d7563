//! Core data models used throughout qoda.
//!
//! These types are constructed at the store-adapter boundary and flow
//! through the suggestion, training, and reconciliation pipelines. All
//! offsets are in characters, not bytes.

use serde::Deserialize;

/// A coded document: the unit of isolation for indexing, training, and
/// reconciliation. `language` is inferred lazily from the document text
/// and cached; `None` means not yet resolved.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub name: String,
    pub language: Option<String>,
    pub last_changed: i64,
}

/// An immutable, ordered chunk of document text — the addressable unit
/// annotations attach to.
///
/// Sections are grouped by `(conversation, attribute)`; within a group the
/// ascending `id` order determines the character offsets of annotation
/// spans.
#[derive(Debug, Clone)]
pub struct Section {
    pub id: i64,
    pub document_id: i64,
    pub conversation: String,
    pub attribute: String,
    pub text: String,
}

/// Insert shape for [`Section`] (id assigned by the store).
#[derive(Debug, Clone, Deserialize)]
pub struct NewSection {
    pub conversation: String,
    pub attribute: String,
    pub text: String,
}

/// A named code in a document's codebook, optionally carrying a stored
/// boolean code rule.
#[derive(Debug, Clone)]
pub struct Label {
    pub document_id: i64,
    pub name: String,
    pub color: String,
    pub code_rule: Option<String>,
}

/// A materialized labeled span.
///
/// `is_recommendation = false` marks a human annotation. At most one human
/// annotation exists per (document, section, label); machine annotations
/// may sit alongside it but are superseded by it. Machine annotations
/// carry a `confidence` and a `match_highlight` (rule highlight or
/// classifier critical words).
#[derive(Debug, Clone)]
pub struct Annotation {
    pub id: i64,
    pub document_id: i64,
    /// Human-readable span id, e.g. `c-q-118-22-4031`. Collision-tolerant,
    /// not guaranteed unique.
    pub annotation_id: String,
    pub conversation: String,
    pub attribute: String,
    /// Character offset of the span within its (conversation, attribute)
    /// group.
    pub start: i64,
    /// Span length in characters.
    pub length: i64,
    /// The span text itself.
    pub text: String,
    pub label: String,
    pub is_recommendation: bool,
    /// Back-reference to the section this span covers.
    pub section_id: i64,
    pub match_highlight: Option<String>,
    pub confidence: Option<f64>,
}

/// Insert shape for [`Annotation`].
#[derive(Debug, Clone)]
pub struct NewAnnotation {
    pub document_id: i64,
    pub annotation_id: String,
    pub conversation: String,
    pub attribute: String,
    pub start: i64,
    pub length: i64,
    pub text: String,
    pub label: String,
    pub is_recommendation: bool,
    pub section_id: i64,
    pub match_highlight: Option<String>,
    pub confidence: Option<f64>,
}

/// Which generator produced a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationSource {
    /// Derived from a boolean code rule (`rule_label` set, confidence 1.0).
    Rule,
    /// Derived from the per-document classifier (`model_label` set, graded
    /// confidence).
    Model,
}

impl RecommendationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Model => "model",
        }
    }
}

/// A staged candidate label for a section, pending reconciliation into an
/// [`Annotation`].
///
/// Exactly one of `rule_label` / `model_label` is set. `annotation_id =
/// None` means the candidate has not yet been materialized; `deletion_flag
/// = true` means the row and its linked annotation are pending atomic
/// removal.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub id: i64,
    pub document_id: i64,
    pub section_id: i64,
    pub rule_label: Option<String>,
    pub model_label: Option<String>,
    pub confidence: f64,
    pub deletion_flag: bool,
    pub highlight: Option<String>,
    pub annotation_id: Option<String>,
}

impl Recommendation {
    /// The label regardless of source column.
    pub fn label(&self) -> &str {
        self.rule_label
            .as_deref()
            .or(self.model_label.as_deref())
            .unwrap_or_default()
    }

    pub fn source(&self) -> RecommendationSource {
        if self.rule_label.is_some() {
            RecommendationSource::Rule
        } else {
            RecommendationSource::Model
        }
    }
}

/// Insert shape for [`Recommendation`].
#[derive(Debug, Clone)]
pub struct NewRecommendation {
    pub document_id: i64,
    pub section_id: i64,
    pub label: String,
    pub source: RecommendationSource,
    pub confidence: f64,
    pub highlight: Option<String>,
}

/// A ranked hit from the full-text index.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub section_id: i64,
    /// Match excerpt with the hit terms marked up by the index.
    pub highlight: String,
    /// Higher is better.
    pub score: f64,
}

/// Pre-sectioned document records accepted by `qoda seed`.
///
/// This is deliberately not a document parser: segmentation into sections
/// happens upstream, qoda only loads the structured result.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedDocument {
    pub name: String,
    #[serde(default)]
    pub language: Option<String>,
    pub sections: Vec<NewSection>,
    #[serde(default)]
    pub labels: Vec<SeedLabel>,
}

/// A codebook entry in a seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedLabel {
    pub name: String,
    #[serde(default = "default_label_color")]
    pub color: String,
    #[serde(default)]
    pub code_rule: Option<String>,
}

fn default_label_color() -> String {
    "#888888".to_string()
}

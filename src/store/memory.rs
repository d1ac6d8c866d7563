//! In-memory [`SpanStore`] implementation for unit tests.
//!
//! Uses plain vectors behind `std::sync::RwLock`. Every mutation takes the
//! single write lock, so the multi-step operations (cascades, the flagged
//! purge) are trivially atomic.

use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Annotation, Label, NewAnnotation, NewRecommendation, NewSection, Recommendation,
    RecommendationSource, Section,
};

use super::SpanStore;

#[derive(Default)]
struct Inner {
    next_document_id: i64,
    next_section_id: i64,
    next_annotation_row_id: i64,
    next_recommendation_id: i64,
    documents: Vec<(i64, String, Option<String>, i64)>,
    sections: Vec<Section>,
    labels: Vec<Label>,
    annotations: Vec<Annotation>,
    recommendations: Vec<Recommendation>,
}

/// In-memory store for tests.
pub struct MemorySpanStore {
    inner: RwLock<Inner>,
}

impl MemorySpanStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemorySpanStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_source(rec: &Recommendation, label: &str, source: RecommendationSource) -> bool {
    match source {
        RecommendationSource::Rule => rec.rule_label.as_deref() == Some(label),
        RecommendationSource::Model => rec.model_label.as_deref() == Some(label),
    }
}

#[async_trait]
impl SpanStore for MemorySpanStore {
    async fn create_document(&self, name: &str, language: Option<&str>) -> Result<i64> {
        let mut inner = self.inner.write().unwrap();
        inner.next_document_id += 1;
        let id = inner.next_document_id;
        let now = chrono::Utc::now().timestamp();
        inner
            .documents
            .push((id, name.to_string(), language.map(|l| l.to_string()), now));
        Ok(id)
    }

    async fn document_language(&self, document_id: i64) -> Result<Option<String>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .documents
            .iter()
            .find(|(id, ..)| *id == document_id)
            .and_then(|(_, _, lang, _)| lang.clone()))
    }

    async fn set_document_language(&self, document_id: i64, language: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(doc) = inner.documents.iter_mut().find(|(id, ..)| *id == document_id) {
            doc.2 = Some(language.to_string());
        }
        Ok(())
    }

    async fn touch_document(&self, document_id: i64, timestamp: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(doc) = inner.documents.iter_mut().find(|(id, ..)| *id == document_id) {
            doc.3 = timestamp;
        }
        Ok(())
    }

    async fn insert_sections(
        &self,
        document_id: i64,
        sections: &[NewSection],
    ) -> Result<Vec<Section>> {
        let mut inner = self.inner.write().unwrap();
        let mut inserted = Vec::with_capacity(sections.len());
        for section in sections {
            inner.next_section_id += 1;
            let stored = Section {
                id: inner.next_section_id,
                document_id,
                conversation: section.conversation.clone(),
                attribute: section.attribute.clone(),
                text: section.text.clone(),
            };
            inner.sections.push(stored.clone());
            inserted.push(stored);
        }
        Ok(inserted)
    }

    async fn sections(&self, document_id: i64) -> Result<Vec<Section>> {
        let inner = self.inner.read().unwrap();
        let mut sections: Vec<Section> = inner
            .sections
            .iter()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect();
        sections.sort_by_key(|s| s.id);
        Ok(sections)
    }

    async fn section(&self, document_id: i64, section_id: i64) -> Result<Option<Section>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .sections
            .iter()
            .find(|s| s.document_id == document_id && s.id == section_id)
            .cloned())
    }

    async fn section_group(
        &self,
        document_id: i64,
        conversation: &str,
        attribute: &str,
    ) -> Result<Vec<Section>> {
        let inner = self.inner.read().unwrap();
        let mut sections: Vec<Section> = inner
            .sections
            .iter()
            .filter(|s| {
                s.document_id == document_id
                    && s.conversation == conversation
                    && s.attribute == attribute
            })
            .cloned()
            .collect();
        sections.sort_by_key(|s| s.id);
        Ok(sections)
    }

    async fn upsert_label(
        &self,
        document_id: i64,
        name: &str,
        color: &str,
        code_rule: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(label) = inner
            .labels
            .iter_mut()
            .find(|l| l.document_id == document_id && l.name == name)
        {
            label.color = color.to_string();
            if code_rule.is_some() {
                label.code_rule = code_rule.map(|r| r.to_string());
            }
        } else {
            inner.labels.push(Label {
                document_id,
                name: name.to_string(),
                color: color.to_string(),
                code_rule: code_rule.map(|r| r.to_string()),
            });
        }
        Ok(())
    }

    async fn labels(&self, document_id: i64) -> Result<Vec<Label>> {
        let inner = self.inner.read().unwrap();
        let mut labels: Vec<Label> = inner
            .labels
            .iter()
            .filter(|l| l.document_id == document_id)
            .cloned()
            .collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(labels)
    }

    async fn label(&self, document_id: i64, name: &str) -> Result<Option<Label>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .labels
            .iter()
            .find(|l| l.document_id == document_id && l.name == name)
            .cloned())
    }

    async fn set_code_rule(&self, document_id: i64, label: &str, rule: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(stored) = inner
            .labels
            .iter_mut()
            .find(|l| l.document_id == document_id && l.name == label)
        {
            stored.code_rule = Some(rule.to_string());
        }
        Ok(())
    }

    async fn rename_label(&self, document_id: i64, from: &str, to: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for label in inner
            .labels
            .iter_mut()
            .filter(|l| l.document_id == document_id && l.name == from)
        {
            label.name = to.to_string();
        }
        for annotation in inner
            .annotations
            .iter_mut()
            .filter(|a| a.document_id == document_id && a.label == from)
        {
            annotation.label = to.to_string();
        }
        for rec in inner
            .recommendations
            .iter_mut()
            .filter(|r| r.document_id == document_id)
        {
            if rec.rule_label.as_deref() == Some(from) {
                rec.rule_label = Some(to.to_string());
            }
            if rec.model_label.as_deref() == Some(from) {
                rec.model_label = Some(to.to_string());
            }
        }
        Ok(())
    }

    async fn delete_label(&self, document_id: i64, name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .labels
            .retain(|l| !(l.document_id == document_id && l.name == name));
        inner
            .annotations
            .retain(|a| !(a.document_id == document_id && a.label == name));
        inner.recommendations.retain(|r| {
            !(r.document_id == document_id
                && (r.rule_label.as_deref() == Some(name) || r.model_label.as_deref() == Some(name)))
        });
        Ok(())
    }

    async fn annotations(&self, document_id: i64) -> Result<Vec<Annotation>> {
        let inner = self.inner.read().unwrap();
        let mut annotations: Vec<Annotation> = inner
            .annotations
            .iter()
            .filter(|a| a.document_id == document_id)
            .cloned()
            .collect();
        annotations.sort_by_key(|a| a.id);
        Ok(annotations)
    }

    async fn confirmed_annotations(
        &self,
        document_id: i64,
        include_rule_recommendations: bool,
    ) -> Result<Vec<Annotation>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .annotations
            .iter()
            .filter(|a| a.document_id == document_id)
            .filter(|a| {
                !a.is_recommendation
                    || (include_rule_recommendations && a.confidence == Some(1.0))
            })
            .cloned()
            .collect())
    }

    async fn example_span_for_label(
        &self,
        document_id: i64,
        label: &str,
    ) -> Result<Option<String>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .annotations
            .iter()
            .find(|a| a.document_id == document_id && a.label == label)
            .map(|a| a.text.clone()))
    }

    async fn human_annotation_exists(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
    ) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner.annotations.iter().any(|a| {
            a.document_id == document_id
                && a.section_id == section_id
                && a.label == label
                && !a.is_recommendation
        }))
    }

    async fn insert_annotation(&self, annotation: &NewAnnotation) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.next_annotation_row_id += 1;
        let id = inner.next_annotation_row_id;
        inner.annotations.push(Annotation {
            id,
            document_id: annotation.document_id,
            annotation_id: annotation.annotation_id.clone(),
            conversation: annotation.conversation.clone(),
            attribute: annotation.attribute.clone(),
            start: annotation.start,
            length: annotation.length,
            text: annotation.text.clone(),
            label: annotation.label.clone(),
            is_recommendation: annotation.is_recommendation,
            section_id: annotation.section_id,
            match_highlight: annotation.match_highlight.clone(),
            confidence: annotation.confidence,
        });
        Ok(())
    }

    async fn promote_annotation(&self, document_id: i64, annotation_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for annotation in inner.annotations.iter_mut().filter(|a| {
            a.document_id == document_id && a.annotation_id == annotation_id
        }) {
            annotation.is_recommendation = false;
            annotation.match_highlight = None;
            annotation.confidence = None;
        }
        Ok(())
    }

    async fn recommended_section_ids(
        &self,
        document_id: i64,
        label: &str,
        source: RecommendationSource,
    ) -> Result<Vec<i64>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .recommendations
            .iter()
            .filter(|r| r.document_id == document_id && matches_source(r, label, source))
            .map(|r| r.section_id)
            .collect())
    }

    async fn recommendation_exists(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
        source: RecommendationSource,
    ) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner.recommendations.iter().any(|r| {
            r.document_id == document_id
                && r.section_id == section_id
                && matches_source(r, label, source)
        }))
    }

    async fn insert_recommendation(&self, rec: &NewRecommendation) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.next_recommendation_id += 1;
        let id = inner.next_recommendation_id;
        let (rule_label, model_label) = match rec.source {
            RecommendationSource::Rule => (Some(rec.label.clone()), None),
            RecommendationSource::Model => (None, Some(rec.label.clone())),
        };
        inner.recommendations.push(Recommendation {
            id,
            document_id: rec.document_id,
            section_id: rec.section_id,
            rule_label,
            model_label,
            confidence: rec.confidence,
            deletion_flag: false,
            highlight: rec.highlight.clone(),
            annotation_id: None,
        });
        Ok(())
    }

    async fn flag_recommendation(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
        source: RecommendationSource,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for rec in inner.recommendations.iter_mut().filter(|r| {
            r.document_id == document_id
                && r.section_id == section_id
                && matches_source(r, label, source)
        }) {
            rec.deletion_flag = true;
        }
        Ok(())
    }

    async fn flag_model_recommendations(&self, document_id: i64) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let mut flagged = 0;
        for rec in inner
            .recommendations
            .iter_mut()
            .filter(|r| r.document_id == document_id && r.confidence < 1.0)
        {
            if !rec.deletion_flag {
                rec.deletion_flag = true;
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    async fn labels_with_model_recommendations(&self, document_id: i64) -> Result<Vec<String>> {
        let inner = self.inner.read().unwrap();
        let mut labels: Vec<String> = inner
            .recommendations
            .iter()
            .filter(|r| r.document_id == document_id)
            .filter_map(|r| r.model_label.clone())
            .collect();
        labels.sort();
        labels.dedup();
        Ok(labels)
    }

    async fn unrealized_recommendations(&self, document_id: i64) -> Result<Vec<Recommendation>> {
        let inner = self.inner.read().unwrap();
        let mut recs: Vec<Recommendation> = inner
            .recommendations
            .iter()
            .filter(|r| {
                r.document_id == document_id && r.annotation_id.is_none() && !r.deletion_flag
            })
            .cloned()
            .collect();
        recs.sort_by_key(|r| r.id);
        Ok(recs)
    }

    async fn stamp_recommendation(
        &self,
        document_id: i64,
        section_id: i64,
        label: &str,
        source: RecommendationSource,
        annotation_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for rec in inner.recommendations.iter_mut().filter(|r| {
            r.document_id == document_id
                && r.section_id == section_id
                && matches_source(r, label, source)
        }) {
            rec.annotation_id = Some(annotation_id.to_string());
        }
        Ok(())
    }

    async fn delete_recommendation_by_annotation(
        &self,
        document_id: i64,
        annotation_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.recommendations.retain(|r| {
            !(r.document_id == document_id && r.annotation_id.as_deref() == Some(annotation_id))
        });
        Ok(())
    }

    async fn purge_flagged(&self, document_id: i64) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();

        let linked: Vec<String> = inner
            .recommendations
            .iter()
            .filter(|r| r.document_id == document_id && r.deletion_flag)
            .filter_map(|r| r.annotation_id.clone())
            .collect();

        inner.annotations.retain(|a| {
            !(a.document_id == document_id
                && a.is_recommendation
                && linked.contains(&a.annotation_id))
        });

        let before = inner.recommendations.len();
        inner
            .recommendations
            .retain(|r| !(r.document_id == document_id && r.deletion_flag));
        Ok((before - inner.recommendations.len()) as u64)
    }
}

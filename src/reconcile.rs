//! Recommendation Reconciler.
//!
//! The only writer of annotation/recommendation state. Candidate
//! suggestion sets — rule-derived or model-derived — are diffed against
//! the persisted recommendations for the same (document, label, source):
//! new sections are inserted, vanished sections are flagged for deletion,
//! untouched sections stay put, so regenerating the same set twice is a
//! no-op. The annotation sync pass then makes the annotation table match:
//! flagged recommendations and their annotations are purged atomically,
//! and unrealized recommendations are materialized into machine
//! annotations — unless a human annotation already covers the same
//! (section, label), which a machine suggestion must never shadow.
//!
//! The workflow functions at the bottom are the surface exposed upward:
//! rule refresh, model refresh, withdraw, accept. Each returns typed
//! outcome counts rather than signaling through shared state.

use std::collections::{BTreeMap, BTreeSet};

use rand::RngExt;
use tracing::{info, warn};

use crate::config::TrainerConfig;
use crate::error::{Error, Result};
use crate::explain;
use crate::index::SearchIndex;
use crate::models::{NewAnnotation, NewRecommendation, RecommendationSource};
use crate::rules;
use crate::store::SpanStore;
use crate::trainer::{self, ModelCandidates, RetrainOutcome};

/// Character width of the separator between sections of one group.
const SECTION_SEPARATOR_CHARS: i64 = 2;

/// A freshly computed suggestion set for one label.
///
/// The two sources carry different payloads: only rule hits have an index
/// highlight, only model hits have a graded confidence and explanation.
pub enum CandidateSet {
    /// section id → match highlight.
    Rule(BTreeMap<i64, String>),
    /// section id → (probability, critical words).
    Model(ModelCandidates),
}

impl CandidateSet {
    fn source(&self) -> RecommendationSource {
        match self {
            Self::Rule(_) => RecommendationSource::Rule,
            Self::Model(_) => RecommendationSource::Model,
        }
    }

    fn section_ids(&self) -> BTreeSet<i64> {
        match self {
            Self::Rule(map) => map.keys().copied().collect(),
            Self::Model(map) => map.keys().copied().collect(),
        }
    }
}

/// Counts from one reconcile diff.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileOutcome {
    pub added: usize,
    pub retired: usize,
    pub unchanged: usize,
}

/// Counts from one annotation sync pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncOutcome {
    /// Flagged recommendations removed together with their annotations.
    pub purged: u64,
    /// New machine annotations written.
    pub materialized: usize,
    /// Recommendations resolved against an existing human annotation
    /// without writing anything.
    pub resolved_against_human: usize,
}

/// The reconciliation engine for one store.
pub struct Reconciler<'a> {
    store: &'a dyn SpanStore,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn SpanStore) -> Self {
        Self { store }
    }

    /// Diff a candidate set against the persisted recommendations for
    /// (document, label, source) and stage the difference.
    ///
    /// Additions are inserted behind a per-row existence check — a
    /// best-effort guard against duplicate insertion under racing
    /// writers, not a transactional guarantee. Removals are only flagged;
    /// physical deletion is deferred to [`Reconciler::sync_annotations`]
    /// so a removal and its annotation deletion take effect together.
    pub async fn reconcile(
        &self,
        document_id: i64,
        label: &str,
        candidates: &CandidateSet,
    ) -> Result<ReconcileOutcome> {
        let source = candidates.source();
        let existing: BTreeSet<i64> = self
            .store
            .recommended_section_ids(document_id, label, source)
            .await?
            .into_iter()
            .collect();
        let fresh = candidates.section_ids();

        let to_add: Vec<i64> = fresh.difference(&existing).copied().collect();
        let to_retire: Vec<i64> = existing.difference(&fresh).copied().collect();
        let unchanged = fresh.intersection(&existing).count();

        let mut outcome = ReconcileOutcome {
            unchanged,
            ..Default::default()
        };

        for section_id in to_add {
            if self
                .store
                .recommendation_exists(document_id, section_id, label, source)
                .await?
            {
                continue;
            }

            let (confidence, highlight) = match candidates {
                CandidateSet::Rule(map) => (1.0, map.get(&section_id).cloned()),
                CandidateSet::Model(map) => {
                    let candidate = &map[&section_id];
                    (
                        candidate.probability,
                        Some(explain::render(&candidate.critical_words)),
                    )
                }
            };

            self.store
                .insert_recommendation(&NewRecommendation {
                    document_id,
                    section_id,
                    label: label.to_string(),
                    source,
                    confidence,
                    highlight,
                })
                .await?;
            outcome.added += 1;
        }

        for section_id in to_retire {
            self.store
                .flag_recommendation(document_id, section_id, label, source)
                .await?;
            outcome.retired += 1;
        }

        info!(
            document_id,
            label,
            source = source.as_str(),
            added = outcome.added,
            retired = outcome.retired,
            unchanged = outcome.unchanged,
            "reconciled candidate set"
        );
        Ok(outcome)
    }

    /// Make the annotation table match the recommendation table.
    ///
    /// Runs after every reconcile and is also callable standalone. First
    /// the flagged rows and their linked annotations are purged in one
    /// atomic store operation, then every unrealized recommendation is
    /// materialized: span offsets are computed from the section's
    /// (conversation, attribute) group, an annotation id is synthesized,
    /// and the machine annotation is inserted — unless a human annotation
    /// already covers the (section, label), in which case the
    /// recommendation is only stamped resolved.
    pub async fn sync_annotations(&self, document_id: i64) -> Result<SyncOutcome> {
        let purged = self.store.purge_flagged(document_id).await?;

        let pending = self.store.unrealized_recommendations(document_id).await?;
        let mut outcome = SyncOutcome {
            purged,
            ..Default::default()
        };

        for rec in pending {
            let Some(section) = self.store.section(document_id, rec.section_id).await? else {
                warn!(
                    document_id,
                    section_id = rec.section_id,
                    "recommendation points at a missing section, skipping"
                );
                continue;
            };

            let group = self
                .store
                .section_group(document_id, &section.conversation, &section.attribute)
                .await?;

            // Earlier sections of the group push the span right; each one
            // contributes its text plus the separator.
            let mut start: i64 = 0;
            for earlier in group.iter().filter(|s| s.id < section.id) {
                start += earlier.text.chars().count() as i64 + SECTION_SEPARATOR_CHARS;
            }
            let length = section.text.chars().count() as i64;

            let annotation_id =
                synthesize_annotation_id(&section.conversation, &section.attribute, start, length);
            let label = rec.label().to_string();

            if self
                .store
                .human_annotation_exists(document_id, rec.section_id, &label)
                .await?
            {
                outcome.resolved_against_human += 1;
            } else {
                self.store
                    .insert_annotation(&NewAnnotation {
                        document_id,
                        annotation_id: annotation_id.clone(),
                        conversation: section.conversation.clone(),
                        attribute: section.attribute.clone(),
                        start,
                        length,
                        text: section.text.clone(),
                        label: label.clone(),
                        is_recommendation: true,
                        section_id: rec.section_id,
                        match_highlight: rec.highlight.clone(),
                        confidence: Some(rec.confidence),
                    })
                    .await?;
                outcome.materialized += 1;
            }

            // Stamped either way: with a human annotation present the
            // stamp records which span superseded the suggestion.
            self.store
                .stamp_recommendation(
                    document_id,
                    rec.section_id,
                    &label,
                    rec.source(),
                    &annotation_id,
                )
                .await?;
        }

        info!(
            document_id,
            purged = outcome.purged,
            materialized = outcome.materialized,
            resolved_against_human = outcome.resolved_against_human,
            "annotation sync pass done"
        );
        Ok(outcome)
    }
}

/// Human-readable span id: conversation initial, attribute initial, start,
/// length, random suffix. Collision-tolerant, not guaranteed unique.
fn synthesize_annotation_id(conversation: &str, attribute: &str, start: i64, length: i64) -> String {
    let initial = |s: &str| s.chars().next().unwrap_or('x');
    let suffix: u32 = rand::rng().random_range(0..10_000);
    format!(
        "{}-{}-{}-{}-{}",
        initial(conversation),
        initial(attribute),
        start,
        length,
        suffix
    )
}

// ============ Workflows ============

/// Combined counts from a refresh workflow.
#[derive(Debug, Clone, Copy)]
pub struct RefreshOutcome {
    pub reconcile: ReconcileOutcome,
    pub sync: SyncOutcome,
}

/// Outcome of a model refresh, which may legitimately do nothing.
#[derive(Debug)]
pub enum ModelRefreshOutcome {
    /// Retraining was infeasible; nothing changed.
    Skipped(&'static str),
    Completed {
        reconciled_labels: usize,
        added: usize,
        retired: usize,
        sync: SyncOutcome,
    },
}

/// Evaluate a label's stored code rule and reconcile the hits.
pub async fn refresh_rule_recommendations(
    store: &dyn SpanStore,
    index: &dyn SearchIndex,
    document_id: i64,
    label: &str,
    limit: Option<i64>,
) -> Result<RefreshOutcome> {
    let stored = label_or_err(store, document_id, label).await?;
    let Some(rule) = stored.code_rule else {
        return Err(Error::QuerySyntax(format!(
            "label '{label}' has no stored code rule"
        )));
    };

    let hits = rules::search(index, document_id, &rule, limit).await?;
    let candidates: BTreeMap<i64, String> = hits
        .into_iter()
        .map(|hit| (hit.section_id, hit.highlight))
        .collect();

    let reconciler = Reconciler::new(store);
    let reconcile = reconciler
        .reconcile(document_id, label, &CandidateSet::Rule(candidates))
        .await?;
    let sync = reconciler.sync_annotations(document_id).await?;
    store
        .touch_document(document_id, chrono::Utc::now().timestamp())
        .await?;

    Ok(RefreshOutcome { reconcile, sync })
}

/// Retrain the document classifier and reconcile its suggestions.
///
/// A `Flush` round (zero correct spies) retires every existing model
/// recommendation instead of adding anything.
pub async fn refresh_model_recommendations(
    store: &dyn SpanStore,
    document_id: i64,
    include_rule_recommendations: bool,
    cfg: &TrainerConfig,
    default_language: &str,
) -> Result<ModelRefreshOutcome> {
    let outcome = trainer::retrain(
        store,
        document_id,
        include_rule_recommendations,
        cfg,
        default_language,
    )
    .await?;

    let reconciler = Reconciler::new(store);
    let result = match outcome {
        RetrainOutcome::Skipped(reason) => return Ok(ModelRefreshOutcome::Skipped(reason)),
        RetrainOutcome::Flush => {
            let labels = store.labels_with_model_recommendations(document_id).await?;
            let mut retired = 0;
            for label in &labels {
                let o = reconciler
                    .reconcile(
                        document_id,
                        label,
                        &CandidateSet::Model(ModelCandidates::new()),
                    )
                    .await?;
                retired += o.retired;
            }
            let sync = reconciler.sync_annotations(document_id).await?;
            ModelRefreshOutcome::Completed {
                reconciled_labels: labels.len(),
                added: 0,
                retired,
                sync,
            }
        }
        RetrainOutcome::Suggestions(map) => {
            let mut added = 0;
            let mut retired = 0;
            let reconciled_labels = map.len();
            for (label, candidates) in map {
                let o = reconciler
                    .reconcile(document_id, &label, &CandidateSet::Model(candidates))
                    .await?;
                added += o.added;
                retired += o.retired;
            }
            let sync = reconciler.sync_annotations(document_id).await?;
            ModelRefreshOutcome::Completed {
                reconciled_labels,
                added,
                retired,
                sync,
            }
        }
    };

    store
        .touch_document(document_id, chrono::Utc::now().timestamp())
        .await?;
    Ok(result)
}

/// Flag every model suggestion for removal and sync.
pub async fn withdraw_model_recommendations(
    store: &dyn SpanStore,
    document_id: i64,
) -> Result<SyncOutcome> {
    let flagged = store.flag_model_recommendations(document_id).await?;
    info!(document_id, flagged, "withdrawing model recommendations");

    let sync = Reconciler::new(store).sync_annotations(document_id).await?;
    store
        .touch_document(document_id, chrono::Utc::now().timestamp())
        .await?;
    Ok(sync)
}

/// Accept a machine suggestion: the annotation becomes a human one and its
/// recommendation row is dropped.
pub async fn accept_recommendation(
    store: &dyn SpanStore,
    document_id: i64,
    annotation_id: &str,
) -> Result<()> {
    store.promote_annotation(document_id, annotation_id).await?;
    store
        .delete_recommendation_by_annotation(document_id, annotation_id)
        .await?;
    store
        .touch_document(document_id, chrono::Utc::now().timestamp())
        .await?;
    info!(document_id, annotation_id, "suggestion accepted");
    Ok(())
}

async fn label_or_err(
    store: &dyn SpanStore,
    document_id: i64,
    label: &str,
) -> Result<crate::models::Label> {
    store
        .label(document_id, label)
        .await?
        .ok_or_else(|| Error::Store(anyhow::anyhow!("no such label: {label}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewSection;
    use crate::store::memory::MemorySpanStore;

    fn rule_set(entries: &[(i64, &str)]) -> CandidateSet {
        CandidateSet::Rule(
            entries
                .iter()
                .map(|(id, h)| (*id, h.to_string()))
                .collect(),
        )
    }

    async fn seeded(store: &MemorySpanStore) -> (i64, Vec<i64>) {
        let doc = store.create_document("interview", Some("en")).await.unwrap();
        let sections = vec![
            NewSection {
                conversation: "c1".into(),
                attribute: "q1".into(),
                text: "Hello there.".into(), // 12 chars
            },
            NewSection {
                conversation: "c1".into(),
                attribute: "q1".into(),
                text: "Second bit.".into(), // 11 chars
            },
            NewSection {
                conversation: "c1".into(),
                attribute: "q1".into(),
                text: "Third section here.".into(), // 19 chars
            },
        ];
        let inserted = store.insert_sections(doc, &sections).await.unwrap();
        (doc, inserted.iter().map(|s| s.id).collect())
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let store = MemorySpanStore::new();
        let (doc, ids) = seeded(&store).await;
        let reconciler = Reconciler::new(&store);

        let set = rule_set(&[(ids[0], ">>>Hello<<<"), (ids[1], ">>>Second<<<")]);
        let first = reconciler.reconcile(doc, "greeting", &set).await.unwrap();
        assert_eq!((first.added, first.retired), (2, 0));

        let second = reconciler.reconcile(doc, "greeting", &set).await.unwrap();
        assert_eq!((second.added, second.retired), (0, 0));
        assert_eq!(second.unchanged, 2);
    }

    #[tokio::test]
    async fn vanished_candidates_are_flagged_then_purged() {
        let store = MemorySpanStore::new();
        let (doc, ids) = seeded(&store).await;
        let reconciler = Reconciler::new(&store);

        let both = rule_set(&[(ids[0], "a"), (ids[1], "b")]);
        reconciler.reconcile(doc, "greeting", &both).await.unwrap();
        reconciler.sync_annotations(doc).await.unwrap();
        assert_eq!(store.annotations(doc).await.unwrap().len(), 2);

        let only_second = rule_set(&[(ids[1], "b")]);
        let diff = reconciler
            .reconcile(doc, "greeting", &only_second)
            .await
            .unwrap();
        assert_eq!((diff.added, diff.retired), (0, 1));

        let sync = reconciler.sync_annotations(doc).await.unwrap();
        assert_eq!(sync.purged, 1);

        let remaining = store.annotations(doc).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].section_id, ids[1]);
        assert_eq!(
            store
                .recommended_section_ids(doc, "greeting", RecommendationSource::Rule)
                .await
                .unwrap(),
            vec![ids[1]]
        );
    }

    #[tokio::test]
    async fn sync_computes_group_offsets() {
        let store = MemorySpanStore::new();
        let (doc, ids) = seeded(&store).await;
        let reconciler = Reconciler::new(&store);

        reconciler
            .reconcile(doc, "position", &rule_set(&[(ids[2], "hit")]))
            .await
            .unwrap();
        let sync = reconciler.sync_annotations(doc).await.unwrap();
        assert_eq!(sync.materialized, 1);

        let annotations = store.annotations(doc).await.unwrap();
        let a = &annotations[0];
        // 12 + 2 + 11 + 2 preceding characters.
        assert_eq!(a.start, 27);
        assert_eq!(a.length, 19);
        assert!(a.is_recommendation);
        assert_eq!(a.confidence, Some(1.0));
        assert!(a.annotation_id.starts_with("c-q-27-19-"));
    }

    #[tokio::test]
    async fn human_annotation_is_never_shadowed() {
        let store = MemorySpanStore::new();
        let (doc, ids) = seeded(&store).await;

        store
            .insert_annotation(&NewAnnotation {
                document_id: doc,
                annotation_id: "c-q-0-12-1".into(),
                conversation: "c1".into(),
                attribute: "q1".into(),
                start: 0,
                length: 12,
                text: "Hello there.".into(),
                label: "greeting".into(),
                is_recommendation: false,
                section_id: ids[0],
                match_highlight: None,
                confidence: None,
            })
            .await
            .unwrap();

        let reconciler = Reconciler::new(&store);
        reconciler
            .reconcile(doc, "greeting", &rule_set(&[(ids[0], "hit")]))
            .await
            .unwrap();
        let sync = reconciler.sync_annotations(doc).await.unwrap();
        assert_eq!(sync.materialized, 0);
        assert_eq!(sync.resolved_against_human, 1);

        // Exactly the one human annotation remains, and the
        // recommendation is stamped resolved.
        let annotations = store.annotations(doc).await.unwrap();
        assert_eq!(annotations.len(), 1);
        assert!(!annotations[0].is_recommendation);
        assert!(store
            .unrealized_recommendations(doc)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn model_candidates_carry_probability_and_explanation() {
        let store = MemorySpanStore::new();
        let (doc, ids) = seeded(&store).await;
        let reconciler = Reconciler::new(&store);

        let mut candidates = ModelCandidates::new();
        candidates.insert(
            ids[0],
            trainer::ModelCandidate {
                probability: 0.83,
                critical_words: vec!["Hello".into()],
            },
        );
        reconciler
            .reconcile(doc, "greeting", &CandidateSet::Model(candidates))
            .await
            .unwrap();
        reconciler.sync_annotations(doc).await.unwrap();

        let annotations = store.annotations(doc).await.unwrap();
        assert_eq!(annotations[0].confidence, Some(0.83));
        assert_eq!(annotations[0].match_highlight.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn empty_explanations_render_the_sentinel() {
        let store = MemorySpanStore::new();
        let (doc, ids) = seeded(&store).await;
        let reconciler = Reconciler::new(&store);

        let mut candidates = ModelCandidates::new();
        candidates.insert(
            ids[0],
            trainer::ModelCandidate {
                probability: 0.6,
                critical_words: Vec::new(),
            },
        );
        reconciler
            .reconcile(doc, "greeting", &CandidateSet::Model(candidates))
            .await
            .unwrap();
        reconciler.sync_annotations(doc).await.unwrap();

        let annotations = store.annotations(doc).await.unwrap();
        assert_eq!(
            annotations[0].match_highlight.as_deref(),
            Some(explain::NO_CRITICAL_WORDS)
        );
    }

    #[tokio::test]
    async fn accept_promotes_and_drops_recommendation() {
        let store = MemorySpanStore::new();
        let (doc, ids) = seeded(&store).await;
        let reconciler = Reconciler::new(&store);

        reconciler
            .reconcile(doc, "greeting", &rule_set(&[(ids[0], "hit")]))
            .await
            .unwrap();
        reconciler.sync_annotations(doc).await.unwrap();

        let annotation_id = store.annotations(doc).await.unwrap()[0].annotation_id.clone();
        accept_recommendation(&store, doc, &annotation_id)
            .await
            .unwrap();

        let annotations = store.annotations(doc).await.unwrap();
        assert!(!annotations[0].is_recommendation);
        assert_eq!(annotations[0].confidence, None);
        assert!(store
            .recommended_section_ids(doc, "greeting", RecommendationSource::Rule)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn withdraw_spares_rule_recommendations() {
        let store = MemorySpanStore::new();
        let (doc, ids) = seeded(&store).await;
        let reconciler = Reconciler::new(&store);

        reconciler
            .reconcile(doc, "greeting", &rule_set(&[(ids[0], "hit")]))
            .await
            .unwrap();
        let mut candidates = ModelCandidates::new();
        candidates.insert(
            ids[1],
            trainer::ModelCandidate {
                probability: 0.7,
                critical_words: vec!["Second".into()],
            },
        );
        reconciler
            .reconcile(doc, "speed", &CandidateSet::Model(candidates))
            .await
            .unwrap();
        reconciler.sync_annotations(doc).await.unwrap();
        assert_eq!(store.annotations(doc).await.unwrap().len(), 2);

        let sync = withdraw_model_recommendations(&store, doc).await.unwrap();
        assert_eq!(sync.purged, 1);

        let annotations = store.annotations(doc).await.unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].label, "greeting");
        assert_eq!(
            store
                .recommended_section_ids(doc, "speed", RecommendationSource::Model)
                .await
                .unwrap(),
            Vec::<i64>::new()
        );
    }

    #[tokio::test]
    async fn flush_round_retires_existing_model_recommendations() {
        let store = MemorySpanStore::new();
        let doc = store.create_document("interview", Some("en")).await.unwrap();

        // Identical shapes so training is feasible; every label is the
        // placeholder, which forces a flush round.
        let texts = [
            "the budget meeting",
            "the budget meeting",
            "the budget meeting",
            "the team was slow",
            "the team was slow",
            "the team was slow",
            "the team was slow",
        ];
        let sections: Vec<NewSection> = texts
            .iter()
            .map(|t| NewSection {
                conversation: "c1".into(),
                attribute: "q1".into(),
                text: (*t).into(),
            })
            .collect();
        let ids: Vec<i64> = store
            .insert_sections(doc, &sections)
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        for &i in &[3usize, 4, 5] {
            store
                .insert_annotation(&NewAnnotation {
                    document_id: doc,
                    annotation_id: format!("c-q-{i}-0-0"),
                    conversation: "c1".into(),
                    attribute: "q1".into(),
                    start: 0,
                    length: texts[i].chars().count() as i64,
                    text: texts[i].into(),
                    label: "default".into(),
                    is_recommendation: false,
                    section_id: ids[i],
                    match_highlight: None,
                    confidence: None,
                })
                .await
                .unwrap();
        }

        // A stale model recommendation from an earlier round.
        let reconciler = Reconciler::new(&store);
        let mut candidates = ModelCandidates::new();
        candidates.insert(
            ids[6],
            trainer::ModelCandidate {
                probability: 0.7,
                critical_words: vec!["slow".into()],
            },
        );
        reconciler
            .reconcile(doc, "speed", &CandidateSet::Model(candidates))
            .await
            .unwrap();
        reconciler.sync_annotations(doc).await.unwrap();
        assert_eq!(store.annotations(doc).await.unwrap().len(), 4);

        let cfg = TrainerConfig {
            seed: Some(5),
            ..TrainerConfig::default()
        };
        let outcome = refresh_model_recommendations(&store, doc, false, &cfg, "en")
            .await
            .unwrap();
        let ModelRefreshOutcome::Completed { retired, sync, .. } = outcome else {
            panic!("expected completed flush round");
        };
        assert_eq!(retired, 1);
        assert_eq!(sync.purged, 1);
        // Only the three human annotations survive.
        let annotations = store.annotations(doc).await.unwrap();
        assert_eq!(annotations.len(), 3);
        assert!(annotations.iter().all(|a| !a.is_recommendation));
    }
}

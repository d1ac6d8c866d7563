//! Semi-Supervised Label Trainer.
//!
//! Builds a document-local classifier from confirmed annotations and
//! scores every unannotated section, calibrating the acceptance cutoff
//! with a spy holdout: the minimum probability with which a held-out
//! known-correct example was assigned its own label. Qualitative coding
//! corpora have no explicit negative class, so unlabeled sections the
//! coder already passed over (sequence id below the last human annotation)
//! are drafted as artificial negatives under the reserved `greygoo` class.
//!
//! Everything is retrained from scratch on each call — no incremental
//! state survives between runs.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngExt, SeedableRng};
use tracing::{debug, info};

use crate::classifier::{SgdClassifier, SgdSettings};
use crate::config::TrainerConfig;
use crate::error::Result;
use crate::explain;
use crate::language;
use crate::store::SpanStore;
use crate::tfidf::TfidfVectorizer;

/// Reserved sentinel class: "no relevant code applies".
pub const NEGATIVE_CLASS: &str = "greygoo";

/// Placeholder label that never contributes to cutoff calibration.
const PLACEHOLDER_LABEL: &str = "default";

/// A scored suggestion for one section.
#[derive(Debug, Clone)]
pub struct ModelCandidate {
    pub probability: f64,
    pub critical_words: Vec<String>,
}

/// Candidate suggestions for one label, keyed by section id.
pub type ModelCandidates = BTreeMap<i64, ModelCandidate>;

/// Result of a retraining round.
#[derive(Debug)]
pub enum RetrainOutcome {
    /// Training was infeasible (logged reason); nothing changed.
    Skipped(&'static str),
    /// No spy was predicted correctly: existing model recommendations for
    /// the document must be retired, no new suggestions are made.
    Flush,
    /// Per-label candidate suggestion sets, ready for reconciliation.
    Suggestions(BTreeMap<String, ModelCandidates>),
}

/// A fitted TF-IDF + classifier pipeline.
pub struct LabelModel {
    vectorizer: TfidfVectorizer,
    classifier: SgdClassifier,
}

impl LabelModel {
    /// Predicted label and its probability for a span text.
    pub fn predict(&self, text: &str) -> (String, f64) {
        let row = self.vectorizer.transform(text);
        let (index, probability) = self.classifier.predict(&row);
        (self.classifier.classes()[index].clone(), probability)
    }
}

/// Retrain the document's classifier and produce candidate suggestions.
///
/// Positives are human annotations, plus rule-derived machine annotations
/// (confidence 1) when `include_rule_recommendations` — model-derived
/// annotations are never fed back, to prevent self-supporting suggestion
/// loops.
pub async fn retrain(
    store: &dyn SpanStore,
    document_id: i64,
    include_rule_recommendations: bool,
    cfg: &TrainerConfig,
    default_language: &str,
) -> Result<RetrainOutcome> {
    info!(document_id, include_rule_recommendations, "retraining");

    let confirmed = store
        .confirmed_annotations(document_id, include_rule_recommendations)
        .await?;
    if confirmed.is_empty() {
        info!(document_id, "retrain skipped: no confirmed annotations");
        return Ok(RetrainOutcome::Skipped("no confirmed annotations"));
    }

    let sections = store.sections(document_id).await?;
    let labeled_section_ids: HashSet<i64> = confirmed.iter().map(|a| a.section_id).collect();
    let labeled: Vec<(String, String)> = confirmed
        .iter()
        .map(|a| (a.text.clone(), a.label.clone()))
        .collect();

    // The unlabeled pool: every section with no confirmed annotation.
    let unlabeled: Vec<_> = sections
        .iter()
        .filter(|s| !labeled_section_ids.contains(&s.id))
        .collect();

    // Sections the coder already passed over without labeling are assumed
    // irrelevant. The cutoff is the document-global last human annotation.
    let last_human_section = confirmed
        .iter()
        .filter(|a| !a.is_recommendation)
        .map(|a| a.section_id)
        .max();
    let Some(last_human_section) = last_human_section else {
        info!(document_id, "retrain skipped: no human annotation to anchor negatives");
        return Ok(RetrainOutcome::Skipped("no human annotation"));
    };
    let negatives: Vec<(String, String)> = unlabeled
        .iter()
        .filter(|s| s.id < last_human_section)
        .map(|s| (s.text.clone(), NEGATIVE_CLASS.to_string()))
        .collect();
    debug!(
        document_id,
        unlabeled = unlabeled.len(),
        negatives = negatives.len(),
        "partitioned sections"
    );

    let mut rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::seed_from_u64(rand::rng().random()),
    };

    // Two independent spy splits. Real spies come from the labeled set
    // only; artificial negatives get their own split so calibration never
    // tests on synthetic spies.
    let Some((labeled_train, labeled_spies)) = spy_split(&labeled, cfg.spy_fraction, &mut rng)
    else {
        info!(document_id, "retrain skipped: labeled sample too small for spy split");
        return Ok(RetrainOutcome::Skipped("labeled sample too small"));
    };
    let Some((negative_train, negative_spies)) = spy_split(&negatives, cfg.spy_fraction, &mut rng)
    else {
        info!(document_id, "retrain skipped: negative sample too small for spy split");
        return Ok(RetrainOutcome::Skipped("negative sample too small"));
    };
    debug!(
        spies = labeled_spies.len(),
        negative_spies = negative_spies.len(),
        train = labeled_train.len() + negative_train.len(),
        "spy splits done"
    );

    let language = language::resolve(store, document_id, default_language).await?;

    // Fit the TF-IDF + SGD pipeline on the remaining rows.
    let mut train_rows: Vec<(String, String)> = labeled_train;
    train_rows.extend(negative_train);

    let texts: Vec<String> = train_rows.iter().map(|(t, _)| t.clone()).collect();
    let vectorizer = TfidfVectorizer::fit(&texts, &language, cfg.min_df);

    let mut classes: Vec<String> = train_rows.iter().map(|(_, l)| l.clone()).collect();
    classes.sort();
    classes.dedup();
    let class_index = |label: &str| classes.iter().position(|c| c == label).unwrap_or(0);

    let rows: Vec<_> = texts.iter().map(|t| vectorizer.transform(t)).collect();
    let targets: Vec<usize> = train_rows.iter().map(|(_, l)| class_index(l)).collect();
    let classifier = SgdClassifier::fit(
        &rows,
        &targets,
        classes,
        vectorizer.n_features(),
        SgdSettings {
            epochs: cfg.epochs,
            alpha: cfg.alpha,
            l1_ratio: cfg.l1_ratio,
        },
        &mut rng,
    );
    let model = LabelModel {
        vectorizer,
        classifier,
    };

    // Calibrate: collect the probability of every correctly-predicted real
    // spy, and track which labels were ever predicted wrongly.
    let mut proba_correct = Vec::new();
    let mut confident_labels: BTreeSet<String> = BTreeSet::new();
    let mut unconfident_labels: BTreeSet<String> = BTreeSet::new();

    for (text, true_label) in &labeled_spies {
        let (predicted, probability) = model.predict(text);
        if &predicted == true_label {
            if true_label != PLACEHOLDER_LABEL {
                proba_correct.push(probability);
                confident_labels.insert(predicted);
            }
        } else {
            unconfident_labels.insert(predicted);
        }
    }

    let negative_spies_correct = negative_spies
        .iter()
        .filter(|(text, _)| model.predict(text).0 == NEGATIVE_CLASS)
        .count();
    debug!(
        correct = proba_correct.len(),
        of = labeled_spies.len(),
        negative_correct = negative_spies_correct,
        of_negative = negative_spies.len(),
        "spy evaluation"
    );

    if proba_correct.is_empty() {
        info!(
            document_id,
            "no spy predicted correctly: flushing model recommendations"
        );
        return Ok(RetrainOutcome::Flush);
    }

    let cutoff = proba_correct.iter().copied().fold(f64::INFINITY, f64::min);
    // Zero false-positive tolerance: one wrong spy prediction bans a label
    // from this round entirely, trading recall for precision.
    let perfect: BTreeSet<String> = confident_labels
        .difference(&unconfident_labels)
        .cloned()
        .collect();
    info!(cutoff, perfect = ?perfect, "spy calibration done");

    // Score the whole unlabeled pool.
    let mut suggestions: BTreeMap<String, ModelCandidates> = BTreeMap::new();
    let mut below_cutoff = 0usize;
    for section in &unlabeled {
        let (predicted, probability) = model.predict(&section.text);
        if probability < cutoff {
            below_cutoff += 1;
            continue;
        }
        if predicted == NEGATIVE_CLASS || !perfect.contains(&predicted) {
            continue;
        }

        let critical = explain::critical_words(
            |reduced| model.predict(reduced).0,
            &section.text,
            &predicted,
            &language,
            cfg.max_combination_size,
        );
        suggestions.entry(predicted).or_default().insert(
            section.id,
            ModelCandidate {
                probability,
                critical_words: critical,
            },
        );
    }

    let total: usize = suggestions.values().map(|c| c.len()).sum();
    info!(
        document_id,
        total,
        labels = suggestions.len(),
        below_cutoff,
        "retraining produced suggestions"
    );
    Ok(RetrainOutcome::Suggestions(suggestions))
}

/// Hold out a random `fraction` (at least one element) as spies.
///
/// `None` when the split is infeasible: both halves must end up non-empty.
fn spy_split<T: Clone>(
    items: &[T],
    fraction: f64,
    rng: &mut StdRng,
) -> Option<(Vec<T>, Vec<T>)> {
    let n_spies = ((items.len() as f64) * fraction).ceil().max(1.0) as usize;
    if n_spies >= items.len() {
        return None;
    }
    let mut shuffled = items.to_vec();
    shuffled.shuffle(rng);
    let spies = shuffled.split_off(shuffled.len() - n_spies);
    Some((shuffled, spies))
}

//! End-to-end tests driving the engine against real SQLite databases.

use std::path::PathBuf;

use tempfile::TempDir;

use qoda::config::{Config, DbConfig, LanguageConfig, SuggestionConfig, TrainerConfig};
use qoda::db;
use qoda::error::Error;
use qoda::index::{Fts5Index, SearchIndex};
use qoda::migrate;
use qoda::models::{NewAnnotation, NewSection, RecommendationSource, SeedDocument, SeedLabel};
use qoda::reconcile::{self, ModelRefreshOutcome, Reconciler};
use qoda::rules;
use qoda::seed;
use qoda::store::sqlite::SqliteSpanStore;
use qoda::store::SpanStore;

fn test_config(dir: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: dir.path().join("qoda.sqlite"),
        },
        suggestion: SuggestionConfig::default(),
        trainer: TrainerConfig {
            seed: Some(23),
            ..TrainerConfig::default()
        },
        language: LanguageConfig::default(),
    }
}

async fn setup() -> (TempDir, Config, SqliteSpanStore, Fts5Index) {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    migrate::run_migrations(&cfg).await.unwrap();
    let pool = db::connect(&cfg).await.unwrap();
    let store = SqliteSpanStore::new(pool.clone());
    let index = Fts5Index::new(pool);
    (dir, cfg, store, index)
}

fn section(text: &str) -> NewSection {
    NewSection {
        conversation: "c1".to_string(),
        attribute: "q1".to_string(),
        text: text.to_string(),
    }
}

fn speed_seed() -> SeedDocument {
    SeedDocument {
        name: "interview-1".to_string(),
        language: Some("en".to_string()),
        sections: vec![section("The team was slow."), section("The team was fast.")],
        labels: vec![SeedLabel {
            name: "speed".to_string(),
            color: "#ff0000".to_string(),
            code_rule: Some("team AND (slow* OR fast*)".to_string()),
        }],
    }
}

fn human(document_id: i64, section_id: i64, text: &str, label: &str) -> NewAnnotation {
    NewAnnotation {
        document_id,
        annotation_id: format!("c-q-h{section_id}-0-0"),
        conversation: "c1".to_string(),
        attribute: "q1".to_string(),
        start: 0,
        length: text.chars().count() as i64,
        text: text.to_string(),
        label: label.to_string(),
        is_recommendation: false,
        section_id,
        match_highlight: None,
        confidence: None,
    }
}

#[tokio::test]
async fn rule_scenario_materializes_machine_annotations() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();

    // Both sections match the rule.
    let hits = rules::search(&index, doc, "team AND (slow* OR fast*)", None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.highlight.contains(">>>")));

    let outcome = reconcile::refresh_rule_recommendations(&store, &index, doc, "speed", None)
        .await
        .unwrap();
    assert_eq!(outcome.reconcile.added, 2);
    assert_eq!(outcome.sync.materialized, 2);

    let annotations = store.annotations(doc).await.unwrap();
    assert_eq!(annotations.len(), 2);
    for a in &annotations {
        assert!(a.is_recommendation);
        assert_eq!(a.label, "speed");
        assert_eq!(a.confidence, Some(1.0));
        assert_eq!(a.length, a.text.chars().count() as i64);
    }
    // The second section's span starts after the first plus the separator.
    let mut starts: Vec<i64> = annotations.iter().map(|a| a.start).collect();
    starts.sort();
    assert_eq!(starts, vec![0, 20]);
}

#[tokio::test]
async fn rule_refresh_is_idempotent() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();

    let first = reconcile::refresh_rule_recommendations(&store, &index, doc, "speed", None)
        .await
        .unwrap();
    assert_eq!(first.reconcile.added, 2);

    let second = reconcile::refresh_rule_recommendations(&store, &index, doc, "speed", None)
        .await
        .unwrap();
    assert_eq!(second.reconcile.added, 0);
    assert_eq!(second.reconcile.retired, 0);
    assert_eq!(second.reconcile.unchanged, 2);
    assert_eq!(store.annotations(doc).await.unwrap().len(), 2);
}

#[tokio::test]
async fn narrowed_rule_retires_without_trace() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();

    reconcile::refresh_rule_recommendations(&store, &index, doc, "speed", None)
        .await
        .unwrap();
    assert_eq!(store.annotations(doc).await.unwrap().len(), 2);

    // Narrow the rule so only one section matches; the other's
    // recommendation and annotation must disappear together.
    store
        .set_code_rule(doc, "speed", "team AND slow*")
        .await
        .unwrap();
    let outcome = reconcile::refresh_rule_recommendations(&store, &index, doc, "speed", None)
        .await
        .unwrap();
    assert_eq!(outcome.reconcile.retired, 1);
    assert_eq!(outcome.sync.purged, 1);

    let annotations = store.annotations(doc).await.unwrap();
    assert_eq!(annotations.len(), 1);
    assert!(annotations[0].text.contains("slow"));
    assert_eq!(
        store
            .recommended_section_ids(doc, "speed", RecommendationSource::Rule)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn limited_search_is_a_prefix_of_the_full_ranking() {
    let (_dir, cfg, store, index) = setup().await;
    let mut seed_doc = speed_seed();
    seed_doc.sections.push(section("The team was slow again."));
    seed_doc.sections.push(section("Nothing relevant here."));
    let doc = seed::run_seed(&cfg, &store, &index, &seed_doc)
        .await
        .unwrap();

    let all = rules::search(&index, doc, "team", None).await.unwrap();
    assert_eq!(all.len(), 3);
    let limited = rules::search(&index, doc, "team", Some(2)).await.unwrap();
    assert_eq!(limited.len(), 2);
    let all_ids: Vec<i64> = all.iter().map(|h| h.section_id).collect();
    let limited_ids: Vec<i64> = limited.iter().map(|h| h.section_id).collect();
    assert_eq!(&all_ids[..2], &limited_ids[..]);
    // Ranked by descending score.
    assert!(all.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn no_match_is_empty_not_an_error() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();
    let hits = rules::search(&index, doc, "zeppelin", None).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn malformed_rule_is_a_query_syntax_error() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();
    let result = rules::search(&index, doc, "team AND (slow*", None).await;
    assert!(matches!(result, Err(Error::QuerySyntax(_))));
}

#[tokio::test]
async fn indexes_are_isolated_per_document() {
    let (_dir, cfg, store, index) = setup().await;
    let doc_a = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();
    let mut other = speed_seed();
    other.name = "interview-2".to_string();
    other.sections = vec![section("A completely different topic.")];
    let doc_b = seed::run_seed(&cfg, &store, &index, &other).await.unwrap();

    let hits_a = rules::search(&index, doc_a, "team", None).await.unwrap();
    let hits_b = rules::search(&index, doc_b, "team", None).await.unwrap();
    assert_eq!(hits_a.len(), 2);
    assert!(hits_b.is_empty());
}

#[tokio::test]
async fn rebuilding_the_index_does_not_duplicate() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();
    let sections = store.sections(doc).await.unwrap();
    index.build_index(doc, &sections).await.unwrap();

    let hits = rules::search(&index, doc, "team", None).await.unwrap();
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn human_annotation_survives_rule_refresh() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();
    let sections = store.sections(doc).await.unwrap();

    store
        .insert_annotation(&human(doc, sections[0].id, &sections[0].text, "speed"))
        .await
        .unwrap();

    let outcome = reconcile::refresh_rule_recommendations(&store, &index, doc, "speed", None)
        .await
        .unwrap();
    // Both sections match; only the unannotated one materializes.
    assert_eq!(outcome.reconcile.added, 2);
    assert_eq!(outcome.sync.materialized, 1);
    assert_eq!(outcome.sync.resolved_against_human, 1);

    let annotations = store.annotations(doc).await.unwrap();
    let on_first: Vec<_> = annotations
        .iter()
        .filter(|a| a.section_id == sections[0].id)
        .collect();
    assert_eq!(on_first.len(), 1);
    assert!(!on_first[0].is_recommendation);
}

#[tokio::test]
async fn label_rename_cascades_everywhere() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();
    reconcile::refresh_rule_recommendations(&store, &index, doc, "speed", None)
        .await
        .unwrap();

    store.rename_label(doc, "speed", "pace").await.unwrap();

    assert!(store.label(doc, "speed").await.unwrap().is_none());
    assert!(store.label(doc, "pace").await.unwrap().is_some());
    assert!(store
        .annotations(doc)
        .await
        .unwrap()
        .iter()
        .all(|a| a.label == "pace"));
    assert_eq!(
        store
            .recommended_section_ids(doc, "pace", RecommendationSource::Rule)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn label_delete_removes_all_traces() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();
    reconcile::refresh_rule_recommendations(&store, &index, doc, "speed", None)
        .await
        .unwrap();

    store.delete_label(doc, "speed").await.unwrap();

    assert!(store.label(doc, "speed").await.unwrap().is_none());
    assert!(store.annotations(doc).await.unwrap().is_empty());
    assert!(store
        .recommended_section_ids(doc, "speed", RecommendationSource::Rule)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn retrain_suggests_and_accept_promotes() {
    let (_dir, cfg, store, index) = setup().await;

    // Three identically-shaped positives, three negatives before them, one
    // matching and one non-matching section after the last human span.
    let texts = [
        "the budget meeting",
        "the budget meeting",
        "the budget meeting",
        "the team was slow",
        "the team was slow",
        "the team was slow",
        "the team was slow",
        "the budget meeting",
    ];
    let seed_doc = SeedDocument {
        name: "interview-3".to_string(),
        language: Some("en".to_string()),
        sections: texts.iter().map(|t| section(t)).collect(),
        labels: vec![SeedLabel {
            name: "speed".to_string(),
            color: "#00ff00".to_string(),
            code_rule: None,
        }],
    };
    let doc = seed::run_seed(&cfg, &store, &index, &seed_doc)
        .await
        .unwrap();
    let sections = store.sections(doc).await.unwrap();
    for i in [3usize, 4, 5] {
        store
            .insert_annotation(&human(doc, sections[i].id, texts[i], "speed"))
            .await
            .unwrap();
    }

    let outcome =
        reconcile::refresh_model_recommendations(&store, doc, false, &cfg.trainer, "en")
            .await
            .unwrap();
    let ModelRefreshOutcome::Completed { added, sync, .. } = outcome else {
        panic!("expected suggestions");
    };
    assert_eq!(added, 1);
    assert_eq!(sync.materialized, 1);

    let machine: Vec<_> = store
        .annotations(doc)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.is_recommendation)
        .collect();
    assert_eq!(machine.len(), 1);
    let suggestion = &machine[0];
    assert_eq!(suggestion.label, "speed");
    assert_eq!(suggestion.section_id, sections[6].id);
    let confidence = suggestion.confidence.expect("graded confidence");
    assert!(confidence > 0.0 && confidence <= 1.0);
    assert!(suggestion.match_highlight.is_some());

    // Accepting turns it into a human annotation and drops the staging row.
    reconcile::accept_recommendation(&store, doc, &suggestion.annotation_id)
        .await
        .unwrap();
    let annotations = store.annotations(doc).await.unwrap();
    assert!(annotations.iter().all(|a| !a.is_recommendation));
    assert!(store
        .recommended_section_ids(doc, "speed", RecommendationSource::Model)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn retrain_skips_gracefully_on_tiny_documents() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();
    let sections = store.sections(doc).await.unwrap();
    store
        .insert_annotation(&human(doc, sections[0].id, &sections[0].text, "speed"))
        .await
        .unwrap();

    let outcome =
        reconcile::refresh_model_recommendations(&store, doc, false, &cfg.trainer, "en")
            .await
            .unwrap();
    assert!(matches!(outcome, ModelRefreshOutcome::Skipped(_)));
    // Nothing was written.
    assert_eq!(store.annotations(doc).await.unwrap().len(), 1);
}

#[tokio::test]
async fn withdraw_then_sync_leaves_rule_work_alone() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();
    reconcile::refresh_rule_recommendations(&store, &index, doc, "speed", None)
        .await
        .unwrap();
    assert_eq!(store.annotations(doc).await.unwrap().len(), 2);

    let outcome = reconcile::withdraw_model_recommendations(&store, doc)
        .await
        .unwrap();
    assert_eq!(outcome.purged, 0);
    assert_eq!(store.annotations(doc).await.unwrap().len(), 2);
}

#[tokio::test]
async fn standalone_sync_is_a_no_op_when_clean() {
    let (_dir, cfg, store, index) = setup().await;
    let doc = seed::run_seed(&cfg, &store, &index, &speed_seed())
        .await
        .unwrap();
    reconcile::refresh_rule_recommendations(&store, &index, doc, "speed", None)
        .await
        .unwrap();

    let outcome = Reconciler::new(&store).sync_annotations(doc).await.unwrap();
    assert_eq!(outcome.purged, 0);
    assert_eq!(outcome.materialized, 0);
}

#[tokio::test]
async fn seed_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path: PathBuf = dir.path().join("doc.json");
    std::fs::write(
        &path,
        r#"{
            "name": "interview-1",
            "language": "en",
            "sections": [
                {"conversation": "c1", "attribute": "q1", "text": "The team was slow."}
            ],
            "labels": [
                {"name": "speed", "code_rule": "slow*"}
            ]
        }"#,
    )
    .unwrap();

    let seed_doc = seed::load_seed(&path).unwrap();
    assert_eq!(seed_doc.name, "interview-1");
    assert_eq!(seed_doc.sections.len(), 1);
    assert_eq!(seed_doc.labels[0].color, "#888888");
    assert_eq!(seed_doc.labels[0].code_rule.as_deref(), Some("slow*"));
}
